//! Per-worker sets of in-flight build ids.

use quiver_common::types::UniqueId;
use std::collections::{HashMap, HashSet};

/// Tracks which builds are currently assigned to which worker.
#[derive(Debug, Default)]
pub struct NodeTasks {
    tasks: HashMap<UniqueId, HashSet<UniqueId>>,
}

impl NodeTasks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assign(&mut self, node_id: UniqueId, build_id: UniqueId) {
        self.tasks.entry(node_id).or_default().insert(build_id);
    }

    pub fn unassign(&mut self, node_id: UniqueId, build_id: UniqueId) {
        if let Some(set) = self.tasks.get_mut(&node_id) {
            set.remove(&build_id);
        }
    }

    /// Drop a finished build from whichever node held it; returns that node.
    pub fn finish(&mut self, build_id: UniqueId) -> Option<UniqueId> {
        for (node_id, set) in self.tasks.iter_mut() {
            if set.remove(&build_id) {
                return Some(*node_id);
            }
        }
        None
    }

    /// Remove a dead worker, returning its orphaned builds for reassignment.
    pub fn remove_node(&mut self, node_id: UniqueId) -> Vec<UniqueId> {
        self.tasks.remove(&node_id).map(|set| set.into_iter().collect()).unwrap_or_default()
    }

    pub fn tasks_of(&self, node_id: UniqueId) -> Vec<UniqueId> {
        self.tasks.get(&node_id).map(|set| set.iter().copied().collect()).unwrap_or_default()
    }
}
