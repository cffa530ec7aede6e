//! Durable build-task metadata.
//!
//! One row per build id under `/meta/indexes/<build-id>`, written by both
//! the coordinator (state machine, versions) and the worker (progress,
//! file paths). Writes CAS against the last observed raw value, so
//! coordinator and worker never clobber each other.

use parking_lot::RwLock;
use quiver_common::types::{Timestamp, UniqueId};
use quiver_common::{Error, Result};
use quiver_kv::MetaKv;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::warn;

pub const INDEX_META_PREFIX: &str = "/meta/indexes/";

const CAS_BUDGET: u32 = 16;

/// Build-task request; the fingerprint fields drive idempotency.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildIndexRequest {
    pub index_id: UniqueId,
    pub index_name: String,
    pub data_paths: Vec<String>,
    #[serde(default)]
    pub type_params: HashMap<String, String>,
    #[serde(default)]
    pub index_params: HashMap<String, String>,
    /// When set, fingerprint equality treats `data_paths` as a set.
    #[serde(default)]
    pub unordered_paths: bool,
}

impl BuildIndexRequest {
    /// Fingerprint equality over {paths, type-params, index-params,
    /// index-id, index-name}. Path order is ignored only when both requests
    /// mark their paths unordered.
    pub fn same_fingerprint(&self, other: &Self) -> bool {
        if self.index_id != other.index_id
            || self.index_name != other.index_name
            || self.type_params != other.type_params
            || self.index_params != other.index_params
        {
            return false;
        }
        if self.unordered_paths && other.unordered_paths {
            let mut a = self.data_paths.clone();
            let mut b = other.data_paths.clone();
            a.sort_unstable();
            b.sort_unstable();
            a == b
        } else {
            self.data_paths == other.data_paths
        }
    }
}

/// Build-task state machine. Terminal states are never left except through
/// an explicit drop marking the row deleted.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub enum IndexState {
    None,
    Unissued,
    InProgress,
    Finished,
    Failed,
}

/// One durable build-task row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMeta {
    pub build_id: UniqueId,
    pub state: IndexState,
    #[serde(default)]
    pub fail_reason: String,
    pub req: BuildIndexRequest,
    #[serde(default)]
    pub index_file_paths: Vec<String>,
    #[serde(default)]
    pub node_id: Option<UniqueId>,
    /// Bumped on every (re)assignment; versions below the current one are
    /// garbage once the build finishes.
    #[serde(default)]
    pub version: i64,
    #[serde(default)]
    pub mark_deleted: bool,
    #[serde(default)]
    pub recycled: bool,
    pub created_ts: Timestamp,
}

fn meta_key(build_id: UniqueId) -> String {
    format!("{INDEX_META_PREFIX}{build_id}")
}

struct Stored {
    meta: IndexMeta,
    /// Raw value as last read from or written to the store; the CAS anchor.
    raw: String,
}

/// In-memory mirror of the build-task rows.
pub struct MetaTable {
    kv: Arc<dyn MetaKv>,
    state: RwLock<HashMap<UniqueId, Stored>>,
}

impl MetaTable {
    pub async fn new(kv: Arc<dyn MetaKv>) -> Result<(Self, i64)> {
        let (pairs, revision) = kv.load_with_prefix(INDEX_META_PREFIX).await?;
        let mut state = HashMap::new();
        for (key, raw) in pairs {
            match serde_json::from_str::<IndexMeta>(&raw) {
                Ok(meta) => {
                    state.insert(meta.build_id, Stored { meta, raw });
                }
                Err(e) => warn!(key = %key, error = %e, "skipping undecodable index meta"),
            }
        }
        Ok((Self { kv, state: RwLock::new(state) }, revision))
    }

    /// Idempotency probe: an existing non-deleted row with the same
    /// fingerprint wins.
    pub fn has_same_req(&self, req: &BuildIndexRequest) -> Option<UniqueId> {
        self.state
            .read()
            .values()
            .find(|s| !s.meta.mark_deleted && s.meta.req.same_fingerprint(req))
            .map(|s| s.meta.build_id)
    }

    /// Create the row for a fresh build id.
    pub async fn add(&self, build_id: UniqueId, req: BuildIndexRequest, ts: Timestamp) -> Result<()> {
        let meta = IndexMeta {
            build_id,
            state: IndexState::None,
            fail_reason: String::new(),
            req,
            index_file_paths: Vec::new(),
            node_id: None,
            version: 0,
            mark_deleted: false,
            recycled: false,
            created_ts: ts,
        };
        self.write(meta).await
    }

    pub fn get(&self, build_id: UniqueId) -> Option<IndexMeta> {
        self.state.read().get(&build_id).map(|s| s.meta.clone())
    }

    pub fn get_states(&self, build_ids: &[UniqueId]) -> Vec<(UniqueId, IndexState, String)> {
        let state = self.state.read();
        build_ids
            .iter()
            .map(|id| match state.get(id) {
                Some(s) => (*id, s.meta.state, s.meta.fail_reason.clone()),
                None => (*id, IndexState::None, String::new()),
            })
            .collect()
    }

    pub fn get_index_file_paths(&self, build_id: UniqueId) -> Result<Vec<String>> {
        let state = self.state.read();
        let stored =
            state.get(&build_id).ok_or_else(|| Error::NotFound(format!("build {build_id}")))?;
        Ok(stored.meta.index_file_paths.clone())
    }

    /// Bump the assignment version; CAS-retried against concurrent worker
    /// writes.
    pub async fn update_version(&self, build_id: UniqueId) -> Result<i64> {
        self.mutate(build_id, |meta| {
            meta.version += 1;
            meta.recycled = false;
            // Finished is terminal; only non-terminal tasks return to the
            // assignable state.
            if meta.state != IndexState::Finished {
                meta.state = IndexState::Unissued;
            }
            true
        })
        .await
        .map(|meta| meta.version)
    }

    /// Record a successful dispatch: the task is now in progress on `node`.
    pub async fn assign(&self, build_id: UniqueId, node_id: UniqueId) -> Result<()> {
        self.mutate(build_id, |meta| {
            meta.state = IndexState::InProgress;
            meta.node_id = Some(node_id);
            true
        })
        .await
        .map(|_| ())
    }

    /// Mark every row of `index_id` deleted. Idempotent.
    pub async fn mark_as_deleted(&self, index_id: UniqueId) -> Result<Vec<UniqueId>> {
        let builds: Vec<UniqueId> = self
            .state
            .read()
            .values()
            .filter(|s| s.meta.req.index_id == index_id && !s.meta.mark_deleted)
            .map(|s| s.meta.build_id)
            .collect();
        for build_id in &builds {
            self.mutate(*build_id, |meta| {
                if meta.mark_deleted {
                    return false;
                }
                meta.mark_deleted = true;
                true
            })
            .await?;
        }
        Ok(builds)
    }

    pub async fn set_recycled(&self, build_id: UniqueId) -> Result<()> {
        self.mutate(build_id, |meta| {
            if meta.recycled {
                return false;
            }
            meta.recycled = true;
            true
        })
        .await
        .map(|_| ())
    }

    pub async fn delete(&self, build_id: UniqueId) -> Result<()> {
        self.kv.remove(&meta_key(build_id)).await?;
        self.state.write().remove(&build_id);
        Ok(())
    }

    /// Rows the recycler should visit: explicitly deleted, or finished
    /// rebuilds with superseded versions.
    pub fn get_unused(&self, limit: usize) -> Vec<IndexMeta> {
        self.state
            .read()
            .values()
            .filter(|s| {
                s.meta.mark_deleted
                    || (s.meta.state == IndexState::Finished
                        && s.meta.version >= 2
                        && !s.meta.recycled)
            })
            .take(limit)
            .map(|s| s.meta.clone())
            .collect()
    }

    /// Builds that still need a worker: not finished, not deleted, and not
    /// assigned to any live node.
    pub fn get_unassigned(&self, live_nodes: &[UniqueId]) -> Vec<UniqueId> {
        self.state
            .read()
            .values()
            .filter(|s| {
                !s.meta.mark_deleted
                    && s.meta.state != IndexState::Finished
                    && match s.meta.node_id {
                        Some(node) => {
                            s.meta.state != IndexState::InProgress
                                || !live_nodes.contains(&node)
                        }
                        None => true,
                    }
            })
            .map(|s| s.meta.build_id)
            .collect()
    }

    /// Apply a row observed through the meta watch. Returns the decoded meta
    /// when it superseded what memory held.
    pub fn apply_watched(&self, raw: &str) -> Option<IndexMeta> {
        let meta: IndexMeta = match serde_json::from_str(raw) {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "discarding undecodable index meta event");
                return None;
            }
        };
        let mut state = self.state.write();
        if let Some(existing) = state.get(&meta.build_id) {
            if existing.raw == raw {
                return None; // our own write echoed back
            }
        }
        state.insert(meta.build_id, Stored { meta: meta.clone(), raw: raw.to_string() });
        Some(meta)
    }

    /// Forget a row that disappeared from the store.
    pub fn apply_removed(&self, build_id: UniqueId) {
        self.state.write().remove(&build_id);
    }

    async fn write(&self, meta: IndexMeta) -> Result<()> {
        let raw = serde_json::to_string(&meta)?;
        self.kv.save(&meta_key(meta.build_id), &raw).await?;
        self.state.write().insert(meta.build_id, Stored { meta, raw });
        Ok(())
    }

    /// CAS mutation loop. `f` returns false to abort as a no-op.
    async fn mutate<F>(&self, build_id: UniqueId, f: F) -> Result<IndexMeta>
    where
        F: Fn(&mut IndexMeta) -> bool,
    {
        for _ in 0..CAS_BUDGET {
            let (mut meta, old_raw) = {
                let state = self.state.read();
                let stored = state
                    .get(&build_id)
                    .ok_or_else(|| Error::NotFound(format!("build {build_id}")))?;
                (stored.meta.clone(), stored.raw.clone())
            };
            if !f(&mut meta) {
                return Ok(meta);
            }
            let new_raw = serde_json::to_string(&meta)?;
            if self
                .kv
                .compare_and_swap(&meta_key(build_id), Some(&old_raw), &new_raw)
                .await?
            {
                self.state
                    .write()
                    .insert(build_id, Stored { meta: meta.clone(), raw: new_raw });
                return Ok(meta);
            }
            // Lost the race; refresh from the store and retry.
            match self.kv.load(&meta_key(build_id)).await? {
                Some(raw) => {
                    self.apply_watched(&raw);
                }
                None => return Err(Error::NotFound(format!("build {build_id}"))),
            }
        }
        Err(Error::Unexpected(format!("index meta CAS exhausted for build {build_id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quiver_kv::MemoryMetaKv;

    fn req(paths: &[&str], unordered: bool) -> BuildIndexRequest {
        BuildIndexRequest {
            index_id: 5,
            index_name: "emb_idx".into(),
            data_paths: paths.iter().map(|s| s.to_string()).collect(),
            type_params: HashMap::from([("dim".to_string(), "8".to_string())]),
            index_params: HashMap::new(),
            unordered_paths: unordered,
        }
    }

    #[tokio::test]
    async fn fingerprint_respects_path_ordering_flag() {
        let ordered_a = req(&["a", "b"], false);
        let ordered_b = req(&["b", "a"], false);
        assert!(!ordered_a.same_fingerprint(&ordered_b));

        let set_a = req(&["a", "b"], true);
        let set_b = req(&["b", "a"], true);
        assert!(set_a.same_fingerprint(&set_b));
    }

    #[tokio::test]
    async fn has_same_req_ignores_deleted_rows() {
        let kv = MemoryMetaKv::new();
        let (table, _) = MetaTable::new(kv).await.unwrap();
        table.add(100, req(&["a"], false), 1).await.unwrap();
        assert_eq!(table.has_same_req(&req(&["a"], false)), Some(100));

        table.mark_as_deleted(5).await.unwrap();
        assert_eq!(table.has_same_req(&req(&["a"], false)), None);
    }

    #[tokio::test]
    async fn version_bumps_and_recycle_flags() {
        let kv = MemoryMetaKv::new();
        let (table, _) = MetaTable::new(kv).await.unwrap();
        table.add(100, req(&["a"], false), 1).await.unwrap();

        assert_eq!(table.update_version(100).await.unwrap(), 1);
        assert_eq!(table.update_version(100).await.unwrap(), 2);

        // Not finished yet: the recycler leaves it alone.
        assert!(table.get_unused(10).is_empty());

        // Worker reports success at version 2.
        let mut meta = table.get(100).unwrap();
        meta.state = IndexState::Finished;
        table.write(meta).await.unwrap();
        assert_eq!(table.get_unused(10).len(), 1);

        table.set_recycled(100).await.unwrap();
        assert!(table.get_unused(10).is_empty());

        // A reassignment clears the recycled latch.
        table.update_version(100).await.unwrap();
        assert!(!table.get(100).unwrap().recycled);
    }

    #[tokio::test]
    async fn cas_recovers_from_concurrent_worker_write() {
        let kv = MemoryMetaKv::new();
        let (table, _) = MetaTable::new(kv.clone()).await.unwrap();
        table.add(100, req(&["a"], false), 1).await.unwrap();

        // A worker writes behind the table's back.
        let mut meta = table.get(100).unwrap();
        meta.state = IndexState::Finished;
        meta.index_file_paths = vec!["index_files/100/1/part".into()];
        kv.save("/meta/indexes/100", &serde_json::to_string(&meta).unwrap()).await.unwrap();

        // The mutation still lands, on top of the worker's row.
        table.update_version(100).await.unwrap();
        let after = table.get(100).unwrap();
        assert_eq!(after.version, 1);
        assert_eq!(after.index_file_paths, vec!["index_files/100/1/part".to_string()]);
    }

    #[tokio::test]
    async fn unassigned_excludes_in_progress_on_live_nodes() {
        let kv = MemoryMetaKv::new();
        let (table, _) = MetaTable::new(kv).await.unwrap();
        table.add(100, req(&["a"], false), 1).await.unwrap();
        table.add(101, req(&["b"], false), 1).await.unwrap();
        table.assign(100, 7).await.unwrap();

        // Node 7 alive: build 100 is being worked on.
        let mut unassigned = table.get_unassigned(&[7]);
        unassigned.sort_unstable();
        assert_eq!(unassigned, vec![101]);

        // Node 7 gone: both need assignment.
        let mut unassigned = table.get_unassigned(&[]);
        unassigned.sort_unstable();
        assert_eq!(unassigned, vec![100, 101]);
    }
}
