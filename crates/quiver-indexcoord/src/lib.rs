//! Index coordinator.
//!
//! Keeps a durable queue of index-build tasks, assigns them to index workers
//! through a load-based priority queue, watches the meta store for worker
//! progress, re-queues work lost to dead workers, and recycles superseded
//! index-file versions.

pub mod coord;
pub mod meta_table;
pub mod node_tasks;
pub mod priority_queue;

pub use coord::{CreateIndexRequest, IndexCoord, IndexCoordDeps, IndexNodeClient};
pub use meta_table::{BuildIndexRequest, IndexMeta, IndexState, MetaTable};
pub use node_tasks::NodeTasks;
pub use priority_queue::{PriorityItem, PriorityQueue};
