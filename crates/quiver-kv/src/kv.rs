//! The replicated meta-store abstraction.

use async_trait::async_trait;
use quiver_common::Result;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;

/// Handle to a time-bounded lease. Keys saved under a lease are deleted when
/// the lease expires or is revoked, publishing a delete event to watchers.
pub type LeaseId = u64;

/// Kind of change observed by a watcher.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum KvEventType {
    Put,
    Delete,
}

/// A single change observed under a watched prefix.
///
/// Delete events carry the last value the key held, so watchers can resolve
/// what disappeared without keeping their own shadow copy.
#[derive(Debug, Clone)]
pub struct KvEvent {
    pub event_type: KvEventType,
    pub key: String,
    pub value: String,
    pub revision: i64,
}

/// Transactional, revisioned, watchable key-value store.
///
/// Multi-key writes are atomic: watchers observe either all keys of a
/// transaction or none, and all share one revision.
#[async_trait]
pub trait MetaKv: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<String>>;

    /// All pairs under `prefix`, sorted by key, plus the store revision the
    /// snapshot was taken at. Watches resume from `revision + 1`.
    async fn load_with_prefix(&self, prefix: &str) -> Result<(Vec<(String, String)>, i64)>;

    async fn save(&self, key: &str, value: &str) -> Result<i64>;

    /// Atomic multi-key write.
    async fn multi_save(&self, kvs: HashMap<String, String>) -> Result<i64>;

    /// Atomic multi-key write plus removals.
    async fn multi_save_and_remove(
        &self,
        saves: HashMap<String, String>,
        removals: Vec<String>,
    ) -> Result<i64>;

    async fn remove(&self, key: &str) -> Result<i64>;

    async fn remove_with_prefix(&self, prefix: &str) -> Result<i64>;

    /// Write `value` only if the key currently holds `expected` (`None` for
    /// absent). Returns whether the swap happened.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
    ) -> Result<bool>;

    /// Atomically add `by` to the integer at `key` (absent counts as zero)
    /// and return the new value.
    async fn incr(&self, key: &str, by: i64) -> Result<i64>;

    async fn grant_lease(&self, ttl: Duration) -> Result<LeaseId>;

    /// Reset the lease deadline. Fails with `LostPeer` once the lease has
    /// already expired or been revoked.
    async fn keep_alive(&self, lease: LeaseId) -> Result<()>;

    async fn revoke_lease(&self, lease: LeaseId) -> Result<()>;

    /// Save a key bound to `lease`; the key is deleted when the lease goes.
    async fn save_with_lease(&self, key: &str, value: &str, lease: LeaseId) -> Result<i64>;

    /// Save a lease-bound key only if it does not exist yet. Returns whether
    /// the write happened.
    async fn save_with_lease_if_absent(
        &self,
        key: &str,
        value: &str,
        lease: LeaseId,
    ) -> Result<bool>;

    /// Ordered stream of events under `prefix` with revision ≥
    /// `from_revision`. Events already in the store's history are replayed
    /// first, then live changes follow; each state change is delivered once.
    fn watch(&self, prefix: &str, from_revision: i64) -> mpsc::UnboundedReceiver<KvEvent>;
}
