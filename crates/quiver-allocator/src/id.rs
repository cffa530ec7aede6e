//! Monotonic cluster-wide integer identifiers.

use quiver_common::metrics::Metrics;
use quiver_common::types::UniqueId;
use quiver_common::{Error, Result};
use quiver_kv::MetaKv;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// CAS attempts per lease before the backend is declared unavailable.
const LEASE_CAS_BUDGET: u32 = 32;

struct IdRange {
    /// Next value to hand out.
    base: UniqueId,
    /// One past the last leased value; equals the persisted high-water.
    end: UniqueId,
}

/// Batch-leased identifier allocator.
///
/// Serves `[base, end)` from memory; `end` always equals the persisted
/// high-water mark, so every value issued is strictly below what the meta
/// store has durably recorded.
pub struct GlobalIdAllocator {
    kv: Arc<dyn MetaKv>,
    key: String,
    batch: u64,
    inner: Mutex<IdRange>,
}

impl GlobalIdAllocator {
    pub fn new(kv: Arc<dyn MetaKv>, name: &str, batch: u64) -> Self {
        Self {
            kv,
            key: format!("/allocators/{name}/high"),
            batch,
            inner: Mutex::new(IdRange { base: 0, end: 0 }),
        }
    }

    /// Load the persisted high-water; the first `alloc` leases from there.
    pub async fn init(&self) -> Result<()> {
        let high = match self.kv.load(&self.key).await? {
            Some(v) => v
                .parse::<i64>()
                .map_err(|_| Error::Unexpected(format!("corrupt high-water at {}", self.key)))?,
            None => 0,
        };
        let mut range = self.inner.lock().await;
        range.base = high;
        range.end = high;
        Ok(())
    }

    /// Allocate `count` consecutive identifiers, returning `[first, first+count)`.
    pub async fn alloc(&self, count: u32) -> Result<(UniqueId, UniqueId)> {
        if count == 0 {
            return Err(Error::InvalidInput("allocation count must be positive".into()));
        }
        let mut range = self.inner.lock().await;
        while (range.end - range.base) < count as i64 {
            range.end = self.lease(range.end).await?;
        }
        let first = range.base;
        range.base += count as i64;
        Ok((first, first + count as i64))
    }

    pub async fn alloc_one(&self) -> Result<UniqueId> {
        let (first, _) = self.alloc(1).await?;
        Ok(first)
    }

    /// Periodic top-off: keep at least half a batch in reserve so callers
    /// rarely wait on the meta store.
    pub async fn update(&self) -> Result<()> {
        let mut range = self.inner.lock().await;
        if (range.end - range.base) < (self.batch / 2) as i64 {
            range.end = self.lease(range.end).await?;
        }
        Ok(())
    }

    /// Advance the persisted high-water by one batch starting at `current`,
    /// returning the new high. CAS-raced against other allocator instances
    /// sharing the key.
    async fn lease(&self, current: UniqueId) -> Result<UniqueId> {
        let mut expected = current;
        for _ in 0..LEASE_CAS_BUDGET {
            let next = expected + self.batch as i64;
            let expected_str = if expected == 0 && self.kv.load(&self.key).await?.is_none() {
                None
            } else {
                Some(expected.to_string())
            };
            let swapped = self
                .kv
                .compare_and_swap(&self.key, expected_str.as_deref(), &next.to_string())
                .await?;
            if swapped {
                Metrics::get().allocator_leases_total.with_label_values(&["id"]).inc();
                debug!(key = %self.key, high = next, "leased id batch");
                return Ok(next);
            }
            // Someone else advanced the mark; restart from their value.
            expected = match self.kv.load(&self.key).await? {
                Some(v) => v
                    .parse::<i64>()
                    .map_err(|_| Error::Unexpected(format!("corrupt high-water at {}", self.key)))?,
                None => 0,
            };
        }
        Err(Error::Unavailable(format!("id lease CAS exhausted for {}", self.key)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quiver_kv::MemoryMetaKv;

    #[tokio::test]
    async fn values_are_strictly_monotonic() {
        let kv = MemoryMetaKv::new();
        let alloc = GlobalIdAllocator::new(kv, "gid", 16);
        alloc.init().await.unwrap();

        let mut last = -1;
        for _ in 0..100 {
            let id = alloc.alloc_one().await.unwrap();
            assert!(id > last);
            last = id;
        }
    }

    #[tokio::test]
    async fn issued_values_stay_below_persisted_high() {
        let kv = MemoryMetaKv::new();
        let alloc = GlobalIdAllocator::new(kv.clone(), "gid", 10);
        alloc.init().await.unwrap();

        for _ in 0..35 {
            let id = alloc.alloc_one().await.unwrap();
            let high: i64 = kv.load("/allocators/gid/high").await.unwrap().unwrap().parse().unwrap();
            assert!(id < high);
        }
    }

    #[tokio::test]
    async fn restart_never_reissues() {
        // Two leases of 500, then a restart: the fresh instance must start
        // at or above 1000.
        let kv = MemoryMetaKv::new();
        let alloc = GlobalIdAllocator::new(kv.clone(), "gid", 500);
        alloc.init().await.unwrap();
        let (first, end) = alloc.alloc(1000).await.unwrap();
        assert_eq!(first, 0);
        assert_eq!(end, 1000);

        let persisted: i64 =
            kv.load("/allocators/gid/high").await.unwrap().unwrap().parse().unwrap();
        assert!(persisted >= 1000);

        let restarted = GlobalIdAllocator::new(kv, "gid", 500);
        restarted.init().await.unwrap();
        let id = restarted.alloc_one().await.unwrap();
        assert!(id >= 1000);
    }

    #[tokio::test]
    async fn concurrent_instances_never_overlap() {
        let kv = MemoryMetaKv::new();
        let a = Arc::new(GlobalIdAllocator::new(kv.clone(), "gid", 8));
        let b = Arc::new(GlobalIdAllocator::new(kv, "gid", 8));
        a.init().await.unwrap();
        b.init().await.unwrap();

        let mut ids = Vec::new();
        for _ in 0..50 {
            ids.push(a.alloc_one().await.unwrap());
            ids.push(b.alloc_one().await.unwrap());
        }
        let before = ids.len();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), before, "duplicate id issued across instances");
    }

    #[tokio::test]
    async fn large_request_spans_batches() {
        let kv = MemoryMetaKv::new();
        let alloc = GlobalIdAllocator::new(kv, "gid", 4);
        alloc.init().await.unwrap();
        let (first, end) = alloc.alloc(11).await.unwrap();
        assert_eq!(end - first, 11);
    }

    #[tokio::test]
    async fn update_tops_off_reserve() {
        let kv = MemoryMetaKv::new();
        let alloc = GlobalIdAllocator::new(kv.clone(), "gid", 10);
        alloc.init().await.unwrap();
        alloc.alloc(8).await.unwrap();
        alloc.update().await.unwrap();
        let range = alloc.inner.lock().await;
        assert!(range.end - range.base >= 5);
    }
}
