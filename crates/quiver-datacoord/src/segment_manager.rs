//! Growing-segment allocation on ingest channels.

use crate::meta::{SegmentInfo, SegmentMeta, SegmentState};
use quiver_allocator::GlobalIdAllocator;
use quiver_common::config::DataCoordConfig;
use quiver_common::tsoutil::add_ms;
use quiver_common::types::{Timestamp, UniqueId};
use quiver_common::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// One slice of rows granted on a segment.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentAllocation {
    pub segment_id: UniqueId,
    pub count: i64,
    pub expire_ts: Timestamp,
}

#[derive(Debug, Clone)]
struct Allocation {
    count: i64,
    expire_ts: Timestamp,
}

/// Allocates row slices onto growing segments, creating and sealing
/// segments as capacity demands. One call may span multiple segments; the
/// returned counts sum to the request.
pub struct SegmentManager {
    meta: Arc<SegmentMeta>,
    id_alloc: Arc<GlobalIdAllocator>,
    config: DataCoordConfig,
    /// Outstanding (unexpired) allocations per segment.
    allocations: Mutex<HashMap<UniqueId, Vec<Allocation>>>,
}

impl SegmentManager {
    pub fn new(
        meta: Arc<SegmentMeta>,
        id_alloc: Arc<GlobalIdAllocator>,
        config: DataCoordConfig,
    ) -> Self {
        Self { meta, id_alloc, config, allocations: Mutex::new(HashMap::new()) }
    }

    /// Grant `count` rows on `channel` for messages stamped `ts`.
    pub async fn assign_segment_id(
        &self,
        collection_id: UniqueId,
        partition_id: UniqueId,
        channel: &str,
        count: i64,
        ts: Timestamp,
    ) -> Result<Vec<SegmentAllocation>> {
        if count <= 0 {
            return Err(Error::InvalidInput("row count must be positive".into()));
        }
        let mut allocations = self.allocations.lock().await;
        let expire_ts = add_ms(ts, self.config.segment_alloc_expiration_ms);
        let mut granted = Vec::new();
        let mut remaining = count;

        // Fill existing growing segments first, in allocation order.
        for info in self.meta.segments_of_channel(channel) {
            if remaining == 0 {
                break;
            }
            if info.state != SegmentState::Growing
                || info.collection_id != collection_id
                || info.partition_id != partition_id
            {
                continue;
            }
            // Only segments still inside their freshness window take new
            // rows for this timestamp.
            if info.last_expire_ts < ts && info.last_expire_ts != 0 {
                continue;
            }
            let outstanding: i64 = allocations
                .get(&info.id)
                .map(|list| list.iter().map(|a| a.count).sum())
                .unwrap_or(0);
            let room = info.max_rows - info.num_rows - outstanding;
            if room <= 0 {
                continue;
            }
            let take = remaining.min(room);
            allocations
                .entry(info.id)
                .or_default()
                .push(Allocation { count: take, expire_ts });
            self.meta.set_last_expire(info.id, expire_ts).await?;
            granted.push(SegmentAllocation { segment_id: info.id, count: take, expire_ts });
            remaining -= take;
        }

        // Open fresh segments for the rest.
        while remaining > 0 {
            self.make_room(channel, &allocations).await?;
            let segment_id = self.id_alloc.alloc_one().await?;
            let mut info = SegmentInfo::new(
                segment_id,
                collection_id,
                partition_id,
                channel,
                self.config.max_rows_per_segment,
            );
            info.last_expire_ts = expire_ts;
            self.meta.add_segment(info).await?;
            debug!(segment_id, channel, "opened growing segment");

            let take = remaining.min(self.config.max_rows_per_segment);
            allocations
                .entry(segment_id)
                .or_default()
                .push(Allocation { count: take, expire_ts });
            granted.push(SegmentAllocation { segment_id, count: take, expire_ts });
            remaining -= take;
        }

        Ok(granted)
    }

    /// Keep the growing-segment population on a channel within bounds by
    /// sealing the fullest segment when a new one is about to open.
    async fn make_room(
        &self,
        channel: &str,
        allocations: &HashMap<UniqueId, Vec<Allocation>>,
    ) -> Result<()> {
        let growing: Vec<SegmentInfo> = self
            .meta
            .segments_of_channel(channel)
            .into_iter()
            .filter(|s| s.state == SegmentState::Growing)
            .collect();
        if growing.len() < self.config.max_growing_per_channel {
            return Ok(());
        }
        let fullest = growing
            .iter()
            .max_by_key(|s| {
                s.num_rows
                    + allocations
                        .get(&s.id)
                        .map(|list| list.iter().map(|a| a.count).sum::<i64>())
                        .unwrap_or(0)
            })
            .expect("growing set non-empty");
        warn!(segment_id = fullest.id, channel, "sealing segment to bound growing set");
        self.meta.set_state(fullest.id, SegmentState::Sealed).await
    }

    /// Drop allocations whose freshness window closed at `ts`, and seal
    /// growing segments that have no room left.
    pub async fn expire_allocations(&self, channel: &str, ts: Timestamp) -> Result<()> {
        let mut allocations = self.allocations.lock().await;
        for info in self.meta.segments_of_channel(channel) {
            if let Some(list) = allocations.get_mut(&info.id) {
                list.retain(|a| a.expire_ts > ts);
                if list.is_empty() {
                    allocations.remove(&info.id);
                }
            }
            if info.state == SegmentState::Growing && info.num_rows >= info.max_rows {
                self.meta.set_state(info.id, SegmentState::Sealed).await?;
            }
        }
        Ok(())
    }

    /// Seal every growing segment of a collection (explicit flush).
    pub async fn seal_all(&self, collection_id: UniqueId) -> Result<Vec<UniqueId>> {
        let mut sealed = Vec::new();
        for info in self.meta.segments_of_collection(collection_id) {
            if info.state == SegmentState::Growing {
                self.meta.set_state(info.id, SegmentState::Sealed).await?;
                sealed.push(info.id);
            }
        }
        Ok(sealed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quiver_kv::MemoryMetaKv;

    async fn manager(max_rows: i64, max_growing: usize) -> (Arc<SegmentMeta>, SegmentManager) {
        let kv = MemoryMetaKv::new();
        let meta = Arc::new(SegmentMeta::new(kv.clone()).await.unwrap());
        let id_alloc = Arc::new(GlobalIdAllocator::new(kv, "gid", 100));
        id_alloc.init().await.unwrap();
        let config = DataCoordConfig {
            max_rows_per_segment: max_rows,
            max_growing_per_channel: max_growing,
            ..Default::default()
        };
        (meta.clone(), SegmentManager::new(meta, id_alloc, config))
    }

    #[tokio::test]
    async fn grants_sum_to_request() {
        let (_meta, manager) = manager(1000, 4).await;
        let grants = manager.assign_segment_id(1, 2, "c0", 100, 1 << 18).await.unwrap();
        assert_eq!(grants.iter().map(|g| g.count).sum::<i64>(), 100);
        assert_eq!(grants.len(), 1);
    }

    #[tokio::test]
    async fn reuses_growing_segment_within_window() {
        let (_meta, manager) = manager(1000, 4).await;
        let a = manager.assign_segment_id(1, 2, "c0", 100, 1 << 18).await.unwrap();
        let b = manager.assign_segment_id(1, 2, "c0", 200, 2 << 18).await.unwrap();
        assert_eq!(a[0].segment_id, b[0].segment_id);
    }

    #[tokio::test]
    async fn spans_segments_when_request_exceeds_capacity() {
        let (_meta, manager) = manager(100, 4).await;
        let grants = manager.assign_segment_id(1, 2, "c0", 250, 1 << 18).await.unwrap();
        assert_eq!(grants.iter().map(|g| g.count).sum::<i64>(), 250);
        assert_eq!(grants.len(), 3);
        let ids: std::collections::HashSet<_> = grants.iter().map(|g| g.segment_id).collect();
        assert_eq!(ids.len(), 3);
    }

    #[tokio::test]
    async fn growing_population_stays_bounded() {
        let (meta, manager) = manager(10, 2).await;
        for i in 0..8 {
            manager.assign_segment_id(1, 2, "c0", 10, (i + 1) << 18).await.unwrap();
        }
        let growing = meta
            .segments_of_channel("c0")
            .into_iter()
            .filter(|s| s.state == SegmentState::Growing)
            .count();
        assert!(growing <= 2, "growing population {growing} exceeds bound");
    }

    #[tokio::test]
    async fn expire_seals_full_segments() {
        let (meta, manager) = manager(50, 4).await;
        let grants = manager.assign_segment_id(1, 2, "c0", 50, 1 << 18).await.unwrap();
        let segment_id = grants[0].segment_id;

        // The data node reports the rows as applied.
        let cp = crate::meta::SegmentCheckpoint {
            segment_id,
            position: quiver_common::types::MsgPosition {
                channel: "c0".into(),
                msg_id: 1,
                timestamp: 2 << 18,
            },
            num_rows: 50,
        };
        meta.save_binlogs_and_checkpoints(segment_id, false, &[], &[cp], &[]).await.unwrap();

        manager.expire_allocations("c0", u64::MAX).await.unwrap();
        assert_eq!(meta.get(segment_id).unwrap().state, SegmentState::Sealed);
    }

    #[tokio::test]
    async fn seal_all_targets_one_collection() {
        let (meta, manager) = manager(1000, 4).await;
        manager.assign_segment_id(1, 2, "c0", 10, 1 << 18).await.unwrap();
        manager.assign_segment_id(7, 8, "c1", 10, 1 << 18).await.unwrap();

        let sealed = manager.seal_all(1).await.unwrap();
        assert_eq!(sealed.len(), 1);
        assert_eq!(meta.get(sealed[0]).unwrap().state, SegmentState::Sealed);
        let other = meta.segments_of_collection(7);
        assert_eq!(other[0].state, SegmentState::Growing);
    }

    #[tokio::test]
    async fn rejects_nonpositive_count() {
        let (_meta, manager) = manager(1000, 4).await;
        assert!(manager.assign_segment_id(1, 2, "c0", 0, 1).await.is_err());
    }
}
