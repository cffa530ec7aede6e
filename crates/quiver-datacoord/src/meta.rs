//! Segment metadata table.

use parking_lot::RwLock;
use quiver_common::metrics::Metrics;
use quiver_common::types::{FieldId, MsgPosition, Timestamp, UniqueId};
use quiver_common::{Error, Result};
use quiver_kv::MetaKv;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

pub const SEGMENT_PREFIX: &str = "/meta/segments/";

/// Segment lifecycle states, ordered; a segment's state never moves
/// backward.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub enum SegmentState {
    Growing,
    Sealed,
    Flushing,
    Flushed,
    Dropped,
}

impl SegmentState {
    fn rank(&self) -> u8 {
        match self {
            SegmentState::Growing => 0,
            SegmentState::Sealed => 1,
            SegmentState::Flushing => 2,
            SegmentState::Flushed => 3,
            SegmentState::Dropped => 4,
        }
    }

    pub fn can_transition_to(&self, next: SegmentState) -> bool {
        next.rank() >= self.rank()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentInfo {
    pub id: UniqueId,
    pub collection_id: UniqueId,
    pub partition_id: UniqueId,
    pub insert_channel: String,
    pub num_rows: i64,
    pub max_rows: i64,
    pub state: SegmentState,
    /// Upper bound of the freshness window during which new rows may still
    /// be routed to this segment.
    pub last_expire_ts: Timestamp,
    /// Earliest stream position; once set, immutable.
    pub start_position: Option<MsgPosition>,
    /// Last applied stream position; only advances.
    pub dml_position: Option<MsgPosition>,
    /// Per-field binlog paths accumulated by flushes.
    #[serde(default)]
    pub binlogs: HashMap<FieldId, Vec<String>>,
}

impl SegmentInfo {
    pub fn new(
        id: UniqueId,
        collection_id: UniqueId,
        partition_id: UniqueId,
        insert_channel: &str,
        max_rows: i64,
    ) -> Self {
        Self {
            id,
            collection_id,
            partition_id,
            insert_channel: insert_channel.to_string(),
            num_rows: 0,
            max_rows,
            state: SegmentState::Growing,
            last_expire_ts: 0,
            start_position: None,
            dml_position: None,
            binlogs: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldBinlogPaths {
    pub field_id: FieldId,
    pub paths: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentCheckpoint {
    pub segment_id: UniqueId,
    pub position: MsgPosition,
    pub num_rows: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentStartPosition {
    pub segment_id: UniqueId,
    pub position: MsgPosition,
}

fn segment_key(info: &SegmentInfo) -> String {
    format!("{SEGMENT_PREFIX}{}/{}/{}", info.collection_id, info.partition_id, info.id)
}

/// In-memory segment table persisted through the meta store. The map lock is
/// coarse and never held across store I/O.
pub struct SegmentMeta {
    kv: Arc<dyn MetaKv>,
    segments: RwLock<HashMap<UniqueId, SegmentInfo>>,
}

impl SegmentMeta {
    pub async fn new(kv: Arc<dyn MetaKv>) -> Result<Self> {
        let (pairs, _) = kv.load_with_prefix(SEGMENT_PREFIX).await?;
        let mut segments = HashMap::new();
        for (key, value) in pairs {
            match serde_json::from_str::<SegmentInfo>(&value) {
                Ok(info) => {
                    segments.insert(info.id, info);
                }
                Err(e) => warn!(key = %key, error = %e, "skipping undecodable segment row"),
            }
        }
        Ok(Self { kv, segments: RwLock::new(segments) })
    }

    pub async fn add_segment(&self, info: SegmentInfo) -> Result<()> {
        self.kv.save(&segment_key(&info), &serde_json::to_string(&info)?).await?;
        Metrics::get().segments_total.with_label_values(&["growing"]).inc();
        self.segments.write().insert(info.id, info);
        Ok(())
    }

    pub fn get(&self, segment_id: UniqueId) -> Option<SegmentInfo> {
        self.segments.read().get(&segment_id).cloned()
    }

    /// Transition a segment's state; backward transitions are rejected.
    pub async fn set_state(&self, segment_id: UniqueId, state: SegmentState) -> Result<()> {
        let mut info = self
            .get(segment_id)
            .ok_or_else(|| Error::NotFound(format!("segment {segment_id}")))?;
        if info.state == state {
            return Ok(());
        }
        if !info.state.can_transition_to(state) {
            return Err(Error::Unexpected(format!(
                "segment {segment_id} cannot move {:?} -> {state:?}",
                info.state
            )));
        }
        info.state = state;
        self.save(info).await
    }

    /// Extend the freshness window; the expire timestamp only advances.
    pub async fn set_last_expire(&self, segment_id: UniqueId, expire_ts: Timestamp) -> Result<()> {
        let mut info = self
            .get(segment_id)
            .ok_or_else(|| Error::NotFound(format!("segment {segment_id}")))?;
        if expire_ts <= info.last_expire_ts {
            return Ok(());
        }
        info.last_expire_ts = expire_ts;
        self.save(info).await
    }

    /// Atomic update of binlog paths, checkpoints, start positions, and the
    /// optional transition into Flushing.
    pub async fn save_binlogs_and_checkpoints(
        &self,
        segment_id: UniqueId,
        flushed: bool,
        binlogs: &[FieldBinlogPaths],
        checkpoints: &[SegmentCheckpoint],
        start_positions: &[SegmentStartPosition],
    ) -> Result<()> {
        let mut touched: HashMap<UniqueId, SegmentInfo> = HashMap::new();
        {
            let segments = self.segments.read();
            let primary = segments
                .get(&segment_id)
                .ok_or_else(|| Error::NotFound(format!("segment {segment_id}")))?;
            let mut primary = primary.clone();

            for field in binlogs {
                primary
                    .binlogs
                    .entry(field.field_id)
                    .or_default()
                    .extend(field.paths.iter().cloned());
            }
            if flushed {
                if !primary.state.can_transition_to(SegmentState::Flushing) {
                    return Err(Error::Unexpected(format!(
                        "segment {segment_id} cannot move {:?} -> Flushing",
                        primary.state
                    )));
                }
                if primary.state.rank() < SegmentState::Flushing.rank() {
                    primary.state = SegmentState::Flushing;
                    Metrics::get().segments_total.with_label_values(&["flushing"]).inc();
                }
            }
            touched.insert(primary.id, primary);

            for sp in start_positions {
                let info = touched
                    .get(&sp.segment_id)
                    .cloned()
                    .or_else(|| segments.get(&sp.segment_id).cloned());
                let Some(mut info) = info else {
                    debug!(segment_id = sp.segment_id, "start position for unknown segment");
                    continue;
                };
                // First write wins; once non-empty, the start position is
                // immutable.
                if info.start_position.is_none() {
                    info.start_position = Some(sp.position.clone());
                    touched.insert(info.id, info);
                }
            }

            for cp in checkpoints {
                let info = touched
                    .get(&cp.segment_id)
                    .cloned()
                    .or_else(|| segments.get(&cp.segment_id).cloned());
                let Some(mut info) = info else {
                    debug!(segment_id = cp.segment_id, "checkpoint for unknown segment");
                    continue;
                };
                // Checkpoints only advance.
                if let Some(existing) = &info.dml_position {
                    if existing.timestamp >= cp.position.timestamp {
                        continue;
                    }
                }
                info.dml_position = Some(cp.position.clone());
                info.num_rows = info.num_rows.max(cp.num_rows);
                touched.insert(info.id, info);
            }
        }

        let mut saves = HashMap::new();
        for info in touched.values() {
            saves.insert(segment_key(info), serde_json::to_string(info)?);
        }
        self.kv.multi_save(saves).await?;

        let mut segments = self.segments.write();
        for (id, info) in touched {
            segments.insert(id, info);
        }
        Ok(())
    }

    /// Sealed segments on `channel` whose freshness window closed before
    /// `ts`; they are returned already marked Flushing, in one transaction.
    pub async fn get_flushable(&self, channel: &str, ts: Timestamp) -> Result<Vec<SegmentInfo>> {
        let mut flushable: Vec<SegmentInfo> = {
            let segments = self.segments.read();
            segments
                .values()
                .filter(|s| {
                    s.insert_channel == channel
                        && s.state == SegmentState::Sealed
                        && s.last_expire_ts < ts
                })
                .cloned()
                .collect()
        };
        if flushable.is_empty() {
            return Ok(flushable);
        }

        let mut saves = HashMap::new();
        for info in flushable.iter_mut() {
            info.state = SegmentState::Flushing;
            saves.insert(segment_key(info), serde_json::to_string(info)?);
        }
        self.kv.multi_save(saves).await?;
        Metrics::get()
            .segments_total
            .with_label_values(&["flushing"])
            .inc_by(flushable.len() as u64);

        let mut segments = self.segments.write();
        for info in &flushable {
            segments.insert(info.id, info.clone());
        }
        Ok(flushable)
    }

    pub fn segments_of_channel(&self, channel: &str) -> Vec<SegmentInfo> {
        let mut out: Vec<SegmentInfo> = self
            .segments
            .read()
            .values()
            .filter(|s| s.insert_channel == channel)
            .cloned()
            .collect();
        // Allocation order: oldest segment first.
        out.sort_by_key(|s| s.id);
        out
    }

    pub fn segments_of_collection(&self, collection_id: UniqueId) -> Vec<SegmentInfo> {
        let mut out: Vec<SegmentInfo> = self
            .segments
            .read()
            .values()
            .filter(|s| s.collection_id == collection_id)
            .cloned()
            .collect();
        out.sort_by_key(|s| s.id);
        out
    }

    pub fn flushing_segments(&self) -> Vec<SegmentInfo> {
        self.segments
            .read()
            .values()
            .filter(|s| s.state == SegmentState::Flushing)
            .cloned()
            .collect()
    }

    pub fn flushed_segments(
        &self,
        collection_id: UniqueId,
        partition_id: UniqueId,
    ) -> Vec<UniqueId> {
        let mut out: Vec<UniqueId> = self
            .segments
            .read()
            .values()
            .filter(|s| {
                s.collection_id == collection_id
                    && s.partition_id == partition_id
                    && s.state == SegmentState::Flushed
            })
            .map(|s| s.id)
            .collect();
        out.sort_unstable();
        out
    }

    /// Earliest recorded position on a channel, used to seek new watchers.
    pub fn channel_seek_position(&self, channel: &str) -> Option<MsgPosition> {
        self.segments
            .read()
            .values()
            .filter(|s| s.insert_channel == channel)
            .filter_map(|s| s.start_position.clone())
            .min_by_key(|p| p.timestamp)
    }

    async fn save(&self, info: SegmentInfo) -> Result<()> {
        self.kv.save(&segment_key(&info), &serde_json::to_string(&info)?).await?;
        self.segments.write().insert(info.id, info);
        Ok(())
    }
}
