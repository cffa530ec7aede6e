//! Message model shared by all channels.

use quiver_common::types::{Timestamp, UniqueId};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Wire-visible message kind.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum MsgType {
    TimeTick,
    CreateCollection,
    DropCollection,
    CreatePartition,
    DropPartition,
    SegmentFlushDone,
}

/// Header carried by every message on every channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MsgHeader {
    pub msg_type: MsgType,
    pub msg_id: UniqueId,
    pub timestamp: Timestamp,
    pub source_id: UniqueId,
}

/// Typed message payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MsgBody {
    /// Watermark declaration: no message with an earlier timestamp will be
    /// sent on the named channels henceforth.
    TimeTick {
        channels: Vec<String>,
        timestamps: Vec<Timestamp>,
        default_timestamp: Timestamp,
    },
    CreateCollection {
        collection_id: UniqueId,
        collection_name: String,
    },
    DropCollection {
        collection_id: UniqueId,
        collection_name: String,
    },
    CreatePartition {
        collection_id: UniqueId,
        collection_name: String,
        partition_id: UniqueId,
        partition_name: String,
    },
    DropPartition {
        collection_id: UniqueId,
        collection_name: String,
        partition_id: UniqueId,
        partition_name: String,
    },
    SegmentFlushDone {
        collection_id: UniqueId,
        segment_id: UniqueId,
    },
}

impl MsgBody {
    pub fn msg_type(&self) -> MsgType {
        match self {
            MsgBody::TimeTick { .. } => MsgType::TimeTick,
            MsgBody::CreateCollection { .. } => MsgType::CreateCollection,
            MsgBody::DropCollection { .. } => MsgType::DropCollection,
            MsgBody::CreatePartition { .. } => MsgType::CreatePartition,
            MsgBody::DropPartition { .. } => MsgType::DropPartition,
            MsgBody::SegmentFlushDone { .. } => MsgType::SegmentFlushDone,
        }
    }
}

/// A complete message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub header: MsgHeader,
    pub body: MsgBody,
}

impl Message {
    pub fn new(msg_id: UniqueId, timestamp: Timestamp, source_id: UniqueId, body: MsgBody) -> Self {
        Self {
            header: MsgHeader { msg_type: body.msg_type(), msg_id, timestamp, source_id },
            body,
        }
    }
}

/// Consumer-side de-duplication on message id.
#[derive(Debug, Default)]
pub struct Deduper {
    seen: HashSet<UniqueId>,
}

impl Deduper {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` the first time a message id is observed.
    pub fn observe(&mut self, msg_id: UniqueId) -> bool {
        self.seen.insert(msg_id)
    }
}
