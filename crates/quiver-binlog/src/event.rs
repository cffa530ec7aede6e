//! Event structures of the binlog format.

use bytes::Bytes;
use quiver_common::types::{Timestamp, UniqueId};
use quiver_common::{Error, Result};

/// Event type codes, fixed by the wire format.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
#[repr(u8)]
pub enum EventType {
    Descriptor = 0,
    Insert = 1,
    Delete = 2,
    CreateCollection = 3,
    DropCollection = 4,
    CreatePartition = 5,
    DropPartition = 6,
}

impl EventType {
    pub fn from_code(code: u8) -> Result<Self> {
        Ok(match code {
            0 => EventType::Descriptor,
            1 => EventType::Insert,
            2 => EventType::Delete,
            3 => EventType::CreateCollection,
            4 => EventType::DropCollection,
            5 => EventType::CreatePartition,
            6 => EventType::DropPartition,
            other => return Err(Error::Serialization(format!("unknown event type code {other}"))),
        })
    }

    pub fn code(&self) -> u8 {
        *self as u8
    }

    pub fn is_ddl(&self) -> bool {
        matches!(
            self,
            EventType::CreateCollection
                | EventType::DropCollection
                | EventType::CreatePartition
                | EventType::DropPartition
        )
    }
}

/// What a binlog file holds; governs which events the writer accepts.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum FileKind {
    /// A plain field column: insert events only.
    FieldColumn,
    /// The primary-key column: insert and delete events.
    PrimaryKeyColumn,
    /// The DDL column: DDL events only.
    DdlColumn,
}

impl FileKind {
    pub fn allows(&self, event_type: EventType) -> bool {
        match self {
            FileKind::FieldColumn => event_type == EventType::Insert,
            FileKind::PrimaryKeyColumn => {
                matches!(event_type, EventType::Insert | EventType::Delete)
            }
            FileKind::DdlColumn => event_type.is_ddl(),
        }
    }
}

/// The 21-byte header every event begins with.
#[derive(Debug, Clone, PartialEq)]
pub struct EventHeader {
    pub timestamp: Timestamp,
    pub type_code: EventType,
    pub server_id: u32,
    /// Total length of the event, header included.
    pub event_length: u32,
    /// Absolute file offset of the next event.
    pub next_position: u32,
}

/// The descriptor event's data part.
#[derive(Debug, Clone, PartialEq)]
pub struct DescriptorEvent {
    pub binlog_version: u16,
    pub server_version: u64,
    pub commit_id: u64,
    pub collection_id: UniqueId,
    pub partition_id: UniqueId,
    pub segment_id: UniqueId,
    pub start_ts: Timestamp,
    pub end_ts: Timestamp,
    pub payload_type: u8,
    /// Fixed data-part length per event type code.
    pub post_header_lengths: Vec<u8>,
}

/// A decoded data event.
#[derive(Debug, Clone, PartialEq)]
pub struct DataEvent {
    pub header: EventHeader,
    pub start_ts: Timestamp,
    pub end_ts: Timestamp,
    pub payload: Bytes,
}
