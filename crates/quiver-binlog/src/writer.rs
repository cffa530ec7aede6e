//! Binlog serialization.

use crate::event::{DescriptorEvent, EventType, FileKind};
use crate::{BINLOG_MAGIC, BINLOG_VERSION, DATA_EVENT_FIXED_LEN, EVENT_HEADER_LEN, SERVER_VERSION};
use bytes::{BufMut, Bytes, BytesMut};
use quiver_common::types::{Timestamp, UniqueId};
use quiver_common::{Error, Result};

/// Fixed length of the descriptor event's data part (7 post-header entries).
pub(crate) const DESCRIPTOR_DATA_LEN: usize = 67;

impl DescriptorEvent {
    /// Descriptor for a fresh file with the standard post-header lengths.
    pub fn new(
        commit_id: u64,
        collection_id: UniqueId,
        partition_id: UniqueId,
        segment_id: UniqueId,
        start_ts: Timestamp,
        end_ts: Timestamp,
        payload_type: u8,
    ) -> Self {
        Self {
            binlog_version: BINLOG_VERSION,
            server_version: SERVER_VERSION,
            commit_id,
            collection_id,
            partition_id,
            segment_id,
            start_ts,
            end_ts,
            payload_type,
            post_header_lengths: vec![
                DESCRIPTOR_DATA_LEN as u8,
                DATA_EVENT_FIXED_LEN as u8, // insert
                DATA_EVENT_FIXED_LEN as u8, // delete
                DATA_EVENT_FIXED_LEN as u8, // create collection
                DATA_EVENT_FIXED_LEN as u8, // drop collection
                DATA_EVENT_FIXED_LEN as u8, // create partition
                DATA_EVENT_FIXED_LEN as u8, // drop partition
            ],
        }
    }
}

/// Serializer for one binlog file. The descriptor event is written up front;
/// the first event of every file is always the descriptor.
pub struct BinlogWriter {
    kind: FileKind,
    server_id: u32,
    buf: BytesMut,
    events: usize,
}

impl BinlogWriter {
    pub fn new(
        kind: FileKind,
        server_id: u32,
        descriptor: &DescriptorEvent,
        timestamp: Timestamp,
    ) -> Self {
        let mut writer = Self { kind, server_id, buf: BytesMut::new(), events: 0 };
        writer.buf.put_slice(&BINLOG_MAGIC);

        let data_len = DESCRIPTOR_DATA_LEN - 7 + descriptor.post_header_lengths.len();
        writer.put_event_header(timestamp, EventType::Descriptor, data_len);
        writer.buf.put_u16_le(descriptor.binlog_version);
        writer.buf.put_u64_le(descriptor.server_version);
        writer.buf.put_u64_le(descriptor.commit_id);
        writer.buf.put_u8(EVENT_HEADER_LEN as u8);
        writer.buf.put_i64_le(descriptor.collection_id);
        writer.buf.put_i64_le(descriptor.partition_id);
        writer.buf.put_i64_le(descriptor.segment_id);
        writer.buf.put_u64_le(descriptor.start_ts);
        writer.buf.put_u64_le(descriptor.end_ts);
        writer.buf.put_u8(descriptor.payload_type);
        writer.buf.put_slice(&descriptor.post_header_lengths);
        writer
    }

    /// Append a data event holding `payload` (a columnar-format blob).
    pub fn append(
        &mut self,
        event_type: EventType,
        timestamp: Timestamp,
        start_ts: Timestamp,
        end_ts: Timestamp,
        payload: &[u8],
    ) -> Result<()> {
        if event_type == EventType::Descriptor {
            return Err(Error::InvalidInput("descriptor may only open a file".into()));
        }
        if !self.kind.allows(event_type) {
            return Err(Error::InvalidInput(format!(
                "{event_type:?} events are not allowed in {:?} files",
                self.kind
            )));
        }
        self.put_event_header(timestamp, event_type, DATA_EVENT_FIXED_LEN + payload.len());
        self.buf.put_u64_le(start_ts);
        self.buf.put_u64_le(end_ts);
        self.buf.put_u32_le(0); // reserved
        self.buf.put_slice(payload);
        self.events += 1;
        Ok(())
    }

    /// Close the file. A valid binlog carries at least one data event.
    pub fn finish(self) -> Result<Bytes> {
        if self.events == 0 {
            return Err(Error::InvalidInput("binlog must contain at least one data event".into()));
        }
        Ok(self.buf.freeze())
    }

    fn put_event_header(&mut self, timestamp: Timestamp, event_type: EventType, data_len: usize) {
        let event_length = (EVENT_HEADER_LEN + data_len) as u32;
        let next_position = self.buf.len() as u32 + event_length;
        self.buf.put_u64_le(timestamp);
        self.buf.put_u8(event_type.code());
        self.buf.put_u32_le(self.server_id);
        self.buf.put_u32_le(event_length);
        self.buf.put_u32_le(next_position);
    }
}
