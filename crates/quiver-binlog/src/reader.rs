//! Binlog deserialization.

use crate::event::{DataEvent, DescriptorEvent, EventHeader, EventType};
use crate::{BINLOG_MAGIC, DATA_EVENT_FIXED_LEN, EVENT_HEADER_LEN};
use bytes::{Buf, Bytes};
use quiver_common::{Error, Result};

/// Parsed binlog file.
pub struct BinlogReader {
    descriptor: DescriptorEvent,
    events: Vec<DataEvent>,
}

impl BinlogReader {
    /// Parse and validate a complete binlog file.
    pub fn open(data: Bytes) -> Result<Self> {
        if data.len() < BINLOG_MAGIC.len() {
            return Err(Error::Serialization("binlog shorter than magic".into()));
        }
        if data[..4] != BINLOG_MAGIC {
            return Err(Error::Serialization("bad binlog magic".into()));
        }

        let mut pos = BINLOG_MAGIC.len();
        let (header, body) = read_event(&data, pos)?;
        if header.type_code != EventType::Descriptor {
            return Err(Error::Serialization(format!(
                "first event must be a descriptor, found {:?}",
                header.type_code
            )));
        }
        let descriptor = parse_descriptor(body)?;
        pos = header.next_position as usize;

        let mut events = Vec::new();
        while pos < data.len() {
            let (header, mut body) = read_event(&data, pos)?;
            if header.type_code == EventType::Descriptor {
                return Err(Error::Serialization("descriptor may only open a file".into()));
            }
            if body.len() < DATA_EVENT_FIXED_LEN {
                return Err(Error::Serialization("data event shorter than fixed prelude".into()));
            }
            let start_ts = body.get_u64_le();
            let end_ts = body.get_u64_le();
            let _reserved = body.get_u32_le();
            pos = header.next_position as usize;
            events.push(DataEvent { header, start_ts, end_ts, payload: body });
        }

        if events.is_empty() {
            return Err(Error::Serialization("binlog carries no data events".into()));
        }
        Ok(Self { descriptor, events })
    }

    pub fn descriptor(&self) -> &DescriptorEvent {
        &self.descriptor
    }

    pub fn events(&self) -> &[DataEvent] {
        &self.events
    }
}

fn read_event(data: &Bytes, pos: usize) -> Result<(EventHeader, Bytes)> {
    if data.len() < pos + EVENT_HEADER_LEN {
        return Err(Error::Serialization("truncated event header".into()));
    }
    let mut cursor = data.slice(pos..pos + EVENT_HEADER_LEN);
    let timestamp = cursor.get_u64_le();
    let type_code = EventType::from_code(cursor.get_u8())?;
    let server_id = cursor.get_u32_le();
    let event_length = cursor.get_u32_le();
    let next_position = cursor.get_u32_le();

    let end = pos + event_length as usize;
    if (event_length as usize) < EVENT_HEADER_LEN || data.len() < end {
        return Err(Error::Serialization("event length exceeds file".into()));
    }
    if next_position as usize != end {
        return Err(Error::Serialization("event next-position does not follow length".into()));
    }

    let header = EventHeader { timestamp, type_code, server_id, event_length, next_position };
    Ok((header, data.slice(pos + EVENT_HEADER_LEN..end)))
}

fn parse_descriptor(mut body: Bytes) -> Result<DescriptorEvent> {
    // Fixed part before the post-header table.
    if body.len() < 60 {
        return Err(Error::Serialization("descriptor event too short".into()));
    }
    let binlog_version = body.get_u16_le();
    let server_version = body.get_u64_le();
    let commit_id = body.get_u64_le();
    let header_length = body.get_u8();
    if header_length as usize != EVENT_HEADER_LEN {
        return Err(Error::Serialization(format!(
            "descriptor declares header length {header_length}, expected {EVENT_HEADER_LEN}"
        )));
    }
    let collection_id = body.get_i64_le();
    let partition_id = body.get_i64_le();
    let segment_id = body.get_i64_le();
    let start_ts = body.get_u64_le();
    let end_ts = body.get_u64_le();
    let payload_type = body.get_u8();
    let post_header_lengths = body.to_vec();

    Ok(DescriptorEvent {
        binlog_version,
        server_version,
        commit_id,
        collection_id,
        partition_id,
        segment_id,
        start_ts,
        end_ts,
        payload_type,
        post_header_lengths,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BinlogWriter, FileKind};

    fn descriptor() -> DescriptorEvent {
        DescriptorEvent::new(3, 100, 200, 300, 1_000, 2_000, 7)
    }

    #[test]
    fn descriptor_roundtrips_field_for_field() {
        let desc = descriptor();
        let mut writer = BinlogWriter::new(FileKind::FieldColumn, 11, &desc, 5_000);
        writer.append(EventType::Insert, 5_001, 1_000, 1_500, b"rows").unwrap();
        let file = writer.finish().unwrap();

        let reader = BinlogReader::open(file).unwrap();
        assert_eq!(reader.descriptor(), &desc);
    }

    #[test]
    fn multiple_events_preserve_order_and_payloads() {
        let mut writer = BinlogWriter::new(FileKind::PrimaryKeyColumn, 1, &descriptor(), 10);
        writer.append(EventType::Insert, 11, 1, 2, b"first").unwrap();
        writer.append(EventType::Insert, 12, 2, 3, b"second").unwrap();
        writer.append(EventType::Delete, 13, 3, 4, b"tombstones").unwrap();
        let file = writer.finish().unwrap();

        let reader = BinlogReader::open(file).unwrap();
        let events = reader.events();
        assert_eq!(events.len(), 3);
        assert_eq!(&events[0].payload[..], b"first");
        assert_eq!(&events[1].payload[..], b"second");
        assert_eq!(events[2].header.type_code, EventType::Delete);
        assert_eq!(events[2].start_ts, 3);
        assert_eq!(events[2].end_ts, 4);
    }

    #[test]
    fn delete_events_only_in_primary_key_files() {
        let mut writer = BinlogWriter::new(FileKind::FieldColumn, 1, &descriptor(), 10);
        assert!(writer.append(EventType::Delete, 11, 1, 2, b"x").is_err());

        let mut writer = BinlogWriter::new(FileKind::PrimaryKeyColumn, 1, &descriptor(), 10);
        assert!(writer.append(EventType::Delete, 11, 1, 2, b"x").is_ok());
    }

    #[test]
    fn ddl_events_only_in_ddl_files() {
        let mut writer = BinlogWriter::new(FileKind::DdlColumn, 1, &descriptor(), 10);
        assert!(writer.append(EventType::Insert, 11, 1, 2, b"x").is_err());
        assert!(writer.append(EventType::CreateCollection, 11, 1, 2, b"create docs").is_ok());
        assert!(writer.append(EventType::DropPartition, 12, 2, 3, b"drop p0").is_ok());
    }

    #[test]
    fn event_headers_chain_through_the_file() {
        let mut writer = BinlogWriter::new(FileKind::FieldColumn, 9, &descriptor(), 10);
        writer.append(EventType::Insert, 11, 1, 2, b"abc").unwrap();
        writer.append(EventType::Insert, 12, 2, 3, b"defgh").unwrap();
        let file = writer.finish().unwrap();

        let reader = BinlogReader::open(file.clone()).unwrap();
        let events = reader.events();
        assert_eq!(events[1].header.next_position as usize, file.len());
        assert_eq!(events[0].header.server_id, 9);
        assert_eq!(
            events[0].header.event_length as usize,
            EVENT_HEADER_LEN + DATA_EVENT_FIXED_LEN + 3
        );
    }

    #[test]
    fn rejects_bad_magic_and_truncation() {
        let mut writer = BinlogWriter::new(FileKind::FieldColumn, 1, &descriptor(), 10);
        writer.append(EventType::Insert, 11, 1, 2, b"abc").unwrap();
        let file = writer.finish().unwrap();

        let mut corrupted = file.to_vec();
        corrupted[0] ^= 0xff;
        assert!(BinlogReader::open(Bytes::from(corrupted)).is_err());

        let truncated = file.slice(..file.len() - 2);
        assert!(BinlogReader::open(truncated).is_err());
    }

    #[test]
    fn empty_file_is_rejected() {
        let writer = BinlogWriter::new(FileKind::FieldColumn, 1, &descriptor(), 10);
        assert!(writer.finish().is_err());
    }
}
