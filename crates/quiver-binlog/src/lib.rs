//! Append-only per-column binlog file format.
//!
//! Layout: a 4-byte magic number, one descriptor event, then 1…N data
//! events. Every event starts with a 21-byte header; all integers are
//! little-endian. The first event of every file is the descriptor; delete
//! events may appear only in primary-key-column files and DDL events only in
//! DDL-column files.

pub mod event;
pub mod reader;
pub mod writer;

pub use event::{DataEvent, DescriptorEvent, EventHeader, EventType, FileKind};
pub use reader::BinlogReader;
pub use writer::BinlogWriter;

/// File magic, the first four bytes of every binlog.
pub const BINLOG_MAGIC: [u8; 4] = *b"QVBL";

/// Current binlog format version.
pub const BINLOG_VERSION: u16 = 1;

/// Version of the writing server baked into the descriptor.
pub const SERVER_VERSION: u64 = 1;

/// Fixed event header length in bytes.
pub const EVENT_HEADER_LEN: usize = 21;

/// Fixed data-event prelude: start-ts, end-ts, reserved word.
pub const DATA_EVENT_FIXED_LEN: usize = 20;
