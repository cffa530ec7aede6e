//! Meta-store and blob-store abstractions.
//!
//! Coordinators are written against the [`MetaKv`] and [`BlobStore`] traits;
//! any backend providing revisioned writes, prefix watches, and leases can
//! implement them. The in-memory backends here carry the full semantics and
//! back every test.

pub mod blob;
pub mod kv;
pub mod mem;

pub use blob::{BlobStore, MemoryBlobStore};
pub use kv::{KvEvent, KvEventType, LeaseId, MetaKv};
pub use mem::MemoryMetaKv;
