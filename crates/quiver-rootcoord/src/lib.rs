//! Root coordinator.
//!
//! Owns collection, partition, and index-descriptor metadata; routes DDL
//! operations onto each collection's physical channels with crash-safe
//! replay; emits the cluster time-tick; and turns segment-flush-completed
//! events into index-build requests.

pub mod clients;
pub mod core;
pub mod meta;
pub mod timetick;

pub use crate::core::{CreateCollectionRequest, RootCoord, RootCoordDeps};
pub use clients::{DataServiceClient, IndexBuildRequest, IndexServiceClient, ProxyCacheInvalidator};
pub use meta::{
    CollectionInfo, CollectionSchema, DataType, FieldSchema, IndexInfo, MetaTable, PartitionInfo,
    SegmentIndexInfo,
};
pub use timetick::ChannelTimeTick;
