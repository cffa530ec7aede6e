//! Data coordinator.
//!
//! Owns segment rows and their lifecycle: allocation of growing segments on
//! ingest channels, sealing, flush triggering off the cluster time-tick,
//! the flush-done handshake with the root coordinator, and distribution of
//! ingest channels across data nodes.

pub mod cluster;
pub mod coord;
pub mod meta;
pub mod segment_manager;

pub use cluster::{
    ChannelStatus, ChannelWatchState, Cluster, DataNodeClient, DataNodeClientFactory, DataNodeInfo,
    VchannelInfo,
};
pub use coord::{DataCoord, DataCoordDeps, DataCollectionInfo, RootCoordClient, SaveBinlogsRequest};
pub use meta::{
    FieldBinlogPaths, SegmentCheckpoint, SegmentInfo, SegmentMeta, SegmentStartPosition,
    SegmentState,
};
pub use segment_manager::{SegmentAllocation, SegmentManager};
