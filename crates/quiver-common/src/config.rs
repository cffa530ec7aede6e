//! Per-coordinator configuration.
//!
//! Every coordinator receives its config struct at construction; nothing is
//! read from process-global state after startup.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Lease time-to-live for session keys, in milliseconds.
    #[serde(default = "default_session_ttl_ms")]
    pub ttl_ms: u64,

    /// Heartbeat (lease keep-alive) interval, in milliseconds.
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_ms: default_session_ttl_ms(),
            heartbeat_interval_ms: default_heartbeat_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocatorConfig {
    /// Identifiers leased from the meta store per batch.
    #[serde(default = "default_id_batch")]
    pub id_batch_size: u64,

    /// Milliseconds of timestamp headroom persisted per lease.
    #[serde(default = "default_tso_window_ms")]
    pub tso_window_ms: u64,

    /// Interval of the allocator top-off loop, in milliseconds.
    #[serde(default = "default_update_interval_ms")]
    pub update_interval_ms: u64,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            id_batch_size: default_id_batch(),
            tso_window_ms: default_tso_window_ms(),
            update_interval_ms: default_update_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootCoordConfig {
    /// Time-tick emission interval, in milliseconds.
    #[serde(default = "default_time_tick_ms")]
    pub time_tick_interval_ms: u64,

    /// Name of the dedicated cluster time-tick channel.
    #[serde(default = "default_time_tick_channel")]
    pub time_tick_channel: String,

    /// Prefix for generated physical DML channel names.
    #[serde(default = "default_dml_channel_prefix")]
    pub dml_channel_prefix: String,

    /// Physical channels fixed per collection at create time.
    #[serde(default = "default_channels_per_collection")]
    pub channels_per_collection: usize,

    /// Segments smaller than this are not worth indexing.
    #[serde(default = "default_min_rows_to_index")]
    pub min_segment_rows_to_index: i64,
}

impl Default for RootCoordConfig {
    fn default() -> Self {
        Self {
            time_tick_interval_ms: default_time_tick_ms(),
            time_tick_channel: default_time_tick_channel(),
            dml_channel_prefix: default_dml_channel_prefix(),
            channels_per_collection: default_channels_per_collection(),
            min_segment_rows_to_index: default_min_rows_to_index(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexCoordConfig {
    /// Recycler sweep interval, in milliseconds.
    #[serde(default = "default_recycle_interval_ms")]
    pub recycle_interval_ms: u64,

    /// Maximum meta rows examined per recycler sweep.
    #[serde(default = "default_recycle_limit")]
    pub recycle_limit: usize,

    /// Deadline for worker build RPCs, in milliseconds.
    #[serde(default = "default_build_rpc_timeout_ms")]
    pub build_rpc_timeout_ms: u64,

    /// Backoff before re-enqueueing a build whose assignment failed.
    #[serde(default = "default_assign_backoff_ms")]
    pub assign_backoff_ms: u64,
}

impl Default for IndexCoordConfig {
    fn default() -> Self {
        Self {
            recycle_interval_ms: default_recycle_interval_ms(),
            recycle_limit: default_recycle_limit(),
            build_rpc_timeout_ms: default_build_rpc_timeout_ms(),
            assign_backoff_ms: default_assign_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataCoordConfig {
    /// Hard cap on rows per segment.
    #[serde(default = "default_max_rows_per_segment")]
    pub max_rows_per_segment: i64,

    /// How long a segment allocation stays routable, in milliseconds.
    #[serde(default = "default_alloc_expiration_ms")]
    pub segment_alloc_expiration_ms: u64,

    /// Maximum Growing segments per ingest channel.
    #[serde(default = "default_max_growing")]
    pub max_growing_per_channel: usize,

    /// Deadline for data-node control RPCs, in milliseconds.
    #[serde(default = "default_control_rpc_timeout_ms")]
    pub control_rpc_timeout_ms: u64,

    /// Name of the cluster time-tick channel consumed for flush triggering.
    #[serde(default = "default_time_tick_channel")]
    pub time_tick_channel: String,

    /// Backoff before retrying a failed channel-watch RPC, in milliseconds.
    #[serde(default = "default_watch_retry_ms")]
    pub watch_retry_ms: u64,
}

impl Default for DataCoordConfig {
    fn default() -> Self {
        Self {
            max_rows_per_segment: default_max_rows_per_segment(),
            segment_alloc_expiration_ms: default_alloc_expiration_ms(),
            max_growing_per_channel: default_max_growing(),
            control_rpc_timeout_ms: default_control_rpc_timeout_ms(),
            time_tick_channel: default_time_tick_channel(),
            watch_retry_ms: default_watch_retry_ms(),
        }
    }
}

fn default_session_ttl_ms() -> u64 {
    6_000
}
fn default_heartbeat_ms() -> u64 {
    2_000
}
fn default_id_batch() -> u64 {
    500
}
fn default_tso_window_ms() -> u64 {
    3_000
}
fn default_update_interval_ms() -> u64 {
    50
}
fn default_time_tick_ms() -> u64 {
    200
}
fn default_time_tick_channel() -> String {
    "quiver-timetick".to_string()
}
fn default_dml_channel_prefix() -> String {
    "quiver-dml".to_string()
}
fn default_channels_per_collection() -> usize {
    2
}
fn default_min_rows_to_index() -> i64 {
    1
}
fn default_recycle_interval_ms() -> u64 {
    10_000
}
fn default_recycle_limit() -> usize {
    20
}
fn default_build_rpc_timeout_ms() -> u64 {
    10_000
}
fn default_assign_backoff_ms() -> u64 {
    200
}
fn default_max_rows_per_segment() -> i64 {
    1_000_000
}
fn default_alloc_expiration_ms() -> u64 {
    2_000
}
fn default_max_growing() -> usize {
    4
}
fn default_control_rpc_timeout_ms() -> u64 {
    5_000
}
fn default_watch_retry_ms() -> u64 {
    200
}
