//! Collaborator interfaces the root coordinator talks to.
//!
//! The transports behind these traits are out of scope; peers are resolved
//! by address from the session registry and injected at construction, so
//! there are no pointer cycles between coordinators.

use async_trait::async_trait;
use quiver_common::types::{FieldId, UniqueId};
use quiver_common::Result;
use std::collections::HashMap;

/// Request handed to the index coordinator for one segment field.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexBuildRequest {
    pub index_id: UniqueId,
    pub index_name: String,
    /// Binlog paths of the field column to build over.
    pub data_paths: Vec<String>,
    pub type_params: HashMap<String, String>,
    pub index_params: HashMap<String, String>,
}

/// Index coordinator surface the root coordinator depends on.
#[async_trait]
pub trait IndexServiceClient: Send + Sync {
    /// Idempotent: the same request returns the same build id.
    async fn build_index(&self, req: IndexBuildRequest) -> Result<UniqueId>;

    async fn drop_index(&self, index_id: UniqueId) -> Result<()>;
}

/// Data coordinator surface the root coordinator depends on.
#[async_trait]
pub trait DataServiceClient: Send + Sync {
    /// Binlog paths of one field column of a flushed segment.
    async fn get_binlog_paths(&self, segment_id: UniqueId, field_id: FieldId)
        -> Result<Vec<String>>;

    async fn get_segment_num_rows(&self, segment_id: UniqueId) -> Result<i64>;

    async fn get_flushed_segments(
        &self,
        collection_id: UniqueId,
        partition_id: UniqueId,
    ) -> Result<Vec<UniqueId>>;
}

/// Fan-out to proxy metadata caches after a drop.
#[async_trait]
pub trait ProxyCacheInvalidator: Send + Sync {
    async fn invalidate_collection_cache(&self, collection_name: &str) -> Result<()>;
}

/// No proxies to invalidate; used in single-node wiring and tests.
pub struct NoopProxyInvalidator;

#[async_trait]
impl ProxyCacheInvalidator for NoopProxyInvalidator {
    async fn invalidate_collection_cache(&self, _collection_name: &str) -> Result<()> {
        Ok(())
    }
}
