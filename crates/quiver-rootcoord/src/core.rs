//! The root coordinator core: DDL protocol, replay, time-tick emission.

use crate::clients::{DataServiceClient, IndexBuildRequest, IndexServiceClient, ProxyCacheInvalidator};
use crate::meta::{
    CollectionInfo, CollectionSchema, DdOperation, IndexInfo, MetaTable, PartitionInfo,
    SegmentIndexInfo, CREATE_COLLECTION_DD_TYPE, CREATE_PARTITION_DD_TYPE,
    DROP_COLLECTION_DD_TYPE, DROP_PARTITION_DD_TYPE, START_OF_USER_FIELD_ID,
};
use crate::timetick::ChannelTimeTick;
use dashmap::DashMap;
use parking_lot::RwLock;
use quiver_allocator::{GlobalIdAllocator, TsoAllocator};
use quiver_common::config::RootCoordConfig;
use quiver_common::metrics::Metrics;
use quiver_common::retry::{retry, RetryOptions};
use quiver_common::types::{ComponentStates, Role, RpcStatus, StateCode, Timestamp, UniqueId};
use quiver_common::{Error, Result};
use quiver_kv::MetaKv;
use quiver_msgstream::{physical_channel_name, Message, MsgBody, MsgBroker};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

/// Allocator top-off period.
const ALLOCATOR_UPDATE_INTERVAL_MS: u64 = 50;

/// Collaborator set injected at construction.
pub struct RootCoordDeps {
    pub kv: Arc<dyn MetaKv>,
    pub broker: Arc<dyn MsgBroker>,
    pub id_alloc: Arc<GlobalIdAllocator>,
    pub tso: Arc<TsoAllocator>,
    pub index_client: Arc<dyn IndexServiceClient>,
    pub data_client: Arc<dyn DataServiceClient>,
    pub proxy_invalidator: Arc<dyn ProxyCacheInvalidator>,
    pub server_id: UniqueId,
    pub config: RootCoordConfig,
}

#[derive(Debug, Clone)]
pub struct CreateCollectionRequest {
    pub name: String,
    pub schema: CollectionSchema,
}

/// Self-contained DDL replay record: the exact message to (re)publish and
/// the channels it goes to. Re-publishing reuses the original msg-id, so
/// subscribers de-duplicate a second attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DdEnvelope {
    message: Message,
    channels: Vec<String>,
    collection_name: String,
}

pub struct RootCoord {
    deps: RootCoordDeps,
    meta: Arc<MetaTable>,
    chan_ticks: Arc<ChannelTimeTick>,
    state: RwLock<StateCode>,
    ddl_locks: DashMap<String, Arc<Mutex<()>>>,
    shutdown_tx: watch::Sender<bool>,
}

impl RootCoord {
    /// Connect to the meta store (with the bootstrap retry budget) and build
    /// the coordinator in `Initializing` state.
    pub async fn init(deps: RootCoordDeps) -> Result<Arc<Self>> {
        let kv = deps.kv.clone();
        let meta = retry(&RetryOptions::bootstrap(), "rootcoord-meta-load", || {
            let kv = kv.clone();
            async move { MetaTable::new(kv).await }
        })
        .await?;
        deps.id_alloc.init().await?;
        deps.tso.init().await?;

        let (shutdown_tx, _) = watch::channel(false);
        Ok(Arc::new(Self {
            deps,
            meta: Arc::new(meta),
            chan_ticks: Arc::new(ChannelTimeTick::new()),
            state: RwLock::new(StateCode::Initializing),
            ddl_locks: DashMap::new(),
            shutdown_tx,
        }))
    }

    /// Replay any half-done DDL, start the time-tick and allocator top-off
    /// loops, turn Healthy.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.resend_dd_msg().await?;
        self.spawn_time_tick_loop();
        quiver_allocator::start_allocators(
            self.deps.id_alloc.clone(),
            self.deps.tso.clone(),
            Duration::from_millis(ALLOCATOR_UPDATE_INTERVAL_MS),
            self.shutdown_tx.subscribe(),
        );
        *self.state.write() = StateCode::Healthy;
        info!(server_id = self.deps.server_id, "root coordinator started");
        Ok(())
    }

    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        *self.state.write() = StateCode::Abnormal;
    }

    pub fn get_component_states(&self) -> ComponentStates {
        ComponentStates {
            node_id: self.deps.server_id,
            role: Role::RootCoord,
            state_code: *self.state.read(),
            status: RpcStatus::success(),
        }
    }

    /// Shared watermark table other coordinators read.
    pub fn channel_time_tick(&self) -> Arc<ChannelTimeTick> {
        self.chan_ticks.clone()
    }

    pub fn meta(&self) -> Arc<MetaTable> {
        self.meta.clone()
    }

    fn ensure_healthy(&self) -> Result<()> {
        let state = *self.state.read();
        if state != StateCode::Healthy {
            return Err(Error::Unexpected(format!("root coordinator state is {state}")));
        }
        Ok(())
    }

    fn ddl_lock(&self, name: &str) -> Arc<Mutex<()>> {
        self.ddl_locks.entry(name.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    // --- allocation surface ---

    pub async fn alloc_timestamp(&self, count: u32) -> Result<Timestamp> {
        self.ensure_healthy()?;
        self.deps.tso.alloc(count).await
    }

    pub async fn alloc_id(&self, count: u32) -> Result<(UniqueId, UniqueId)> {
        self.ensure_healthy()?;
        self.deps.id_alloc.alloc(count).await
    }

    // --- DDL surface ---

    /// Create a collection. A duplicate name returns the existing
    /// collection's id without creating a second one.
    pub async fn create_collection(&self, req: CreateCollectionRequest) -> Result<UniqueId> {
        self.ensure_healthy()?;
        Metrics::get().ddl_requests_total.with_label_values(&["create_collection", "total"]).inc();
        let lock = self.ddl_lock(&req.name);
        let _guard = lock.lock().await;

        if let Ok(existing) = self.meta.collection_by_name(&req.name) {
            debug!(name = %req.name, id = existing.id, "collection already exists");
            return Ok(existing.id);
        }

        let mut schema = req.schema;
        schema.validate()?;
        for (idx, field) in schema.fields.iter_mut().enumerate() {
            if field.field_id == 0 {
                field.field_id = START_OF_USER_FIELD_ID + idx as i64;
            }
        }

        let (collection_id, _) = self.deps.id_alloc.alloc(2).await?;
        let partition_id = collection_id + 1;
        let channel_base = format!("{}_{collection_id}", self.deps.config.dml_channel_prefix);
        let physical_channels: Vec<String> = (0..self.deps.config.channels_per_collection)
            .map(|i| physical_channel_name(&channel_base, i))
            .collect();
        let ts = self.deps.tso.alloc_one().await?;

        let info = CollectionInfo {
            id: collection_id,
            schema,
            partitions: vec![PartitionInfo { partition_id, name: "_default".into() }],
            physical_channels: physical_channels.clone(),
            field_indexes: Vec::new(),
            created_ts: ts,
            created_at: chrono::Utc::now(),
        };

        let msg_id = self.deps.id_alloc.alloc_one().await?;
        let message = Message::new(
            msg_id,
            ts,
            self.deps.server_id,
            MsgBody::CreateCollection { collection_id, collection_name: req.name.clone() },
        );
        let dd_op = self.dd_operation(CREATE_COLLECTION_DD_TYPE, &message, &physical_channels, &req.name)?;

        self.meta.add_collection(info, &dd_op).await?;
        self.deps.broker.broadcast(&physical_channels, &message).await?;
        self.meta.set_dd_msg_sent(true).await?;

        Metrics::get()
            .ddl_requests_total
            .with_label_values(&["create_collection", "success"])
            .inc();
        info!(name = %req.name, collection_id, "collection created");
        Ok(collection_id)
    }

    /// Drop a collection, broadcast the drop on its channels, and invalidate
    /// proxy caches.
    pub async fn drop_collection(&self, name: &str) -> Result<()> {
        self.ensure_healthy()?;
        Metrics::get().ddl_requests_total.with_label_values(&["drop_collection", "total"]).inc();
        let lock = self.ddl_lock(name);
        let _guard = lock.lock().await;

        let info = self.meta.collection_by_name(name)?;
        let ts = self.deps.tso.alloc_one().await?;
        let msg_id = self.deps.id_alloc.alloc_one().await?;
        let message = Message::new(
            msg_id,
            ts,
            self.deps.server_id,
            MsgBody::DropCollection { collection_id: info.id, collection_name: name.to_string() },
        );
        let dd_op =
            self.dd_operation(DROP_COLLECTION_DD_TYPE, &message, &info.physical_channels, name)?;

        self.meta.drop_collection(name, &dd_op).await?;
        self.deps.broker.broadcast(&info.physical_channels, &message).await?;
        self.meta.set_dd_msg_sent(true).await?;

        // Superseded index descriptors are dropped best-effort; the index
        // coordinator's recycler owns the files.
        for index in &info.field_indexes {
            if let Err(e) = self.deps.index_client.drop_index(index.index_id).await {
                warn!(index_id = index.index_id, error = %e, "drop index after collection drop failed");
            }
        }
        if let Err(e) = self.deps.proxy_invalidator.invalidate_collection_cache(name).await {
            warn!(collection = name, error = %e, "proxy cache invalidation failed");
        }

        Metrics::get().ddl_requests_total.with_label_values(&["drop_collection", "success"]).inc();
        info!(name, collection_id = info.id, "collection dropped");
        Ok(())
    }

    pub async fn create_partition(&self, collection_name: &str, partition_name: &str) -> Result<UniqueId> {
        self.ensure_healthy()?;
        Metrics::get().ddl_requests_total.with_label_values(&["create_partition", "total"]).inc();
        let lock = self.ddl_lock(collection_name);
        let _guard = lock.lock().await;

        let info = self.meta.collection_by_name(collection_name)?;
        if let Some(p) = info.partitions.iter().find(|p| p.name == partition_name) {
            return Ok(p.partition_id);
        }

        let partition_id = self.deps.id_alloc.alloc_one().await?;
        let ts = self.deps.tso.alloc_one().await?;
        let msg_id = self.deps.id_alloc.alloc_one().await?;
        let message = Message::new(
            msg_id,
            ts,
            self.deps.server_id,
            MsgBody::CreatePartition {
                collection_id: info.id,
                collection_name: collection_name.to_string(),
                partition_id,
                partition_name: partition_name.to_string(),
            },
        );
        let dd_op = self.dd_operation(
            CREATE_PARTITION_DD_TYPE,
            &message,
            &info.physical_channels,
            collection_name,
        )?;

        self.meta
            .add_partition(
                info.id,
                PartitionInfo { partition_id, name: partition_name.to_string() },
                &dd_op,
            )
            .await?;
        self.deps.broker.broadcast(&info.physical_channels, &message).await?;
        self.meta.set_dd_msg_sent(true).await?;

        if let Err(e) =
            self.deps.proxy_invalidator.invalidate_collection_cache(collection_name).await
        {
            warn!(collection = collection_name, error = %e, "proxy cache invalidation failed");
        }
        Metrics::get().ddl_requests_total.with_label_values(&["create_partition", "success"]).inc();
        Ok(partition_id)
    }

    pub async fn drop_partition(&self, collection_name: &str, partition_name: &str) -> Result<()> {
        self.ensure_healthy()?;
        Metrics::get().ddl_requests_total.with_label_values(&["drop_partition", "total"]).inc();
        let lock = self.ddl_lock(collection_name);
        let _guard = lock.lock().await;

        let info = self.meta.collection_by_name(collection_name)?;
        let partition = info
            .partitions
            .iter()
            .find(|p| p.name == partition_name)
            .ok_or_else(|| Error::NotFound(format!("partition {partition_name}")))?
            .clone();

        let ts = self.deps.tso.alloc_one().await?;
        let msg_id = self.deps.id_alloc.alloc_one().await?;
        let message = Message::new(
            msg_id,
            ts,
            self.deps.server_id,
            MsgBody::DropPartition {
                collection_id: info.id,
                collection_name: collection_name.to_string(),
                partition_id: partition.partition_id,
                partition_name: partition_name.to_string(),
            },
        );
        let dd_op = self.dd_operation(
            DROP_PARTITION_DD_TYPE,
            &message,
            &info.physical_channels,
            collection_name,
        )?;

        self.meta.drop_partition(info.id, partition_name, &dd_op).await?;
        self.deps.broker.broadcast(&info.physical_channels, &message).await?;
        self.meta.set_dd_msg_sent(true).await?;

        if let Err(e) =
            self.deps.proxy_invalidator.invalidate_collection_cache(collection_name).await
        {
            warn!(collection = collection_name, error = %e, "proxy cache invalidation failed");
        }
        Metrics::get().ddl_requests_total.with_label_values(&["drop_partition", "success"]).inc();
        Ok(())
    }

    // --- index surface ---

    /// Declare an index on a field. The same declaration returns the
    /// existing descriptor id; flushed segments are scheduled immediately.
    pub async fn create_index(
        &self,
        collection_name: &str,
        field_name: &str,
        index_name: &str,
        index_params: std::collections::HashMap<String, String>,
    ) -> Result<UniqueId> {
        self.ensure_healthy()?;
        let lock = self.ddl_lock(collection_name);
        let _guard = lock.lock().await;

        let info = self.meta.collection_by_name(collection_name)?;
        let field = info
            .schema
            .fields
            .iter()
            .find(|f| f.name == field_name)
            .ok_or_else(|| Error::NotFound(format!("field {field_name}")))?
            .clone();

        if let Some(existing) = info.field_indexes.iter().find(|i| i.field_id == field.field_id) {
            if existing.index_params == index_params {
                return Ok(existing.index_id);
            }
            return Err(Error::AlreadyExists(format!(
                "field {field_name} already indexed with different parameters"
            )));
        }

        let index_id = self.deps.id_alloc.alloc_one().await?;
        let index = IndexInfo {
            index_id,
            index_name: index_name.to_string(),
            field_id: field.field_id,
            index_params,
        };
        self.meta.add_index(info.id, index.clone()).await?;

        // Kick builds for segments that flushed before the index existed.
        let info = self.meta.collection_by_id(info.id)?;
        for partition in &info.partitions {
            let segments = self
                .deps
                .data_client
                .get_flushed_segments(info.id, partition.partition_id)
                .await?;
            for segment_id in segments {
                if let Err(e) =
                    self.build_segment_index(&info, partition.partition_id, segment_id, &index).await
                {
                    warn!(segment_id, index_id, error = %e, "index build request failed");
                }
            }
        }
        Ok(index_id)
    }

    /// Drop the index on a field. Missing descriptors are a successful no-op.
    pub async fn drop_index(&self, collection_name: &str, field_name: &str) -> Result<()> {
        self.ensure_healthy()?;
        let lock = self.ddl_lock(collection_name);
        let _guard = lock.lock().await;

        let info = self.meta.collection_by_name(collection_name)?;
        let field = info
            .schema
            .fields
            .iter()
            .find(|f| f.name == field_name)
            .ok_or_else(|| Error::NotFound(format!("field {field_name}")))?;
        let Some(index) = info.field_indexes.iter().find(|i| i.field_id == field.field_id) else {
            return Ok(());
        };

        self.deps.index_client.drop_index(index.index_id).await?;
        self.meta.remove_index(info.id, index.index_id).await?;
        Ok(())
    }

    /// Flush-done handshake from the data coordinator: request a build for
    /// every indexed field of the owning collection.
    pub async fn segment_flush_completed(
        &self,
        collection_id: UniqueId,
        partition_id: UniqueId,
        segment_id: UniqueId,
    ) -> Result<()> {
        self.ensure_healthy()?;
        let info = self.meta.collection_by_id(collection_id)?;
        for index in info.field_indexes.clone() {
            self.build_segment_index(&info, partition_id, segment_id, &index).await?;
        }
        Ok(())
    }

    async fn build_segment_index(
        &self,
        info: &CollectionInfo,
        partition_id: UniqueId,
        segment_id: UniqueId,
        index: &IndexInfo,
    ) -> Result<()> {
        if self.meta.is_segment_indexed(segment_id, index.index_id) {
            return Ok(());
        }
        let field = info
            .schema
            .field_by_id(index.field_id)
            .ok_or_else(|| Error::NotFound(format!("field {}", index.field_id)))?;

        let rows = self.deps.data_client.get_segment_num_rows(segment_id).await?;
        let mut row = SegmentIndexInfo {
            collection_id: info.id,
            partition_id,
            segment_id,
            field_id: index.field_id,
            index_id: index.index_id,
            build_id: 0,
            enable_index: false,
        };
        if rows >= self.deps.config.min_segment_rows_to_index {
            let data_paths =
                self.deps.data_client.get_binlog_paths(segment_id, index.field_id).await?;
            let build_id = self
                .deps
                .index_client
                .build_index(IndexBuildRequest {
                    index_id: index.index_id,
                    index_name: index.index_name.clone(),
                    data_paths,
                    type_params: field.type_params.clone(),
                    index_params: index.index_params.clone(),
                })
                .await?;
            row.build_id = build_id;
            row.enable_index = true;
        } else {
            debug!(segment_id, rows, "segment below index threshold");
        }
        self.meta.add_segment_index(row).await
    }

    // --- read surface ---

    pub fn describe_collection(&self, name: &str) -> Result<CollectionInfo> {
        self.ensure_healthy()?;
        self.meta.collection_by_name(name)
    }

    pub fn has_collection(&self, name: &str) -> Result<bool> {
        self.ensure_healthy()?;
        Ok(self.meta.has_collection(name))
    }

    pub fn show_collections(&self) -> Result<Vec<(String, UniqueId)>> {
        self.ensure_healthy()?;
        Ok(self.meta.list_collections())
    }

    pub fn show_partitions(&self, collection_name: &str) -> Result<Vec<PartitionInfo>> {
        self.ensure_healthy()?;
        Ok(self.meta.collection_by_name(collection_name)?.partitions)
    }

    // --- replay & loops ---

    fn dd_operation(
        &self,
        op_type: &str,
        message: &Message,
        channels: &[String],
        collection_name: &str,
    ) -> Result<DdOperation> {
        let envelope = DdEnvelope {
            message: message.clone(),
            channels: channels.to_vec(),
            collection_name: collection_name.to_string(),
        };
        Ok(DdOperation { op_type: op_type.to_string(), body: serde_json::to_string(&envelope)? })
    }

    /// Crash recovery: if the last DDL committed but its messages were never
    /// acknowledged, re-publish them (same msg-id, so consumers de-dup) and
    /// flip the sent flag.
    async fn resend_dd_msg(&self) -> Result<()> {
        match self.meta.dd_msg_sent().await? {
            None | Some(true) => {
                debug!("no unsent DDL message");
                return Ok(());
            }
            Some(false) => {}
        }
        let Some(op) = self.meta.load_dd_operation().await? else {
            return Ok(());
        };
        let envelope: DdEnvelope = serde_json::from_str(&op.body)?;

        // Prefer the channel list in current metadata; the recorded one
        // covers DropCollection, whose row is already gone.
        let channels = match self.meta.collection_by_name(&envelope.collection_name) {
            Ok(info) => info.physical_channels,
            Err(_) => envelope.channels.clone(),
        };
        info!(op_type = %op.op_type, collection = %envelope.collection_name, "replaying DDL message");
        self.deps.broker.broadcast(&channels, &envelope.message).await?;
        if op.op_type == DROP_COLLECTION_DD_TYPE
            || op.op_type == CREATE_PARTITION_DD_TYPE
            || op.op_type == DROP_PARTITION_DD_TYPE
        {
            if let Err(e) = self
                .deps
                .proxy_invalidator
                .invalidate_collection_cache(&envelope.collection_name)
                .await
            {
                warn!(error = %e, "proxy cache invalidation during replay failed");
            }
        }
        self.meta.set_dd_msg_sent(true).await
    }

    fn spawn_time_tick_loop(self: &Arc<Self>) {
        let coord = self.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        let interval = Duration::from_millis(self.deps.config.time_tick_interval_ms);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.changed() => return,
                }
                if let Err(e) = coord.send_time_tick().await {
                    error!(error = %e, "time tick emission failed");
                }
            }
        });
    }

    /// Allocate a timestamp and declare it as the watermark of every
    /// physical channel, on the dedicated tick channel and on the channels
    /// themselves.
    pub async fn send_time_tick(&self) -> Result<()> {
        let ts = self.deps.tso.alloc_one().await?;
        let channels = self.meta.list_physical_channels();
        self.chan_ticks.update(&channels, ts);

        let tick = Message::new(
            0,
            ts,
            self.deps.server_id,
            MsgBody::TimeTick {
                channels: channels.clone(),
                timestamps: vec![ts; channels.len()],
                default_timestamp: ts,
            },
        );
        self.deps
            .broker
            .publish(&self.deps.config.time_tick_channel, tick.clone())
            .await?;
        if !channels.is_empty() {
            self.deps.broker.broadcast(&channels, &tick).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::NoopProxyInvalidator;
    use crate::meta::{DataType, FieldSchema};
    use async_trait::async_trait;
    use parking_lot::Mutex as PlMutex;
    use quiver_common::config::AllocatorConfig;
    use quiver_kv::MemoryMetaKv;
    use quiver_msgstream::{Deduper, MemoryMsgBroker, MsgType};
    use std::collections::HashMap;

    pub(crate) struct MockIndexService {
        pub requests: PlMutex<Vec<IndexBuildRequest>>,
        pub dropped: PlMutex<Vec<UniqueId>>,
    }

    impl MockIndexService {
        fn new() -> Arc<Self> {
            Arc::new(Self { requests: PlMutex::new(Vec::new()), dropped: PlMutex::new(Vec::new()) })
        }
    }

    #[async_trait]
    impl IndexServiceClient for MockIndexService {
        async fn build_index(&self, req: IndexBuildRequest) -> Result<UniqueId> {
            let mut requests = self.requests.lock();
            requests.push(req);
            Ok(9000 + requests.len() as i64)
        }

        async fn drop_index(&self, index_id: UniqueId) -> Result<()> {
            self.dropped.lock().push(index_id);
            Ok(())
        }
    }

    pub(crate) struct MockDataService {
        pub flushed: PlMutex<Vec<UniqueId>>,
        pub num_rows: i64,
    }

    #[async_trait]
    impl DataServiceClient for MockDataService {
        async fn get_binlog_paths(
            &self,
            segment_id: UniqueId,
            field_id: i64,
        ) -> Result<Vec<String>> {
            Ok(vec![format!("binlogs/{segment_id}/{field_id}/0")])
        }

        async fn get_segment_num_rows(&self, _segment_id: UniqueId) -> Result<i64> {
            Ok(self.num_rows)
        }

        async fn get_flushed_segments(
            &self,
            _collection_id: UniqueId,
            _partition_id: UniqueId,
        ) -> Result<Vec<UniqueId>> {
            Ok(self.flushed.lock().clone())
        }
    }

    struct Fixture {
        kv: Arc<MemoryMetaKv>,
        broker: Arc<MemoryMsgBroker>,
        index: Arc<MockIndexService>,
        data: Arc<MockDataService>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                kv: MemoryMetaKv::new(),
                broker: MemoryMsgBroker::new(),
                index: MockIndexService::new(),
                data: Arc::new(MockDataService { flushed: PlMutex::new(Vec::new()), num_rows: 100 }),
            }
        }

        async fn coord(&self) -> Arc<RootCoord> {
            let alloc_cfg = AllocatorConfig::default();
            let deps = RootCoordDeps {
                kv: self.kv.clone(),
                broker: self.broker.clone(),
                id_alloc: Arc::new(GlobalIdAllocator::new(
                    self.kv.clone(),
                    "gid",
                    alloc_cfg.id_batch_size,
                )),
                tso: Arc::new(TsoAllocator::new(self.kv.clone(), "tso", alloc_cfg.tso_window_ms)),
                index_client: self.index.clone(),
                data_client: self.data.clone(),
                proxy_invalidator: Arc::new(NoopProxyInvalidator),
                server_id: 1,
                config: RootCoordConfig { time_tick_interval_ms: 3_600_000, ..Default::default() },
            };
            let coord = RootCoord::init(deps).await.unwrap();
            coord.start().await.unwrap();
            coord
        }
    }

    fn schema(name: &str) -> CollectionSchema {
        CollectionSchema {
            name: name.to_string(),
            description: String::new(),
            fields: vec![
                FieldSchema {
                    field_id: 0,
                    name: "id".into(),
                    data_type: DataType::Int64,
                    is_primary_key: true,
                    type_params: HashMap::new(),
                },
                FieldSchema {
                    field_id: 0,
                    name: "embedding".into(),
                    data_type: DataType::FloatVector,
                    is_primary_key: false,
                    type_params: HashMap::from([("dim".to_string(), "8".to_string())]),
                },
            ],
        }
    }

    #[tokio::test]
    async fn create_collection_publishes_on_every_channel() {
        let fx = Fixture::new();
        let coord = fx.coord().await;
        let id = coord
            .create_collection(CreateCollectionRequest { name: "docs".into(), schema: schema("docs") })
            .await
            .unwrap();

        let info = coord.describe_collection("docs").unwrap();
        assert_eq!(info.id, id);
        assert_eq!(info.physical_channels.len(), 2);
        for channel in &info.physical_channels {
            assert_eq!(fx.broker.published_count(channel), 1);
        }
        assert_eq!(fx.kv.load(crate::meta::DD_SENT_KEY).await.unwrap().as_deref(), Some("true"));
    }

    #[tokio::test]
    async fn duplicate_create_returns_existing_id() {
        let fx = Fixture::new();
        let coord = fx.coord().await;
        let req = CreateCollectionRequest { name: "docs".into(), schema: schema("docs") };
        let a = coord.create_collection(req.clone()).await.unwrap();
        let b = coord.create_collection(req).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(coord.show_collections().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn not_healthy_rejects_requests() {
        let fx = Fixture::new();
        let coord = fx.coord().await;
        coord.stop();
        let err = coord
            .create_collection(CreateCollectionRequest { name: "docs".into(), schema: schema("docs") })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Abnormal"));
    }

    #[tokio::test]
    async fn crash_before_publish_replays_exactly_once() {
        // Coordinator A commits the metadata transaction, then "crashes"
        // before publishing. A subscriber running throughout observes exactly
        // one create message after de-dup when coordinator B replays.
        let fx = Fixture::new();
        let coord_a = fx.coord().await;
        let id = coord_a
            .create_collection(CreateCollectionRequest { name: "docs".into(), schema: schema("docs") })
            .await
            .unwrap();
        let channels = coord_a.describe_collection("docs").unwrap().physical_channels;
        let mut rx = fx.broker.subscribe(&channels[..1], true);
        coord_a.stop();

        // Rewind the sent flag: the commit landed, the publish ack did not.
        fx.kv.save(crate::meta::DD_SENT_KEY, "false").await.unwrap();

        let coord_b = fx.coord().await; // start() replays
        assert_eq!(fx.kv.load(crate::meta::DD_SENT_KEY).await.unwrap().as_deref(), Some("true"));
        assert!(coord_b.has_collection("docs").unwrap());

        let mut dedup = Deduper::new();
        let mut creates = 0;
        while let Ok(Some((_, msg))) =
            tokio::time::timeout(Duration::from_millis(100), rx.recv()).await
        {
            if msg.header.msg_type == MsgType::CreateCollection && dedup.observe(msg.header.msg_id)
            {
                creates += 1;
                assert!(matches!(
                    msg.body,
                    MsgBody::CreateCollection { collection_id, .. } if collection_id == id
                ));
            }
        }
        assert_eq!(creates, 1);
    }

    #[tokio::test]
    async fn drop_collection_invalidates_and_drops_indexes() {
        let fx = Fixture::new();
        let coord = fx.coord().await;
        coord
            .create_collection(CreateCollectionRequest { name: "docs".into(), schema: schema("docs") })
            .await
            .unwrap();
        let index_id =
            coord.create_index("docs", "embedding", "emb_idx", HashMap::new()).await.unwrap();

        coord.drop_collection("docs").await.unwrap();
        assert!(!coord.has_collection("docs").unwrap());
        assert_eq!(fx.index.dropped.lock().clone(), vec![index_id]);
    }

    #[tokio::test]
    async fn flush_done_triggers_build_per_indexed_field() {
        let fx = Fixture::new();
        let coord = fx.coord().await;
        let coll_id = coord
            .create_collection(CreateCollectionRequest { name: "docs".into(), schema: schema("docs") })
            .await
            .unwrap();
        coord.create_index("docs", "embedding", "emb_idx", HashMap::new()).await.unwrap();
        let partition_id = coord.show_partitions("docs").unwrap()[0].partition_id;

        coord.segment_flush_completed(coll_id, partition_id, 555).await.unwrap();
        let requests = fx.index.requests.lock();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].data_paths, vec!["binlogs/555/101/0".to_string()]);

        drop(requests);
        // Idempotent: a duplicate flush-done does not request a second build.
        coord.segment_flush_completed(coll_id, partition_id, 555).await.unwrap();
        assert_eq!(fx.index.requests.lock().len(), 1);
    }

    #[tokio::test]
    async fn create_index_schedules_already_flushed_segments() {
        let fx = Fixture::new();
        fx.data.flushed.lock().extend([70, 71]);
        let coord = fx.coord().await;
        coord
            .create_collection(CreateCollectionRequest { name: "docs".into(), schema: schema("docs") })
            .await
            .unwrap();
        coord.create_index("docs", "embedding", "emb_idx", HashMap::new()).await.unwrap();
        assert_eq!(fx.index.requests.lock().len(), 2);
    }

    #[tokio::test]
    async fn time_tick_advances_channel_watermarks() {
        let fx = Fixture::new();
        let coord = fx.coord().await;
        coord
            .create_collection(CreateCollectionRequest { name: "docs".into(), schema: schema("docs") })
            .await
            .unwrap();
        let channels = coord.describe_collection("docs").unwrap().physical_channels;

        coord.send_time_tick().await.unwrap();
        let first = coord.channel_time_tick().get(&channels[0]).unwrap();
        coord.send_time_tick().await.unwrap();
        let second = coord.channel_time_tick().get(&channels[0]).unwrap();
        assert!(second > first);
    }
}
