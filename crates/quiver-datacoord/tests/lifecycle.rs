//! End-to-end lifecycle: create a collection, ingest, flush, index.
//!
//! Wires a real root coordinator, data coordinator, and index coordinator
//! over the in-memory meta store and broker, with doubled workers at the
//! RPC seams.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex as PlMutex;
use quiver_allocator::{GlobalIdAllocator, TsoAllocator};
use quiver_binlog::{BinlogWriter, DescriptorEvent, EventType, FileKind};
use quiver_common::config::{
    DataCoordConfig, IndexCoordConfig, RootCoordConfig, SessionConfig,
};
use quiver_common::types::{FieldId, MsgPosition, Role, StateCode, UniqueId};
use quiver_common::{Error, Result};
use quiver_datacoord::{
    DataCoord, DataCoordDeps, DataCollectionInfo, DataNodeClient, FieldBinlogPaths,
    RootCoordClient, SaveBinlogsRequest, SegmentCheckpoint, SegmentStartPosition, SegmentState,
    VchannelInfo,
};
use quiver_indexcoord::{
    BuildIndexRequest, CreateIndexRequest, IndexCoord, IndexCoordDeps, IndexMeta, IndexNodeClient,
    IndexState,
};
use quiver_kv::{BlobStore, MemoryBlobStore, MemoryMetaKv, MetaKv};
use quiver_msgstream::MemoryMsgBroker;
use quiver_rootcoord::{
    CollectionSchema, CreateCollectionRequest, DataServiceClient, DataType, FieldSchema,
    IndexBuildRequest, IndexServiceClient, RootCoord, RootCoordDeps,
};
use quiver_session::{Session, SessionRegistry};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

const PK_FIELD: FieldId = 100;
const VEC_FIELD: FieldId = 101;

/// Late-bound handle, for the coordinator construction order.
struct Late<T>(PlMutex<Option<Arc<T>>>);

impl<T> Default for Late<T> {
    fn default() -> Self {
        Self(PlMutex::new(None))
    }
}

impl<T> Late<T> {
    fn set(&self, value: Arc<T>) {
        *self.0.lock() = Some(value);
    }

    fn get(&self) -> Result<Arc<T>> {
        self.0.lock().clone().ok_or_else(|| Error::Unavailable("peer not started".into()))
    }
}

/// Root coordinator's view of the data coordinator.
struct DataService(Arc<Late<DataCoord>>);

#[async_trait]
impl DataServiceClient for DataService {
    async fn get_binlog_paths(
        &self,
        segment_id: UniqueId,
        field_id: FieldId,
    ) -> Result<Vec<String>> {
        self.0.get()?.get_binlog_paths(segment_id, field_id)
    }

    async fn get_segment_num_rows(&self, segment_id: UniqueId) -> Result<i64> {
        let info = self.0.get()?.get_segment_info(&[segment_id]);
        info[0]
            .as_ref()
            .map(|s| s.num_rows)
            .ok_or_else(|| Error::NotFound(format!("segment {segment_id}")))
    }

    async fn get_flushed_segments(
        &self,
        collection_id: UniqueId,
        partition_id: UniqueId,
    ) -> Result<Vec<UniqueId>> {
        Ok(self.0.get()?.get_flushed_segments(collection_id, partition_id))
    }
}

/// Root coordinator's view of the index coordinator.
struct IndexService(Arc<IndexCoord>);

#[async_trait]
impl IndexServiceClient for IndexService {
    async fn build_index(&self, req: IndexBuildRequest) -> Result<UniqueId> {
        self.0
            .build_index(BuildIndexRequest {
                index_id: req.index_id,
                index_name: req.index_name,
                data_paths: req.data_paths,
                type_params: req.type_params,
                index_params: req.index_params,
                unordered_paths: false,
            })
            .await
    }

    async fn drop_index(&self, index_id: UniqueId) -> Result<()> {
        self.0.drop_index(index_id).await
    }
}

/// Data coordinator's flush-done callback into the root coordinator.
struct RootService(Arc<RootCoord>);

#[async_trait]
impl RootCoordClient for RootService {
    async fn segment_flush_completed(
        &self,
        collection_id: UniqueId,
        partition_id: UniqueId,
        segment_id: UniqueId,
    ) -> Result<()> {
        self.0.segment_flush_completed(collection_id, partition_id, segment_id).await
    }
}

/// A doubled data node: persists real binlog files into the blob store and
/// reports them back through `save_binlogs_and_checkpoints`.
struct FakeDataNode {
    coord: Arc<Late<DataCoord>>,
    blob: Arc<MemoryBlobStore>,
}

#[async_trait]
impl DataNodeClient for FakeDataNode {
    async fn watch_dm_channels(&self, _channels: Vec<VchannelInfo>) -> Result<()> {
        Ok(())
    }

    async fn flush_segments(
        &self,
        collection_id: UniqueId,
        segment_ids: Vec<UniqueId>,
    ) -> Result<()> {
        let coord = self.coord.get()?;
        for segment_id in segment_ids {
            let info = coord.get_segment_info(&[segment_id])[0]
                .clone()
                .ok_or_else(|| Error::NotFound(format!("segment {segment_id}")))?;

            let mut binlogs = Vec::new();
            for field_id in [PK_FIELD, VEC_FIELD] {
                let kind = if field_id == PK_FIELD {
                    FileKind::PrimaryKeyColumn
                } else {
                    FileKind::FieldColumn
                };
                let descriptor = DescriptorEvent::new(
                    1,
                    collection_id,
                    info.partition_id,
                    segment_id,
                    1,
                    info.last_expire_ts,
                    0,
                );
                let mut writer = BinlogWriter::new(kind, 1, &descriptor, info.last_expire_ts);
                writer
                    .append(EventType::Insert, info.last_expire_ts, 1, info.last_expire_ts, b"rows")
                    .map_err(|e| Error::Unexpected(e.to_string()))?;
                let file = writer.finish().map_err(|e| Error::Unexpected(e.to_string()))?;

                let path = format!("binlogs/{segment_id}/{field_id}/0");
                self.blob.put(&path, file).await?;
                binlogs.push(FieldBinlogPaths { field_id, paths: vec![path] });
            }

            let position = MsgPosition {
                channel: info.insert_channel.clone(),
                msg_id: segment_id,
                timestamp: info.last_expire_ts,
            };
            coord
                .save_binlogs_and_checkpoints(SaveBinlogsRequest {
                    segment_id,
                    flushed: true,
                    binlogs,
                    checkpoints: vec![SegmentCheckpoint {
                        segment_id,
                        position: position.clone(),
                        num_rows: info.num_rows,
                    }],
                    start_positions: vec![SegmentStartPosition { segment_id, position }],
                })
                .await?;
        }
        Ok(())
    }
}

/// A doubled index worker: reports Finished into the meta store.
struct FakeIndexNode {
    kv: Arc<MemoryMetaKv>,
    blob: Arc<MemoryBlobStore>,
}

#[async_trait]
impl IndexNodeClient for FakeIndexNode {
    async fn create_index(&self, req: CreateIndexRequest) -> Result<()> {
        let kv = self.kv.clone();
        let blob = self.blob.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let path = format!("index_files/{}/{}/part0", req.build_id, req.version);
            blob.put(&path, Bytes::from_static(b"built")).await.unwrap();

            let raw = kv.load(&req.meta_path).await.unwrap().unwrap();
            let mut meta: IndexMeta = serde_json::from_str(&raw).unwrap();
            meta.state = IndexState::Finished;
            meta.index_file_paths = vec![path];
            kv.save(&req.meta_path, &serde_json::to_string(&meta).unwrap()).await.unwrap();
        });
        Ok(())
    }
}

struct Cluster {
    kv: Arc<MemoryMetaKv>,
    root: Arc<RootCoord>,
    data: Arc<DataCoord>,
    index: Arc<IndexCoord>,
    _workers: Vec<quiver_session::ActiveSession>,
}

async fn start_cluster() -> Cluster {
    let kv = MemoryMetaKv::new();
    let broker = MemoryMsgBroker::new();
    let blob = Arc::new(MemoryBlobStore::new());
    let registry = Arc::new(SessionRegistry::new(kv.clone(), SessionConfig::default()));

    let data_late: Arc<Late<DataCoord>> = Arc::new(Late::default());

    // Index coordinator first: the root coordinator calls into it.
    let index_kv = kv.clone();
    let index_blob = blob.clone();
    let index = IndexCoord::init(IndexCoordDeps {
        kv: kv.clone(),
        blob: blob.clone(),
        registry: registry.clone(),
        id_alloc: Arc::new(GlobalIdAllocator::new(kv.clone(), "index_gid", 100)),
        node_client_factory: Arc::new(move |_session: &Session| {
            Arc::new(FakeIndexNode { kv: index_kv.clone(), blob: index_blob.clone() })
                as Arc<dyn IndexNodeClient>
        }),
        server_id: 3,
        config: IndexCoordConfig { assign_backoff_ms: 20, ..Default::default() },
    })
    .await
    .unwrap();
    index.start().await.unwrap();

    let root = RootCoord::init(RootCoordDeps {
        kv: kv.clone(),
        broker: broker.clone(),
        id_alloc: Arc::new(GlobalIdAllocator::new(kv.clone(), "gid", 500)),
        tso: Arc::new(TsoAllocator::new(kv.clone(), "tso", 3_000)),
        index_client: Arc::new(IndexService(index.clone())),
        data_client: Arc::new(DataService(data_late.clone())),
        proxy_invalidator: Arc::new(quiver_rootcoord::clients::NoopProxyInvalidator),
        server_id: 1,
        config: RootCoordConfig { time_tick_interval_ms: 3_600_000, ..Default::default() },
    })
    .await
    .unwrap();
    root.start().await.unwrap();

    let node_late = data_late.clone();
    let node_blob = blob.clone();
    let data = DataCoord::init(DataCoordDeps {
        kv: kv.clone(),
        broker: broker.clone(),
        registry: registry.clone(),
        id_alloc: Arc::new(GlobalIdAllocator::new(kv.clone(), "segment_gid", 100)),
        root_client: Arc::new(RootService(root.clone())),
        node_client_factory: Arc::new(move |_info: &quiver_datacoord::DataNodeInfo| {
            Arc::new(FakeDataNode { coord: node_late.clone(), blob: node_blob.clone() })
                as Arc<dyn DataNodeClient>
        }),
        server_id: 2,
        config: DataCoordConfig { segment_alloc_expiration_ms: 50, ..Default::default() },
    })
    .await
    .unwrap();
    data.start().await.unwrap();
    data_late.set(data.clone());

    // Workers join the cluster.
    let data_node = registry.register(Role::DataNode, "dn1:9000").await.unwrap();
    let index_node = registry.register(Role::IndexNode, "in1:7000").await.unwrap();

    Cluster { kv, root, data, index, _workers: vec![data_node, index_node] }
}

fn vector_schema(name: &str) -> CollectionSchema {
    CollectionSchema {
        name: name.to_string(),
        description: String::new(),
        fields: vec![
            FieldSchema {
                field_id: PK_FIELD,
                name: "id".into(),
                data_type: DataType::Int64,
                is_primary_key: true,
                type_params: HashMap::new(),
            },
            FieldSchema {
                field_id: VEC_FIELD,
                name: "embedding".into(),
                data_type: DataType::FloatVector,
                is_primary_key: false,
                type_params: HashMap::from([("dim".to_string(), "8".to_string())]),
            },
        ],
    }
}

async fn wait_until<F: Fn() -> bool>(cond: F, what: &str) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn create_ingest_flush_index() {
    let cluster = start_cluster().await;

    // All three coordinators report Healthy before anything is called.
    assert_eq!(cluster.root.get_component_states().state_code, StateCode::Healthy);
    assert_eq!(cluster.data.get_component_states().state_code, StateCode::Healthy);
    assert_eq!(cluster.index.get_component_states().state_code, StateCode::Healthy);

    // Create the collection and bind it to the data plane.
    let collection_id = cluster
        .root
        .create_collection(CreateCollectionRequest {
            name: "docs".into(),
            schema: vector_schema("docs"),
        })
        .await
        .unwrap();
    let descriptor = cluster.root.describe_collection("docs").unwrap();
    let partition_id = descriptor.partitions[0].partition_id;
    cluster
        .data
        .register_collection(DataCollectionInfo {
            id: collection_id,
            partitions: vec![partition_id],
            physical_channels: descriptor.physical_channels.clone(),
        })
        .unwrap();

    let index_id = cluster
        .root
        .create_index("docs", "embedding", "emb_idx", HashMap::new())
        .await
        .unwrap();

    // Ingest: 100 rows on the first channel.
    let channel = &descriptor.physical_channels[0];
    let ts = cluster.root.alloc_timestamp(1).await.unwrap();
    let grants = cluster
        .data
        .assign_segment_id(collection_id, partition_id, channel, 100, ts)
        .await
        .unwrap();
    assert_eq!(grants.iter().map(|g| g.count).sum::<i64>(), 100);
    let segment_id = grants[0].segment_id;

    // The data node reports applied rows.
    cluster
        .data
        .save_binlogs_and_checkpoints(SaveBinlogsRequest {
            segment_id,
            flushed: false,
            binlogs: vec![],
            checkpoints: vec![SegmentCheckpoint {
                segment_id,
                position: MsgPosition { channel: channel.clone(), msg_id: 1, timestamp: ts },
                num_rows: 100,
            }],
            start_positions: vec![SegmentStartPosition {
                segment_id,
                position: MsgPosition { channel: channel.clone(), msg_id: 1, timestamp: ts },
            }],
        })
        .await
        .unwrap();

    // Seal, let the freshness window lapse, and advance the watermark.
    cluster.data.flush(collection_id).await.unwrap();
    wait_until(|| cluster.data.cluster().channel_owner(channel).is_some(), "channel owned").await;
    tokio::time::sleep(Duration::from_millis(80)).await;
    cluster.root.send_time_tick().await.unwrap();

    // Flush handshake completes and the index build reaches Finished.
    wait_until(
        || {
            cluster.data.get_segment_info(&[segment_id])[0]
                .as_ref()
                .map(|s| s.state == SegmentState::Flushed && s.num_rows == 100)
                .unwrap_or(false)
        },
        "segment flushed with 100 rows",
    )
    .await;

    let rows = cluster.root.meta().segment_index_rows(segment_id);
    assert_eq!(rows.len(), 1, "exactly one segment-index row");
    assert_eq!(rows[0].index_id, index_id);
    assert!(rows[0].enable_index);
    let build_id = rows[0].build_id;

    wait_until(
        || cluster.index.get_index_states(&[build_id])[0].1 == IndexState::Finished,
        "index build finished",
    )
    .await;

    // Exactly one non-deleted build-task row exists.
    let (build_rows, _) = cluster.kv.load_with_prefix("/meta/indexes/").await.unwrap();
    let live = build_rows
        .iter()
        .filter(|(_, raw)| {
            let meta: IndexMeta = serde_json::from_str(raw).unwrap();
            !meta.mark_deleted
        })
        .count();
    assert_eq!(live, 1);

    // Binlogs written by the data node parse as valid binlog files.
    let paths = cluster.data.get_binlog_paths(segment_id, VEC_FIELD).unwrap();
    assert_eq!(paths.len(), 1);

    cluster.root.stop();
    cluster.data.stop();
    cluster.index.stop();
}

#[tokio::test]
async fn flush_is_idempotent_and_second_tick_is_harmless() {
    let cluster = start_cluster().await;

    let collection_id = cluster
        .root
        .create_collection(CreateCollectionRequest {
            name: "events".into(),
            schema: vector_schema("events"),
        })
        .await
        .unwrap();
    let descriptor = cluster.root.describe_collection("events").unwrap();
    let partition_id = descriptor.partitions[0].partition_id;
    cluster
        .data
        .register_collection(DataCollectionInfo {
            id: collection_id,
            partitions: vec![partition_id],
            physical_channels: descriptor.physical_channels.clone(),
        })
        .unwrap();

    let channel = &descriptor.physical_channels[0];
    let ts = cluster.root.alloc_timestamp(1).await.unwrap();
    let grants = cluster
        .data
        .assign_segment_id(collection_id, partition_id, channel, 10, ts)
        .await
        .unwrap();
    let segment_id = grants[0].segment_id;

    cluster.data.flush(collection_id).await.unwrap();
    wait_until(|| cluster.data.cluster().channel_owner(channel).is_some(), "channel owned").await;
    tokio::time::sleep(Duration::from_millis(80)).await;
    cluster.root.send_time_tick().await.unwrap();

    wait_until(
        || {
            cluster.data.get_segment_info(&[segment_id])[0]
                .as_ref()
                .map(|s| s.state == SegmentState::Flushed)
                .unwrap_or(false)
        },
        "segment flushed",
    )
    .await;

    // A late duplicate flush-done and another tick change nothing.
    cluster.data.flush_completed(segment_id).unwrap();
    cluster.root.send_time_tick().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        cluster.data.get_segment_info(&[segment_id])[0].as_ref().unwrap().state,
        SegmentState::Flushed
    );

    cluster.root.stop();
    cluster.data.stop();
    cluster.index.stop();
}
