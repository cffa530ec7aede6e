//! The data coordinator core and its loops.

use crate::cluster::{Cluster, DataNodeClientFactory, DataNodeInfo};
use crate::meta::{
    FieldBinlogPaths, SegmentCheckpoint, SegmentInfo, SegmentMeta, SegmentStartPosition,
    SegmentState,
};
use crate::segment_manager::{SegmentAllocation, SegmentManager};
use async_trait::async_trait;
use parking_lot::{Mutex as PlMutex, RwLock};
use quiver_allocator::GlobalIdAllocator;
use quiver_common::config::DataCoordConfig;
use quiver_common::metrics::Metrics;
use quiver_common::retry::{retry, RetryOptions};
use quiver_common::types::{
    ComponentStates, FieldId, Role, RpcStatus, StateCode, Timestamp, UniqueId,
};
use quiver_common::{Error, Result};
use quiver_kv::MetaKv;
use quiver_msgstream::{MsgBody, MsgBroker};
use quiver_session::{SessionEvent, SessionRegistry};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Collection facts the data coordinator needs for allocation and channel
/// distribution; registered by the control plane after collection creation.
#[derive(Debug, Clone, PartialEq)]
pub struct DataCollectionInfo {
    pub id: UniqueId,
    pub partitions: Vec<UniqueId>,
    pub physical_channels: Vec<String>,
}

/// Root coordinator surface the data coordinator calls back into.
#[async_trait]
pub trait RootCoordClient: Send + Sync {
    /// Flush-done handshake; the root coordinator turns this into index
    /// builds for every indexed field.
    async fn segment_flush_completed(
        &self,
        collection_id: UniqueId,
        partition_id: UniqueId,
        segment_id: UniqueId,
    ) -> Result<()>;
}

/// Worker-side report of persisted binlogs and applied stream positions.
#[derive(Debug, Clone)]
pub struct SaveBinlogsRequest {
    pub segment_id: UniqueId,
    pub flushed: bool,
    pub binlogs: Vec<FieldBinlogPaths>,
    pub checkpoints: Vec<SegmentCheckpoint>,
    pub start_positions: Vec<SegmentStartPosition>,
}

pub struct DataCoordDeps {
    pub kv: Arc<dyn MetaKv>,
    pub broker: Arc<dyn MsgBroker>,
    pub registry: Arc<SessionRegistry>,
    pub id_alloc: Arc<GlobalIdAllocator>,
    pub root_client: Arc<dyn RootCoordClient>,
    pub node_client_factory: DataNodeClientFactory,
    pub server_id: UniqueId,
    pub config: DataCoordConfig,
}

pub struct DataCoord {
    deps: DataCoordDeps,
    meta: Arc<SegmentMeta>,
    manager: Arc<SegmentManager>,
    cluster: Arc<Cluster>,
    collections: PlMutex<HashMap<UniqueId, DataCollectionInfo>>,
    flush_tx: mpsc::UnboundedSender<UniqueId>,
    flush_rx: PlMutex<Option<mpsc::UnboundedReceiver<UniqueId>>>,
    state: RwLock<StateCode>,
    shutdown_tx: watch::Sender<bool>,
}

impl DataCoord {
    pub async fn init(deps: DataCoordDeps) -> Result<Arc<Self>> {
        let kv = deps.kv.clone();
        let meta = retry(&RetryOptions::bootstrap(), "datacoord-meta-load", || {
            let kv = kv.clone();
            async move { SegmentMeta::new(kv).await }
        })
        .await?;
        let meta = Arc::new(meta);
        deps.id_alloc.init().await?;

        let manager = Arc::new(SegmentManager::new(
            meta.clone(),
            deps.id_alloc.clone(),
            deps.config.clone(),
        ));
        let cluster = Cluster::new(
            deps.kv.clone(),
            meta.clone(),
            deps.node_client_factory.clone(),
            deps.config.clone(),
        )
        .await?;

        let (flush_tx, flush_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Arc::new(Self {
            deps,
            meta,
            manager,
            cluster,
            collections: PlMutex::new(HashMap::new()),
            flush_tx,
            flush_rx: PlMutex::new(Some(flush_rx)),
            state: RwLock::new(StateCode::Initializing),
            shutdown_tx,
        }))
    }

    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let (sessions, session_rev) = self.deps.registry.list(Role::DataNode).await?;
        let live: Vec<DataNodeInfo> = sessions
            .iter()
            .map(|s| DataNodeInfo {
                server_id: s.server_id,
                address: s.address.clone(),
                channels: Vec::new(),
            })
            .collect();
        self.cluster.startup(live, self.shutdown_tx.subscribe());

        self.spawn_session_watch_loop(session_rev + 1);
        self.spawn_tick_loop();
        self.spawn_flush_loop();

        // Segments caught mid-flush by a restart finish their handshake now.
        for segment in self.meta.flushing_segments() {
            let _ = self.flush_tx.send(segment.id);
        }

        *self.state.write() = StateCode::Healthy;
        info!(server_id = self.deps.server_id, "data coordinator started");
        Ok(())
    }

    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        *self.state.write() = StateCode::Abnormal;
    }

    pub fn get_component_states(&self) -> ComponentStates {
        ComponentStates {
            node_id: self.deps.server_id,
            role: Role::DataCoord,
            state_code: *self.state.read(),
            status: RpcStatus::success(),
        }
    }

    fn ensure_healthy(&self) -> Result<()> {
        let state = *self.state.read();
        if state != StateCode::Healthy {
            return Err(Error::Unexpected(format!("data coordinator state is {state}")));
        }
        Ok(())
    }

    pub fn cluster(&self) -> Arc<Cluster> {
        self.cluster.clone()
    }

    // --- control-plane surface ---

    /// Bind a freshly created collection: remember its shape and distribute
    /// its ingest channels across data nodes.
    pub fn register_collection(&self, info: DataCollectionInfo) -> Result<()> {
        self.ensure_healthy()?;
        for channel in &info.physical_channels {
            self.cluster.watch_channel(channel, info.id);
        }
        self.collections.lock().insert(info.id, info);
        Ok(())
    }

    /// Mark every segment of a dropped collection Dropped. Binlog files are
    /// left to the background reaper.
    pub async fn drop_collection(&self, collection_id: UniqueId) -> Result<()> {
        self.ensure_healthy()?;
        self.collections.lock().remove(&collection_id);
        for segment in self.meta.segments_of_collection(collection_id) {
            if segment.state != SegmentState::Dropped {
                self.meta.set_state(segment.id, SegmentState::Dropped).await?;
                Metrics::get().segments_total.with_label_values(&["dropped"]).inc();
            }
        }
        Ok(())
    }

    // --- ingest surface ---

    /// Grant row capacity on a channel; a single call may span several
    /// segments and the granted counts sum to `count`.
    pub async fn assign_segment_id(
        &self,
        collection_id: UniqueId,
        partition_id: UniqueId,
        channel: &str,
        count: i64,
        ts: Timestamp,
    ) -> Result<Vec<SegmentAllocation>> {
        self.ensure_healthy()?;
        {
            let collections = self.collections.lock();
            let info = collections
                .get(&collection_id)
                .ok_or_else(|| Error::NotFound(format!("collection {collection_id}")))?;
            if !info.partitions.contains(&partition_id) {
                return Err(Error::NotFound(format!("partition {partition_id}")));
            }
            if !info.physical_channels.iter().any(|c| c == channel) {
                return Err(Error::InvalidInput(format!(
                    "channel {channel} does not belong to collection {collection_id}"
                )));
            }
        }
        self.manager.assign_segment_id(collection_id, partition_id, channel, count, ts).await
    }

    /// Worker-side report of persisted binlogs; `flushed` completes the
    /// segment's flush and starts the flush-done handshake.
    pub async fn save_binlogs_and_checkpoints(&self, req: SaveBinlogsRequest) -> Result<()> {
        self.ensure_healthy()?;
        self.meta
            .save_binlogs_and_checkpoints(
                req.segment_id,
                req.flushed,
                &req.binlogs,
                &req.checkpoints,
                &req.start_positions,
            )
            .await?;
        if req.flushed {
            let _ = self.flush_tx.send(req.segment_id);
        }
        Ok(())
    }

    /// Seal every growing segment of a collection so the next time-tick can
    /// flush them.
    pub async fn flush(&self, collection_id: UniqueId) -> Result<Vec<UniqueId>> {
        self.ensure_healthy()?;
        self.manager.seal_all(collection_id).await
    }

    /// Explicit flush-done notification; idempotent for segments already
    /// Flushed.
    pub fn flush_completed(&self, segment_id: UniqueId) -> Result<()> {
        self.ensure_healthy()?;
        let _ = self.flush_tx.send(segment_id);
        Ok(())
    }

    // --- read surface ---

    pub fn get_segment_info(&self, segment_ids: &[UniqueId]) -> Vec<Option<SegmentInfo>> {
        segment_ids.iter().map(|id| self.meta.get(*id)).collect()
    }

    pub fn get_flushed_segments(
        &self,
        collection_id: UniqueId,
        partition_id: UniqueId,
    ) -> Vec<UniqueId> {
        self.meta.flushed_segments(collection_id, partition_id)
    }

    pub fn get_binlog_paths(&self, segment_id: UniqueId, field_id: FieldId) -> Result<Vec<String>> {
        let info = self
            .meta
            .get(segment_id)
            .ok_or_else(|| Error::NotFound(format!("segment {segment_id}")))?;
        Ok(info.binlogs.get(&field_id).cloned().unwrap_or_default())
    }

    // --- loops ---

    fn spawn_session_watch_loop(self: &Arc<Self>, from_revision: i64) {
        let coord = self.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut rx = self.deps.registry.watch(Role::DataNode, from_revision);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => return,
                    event = rx.recv() => {
                        let Some(event) = event else { return };
                        match event {
                            SessionEvent::Added(session) => {
                                info!(server_id = session.server_id, "data node joined");
                                coord.cluster.register(DataNodeInfo {
                                    server_id: session.server_id,
                                    address: session.address,
                                    channels: Vec::new(),
                                });
                            }
                            SessionEvent::Removed(session) => {
                                info!(server_id = session.server_id, "data node left");
                                coord.cluster.unregister(session.server_id);
                            }
                        }
                    }
                }
            }
        });
    }

    /// Consume the cluster time-tick channel; every watermark advance may
    /// turn sealed segments into flush work.
    fn spawn_tick_loop(self: &Arc<Self>) {
        let coord = self.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut rx = self
            .deps
            .broker
            .subscribe(std::slice::from_ref(&self.deps.config.time_tick_channel), false);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => return,
                    delivery = rx.recv() => {
                        let Some((_, msg)) = delivery else { return };
                        let MsgBody::TimeTick { channels, timestamps, .. } = msg.body else {
                            debug!("ignoring non-tick message on tick channel");
                            continue;
                        };
                        for (channel, ts) in channels.iter().zip(timestamps) {
                            coord.handle_channel_tick(channel, ts).await;
                        }
                    }
                }
            }
        });
    }

    async fn handle_channel_tick(&self, channel: &str, ts: Timestamp) {
        match self.meta.get_flushable(channel, ts).await {
            Ok(flushable) => {
                if !flushable.is_empty() {
                    debug!(channel, segments = flushable.len(), "segments entered Flushing");
                    self.cluster.flush(flushable);
                }
            }
            Err(e) => warn!(channel, error = %e, "collecting flushable segments failed"),
        }
        if let Err(e) = self.manager.expire_allocations(channel, ts).await {
            warn!(channel, error = %e, "expiring allocations failed");
        }
    }

    fn spawn_flush_loop(self: &Arc<Self>) {
        let coord = self.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut rx = self.flush_rx.lock().take().expect("flush loop started twice");
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => return,
                    segment_id = rx.recv() => {
                        let Some(segment_id) = segment_id else { return };
                        coord.handle_flush_completed(segment_id).await;
                    }
                }
            }
        });
    }

    async fn handle_flush_completed(self: &Arc<Self>, segment_id: UniqueId) {
        let Some(info) = self.meta.get(segment_id) else {
            warn!(segment_id, "flush-done for unknown segment discarded");
            return;
        };
        match info.state {
            SegmentState::Flushed => return, // duplicate flush-done
            SegmentState::Dropped => return,
            _ => {}
        }

        // Notify upstream first; only an acknowledged handshake moves the
        // segment to Flushed.
        if let Err(e) = self
            .deps
            .root_client
            .segment_flush_completed(info.collection_id, info.partition_id, segment_id)
            .await
        {
            warn!(segment_id, error = %e, "flush-done handshake failed, retrying");
            let tx = self.flush_tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                let _ = tx.send(segment_id);
            });
            return;
        }

        if let Err(e) = self.meta.set_state(segment_id, SegmentState::Flushed).await {
            warn!(segment_id, error = %e, "marking segment Flushed failed");
            return;
        }
        Metrics::get().segments_total.with_label_values(&["flushed"]).inc();
        info!(segment_id, "segment flush completed");
    }
}
