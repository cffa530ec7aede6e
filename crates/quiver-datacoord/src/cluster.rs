//! Data-node cluster: channel distribution and flush dispatch.
//!
//! Each ingest channel is bound to exactly one data node. Bindings carry a
//! watch state: `Uncomplete` until the node acknowledges a
//! `WatchDmChannels` RPC, `Complete` after. Channels with no assignable
//! node sit in a buffer that drains the moment a node joins.

use crate::meta::{SegmentInfo, SegmentMeta};
use async_trait::async_trait;
use parking_lot::Mutex as PlMutex;
use quiver_common::config::DataCoordConfig;
use quiver_common::metrics::Metrics;
use quiver_common::types::{MsgPosition, UniqueId};
use quiver_common::{Error, Result};
use quiver_kv::MetaKv;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

pub const CLUSTER_NODE_PREFIX: &str = "/meta/cluster/nodes/";
pub const CLUSTER_BUFFER_KEY: &str = "/meta/cluster/buffer";

#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub enum ChannelWatchState {
    Uncomplete,
    Complete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelStatus {
    pub name: String,
    pub collection_id: UniqueId,
    pub state: ChannelWatchState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataNodeInfo {
    pub server_id: UniqueId,
    pub address: String,
    #[serde(default)]
    pub channels: Vec<ChannelStatus>,
}

/// Channel description shipped in a `WatchDmChannels` RPC.
#[derive(Debug, Clone, PartialEq)]
pub struct VchannelInfo {
    pub collection_id: UniqueId,
    pub channel: String,
    pub seek_position: Option<MsgPosition>,
}

/// Worker-facing RPC surface of a data node.
#[async_trait]
pub trait DataNodeClient: Send + Sync {
    async fn watch_dm_channels(&self, channels: Vec<VchannelInfo>) -> Result<()>;

    async fn flush_segments(
        &self,
        collection_id: UniqueId,
        segment_ids: Vec<UniqueId>,
    ) -> Result<()>;
}

pub type DataNodeClientFactory = Arc<dyn Fn(&DataNodeInfo) -> Arc<dyn DataNodeClient> + Send + Sync>;

enum ClusterEvent {
    Register(DataNodeInfo),
    Unregister(UniqueId),
    WatchChannel { channel: String, collection_id: UniqueId },
    /// (Re-)issue the watch RPC for a node's Uncomplete bindings.
    WatchNode(UniqueId),
    Flush(Vec<SegmentInfo>),
}

#[derive(Default)]
struct ClusterState {
    nodes: HashMap<UniqueId, DataNodeInfo>,
    clients: HashMap<UniqueId, Arc<dyn DataNodeClient>>,
    buffer: Vec<ChannelStatus>,
}

impl ClusterState {
    fn least_loaded(&self) -> Option<UniqueId> {
        self.nodes
            .values()
            .min_by(|a, b| {
                a.channels.len().cmp(&b.channels.len()).then(a.server_id.cmp(&b.server_id))
            })
            .map(|n| n.server_id)
    }

    fn owner_of(&self, channel: &str) -> Option<UniqueId> {
        self.nodes
            .values()
            .find(|n| n.channels.iter().any(|c| c.name == channel))
            .map(|n| n.server_id)
    }

    fn knows_channel(&self, channel: &str) -> bool {
        self.owner_of(channel).is_some() || self.buffer.iter().any(|c| c.name == channel)
    }
}

pub struct Cluster {
    kv: Arc<dyn MetaKv>,
    meta: Arc<SegmentMeta>,
    factory: DataNodeClientFactory,
    config: DataCoordConfig,
    state: PlMutex<ClusterState>,
    event_tx: mpsc::UnboundedSender<ClusterEvent>,
    event_rx: PlMutex<Option<mpsc::UnboundedReceiver<ClusterEvent>>>,
}

impl Cluster {
    pub async fn new(
        kv: Arc<dyn MetaKv>,
        meta: Arc<SegmentMeta>,
        factory: DataNodeClientFactory,
        config: DataCoordConfig,
    ) -> Result<Arc<Self>> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let cluster = Arc::new(Self {
            kv,
            meta,
            factory,
            config,
            state: PlMutex::new(ClusterState::default()),
            event_tx,
            event_rx: PlMutex::new(Some(event_rx)),
        });
        cluster.load_from_kv().await?;
        Ok(cluster)
    }

    async fn load_from_kv(&self) -> Result<()> {
        let (pairs, _) = self.kv.load_with_prefix(CLUSTER_NODE_PREFIX).await?;
        let mut state = self.state.lock();
        for (key, value) in pairs {
            match serde_json::from_str::<DataNodeInfo>(&value) {
                Ok(info) => {
                    let client = (self.factory)(&info);
                    state.clients.insert(info.server_id, client);
                    state.nodes.insert(info.server_id, info);
                }
                Err(e) => warn!(key = %key, error = %e, "skipping undecodable data node row"),
            }
        }
        drop(state);
        if let Some(raw) = self.kv.load(CLUSTER_BUFFER_KEY).await? {
            match serde_json::from_str::<Vec<ChannelStatus>>(&raw) {
                Ok(buffer) => self.state.lock().buffer = buffer,
                Err(e) => warn!(error = %e, "skipping undecodable channel buffer"),
            }
        }
        Ok(())
    }

    /// Reconcile restored nodes against the live session set, then start the
    /// event loop.
    pub fn startup(self: &Arc<Self>, live: Vec<DataNodeInfo>, shutdown: watch::Receiver<bool>) {
        self.spawn_event_loop(shutdown);

        let (new_nodes, offline): (Vec<DataNodeInfo>, Vec<UniqueId>) = {
            let state = self.state.lock();
            let known: Vec<UniqueId> = state.nodes.keys().copied().collect();
            let new_nodes =
                live.iter().filter(|n| !known.contains(&n.server_id)).cloned().collect();
            let live_ids: Vec<UniqueId> = live.iter().map(|n| n.server_id).collect();
            let offline = known.into_iter().filter(|id| !live_ids.contains(id)).collect();
            (new_nodes, offline)
        };

        // Restored nodes may still carry Uncomplete bindings from before the
        // restart; re-issue their watches.
        for id in self.state.lock().nodes.keys().copied().collect::<Vec<_>>() {
            let _ = self.event_tx.send(ClusterEvent::WatchNode(id));
        }
        for node in new_nodes {
            self.register(node);
        }
        for id in offline {
            self.unregister(id);
        }
    }

    pub fn register(&self, node: DataNodeInfo) {
        let _ = self.event_tx.send(ClusterEvent::Register(node));
    }

    pub fn unregister(&self, server_id: UniqueId) {
        let _ = self.event_tx.send(ClusterEvent::Unregister(server_id));
    }

    pub fn watch_channel(&self, channel: &str, collection_id: UniqueId) {
        let _ = self.event_tx.send(ClusterEvent::WatchChannel {
            channel: channel.to_string(),
            collection_id,
        });
    }

    pub fn flush(&self, segments: Vec<SegmentInfo>) {
        let _ = self.event_tx.send(ClusterEvent::Flush(segments));
    }

    // --- test/introspection surface ---

    pub fn nodes(&self) -> Vec<DataNodeInfo> {
        self.state.lock().nodes.values().cloned().collect()
    }

    pub fn buffered_channels(&self) -> Vec<ChannelStatus> {
        self.state.lock().buffer.clone()
    }

    pub fn channel_owner(&self, channel: &str) -> Option<UniqueId> {
        self.state.lock().owner_of(channel)
    }

    // --- event loop ---

    fn spawn_event_loop(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let cluster = self.clone();
        let mut rx = self.event_rx.lock().take().expect("cluster event loop started twice");
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => return,
                    event = rx.recv() => {
                        let Some(event) = event else { return };
                        cluster.handle_event(event).await;
                    }
                }
            }
        });
    }

    async fn handle_event(self: &Arc<Self>, event: ClusterEvent) {
        match event {
            ClusterEvent::Register(node) => self.handle_register(node).await,
            ClusterEvent::Unregister(id) => self.handle_unregister(id).await,
            ClusterEvent::WatchChannel { channel, collection_id } => {
                self.handle_watch_channel(channel, collection_id).await
            }
            ClusterEvent::WatchNode(id) => self.issue_watch(id).await,
            ClusterEvent::Flush(segments) => self.handle_flush(segments).await,
        }
    }

    /// A node joined: hand it the buffered channels, then pull channels off
    /// overloaded peers until the distribution is balanced.
    async fn handle_register(self: &Arc<Self>, mut node: DataNodeInfo) {
        let mut changed = Vec::new();
        {
            let mut state = self.state.lock();
            for mut status in state.buffer.drain(..) {
                status.state = ChannelWatchState::Uncomplete;
                node.channels.push(status);
            }

            // Unregister-then-watch dance: move channels from the most
            // loaded peer while the imbalance exceeds one.
            loop {
                let Some(donor_id) = state
                    .nodes
                    .values()
                    .max_by_key(|n| n.channels.len())
                    .filter(|n| n.channels.len() > node.channels.len() + 1)
                    .map(|n| n.server_id)
                else {
                    break;
                };
                let donor = state.nodes.get_mut(&donor_id).expect("donor present");
                let mut moved = donor.channels.pop().expect("donor has channels");
                moved.state = ChannelWatchState::Uncomplete;
                node.channels.push(moved);
                if !changed.contains(&donor_id) {
                    changed.push(donor_id);
                }
            }

            let client = (self.factory)(&node);
            state.clients.insert(node.server_id, client);
            changed.push(node.server_id);
            state.nodes.insert(node.server_id, node.clone());
            Metrics::get().data_nodes.with_label_values(&["online"]).set(state.nodes.len() as i64);
        }
        info!(server_id = node.server_id, address = %node.address, "data node registered");

        if let Err(e) = self.persist().await {
            warn!(error = %e, "persisting cluster state failed");
        }
        for id in changed {
            self.issue_watch(id).await;
        }
    }

    /// A node left: re-home its channels, or buffer them when it was the
    /// last node standing.
    async fn handle_unregister(self: &Arc<Self>, server_id: UniqueId) {
        let mut changed = Vec::new();
        {
            let mut state = self.state.lock();
            let Some(dead) = state.nodes.remove(&server_id) else {
                return;
            };
            state.clients.remove(&server_id);

            if state.nodes.is_empty() {
                for mut status in dead.channels {
                    status.state = ChannelWatchState::Uncomplete;
                    state.buffer.push(status);
                }
            } else {
                for mut status in dead.channels {
                    status.state = ChannelWatchState::Uncomplete;
                    let target = state.least_loaded().expect("nodes non-empty");
                    state.nodes.get_mut(&target).expect("target present").channels.push(status);
                    if !changed.contains(&target) {
                        changed.push(target);
                    }
                }
            }
            Metrics::get().data_nodes.with_label_values(&["online"]).set(state.nodes.len() as i64);
        }
        info!(server_id, "data node unregistered");

        if let Err(e) = self.persist().await {
            warn!(error = %e, "persisting cluster state failed");
        }
        for id in changed {
            self.issue_watch(id).await;
        }
    }

    /// A collection bound a new ingest channel.
    async fn handle_watch_channel(self: &Arc<Self>, channel: String, collection_id: UniqueId) {
        let target = {
            let mut state = self.state.lock();
            if state.knows_channel(&channel) {
                return;
            }
            let status = ChannelStatus {
                name: channel.clone(),
                collection_id,
                state: ChannelWatchState::Uncomplete,
            };
            match state.least_loaded() {
                Some(id) => {
                    state.nodes.get_mut(&id).expect("node present").channels.push(status);
                    Some(id)
                }
                None => {
                    debug!(channel = %channel, "no data node, buffering channel");
                    state.buffer.push(status);
                    None
                }
            }
        };
        if let Err(e) = self.persist().await {
            warn!(error = %e, "persisting cluster state failed");
        }
        if let Some(id) = target {
            self.issue_watch(id).await;
        }
    }

    /// Send `WatchDmChannels` for every Uncomplete binding of a node; mark
    /// them Complete only on ack, retry on failure.
    async fn issue_watch(self: &Arc<Self>, server_id: UniqueId) {
        let (client, uncomplete) = {
            let state = self.state.lock();
            let Some(node) = state.nodes.get(&server_id) else {
                return;
            };
            let uncomplete: Vec<ChannelStatus> = node
                .channels
                .iter()
                .filter(|c| c.state == ChannelWatchState::Uncomplete)
                .cloned()
                .collect();
            (state.clients.get(&server_id).cloned(), uncomplete)
        };
        if uncomplete.is_empty() {
            return;
        }
        let Some(client) = client else {
            return;
        };

        let infos: Vec<VchannelInfo> = uncomplete
            .iter()
            .map(|c| VchannelInfo {
                collection_id: c.collection_id,
                channel: c.name.clone(),
                seek_position: self.meta.channel_seek_position(&c.name),
            })
            .collect();

        let deadline = Duration::from_millis(self.config.control_rpc_timeout_ms);
        let timer =
            Metrics::get().worker_rpc_latency.with_label_values(&["watch_dm_channels"]).start_timer();
        let outcome = match tokio::time::timeout(deadline, client.watch_dm_channels(infos)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::Timeout(format!("watch_dm_channels on node {server_id}"))),
        };
        timer.observe_duration();

        match outcome {
            Ok(()) => {
                {
                    let mut state = self.state.lock();
                    if let Some(node) = state.nodes.get_mut(&server_id) {
                        for channel in node.channels.iter_mut() {
                            if uncomplete.iter().any(|c| c.name == channel.name) {
                                channel.state = ChannelWatchState::Complete;
                            }
                        }
                    }
                }
                debug!(server_id, channels = uncomplete.len(), "channel watch acknowledged");
                if let Err(e) = self.persist().await {
                    warn!(error = %e, "persisting cluster state failed");
                }
            }
            Err(e) => {
                warn!(server_id, error = %e, "channel watch failed, will retry");
                let tx = self.event_tx.clone();
                let backoff = Duration::from_millis(self.config.watch_retry_ms);
                tokio::spawn(async move {
                    tokio::time::sleep(backoff).await;
                    let _ = tx.send(ClusterEvent::WatchNode(server_id));
                });
            }
        }
    }

    /// Route flush commands to the nodes owning each segment's channel.
    async fn handle_flush(self: &Arc<Self>, segments: Vec<SegmentInfo>) {
        // channel -> collection -> segment ids
        let mut grouped: HashMap<String, HashMap<UniqueId, Vec<UniqueId>>> = HashMap::new();
        for segment in &segments {
            grouped
                .entry(segment.insert_channel.clone())
                .or_default()
                .entry(segment.collection_id)
                .or_default()
                .push(segment.id);
        }

        for (channel, by_collection) in grouped {
            let client = {
                let state = self.state.lock();
                state.owner_of(&channel).and_then(|id| state.clients.get(&id).cloned())
            };
            let Some(client) = client else {
                warn!(channel = %channel, "no owner for channel, dropping flush command");
                continue;
            };
            for (collection_id, segment_ids) in by_collection {
                let deadline = Duration::from_millis(self.config.control_rpc_timeout_ms);
                let outcome = tokio::time::timeout(
                    deadline,
                    client.flush_segments(collection_id, segment_ids.clone()),
                )
                .await;
                match outcome {
                    Ok(Ok(())) => {
                        debug!(channel = %channel, collection_id, segments = segment_ids.len(), "flush dispatched")
                    }
                    Ok(Err(e)) => warn!(channel = %channel, error = %e, "flush dispatch failed"),
                    Err(_) => warn!(channel = %channel, "flush dispatch timed out"),
                }
            }
        }
    }

    /// Persist the whole node set and buffer in one transaction.
    async fn persist(&self) -> Result<()> {
        let (saves, buffer) = {
            let state = self.state.lock();
            let mut saves = HashMap::new();
            for node in state.nodes.values() {
                saves.insert(
                    format!("{CLUSTER_NODE_PREFIX}{}", node.server_id),
                    serde_json::to_string(node)?,
                );
            }
            (saves, serde_json::to_string(&state.buffer)?)
        };
        let mut all = saves;
        all.insert(CLUSTER_BUFFER_KEY.to_string(), buffer);
        self.kv.multi_save(all).await?;
        Ok(())
    }
}
