//! The index coordinator core and its four loops.

use crate::meta_table::{BuildIndexRequest, IndexState, MetaTable, INDEX_META_PREFIX};
use crate::node_tasks::NodeTasks;
use crate::priority_queue::PriorityQueue;
use async_trait::async_trait;
use parking_lot::{Mutex as PlMutex, RwLock};
use quiver_allocator::GlobalIdAllocator;
use quiver_common::config::IndexCoordConfig;
use quiver_common::metrics::Metrics;
use quiver_common::retry::{retry, RetryOptions};
use quiver_common::types::{ComponentStates, Role, RpcStatus, StateCode, UniqueId};
use quiver_common::{Error, Result};
use quiver_kv::{BlobStore, KvEventType, MetaKv};
use quiver_session::{Session, SessionEvent, SessionRegistry};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

/// Build dispatch handed to an index worker.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateIndexRequest {
    pub build_id: UniqueId,
    pub version: i64,
    /// Meta-store row the worker writes its progress into.
    pub meta_path: String,
    pub data_paths: Vec<String>,
    pub type_params: HashMap<String, String>,
    pub index_params: HashMap<String, String>,
    pub index_id: UniqueId,
    pub index_name: String,
}

/// Worker-facing RPC surface.
#[async_trait]
pub trait IndexNodeClient: Send + Sync {
    async fn create_index(&self, req: CreateIndexRequest) -> Result<()>;
}

/// Resolves a client from a worker session; injected so tests can double it.
pub type IndexNodeClientFactory =
    Arc<dyn Fn(&Session) -> Arc<dyn IndexNodeClient> + Send + Sync>;

pub struct IndexCoordDeps {
    pub kv: Arc<dyn MetaKv>,
    pub blob: Arc<dyn BlobStore>,
    pub registry: Arc<SessionRegistry>,
    pub id_alloc: Arc<GlobalIdAllocator>,
    pub node_client_factory: IndexNodeClientFactory,
    pub server_id: UniqueId,
    pub config: IndexCoordConfig,
}

#[derive(Default)]
struct NodeSet {
    queue: PriorityQueue,
    clients: HashMap<UniqueId, Arc<dyn IndexNodeClient>>,
}

pub struct IndexCoord {
    deps: IndexCoordDeps,
    meta: Arc<MetaTable>,
    meta_revision: i64,
    nodes: PlMutex<NodeSet>,
    node_tasks: PlMutex<NodeTasks>,
    assign_tx: mpsc::UnboundedSender<UniqueId>,
    assign_rx: PlMutex<Option<mpsc::UnboundedReceiver<UniqueId>>>,
    /// Serializes the fingerprint-check-then-insert of `build_index`.
    build_lock: Mutex<()>,
    state: RwLock<StateCode>,
    shutdown_tx: watch::Sender<bool>,
}

fn index_file_root(build_id: UniqueId) -> String {
    format!("index_files/{build_id}/")
}

fn index_file_version_dir(build_id: UniqueId, version: i64) -> String {
    format!("index_files/{build_id}/{version}/")
}

impl IndexCoord {
    pub async fn init(deps: IndexCoordDeps) -> Result<Arc<Self>> {
        let kv = deps.kv.clone();
        let (meta, meta_revision) = retry(&RetryOptions::bootstrap(), "indexcoord-meta-load", || {
            let kv = kv.clone();
            async move { MetaTable::new(kv).await }
        })
        .await?;
        deps.id_alloc.init().await?;

        let (assign_tx, assign_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, _) = watch::channel(false);
        Ok(Arc::new(Self {
            deps,
            meta: Arc::new(meta),
            meta_revision,
            nodes: PlMutex::new(NodeSet::default()),
            node_tasks: PlMutex::new(NodeTasks::new()),
            assign_tx,
            assign_rx: PlMutex::new(Some(assign_rx)),
            build_lock: Mutex::new(()),
            state: RwLock::new(StateCode::Initializing),
            shutdown_tx,
        }))
    }

    /// Discover live workers, re-queue unfinished builds, start the loops.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let (sessions, session_rev) = self.deps.registry.list(Role::IndexNode).await?;
        for session in &sessions {
            self.add_node(session);
        }

        let live: Vec<UniqueId> = sessions.iter().map(|s| s.server_id).collect();
        for build_id in self.meta.get_unassigned(&live) {
            let _ = self.assign_tx.send(build_id);
        }

        self.spawn_assignment_loop();
        self.spawn_meta_watch_loop();
        self.spawn_node_watch_loop(session_rev + 1);
        self.spawn_recycle_loop();

        let id_alloc = self.deps.id_alloc.clone();
        quiver_allocator::spawn_update_loop(
            "index_gid",
            Duration::from_millis(50),
            self.shutdown_tx.subscribe(),
            move || {
                let id_alloc = id_alloc.clone();
                async move { id_alloc.update().await }
            },
        );

        *self.state.write() = StateCode::Healthy;
        info!(server_id = self.deps.server_id, workers = sessions.len(), "index coordinator started");
        Ok(())
    }

    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        *self.state.write() = StateCode::Abnormal;
    }

    pub fn get_component_states(&self) -> ComponentStates {
        ComponentStates {
            node_id: self.deps.server_id,
            role: Role::IndexCoord,
            state_code: *self.state.read(),
            status: RpcStatus::success(),
        }
    }

    fn ensure_healthy(&self) -> Result<()> {
        let state = *self.state.read();
        if state != StateCode::Healthy {
            return Err(Error::Unexpected(format!("index coordinator state is {state}")));
        }
        Ok(())
    }

    // --- public surface ---

    /// Queue a build. Idempotent on the request fingerprint: an existing
    /// non-deleted task wins and its build-id is returned.
    pub async fn build_index(&self, req: BuildIndexRequest) -> Result<UniqueId> {
        self.ensure_healthy()?;
        let _guard = self.build_lock.lock().await;

        if let Some(existing) = self.meta.has_same_req(&req) {
            debug!(build_id = existing, "identical build request already known");
            return Ok(existing);
        }
        let build_id = self.deps.id_alloc.alloc_one().await?;
        self.meta.add(build_id, req, 0).await?;
        Metrics::get().index_tasks_total.with_label_values(&["queued"]).inc();
        self.assign_tx
            .send(build_id)
            .map_err(|_| Error::Unexpected("assignment channel closed".into()))?;
        Ok(build_id)
    }

    pub fn get_index_states(&self, build_ids: &[UniqueId]) -> Vec<(UniqueId, IndexState, String)> {
        self.meta.get_states(build_ids)
    }

    pub fn get_index_file_paths(&self, build_ids: &[UniqueId]) -> Result<Vec<Vec<String>>> {
        build_ids.iter().map(|id| self.meta.get_index_file_paths(*id)).collect()
    }

    /// Mark every build of `index_id` deleted. A second call is a no-op.
    pub async fn drop_index(&self, index_id: UniqueId) -> Result<()> {
        self.ensure_healthy()?;
        let builds = self.meta.mark_as_deleted(index_id).await?;
        if !builds.is_empty() {
            Metrics::get()
                .index_tasks_total
                .with_label_values(&["dropped"])
                .inc_by(builds.len() as u64);
        }
        Ok(())
    }

    // --- node management ---

    fn add_node(&self, session: &Session) {
        let client = (self.deps.node_client_factory)(session);
        let load = self.node_tasks.lock().tasks_of(session.server_id).len();
        let mut nodes = self.nodes.lock();
        nodes.queue.push(session.server_id, session.address.clone(), load);
        nodes.clients.insert(session.server_id, client);
        info!(server_id = session.server_id, address = %session.address, "index node added");
    }

    fn remove_node(&self, server_id: UniqueId) {
        {
            let mut nodes = self.nodes.lock();
            nodes.queue.remove(server_id);
            nodes.clients.remove(&server_id);
        }
        let orphans = self.node_tasks.lock().remove_node(server_id);
        if !orphans.is_empty() {
            warn!(server_id, builds = orphans.len(), "re-queueing builds from lost index node");
            Metrics::get()
                .index_tasks_total
                .with_label_values(&["requeued"])
                .inc_by(orphans.len() as u64);
        }
        for build_id in orphans {
            let _ = self.assign_tx.send(build_id);
        }
    }

    // --- loops ---

    fn spawn_assignment_loop(self: &Arc<Self>) {
        let coord = self.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut rx = self.assign_rx.lock().take().expect("assignment loop started twice");
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => return,
                    build_id = rx.recv() => match build_id {
                        Some(build_id) => coord.handle_assignment(build_id).await,
                        None => return,
                    },
                }
            }
        });
    }

    async fn handle_assignment(self: &Arc<Self>, build_id: UniqueId) {
        let Some(meta) = self.meta.get(build_id) else {
            return;
        };
        if meta.state == IndexState::Finished || meta.mark_deleted {
            return;
        }
        let version = match self.meta.update_version(build_id).await {
            Ok(v) => v,
            Err(e) => {
                warn!(build_id, error = %e, "version bump failed");
                return;
            }
        };

        let picked = {
            let nodes = self.nodes.lock();
            nodes
                .queue
                .peek()
                .map(|item| (item.server_id, nodes.clients[&item.server_id].clone()))
        };
        let Some((node_id, client)) = picked else {
            debug!(build_id, "no index node available, re-queueing");
            self.requeue_later(build_id);
            return;
        };

        {
            self.node_tasks.lock().assign(node_id, build_id);
            self.nodes.lock().queue.inc_priority(node_id, 1);
        }

        let req = CreateIndexRequest {
            build_id,
            version,
            meta_path: format!("{INDEX_META_PREFIX}{build_id}"),
            data_paths: meta.req.data_paths.clone(),
            type_params: meta.req.type_params.clone(),
            index_params: meta.req.index_params.clone(),
            index_id: meta.req.index_id,
            index_name: meta.req.index_name.clone(),
        };
        let deadline = Duration::from_millis(self.deps.config.build_rpc_timeout_ms);
        let timer = Metrics::get().worker_rpc_latency.with_label_values(&["create_index"]).start_timer();
        let outcome = match tokio::time::timeout(deadline, client.create_index(req)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(Error::Timeout(format!("create_index on node {node_id}"))),
        };
        timer.observe_duration();

        match outcome {
            Ok(()) => {
                if let Err(e) = self.meta.assign(build_id, node_id).await {
                    warn!(build_id, error = %e, "recording assignment failed");
                }
                Metrics::get().index_tasks_total.with_label_values(&["assigned"]).inc();
                debug!(build_id, node_id, version, "build dispatched");
            }
            Err(e) => {
                warn!(build_id, node_id, error = %e, "build dispatch failed, re-queueing");
                self.node_tasks.lock().unassign(node_id, build_id);
                self.nodes.lock().queue.dec_priority(node_id, 1);
                self.requeue_later(build_id);
            }
        }
    }

    fn requeue_later(self: &Arc<Self>, build_id: UniqueId) {
        let tx = self.assign_tx.clone();
        let backoff = Duration::from_millis(self.deps.config.assign_backoff_ms);
        tokio::spawn(async move {
            tokio::time::sleep(backoff).await;
            let _ = tx.send(build_id);
        });
    }

    fn spawn_meta_watch_loop(self: &Arc<Self>) {
        let coord = self.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut rx = self.deps.kv.watch(INDEX_META_PREFIX, self.meta_revision + 1);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => return,
                    event = rx.recv() => {
                        let Some(event) = event else { return };
                        match event.event_type {
                            KvEventType::Put => coord.handle_meta_put(&event.value),
                            KvEventType::Delete => {
                                if let Some(id) = event.key.strip_prefix(INDEX_META_PREFIX) {
                                    if let Ok(build_id) = id.parse::<UniqueId>() {
                                        coord.meta.apply_removed(build_id);
                                    }
                                }
                            }
                        }
                    }
                }
            }
        });
    }

    fn handle_meta_put(self: &Arc<Self>, raw: &str) {
        let Some(meta) = self.meta.apply_watched(raw) else {
            return;
        };
        match meta.state {
            IndexState::Finished => {
                let node = self.node_tasks.lock().finish(meta.build_id);
                if let Some(node) = node {
                    self.nodes.lock().queue.dec_priority(node, 1);
                }
                Metrics::get().index_tasks_total.with_label_values(&["finished"]).inc();
                info!(build_id = meta.build_id, version = meta.version, "index build finished");
            }
            IndexState::Failed => {
                let node = self.node_tasks.lock().finish(meta.build_id);
                if let Some(node) = node {
                    self.nodes.lock().queue.dec_priority(node, 1);
                }
                Metrics::get().index_tasks_total.with_label_values(&["failed"]).inc();
                warn!(
                    build_id = meta.build_id,
                    reason = %meta.fail_reason,
                    "index build failed, re-queueing"
                );
                let _ = self.assign_tx.send(meta.build_id);
            }
            _ => {}
        }
    }

    fn spawn_node_watch_loop(self: &Arc<Self>, from_revision: i64) {
        let coord = self.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        let mut rx = coord.deps.registry.watch(Role::IndexNode, from_revision);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => return,
                    event = rx.recv() => {
                        let Some(event) = event else { return };
                        match event {
                            SessionEvent::Added(session) => coord.add_node(&session),
                            SessionEvent::Removed(session) => coord.remove_node(session.server_id),
                        }
                    }
                }
            }
        });
    }

    fn spawn_recycle_loop(self: &Arc<Self>) {
        let coord = self.clone();
        let mut shutdown = self.shutdown_tx.subscribe();
        let interval = Duration::from_millis(self.deps.config.recycle_interval_ms);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    _ = shutdown.changed() => return,
                }
                coord.recycle_unused().await;
            }
        });
    }

    /// One recycler sweep, bounded by the configured batch limit.
    pub async fn recycle_unused(&self) {
        for meta in self.meta.get_unused(self.deps.config.recycle_limit) {
            if meta.mark_deleted {
                // Drop every version, then the row itself.
                if let Err(e) = self.deps.blob.remove_with_prefix(&index_file_root(meta.build_id)).await
                {
                    warn!(build_id = meta.build_id, error = %e, "recycling index files failed");
                    continue;
                }
                if let Err(e) = self.meta.delete(meta.build_id).await {
                    warn!(build_id = meta.build_id, error = %e, "deleting index meta failed");
                }
            } else {
                // Superseded versions 1..version are garbage.
                let mut all_removed = true;
                for version in 1..meta.version {
                    if let Err(e) = self
                        .deps
                        .blob
                        .remove_with_prefix(&index_file_version_dir(meta.build_id, version))
                        .await
                    {
                        warn!(build_id = meta.build_id, version, error = %e, "recycling version failed");
                        all_removed = false;
                    }
                }
                if all_removed {
                    if let Err(e) = self.meta.set_recycled(meta.build_id).await {
                        warn!(build_id = meta.build_id, error = %e, "setting recycled flag failed");
                    }
                }
            }
        }
    }
}
