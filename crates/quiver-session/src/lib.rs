//! Cluster session registry.
//!
//! Every process registers a lease-bound session in the meta store and
//! watches the roles it cares about. When a lease lapses the session key
//! disappears and all watchers observe a `Removed` event; the owning process
//! observes its close signal and must exit. Re-registration always yields a
//! new server-id — identity is not stable across reconnect.

use quiver_common::config::SessionConfig;
use quiver_common::metrics::Metrics;
use quiver_common::retry::{retry, RetryOptions};
use quiver_common::types::{Role, UniqueId};
use quiver_common::{Error, Result};
use quiver_kv::{KvEventType, LeaseId, MetaKv};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

const ID_COUNTER_KEY: &str = "/sessions/id-counter";
const SESSION_PREFIX: &str = "/sessions";
const LOCK_PREFIX: &str = "/session-locks";

/// Keep-alive failures tolerated before the session is considered lost.
const KEEP_ALIVE_FAILURE_BUDGET: u32 = 3;

/// A registered process, as stored under `/sessions/<role>/<server-id>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub role: Role,
    pub server_id: UniqueId,
    pub address: String,
}

/// Membership change observed through a role watch.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Added(Session),
    Removed(Session),
}

fn session_key(role: Role, server_id: UniqueId) -> String {
    format!("{SESSION_PREFIX}/{}/{}", role.as_str(), server_id)
}

fn role_prefix(role: Role) -> String {
    format!("{SESSION_PREFIX}/{}/", role.as_str())
}

/// Registry facade over the meta store.
pub struct SessionRegistry {
    kv: Arc<dyn MetaKv>,
    config: SessionConfig,
}

impl SessionRegistry {
    pub fn new(kv: Arc<dyn MetaKv>, config: SessionConfig) -> Self {
        Self { kv, config }
    }

    /// Register a session for `role`, assigning a fresh server-id.
    ///
    /// Coordinator roles are exclusive: a second live registration fails
    /// with `AlreadyExists`. The returned handle keeps the lease alive until
    /// it is closed or the backend becomes unreachable.
    pub async fn register(&self, role: Role, address: &str) -> Result<ActiveSession> {
        let kv = self.kv.clone();
        let server_id = retry(&RetryOptions::bootstrap(), "session-register", || {
            let kv = kv.clone();
            async move { kv.incr(ID_COUNTER_KEY, 1).await }
        })
        .await?;

        let session = Session { role, server_id, address: address.to_string() };
        let value = serde_json::to_string(&session)?;
        let lease = self.kv.grant_lease(Duration::from_millis(self.config.ttl_ms)).await?;

        if role.is_exclusive() {
            let lock_key = format!("{LOCK_PREFIX}/{}", role.as_str());
            let acquired = self.kv.save_with_lease_if_absent(&lock_key, &value, lease).await?;
            if !acquired {
                self.kv.revoke_lease(lease).await?;
                return Err(Error::AlreadyExists(format!("{role} session already active")));
            }
        }

        self.kv.save_with_lease(&session_key(role, server_id), &value, lease).await?;
        info!(role = %role, server_id, address, "session registered");

        Ok(ActiveSession::start(
            self.kv.clone(),
            session,
            lease,
            Duration::from_millis(self.config.heartbeat_interval_ms),
        ))
    }

    /// Snapshot of the live sessions for `role`, plus the store revision the
    /// snapshot was taken at.
    pub async fn list(&self, role: Role) -> Result<(Vec<Session>, i64)> {
        let (pairs, revision) = self.kv.load_with_prefix(&role_prefix(role)).await?;
        let mut sessions = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            match serde_json::from_str::<Session>(&value) {
                Ok(s) => sessions.push(s),
                Err(e) => warn!(key = %key, error = %e, "discarding undecodable session record"),
            }
        }
        Ok((sessions, revision))
    }

    /// Ordered stream of join/leave events for `role`, resumable from
    /// `from_revision`.
    pub fn watch(&self, role: Role, from_revision: i64) -> mpsc::UnboundedReceiver<SessionEvent> {
        let mut kv_rx = self.kv.watch(&role_prefix(role), from_revision);
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Some(event) = kv_rx.recv().await {
                let session: Session = match serde_json::from_str(&event.value) {
                    Ok(s) => s,
                    Err(e) => {
                        warn!(key = %event.key, error = %e, "discarding undecodable session event");
                        continue;
                    }
                };
                let out = match event.event_type {
                    KvEventType::Put => {
                        Metrics::get()
                            .session_events_total
                            .with_label_values(&[role.as_str(), "added"])
                            .inc();
                        SessionEvent::Added(session)
                    }
                    KvEventType::Delete => {
                        Metrics::get()
                            .session_events_total
                            .with_label_values(&[role.as_str(), "removed"])
                            .inc();
                        SessionEvent::Removed(session)
                    }
                };
                if tx.send(out).is_err() {
                    return;
                }
            }
        });
        rx
    }
}

/// A live registration: owns the lease heartbeat and the close signal.
pub struct ActiveSession {
    session: Session,
    lease: LeaseId,
    kv: Arc<dyn MetaKv>,
    closed_rx: watch::Receiver<bool>,
    stop_tx: watch::Sender<bool>,
}

impl ActiveSession {
    fn start(
        kv: Arc<dyn MetaKv>,
        session: Session,
        lease: LeaseId,
        heartbeat_interval: Duration,
    ) -> Self {
        let (closed_tx, closed_rx) = watch::channel(false);
        let (stop_tx, mut stop_rx) = watch::channel(false);

        let hb_kv = kv.clone();
        let hb_session = session.clone();
        tokio::spawn(async move {
            let mut failures = 0u32;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(heartbeat_interval) => {}
                    _ = stop_rx.changed() => return,
                }
                match hb_kv.keep_alive(lease).await {
                    Ok(()) => failures = 0,
                    Err(e) => {
                        failures += 1;
                        warn!(
                            role = %hb_session.role,
                            server_id = hb_session.server_id,
                            failures,
                            error = %e,
                            "session keep-alive failed"
                        );
                        if failures >= KEEP_ALIVE_FAILURE_BUDGET {
                            // The cluster considers this process dead; tell
                            // the owner to exit.
                            let _ = closed_tx.send(true);
                            return;
                        }
                    }
                }
            }
        });

        Self { session, lease, kv, closed_rx, stop_tx }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn server_id(&self) -> UniqueId {
        self.session.server_id
    }

    /// Channel that flips to `true` once the lease is lost. The owning
    /// process must terminate when this fires.
    pub fn closed(&self) -> watch::Receiver<bool> {
        self.closed_rx.clone()
    }

    /// Graceful deregistration: stop the heartbeat and revoke the lease,
    /// publishing the delete event to watchers.
    pub async fn close(self) -> Result<()> {
        let _ = self.stop_tx.send(true);
        self.kv.revoke_lease(self.lease).await?;
        debug!(role = %self.session.role, server_id = self.session.server_id, "session closed");
        Ok(())
    }
}
