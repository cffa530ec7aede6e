//! Cluster-wide identifier and timestamp allocation.
//!
//! Both allocators lease a batch from the meta store by advancing a persisted
//! high-water mark, then serve from memory. The high-water is persisted
//! *before* any value from the new lease is exposed, so no value is ever
//! issued twice — even across process restarts.

pub mod id;
pub mod tso;

pub use id::GlobalIdAllocator;
pub use tso::TsoAllocator;

use quiver_common::Result;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::warn;

/// Spawn a periodic top-off loop for an allocator.
pub fn spawn_update_loop<F, Fut>(
    name: &'static str,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
    update: F,
) where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send,
{
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = shutdown.changed() => return,
            }
            if let Err(e) = update().await {
                warn!(allocator = name, error = %e, "allocator top-off failed");
            }
        }
    });
}

/// Convenience: start top-off loops for an ID allocator and a TSO allocator
/// off one shutdown signal.
pub fn start_allocators(
    id: Arc<GlobalIdAllocator>,
    tso: Arc<TsoAllocator>,
    interval: Duration,
    shutdown: watch::Receiver<bool>,
) {
    spawn_update_loop("id", interval, shutdown.clone(), move || {
        let id = id.clone();
        async move { id.update().await }
    });
    spawn_update_loop("tso", interval, shutdown, move || {
        let tso = tso.clone();
        async move { tso.update().await }
    });
}
