//! Hybrid logical timestamps with a crash-safe high-water mark.

use quiver_common::metrics::Metrics;
use quiver_common::tsoutil::{compose_ts, now_ms, parse_ts, physical_ms, MAX_LOGICAL};
use quiver_common::types::Timestamp;
use quiver_common::{Error, Result};
use quiver_kv::MetaKv;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

const LEASE_CAS_BUDGET: u32 = 32;

struct TsoState {
    /// Last timestamp issued; the next issue is strictly greater.
    last_ts: Timestamp,
    /// Persisted high-water: no timestamp at or above this may be issued
    /// until a new window is leased.
    limit: Timestamp,
}

/// Hybrid-logical-clock timestamp allocator.
///
/// 46-bit physical millisecond, 18-bit logical counter. The persisted
/// high-water embeds the physical component, so the clock never moves
/// backward across restarts.
pub struct TsoAllocator {
    kv: Arc<dyn MetaKv>,
    key: String,
    window_ms: u64,
    inner: Mutex<TsoState>,
}

impl TsoAllocator {
    pub fn new(kv: Arc<dyn MetaKv>, name: &str, window_ms: u64) -> Self {
        Self {
            kv,
            key: format!("/allocators/{name}/high"),
            window_ms,
            inner: Mutex::new(TsoState { last_ts: 0, limit: 0 }),
        }
    }

    /// Load the persisted high-water and resume strictly after it.
    pub async fn init(&self) -> Result<()> {
        let limit = match self.kv.load(&self.key).await? {
            Some(v) => v
                .parse::<u64>()
                .map_err(|_| Error::Unexpected(format!("corrupt high-water at {}", self.key)))?,
            None => 0,
        };
        let mut state = self.inner.lock().await;
        state.limit = limit;
        state.last_ts = limit;
        Ok(())
    }

    /// Allocate `count` consecutive timestamps; returns the first. All
    /// returned values are strictly greater than any prior issue from this
    /// process and strictly below the persisted high-water.
    pub async fn alloc(&self, count: u32) -> Result<Timestamp> {
        if count == 0 || count as u64 >= MAX_LOGICAL {
            return Err(Error::InvalidInput(format!("timestamp count {count} out of range")));
        }
        let mut state = self.inner.lock().await;

        let now = now_ms();
        let (mut phys, mut logical) = parse_ts(state.last_ts);
        if now > phys {
            phys = now;
            logical = 0;
        } else {
            // Continue within the current millisecond.
            logical += 1;
        }
        // Logical counter exhausted within this millisecond: advance the
        // physical component by one and reset, without waiting for the wall
        // clock to catch up.
        if logical + count as u64 > MAX_LOGICAL {
            phys += 1;
            logical = 0;
        }

        let last_needed = compose_ts(phys, logical + count as u64 - 1);
        while last_needed >= state.limit {
            state.limit = self.lease(state.limit, phys).await?;
        }

        state.last_ts = last_needed;
        Ok(compose_ts(phys, logical))
    }

    pub async fn alloc_one(&self) -> Result<Timestamp> {
        self.alloc(1).await
    }

    /// Periodic maintenance: advance the physical component to track the
    /// wall clock and keep at least half a leased window in reserve.
    pub async fn update(&self) -> Result<()> {
        let mut state = self.inner.lock().await;
        let now = now_ms();
        if now > physical_ms(state.last_ts) {
            state.last_ts = state.last_ts.max(compose_ts(now, 0));
        }
        let phys = physical_ms(state.last_ts);
        if physical_ms(state.limit).saturating_sub(phys) < self.window_ms / 2 {
            state.limit = self.lease(state.limit, phys).await?;
        }
        Ok(())
    }

    /// Persist a new high-water `window_ms` ahead of both the wall clock and
    /// the in-memory clock, CAS-raced against other instances.
    async fn lease(&self, current: Timestamp, phys: u64) -> Result<Timestamp> {
        let mut expected = current;
        for _ in 0..LEASE_CAS_BUDGET {
            let horizon = now_ms().max(phys) + self.window_ms;
            let next = compose_ts(horizon, 0).max(expected + 1);
            let expected_str = if expected == 0 && self.kv.load(&self.key).await?.is_none() {
                None
            } else {
                Some(expected.to_string())
            };
            let swapped = self
                .kv
                .compare_and_swap(&self.key, expected_str.as_deref(), &next.to_string())
                .await?;
            if swapped {
                Metrics::get().allocator_leases_total.with_label_values(&["tso"]).inc();
                debug!(key = %self.key, high = next, "leased timestamp window");
                return Ok(next);
            }
            expected = match self.kv.load(&self.key).await? {
                Some(v) => v
                    .parse::<u64>()
                    .map_err(|_| Error::Unexpected(format!("corrupt high-water at {}", self.key)))?,
                None => 0,
            };
        }
        Err(Error::Unavailable(format!("tso lease CAS exhausted for {}", self.key)))
    }
}
