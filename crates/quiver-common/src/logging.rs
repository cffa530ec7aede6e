//! Tracing setup for coordinator processes.

use tracing_subscriber::{fmt, EnvFilter};

/// Install the global subscriber: compact formatter, level taken from
/// `RUST_LOG` (default `info`). Safe to call more than once; only the first
/// call wins.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(true).try_init();
}
