//! Per-channel time-tick watermarks.

use parking_lot::RwLock;
use quiver_common::metrics::Metrics;
use quiver_common::tsoutil::physical_ms;
use quiver_common::types::Timestamp;
use std::collections::HashMap;

/// Shared table of the latest watermark per physical channel.
///
/// A watermark declares that no message with an earlier timestamp will be
/// sent on the channel henceforth; it never moves backward.
#[derive(Default)]
pub struct ChannelTimeTick {
    table: RwLock<HashMap<String, Timestamp>>,
}

impl ChannelTimeTick {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a tick to a set of channels. Regressions are discarded.
    pub fn update(&self, channels: &[String], ts: Timestamp) {
        let mut table = self.table.write();
        for channel in channels {
            let entry = table.entry(channel.clone()).or_insert(0);
            if ts > *entry {
                *entry = ts;
                Metrics::get()
                    .channel_time_tick
                    .with_label_values(&[channel.as_str()])
                    .set(physical_ms(ts) as i64);
            }
        }
    }

    pub fn get(&self, channel: &str) -> Option<Timestamp> {
        self.table.read().get(channel).copied()
    }

    pub fn snapshot(&self) -> HashMap<String, Timestamp> {
        self.table.read().clone()
    }
}
