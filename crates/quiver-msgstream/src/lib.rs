//! Message-stream model and broker abstraction.
//!
//! Coordinators publish onto named channels (topics); every message carries a
//! `{type, msg_id, timestamp, source_id}` header. Per-channel ordering is the
//! broker's contract; consumers de-duplicate on `msg_id` so that at-least-once
//! publish (DDL replay after a crash) stays idempotent downstream.

pub mod broker;
pub mod message;

pub use broker::{MemoryMsgBroker, MsgBroker};
pub use message::{Deduper, Message, MsgBody, MsgHeader, MsgType};

/// Deterministic physical channel name for `idx` under `prefix`.
pub fn physical_channel_name(prefix: &str, idx: usize) -> String {
    format!("{prefix}_{idx}")
}

/// Channel-affinity routing: pick the channel for a row by primary-key hash.
pub fn channel_for_key(hash: u64, channels: &[String]) -> Option<&String> {
    if channels.is_empty() {
        return None;
    }
    channels.get((hash % channels.len() as u64) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn affinity_is_stable() {
        let channels = vec!["c0".to_string(), "c1".to_string(), "c2".to_string()];
        let a = channel_for_key(7, &channels).unwrap();
        let b = channel_for_key(7, &channels).unwrap();
        assert_eq!(a, b);
        assert_eq!(channel_for_key(5, &channels).unwrap(), "c2");
        assert!(channel_for_key(1, &[]).is_none());
    }
}
