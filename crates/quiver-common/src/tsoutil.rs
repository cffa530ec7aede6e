//! Hybrid timestamp packing helpers.
//!
//! A timestamp is 64 bits: the high 46 bits hold a physical wall-clock
//! millisecond, the low 18 bits a logical counter within that millisecond.

use crate::types::Timestamp;
use std::time::{SystemTime, UNIX_EPOCH};

/// Number of low bits reserved for the logical counter.
pub const LOGICAL_BITS: u32 = 18;

/// Mask selecting the logical counter.
pub const LOGICAL_MASK: u64 = (1 << LOGICAL_BITS) - 1;

/// Maximum logical values per physical millisecond.
pub const MAX_LOGICAL: u64 = 1 << LOGICAL_BITS;

/// Pack a physical millisecond and logical counter into a timestamp.
pub fn compose_ts(physical_ms: u64, logical: u64) -> Timestamp {
    (physical_ms << LOGICAL_BITS) | (logical & LOGICAL_MASK)
}

/// Split a timestamp into (physical milliseconds, logical counter).
pub fn parse_ts(ts: Timestamp) -> (u64, u64) {
    (ts >> LOGICAL_BITS, ts & LOGICAL_MASK)
}

/// Physical component of a timestamp, in milliseconds.
pub fn physical_ms(ts: Timestamp) -> u64 {
    ts >> LOGICAL_BITS
}

/// A timestamp `ms` physical milliseconds later than `ts`.
pub fn add_ms(ts: Timestamp, ms: u64) -> Timestamp {
    ts + (ms << LOGICAL_BITS)
}

/// Current wall clock in milliseconds since the epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compose_parse_roundtrip() {
        let ts = compose_ts(1_700_000_000_123, 42);
        let (phys, logical) = parse_ts(ts);
        assert_eq!(phys, 1_700_000_000_123);
        assert_eq!(logical, 42);
    }

    #[test]
    fn logical_is_masked() {
        let ts = compose_ts(10, MAX_LOGICAL + 7);
        assert_eq!(parse_ts(ts), (10, 7));
    }

    #[test]
    fn physical_dominates_ordering() {
        assert!(compose_ts(11, 0) > compose_ts(10, MAX_LOGICAL - 1));
    }
}
