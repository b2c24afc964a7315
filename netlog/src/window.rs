//! Throughput-adaptive flush policy.
//!
//! Busy flows are held longer before they are emitted, so they produce fewer
//! and larger records. Sparse flows go out as soon as the floor is met.

use std::time::Duration;

use crate::table::FlowAggregate;

const MIB: f64 = 1024.0 * 1024.0;

pub const MIN_FLOW_DURATION: Duration = Duration::from_secs(1);

/// Window a flow moving `total_bytes` over `elapsed` must span before it is
/// emitted.
pub fn required_window(total_bytes: u64, elapsed: Duration) -> Duration {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return MIN_FLOW_DURATION;
    }
    let mib_per_sec = total_bytes as f64 / secs / MIB;
    if mib_per_sec > 100.0 {
        Duration::from_secs(5)
    } else if mib_per_sec > 10.0 {
        Duration::from_secs(3)
    } else if mib_per_sec > 1.0 {
        Duration::from_secs(2)
    } else {
        Duration::from_secs(1)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct FlushPolicy {
    /// Flows shorter than this have too little data to estimate a rate.
    pub min_duration: Duration,
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self {
            min_duration: MIN_FLOW_DURATION,
        }
    }
}

impl FlushPolicy {
    pub fn is_mature(&self, flow: &FlowAggregate) -> bool {
        let elapsed = flow.duration();
        if elapsed < self.min_duration {
            return false;
        }
        elapsed >= required_window(flow.total_bytes, elapsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: u64 = 1024 * 1024;

    #[test]
    fn rate_buckets() {
        let one = Duration::from_secs(1);
        assert_eq!(required_window(200 * MB, one), Duration::from_secs(5));
        assert_eq!(required_window(20 * MB, one), Duration::from_secs(3));
        assert_eq!(required_window(2 * MB, one), Duration::from_secs(2));
        assert_eq!(required_window(100 * 1024, one), Duration::from_secs(1));
    }

    #[test]
    fn bucket_edges_are_exclusive() {
        let one = Duration::from_secs(1);
        assert_eq!(required_window(100 * MB, one), Duration::from_secs(3));
        assert_eq!(required_window(10 * MB, one), Duration::from_secs(2));
        assert_eq!(required_window(MB, one), Duration::from_secs(1));
    }

    #[test]
    fn rate_uses_whole_duration() {
        // 50,000,000 bytes over 2s is about 23.8 MiB/s.
        assert_eq!(
            required_window(50_000_000, Duration::from_secs(2)),
            Duration::from_secs(3)
        );
    }

    #[test]
    fn zero_elapsed_gets_floor() {
        assert_eq!(required_window(MB, Duration::ZERO), MIN_FLOW_DURATION);
    }
}
