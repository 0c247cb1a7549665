//! Token bucket shared by all active chunks.
//!
//! Chunk write callbacks report consumed bytes and sleep for the returned
//! duration, keeping the aggregate rate under the configured cap. The bucket
//! is reconfigured in place when the speed limit changes; in-flight chunks
//! pick up the new rate on their next write.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Rates below this (bytes/s) disable throttling entirely; sleeping for
/// sub-10KiB/s budgets just burns CPU on wakeups.
const MIN_RATE: i64 = 10_240;

#[derive(Debug)]
struct BucketState {
    /// Bytes per second; values < MIN_RATE mean unthrottled.
    rate: i64,
    tokens: f64,
    last: Instant,
}

/// Process-wide bandwidth bucket. `consumed` is O(1) under one mutex.
#[derive(Debug)]
pub struct BandwidthBucket {
    state: Mutex<BucketState>,
}

impl BandwidthBucket {
    /// Creates an unthrottled bucket.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BucketState {
                rate: -1,
                tokens: 0.0,
                last: Instant::now(),
            }),
        }
    }

    /// Reconfigure the rate (bytes/s). `None` or values under 10 KiB/s
    /// disable throttling. Safe to call while chunks are mid-transfer.
    pub fn set_rate(&self, rate: Option<u64>) {
        let mut st = self.state.lock().unwrap();
        st.rate = rate.map(|r| r as i64).unwrap_or(-1);
        st.tokens = 0.0;
        st.last = Instant::now();
    }

    /// Current rate in bytes/s, `None` when unthrottled.
    pub fn rate(&self) -> Option<u64> {
        let st = self.state.lock().unwrap();
        (st.rate >= MIN_RATE).then_some(st.rate as u64)
    }

    /// Report `amount` consumed bytes; returns how long the caller should
    /// sleep to keep the rolling rate under the cap.
    pub fn consumed(&self, amount: usize) -> Duration {
        let mut st = self.state.lock().unwrap();
        if st.rate < MIN_RATE {
            return Duration::ZERO;
        }

        // Refill up to one second's worth of burst, then spend.
        let now = Instant::now();
        let elapsed = now.duration_since(st.last).as_secs_f64();
        st.tokens = (st.tokens + elapsed * st.rate as f64).min(st.rate as f64);
        st.last = now;
        st.tokens -= amount as f64;

        if st.tokens < 0.0 {
            Duration::from_secs_f64(-st.tokens / st.rate as f64)
        } else {
            Duration::ZERO
        }
    }
}

impl Default for BandwidthBucket {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unthrottled_bucket_never_sleeps() {
        let bucket = BandwidthBucket::new();
        assert_eq!(bucket.consumed(1 << 20), Duration::ZERO);
        assert_eq!(bucket.rate(), None);
    }

    #[test]
    fn tiny_rates_disable_throttling() {
        let bucket = BandwidthBucket::new();
        bucket.set_rate(Some(1024));
        assert_eq!(bucket.rate(), None);
        assert_eq!(bucket.consumed(1 << 20), Duration::ZERO);
    }

    #[test]
    fn over_budget_consumption_requests_sleep() {
        let bucket = BandwidthBucket::new();
        bucket.set_rate(Some(100 * 1024));
        // Burn well past one second of budget; a sleep must be advised.
        let mut total = Duration::ZERO;
        for _ in 0..4 {
            total += bucket.consumed(100 * 1024);
        }
        assert!(total > Duration::ZERO);
        // Roughly 3 extra seconds of data at 100 KiB/s.
        assert!(total >= Duration::from_secs(2));
    }

    #[test]
    fn reconfigure_resets_budget() {
        let bucket = BandwidthBucket::new();
        bucket.set_rate(Some(50 * 1024));
        let _ = bucket.consumed(500 * 1024);
        bucket.set_rate(None);
        assert_eq!(bucket.consumed(1 << 20), Duration::ZERO);
    }
}
