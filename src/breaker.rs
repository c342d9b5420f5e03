// Rate circuit breaker for the netlink receive loop.
//
// Messages are counted into fixed-length buckets; the rate is evaluated
// only when a bucket boundary is crossed, so a burst inside a single tick
// cannot trip the breaker while a sustained excess over a full bucket does.

use std::time::{Duration, Instant};

const DEFAULT_BUCKET: Duration = Duration::from_secs(1);

/// Sliding-bucket rate estimator with an open/closed state.
///
/// Single-writer: only the receive worker ticks it. A target of `-1`
/// disables the breaker entirely.
pub struct CircuitBreaker {
    target: i64,
    bucket: Duration,
    count: u64,
    bucket_start: Instant,
    rate: f64,
    open: bool,
    stopped: bool,
}

impl CircuitBreaker {
    pub fn new(target: i64) -> Self {
        Self::with_bucket(target, DEFAULT_BUCKET)
    }

    /// Build a breaker with a custom evaluation bucket length.
    pub fn with_bucket(target: i64, bucket: Duration) -> Self {
        Self {
            target,
            bucket,
            count: 0,
            bucket_start: Instant::now(),
            rate: 0.0,
            open: false,
            stopped: false,
        }
    }

    /// Record `n` messages just observed.
    pub fn tick(&mut self, n: usize) {
        self.tick_at(Instant::now(), n);
    }

    fn tick_at(&mut self, now: Instant, n: usize) {
        if self.stopped || self.target < 0 {
            return;
        }

        self.count += n as u64;

        let elapsed = now.saturating_duration_since(self.bucket_start);
        if elapsed < self.bucket {
            return;
        }

        // Quantize the elapsed time to whole buckets so the estimate stays
        // deterministic under scheduling jitter and decays across idle gaps.
        let buckets = (elapsed.as_secs_f64() / self.bucket.as_secs_f64()).floor();
        self.rate = self.count as f64 / (buckets * self.bucket.as_secs_f64());
        self.open = self.rate > self.target as f64;
        self.count = 0;
        self.bucket_start = now;
    }

    /// True when the last evaluation exceeded the target. A rate exactly at
    /// the target keeps the breaker closed.
    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Most recent rate estimate, in messages per second.
    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Clear window state and return to closed.
    pub fn reset(&mut self) {
        self.count = 0;
        self.rate = 0.0;
        self.open = false;
        self.bucket_start = Instant::now();
    }

    /// Permanently stop the breaker; subsequent ticks are ignored.
    pub fn stop(&mut self) {
        self.stopped = true;
        self.open = false;
    }
}
