use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::RateLimitResult;

/// One rate-limiting algorithm over per-key state. `now` is passed in so
/// tests drive time explicitly. The inner mutex is held only for the
/// duration of one lookup/update.
pub trait LimiterAlgorithm: Send + Sync {
    fn check(&self, key: &str, now: Instant) -> RateLimitResult;
    fn purge_idle(&self, now: Instant, idle_for: Duration);
    fn active_keys(&self) -> usize;
    fn reset_all(&self);
}

#[derive(Debug, Clone, Copy)]
struct BucketState {
    tokens: usize,
    last_refill: Instant,
    last_seen: Instant,
}

#[derive(Debug)]
pub struct TokenBucketLimiter {
    capacity: usize,
    refill_rate: usize,
    refill_interval: Duration,
    buckets: Mutex<HashMap<String, BucketState>>,
}

impl TokenBucketLimiter {
    pub fn new(capacity: usize, refill_rate: usize, refill_interval: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            refill_rate: refill_rate.max(1),
            refill_interval: non_zero(refill_interval),
            buckets: Mutex::new(HashMap::new()),
        }
    }
}

impl LimiterAlgorithm for TokenBucketLimiter {
    fn check(&self, key: &str, now: Instant) -> RateLimitResult {
        let mut buckets = self.buckets.lock().expect("bucket map lock poisoned");
        let bucket = buckets.entry(key.to_string()).or_insert(BucketState {
            tokens: self.capacity,
            last_refill: now,
            last_seen: now,
        });
        bucket.last_seen = now;

        let elapsed = now.saturating_duration_since(bucket.last_refill);
        if elapsed >= self.refill_interval {
            let intervals = (elapsed.as_nanos() / self.refill_interval.as_nanos()) as usize;
            bucket.tokens = self
                .capacity
                .min(bucket.tokens.saturating_add(intervals * self.refill_rate));
            bucket.last_refill = now;
        }

        if bucket.tokens > 0 {
            bucket.tokens -= 1;
            RateLimitResult {
                allowed: true,
                remaining: bucket.tokens,
                reset_after: Duration::ZERO,
                limit_type: "token_bucket",
                reason: "",
            }
        } else {
            let into_interval =
                Duration::from_nanos((elapsed.as_nanos() % self.refill_interval.as_nanos()) as u64);
            RateLimitResult {
                allowed: false,
                remaining: 0,
                reset_after: self.refill_interval - into_interval,
                limit_type: "token_bucket",
                reason: "Token bucket exhausted",
            }
        }
    }

    fn purge_idle(&self, now: Instant, idle_for: Duration) {
        self.buckets
            .lock()
            .expect("bucket map lock poisoned")
            .retain(|_, state| now.saturating_duration_since(state.last_seen) <= idle_for);
    }

    fn active_keys(&self) -> usize {
        self.buckets.lock().expect("bucket map lock poisoned").len()
    }

    fn reset_all(&self) {
        self.buckets.lock().expect("bucket map lock poisoned").clear();
    }
}

#[derive(Debug, Clone, Copy)]
struct WindowState {
    count: usize,
    window_start: Instant,
    last_seen: Instant,
}

#[derive(Debug)]
pub struct FixedWindowLimiter {
    max_requests: usize,
    window_duration: Duration,
    windows: Mutex<HashMap<String, WindowState>>,
}

impl FixedWindowLimiter {
    pub fn new(max_requests: usize, window_duration: Duration) -> Self {
        Self {
            max_requests: max_requests.max(1),
            window_duration: non_zero(window_duration),
            windows: Mutex::new(HashMap::new()),
        }
    }
}

impl LimiterAlgorithm for FixedWindowLimiter {
    fn check(&self, key: &str, now: Instant) -> RateLimitResult {
        let mut windows = self.windows.lock().expect("window map lock poisoned");
        let window = windows.entry(key.to_string()).or_insert(WindowState {
            count: 0,
            window_start: now,
            last_seen: now,
        });
        window.last_seen = now;

        let mut elapsed = now.saturating_duration_since(window.window_start);
        if elapsed >= self.window_duration {
            window.count = 0;
            window.window_start = now;
            elapsed = Duration::ZERO;
        }

        if window.count < self.max_requests {
            window.count += 1;
            RateLimitResult {
                allowed: true,
                remaining: self.max_requests - window.count,
                reset_after: Duration::ZERO,
                limit_type: "fixed_window",
                reason: "",
            }
        } else {
            RateLimitResult {
                allowed: false,
                remaining: 0,
                reset_after: self.window_duration.saturating_sub(elapsed),
                limit_type: "fixed_window",
                reason: "Fixed window limit exceeded",
            }
        }
    }

    fn purge_idle(&self, now: Instant, idle_for: Duration) {
        self.windows
            .lock()
            .expect("window map lock poisoned")
            .retain(|_, state| now.saturating_duration_since(state.last_seen) <= idle_for);
    }

    fn active_keys(&self) -> usize {
        self.windows.lock().expect("window map lock poisoned").len()
    }

    fn reset_all(&self) {
        self.windows.lock().expect("window map lock poisoned").clear();
    }
}

#[derive(Debug)]
pub struct SlidingWindowLimiter {
    max_requests: usize,
    window_duration: Duration,
    request_logs: Mutex<HashMap<String, Vec<Instant>>>,
}

impl SlidingWindowLimiter {
    pub fn new(max_requests: usize, window_duration: Duration) -> Self {
        Self {
            max_requests: max_requests.max(1),
            window_duration: non_zero(window_duration),
            request_logs: Mutex::new(HashMap::new()),
        }
    }
}

impl LimiterAlgorithm for SlidingWindowLimiter {
    fn check(&self, key: &str, now: Instant) -> RateLimitResult {
        let mut logs = self.request_logs.lock().expect("request log lock poisoned");
        let timestamps = logs.entry(key.to_string()).or_default();

        // Entries are pushed in time order, so purging keeps the rest sorted.
        timestamps
            .retain(|stamp| now.saturating_duration_since(*stamp) < self.window_duration);

        if timestamps.len() < self.max_requests {
            timestamps.push(now);
            RateLimitResult {
                allowed: true,
                remaining: self.max_requests - timestamps.len(),
                reset_after: Duration::ZERO,
                limit_type: "sliding_window",
                reason: "",
            }
        } else {
            let reset_after = timestamps
                .first()
                .map(|oldest| {
                    (*oldest + self.window_duration).saturating_duration_since(now)
                })
                .unwrap_or(self.window_duration);
            RateLimitResult {
                allowed: false,
                remaining: 0,
                reset_after,
                limit_type: "sliding_window",
                reason: "Sliding window limit exceeded",
            }
        }
    }

    fn purge_idle(&self, now: Instant, idle_for: Duration) {
        let mut logs = self.request_logs.lock().expect("request log lock poisoned");
        logs.retain(|_, timestamps| {
            timestamps.retain(|stamp| now.saturating_duration_since(*stamp) <= idle_for);
            !timestamps.is_empty()
        });
    }

    fn active_keys(&self) -> usize {
        self.request_logs
            .lock()
            .expect("request log lock poisoned")
            .len()
    }

    fn reset_all(&self) {
        self.request_logs
            .lock()
            .expect("request log lock poisoned")
            .clear();
    }
}

fn non_zero(duration: Duration) -> Duration {
    if duration.is_zero() {
        Duration::from_secs(1)
    } else {
        duration
    }
}

#[cfg(test)]
mod tests {
    use super::{
        FixedWindowLimiter, LimiterAlgorithm, SlidingWindowLimiter, TokenBucketLimiter,
    };
    use std::time::{Duration, Instant};

    #[test]
    fn token_bucket_consumes_one_token_per_allowed_request() {
        let limiter = TokenBucketLimiter::new(3, 1, Duration::from_secs(1));
        let start = Instant::now();

        for expected_remaining in [2usize, 1, 0] {
            let result = limiter.check("k", start);
            assert!(result.allowed);
            assert_eq!(result.remaining, expected_remaining);
        }

        let denied = limiter.check("k", start);
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.limit_type, "token_bucket");
        assert!(denied.reset_after <= Duration::from_secs(1));
    }

    #[test]
    fn token_bucket_refills_by_whole_intervals() {
        let limiter = TokenBucketLimiter::new(3, 1, Duration::from_secs(1));
        let start = Instant::now();
        for _ in 0..3 {
            assert!(limiter.check("k", start).allowed);
        }
        assert!(!limiter.check("k", start).allowed);

        // One interval refills one token; a long idle period refills back to
        // exactly capacity, never beyond.
        assert!(limiter.check("k", start + Duration::from_secs(1)).allowed);
        assert!(!limiter.check("k", start + Duration::from_millis(1500)).allowed);

        let rested = limiter.check("k", start + Duration::from_secs(3600));
        assert!(rested.allowed);
        assert_eq!(rested.remaining, 2);
    }

    #[test]
    fn fixed_window_resets_at_boundary() {
        let limiter = FixedWindowLimiter::new(2, Duration::from_secs(10));
        let start = Instant::now();

        assert!(limiter.check("k", start).allowed);
        assert!(limiter.check("k", start + Duration::from_secs(1)).allowed);
        let denied = limiter.check("k", start + Duration::from_secs(2));
        assert!(!denied.allowed);
        assert_eq!(denied.reset_after, Duration::from_secs(8));

        let fresh = limiter.check("k", start + Duration::from_secs(10));
        assert!(fresh.allowed);
        assert_eq!(fresh.remaining, 1);
    }

    #[test]
    fn sliding_window_expires_oldest_entries_first() {
        let limiter = SlidingWindowLimiter::new(2, Duration::from_secs(10));
        let start = Instant::now();

        assert!(limiter.check("k", start).allowed);
        assert!(limiter.check("k", start + Duration::from_secs(4)).allowed);

        let denied = limiter.check("k", start + Duration::from_secs(5));
        assert!(!denied.allowed);
        assert_eq!(denied.reset_after, Duration::from_secs(5));

        // The first entry leaves the window at start+10.
        assert!(limiter.check("k", start + Duration::from_secs(11)).allowed);
    }

    #[test]
    fn distinct_keys_never_share_budget() {
        let buckets: Vec<Box<dyn LimiterAlgorithm>> = vec![
            Box::new(TokenBucketLimiter::new(1, 1, Duration::from_secs(60))),
            Box::new(FixedWindowLimiter::new(1, Duration::from_secs(60))),
            Box::new(SlidingWindowLimiter::new(1, Duration::from_secs(60))),
        ];
        let now = Instant::now();

        for limiter in &buckets {
            assert!(limiter.check("alice", now).allowed);
            assert!(!limiter.check("alice", now).allowed);
            assert!(
                limiter.check("bob", now).allowed,
                "second key must keep its own budget"
            );
        }
    }

    #[test]
    fn purge_drops_only_idle_keys() {
        let limiter = FixedWindowLimiter::new(5, Duration::from_secs(1));
        let start = Instant::now();
        limiter.check("stale", start);
        limiter.check("fresh", start + Duration::from_secs(3500));

        limiter.purge_idle(start + Duration::from_secs(3700), Duration::from_secs(3600));
        assert_eq!(limiter.active_keys(), 1);

        limiter.reset_all();
        assert_eq!(limiter.active_keys(), 0);
    }
}
