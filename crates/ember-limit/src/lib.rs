//! Rate limiting for the ember server. Three interchangeable algorithms
//! (token bucket, fixed window, sliding window) over per-key state, with
//! pluggable key extraction, a periodic cleanup worker, and a registry for
//! named limiter instances.

mod algorithms;
mod keys;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use ember_http::HttpRequest;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use algorithms::{
    FixedWindowLimiter, LimiterAlgorithm, SlidingWindowLimiter, TokenBucketLimiter,
};
pub use keys::{api_key, bearer_user, client_ip, ip_and_user_agent, KeyStrategy};

const CLEANUP_INTERVAL: Duration = Duration::from_secs(5 * 60);
const IDLE_KEY_LIFETIME: Duration = Duration::from_secs(60 * 60);

pub type KeyExtractor = Arc<dyn Fn(&HttpRequest, &str) -> String + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub remaining: usize,
    pub reset_after: Duration,
    pub limit_type: &'static str,
    pub reason: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitStrategy {
    TokenBucket,
    FixedWindow,
    SlidingWindow,
}

impl Default for RateLimitStrategy {
    fn default() -> Self {
        Self::TokenBucket
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RateLimitConfigError {
    #[error("max_requests must be greater than zero")]
    ZeroMaxRequests,
    #[error("window_duration_seconds must be greater than zero")]
    ZeroWindowDuration,
    #[error("burst_capacity must be greater than zero for the token bucket strategy")]
    ZeroBurstCapacity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitConfig {
    pub strategy: RateLimitStrategy,
    pub max_requests: usize,
    pub window_duration_seconds: u64,
    pub burst_capacity: usize,
    pub key_strategy: KeyStrategy,
    pub enabled: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            strategy: RateLimitStrategy::TokenBucket,
            max_requests: 100,
            window_duration_seconds: 60,
            burst_capacity: 10,
            key_strategy: KeyStrategy::ClientIp,
            enabled: true,
        }
    }
}

impl RateLimitConfig {
    pub fn window_duration(&self) -> Duration {
        Duration::from_secs(self.window_duration_seconds)
    }

    pub fn validate(&self) -> Result<(), RateLimitConfigError> {
        if self.max_requests == 0 {
            return Err(RateLimitConfigError::ZeroMaxRequests);
        }
        if self.window_duration_seconds == 0 {
            return Err(RateLimitConfigError::ZeroWindowDuration);
        }
        if self.strategy == RateLimitStrategy::TokenBucket && self.burst_capacity == 0 {
            return Err(RateLimitConfigError::ZeroBurstCapacity);
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct RateLimitStats {
    total_requests: AtomicU64,
    allowed_requests: AtomicU64,
    blocked_requests: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitStatsSnapshot {
    pub total_requests: u64,
    pub allowed_requests: u64,
    pub blocked_requests: u64,
}

impl RateLimitStatsSnapshot {
    pub fn block_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        self.blocked_requests as f64 / self.total_requests as f64
    }
}

impl RateLimitStats {
    fn record(&self, allowed: bool) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if allowed {
            self.allowed_requests.fetch_add(1, Ordering::Relaxed);
        } else {
            self.blocked_requests.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn snapshot(&self) -> RateLimitStatsSnapshot {
        RateLimitStatsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            allowed_requests: self.allowed_requests.load(Ordering::Relaxed),
            blocked_requests: self.blocked_requests.load(Ordering::Relaxed),
        }
    }
}

struct LimiterShared {
    config: RateLimitConfig,
    algorithm: Arc<dyn LimiterAlgorithm>,
    key_extractor: Option<KeyExtractor>,
}

pub struct RateLimiter {
    shared: RwLock<LimiterShared>,
    stats: RateLimitStats,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let algorithm = build_algorithm(&config);
        Self {
            shared: RwLock::new(LimiterShared {
                config,
                algorithm,
                key_extractor: None,
            }),
            stats: RateLimitStats::default(),
        }
    }

    pub fn with_key_extractor(config: RateLimitConfig, extractor: KeyExtractor) -> Self {
        let limiter = Self::new(config);
        limiter
            .shared
            .write()
            .expect("limiter lock poisoned")
            .key_extractor = Some(extractor);
        limiter
    }

    pub fn check_request(&self, request: &HttpRequest, peer_ip: &str) -> RateLimitResult {
        let (key, algorithm) = {
            let shared = self.shared.read().expect("limiter lock poisoned");
            if !shared.config.enabled {
                return RateLimitResult {
                    allowed: true,
                    remaining: usize::MAX,
                    reset_after: Duration::ZERO,
                    limit_type: "disabled",
                    reason: "",
                };
            }
            let key = match &shared.key_extractor {
                Some(extract) => extract(request, peer_ip),
                None => shared.config.key_strategy.extract(request, peer_ip),
            };
            (key, Arc::clone(&shared.algorithm))
        };

        let result = algorithm.check(&key, Instant::now());
        self.stats.record(result.allowed);
        result
    }

    pub fn config(&self) -> RateLimitConfig {
        self.shared
            .read()
            .expect("limiter lock poisoned")
            .config
            .clone()
    }

    /// Swaps the algorithm atomically; per-key state accumulated under the
    /// old configuration is discarded.
    pub fn update_config(&self, config: RateLimitConfig) {
        let algorithm = build_algorithm(&config);
        let mut shared = self.shared.write().expect("limiter lock poisoned");
        shared.config = config;
        shared.algorithm = algorithm;
    }

    pub fn stats(&self) -> RateLimitStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn active_keys(&self) -> usize {
        self.algorithm().active_keys()
    }

    pub fn reset_all_limits(&self) {
        self.algorithm().reset_all();
    }

    pub fn purge_idle(&self) {
        self.algorithm().purge_idle(Instant::now(), IDLE_KEY_LIFETIME);
    }

    fn algorithm(&self) -> Arc<dyn LimiterAlgorithm> {
        Arc::clone(&self.shared.read().expect("limiter lock poisoned").algorithm)
    }

    /// Background worker: purge idle keys every five minutes until the
    /// shutdown signal flips. Never blocks `check_request` beyond the
    /// per-call algorithm lock.
    pub fn spawn_cleanup(
        self: &Arc<Self>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(CLEANUP_INTERVAL) => {
                        limiter.purge_idle();
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        })
    }
}

fn build_algorithm(config: &RateLimitConfig) -> Arc<dyn LimiterAlgorithm> {
    match config.strategy {
        RateLimitStrategy::TokenBucket => Arc::new(TokenBucketLimiter::new(
            config.burst_capacity,
            config.max_requests,
            config.window_duration(),
        )),
        RateLimitStrategy::FixedWindow => Arc::new(FixedWindowLimiter::new(
            config.max_requests,
            config.window_duration(),
        )),
        RateLimitStrategy::SlidingWindow => Arc::new(SlidingWindowLimiter::new(
            config.max_requests,
            config.window_duration(),
        )),
    }
}

/// Named limiter instances owned by the server, replacing ad-hoc global
/// state. `global` returns the shared instance; `for_endpoint` keys budgets
/// by `client-ip|endpoint`.
#[derive(Default)]
pub struct LimiterRegistry {
    limiters: Mutex<HashMap<String, Arc<RateLimiter>>>,
}

impl LimiterRegistry {
    pub fn global(&self, config: &RateLimitConfig) -> Arc<RateLimiter> {
        self.named("__global__", config, None)
    }

    pub fn for_endpoint(&self, endpoint: &str, config: &RateLimitConfig) -> Arc<RateLimiter> {
        let endpoint_owned = endpoint.to_string();
        let extractor: KeyExtractor = Arc::new(move |request, peer_ip| {
            format!("{}|{}", client_ip(request, peer_ip), endpoint_owned)
        });
        self.named(&format!("endpoint:{endpoint}"), config, Some(extractor))
    }

    fn named(
        &self,
        name: &str,
        config: &RateLimitConfig,
        extractor: Option<KeyExtractor>,
    ) -> Arc<RateLimiter> {
        let mut limiters = self.limiters.lock().expect("registry lock poisoned");
        Arc::clone(limiters.entry(name.to_string()).or_insert_with(|| {
            Arc::new(match extractor {
                Some(extractor) => RateLimiter::with_key_extractor(config.clone(), extractor),
                None => RateLimiter::new(config.clone()),
            })
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::{
        KeyStrategy, LimiterRegistry, RateLimitConfig, RateLimitConfigError, RateLimitStrategy,
        RateLimiter,
    };
    use ember_http::parse_request;
    use std::sync::Arc;

    fn get_request(extra: &str) -> ember_http::HttpRequest {
        let raw = format!("GET /api/items HTTP/1.1\r\nHost: x\r\n{extra}\r\n");
        parse_request(raw.as_bytes()).expect("must parse").request
    }

    #[test]
    fn disabled_limiter_always_allows() {
        let config = RateLimitConfig {
            enabled: false,
            max_requests: 1,
            ..RateLimitConfig::default()
        };
        let limiter = RateLimiter::new(config);
        let request = get_request("");
        for _ in 0..10 {
            let result = limiter.check_request(&request, "1.2.3.4");
            assert!(result.allowed);
            assert_eq!(result.remaining, usize::MAX);
            assert_eq!(result.limit_type, "disabled");
        }
    }

    #[test]
    fn budgets_are_tracked_per_extracted_key() {
        let config = RateLimitConfig {
            strategy: RateLimitStrategy::FixedWindow,
            max_requests: 1,
            window_duration_seconds: 60,
            ..RateLimitConfig::default()
        };
        let limiter = RateLimiter::new(config);
        let request = get_request("");

        assert!(limiter.check_request(&request, "1.1.1.1").allowed);
        assert!(!limiter.check_request(&request, "1.1.1.1").allowed);
        assert!(limiter.check_request(&request, "2.2.2.2").allowed);

        let stats = limiter.stats();
        assert_eq!(stats.total_requests, 3);
        assert_eq!(stats.allowed_requests, 2);
        assert_eq!(stats.blocked_requests, 1);
        assert!((stats.block_rate() - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn forwarded_header_drives_the_default_key() {
        let config = RateLimitConfig {
            strategy: RateLimitStrategy::FixedWindow,
            max_requests: 1,
            key_strategy: KeyStrategy::ClientIp,
            ..RateLimitConfig::default()
        };
        let limiter = RateLimiter::new(config);

        let behind_proxy = get_request("X-Forwarded-For: 9.9.9.9\r\n");
        assert!(limiter.check_request(&behind_proxy, "1.1.1.1").allowed);
        // Same forwarded client through a different peer shares the budget.
        assert!(!limiter.check_request(&behind_proxy, "3.3.3.3").allowed);
    }

    #[test]
    fn update_config_discards_old_state() {
        let config = RateLimitConfig {
            strategy: RateLimitStrategy::FixedWindow,
            max_requests: 1,
            ..RateLimitConfig::default()
        };
        let limiter = RateLimiter::new(config.clone());
        let request = get_request("");

        assert!(limiter.check_request(&request, "1.1.1.1").allowed);
        assert!(!limiter.check_request(&request, "1.1.1.1").allowed);

        limiter.update_config(RateLimitConfig {
            strategy: RateLimitStrategy::SlidingWindow,
            ..config
        });
        let fresh = limiter.check_request(&request, "1.1.1.1");
        assert!(fresh.allowed);
        assert_eq!(fresh.limit_type, "sliding_window");
    }

    #[test]
    fn validation_rejects_degenerate_configs() {
        let zero_max = RateLimitConfig {
            max_requests: 0,
            ..RateLimitConfig::default()
        };
        assert_eq!(zero_max.validate(), Err(RateLimitConfigError::ZeroMaxRequests));

        let zero_window = RateLimitConfig {
            window_duration_seconds: 0,
            ..RateLimitConfig::default()
        };
        assert_eq!(
            zero_window.validate(),
            Err(RateLimitConfigError::ZeroWindowDuration)
        );

        let zero_burst = RateLimitConfig {
            burst_capacity: 0,
            ..RateLimitConfig::default()
        };
        assert_eq!(
            zero_burst.validate(),
            Err(RateLimitConfigError::ZeroBurstCapacity)
        );

        assert_eq!(RateLimitConfig::default().validate(), Ok(()));
    }

    #[test]
    fn registry_reuses_named_instances() {
        let registry = LimiterRegistry::default();
        let config = RateLimitConfig::default();

        let first = registry.global(&config);
        let second = registry.global(&config);
        assert!(Arc::ptr_eq(&first, &second));

        let endpoint = registry.for_endpoint("/api/data", &config);
        assert!(!Arc::ptr_eq(&first, &endpoint));
    }

    #[test]
    fn endpoint_limiter_scopes_budget_to_ip_and_endpoint() {
        let registry = LimiterRegistry::default();
        let config = RateLimitConfig {
            strategy: RateLimitStrategy::FixedWindow,
            max_requests: 1,
            ..RateLimitConfig::default()
        };
        let limiter = registry.for_endpoint("/api/data", &config);
        let request = get_request("");

        assert!(limiter.check_request(&request, "1.1.1.1").allowed);
        assert!(!limiter.check_request(&request, "1.1.1.1").allowed);
        assert!(limiter.check_request(&request, "2.2.2.2").allowed);
    }

    #[tokio::test]
    async fn cleanup_worker_stops_on_shutdown_signal() {
        let limiter = Arc::new(RateLimiter::new(RateLimitConfig::default()));
        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let handle = limiter.spawn_cleanup(shutdown_rx);

        shutdown_tx.send(true).expect("send shutdown");
        handle.await.expect("cleanup task join");
    }
}
