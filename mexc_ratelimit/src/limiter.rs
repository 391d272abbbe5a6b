use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use crate::adaptive;
use crate::admission::Admission;
use crate::admission::Algorithm;
use crate::admission::Decision;
use crate::admission::EffectiveLimits;
use crate::circuit_breaker::CircuitBreakerRegistry;
use crate::circuit_breaker::CircuitState;
use crate::config::LimiterSettings;
use crate::config::RateLimitConfig;
use crate::error::Result;
use crate::exchanges::mexc;
use crate::exchanges::mexc::QuotaAdapter;
use crate::exchanges::mexc::QuotaHeaders;
use crate::metrics::EndpointMetrics;
use crate::metrics::MetricsStore;
use crate::sliding_window::SlidingWindowStore;
use crate::time::TimeSource;
use crate::token_bucket::TokenBucketStore;
use crate::user::AdaptationEvent;
use crate::user::PriorityLevel;
use crate::user::UserTable;

/// Factor changes below this delta are not worth an audit entry
const HISTORY_DELTA: f64 = 0.1;

/// retry_after reported when an internal error forces a conservative denial
const FAIL_CLOSED_RETRY_SECS: u64 = 60;

/// Diagnostic context attached to every admission verdict
#[derive(Debug, Clone)]
pub struct ResultMetadata {
    pub algorithm: Algorithm,
    pub current_window_requests: u32,
    pub average_response_time: f64,
    pub success_rate: f64,
    pub adaptation_factor: f64,
    pub burst_tokens: u32,
}

/// Admission verdict returned by `check_rate_limit`
#[derive(Debug, Clone)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub remaining_requests: u32,

    /// Millisecond timestamp at which quota is restored
    pub reset_time: u64,

    /// Seconds the caller should wait before retrying, on denial
    pub retry_after: Option<u64>,

    /// Breaker state, present whenever the breaker is enabled for the key
    pub circuit_breaker_status: Option<CircuitState>,

    /// Soft backoff hint in milliseconds, returned alongside admissions when
    /// observed health warrants slowing down
    pub adaptive_delay: Option<u64>,

    pub metadata: ResultMetadata,
}

/// Observed outcome of a request the caller issued after an admission
#[derive(Debug, Clone, Default)]
pub struct ResponseOutcome {
    pub response_time_ms: u64,
    pub success: bool,
    pub status_code: Option<u16>,
    pub headers: Option<QuotaHeaders>,
}

impl ResponseOutcome {
    pub fn success(response_time_ms: u64) -> Self {
        Self { response_time_ms, success: true, status_code: None, headers: None }
    }

    pub fn failure(response_time_ms: u64) -> Self {
        Self { response_time_ms, success: false, status_code: None, headers: None }
    }

    pub fn with_status(mut self, status_code: u16) -> Self {
        self.status_code = Some(status_code);
        self
    }

    pub fn with_headers(mut self, headers: QuotaHeaders) -> Self {
        self.headers = Some(headers);
        self
    }
}

/// Aggregate view over all tracked keys
#[derive(Debug, Clone)]
pub struct LimiterStats {
    pub tracked_keys: usize,
    pub token_bucket_keys: usize,
    pub sliding_window_keys: usize,
    pub total_requests: u64,
    pub total_failures: u64,
    pub overall_success_rate: f64,
    pub open_circuits: usize,
    pub average_adaptation_factor: f64,
}

/// Adaptive rate limiter for outbound exchange API traffic
///
/// Resolves per-call configuration, consults the circuit breaker, dispatches
/// to one admission algorithm and folds observed outcomes back into the
/// self-tuning loop. Explicitly constructed and passed to callers; one
/// instance owns all per-key state.
///
/// `check_rate_limit` and `record_response` are synchronous and atomic per
/// key: concurrent callers on the same key never observe interleaved partial
/// updates, while distinct keys proceed fully in parallel.
pub struct AdaptiveRateLimiter {
    settings: LimiterSettings,
    time: TimeSource,
    metrics: MetricsStore,
    buckets: TokenBucketStore,
    windows: SlidingWindowStore,
    breakers: CircuitBreakerRegistry,
    quota: QuotaAdapter,
    users: UserTable,
    endpoint_overrides: HashMap<String, RateLimitConfig>,
}

impl AdaptiveRateLimiter {
    /// Create a limiter with validated settings
    pub fn new(settings: LimiterSettings) -> Result<Self> {
        settings.validate()?;
        Ok(Self::build(settings))
    }

    /// Create a limiter with default settings
    pub fn with_defaults() -> Self {
        Self::build(LimiterSettings::default())
    }

    fn build(settings: LimiterSettings) -> Self {
        Self {
            breakers: CircuitBreakerRegistry::new(settings.breaker.clone()),
            quota: QuotaAdapter::new(settings.quota.clone()),
            settings,
            time: TimeSource::new(),
            metrics: MetricsStore::new(),
            buckets: TokenBucketStore::new(),
            windows: SlidingWindowStore::new(),
            users: UserTable::new(),
            endpoint_overrides: mexc::default_overrides(),
        }
    }

    /// Decide whether a request to `endpoint` may be issued now
    ///
    /// Never fails: internal errors are logged and converted into a
    /// conservative denial, since the limiter must never become the reason a
    /// trading action errors out.
    pub fn check_rate_limit(&self, endpoint: &str, user_id: Option<&str>) -> RateLimitResult {
        let now = self.time.now_millis();
        match self.try_check(endpoint, user_id, now) {
            Ok(result) => result,
            Err(err) => {
                tracing::error!(endpoint, user = user_id.unwrap_or("-"), error = %err, "admission check failed, denying conservatively");
                Self::fail_closed(now)
            }
        }
    }

    fn try_check(&self, endpoint: &str, user_id: Option<&str>, now: u64) -> Result<RateLimitResult> {
        let config = self.get_configuration(endpoint, user_id);
        config.validate()?;

        let key = Self::make_key(endpoint, user_id, &config);
        let algorithm = if config.token_bucket_enabled { Algorithm::TokenBucket } else { Algorithm::SlidingWindow };

        let mut metrics = self.metrics.get_or_create(&key, now);
        if metrics.algorithm != algorithm {
            self.metrics.update(&key, now, |m| m.algorithm = algorithm);
            metrics.algorithm = algorithm;
        }

        let breaker_state = if config.circuit_breaker_enabled {
            let state = self.breakers.check_gate(&key, now);
            self.metrics.update(&key, now, |m| m.circuit_breaker_state = state);
            Some(state)
        } else {
            None
        };

        let factor = if config.adaptive_enabled { metrics.adaptation_factor } else { 1.0 };

        if breaker_state == Some(CircuitState::Open) {
            // Hard veto independent of remaining quota
            return Ok(RateLimitResult {
                allowed: false,
                remaining_requests: 0,
                reset_time: now + self.breakers.open_timeout_ms(),
                retry_after: Some(self.breakers.retry_after_secs()),
                circuit_breaker_status: Some(CircuitState::Open),
                adaptive_delay: None,
                metadata: Self::metadata(algorithm, 0, &metrics, factor, &config),
            });
        }

        let limits = EffectiveLimits::from_config(&config, factor);
        let decision = match algorithm {
            Algorithm::TokenBucket => self.buckets.check(&key, &limits, now),
            Algorithm::SlidingWindow => self.windows.check(&key, &limits, now),
        };

        let retry_after = self.retry_hint(&metrics, &decision, now);

        let adaptive_delay = if decision.allowed && config.adaptive_enabled {
            let delay = adaptive::suggest_delay(metrics.average_response_time, metrics.success_rate, factor, &self.settings.thresholds);
            (delay > 0).then_some(delay)
        } else {
            None
        };

        Ok(RateLimitResult {
            allowed: decision.allowed,
            remaining_requests: decision.remaining,
            reset_time: decision.reset_time,
            retry_after,
            circuit_breaker_status: breaker_state,
            adaptive_delay,
            metadata: Self::metadata(algorithm, decision.current_requests, &metrics, factor, &config),
        })
    }

    /// Fold the provider throttle hint into the algorithm's retry estimate
    fn retry_hint(&self, metrics: &EndpointMetrics, decision: &Decision, now: u64) -> Option<u64> {
        if decision.allowed {
            return None;
        }

        let mut retry = decision.retry_after_secs;
        if let Some(until) = metrics.throttled_until {
            if until > now {
                let hint = until.saturating_sub(now).div_ceil(1000);
                retry = Some(retry.map_or(hint, |r| r.max(hint)));
            }
        }
        retry
    }

    fn metadata(algorithm: Algorithm, current_window_requests: u32, metrics: &EndpointMetrics, factor: f64, config: &RateLimitConfig) -> ResultMetadata {
        ResultMetadata {
            algorithm,
            current_window_requests,
            average_response_time: metrics.average_response_time,
            success_rate: metrics.success_rate,
            adaptation_factor: factor,
            burst_tokens: config.burst_allowance,
        }
    }

    fn fail_closed(now: u64) -> RateLimitResult {
        RateLimitResult {
            allowed: false,
            remaining_requests: 0,
            reset_time: now + FAIL_CLOSED_RETRY_SECS * 1000,
            retry_after: Some(FAIL_CLOSED_RETRY_SECS),
            circuit_breaker_status: None,
            adaptive_delay: None,
            metadata: ResultMetadata {
                algorithm: Algorithm::TokenBucket,
                current_window_requests: 0,
                average_response_time: 0.0,
                success_rate: 0.0,
                adaptation_factor: 1.0,
                burst_tokens: 0,
            },
        }
    }

    /// Report the observed outcome of a request issued after an admission.
    /// Always call this, success or failure, including on timeout and network
    /// error (`success = false`, no headers).
    pub fn record_response(&self, endpoint: &str, user_id: Option<&str>, outcome: ResponseOutcome) {
        let now = self.time.now_millis();
        let config = self.get_configuration(endpoint, user_id);
        let key = Self::make_key(endpoint, user_id, &config);

        self.metrics.update(&key, now, |m| m.record(outcome.response_time_ms, outcome.success));

        // Provider telemetry adjusts the factor ahead of the generic loop
        let throttled = outcome.status_code == Some(429);
        if throttled {
            self.apply_factor(&key, now, user_id, self.quota.throttle_penalty(), "provider throttle");
            self.breakers.record_failure(&key, now);

            let retry_hint = outcome.headers.as_ref().and_then(|h| h.retry_after_secs);
            if let Some(secs) = retry_hint {
                self.metrics.update(&key, now, |m| m.throttled_until = Some(now + secs * 1000));
            }
            tracing::warn!(key, retry_after = retry_hint, "provider throttled request");
        } else if outcome.success {
            if let Some(headers) = &outcome.headers {
                if let Some((multiplier, reason)) = self.quota.weight_adjustment(headers) {
                    self.apply_factor(&key, now, user_id, multiplier, reason);
                }
            }
        }

        if config.adaptive_enabled {
            self.maybe_adapt(&key, now, user_id, outcome.success);
        }

        if config.circuit_breaker_enabled {
            if outcome.success {
                self.breakers.record_success(&key);
            } else if !throttled {
                // 429 failures were already counted above
                self.breakers.record_failure(&key, now);
            }
            let state = self.breakers.state(&key);
            self.metrics.update(&key, now, |m| m.circuit_breaker_state = state);
        }
    }

    /// Multiply the key's factor, clamped, and audit significant moves
    fn apply_factor(&self, key: &str, now: u64, user_id: Option<&str>, multiplier: f64, reason: &str) {
        let thresholds = &self.settings.thresholds;
        let (old, new) = self.metrics.update(key, now, |m| {
            let old = m.adaptation_factor;
            m.adaptation_factor = (old * multiplier).clamp(thresholds.min_factor, thresholds.max_factor);
            (old, m.adaptation_factor)
        });

        if old != new {
            tracing::debug!(key, old, new, reason, "adaptation factor adjusted");
        }
        if (new - old).abs() > HISTORY_DELTA {
            if let Some(user) = user_id {
                self.users.push_history(user, AdaptationEvent { timestamp: now, factor: new, reason: reason.to_string() });
            }
        }
    }

    /// The generic adaptation loop, gated to one recompute per interval per
    /// key
    fn maybe_adapt(&self, key: &str, now: u64, user_id: Option<&str>, last_success: bool) {
        let thresholds = self.settings.thresholds.clone();
        let changed = self.metrics.update(key, now, |m| {
            if now.saturating_sub(m.last_adaptation) < thresholds.adaptation_interval_ms {
                return None;
            }

            let old = m.adaptation_factor;
            m.adaptation_factor = adaptive::recompute_factor(old, m.average_response_time, m.success_rate, !last_success, &thresholds);
            m.last_adaptation = now;
            Some((old, m.adaptation_factor))
        });

        if let Some((old, new)) = changed {
            if old != new {
                tracing::debug!(key, old, new, "adaptation factor recomputed");
            }
            if (new - old).abs() > HISTORY_DELTA {
                if let Some(user) = user_id {
                    self.users.push_history(user, AdaptationEvent { timestamp: now, factor: new, reason: "periodic adaptation".to_string() });
                }
            }
        }
    }

    /// Resolve the configuration snapshot for one call: defaults, endpoint
    /// override, user override, then the priority multiplier
    pub fn get_configuration(&self, endpoint: &str, user_id: Option<&str>) -> RateLimitConfig {
        let mut config = self.settings.default_config.clone();

        if config.endpoint_specific {
            if let Some(endpoint_config) = self.endpoint_overrides.get(endpoint) {
                config = endpoint_config.clone();
            }
        }

        if config.user_specific {
            if let Some(user) = user_id {
                if let Some(user_config) = self.users.custom_limits(user, endpoint) {
                    config = user_config;
                }
            }
        }

        if let Some(user) = user_id {
            if let Some(level) = self.users.priority(user) {
                let multiplier = level.multiplier(&self.settings.multipliers);
                // No repair clamp here: a zero ceiling must surface through
                // validation and the fail-closed boundary, not be papered over
                config.max_requests = (f64::from(config.max_requests) * multiplier).round() as u32;
                config.burst_allowance = (f64::from(config.burst_allowance) * multiplier).round() as u32;
            }
        }

        config
    }

    pub fn set_user_priority(&self, user_id: &str, level: PriorityLevel) {
        self.users.set_priority(user_id, level);
    }

    /// Install a per-user endpoint override. Invalid bounds are rejected
    /// here, at configuration time.
    pub fn set_custom_limits(&self, user_id: &str, endpoint: &str, config: RateLimitConfig) -> Result<()> {
        config.validate()?;
        self.users.set_custom_limits(user_id, endpoint, config);
        Ok(())
    }

    /// Per-key snapshot. Keys are `endpoint` or `endpoint:user`.
    pub fn get_metrics(&self, key: &str) -> Option<EndpointMetrics> {
        self.metrics.snapshot(key)
    }

    pub fn adaptation_history(&self, user_id: &str) -> Vec<AdaptationEvent> {
        self.users.history(user_id)
    }

    pub fn get_stats(&self) -> LimiterStats {
        let snapshots = self.metrics.snapshot_all();
        let tracked_keys = snapshots.len();

        let mut token_bucket_keys = 0;
        let mut sliding_window_keys = 0;
        let mut total_requests = 0;
        let mut total_successes = 0;
        let mut total_failures = 0;
        let mut open_circuits = 0;
        let mut factor_sum = 0.0;

        for (_, metrics) in &snapshots {
            match metrics.algorithm {
                Algorithm::TokenBucket => token_bucket_keys += 1,
                Algorithm::SlidingWindow => sliding_window_keys += 1,
            }
            total_requests += metrics.total_requests;
            total_successes += metrics.successful_requests;
            total_failures += metrics.failed_requests;
            if metrics.circuit_breaker_state == CircuitState::Open {
                open_circuits += 1;
            }
            factor_sum += metrics.adaptation_factor;
        }

        LimiterStats {
            tracked_keys,
            token_bucket_keys,
            sliding_window_keys,
            total_requests,
            total_failures,
            overall_success_rate: if total_requests == 0 { 1.0 } else { total_successes as f64 / total_requests as f64 },
            open_circuits,
            average_adaptation_factor: if tracked_keys == 0 { 1.0 } else { factor_sum / tracked_keys as f64 },
        }
    }

    /// Operator escape hatch: drop all per-key state. Buckets, windows,
    /// breakers and metrics restart from their seeds; user priorities and
    /// custom limits are retained.
    pub fn emergency_reset(&self) {
        self.metrics.clear();
        self.buckets.clear();
        self.windows.clear();
        self.breakers.clear();
        tracing::warn!("emergency reset: all per-key limiter state cleared");
    }

    /// Remove keys that never saw a recorded outcome and have aged out.
    /// Eligibility is re-verified under the shard lock at delete time, so an
    /// in-flight check/record on the same key cannot race the sweep.
    pub fn sweep(&self) -> usize {
        let now = self.time.now_millis();
        let max_age = self.settings.max_idle_age_ms;

        let mut stale = Vec::new();
        self.metrics.retain(|key, metrics| {
            let idle = metrics.total_requests == 0 && now.saturating_sub(metrics.created_at) > max_age;
            if idle {
                stale.push(key.to_string());
            }
            !idle
        });

        for key in &stale {
            self.buckets.remove(key);
            self.windows.remove(key);
            self.breakers.remove(key);
        }

        if !stale.is_empty() {
            tracing::debug!(removed = stale.len(), "swept idle rate limit keys");
        }
        stale.len()
    }

    /// Start the periodic sweep on the current tokio runtime. The returned
    /// handle stops the task at shutdown; no ambient un-cancelable timer.
    pub fn start_sweeper(self: &Arc<Self>) -> SweeperHandle {
        let running = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&running);
        let limiter = Arc::clone(self);
        let interval_ms = self.settings.sweep_interval_ms;

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately
            interval.tick().await;

            while flag.load(Ordering::Relaxed) {
                interval.tick().await;
                limiter.sweep();
            }
        });

        SweeperHandle { running, handle }
    }

    fn make_key(endpoint: &str, user_id: Option<&str>, config: &RateLimitConfig) -> String {
        match user_id {
            Some(user) if config.user_specific => format!("{endpoint}:{user}"),
            _ => endpoint.to_string(),
        }
    }
}

/// Cancellation handle for the background sweep task
pub struct SweeperHandle {
    running: Arc<AtomicBool>,
    handle: tokio::task::JoinHandle<()>,
}

impl SweeperHandle {
    pub fn stop(&self) {
        self.running.store(false, Ordering::Relaxed);
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AdaptiveThresholds;
    use crate::config::BreakerSettings;

    fn sliding_settings() -> LimiterSettings {
        LimiterSettings {
            default_config: RateLimitConfig { token_bucket_enabled: false, ..Default::default() },
            ..Default::default()
        }
    }

    /// Thresholds that recompute the factor on every recorded outcome
    fn eager_thresholds() -> AdaptiveThresholds {
        AdaptiveThresholds { adaptation_interval_ms: 0, ..Default::default() }
    }

    #[test]
    fn test_sliding_window_admits_120_then_denies() {
        let limiter = AdaptiveRateLimiter::new(sliding_settings()).unwrap();

        for call in 1..=120 {
            let result = limiter.check_rate_limit("signal", None);
            assert!(result.allowed, "call {call} should be admitted");
            assert_eq!(result.metadata.algorithm, Algorithm::SlidingWindow);
        }

        let denied = limiter.check_rate_limit("signal", None);
        assert!(!denied.allowed);
        assert!(denied.retry_after.unwrap() > 0);
    }

    #[test]
    fn test_token_bucket_default_algorithm() {
        let limiter = AdaptiveRateLimiter::with_defaults();

        let result = limiter.check_rate_limit("signal", None);
        assert!(result.allowed);
        assert_eq!(result.metadata.algorithm, Algorithm::TokenBucket);
        assert_eq!(result.metadata.burst_tokens, 20);
        assert_eq!(result.remaining_requests, 119);
    }

    #[test]
    fn test_circuit_trips_after_three_failures() {
        let limiter = AdaptiveRateLimiter::with_defaults();

        for _ in 0..3 {
            limiter.record_response("signal", None, ResponseOutcome::failure(100));
        }

        let result = limiter.check_rate_limit("signal", None);
        assert!(!result.allowed);
        assert_eq!(result.circuit_breaker_status, Some(CircuitState::Open));
        assert_eq!(result.retry_after, Some(30));
    }

    #[test]
    fn test_circuit_recovery_cycle() {
        let settings = LimiterSettings {
            breaker: BreakerSettings { failure_threshold: 3, open_timeout_ms: 50, open_retry_after_secs: 30 },
            ..Default::default()
        };
        let limiter = AdaptiveRateLimiter::new(settings).unwrap();

        for _ in 0..3 {
            limiter.record_response("signal", None, ResponseOutcome::failure(100));
        }
        assert!(!limiter.check_rate_limit("signal", None).allowed);

        std::thread::sleep(Duration::from_millis(70));

        // Timeout elapsed: the probe is admitted through the half-open gate
        let probe = limiter.check_rate_limit("signal", None);
        assert!(probe.allowed);
        assert_eq!(probe.circuit_breaker_status, Some(CircuitState::HalfOpen));

        limiter.record_response("signal", None, ResponseOutcome::success(100));

        let recovered = limiter.check_rate_limit("signal", None);
        assert!(recovered.allowed);
        assert_eq!(recovered.circuit_breaker_status, Some(CircuitState::Closed));
    }

    #[test]
    fn test_circuit_disabled_never_gates() {
        let settings = LimiterSettings {
            default_config: RateLimitConfig { circuit_breaker_enabled: false, ..Default::default() },
            ..Default::default()
        };
        let limiter = AdaptiveRateLimiter::new(settings).unwrap();

        for _ in 0..5 {
            limiter.record_response("signal", None, ResponseOutcome::failure(100));
        }

        let result = limiter.check_rate_limit("signal", None);
        assert!(result.allowed);
        assert_eq!(result.circuit_breaker_status, None);
    }

    #[test]
    fn test_priority_scaling_premium_doubles_ceiling() {
        let limiter = AdaptiveRateLimiter::with_defaults();
        limiter.set_user_priority("user-1", PriorityLevel::Premium);

        let config = limiter.get_configuration("signal", Some("user-1"));
        assert_eq!(config.max_requests, 200);
        assert_eq!(config.burst_allowance, 40);

        limiter.set_user_priority("user-2", PriorityLevel::Low);
        let config = limiter.get_configuration("signal", Some("user-2"));
        assert_eq!(config.max_requests, 50);
        assert_eq!(config.burst_allowance, 10);
    }

    #[test]
    fn test_configuration_merge_order() {
        let limiter = AdaptiveRateLimiter::with_defaults();

        // Endpoint override from the exchange table
        assert_eq!(limiter.get_configuration("order", None).max_requests, 50);

        // User override beats the endpoint override
        limiter.set_custom_limits("user-1", "order", RateLimitConfig { max_requests: 10, ..Default::default() }).unwrap();
        assert_eq!(limiter.get_configuration("order", Some("user-1")).max_requests, 10);

        // Priority multiplier scales the merged result
        limiter.set_user_priority("user-1", PriorityLevel::Premium);
        assert_eq!(limiter.get_configuration("order", Some("user-1")).max_requests, 20);
    }

    #[test]
    fn test_custom_limits_round_trip() {
        let limiter = AdaptiveRateLimiter::with_defaults();

        limiter.set_custom_limits("user-1", "orders", RateLimitConfig { max_requests: 10, ..Default::default() }).unwrap();
        assert_eq!(limiter.get_configuration("orders", Some("user-1")).max_requests, 10);

        // Other users and endpoints are unaffected
        assert_eq!(limiter.get_configuration("orders", Some("user-2")).max_requests, 100);
    }

    #[test]
    fn test_custom_limits_rejects_invalid_bounds() {
        let limiter = AdaptiveRateLimiter::with_defaults();

        let result = limiter.set_custom_limits("user-1", "orders", RateLimitConfig { max_requests: 0, ..Default::default() });
        assert!(result.is_err());
    }

    #[test]
    fn test_invalid_settings_rejected_at_construction() {
        let settings = LimiterSettings {
            default_config: RateLimitConfig { max_requests: 0, ..Default::default() },
            ..Default::default()
        };
        assert!(AdaptiveRateLimiter::new(settings).is_err());
    }

    #[test]
    fn test_check_never_fails_even_with_corrupt_configuration() {
        // Bypass configuration-time validation to exercise the fail-closed
        // boundary
        let limiter = AdaptiveRateLimiter::with_defaults();
        limiter.users.set_custom_limits("user-1", "signal", RateLimitConfig { max_requests: 0, ..Default::default() });

        let result = limiter.check_rate_limit("signal", Some("user-1"));
        assert!(!result.allowed);
        assert_eq!(result.retry_after, Some(60));
    }

    #[test]
    fn test_priority_rounding_keeps_valid_tiny_ceilings() {
        let limiter = AdaptiveRateLimiter::with_defaults();
        limiter.set_custom_limits("user-1", "signal", RateLimitConfig { max_requests: 1, ..Default::default() }).unwrap();
        limiter.set_user_priority("user-1", PriorityLevel::Low);

        // 1 x 0.5 rounds back to 1, so the merged config stays valid
        let config = limiter.get_configuration("signal", Some("user-1"));
        assert_eq!(config.max_requests, 1);
        assert!(limiter.check_rate_limit("signal", Some("user-1")).allowed);
    }

    #[test]
    fn test_check_survives_extreme_ceilings() {
        let limiter = AdaptiveRateLimiter::with_defaults();
        limiter.set_custom_limits("user-1", "signal", RateLimitConfig { max_requests: u32::MAX, burst_allowance: u32::MAX, ..Default::default() }).unwrap();
        limiter.set_user_priority("user-1", PriorityLevel::Premium);

        // Scaling saturates instead of wrapping or panicking
        let result = limiter.check_rate_limit("signal", Some("user-1"));
        assert!(result.allowed);
    }

    #[test]
    fn test_adaptation_contracts_on_failures() {
        let settings = LimiterSettings { thresholds: eager_thresholds(), ..Default::default() };
        let limiter = AdaptiveRateLimiter::new(settings).unwrap();

        for _ in 0..5 {
            limiter.record_response("signal", None, ResponseOutcome::failure(6_000));
        }

        let metrics = limiter.get_metrics("signal").unwrap();
        assert!(metrics.adaptation_factor < 1.0);
        assert!(metrics.adaptation_factor >= 0.1);
    }

    #[test]
    fn test_adaptation_expands_when_healthy() {
        let settings = LimiterSettings { thresholds: eager_thresholds(), ..Default::default() };
        let limiter = AdaptiveRateLimiter::new(settings).unwrap();

        for _ in 0..60 {
            limiter.record_response("signal", None, ResponseOutcome::success(100));
        }

        let metrics = limiter.get_metrics("signal").unwrap();
        assert!(metrics.adaptation_factor > 1.0);
        assert!(metrics.adaptation_factor <= 2.0);
    }

    #[test]
    fn test_adaptation_gated_by_interval() {
        // Default 30s interval: a burst of outcomes recomputes at most once
        let limiter = AdaptiveRateLimiter::with_defaults();

        for _ in 0..20 {
            limiter.record_response("signal", None, ResponseOutcome::failure(6_000));
        }

        let metrics = limiter.get_metrics("signal").unwrap();
        // The per-call multipliers never ran; only provider signals could
        // have moved the factor, and there were none
        assert_eq!(metrics.adaptation_factor, 1.0);
    }

    #[test]
    fn test_throttle_halves_factor_and_surfaces_retry_hint() {
        let settings = LimiterSettings {
            default_config: RateLimitConfig { max_requests: 1, burst_allowance: 0, ..Default::default() },
            ..Default::default()
        };
        let limiter = AdaptiveRateLimiter::new(settings).unwrap();

        assert!(limiter.check_rate_limit("order-test", None).allowed);

        let headers = QuotaHeaders { retry_after_secs: Some(7), ..Default::default() };
        limiter.record_response("order-test", None, ResponseOutcome::failure(100).with_status(429).with_headers(headers));

        let metrics = limiter.get_metrics("order-test").unwrap();
        assert_eq!(metrics.adaptation_factor, 0.5);
        assert!(metrics.throttled_until.is_some());

        let denied = limiter.check_rate_limit("order-test", None);
        assert!(!denied.allowed);
        assert!(denied.retry_after.unwrap() >= 7);
    }

    #[test]
    fn test_retry_hint_prefers_longer_provider_deadline() {
        let limiter = AdaptiveRateLimiter::with_defaults();

        let mut metrics = EndpointMetrics::new(0);
        metrics.throttled_until = Some(10_000);
        let denied = Decision { allowed: false, remaining: 0, reset_time: 3_000, retry_after_secs: Some(3), current_requests: 1 };

        // Provider deadline 10s out dominates the algorithm's 3s estimate
        assert_eq!(limiter.retry_hint(&metrics, &denied, 0), Some(10));

        // Expired deadline falls back to the algorithm
        assert_eq!(limiter.retry_hint(&metrics, &denied, 20_000), Some(3));

        // Admissions carry no hint
        let allowed = Decision { allowed: true, ..denied };
        assert_eq!(limiter.retry_hint(&metrics, &allowed, 0), None);
    }

    #[test]
    fn test_weight_pressure_tightens_factor() {
        let limiter = AdaptiveRateLimiter::with_defaults();

        let headers = QuotaHeaders { used_weight_1m: Some(1_140), ..Default::default() };
        limiter.record_response("signal", Some("user-1"), ResponseOutcome::success(100).with_headers(headers));

        let metrics = limiter.get_metrics("signal:user-1").unwrap();
        assert!((metrics.adaptation_factor - 0.85).abs() < 1e-9);

        // A 0.15 move lands in the user's audit ring
        let history = limiter.adaptation_history("user-1");
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].reason, "provider weight pressure");
    }

    #[test]
    fn test_adaptive_delay_suggested_under_stress() {
        // Breaker disabled so the stressed key still reaches the algorithm
        let settings = LimiterSettings {
            default_config: RateLimitConfig { circuit_breaker_enabled: false, ..Default::default() },
            thresholds: eager_thresholds(),
            ..Default::default()
        };
        let limiter = AdaptiveRateLimiter::new(settings).unwrap();

        for _ in 0..30 {
            limiter.record_response("signal", None, ResponseOutcome::failure(8_000));
        }

        let result = limiter.check_rate_limit("signal", None);
        assert!(result.allowed);
        // 5s latency penalty stretched by the contracted factor
        assert!(result.adaptive_delay.unwrap() >= 5_000);
    }

    #[test]
    fn test_no_delay_when_healthy() {
        let limiter = AdaptiveRateLimiter::with_defaults();
        limiter.record_response("signal", None, ResponseOutcome::success(100));

        let result = limiter.check_rate_limit("signal", None);
        assert!(result.allowed);
        assert_eq!(result.adaptive_delay, None);
    }

    #[test]
    fn test_adaptive_disabled_pins_factor() {
        let settings = LimiterSettings {
            default_config: RateLimitConfig { adaptive_enabled: false, ..Default::default() },
            thresholds: eager_thresholds(),
            ..Default::default()
        };
        let limiter = AdaptiveRateLimiter::new(settings).unwrap();

        for _ in 0..10 {
            limiter.record_response("signal", None, ResponseOutcome::failure(8_000));
        }

        let result = limiter.check_rate_limit("signal", None);
        assert_eq!(result.metadata.adaptation_factor, 1.0);
        assert_eq!(result.adaptive_delay, None);
    }

    #[test]
    fn test_user_specific_keys_are_isolated() {
        let settings = LimiterSettings {
            default_config: RateLimitConfig { max_requests: 2, burst_allowance: 0, token_bucket_enabled: false, ..Default::default() },
            ..Default::default()
        };
        let limiter = AdaptiveRateLimiter::new(settings).unwrap();

        assert!(limiter.check_rate_limit("signal", Some("user-1")).allowed);
        assert!(limiter.check_rate_limit("signal", Some("user-1")).allowed);
        assert!(!limiter.check_rate_limit("signal", Some("user-1")).allowed);

        // Another user's quota is untouched
        assert!(limiter.check_rate_limit("signal", Some("user-2")).allowed);
    }

    #[test]
    fn test_sweep_removes_idle_keys_keeps_active() {
        let settings = LimiterSettings { max_idle_age_ms: 50, ..Default::default() };
        let limiter = AdaptiveRateLimiter::new(settings).unwrap();

        limiter.check_rate_limit("idle", None);
        limiter.check_rate_limit("active", None);
        limiter.record_response("active", None, ResponseOutcome::success(100));

        std::thread::sleep(Duration::from_millis(70));
        let removed = limiter.sweep();

        assert_eq!(removed, 1);
        assert!(limiter.get_metrics("idle").is_none());
        // Traffic keeps a key alive regardless of age
        assert!(limiter.get_metrics("active").is_some());
    }

    #[test]
    fn test_sweep_spares_young_idle_keys() {
        let settings = LimiterSettings { max_idle_age_ms: 60_000, ..Default::default() };
        let limiter = AdaptiveRateLimiter::new(settings).unwrap();

        limiter.check_rate_limit("idle", None);
        assert_eq!(limiter.sweep(), 0);
        assert!(limiter.get_metrics("idle").is_some());
    }

    #[tokio::test]
    async fn test_background_sweeper_runs_and_stops() {
        let settings = LimiterSettings { sweep_interval_ms: 20, max_idle_age_ms: 10, ..Default::default() };
        let limiter = Arc::new(AdaptiveRateLimiter::new(settings).unwrap());

        limiter.check_rate_limit("idle", None);
        let sweeper = limiter.start_sweeper();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(limiter.get_metrics("idle").is_none());

        sweeper.stop();
    }

    #[test]
    fn test_emergency_reset_clears_state_keeps_users() {
        let limiter = AdaptiveRateLimiter::with_defaults();
        limiter.set_user_priority("user-1", PriorityLevel::Premium);

        limiter.check_rate_limit("signal", None);
        limiter.record_response("signal", None, ResponseOutcome::failure(100));

        limiter.emergency_reset();

        assert!(limiter.get_metrics("signal").is_none());
        assert_eq!(limiter.get_stats().tracked_keys, 0);
        // Tenant configuration survives the reset
        assert_eq!(limiter.get_configuration("signal", Some("user-1")).max_requests, 200);
    }

    #[test]
    fn test_stats_aggregation() {
        let limiter = AdaptiveRateLimiter::with_defaults();

        limiter.record_response("signal", None, ResponseOutcome::success(100));
        limiter.record_response("signal", None, ResponseOutcome::failure(100));
        limiter.record_response("klines", None, ResponseOutcome::success(100));

        let stats = limiter.get_stats();
        assert_eq!(stats.tracked_keys, 2);
        assert_eq!(stats.total_requests, 3);
        assert_eq!(stats.total_failures, 1);
        assert!((stats.overall_success_rate - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(stats.open_circuits, 0);
    }

    #[test]
    fn test_stats_count_keys_per_algorithm() {
        let limiter = AdaptiveRateLimiter::with_defaults();
        limiter.set_custom_limits("user-1", "depth", RateLimitConfig { token_bucket_enabled: false, ..Default::default() }).unwrap();

        limiter.check_rate_limit("signal", None);
        limiter.check_rate_limit("depth", Some("user-1"));

        let stats = limiter.get_stats();
        assert_eq!(stats.tracked_keys, 2);
        assert_eq!(stats.token_bucket_keys, 1);
        assert_eq!(stats.sliding_window_keys, 1);
    }

    #[test]
    fn test_concurrent_checks_admit_exactly_ceiling() {
        let settings = LimiterSettings {
            default_config: RateLimitConfig { max_requests: 80, burst_allowance: 20, token_bucket_enabled: false, ..Default::default() },
            ..Default::default()
        };
        let limiter = Arc::new(AdaptiveRateLimiter::new(settings).unwrap());
        let mut handles = vec![];

        for _ in 0..10 {
            let limiter_clone = Arc::clone(&limiter);
            let handle = std::thread::spawn(move || {
                let mut admitted = 0;
                for _ in 0..20 {
                    if limiter_clone.check_rate_limit("signal", None).allowed {
                        admitted += 1;
                    }
                }
                admitted
            });
            handles.push(handle);
        }

        let total: u32 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, 100);
    }

    #[test]
    fn test_metadata_reflects_observed_state() {
        let limiter = AdaptiveRateLimiter::with_defaults();
        limiter.record_response("signal", None, ResponseOutcome::success(500));

        let result = limiter.check_rate_limit("signal", None);
        assert!(result.allowed);
        assert_eq!(result.metadata.success_rate, 1.0);
        // EMA folded the 500ms observation into the 1000ms seed
        assert!((result.metadata.average_response_time - 950.0).abs() < f64::EPSILON);
        assert_eq!(result.metadata.adaptation_factor, 1.0);
    }
}
