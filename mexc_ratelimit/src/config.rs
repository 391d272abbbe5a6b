use std::path::Path;

use config::Config;
use config::File;
use serde::Deserialize;

use crate::error::RateLimitError;
use crate::error::Result;

/// Per-endpoint/user rate limit configuration
///
/// An immutable snapshot of this struct is resolved for every admission check
/// by merging defaults, endpoint overrides, user overrides and the priority
/// multiplier.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Window length in milliseconds (default: 60s)
    pub window_ms: u64,

    /// Steady-state request ceiling per window (default: 100)
    pub max_requests: u32,

    /// Extra requests admitted above the adapted ceiling (default: 20)
    pub burst_allowance: u32,

    /// Scale limits with the observed-health adaptation factor (default: true)
    pub adaptive_enabled: bool,

    /// Gate admissions behind the per-key circuit breaker (default: true)
    pub circuit_breaker_enabled: bool,

    /// Select the token bucket over the sliding window (default: true)
    pub token_bucket_enabled: bool,

    /// Track state per `endpoint:user` instead of per endpoint (default: true)
    pub user_specific: bool,

    /// Consult the exchange endpoint override table (default: true)
    pub endpoint_specific: bool,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_ms: 60_000,
            max_requests: 100,
            burst_allowance: 20,
            adaptive_enabled: true,
            circuit_breaker_enabled: true,
            token_bucket_enabled: true,
            user_specific: true,
            endpoint_specific: true,
        }
    }
}

impl RateLimitConfig {
    /// Validate bounds. Invalid configuration is rejected here, at
    /// configuration time, never per request.
    pub fn validate(&self) -> Result<()> {
        if self.max_requests == 0 {
            return Err(RateLimitError::InvalidConfig("max_requests must be greater than 0".into()));
        }
        if self.window_ms == 0 {
            return Err(RateLimitError::InvalidConfig("window_ms must be greater than 0".into()));
        }
        Ok(())
    }
}

/// Latency and success-rate thresholds driving the adaptation loop
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AdaptiveThresholds {
    /// EMA latency above which the factor contracts hard (default: 5000ms)
    pub very_slow_ms: f64,

    /// EMA latency above which the factor contracts (default: 2000ms)
    pub slow_ms: f64,

    /// EMA latency below which the factor expands (default: 500ms)
    pub fast_ms: f64,

    /// Success rate below which the factor halves (default: 0.6)
    pub very_low_success: f64,

    /// Success rate below which the factor contracts (default: 0.8)
    pub low_success: f64,

    /// Success rate above which the factor expands (default: 0.95)
    pub high_success: f64,

    /// Lower clamp on the adaptation factor (default: 0.1)
    pub min_factor: f64,

    /// Upper clamp on the adaptation factor (default: 2.0)
    pub max_factor: f64,

    /// Minimum spacing between factor recomputes per key (default: 30s)
    pub adaptation_interval_ms: u64,

    /// Floor on the adaptive delay suggestion (default: 100ms)
    pub min_delay_ms: u64,
}

impl Default for AdaptiveThresholds {
    fn default() -> Self {
        Self {
            very_slow_ms: 5_000.0,
            slow_ms: 2_000.0,
            fast_ms: 500.0,
            very_low_success: 0.6,
            low_success: 0.8,
            high_success: 0.95,
            min_factor: 0.1,
            max_factor: 2.0,
            adaptation_interval_ms: 30_000,
            min_delay_ms: 100,
        }
    }
}

/// Per-tier scaling applied to `max_requests` and `burst_allowance`
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PriorityMultipliers {
    pub low: f64,
    pub medium: f64,
    pub high: f64,
    pub premium: f64,
}

impl Default for PriorityMultipliers {
    fn default() -> Self {
        Self { low: 0.5, medium: 1.0, high: 1.5, premium: 2.0 }
    }
}

/// Circuit breaker tuning
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BreakerSettings {
    /// Consecutive failures that open the circuit (default: 3)
    pub failure_threshold: u32,

    /// Time an open circuit waits before allowing a probe (default: 60s)
    pub open_timeout_ms: u64,

    /// retry_after reported while the circuit is open (default: 30s)
    pub open_retry_after_secs: u64,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self { failure_threshold: 3, open_timeout_ms: 60_000, open_retry_after_secs: 30 }
    }
}

/// Provider quota interpretation tuning
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QuotaSettings {
    /// Per-minute request weight ceiling on the provider side (default: 1200)
    pub weight_limit_1m: u32,

    /// Utilization at which the factor tightens proportionally (default: 0.8)
    pub tighten_utilization: f64,

    /// Utilization below which the factor relaxes gently (default: 0.5)
    pub relax_utilization: f64,

    /// Multiplier forced onto the factor on an HTTP 429 (default: 0.5)
    pub throttle_penalty: f64,
}

impl Default for QuotaSettings {
    fn default() -> Self {
        Self { weight_limit_1m: 1_200, tighten_utilization: 0.8, relax_utilization: 0.5, throttle_penalty: 0.5 }
    }
}

/// Construction-time settings for the limiter
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimiterSettings {
    pub default_config: RateLimitConfig,
    pub thresholds: AdaptiveThresholds,
    pub multipliers: PriorityMultipliers,
    pub breaker: BreakerSettings,
    pub quota: QuotaSettings,

    /// Spacing between background sweep runs in milliseconds (default: 5min)
    pub sweep_interval_ms: u64,

    /// Age beyond which a zero-traffic key is swept, in milliseconds (default: 1h)
    pub max_idle_age_ms: u64,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            default_config: RateLimitConfig::default(),
            thresholds: AdaptiveThresholds::default(),
            multipliers: PriorityMultipliers::default(),
            breaker: BreakerSettings::default(),
            quota: QuotaSettings::default(),
            sweep_interval_ms: 300_000,
            max_idle_age_ms: 3_600_000,
        }
    }
}

impl LimiterSettings {
    pub fn validate(&self) -> Result<()> {
        self.default_config.validate()
    }
}

pub fn load_settings<P: AsRef<Path>>(path: P) -> Result<LimiterSettings> {
    let config = Config::builder().add_source(File::from(path.as_ref())).build()?;

    let settings: LimiterSettings = config.try_deserialize()?;
    settings.validate()?;

    Ok(settings)
}

/// Load limiter settings with fallback to defaults
pub fn load_settings_or_default(path: &str) -> LimiterSettings {
    match load_settings(path) {
        Ok(settings) => {
            tracing::info!("Loaded limiter settings from {path}");
            settings
        }
        Err(err) => {
            tracing::warn!("Failed to load limiter settings from {}: {}. Using defaults.", path, err);
            LimiterSettings::default()
        }
    }
}
