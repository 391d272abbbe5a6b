use crate::config::RateLimitConfig;

/// Admission algorithm selected per configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    TokenBucket,
    SlidingWindow,
}

/// Effective per-check ceilings after adaptation-factor scaling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffectiveLimits {
    pub window_ms: u64,

    /// `floor(max_requests * factor)`, never below 1
    pub adapted_max: u32,

    /// `adapted_max + burst_allowance`
    pub max_with_burst: u32,
}

impl EffectiveLimits {
    pub fn from_config(config: &RateLimitConfig, factor: f64) -> Self {
        // A fully penalized key still admits at a trickle rate rather than
        // starving outright.
        let adapted_max = ((f64::from(config.max_requests) * factor).floor() as u32).max(1);

        Self { window_ms: config.window_ms, adapted_max, max_with_burst: adapted_max.saturating_add(config.burst_allowance) }
    }
}

/// Verdict shared by both admission algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,

    /// Requests still admissible in the current window/bucket
    pub remaining: u32,

    /// Millisecond timestamp at which quota is restored
    pub reset_time: u64,

    /// Seconds the caller should wait before retrying, on denial
    pub retry_after_secs: Option<u64>,

    /// Requests counted against the current window/bucket, this one included
    pub current_requests: u32,
}

/// Contract shared by the token bucket and sliding window stores so the
/// orchestrator can switch between them per configuration flag without
/// changing callers.
pub trait Admission {
    /// Decide admission for `key` under `limits` at time `now`. The decision
    /// and any state mutation happen atomically per key.
    fn check(&self, key: &str, limits: &EffectiveLimits, now: u64) -> Decision;

    /// Drop per-key state
    fn remove(&self, key: &str);

    /// Drop all state
    fn clear(&self);
}
