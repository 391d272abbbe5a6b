//! MEXC spot API quota interpretation
//!
//! MEXC mirrors the Binance spot conventions for rate-limit telemetry:
//! - **used weight**: per-minute weighted request counters in response headers
//! - **HTTP 429**: explicit throttle, optionally with a `Retry-After` header
//! - per-endpoint request weights (order placement is cheap, account state is
//!   expensive)
//!
//! Reference: https://mexcdevelop.github.io/apidocs/spot_v3_en/#limits

use std::collections::HashMap;

use crate::config::QuotaSettings;
use crate::config::RateLimitConfig;

const SPOT_ENDPOINTS: [&str; 8] = ["order", "openOrders", "allOrders", "account", "depth", "klines", "ticker", "exchangeInfo"];

pub const HEADER_USED_WEIGHT: &str = "x-mbx-used-weight";
pub const HEADER_USED_WEIGHT_1M: &str = "x-mbx-used-weight-1m";
pub const HEADER_ORDER_COUNT_10S: &str = "x-mbx-order-count-10s";
pub const HEADER_RETRY_AFTER: &str = "retry-after";

/// Gentle expansion applied while provider weight utilization is low
const RELAX_STEP: f64 = 1.02;

/// Hard floor on the proportional tightening multiplier
const TIGHTEN_FLOOR: f64 = 0.5;

/// Quota telemetry extracted from provider response headers
///
/// Typed extraction: the provider's header formats are finite and known, so
/// presence/absence is explicit rather than a string map.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuotaHeaders {
    /// Request weight consumed in the current minute
    pub used_weight_1m: Option<u32>,

    /// Orders placed in the current 10 second bucket
    pub order_count_10s: Option<u32>,

    /// Provider-suggested wait after a throttle, in seconds
    pub retry_after_secs: Option<u64>,
}

impl QuotaHeaders {
    /// Extract quota telemetry from `(name, value)` pairs. Names are matched
    /// case-insensitively; unparseable values are treated as absent.
    pub fn parse<'a>(headers: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let mut parsed = Self::default();

        for (name, value) in headers {
            let value = value.trim();
            if name.eq_ignore_ascii_case(HEADER_USED_WEIGHT_1M) || name.eq_ignore_ascii_case(HEADER_USED_WEIGHT) {
                parsed.used_weight_1m = value.parse().ok().or(parsed.used_weight_1m);
            } else if name.eq_ignore_ascii_case(HEADER_ORDER_COUNT_10S) {
                parsed.order_count_10s = value.parse().ok();
            } else if name.eq_ignore_ascii_case(HEADER_RETRY_AFTER) {
                parsed.retry_after_secs = value.parse().ok();
            }
        }

        parsed
    }

    pub fn is_empty(&self) -> bool {
        self.used_weight_1m.is_none() && self.order_count_10s.is_none() && self.retry_after_secs.is_none()
    }
}

/// Translates MEXC quota telemetry into adaptation-factor adjustments
pub(crate) struct QuotaAdapter {
    settings: QuotaSettings,
}

impl QuotaAdapter {
    pub fn new(settings: QuotaSettings) -> Self {
        Self { settings }
    }

    /// Proportional adjustment derived from used-weight telemetry, applied
    /// ahead of the generic success/latency loop. Returns the multiplier for
    /// the key's adaptation factor and the audit reason, or `None` when
    /// utilization sits in the neutral band.
    pub fn weight_adjustment(&self, headers: &QuotaHeaders) -> Option<(f64, &'static str)> {
        let used = headers.used_weight_1m?;
        let utilization = f64::from(used) / f64::from(self.settings.weight_limit_1m);

        if utilization >= self.settings.tighten_utilization {
            let multiplier = (1.0 - (utilization - self.settings.tighten_utilization)).max(TIGHTEN_FLOOR);
            Some((multiplier, "provider weight pressure"))
        } else if utilization <= self.settings.relax_utilization {
            Some((RELAX_STEP, "provider weight headroom"))
        } else {
            None
        }
    }

    /// Fixed penalty multiplier forced onto the factor on an HTTP 429
    pub fn throttle_penalty(&self) -> f64 {
        self.settings.throttle_penalty
    }
}

/// Request weight MEXC charges per endpoint. Unknown endpoints cost 1.
pub fn endpoint_weight(endpoint: &str) -> u32 {
    match endpoint {
        "order" | "orders" => 1,
        "openOrders" => 3,
        "allOrders" => 10,
        "account" => 10,
        "depth" => 5,
        "klines" => 1,
        "ticker" => 2,
        "exchangeInfo" => 10,
        _ => 1,
    }
}

/// MEXC Spot API per-minute request ceilings derived from endpoint weights
///
/// Limits:
/// - 1_200 weight per minute
/// - weight-1 endpoints (order placement, klines): 1_200 requests/min
/// - weight-5 depth snapshots: 240 requests/min
/// - weight-10 endpoints (account, allOrders, exchangeInfo): 120 requests/min
pub fn spot_weight_limits() -> HashMap<String, u32> {
    let weight_budget = QuotaSettings::default().weight_limit_1m;

    SPOT_ENDPOINTS
        .into_iter()
        .map(|endpoint| (endpoint.to_string(), (weight_budget / endpoint_weight(endpoint)).max(1)))
        .collect()
}

/// Endpoint-specific local ceilings, tighter than the generic default where
/// MEXC enforces stricter provider-side limits
pub fn default_overrides() -> HashMap<String, RateLimitConfig> {
    let weight_caps = spot_weight_limits();
    let cap = |endpoint: &str| weight_caps.get(endpoint).copied().unwrap_or(1);

    let mut overrides = HashMap::new();

    // Order placement: MEXC meters orders on a 10 second bucket
    overrides.insert("order".to_string(), RateLimitConfig { window_ms: 10_000, max_requests: 50, burst_allowance: 5, ..Default::default() });

    // Heavy endpoints burn the minute weight budget fastest; hold them to
    // half their weight-derived ceiling
    overrides.insert("account".to_string(), RateLimitConfig { max_requests: (cap("account") / 2).max(1), burst_allowance: 5, ..Default::default() });
    overrides.insert("depth".to_string(), RateLimitConfig { max_requests: (cap("depth") / 2).max(1), burst_allowance: 20, ..Default::default() });

    overrides
}
