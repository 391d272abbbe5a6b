//! Self-tuning feedback: the adaptation-factor recompute and the soft
//! backoff suggestion, both driven by observed latency and success rate.

use crate::config::AdaptiveThresholds;

// Multipliers applied per recompute. Contraction is deliberately steeper than
// expansion so the limiter backs off fast and recovers gradually.
const VERY_SLOW_CONTRACT: f64 = 0.7;
const SLOW_CONTRACT: f64 = 0.85;
const FAST_EXPAND: f64 = 1.05;
const VERY_LOW_SUCCESS_CONTRACT: f64 = 0.5;
const LOW_SUCCESS_CONTRACT: f64 = 0.8;
const HIGH_SUCCESS_EXPAND: f64 = 1.1;
const FAILURE_CONTRACT: f64 = 0.9;

// Delay suggestions in milliseconds, before the factor division
const VERY_SLOW_DELAY_MS: u64 = 5_000;
const SLOW_DELAY_MS: u64 = 2_000;
const VERY_LOW_SUCCESS_DELAY_MS: u64 = 3_000;
const LOW_SUCCESS_DELAY_MS: u64 = 1_000;

/// One step of the adaptation loop. Pure: the caller owns the 30s gating and
/// the write-back.
pub(crate) fn recompute_factor(
    current: f64,
    average_response_time: f64,
    success_rate: f64,
    last_call_failed: bool,
    thresholds: &AdaptiveThresholds,
) -> f64 {
    let mut factor = current;

    if average_response_time > thresholds.very_slow_ms {
        factor *= VERY_SLOW_CONTRACT;
    } else if average_response_time > thresholds.slow_ms {
        factor *= SLOW_CONTRACT;
    } else if average_response_time < thresholds.fast_ms {
        factor *= FAST_EXPAND;
    }

    if success_rate < thresholds.very_low_success {
        factor *= VERY_LOW_SUCCESS_CONTRACT;
    } else if success_rate < thresholds.low_success {
        factor *= LOW_SUCCESS_CONTRACT;
    } else if success_rate > thresholds.high_success {
        factor *= HIGH_SUCCESS_EXPAND;
    }

    if last_call_failed {
        factor *= FAILURE_CONTRACT;
    }

    factor.clamp(thresholds.min_factor, thresholds.max_factor)
}

/// Soft backoff hint returned alongside admitted requests. Zero means no
/// delay; a contracted factor stretches the suggestion.
pub(crate) fn suggest_delay(average_response_time: f64, success_rate: f64, factor: f64, thresholds: &AdaptiveThresholds) -> u64 {
    let mut delay: u64 = 0;

    if average_response_time > thresholds.very_slow_ms {
        delay = VERY_SLOW_DELAY_MS;
    } else if average_response_time > thresholds.slow_ms {
        delay = SLOW_DELAY_MS;
    }

    if success_rate < thresholds.very_low_success {
        delay = delay.max(VERY_LOW_SUCCESS_DELAY_MS);
    } else if success_rate < thresholds.low_success {
        delay = delay.max(LOW_SUCCESS_DELAY_MS);
    }

    if delay == 0 {
        return 0;
    }

    ((delay as f64 / factor) as u64).max(thresholds.min_delay_ms)
}
