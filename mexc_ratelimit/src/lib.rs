//! Adaptive rate limiting for outbound exchange API traffic
//!
//! Admission control in front of a rate-limited provider: token bucket or
//! sliding window per key, scaled by a self-tuning adaptation factor, gated
//! by a per-key circuit breaker and corrected by the provider's own quota
//! telemetry (used-weight headers, HTTP 429, Retry-After).
//!
//! ```no_run
//! use mexc_ratelimit::AdaptiveRateLimiter;
//! use mexc_ratelimit::ResponseOutcome;
//!
//! let limiter = AdaptiveRateLimiter::with_defaults();
//!
//! let verdict = limiter.check_rate_limit("order", Some("desk-1"));
//! if verdict.allowed {
//!     // issue the request, then always report the outcome
//!     limiter.record_response("order", Some("desk-1"), ResponseOutcome::success(85));
//! }
//! ```

pub mod admission;
pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod exchanges;
pub mod limiter;
pub mod metrics;
pub mod sliding_window;
pub mod token_bucket;
pub mod user;

mod adaptive;
mod store;
mod time;

pub use admission::Algorithm;
pub use circuit_breaker::CircuitState;
pub use config::LimiterSettings;
pub use config::RateLimitConfig;
pub use config::load_settings;
pub use config::load_settings_or_default;
pub use error::RateLimitError;
pub use error::Result;
pub use exchanges::mexc::QuotaHeaders;
pub use limiter::AdaptiveRateLimiter;
pub use limiter::LimiterStats;
pub use limiter::RateLimitResult;
pub use limiter::ResponseOutcome;
pub use limiter::SweeperHandle;
pub use metrics::EndpointMetrics;
pub use user::AdaptationEvent;
pub use user::PriorityLevel;
