use thiserror::Error;

/// Result type for rate limiting operations
pub type Result<T> = std::result::Result<T, RateLimitError>;

/// Errors that can occur during rate limiting operations
#[derive(Error, Debug)]
pub enum RateLimitError {
    #[error("invalid rate limit configuration: {0}")]
    InvalidConfig(String),

    #[error("corrupted limiter state for {key}: {reason}")]
    CorruptState { key: String, reason: String },

    #[error("failed to load limiter settings: {0}")]
    SettingsLoad(#[from] config::ConfigError),

    #[error("unknown priority level: {0}")]
    UnknownPriority(String),
}
