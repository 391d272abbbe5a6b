use crate::admission::Admission;
use crate::admission::Decision;
use crate::admission::EffectiveLimits;
use crate::store::KeyedStore;

/// Token bucket admission state for one key
///
/// Tokens refill continuously at `capacity / window_ms` per millisecond and
/// each admitted request consumes one. Capacity is recomputed by the caller on
/// every check because the adaptation factor moves between checks; the token
/// count is clamped into the new capacity when it shrinks.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    /// Current number of available tokens
    tokens: f64,

    /// Last refill timestamp in milliseconds
    last_refill: u64,
}

impl TokenBucket {
    /// A fresh bucket starts full
    pub fn new(capacity: f64, now: u64) -> Self {
        Self { tokens: capacity, last_refill: now }
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    pub fn check(&mut self, limits: &EffectiveLimits, now: u64) -> Decision {
        let capacity = f64::from(limits.max_with_burst);
        let rate = capacity / limits.window_ms as f64;

        let elapsed = now.saturating_sub(self.last_refill) as f64;
        self.tokens = (self.tokens + elapsed * rate).clamp(0.0, capacity);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;

            Decision {
                allowed: true,
                remaining: self.tokens.floor() as u32,
                reset_time: now + limits.window_ms,
                retry_after_secs: None,
                current_requests: limits.max_with_burst.saturating_sub(self.tokens.floor() as u32),
            }
        } else {
            // Time until a full token accumulates
            let retry_secs = (((1.0 - self.tokens) / rate) / 1000.0).ceil() as u64;

            Decision {
                allowed: false,
                remaining: 0,
                reset_time: now + limits.window_ms,
                retry_after_secs: Some(retry_secs.max(1)),
                current_requests: limits.max_with_burst,
            }
        }
    }
}

/// Per-key token buckets behind the shared admission contract
pub(crate) struct TokenBucketStore {
    store: KeyedStore<TokenBucket>,
}

impl TokenBucketStore {
    pub fn new() -> Self {
        Self { store: KeyedStore::new() }
    }

    #[cfg(test)]
    pub fn tokens(&self, key: &str) -> Option<f64> {
        self.store.read(key, TokenBucket::tokens)
    }
}

impl Admission for TokenBucketStore {
    fn check(&self, key: &str, limits: &EffectiveLimits, now: u64) -> Decision {
        self.store.update(key, || TokenBucket::new(f64::from(limits.max_with_burst), now), |bucket| bucket.check(limits, now))
    }

    fn remove(&self, key: &str) {
        self.store.remove(key);
    }

    fn clear(&self) {
        self.store.clear();
    }
}
