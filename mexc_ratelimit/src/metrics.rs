use crate::admission::Algorithm;
use crate::circuit_breaker::CircuitState;
use crate::store::KeyedStore;

/// EMA smoothing factor for response latency
const EMA_ALPHA: f64 = 0.1;

/// Per-key statistics: the single source of truth the adaptation loop and the
/// diagnostic views read from
#[derive(Debug, Clone)]
pub struct EndpointMetrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,

    /// Exponential moving average of response latency in milliseconds
    pub average_response_time: f64,

    pub last_response_time: u64,

    /// `successful_requests / total_requests`, recomputed on every outcome
    pub success_rate: f64,

    /// Multiplier in [0.1, 2.0] scaling both algorithms' effective ceilings
    pub adaptation_factor: f64,

    /// Millisecond timestamp of the last factor recompute
    pub last_adaptation: u64,

    pub circuit_breaker_state: CircuitState,

    /// Algorithm that served this key's most recent admission check
    pub algorithm: Algorithm,

    /// Millisecond timestamp at which this record was materialized
    pub created_at: u64,

    /// Provider Retry-After hint: denials report at least the remainder of
    /// this deadline
    pub throttled_until: Option<u64>,
}

impl EndpointMetrics {
    pub fn new(now: u64) -> Self {
        Self {
            total_requests: 0,
            successful_requests: 0,
            failed_requests: 0,
            average_response_time: 1_000.0,
            last_response_time: 0,
            success_rate: 1.0,
            adaptation_factor: 1.0,
            last_adaptation: now,
            circuit_breaker_state: CircuitState::Closed,
            algorithm: Algorithm::TokenBucket,
            created_at: now,
            throttled_until: None,
        }
    }

    /// Fold one observed outcome into the counters and the latency EMA
    pub fn record(&mut self, response_time_ms: u64, success: bool) {
        self.total_requests += 1;
        if success {
            self.successful_requests += 1;
        } else {
            self.failed_requests += 1;
        }

        self.average_response_time = EMA_ALPHA * response_time_ms as f64 + (1.0 - EMA_ALPHA) * self.average_response_time;
        self.last_response_time = response_time_ms;
        self.success_rate = self.successful_requests as f64 / self.total_requests as f64;
    }
}

/// Lazily-materialized per-key metrics records
pub(crate) struct MetricsStore {
    store: KeyedStore<EndpointMetrics>,
}

impl MetricsStore {
    pub fn new() -> Self {
        Self { store: KeyedStore::new() }
    }

    /// Return the record for `key`, default-initializing it if absent.
    /// Absence is never signaled.
    pub fn get_or_create(&self, key: &str, now: u64) -> EndpointMetrics {
        self.store.update(key, || EndpointMetrics::new(now), |metrics| metrics.clone())
    }

    /// Mutate the record for `key` atomically, materializing it first if
    /// absent
    pub fn update<R>(&self, key: &str, now: u64, f: impl FnOnce(&mut EndpointMetrics) -> R) -> R {
        self.store.update(key, || EndpointMetrics::new(now), f)
    }

    pub fn snapshot(&self, key: &str) -> Option<EndpointMetrics> {
        self.store.read(key, Clone::clone)
    }

    pub fn snapshot_all(&self) -> Vec<(String, EndpointMetrics)> {
        self.store.snapshot_all()
    }

    pub fn retain(&self, f: impl FnMut(&str, &mut EndpointMetrics) -> bool) {
        self.store.retain(f);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.store.len()
    }

    pub fn clear(&self) {
        self.store.clear();
    }
}
