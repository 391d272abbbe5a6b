use std::time::Instant;

/// Time tracking for the limiter
///
/// Uses Instant for monotonic time measurements with millisecond precision.
/// All per-key state stores relative millisecond timestamps, so admission
/// arithmetic never touches the wall clock.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TimeSource {
    /// Epoch for relative time measurements
    epoch: Instant,
}

impl TimeSource {
    #[inline(always)]
    pub fn new() -> Self {
        Self { epoch: Instant::now() }
    }

    /// Current time in milliseconds since epoch
    #[inline(always)]
    pub fn now_millis(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

impl Default for TimeSource {
    fn default() -> Self {
        Self::new()
    }
}
