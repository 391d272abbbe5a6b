use std::collections::VecDeque;

use crate::admission::Admission;
use crate::admission::Decision;
use crate::admission::EffectiveLimits;
use crate::store::KeyedStore;

/// Sliding window admission state for one key
///
/// Keeps an explicit log of admitted request timestamps, pruned to the
/// trailing window before every decision. Stricter than the token bucket: at
/// most `max_with_burst` admissions can fall inside any window.
#[derive(Debug, Clone, Default)]
pub struct SlidingWindow {
    /// Admitted request timestamps in milliseconds, oldest first
    requests: VecDeque<u64>,
}

impl SlidingWindow {
    pub fn new() -> Self {
        Self { requests: VecDeque::new() }
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Drop entries that fell out of `(now - window_ms, now]`. Nothing can
    /// have expired before one full window has elapsed, and clamping the
    /// cutoff to zero would misread epoch-stamped entries as expired.
    fn prune(&mut self, now: u64, window_ms: u64) {
        let Some(cutoff) = now.checked_sub(window_ms) else {
            return;
        };
        while let Some(&oldest) = self.requests.front() {
            if oldest <= cutoff {
                self.requests.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn check(&mut self, limits: &EffectiveLimits, now: u64) -> Decision {
        self.prune(now, limits.window_ms);

        let count = self.requests.len() as u32;
        if count < limits.max_with_burst {
            self.requests.push_back(now);
            let oldest = self.requests.front().copied().unwrap_or(now);

            Decision {
                allowed: true,
                remaining: limits.max_with_burst - (count + 1),
                reset_time: oldest + limits.window_ms,
                retry_after_secs: None,
                current_requests: count + 1,
            }
        } else {
            let oldest = self.requests.front().copied().unwrap_or(now);
            let reset_time = oldest + limits.window_ms;

            Decision {
                allowed: false,
                remaining: 0,
                reset_time,
                retry_after_secs: Some(reset_time.saturating_sub(now).div_ceil(1000).max(1)),
                current_requests: count,
            }
        }
    }
}

/// Per-key sliding windows behind the shared admission contract
pub(crate) struct SlidingWindowStore {
    store: KeyedStore<SlidingWindow>,
}

impl SlidingWindowStore {
    pub fn new() -> Self {
        Self { store: KeyedStore::new() }
    }

    #[cfg(test)]
    pub fn len(&self, key: &str) -> Option<usize> {
        self.store.read(key, SlidingWindow::len)
    }
}

impl Admission for SlidingWindowStore {
    fn check(&self, key: &str, limits: &EffectiveLimits, now: u64) -> Decision {
        self.store.update(key, SlidingWindow::new, |window| window.check(limits, now))
    }

    fn remove(&self, key: &str) {
        self.store.remove(key);
    }

    fn clear(&self) {
        self.store.clear();
    }
}
