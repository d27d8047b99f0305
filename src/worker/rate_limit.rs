use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Fixed-window rate ceiling: at most `max_per_window` grants per `window`.
pub struct RateLimiter {
    window: Duration,
    max_per_window: usize,
    // (granted in current window, window start)
    state: Mutex<(usize, Instant)>,
}

impl RateLimiter {
    #[must_use]
    pub fn new(max_per_window: usize, window: Duration) -> Self {
        Self {
            window,
            max_per_window,
            state: Mutex::new((0, Instant::now())),
        }
    }

    /// Grants up to `wanted` jobs from the current window and returns how many.
    pub fn reserve(&self, wanted: usize) -> usize {
        self.reserve_at(wanted, Instant::now())
    }

    fn reserve_at(&self, wanted: usize, now: Instant) -> usize {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        // Reset window if expired
        if now.duration_since(state.1) >= self.window {
            *state = (0, now);
        }

        let granted = wanted.min(self.max_per_window.saturating_sub(state.0));
        state.0 += granted;
        granted
    }

    /// Returns grants that were reserved but not used to the current window.
    pub fn refund(&self, unused: usize) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.0 = state.0.saturating_sub(unused);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_caps_grants() {
        let limiter = RateLimiter::new(5, Duration::from_secs(1));
        let start = Instant::now();

        assert_eq!(limiter.reserve_at(3, start), 3);
        assert_eq!(limiter.reserve_at(3, start), 2);
        assert_eq!(limiter.reserve_at(1, start + Duration::from_millis(500)), 0);
        assert_eq!(limiter.reserve_at(4, start + Duration::from_secs(1)), 4);
    }

    #[test]
    fn test_refund_restores_unused_grants() {
        let limiter = RateLimiter::new(5, Duration::from_secs(60));
        let start = Instant::now();

        assert_eq!(limiter.reserve_at(5, start), 5);
        limiter.refund(5);
        assert_eq!(limiter.reserve_at(5, start), 5);

        limiter.refund(2);
        assert_eq!(limiter.reserve_at(5, start), 2);
    }
}
