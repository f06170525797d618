use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::warn;

use super::{FAILURE_THRESHOLD, RESET_TIMEOUT};

/// Short-circuit guard in front of the shared store. Consecutive
/// failures trip it open; while open every operation fails fast without
/// touching the transport. The first caller past the reset instant
/// closes it again (half-open probing is collapsed into that first
/// real attempt).
pub struct CircuitBreaker {
    state: Mutex<BreakerState>,
    threshold: u32,
    reset_timeout: Duration,
}

struct BreakerState {
    failures: u32,
    open_until: Option<Instant>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(FAILURE_THRESHOLD, RESET_TIMEOUT)
    }
}

impl CircuitBreaker {
    pub fn new(threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(BreakerState {
                failures: 0,
                open_until: None,
            }),
            threshold,
            reset_timeout,
        }
    }

    /// Gate an operation. Returns false while the breaker is open;
    /// past the reset instant the breaker closes and the call proceeds.
    pub fn allow(&self) -> bool {
        let mut state = self.state.lock().expect("breaker lock poisoned");
        match state.open_until {
            Some(until) if Instant::now() < until => false,
            Some(_) => {
                state.open_until = None;
                state.failures = 0;
                true
            }
            None => true,
        }
    }

    pub fn is_open(&self) -> bool {
        let state = self.state.lock().expect("breaker lock poisoned");
        state
            .open_until
            .is_some_and(|until| Instant::now() < until)
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock().expect("breaker lock poisoned");
        state.failures = 0;
        state.open_until = None;
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock().expect("breaker lock poisoned");
        state.failures += 1;
        if state.failures >= self.threshold && state.open_until.is_none() {
            state.open_until = Some(Instant::now() + self.reset_timeout);
            warn!(
                failures = state.failures,
                reset_secs = self.reset_timeout.as_secs(),
                "shared store circuit breaker opened"
            );
        }
    }

    /// Hold the breaker open for `duration` regardless of the failure
    /// count. Used when reconnection attempts are exhausted.
    pub fn force_open_for(&self, duration: Duration) {
        let mut state = self.state.lock().expect("breaker lock poisoned");
        state.open_until = Some(Instant::now() + duration);
    }

    pub fn failure_count(&self) -> u32 {
        self.state.lock().expect("breaker lock poisoned").failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stays_closed_below_threshold() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(30));
        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.allow());
        assert!(!breaker.is_open());
    }

    #[test]
    fn opens_at_threshold_and_fails_fast() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(30));
        for _ in 0..3 {
            breaker.record_failure();
        }
        assert!(breaker.is_open());
        assert!(!breaker.allow());
    }

    #[test]
    fn closes_after_reset_timeout() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(0));
        breaker.record_failure();
        // Zero timeout: the next gate check is already past the reset
        // instant, so the breaker closes with a clean counter.
        assert!(breaker.allow());
        assert_eq!(breaker.failure_count(), 0);
        assert!(!breaker.is_open());
    }

    #[test]
    fn success_resets_the_counter() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(30));
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        assert_eq!(breaker.failure_count(), 0);
    }

    #[test]
    fn force_open_ignores_failure_count() {
        let breaker = CircuitBreaker::new(5, Duration::from_secs(30));
        breaker.force_open_for(Duration::from_secs(60));
        assert!(breaker.is_open());
    }
}
