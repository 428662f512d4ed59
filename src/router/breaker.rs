use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

/// More than this many external events in one polling window trips the
/// breaker.
pub const BREAKER_THRESHOLD: u32 = 500;

/// Feedback-loop guard. Only hardware and network traffic is counted; once
/// tripped it stays tripped until [`TrafficBreaker::reset`].
#[derive(Debug, Default)]
pub struct TrafficBreaker {
    count: AtomicU32,
    tripped: AtomicBool,
}

impl TrafficBreaker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one external event. Returns `true` if the breaker is tripped
    /// after counting it.
    pub fn record(&self) -> bool {
        let count = self.count.fetch_add(1, Ordering::AcqRel) + 1;
        if count > BREAKER_THRESHOLD {
            self.tripped.store(true, Ordering::Release);
        }
        self.is_tripped()
    }

    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::Acquire)
    }

    /// Start a new counting window. Does not clear a tripped breaker.
    pub fn start_window(&self) {
        self.count.store(0, Ordering::Release);
    }

    pub fn reset(&self) {
        self.count.store(0, Ordering::Release);
        self.tripped.store(false, Ordering::Release);
    }

    pub fn count(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trips_above_threshold() {
        let breaker = TrafficBreaker::new();
        for _ in 0..BREAKER_THRESHOLD {
            assert!(!breaker.record());
        }
        assert!(breaker.record());
        assert!(breaker.is_tripped());

        breaker.start_window();
        assert!(breaker.is_tripped());
        breaker.reset();
        assert!(!breaker.is_tripped());
    }

    #[test]
    fn test_window_resets_count() {
        let breaker = TrafficBreaker::new();
        for _ in 0..400 {
            breaker.record();
        }
        breaker.start_window();
        for _ in 0..400 {
            breaker.record();
        }
        assert!(!breaker.is_tripped());
        assert_eq!(breaker.count(), 400);
    }
}
