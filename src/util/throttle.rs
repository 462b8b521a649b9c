// =============================================================================
// Monotonic throttle — per-state minimum interval gate
// =============================================================================

use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// A minimum-interval gate backed by a monotonic clock.
///
/// `try_fire()` returns `true` (and arms the timer) only if at least the
/// configured interval has elapsed since the last successful fire. The first
/// call always fires.
#[derive(Debug)]
pub struct Throttle {
    interval: Duration,
    last_fire: Mutex<Option<Instant>>,
}

impl Throttle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_fire: Mutex::new(None),
        }
    }

    pub fn from_millis(ms: u64) -> Self {
        Self::new(Duration::from_millis(ms))
    }

    /// Attempt to pass the gate. Atomically checks and arms.
    pub fn try_fire(&self) -> bool {
        let now = Instant::now();
        let mut last = self.last_fire.lock();
        match *last {
            Some(prev) if now.duration_since(prev) < self.interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }

    /// Time since the last successful fire, if any.
    pub fn elapsed(&self) -> Option<Duration> {
        self.last_fire.lock().map(|t| t.elapsed())
    }

    /// Clear the gate so the next `try_fire` passes unconditionally.
    pub fn reset(&self) {
        *self.last_fire.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_fire_always_passes() {
        let t = Throttle::from_millis(1000);
        assert!(t.try_fire());
        assert!(!t.try_fire());
    }

    #[test]
    fn fires_again_after_interval() {
        let t = Throttle::new(Duration::from_millis(10));
        assert!(t.try_fire());
        assert!(!t.try_fire());
        std::thread::sleep(Duration::from_millis(15));
        assert!(t.try_fire());
    }

    #[test]
    fn reset_reopens_the_gate() {
        let t = Throttle::from_millis(60_000);
        assert!(t.try_fire());
        assert!(!t.try_fire());
        t.reset();
        assert!(t.try_fire());
    }
}
