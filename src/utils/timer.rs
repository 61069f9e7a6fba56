//! Simple deadline-tracking timer used by the coordinator liveness monitor
//! and lease-style bookkeeping.

use tokio::time::{Duration, Instant};

/// Tracks the time elapsed since the last `reset()`, compared against a
/// fixed timeout. Not an async timer (no waker) -- meant to be polled from
/// inside a `tokio::time::interval` tick, matching how
/// `_monitor_coordinator` in the original implementation polls elapsed time
/// every 5s tick rather than sleeping on a single deadline.
#[derive(Debug, Clone)]
pub struct Timer {
    last_reset: Instant,
    timeout: Duration,
}

impl Timer {
    /// Creates a new timer, already reset to "now".
    pub fn new(timeout: Duration) -> Self {
        Timer {
            last_reset: Instant::now(),
            timeout,
        }
    }

    /// Resets the timer's clock to "now", as if a fresh heartbeat had just
    /// been heard.
    pub fn reset(&mut self) {
        self.last_reset = Instant::now();
    }

    /// Returns the duration since the last reset.
    pub fn elapsed(&self) -> Duration {
        self.last_reset.elapsed()
    }

    /// Returns true if more than `timeout` has elapsed since the last reset.
    pub fn expired(&self) -> bool {
        self.elapsed() > self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_timer_not_expired() {
        let t = Timer::new(Duration::from_secs(30));
        assert!(!t.expired());
    }

    #[test]
    fn zero_timeout_expires_immediately() {
        let t = Timer::new(Duration::from_secs(0));
        std::thread::sleep(Duration::from_millis(1));
        assert!(t.expired());
    }
}
