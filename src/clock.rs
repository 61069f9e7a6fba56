//! Lamport logical clock (C1).

use std::sync::atomic::{AtomicU64, Ordering};

/// A Lamport logical clock: a per-process counter bumped on every send and
/// advanced past any received value on every receive, preserving
/// happens-before ordering across processes.
///
/// Thread-safe via an `AtomicU64` rather than a `Mutex<u64>` -- the clock
/// itself has no invariant beyond "monotonically non-decreasing", so a CAS
/// loop is enough and avoids lock contention on the request hot path.
#[derive(Debug, Default)]
pub struct LogicalClock {
    value: AtomicU64,
}

impl LogicalClock {
    /// Starts a fresh clock at zero.
    pub fn new() -> Self {
        LogicalClock {
            value: AtomicU64::new(0),
        }
    }

    /// Advances the clock by one and returns the new value. Call before
    /// sending any message.
    pub fn increment(&self) -> u64 {
        self.value.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Advances the clock past `received` and returns the new value. Call
    /// on receiving a message carrying a peer's clock value.
    pub fn update(&self, received: u64) -> u64 {
        let mut cur = self.value.load(Ordering::SeqCst);
        loop {
            let next = cur.max(received) + 1;
            match self.value.compare_exchange_weak(
                cur,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return next,
                Err(observed) => cur = observed,
            }
        }
    }

    /// Returns the current value without mutating it.
    pub fn peek(&self) -> u64 {
        self.value.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn increments_are_monotonic() {
        let c = LogicalClock::new();
        let a = c.increment();
        let b = c.increment();
        assert!(b > a);
    }

    #[test]
    fn update_advances_past_received() {
        let c = LogicalClock::new();
        c.increment(); // 1
        let updated = c.update(10);
        assert_eq!(updated, 11);
        assert!(c.peek() >= 11);
    }

    #[test]
    fn update_with_stale_value_still_advances() {
        let c = LogicalClock::new();
        for _ in 0..5 {
            c.increment();
        }
        let before = c.peek();
        let updated = c.update(0);
        assert_eq!(updated, before + 1);
    }

    #[test]
    fn concurrent_increments_are_distinct() {
        use std::sync::Arc;
        use std::thread;

        let c = Arc::new(LogicalClock::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let c = Arc::clone(&c);
            handles.push(thread::spawn(move || c.increment()));
        }
        let mut results: Vec<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        results.sort_unstable();
        results.dedup();
        assert_eq!(results.len(), 8);
    }
}
