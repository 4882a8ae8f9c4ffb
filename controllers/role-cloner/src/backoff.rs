//! # Fibonacci Backoff
//!
//! Requeue delays for failed reconciliations. Delays grow along the Fibonacci
//! sequence (min, min, 2*min, 3*min, 5*min, ...) and are capped at a maximum,
//! which grows more slowly than exponential backoff and suits transient API
//! server errors such as optimistic-concurrency conflicts.
//!
//! State is kept per template key and reset after a successful reconciliation.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Fibonacci backoff calculator
///
/// Each delay is the sum of the previous two, capped at `max`.
#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    min: Duration,
    prev: Duration,
    current: Duration,
    max: Duration,
}

impl FibonacciBackoff {
    /// Create a new Fibonacci backoff bounded by `min` and `max`.
    ///
    /// With `min = 5s, max = 300s` the sequence is 5s, 5s, 10s, 15s, 25s, 40s, ... 300s.
    #[must_use]
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            prev: Duration::ZERO,
            current: min,
            max,
        }
    }

    /// Get the next delay and advance the sequence.
    pub fn next_backoff(&mut self) -> Duration {
        let result = self.current;
        let next = self.prev + self.current;
        self.prev = self.current;
        self.current = std::cmp::min(next, self.max);
        result
    }

    /// Reset the backoff to the initial state
    pub fn reset(&mut self) {
        self.prev = Duration::ZERO;
        self.current = self.min;
    }
}

/// Backoff state per reconciled object (`namespace/name` -> backoff).
#[derive(Debug)]
pub struct BackoffTracker {
    min: Duration,
    max: Duration,
    states: Mutex<HashMap<String, FibonacciBackoff>>,
}

impl BackoffTracker {
    /// Creates a tracker whose backoffs start at `min` and cap at `max`.
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max,
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Records one more failure for `key` and returns how long to wait before retrying.
    pub fn next_delay(&self, key: &str) -> Duration {
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        states
            .entry(key.to_string())
            .or_insert_with(|| FibonacciBackoff::new(self.min, self.max))
            .next_backoff()
    }

    /// Forgets the failure history of `key` after a successful reconciliation.
    pub fn reset(&self, key: &str) {
        let mut states = self.states.lock().unwrap_or_else(PoisonError::into_inner);
        states.remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn test_fibonacci_backoff_sequence() {
        let mut backoff = FibonacciBackoff::new(secs(5), secs(300));

        assert_eq!(backoff.next_backoff(), secs(5));
        assert_eq!(backoff.next_backoff(), secs(5));
        assert_eq!(backoff.next_backoff(), secs(10));
        assert_eq!(backoff.next_backoff(), secs(15));
        assert_eq!(backoff.next_backoff(), secs(25));
        assert_eq!(backoff.next_backoff(), secs(40));
    }

    #[test]
    fn test_fibonacci_backoff_max_cap() {
        let mut backoff = FibonacciBackoff::new(secs(1), secs(10));

        // 1, 1, 2, 3, 5, 8, then 13 is capped at 10
        for expected in [1, 1, 2, 3, 5, 8, 10, 10, 10] {
            assert_eq!(backoff.next_backoff(), secs(expected));
        }
    }

    #[test]
    fn test_fibonacci_backoff_reset() {
        let mut backoff = FibonacciBackoff::new(secs(1), secs(10));
        backoff.next_backoff();
        backoff.next_backoff();
        backoff.next_backoff();

        backoff.reset();

        assert_eq!(backoff.next_backoff(), secs(1));
        assert_eq!(backoff.next_backoff(), secs(1));
        assert_eq!(backoff.next_backoff(), secs(2));
    }

    #[test]
    fn test_tracker_keeps_state_per_key() {
        let tracker = BackoffTracker::new(secs(1), secs(10));

        assert_eq!(tracker.next_delay("kube-system/view"), secs(1));
        assert_eq!(tracker.next_delay("kube-system/view"), secs(1));
        assert_eq!(tracker.next_delay("kube-system/view"), secs(2));
        // Another template starts from the beginning
        assert_eq!(tracker.next_delay("kube-system/edit"), secs(1));

        tracker.reset("kube-system/view");
        assert_eq!(tracker.next_delay("kube-system/view"), secs(1));
    }
}
