//! Per-session sliding window of recently seen message counters.
//!
//! Lifted from the teacher's `active_connection.rs::ReceivedCounters`
//! (bounded `HashSet` + `VecDeque`), generalized from "per connection" to
//! "per session" since one session can now host several concurrent
//! exchanges sharing a single message-counter space.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;

/// Default number of recent message counters retained per session.
pub const DEFAULT_WINDOW: usize = 32;

struct Window {
    seen: HashSet<u32>,
    order: VecDeque<u32>,
    capacity: usize,
}

impl Window {
    fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    /// Records `counter`. Returns `true` if it was new, `false` if it is a
    /// duplicate of one already in the window.
    fn record(&mut self, counter: u32) -> bool {
        if !self.seen.insert(counter) {
            return false;
        }
        self.order.push_back(counter);
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
        true
    }
}

/// Thread-safe duplicate detector keyed by message counter, one per session.
///
/// `record` is atomic with respect to concurrent receives on the same
/// session (§5 "Shared resources"): the dispatcher serializes all writes
/// through the mutex.
pub struct DuplicateFilter {
    window: Mutex<Window>,
}

impl DuplicateFilter {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_WINDOW)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            window: Mutex::new(Window::new(capacity)),
        }
    }

    /// Records `counter` as seen. Returns `true` if this is the first time it
    /// has been observed, `false` if it is a retransmission duplicate.
    pub fn record(&self, counter: u32) -> bool {
        self.window.lock().unwrap().record(counter)
    }
}

impl Default for DuplicateFilter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_seen_is_not_duplicate() {
        let filter = DuplicateFilter::new();
        assert!(filter.record(1));
    }

    #[test]
    fn repeat_is_duplicate() {
        let filter = DuplicateFilter::new();
        assert!(filter.record(1));
        assert!(!filter.record(1));
    }

    #[test]
    fn old_entries_age_out_of_bounded_window() {
        let filter = DuplicateFilter::with_capacity(4);
        for i in 0..8 {
            assert!(filter.record(i));
        }
        // counter 0 has been evicted, so it is treated as new again.
        assert!(filter.record(0));
        // counter 7 is still in the window.
        assert!(!filter.record(7));
    }
}
