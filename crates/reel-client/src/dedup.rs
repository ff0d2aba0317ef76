//! Bounded set of previously seen event ids.
//!
//! With several endpoints subscribed to overlapping filters, the same
//! event arrives up to once per endpoint. This set collapses delivery
//! to exactly one per id: the first endpoint to deliver wins, every
//! later copy is suppressed. Suppressions are logged in aggregate to
//! keep bursts of redelivery from flooding the log.

use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

use rand::Rng;
use tracing::debug;

/// Maximum age of a suppression summary before the next duplicate
/// flushes one.
const SUMMARY_WINDOW: Duration = Duration::from_secs(30);

/// Insertion-ordered bounded set of event ids.
pub struct SeenIds {
    capacity: usize,
    order: VecDeque<String>,
    seen: HashSet<String>,
    suppressed_total: u64,
    suppressed_since_flush: u32,
    flush_threshold: u32,
    last_flush: Instant,
}

impl SeenIds {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::with_capacity(capacity),
            seen: HashSet::with_capacity(capacity),
            suppressed_total: 0,
            suppressed_since_flush: 0,
            flush_threshold: draw_threshold(),
            last_flush: Instant::now(),
        }
    }

    /// Returns true exactly once per id.
    ///
    /// When the set is full, admitting a new id evicts the single
    /// oldest entry.
    pub fn admit(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            self.note_suppressed();
            return false;
        }

        if self.order.len() >= self.capacity
            && let Some(oldest) = self.order.pop_front()
        {
            self.seen.remove(&oldest);
        }

        self.order.push_back(id.to_string());
        self.seen.insert(id.to_string());
        true
    }

    /// Whether `id` has already been admitted (pure read).
    pub fn contains(&self, id: &str) -> bool {
        self.seen.contains(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Duplicates suppressed over the set's lifetime.
    pub fn suppressed_total(&self) -> u64 {
        self.suppressed_total
    }

    fn note_suppressed(&mut self) {
        self.suppressed_total += 1;
        self.suppressed_since_flush += 1;

        let burst = self.suppressed_since_flush >= self.flush_threshold;
        let stale = self.last_flush.elapsed() >= SUMMARY_WINDOW;
        if burst || stale {
            debug!(
                suppressed = self.suppressed_since_flush,
                total = self.suppressed_total,
                "duplicate events suppressed"
            );
            self.suppressed_since_flush = 0;
            self.flush_threshold = draw_threshold();
            self.last_flush = Instant::now();
        }
    }
}

fn draw_threshold() -> u32 {
    rand::rng().random_range(25..=50)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admit_is_true_exactly_once() {
        let mut seen = SeenIds::new(10);
        assert!(seen.admit("a"));
        assert!(!seen.admit("a"));
        assert!(!seen.admit("a"));
        assert_eq!(seen.suppressed_total(), 2);
    }

    #[test]
    fn test_capacity_is_never_exceeded() {
        let mut seen = SeenIds::new(5);
        for i in 0..20 {
            seen.admit(&format!("id{i}"));
            assert!(seen.len() <= 5);
        }
        assert_eq!(seen.len(), 5);
    }

    #[test]
    fn test_overflow_evicts_exactly_the_oldest() {
        let mut seen = SeenIds::new(3);
        seen.admit("a");
        seen.admit("b");
        seen.admit("c");

        seen.admit("d");

        assert!(!seen.contains("a"));
        assert!(seen.contains("b"));
        assert!(seen.contains("c"));
        assert!(seen.contains("d"));
    }

    #[test]
    fn test_evicted_id_is_admitted_again() {
        // After eviction the retained window no longer remembers the id,
        // so a redelivery passes the gate once more.
        let mut seen = SeenIds::new(2);
        seen.admit("a");
        seen.admit("b");
        seen.admit("c");
        assert!(seen.admit("a"));
    }

    #[test]
    fn test_duplicate_does_not_refresh_position() {
        let mut seen = SeenIds::new(3);
        seen.admit("a");
        seen.admit("b");
        seen.admit("c");
        // Re-seeing "a" is insertion-ordered, not LRU: it stays oldest.
        seen.admit("a");
        seen.admit("d");
        assert!(!seen.contains("a"));
    }

    #[test]
    fn test_flush_threshold_in_range() {
        for _ in 0..100 {
            let t = draw_threshold();
            assert!((25..=50).contains(&t));
        }
    }
}
