//! Execution counting for prepare-on-repeat.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Executions after which a statement is worth preparing.
pub const PROMOTION_THRESHOLD: u32 = 2;

/// Fixed-size table of execution counters indexed by statement hash.
///
/// Distinct statements may share a slot. A collision can only promote a
/// statement early; it never changes what gets executed.
#[derive(Debug, Clone)]
pub struct StatementPromotionTracker {
    slots: Vec<u32>,
}

impl StatementPromotionTracker {
    pub fn new(size: usize) -> Self {
        Self {
            slots: vec![0; size.max(1)],
        }
    }

    fn slot<K: Hash + ?Sized>(&self, key: &K) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.slots.len() as u64) as usize
    }

    /// Count one more execution; true once the threshold is reached.
    pub fn observe<K: Hash + ?Sized>(&mut self, key: &K) -> bool {
        let slot = self.slot(key);
        let count = &mut self.slots[slot];
        *count = count.saturating_add(1);
        *count >= PROMOTION_THRESHOLD
    }

    pub fn count<K: Hash + ?Sized>(&self, key: &K) -> u32 {
        self.slots[self.slot(key)]
    }

    /// Zero the slot of a statement that has been promoted.
    pub fn forget<K: Hash + ?Sized>(&mut self, key: &K) {
        let slot = self.slot(key);
        self.slots[slot] = 0;
    }

    pub fn reset(&mut self) {
        self.slots.fill(0);
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_promotes_on_second_execution() {
        let mut tracker = StatementPromotionTracker::new(64);
        assert!(!tracker.observe("SELECT 1"));
        assert!(tracker.observe("SELECT 1"));
        assert_eq!(tracker.count("SELECT 1"), 2);

        tracker.forget("SELECT 1");
        assert_eq!(tracker.count("SELECT 1"), 0);
    }

    #[test]
    fn test_single_slot_shares_counts() {
        let mut tracker = StatementPromotionTracker::new(1);
        assert!(!tracker.observe("SELECT 1"));
        assert!(tracker.observe("SELECT 2"));

        tracker.reset();
        assert_eq!(tracker.count("SELECT 1"), 0);
    }

    #[test]
    fn test_zero_size_is_clamped() {
        let tracker = StatementPromotionTracker::new(0);
        assert_eq!(tracker.size(), 1);
    }
}
