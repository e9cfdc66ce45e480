//! Failure counting with eviction thresholds, shared by nodes and paths.

use std::collections::HashMap;
use std::hash::Hash;

/// What a recorded failure means for the counted item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Still below the threshold; carries the current count.
    Counted(u32),
    /// The threshold was reached. The counter has been reset and the item
    /// should be evicted.
    ThresholdReached,
}

/// Consecutive failure counters keyed by node or path.
#[derive(Debug, Clone)]
pub struct FailureCounter<K> {
    threshold: u32,
    counts: HashMap<K, u32>,
}

impl<K: Eq + Hash> FailureCounter<K> {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            counts: HashMap::new(),
        }
    }

    pub fn record_failure(&mut self, key: K) -> FailureOutcome {
        let count = self.counts.entry(key).or_insert(0);
        *count += 1;
        if *count >= self.threshold {
            *count = 0;
            FailureOutcome::ThresholdReached
        } else {
            FailureOutcome::Counted(*count)
        }
    }

    pub fn record_success(&mut self, key: &K) {
        self.counts.remove(key);
    }

    pub fn count(&self, key: &K) -> u32 {
        self.counts.get(key).copied().unwrap_or(0)
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }
}
