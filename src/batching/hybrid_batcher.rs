// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Count-threshold batch accumulator.
//!
//! The [`HybridBatcher`] collects items and reports when `flush_count` of
//! them are pending. The time half of the policy belongs to the owner,
//! which drains the buffer on every `flush_ms` tick whatever its size. It
//! does no I/O and takes no locks.
//!
//! # Example
//!
//! ```
//! use entity_persistence::batching::{BatchConfig, FlushReason, HybridBatcher};
//!
//! let mut batcher = HybridBatcher::new(BatchConfig { flush_ms: 100, flush_count: 2 });
//! assert!(batcher.push("a").is_none());
//! assert_eq!(batcher.push("b"), Some(FlushReason::Count));
//!
//! let batch = batcher.force_flush_with_reason(FlushReason::Count).unwrap();
//! assert_eq!(batch.items, vec!["a", "b"]);
//! assert!(batcher.is_empty());
//! ```

use std::collections::VecDeque;
use std::fmt;
use std::time::Duration;

use tracing::debug;

/// Batch flush trigger reason
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    /// Periodic `flush_ms` tick
    Time,
    /// `flush_count` items pending
    Count,
    /// Explicit `flush()` call
    Manual,
    /// Final flush on shutdown or drop
    Shutdown,
}

impl FlushReason {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Time => "time",
            Self::Count => "count",
            Self::Manual => "manual",
            Self::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for FlushReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for batching
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    /// Timer period; every tick drains whatever is pending
    pub flush_ms: u64,
    /// Flush as soon as this many items are pending (0 = timer only)
    pub flush_count: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            flush_ms: 100,
            flush_count: 1000,
        }
    }
}

impl BatchConfig {
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.flush_ms.max(1))
    }
}

/// Items handed out for one flush
#[derive(Debug)]
pub struct FlushBatch<T> {
    pub items: Vec<T>,
    pub reason: FlushReason,
}

/// Ordered buffer that reports when the count threshold is reached.
#[derive(Debug)]
pub struct HybridBatcher<T> {
    config: BatchConfig,
    items: VecDeque<T>,
}

impl<T> HybridBatcher<T> {
    #[must_use]
    pub fn new(config: BatchConfig) -> Self {
        Self {
            config,
            items: VecDeque::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Append an item; returns `Count` once the threshold is reached.
    pub fn push(&mut self, item: T) -> Option<FlushReason> {
        self.items.push_back(item);
        self.count_reached().then_some(FlushReason::Count)
    }

    /// Put a batch back ahead of everything submitted since it was taken.
    pub fn requeue_front(&mut self, batch: Vec<T>) {
        if batch.is_empty() {
            return;
        }
        let count = batch.len();
        for item in batch.into_iter().rev() {
            self.items.push_front(item);
        }
        debug!(count, pending = self.items.len(), "Batch requeued");
    }

    #[must_use]
    pub fn count_reached(&self) -> bool {
        self.config.flush_count > 0 && self.items.len() >= self.config.flush_count
    }

    /// Take everything pending regardless of thresholds.
    pub fn force_flush_with_reason(&mut self, reason: FlushReason) -> Option<FlushBatch<T>> {
        if self.items.is_empty() {
            return None;
        }
        let items: Vec<T> = self.items.drain(..).collect();
        debug!(count = items.len(), %reason, "Batch taken for flush");
        Some(FlushBatch { items, reason })
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(flush_count: usize, flush_ms: u64) -> BatchConfig {
        BatchConfig { flush_ms, flush_count }
    }

    #[test]
    fn test_empty_initially() {
        let batcher: HybridBatcher<u32> = HybridBatcher::new(BatchConfig::default());
        assert!(batcher.is_empty());
        assert!(!batcher.count_reached());
    }

    #[test]
    fn test_flush_on_count_threshold() {
        let mut batcher = HybridBatcher::new(config(3, 10_000));
        assert!(batcher.push(1).is_none());
        assert!(batcher.push(2).is_none());
        assert_eq!(batcher.push(3), Some(FlushReason::Count));
    }

    #[test]
    fn test_count_stays_reached_until_taken() {
        let mut batcher = HybridBatcher::new(config(2, 10_000));
        batcher.push("a");
        assert!(!batcher.count_reached());
        batcher.push("b");
        assert_eq!(batcher.push("c"), Some(FlushReason::Count));
        let batch = batcher.force_flush_with_reason(FlushReason::Count).unwrap();
        assert_eq!(batch.items, vec!["a", "b", "c"]);
        assert!(!batcher.count_reached());
    }

    #[test]
    fn test_force_flush() {
        let mut batcher = HybridBatcher::new(BatchConfig::default());
        assert!(batcher.force_flush_with_reason(FlushReason::Manual).is_none());

        batcher.push(1);
        batcher.push(2);
        let batch = batcher.force_flush_with_reason(FlushReason::Shutdown).unwrap();
        assert_eq!(batch.items, vec![1, 2]);
        assert_eq!(batch.reason, FlushReason::Shutdown);
        assert!(batcher.is_empty());
    }

    #[test]
    fn test_requeue_goes_ahead_of_newer_items() {
        let mut batcher = HybridBatcher::new(BatchConfig::default());
        batcher.push(1);
        batcher.push(2);
        let taken = batcher.force_flush_with_reason(FlushReason::Manual).unwrap();
        batcher.push(3);
        batcher.requeue_front(taken.items);

        let all = batcher.force_flush_with_reason(FlushReason::Manual).unwrap();
        assert_eq!(all.items, vec![1, 2, 3]);
    }

    #[test]
    fn test_zero_count_threshold_never_triggers() {
        let mut batcher = HybridBatcher::new(config(0, 10_000));
        for i in 0..10 {
            assert!(batcher.push(i).is_none());
        }
    }
}
