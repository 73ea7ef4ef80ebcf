// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for the persistence engine.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host service is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `entity_persistence_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `table`: entity table name
//! - `kind`: fetch, execute, atomic
//! - `status`: success, error
//! - `outcome`: hit, miss, error (cache) or applied, failed, dead (outbox)

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record one statement sent through the Execution Port
pub fn record_statement(kind: &str, status: &str) {
    counter!(
        "entity_persistence_statements_total",
        "kind" => kind.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record statement latency
pub fn record_statement_latency(kind: &str, duration: Duration) {
    histogram!(
        "entity_persistence_statement_seconds",
        "kind" => kind.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record the outcome of a cache-aside lookup
pub fn record_cache_lookup(table: &str, outcome: &str) {
    counter!(
        "entity_persistence_cache_lookups_total",
        "table" => table.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Record a Cache Port failure that was absorbed
pub fn record_cache_error(operation: &str) {
    counter!(
        "entity_persistence_cache_errors_total",
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Record a generation counter bump
pub fn record_generation_bump(table: &str, success: bool) {
    counter!(
        "entity_persistence_generation_bumps_total",
        "table" => table.to_string(),
        "status" => if success { "success" } else { "error" }
    )
    .increment(1);
}

/// Record outbox records by outcome
pub fn record_outbox(outcome: &str, count: usize) {
    counter!(
        "entity_persistence_outbox_records_total",
        "outcome" => outcome.to_string()
    )
    .increment(count as u64);
}

/// Set pending outbox records seen by the last poll
pub fn set_outbox_pending(count: usize) {
    gauge!("entity_persistence_outbox_pending").set(count as f64);
}

/// Track the outbox worker phase (0 = Idle .. 4 = Stopped)
pub fn set_worker_phase(phase: u8) {
    gauge!("entity_persistence_outbox_worker_phase").set(f64::from(phase));
}

/// Record a batcher flush
pub fn record_batch_flush(batcher: &str, reason: &str, count: usize) {
    counter!(
        "entity_persistence_batch_flushes_total",
        "batcher" => batcher.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
    histogram!(
        "entity_persistence_batch_size",
        "batcher" => batcher.to_string()
    )
    .record(count as f64);
}

/// Record items put back after a failed flush
pub fn record_batch_requeue(batcher: &str, count: usize) {
    counter!(
        "entity_persistence_batch_requeued_total",
        "batcher" => batcher.to_string()
    )
    .increment(count as u64);
}

/// Record items dropped because the store refused them
pub fn record_batch_rejected(batcher: &str, count: usize) {
    counter!(
        "entity_persistence_batch_rejected_total",
        "batcher" => batcher.to_string()
    )
    .increment(count as u64);
}

/// A timing guard that records statement latency on drop
pub struct StatementTimer {
    kind: &'static str,
    start: Instant,
}

impl StatementTimer {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            start: Instant::now(),
        }
    }
}

impl Drop for StatementTimer {
    fn drop(&mut self) {
        record_statement_latency(self.kind, self.start.elapsed());
    }
}
