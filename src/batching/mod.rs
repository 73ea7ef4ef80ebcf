// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Write buffering for high-frequency savers and deleters.

pub mod entity_batcher;
pub mod hybrid_batcher;

pub use entity_batcher::{BatchSink, Batcher, BatcherStats, DeleteSink, SaveSink};
pub use hybrid_batcher::{BatchConfig, FlushBatch, FlushReason, HybridBatcher};
