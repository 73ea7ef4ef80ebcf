// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Transactional outbox: records written beside primary changes, and the
//! worker that turns them into derived writes.

pub mod handler;
pub mod record;
pub mod worker;

pub use handler::{HandlerError, HandlerRegistry, LookupViewHandler, OutboxHandler};
pub use record::{Operation, Outbox, OutboxRecord, DEAD, PENDING, PROCESSED};
pub use worker::{OutboxStats, OutboxStatsSnapshot, OutboxWorker, WorkerPhase};
