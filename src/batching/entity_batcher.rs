// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Background saver and deleter batchers.
//!
//! Callers `submit` entities; a timer flushes whatever is pending every
//! `flush_ms`, and reaching `flush_count` schedules an immediate flush.
//! A flush takes the whole buffer under the lock and hands it to the sink
//! in chunks of at most `flush_count`, each one bulk repository call.
//!
//! A chunk that fails with a transient storage error goes back to the
//! front of the buffer together with every chunk after it, so order is
//! kept and nothing is written twice. Any other failure means the store
//! refused something in the chunk: its items are retried one at a time and
//! the ones still refused are dropped, logged and counted as `rejected`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::hybrid_batcher::{BatchConfig, FlushReason, HybridBatcher};
use crate::error::PersistError;
use crate::metrics;
use crate::repository::Repository;
use crate::schema::Entity;

/// Destination of flushed batches.
#[async_trait]
pub trait BatchSink<T>: Send + Sync + 'static {
    /// Label for logs and metrics.
    fn name(&self) -> &'static str;

    /// Refuse an item at `submit` time. Accepts everything by default.
    fn check(&self, _item: &T) -> Result<(), PersistError> {
        Ok(())
    }

    /// Write one chunk; all or nothing.
    async fn write(&self, items: &[T]) -> Result<(), PersistError>;
}

/// Bulk `save_all` into the repository.
#[derive(Debug, Clone)]
pub struct SaveSink {
    repo: Repository,
}

impl SaveSink {
    #[must_use]
    pub fn new(repo: Repository) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl<T: Entity> BatchSink<T> for SaveSink {
    fn name(&self) -> &'static str {
        "saver"
    }

    fn check(&self, item: &T) -> Result<(), PersistError> {
        item.validate().map_err(|reason| PersistError::Invariant {
            table: T::metadata().table(),
            reason,
        })
    }

    async fn write(&self, items: &[T]) -> Result<(), PersistError> {
        self.repo.save_all(items).await
    }
}

/// Bulk `delete_batch` through the repository.
#[derive(Debug, Clone)]
pub struct DeleteSink {
    repo: Repository,
}

impl DeleteSink {
    #[must_use]
    pub fn new(repo: Repository) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl<T: Entity> BatchSink<T> for DeleteSink {
    fn name(&self) -> &'static str {
        "deleter"
    }

    async fn write(&self, items: &[T]) -> Result<(), PersistError> {
        self.repo.delete_batch(items).await.map(|_| ())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BatcherStats {
    /// Items accepted by `submit`
    pub submitted: u64,
    /// Items written by successful chunks
    pub flushed: u64,
    /// Successful chunk writes
    pub flushes: u64,
    /// Items put back after a transient failure
    pub requeued: u64,
    /// Items dropped because the store refused them on their own
    pub rejected: u64,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    flushed: AtomicU64,
    flushes: AtomicU64,
    requeued: AtomicU64,
    rejected: AtomicU64,
}

struct State<T> {
    buffer: HybridBatcher<T>,
    /// A count-triggered flush is queued and has not taken the buffer yet
    scheduled: bool,
    closed: bool,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    sink: Arc<dyn BatchSink<T>>,
    /// Serializes flushes so a requeued chunk keeps its place
    flushing: tokio::sync::Mutex<()>,
    tracker: TaskTracker,
    counters: Counters,
}

impl<T: Send + Sync + 'static> Shared<T> {
    fn name(&self) -> &'static str {
        self.sink.name()
    }

    fn record_written(&self, count: usize, reason: FlushReason) {
        self.counters.flushed.fetch_add(count as u64, Ordering::Relaxed);
        self.counters.flushes.fetch_add(1, Ordering::Relaxed);
        metrics::record_batch_flush(self.name(), reason.as_str(), count);
    }

    fn requeue(&self, items: Vec<T>, reason: FlushReason, err: &PersistError) {
        let count = items.len();
        warn!(batcher = self.name(), count, %reason, error = %err, "Batch write failed, requeueing");
        self.counters.requeued.fetch_add(count as u64, Ordering::Relaxed);
        metrics::record_batch_requeue(self.name(), count);
        self.state.lock().buffer.requeue_front(items);
    }

    fn reject(&self, reason: FlushReason, err: &PersistError) {
        error!(batcher = self.name(), %reason, error = %err, "Store refused batch item, dropping it");
        self.counters.rejected.fetch_add(1, Ordering::Relaxed);
        metrics::record_batch_rejected(self.name(), 1);
    }

    /// Write a refused chunk item by item.
    ///
    /// On a transient failure the unwritten items are handed back with the error.
    async fn isolate(&self, items: Vec<T>, reason: FlushReason) -> Result<usize, (Vec<T>, PersistError)> {
        let mut written = 0;
        let mut pending = items.into_iter();
        while let Some(item) = pending.next() {
            match self.sink.write(std::slice::from_ref(&item)).await {
                Ok(()) => {
                    written += 1;
                    self.record_written(1, reason);
                }
                Err(e) if e.is_transient() => {
                    let mut back = vec![item];
                    back.extend(pending);
                    return Err((back, e));
                }
                Err(e) => self.reject(reason, &e),
            }
        }
        Ok(written)
    }

    /// Take everything pending and write it out; returns items written.
    ///
    /// Only transient failures are returned. Refused items are dropped.
    async fn flush(&self, reason: FlushReason) -> Result<usize, PersistError> {
        let _flushing = self.flushing.lock().await;
        let (batch, chunk) = {
            let mut state = self.state.lock();
            state.scheduled = false;
            let chunk = state.buffer.config().flush_count;
            (state.buffer.force_flush_with_reason(reason), chunk)
        };
        let Some(batch) = batch else {
            return Ok(0);
        };

        let mut items = batch.items;
        let chunk = if chunk == 0 { items.len() } else { chunk };
        let mut written = 0;
        while !items.is_empty() {
            let rest = items.split_off(chunk.min(items.len()));
            match self.sink.write(&items).await {
                Ok(()) => {
                    written += items.len();
                    self.record_written(items.len(), reason);
                    items = rest;
                }
                Err(e) if e.is_transient() => {
                    items.extend(rest);
                    self.requeue(items, reason, &e);
                    return Err(e);
                }
                Err(e) if items.len() == 1 => {
                    self.reject(reason, &e);
                    items = rest;
                }
                Err(e) => {
                    warn!(batcher = self.name(), count = items.len(), %reason, error = %e, "Batch refused, writing items one by one");
                    match self.isolate(items, reason).await {
                        Ok(n) => {
                            written += n;
                            items = rest;
                        }
                        Err((mut back, e)) => {
                            back.extend(rest);
                            self.requeue(back, reason, &e);
                            return Err(e);
                        }
                    }
                }
            }
        }

        debug!(batcher = self.name(), written, %reason, "Batch flushed");
        Ok(written)
    }

    async fn run_timer(self: Arc<Self>, interval: std::time::Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    if self.state.lock().buffer.is_empty() {
                        continue;
                    }
                    // Failures are already requeued and logged
                    let _ = self.flush(FlushReason::Time).await;
                }
            }
        }
    }
}

/// Buffered writer of one entity type.
///
/// Must be created inside a tokio runtime, which runs its timer and flushes.
pub struct Batcher<T: Send + Sync + 'static> {
    shared: Arc<Shared<T>>,
    shutdown: Option<watch::Sender<bool>>,
    timer: Option<JoinHandle<()>>,
}

impl<T: Entity> Batcher<T> {
    /// Batched `save_all`.
    #[must_use]
    pub fn saver(repo: Repository, config: BatchConfig) -> Self {
        Self::new(SaveSink::new(repo), config)
    }

    /// Batched `delete_batch`.
    #[must_use]
    pub fn deleter(repo: Repository, config: BatchConfig) -> Self {
        Self::new(DeleteSink::new(repo), config)
    }
}

impl<T: Send + Sync + 'static> Batcher<T> {
    pub fn new(sink: impl BatchSink<T>, config: BatchConfig) -> Self {
        let interval = config.interval();
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                buffer: HybridBatcher::new(config),
                scheduled: false,
                closed: false,
            }),
            sink: Arc::new(sink),
            flushing: tokio::sync::Mutex::new(()),
            tracker: TaskTracker::new(),
            counters: Counters::default(),
        });
        let (tx, rx) = watch::channel(false);
        let timer = tokio::spawn(shared.clone().run_timer(interval, rx));
        info!(batcher = shared.name(), flush_ms = config.flush_ms, flush_count = config.flush_count, "Batcher started");
        Self {
            shared,
            shutdown: Some(tx),
            timer: Some(timer),
        }
    }

    /// Queue `item`; never waits on I/O.
    ///
    /// Fails with [`PersistError::Shutdown`] once `shutdown` has begun, and
    /// with the sink's own error for an item it refuses up front (the saver
    /// runs the entity's invariant).
    pub fn submit(&self, item: T) -> Result<(), PersistError> {
        let schedule = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Err(PersistError::Shutdown("batcher"));
            }
            self.shared.sink.check(&item)?;
            let due = state.buffer.push(item).is_some() && !state.scheduled;
            if due {
                state.scheduled = true;
            }
            due
        };
        self.shared.counters.submitted.fetch_add(1, Ordering::Relaxed);

        if schedule {
            let shared = self.shared.clone();
            self.shared.tracker.spawn(async move {
                let _ = shared.flush(FlushReason::Count).await;
            });
        }
        Ok(())
    }

    /// Queue several items in order.
    pub fn submit_all(&self, items: impl IntoIterator<Item = T>) -> Result<(), PersistError> {
        items.into_iter().try_for_each(|item| self.submit(item))
    }

    /// Write everything pending now; returns items written.
    pub async fn flush(&self) -> Result<usize, PersistError> {
        self.shared.flush(FlushReason::Manual).await
    }

    /// Stop accepting items, wait for in-flight flushes, then flush the rest.
    ///
    /// On error the unwritten items stay buffered; `flush` may be retried.
    #[tracing::instrument(skip(self), fields(batcher = self.shared.name()))]
    pub async fn shutdown(&mut self) -> Result<usize, PersistError> {
        self.shared.state.lock().closed = true;
        if let Some(tx) = self.shutdown.take() {
            tx.send_replace(true);
        }
        if let Some(timer) = self.timer.take() {
            if let Err(e) = timer.await {
                error!(error = %e, "Batcher timer ended abnormally");
            }
        }
        self.shared.tracker.close();
        self.shared.tracker.wait().await;

        let result = self.shared.flush(FlushReason::Shutdown).await;
        let stats = self.stats();
        match &result {
            Ok(written) => info!(written, submitted = stats.submitted, flushed = stats.flushed, "Batcher shut down"),
            Err(e) => error!(pending = self.len(), error = %e, "Final batch flush failed"),
        }
        result
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.state.lock().buffer.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn stats(&self) -> BatcherStats {
        let c = &self.shared.counters;
        BatcherStats {
            submitted: c.submitted.load(Ordering::Relaxed),
            flushed: c.flushed.load(Ordering::Relaxed),
            flushes: c.flushes.load(Ordering::Relaxed),
            requeued: c.requeued.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
        }
    }
}

impl<T: Send + Sync + 'static> Drop for Batcher<T> {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            tx.send_replace(true);
        }
        let pending = {
            let mut state = self.shared.state.lock();
            state.closed = true;
            state.buffer.len()
        };
        if pending == 0 {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(batcher = self.shared.name(), pending, "Batcher dropped without shutdown, flushing in background");
                let shared = self.shared.clone();
                handle.spawn(async move {
                    if let Err(e) = shared.flush(FlushReason::Shutdown).await {
                        error!(batcher = shared.name(), error = %e, "Background flush of dropped batcher failed");
                    }
                });
            }
            Err(_) => error!(batcher = self.shared.name(), pending, "Batcher dropped outside a runtime, pending items lost"),
        }
    }
}

impl<T: Send + Sync + 'static> std::fmt::Debug for Batcher<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Batcher")
            .field("name", &self.shared.name())
            .field("pending", &self.len())
            .field("stats", &self.stats())
            .finish()
    }
}
