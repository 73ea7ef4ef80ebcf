// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Single-consumer outbox drain loop.
//!
//! ```text
//! Idle ─► Polling ─► Applying ─► MarkingProcessed ─► Idle
//!  ▲          │ (empty)                                 │
//!  └──────────┘◄────────────────────────────────────────┘
//! ```
//!
//! A failed record stays pending and is retried on a later poll, so every
//! record is applied at least once. After `max_attempts` failures it is
//! flagged dead and no longer polled.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::handler::HandlerRegistry;
use super::record::Outbox;
use crate::config::OutboxConfig;
use crate::error::PersistError;
use crate::metrics;
use crate::repository::Repository;
use crate::schema::SqlValue;
use crate::storage::Row;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPhase {
    Idle,
    Polling,
    Applying,
    MarkingProcessed,
    /// Not running: never started, or stopped
    Stopped,
}

impl WorkerPhase {
    fn gauge(self) -> u8 {
        match self {
            Self::Idle => 0,
            Self::Polling => 1,
            Self::Applying => 2,
            Self::MarkingProcessed => 3,
            Self::Stopped => 4,
        }
    }
}

impl std::fmt::Display for WorkerPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Polling => write!(f, "Polling"),
            Self::Applying => write!(f, "Applying"),
            Self::MarkingProcessed => write!(f, "MarkingProcessed"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

#[derive(Debug, Default)]
pub struct OutboxStats {
    polled: AtomicU64,
    applied: AtomicU64,
    failed: AtomicU64,
    dead: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OutboxStatsSnapshot {
    pub polled: u64,
    pub applied: u64,
    pub failed: u64,
    pub dead: u64,
}

impl OutboxStats {
    #[must_use]
    pub fn snapshot(&self) -> OutboxStatsSnapshot {
        OutboxStatsSnapshot {
            polled: self.polled.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dead: self.dead.load(Ordering::Relaxed),
        }
    }
}

/// State shared between the worker handle and its background task.
struct Core {
    repo: Repository,
    outbox: Outbox,
    handlers: HandlerRegistry,
    config: OutboxConfig,
    phase: watch::Sender<WorkerPhase>,
    stats: OutboxStats,
}

/// Outcome of trying one record.
enum Applied {
    Done { id: i64, touched: Vec<String> },
    Failed { id: i64, attempts: u32, reason: String },
    /// `id` is the raw column value; only an integer can go through the normal retry path
    Undecodable { id: SqlValue, attempts: u32, reason: String },
}

impl Core {
    fn set_phase(&self, phase: WorkerPhase) {
        self.phase.send_replace(phase);
        metrics::set_worker_phase(phase.gauge());
    }

    fn is_dead(&self, attempts: u32) -> bool {
        self.config.max_attempts > 0 && attempts.saturating_add(1) >= self.config.max_attempts
    }

    async fn apply(&self, row: Row) -> Applied {
        let id = row.get(0).cloned().unwrap_or(SqlValue::Null);
        let raw_attempts = match row.get(4) {
            Some(SqlValue::Integer(n)) => u32::try_from(*n).unwrap_or(u32::MAX),
            _ => 0,
        };
        let record = match Outbox::decode_row(row) {
            Ok(record) => record,
            Err(reason) => {
                return Applied::Undecodable {
                    id,
                    attempts: raw_attempts,
                    reason,
                }
            }
        };

        let Some(handler) = self.handlers.get(&record.triggered_table) else {
            return Applied::Failed {
                id: record.id,
                attempts: record.attempts,
                reason: format!("no handler registered for table '{}'", record.triggered_table),
            };
        };

        match handler.apply(&record, self.repo.executor().as_ref()).await {
            Ok(()) => Applied::Done {
                id: record.id,
                touched: handler.touched_tables(),
            },
            Err(e) => Applied::Failed {
                id: record.id,
                attempts: record.attempts,
                reason: e.to_string(),
            },
        }
    }

    /// Count one failure against `id`, retiring it once the cap is reached.
    async fn record_failure(&self, id: i64, attempts: u32, reason: &str) {
        let dead = self.is_dead(attempts);
        if dead {
            error!(id, attempts = attempts + 1, reason, "Outbox record dead-lettered");
            self.stats.dead.fetch_add(1, Ordering::Relaxed);
            metrics::record_outbox("dead", 1);
        } else {
            warn!(id, attempts = attempts + 1, reason, "Outbox record failed, will retry");
        }
        self.stats.failed.fetch_add(1, Ordering::Relaxed);
        metrics::record_outbox("failed", 1);

        let statement = self.outbox.record_failure(id, reason, dead);
        if let Err(e) = self.repo.executor().execute(&statement).await {
            warn!(id, error = %e, "Could not record outbox failure");
        }
    }

    /// Retire a row that `mark_processed` and `record_failure` cannot address.
    async fn dead_letter_raw(&self, id: SqlValue, reason: &str) {
        error!(id = ?id, reason, "Outbox row has no integer id, dead-lettering");
        self.stats.failed.fetch_add(1, Ordering::Relaxed);
        self.stats.dead.fetch_add(1, Ordering::Relaxed);
        metrics::record_outbox("failed", 1);
        metrics::record_outbox("dead", 1);

        let statement = self.outbox.dead_letter_raw(id, reason);
        if let Err(e) = self.repo.executor().execute(&statement).await {
            warn!(error = %e, "Could not dead-letter outbox row");
        }
    }

    /// One poll-apply-mark cycle; returns how many records were polled.
    async fn poll_once(&self) -> Result<usize, PersistError> {
        self.set_phase(WorkerPhase::Polling);
        let rows = match self.repo.executor().fetch(&self.outbox.poll(self.config.batch_size)).await {
            Ok(rows) => rows,
            Err(e) => {
                self.set_phase(WorkerPhase::Idle);
                return Err(e.into());
            }
        };
        let polled = rows.len();
        if polled == 0 {
            self.set_phase(WorkerPhase::Idle);
            return Ok(0);
        }
        self.stats.polled.fetch_add(polled as u64, Ordering::Relaxed);

        self.set_phase(WorkerPhase::Applying);
        let mut done = Vec::with_capacity(polled);
        let mut touched = BTreeSet::new();
        for row in rows {
            match self.apply(row).await {
                Applied::Done { id, touched: tables } => {
                    done.push(id);
                    touched.extend(tables);
                }
                Applied::Failed { id, attempts, reason } => self.record_failure(id, attempts, &reason).await,
                Applied::Undecodable {
                    id: SqlValue::Integer(id),
                    attempts,
                    reason,
                } => self.record_failure(id, attempts, &reason).await,
                Applied::Undecodable { id, reason, .. } => self.dead_letter_raw(id, &reason).await,
            }
        }

        self.set_phase(WorkerPhase::MarkingProcessed);
        if !done.is_empty() {
            // Applied records stay pending until this commits and are re-applied otherwise
            let marks = self.outbox.mark_processed(&done);
            let result = self.repo.executor().execute_atomic(&marks).await;
            if let Err(e) = result {
                self.set_phase(WorkerPhase::Idle);
                return Err(e.into());
            }
            self.stats.applied.fetch_add(done.len() as u64, Ordering::Relaxed);
            metrics::record_outbox("applied", done.len());
            for table in &touched {
                self.repo.invalidate(table).await;
            }
        }

        debug!(polled, applied = done.len(), "Outbox batch processed");
        self.set_phase(WorkerPhase::Idle);
        Ok(polled)
    }

    /// Keep polling while batches come back full and clean.
    ///
    /// A batch with failures waits for the next tick, so failing records
    /// are not re-polled in a tight loop.
    async fn drain(&self, shutdown: &watch::Receiver<bool>) {
        loop {
            let failed_before = self.stats.failed.load(Ordering::Relaxed);
            match self.poll_once().await {
                Ok(polled)
                    if polled >= self.config.batch_size
                        && self.stats.failed.load(Ordering::Relaxed) == failed_before
                        && !*shutdown.borrow() =>
                {
                    continue
                }
                Ok(0) => break,
                Ok(_) => {
                    self.refresh_pending().await;
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Outbox poll failed");
                    break;
                }
            }
        }
    }

    async fn refresh_pending(&self) {
        match self.outbox.pending_count(self.repo.executor().as_ref()).await {
            Ok(pending) => metrics::set_outbox_pending(pending as usize),
            Err(e) => debug!(error = %e, "Could not count pending outbox records"),
        }
    }

    async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.set_phase(WorkerPhase::Idle);

        loop {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => self.drain(&shutdown).await,
            }
        }

        self.set_phase(WorkerPhase::Stopped);
    }
}

/// Background applier of outbox records.
///
/// `stop()` waits for the record in flight to finish; dropping a running
/// worker signals the loop to exit without waiting.
pub struct OutboxWorker {
    core: Arc<Core>,
    phase_rx: watch::Receiver<WorkerPhase>,
    shutdown: Option<watch::Sender<bool>>,
    task: Option<JoinHandle<()>>,
}

impl OutboxWorker {
    /// A stopped worker draining `config.table` through `repo`'s ports.
    pub fn new(repo: Repository, handlers: HandlerRegistry, config: OutboxConfig) -> Result<Self, PersistError> {
        let outbox = Outbox::new(config.table.clone())?;
        if outbox.table() != repo.outbox().table() {
            warn!(
                worker = outbox.table(),
                repository = repo.outbox().table(),
                "Outbox worker drains a different table than the repository writes"
            );
        }
        let (phase, phase_rx) = watch::channel(WorkerPhase::Stopped);
        Ok(Self {
            core: Arc::new(Core {
                repo,
                outbox,
                handlers,
                config,
                phase,
                stats: OutboxStats::default(),
            }),
            phase_rx,
            shutdown: None,
            task: None,
        })
    }

    #[tracing::instrument(skip(self), fields(table = self.core.outbox.table()))]
    pub fn start(&mut self) {
        if self.task.is_some() {
            warn!("Outbox worker already running");
            return;
        }
        let (tx, rx) = watch::channel(false);
        self.shutdown = Some(tx);
        self.task = Some(tokio::spawn(self.core.clone().run(rx)));
        info!(
            poll_ms = self.core.config.poll_interval.as_millis() as u64,
            batch_size = self.core.config.batch_size,
            handlers = self.core.handlers.len(),
            "Outbox worker started"
        );
    }

    /// Signal the loop and wait for it to exit.
    #[tracing::instrument(skip(self), fields(table = self.core.outbox.table()))]
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            tx.send_replace(true);
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!(error = %e, "Outbox worker task ended abnormally");
                self.core.set_phase(WorkerPhase::Stopped);
            }
            let stats = self.core.stats.snapshot();
            info!(applied = stats.applied, failed = stats.failed, dead = stats.dead, "Outbox worker stopped");
        }
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Run one poll cycle on the caller's task; returns records polled.
    ///
    /// Meant for tests and manual draining while the loop is stopped.
    pub async fn poll_once(&self) -> Result<usize, PersistError> {
        self.core.poll_once().await
    }

    #[must_use]
    pub fn phase(&self) -> WorkerPhase {
        *self.phase_rx.borrow()
    }

    #[must_use]
    pub fn phase_receiver(&self) -> watch::Receiver<WorkerPhase> {
        self.phase_rx.clone()
    }

    #[must_use]
    pub fn stats(&self) -> OutboxStatsSnapshot {
        self.core.stats.snapshot()
    }
}

impl std::fmt::Debug for OutboxWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboxWorker")
            .field("table", &self.core.outbox.table())
            .field("phase", &self.phase())
            .field("running", &self.is_running())
            .finish()
    }
}
