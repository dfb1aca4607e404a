//! Consistency sweeper.
//!
//! Background reconciliation of stale or missing embeddings. A pass walks
//! the stale entities by id cursor and repairs each one independently, so
//! one failing or stuck entity never stalls the rest. Failed entities are
//! picked up again on the next pass, never within the same one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use catalog_core::config::SweeperConfig;
use catalog_core::error::{CatalogError, Result};
use catalog_core::events::{CatalogEvent, EventBus};
use catalog_core::types::EntityId;
use catalog_storage::EntityStore;

use crate::pipeline::{EmbeddingPipeline, RepairOutcome};

/// Counts of one sweeper pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub repaired: u64,
    pub failed: u64,
    /// Entities that needed no new embedding: cleared, already current, or gone.
    pub skipped: u64,
    pub scanned: u64,
}

/// Outcome of the most recent pass plus the number of passes run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepStatus {
    pub last_run: Option<DateTime<Utc>>,
    pub repaired: u64,
    pub failed: u64,
    pub skipped: u64,
    pub passes: u64,
}

enum Wake {
    Shutdown,
    Tick,
    Nudge,
    Event(std::result::Result<CatalogEvent, RecvError>),
}

pub struct ConsistencySweeper {
    store: Arc<dyn EntityStore>,
    pipeline: Arc<EmbeddingPipeline>,
    config: SweeperConfig,
    events: EventBus,
    shutdown: Arc<Notify>,
    stopping: AtomicBool,
    pass: tokio::sync::Mutex<()>,
    status: Mutex<SweepStatus>,
}

impl ConsistencySweeper {
    pub fn new(
        store: Arc<dyn EntityStore>,
        pipeline: Arc<EmbeddingPipeline>,
        config: SweeperConfig,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            pipeline,
            config,
            events,
            shutdown: Arc::new(Notify::new()),
            stopping: AtomicBool::new(false),
            pass: tokio::sync::Mutex::new(()),
            status: Mutex::new(SweepStatus::default()),
        }
    }

    pub fn status(&self) -> SweepStatus {
        self.status
            .lock()
            .map(|s| s.clone())
            .unwrap_or_else(|e| e.into_inner().clone())
    }

    /// Run one full pass. Concurrent callers queue behind the running pass.
    ///
    /// Only a failure to list stale entities, or a shutdown, aborts the
    /// pass; per-entity failures are counted.
    pub async fn run_once(&self) -> Result<SweepReport> {
        let _pass = self.pass.lock().await;
        let model = self.pipeline.model_id().to_string();
        let batch = self.config.batch_size.max(1);
        let entity_timeout = self.config.entity_timeout();

        let mut report = SweepReport::default();
        let mut after: Option<EntityId> = None;
        loop {
            if self.stopping.load(Ordering::SeqCst) {
                return Err(CatalogError::ShuttingDown);
            }
            let ids = self.store.list_stale(&model, after.clone(), batch).await?;
            let Some(last) = ids.last() else {
                break;
            };
            after = Some(last.clone());
            let full = ids.len() == batch;

            for id in ids {
                report.scanned += 1;
                match tokio::time::timeout(entity_timeout, self.pipeline.repair(&id)).await {
                    Ok(Ok(RepairOutcome::Repaired { version })) => {
                        debug!(entity_id = %id, version, "Sweeper repaired embedding");
                        report.repaired += 1;
                    }
                    Ok(Ok(_)) => report.skipped += 1,
                    Ok(Err(e)) => {
                        warn!(entity_id = %id, error = %e, "Sweeper failed to repair entity");
                        report.failed += 1;
                    }
                    Err(_) => {
                        warn!(
                            entity_id = %id,
                            timeout_ms = entity_timeout.as_millis() as u64,
                            "Sweeper repair timed out"
                        );
                        report.failed += 1;
                    }
                }
            }
            if !full {
                break;
            }
        }

        let now = Utc::now();
        {
            let mut status = self.status.lock().unwrap_or_else(|e| e.into_inner());
            status.last_run = Some(now);
            status.repaired = report.repaired;
            status.failed = report.failed;
            status.skipped = report.skipped;
            status.passes += 1;
        }
        self.events.publish(CatalogEvent::SweepCompleted {
            repaired: report.repaired,
            failed: report.failed,
            skipped: report.skipped,
            timestamp: now,
        });
        info!(
            repaired = report.repaired,
            failed = report.failed,
            skipped = report.skipped,
            scanned = report.scanned,
            "Sweep pass completed"
        );
        Ok(report)
    }

    /// Run passes until [`shutdown`](Self::shutdown) is called.
    ///
    /// A pass runs at startup and then every `interval`. Content-change
    /// events from `events` schedule an extra pass once they have been quiet
    /// for `debounce`.
    pub async fn run(&self, mut events: Option<broadcast::Receiver<CatalogEvent>>) {
        let mut ticker = tokio::time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let debounce = self.config.debounce();
        let mut nudge: Option<Instant> = None;

        info!(
            interval_secs = self.config.interval_secs,
            debounce_ms = self.config.debounce_ms,
            "Consistency sweeper started"
        );

        loop {
            let wake = tokio::select! {
                biased;
                _ = self.shutdown.notified() => Wake::Shutdown,
                _ = ticker.tick() => Wake::Tick,
                _ = wait_until(nudge) => Wake::Nudge,
                received = next_event(&mut events) => Wake::Event(received),
            };

            match wake {
                Wake::Shutdown => {
                    info!("Consistency sweeper stopped");
                    return;
                }
                Wake::Tick | Wake::Nudge => {
                    nudge = None;
                    match self.run_once().await {
                        Ok(_) => {}
                        Err(CatalogError::ShuttingDown) => {}
                        Err(e) => error!(error = %e, "Sweep pass aborted"),
                    }
                }
                Wake::Event(Ok(event)) => {
                    if event.marks_stale() {
                        nudge = Some(Instant::now() + debounce);
                    }
                }
                Wake::Event(Err(RecvError::Lagged(missed))) => {
                    debug!(missed, "Sweeper lagged behind store events");
                    nudge = Some(Instant::now() + debounce);
                }
                Wake::Event(Err(RecvError::Closed)) => {
                    debug!("Store event stream closed");
                    events = None;
                }
            }
        }
    }

    /// Spawn [`run`](Self::run) onto the runtime.
    pub fn spawn(self: &Arc<Self>, events: Option<broadcast::Receiver<CatalogEvent>>) -> SweeperHandle {
        let sweeper = Arc::clone(self);
        let task = tokio::spawn(async move { sweeper.run(events).await });
        SweeperHandle {
            sweeper: Arc::clone(self),
            task,
        }
    }

    /// Stop the run loop. A pass in progress ends after its current batch.
    pub fn shutdown(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.shutdown.notify_one();
    }
}

/// Handle to a spawned sweeper task.
pub struct SweeperHandle {
    sweeper: Arc<ConsistencySweeper>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Signal shutdown and wait for the task to finish.
    pub async fn stop(self) -> Result<()> {
        self.sweeper.shutdown();
        self.task
            .await
            .map_err(|e| CatalogError::Storage(format!("sweeper task failed: {}", e)))
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn next_event(
    events: &mut Option<broadcast::Receiver<CatalogEvent>>,
) -> std::result::Result<CatalogEvent, RecvError> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
