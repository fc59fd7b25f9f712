//! Continuation trigger and the worker pool that runs queued invocations.
//!
//! A run that hands off is persisted as `continuing` and its id is queued.
//! A worker claims it (`continuing -> running`) and runs further
//! invocations until the run completes, fails, is cancelled or hands off
//! again. Only the id travels through the queue; the cursor is re-read
//! from the store before every invocation.

use crate::config::WorkerConfig;
use crate::ingest::{HandOffReason, InvocationOutcome, RunCoordinator, SyncEngine, SyncError};
use crate::models::{SyncRun, SyncStatus};
use crate::services::metrics::record_error;
use crate::services::store::Store;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncJob {
    pub run_id: Uuid,
    pub source: String,
}

pub struct ContinuationQueue {
    config: WorkerConfig,
    store: Arc<dyn Store>,
    coordinator: Arc<RunCoordinator>,
    job_tx: mpsc::Sender<SyncJob>,
    job_rx: Mutex<Option<mpsc::Receiver<SyncJob>>>,
    shutdown_token: CancellationToken,
    tracker: TaskTracker,
}

impl ContinuationQueue {
    pub fn new(
        config: WorkerConfig,
        store: Arc<dyn Store>,
        coordinator: Arc<RunCoordinator>,
    ) -> Self {
        let (job_tx, job_rx) = mpsc::channel(config.queue_size.max(1));
        Self {
            config,
            store,
            coordinator,
            job_tx,
            job_rx: Mutex::new(Some(job_rx)),
            shutdown_token: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Start the job distributor. With workers disabled, queued jobs stay
    /// in the channel and their runs remain `continuing`.
    pub async fn start(self: &Arc<Self>, engine: Arc<SyncEngine>) {
        if !self.config.enabled {
            tracing::info!("Continuation workers disabled by configuration");
            return;
        }

        let Some(mut job_rx) = self.job_rx.lock().await.take() else {
            tracing::warn!("Continuation workers already started");
            return;
        };

        tracing::info!(
            worker_count = self.config.worker_count,
            queue_size = self.config.queue_size,
            "Starting continuation workers"
        );

        let permits = Arc::new(Semaphore::new(self.config.worker_count.max(1)));
        let queue = self.clone();
        let shutdown = self.shutdown_token.clone();

        self.tracker.spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        tracing::info!("Continuation distributor shutting down");
                        break;
                    }
                    job = job_rx.recv() => {
                        let Some(job) = job else {
                            tracing::info!("Continuation channel closed, distributor exiting");
                            break;
                        };
                        let permit = tokio::select! {
                            _ = shutdown.cancelled() => break,
                            permit = permits.clone().acquire_owned() => match permit {
                                Ok(permit) => permit,
                                Err(_) => break,
                            },
                        };
                        let worker = queue.clone();
                        let engine = engine.clone();
                        queue.tracker.spawn(async move {
                            worker.process_job(&engine, job).await;
                            drop(permit);
                        });
                    }
                }
            }
        });
    }

    /// Persist the hand-off (`running -> continuing`) and queue the run.
    ///
    /// If the job cannot be queued the run is marked failed, never left
    /// looking alive with nobody driving it.
    pub async fn trigger_continuation(&self, run: &SyncRun) -> Result<(), SyncError> {
        if !self.coordinator.hand_off(run.id).await? {
            let status = self
                .store
                .get_run(run.id)
                .await?
                .map(|r| r.status)
                .unwrap_or(SyncStatus::Failed);
            tracing::info!(
                sync_run_id = %run.id,
                status = status.as_str(),
                "Run no longer running, continuation not scheduled"
            );
            return Ok(());
        }

        if self.shutdown_token.is_cancelled() {
            // Recovered on the next start.
            tracing::info!(sync_run_id = %run.id, "Shutting down, continuation left for recovery");
            return Ok(());
        }

        self.enqueue(run).await
    }

    async fn enqueue(&self, run: &SyncRun) -> Result<(), SyncError> {
        let job = SyncJob {
            run_id: run.id,
            source: run.source.clone(),
        };
        match self.job_tx.try_send(job) {
            Ok(()) => {
                tracing::debug!(sync_run_id = %run.id, "Continuation queued");
                Ok(())
            }
            Err(e) => {
                let message = format!("continuation dispatch failed: {}", e);
                record_error("continuation_dispatch");
                self.coordinator.fail(run, &message).await?;
                Err(SyncError::Dispatch(e.to_string()))
            }
        }
    }

    /// Re-queue `continuing` runs that are still fresh. Called on startup.
    pub async fn recover(&self) -> Result<usize, SyncError> {
        let since = Utc::now() - self.coordinator.policy().stale_threshold;
        let runs = self
            .store
            .list_runs_by_status(SyncStatus::Continuing, since)
            .await?;
        let mut queued = 0;
        for run in &runs {
            match self.enqueue(run).await {
                Ok(()) => queued += 1,
                Err(e) => tracing::error!(sync_run_id = %run.id, error = %e, "Failed to recover run"),
            }
        }
        if queued > 0 {
            tracing::info!(count = queued, "Recovered continuing sync runs");
        }
        Ok(queued)
    }

    /// Stop accepting work and wait up to `grace` for in-flight invocations.
    pub async fn shutdown(&self, grace: Duration) {
        tracing::info!("Initiating continuation worker shutdown");
        self.shutdown_token.cancel();
        self.tracker.close();
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            tracing::warn!("Continuation workers did not finish within the grace period");
        }
    }

    async fn process_job(&self, engine: &SyncEngine, job: SyncJob) {
        match self.coordinator.claim(job.run_id).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(sync_run_id = %job.run_id, "Run already claimed or finished");
                return;
            }
            Err(e) => {
                tracing::error!(sync_run_id = %job.run_id, error = %e, "Failed to claim run");
                return;
            }
        }

        tracing::info!(sync_run_id = %job.run_id, source = %job.source, "Continuation claimed");

        if let Err(e) = self.drive(engine, job.run_id).await {
            record_error("continuation");
            tracing::error!(sync_run_id = %job.run_id, error = %e, "Continuation failed");
            match self.store.get_run(job.run_id).await {
                Ok(Some(run)) => {
                    if let Err(fail_err) = self.coordinator.fail(&run, &e.to_string()).await {
                        tracing::error!(sync_run_id = %job.run_id, error = %fail_err, "Failed to mark run failed");
                    }
                }
                Ok(None) => {}
                Err(read_err) => {
                    tracing::error!(sync_run_id = %job.run_id, error = %read_err, "Failed to read run after continuation error");
                }
            }
        }
    }

    /// Run invocations for a claimed run until it no longer needs this worker.
    async fn drive(&self, engine: &SyncEngine, run_id: Uuid) -> Result<(), SyncError> {
        let budget = self.coordinator.policy().invocation_budget;
        loop {
            let run = self
                .store
                .get_run(run_id)
                .await?
                .ok_or(SyncError::RunNotFound(run_id))?;
            if run.status != SyncStatus::Running {
                return Ok(());
            }

            match engine.run_invocation(&run, budget).await? {
                InvocationOutcome::HandOff(HandOffReason::Budget) => {
                    return self.trigger_continuation(&run).await;
                }
                InvocationOutcome::HandOff(HandOffReason::Paused) => {
                    if !self.wait_while_paused(&run).await? {
                        return Ok(());
                    }
                }
                InvocationOutcome::Completed
                | InvocationOutcome::Stopped(_)
                | InvocationOutcome::Failed(_) => return Ok(()),
            }
        }
    }

    /// Heartbeat a paused run until it is unpaused. Returns false when the
    /// worker should stop driving it (cancelled, or shutting down).
    async fn wait_while_paused(&self, run: &SyncRun) -> Result<bool, SyncError> {
        let poll = self.coordinator.policy().pause_poll_interval;
        tracing::info!(sync_run_id = %run.id, source = %run.source, "Waiting for source to be unpaused");
        while self.coordinator.is_paused(&run.source).await? {
            if !self.store.touch_run(run.id).await? {
                return Ok(false);
            }
            tokio::select! {
                _ = self.shutdown_token.cancelled() => {
                    self.coordinator.hand_off(run.id).await?;
                    return Ok(false);
                }
                _ = tokio::time::sleep(poll) => {}
            }
        }
        tracing::info!(sync_run_id = %run.id, "Source unpaused, resuming");
        Ok(true)
    }
}
