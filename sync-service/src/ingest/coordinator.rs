//! Run lifecycle: single-flight per source, stale reclamation, resume and
//! terminal transitions.
//!
//! ```text
//! none -> running -> {continuing <-> running}* -> completed | failed | cancelled
//! ```

use crate::config::SyncServiceConfig;
use crate::ingest::chunker::{chunk_range, ChunkError, ChunkWindow};
use crate::models::{NewSyncRun, RunProgress, SyncParams, SyncRun, SyncStatus};
use crate::services::metrics::record_sync_run;
use crate::services::payment_api::FetchError;
use crate::services::store::{CreateRunOutcome, Store};
use chrono::{DateTime, Duration, Utc};
use service_core::error::AppError;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("a sync is already in progress (run {existing})")]
    Conflict { existing: Uuid },

    #[error("sync run {id} cannot be resumed from status '{}'", .status.as_str())]
    NotResumable { id: Uuid, status: SyncStatus },

    #[error("sync run {0} not found")]
    RunNotFound(Uuid),

    #[error("invalid date range: {0}")]
    InvalidRange(#[from] ChunkError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("continuation dispatch failed: {0}")]
    Dispatch(String),

    #[error(transparent)]
    Store(#[from] AppError),
}

impl From<SyncError> for AppError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::Conflict { .. } | SyncError::NotResumable { .. } => {
                AppError::Conflict(anyhow::anyhow!(err.to_string()))
            }
            SyncError::RunNotFound(_) => AppError::NotFound(anyhow::anyhow!(err.to_string())),
            SyncError::InvalidRange(_) => AppError::BadRequest(anyhow::anyhow!(err.to_string())),
            SyncError::Fetch(FetchError::AuthFailure(msg)) => AppError::BadGateway(msg),
            SyncError::Fetch(e) => AppError::BadGateway(e.to_string()),
            SyncError::Dispatch(msg) => AppError::InternalError(anyhow::anyhow!(msg)),
            SyncError::Store(e) => e,
        }
    }
}

/// Tunables shared by the coordinator, the engine and the workers.
#[derive(Debug, Clone)]
pub struct SyncPolicy {
    pub stale_threshold: Duration,
    pub max_window_days: u32,
    pub end_date_safety: Duration,
    pub default_lookback: Duration,
    pub invocation_budget: std::time::Duration,
    pub upsert_batch_size: usize,
    pub pause_poll_interval: std::time::Duration,
}

impl SyncPolicy {
    pub fn from_config(config: &SyncServiceConfig) -> Self {
        Self {
            stale_threshold: Duration::minutes(config.sync.stale_threshold_minutes),
            max_window_days: config.payment_api.max_window_days,
            end_date_safety: Duration::seconds(config.payment_api.end_date_safety_secs as i64),
            default_lookback: Duration::days(config.sync.default_lookback_days),
            invocation_budget: std::time::Duration::from_secs(config.sync.invocation_budget_secs),
            upsert_batch_size: config.sync.upsert_batch_size,
            pause_poll_interval: std::time::Duration::from_secs(config.sync.pause_poll_secs),
        }
    }
}

/// What a caller asks for when triggering a sync.
#[derive(Debug, Clone, Default)]
pub struct StartRequest {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub fetch_all: bool,
    pub page: Option<u32>,
    /// Resume this specific `continuing` run instead of starting a new one.
    pub resume: Option<Uuid>,
    /// Pick up the source's `continuing` run, if any, instead of conflicting
    /// with it.
    pub continuation: bool,
}

/// Next step after a page has been processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Continuation {
    Continue { chunk_index: u32, page: u32 },
    Complete,
}

/// More pages in the current chunk, or (when fetching everything) more
/// chunks, means continue.
pub fn decide_continuation(
    chunk_index: u32,
    page: u32,
    total_pages: u32,
    total_chunks: u32,
    fetch_all: bool,
) -> Continuation {
    if page < total_pages {
        Continuation::Continue {
            chunk_index,
            page: page + 1,
        }
    } else if fetch_all && chunk_index + 1 < total_chunks {
        Continuation::Continue {
            chunk_index: chunk_index + 1,
            page: 1,
        }
    } else {
        Continuation::Complete
    }
}

/// Windows for a run's persisted parameters. Deterministic, so every
/// invocation recomputes the same plan.
pub fn plan_chunks(params: &SyncParams, max_window_days: u32) -> Result<Vec<ChunkWindow>, ChunkError> {
    if params.start > params.end {
        // Entire range was clamped away; nothing is available yet.
        return Ok(Vec::new());
    }
    chunk_range(params.start, params.end, max_window_days)
}

pub struct RunCoordinator {
    store: Arc<dyn Store>,
    policy: SyncPolicy,
}

impl RunCoordinator {
    pub fn new(store: Arc<dyn Store>, policy: SyncPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> &SyncPolicy {
        &self.policy
    }

    /// Resolve request dates into persisted parameters.
    ///
    /// The end is clamped to `now - safety`; an inverted request is an error.
    pub fn resolve_params(
        &self,
        request: &StartRequest,
        now: DateTime<Utc>,
    ) -> Result<SyncParams, SyncError> {
        let requested_end = request.end.unwrap_or(now);
        let start = request.start.unwrap_or(now - self.policy.default_lookback);
        if start > requested_end {
            return Err(ChunkError::InvertedRange {
                start,
                end: requested_end,
            }
            .into());
        }
        if self.policy.max_window_days == 0 {
            return Err(ChunkError::ZeroWindow.into());
        }

        Ok(SyncParams {
            start,
            end: requested_end.min(now - self.policy.end_date_safety),
            fetch_all: request.fetch_all,
            start_page: request.page.unwrap_or(1).max(1),
        })
    }

    /// Create a new run or claim a `continuing` one.
    pub async fn start_or_resume(
        &self,
        source: &str,
        request: &StartRequest,
    ) -> Result<SyncRun, SyncError> {
        if let Some(run_id) = request.resume {
            return self.resume(source, run_id).await;
        }

        let now = Utc::now();
        if let Some(active) = self.store.find_active_run(source).await? {
            if request.continuation && active.status == SyncStatus::Continuing {
                return self.resume(source, active.id).await;
            }
            if !active.is_stale(now, self.policy.stale_threshold) {
                info!(
                    source = %source,
                    existing_sync_id = %active.id,
                    "Rejecting sync start, run already active"
                );
                return Err(SyncError::Conflict {
                    existing: active.id,
                });
            }

            let reason = format!(
                "stale: no activity since {}",
                active.checkpoint.last_activity.to_rfc3339()
            );
            // The idle predicate is re-checked in the update. A run that
            // checkpointed since the read stays active and the insert conflicts.
            let cutoff = now - self.policy.stale_threshold;
            let reclaimed = self
                .store
                .fail_stale_runs(source, cutoff, &reason)
                .await?
                .contains(&active.id);
            if reclaimed {
                record_sync_run(source, SyncStatus::Failed.as_str());
                warn!(
                    source = %source,
                    sync_run_id = %active.id,
                    last_activity = %active.checkpoint.last_activity,
                    "Reclaimed stale sync run"
                );
            }
        }

        let params = self.resolve_params(request, now)?;
        let chunks = plan_chunks(&params, self.policy.max_window_days)?;

        let new_run = NewSyncRun {
            id: Uuid::new_v4(),
            source: source.to_string(),
            params,
            total_chunks: chunks.len() as u32,
            metadata: serde_json::json!({ "trigger": "api" }),
        };

        match self.store.insert_run(new_run).await? {
            CreateRunOutcome::Created(run) => {
                record_sync_run(source, SyncStatus::Running.as_str());
                info!(
                    source = %source,
                    sync_run_id = %run.id,
                    start = %run.params.start,
                    end = %run.params.end,
                    total_chunks = run.checkpoint.total_chunks,
                    fetch_all = run.params.fetch_all,
                    "Sync run started"
                );
                Ok(run)
            }
            CreateRunOutcome::Conflict(existing) => Err(SyncError::Conflict { existing }),
        }
    }

    async fn resume(&self, source: &str, run_id: Uuid) -> Result<SyncRun, SyncError> {
        let run = self
            .store
            .get_run(run_id)
            .await?
            .filter(|r| r.source == source)
            .ok_or(SyncError::RunNotFound(run_id))?;

        if !self.claim(run.id).await? {
            let current = self
                .store
                .get_run(run_id)
                .await?
                .map(|r| r.status)
                .unwrap_or(run.status);
            return Err(if current.is_active() {
                SyncError::Conflict { existing: run_id }
            } else {
                SyncError::NotResumable {
                    id: run_id,
                    status: current,
                }
            });
        }

        info!(source = %source, sync_run_id = %run_id, "Sync run resumed");
        self.store
            .get_run(run_id)
            .await?
            .ok_or(SyncError::RunNotFound(run_id))
    }

    /// `continuing -> running`. Only one caller can win.
    pub async fn claim(&self, run_id: Uuid) -> Result<bool, SyncError> {
        Ok(self
            .store
            .transition_run(run_id, &[SyncStatus::Continuing], SyncStatus::Running, None)
            .await?)
    }

    /// `running -> continuing`, after the checkpoint has been written.
    pub async fn hand_off(&self, run_id: Uuid) -> Result<bool, SyncError> {
        Ok(self
            .store
            .transition_run(run_id, &[SyncStatus::Running], SyncStatus::Continuing, None)
            .await?)
    }

    pub async fn checkpoint(
        &self,
        run_id: Uuid,
        progress: &RunProgress,
    ) -> Result<SyncStatus, SyncError> {
        Ok(self.store.save_checkpoint(run_id, progress).await?)
    }

    pub async fn complete(&self, run: &SyncRun) -> Result<bool, SyncError> {
        let done = self
            .store
            .transition_run(run.id, &SyncStatus::ACTIVE, SyncStatus::Completed, None)
            .await?;
        if done {
            record_sync_run(&run.source, SyncStatus::Completed.as_str());
            info!(source = %run.source, sync_run_id = %run.id, "Sync run completed");
        }
        Ok(done)
    }

    pub async fn fail(&self, run: &SyncRun, error: &str) -> Result<bool, SyncError> {
        let failed = self
            .store
            .transition_run(run.id, &SyncStatus::ACTIVE, SyncStatus::Failed, Some(error))
            .await?;
        if failed {
            record_sync_run(&run.source, SyncStatus::Failed.as_str());
            warn!(source = %run.source, sync_run_id = %run.id, error = %error, "Sync run failed");
        }
        Ok(failed)
    }

    /// Cancel every active run of `source`.
    pub async fn cancel_all(&self, source: &str) -> Result<Vec<Uuid>, SyncError> {
        let cancelled = self.store.cancel_active_runs(source).await?;
        for id in &cancelled {
            record_sync_run(source, SyncStatus::Cancelled.as_str());
            info!(source = %source, sync_run_id = %id, "Sync run cancelled");
        }
        Ok(cancelled)
    }

    /// Fail active runs idle for longer than `threshold_minutes`.
    pub async fn cleanup_stale(
        &self,
        source: &str,
        threshold_minutes: i64,
    ) -> Result<Vec<Uuid>, SyncError> {
        let cutoff = Utc::now() - Duration::minutes(threshold_minutes);
        let reason = format!("stale: no activity for {} minutes", threshold_minutes);
        let failed = self.store.fail_stale_runs(source, cutoff, &reason).await?;
        for id in &failed {
            record_sync_run(source, SyncStatus::Failed.as_str());
            warn!(source = %source, sync_run_id = %id, "Stale sync run marked failed");
        }
        Ok(failed)
    }

    pub async fn is_paused(&self, source: &str) -> Result<bool, SyncError> {
        Ok(self.store.is_paused(source).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::store::{MemoryStore, SyncRunStore};

    fn policy() -> SyncPolicy {
        SyncPolicy {
            stale_threshold: Duration::minutes(15),
            max_window_days: 31,
            end_date_safety: Duration::minutes(5),
            default_lookback: Duration::days(90),
            invocation_budget: std::time::Duration::from_secs(5),
            upsert_batch_size: 500,
            pause_poll_interval: std::time::Duration::from_millis(10),
        }
    }

    fn coordinator() -> (Arc<MemoryStore>, RunCoordinator) {
        let store = Arc::new(MemoryStore::new());
        (store.clone(), RunCoordinator::new(store, policy()))
    }

    #[test]
    fn continues_while_pages_remain_in_chunk() {
        assert_eq!(
            decide_continuation(0, 1, 3, 3, false),
            Continuation::Continue {
                chunk_index: 0,
                page: 2
            }
        );
    }

    #[test]
    fn moves_to_next_chunk_only_when_fetching_everything() {
        assert_eq!(
            decide_continuation(0, 3, 3, 3, true),
            Continuation::Continue {
                chunk_index: 1,
                page: 1
            }
        );
        assert_eq!(decide_continuation(0, 3, 3, 3, false), Continuation::Complete);
        assert_eq!(decide_continuation(2, 1, 1, 3, true), Continuation::Complete);
        assert_eq!(
            decide_continuation(1, 1, 0, 3, true),
            Continuation::Continue {
                chunk_index: 2,
                page: 1
            }
        );
    }

    #[test]
    fn end_date_is_clamped_and_future_ranges_plan_nothing() {
        let (_, coordinator) = coordinator();
        let now = Utc::now();

        let params = coordinator
            .resolve_params(
                &StartRequest {
                    start: Some(now + Duration::days(1)),
                    end: Some(now + Duration::days(2)),
                    ..Default::default()
                },
                now,
            )
            .unwrap();
        assert_eq!(params.end, now - Duration::minutes(5));
        assert!(plan_chunks(&params, 31).unwrap().is_empty());

        let inverted = coordinator.resolve_params(
            &StartRequest {
                start: Some(now),
                end: Some(now - Duration::days(1)),
                ..Default::default()
            },
            now,
        );
        assert!(matches!(inverted, Err(SyncError::InvalidRange(_))));
    }

    #[tokio::test]
    async fn active_run_blocks_a_second_start() {
        let (_, coordinator) = coordinator();
        let first = coordinator
            .start_or_resume("gateway", &StartRequest::default())
            .await
            .unwrap();

        match coordinator
            .start_or_resume("gateway", &StartRequest::default())
            .await
        {
            Err(SyncError::Conflict { existing }) => assert_eq!(existing, first.id),
            other => panic!("expected conflict, got {:?}", other.map(|r| r.id)),
        }
    }

    #[tokio::test]
    async fn stale_run_is_failed_before_a_new_one_starts() {
        let store = Arc::new(MemoryStore::new());
        let mut stale_policy = policy();
        stale_policy.stale_threshold = Duration::zero();
        let coordinator = RunCoordinator::new(store.clone(), stale_policy);

        let first = coordinator
            .start_or_resume("gateway", &StartRequest::default())
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = coordinator
            .start_or_resume("gateway", &StartRequest::default())
            .await
            .unwrap();

        assert_ne!(first.id, second.id);
        let old = store.get_run(first.id).await.unwrap().unwrap();
        assert_eq!(old.status, SyncStatus::Failed);
        assert!(old.error_message.unwrap().starts_with("stale"));
    }

    #[tokio::test]
    async fn resume_claims_a_continuing_run_once() {
        let (_, coordinator) = coordinator();
        let run = coordinator
            .start_or_resume("gateway", &StartRequest::default())
            .await
            .unwrap();
        assert!(coordinator.hand_off(run.id).await.unwrap());

        let resume = StartRequest {
            resume: Some(run.id),
            ..Default::default()
        };
        let resumed = coordinator.start_or_resume("gateway", &resume).await.unwrap();
        assert_eq!(resumed.status, SyncStatus::Running);
        assert!(matches!(
            coordinator.start_or_resume("gateway", &resume).await,
            Err(SyncError::Conflict { .. })
        ));
    }

    #[tokio::test]
    async fn continuation_request_picks_up_the_continuing_run() {
        let (_, coordinator) = coordinator();
        let run = coordinator
            .start_or_resume("gateway", &StartRequest::default())
            .await
            .unwrap();

        let follow_up = StartRequest {
            continuation: true,
            ..Default::default()
        };
        assert!(matches!(
            coordinator.start_or_resume("gateway", &follow_up).await,
            Err(SyncError::Conflict { existing }) if existing == run.id
        ));

        assert!(coordinator.hand_off(run.id).await.unwrap());
        let resumed = coordinator.start_or_resume("gateway", &follow_up).await.unwrap();
        assert_eq!(resumed.id, run.id);
        assert_eq!(resumed.status, SyncStatus::Running);
    }

    #[tokio::test]
    async fn cancel_all_and_cleanup_stale() {
        let (store, coordinator) = coordinator();
        let run = coordinator
            .start_or_resume("gateway", &StartRequest::default())
            .await
            .unwrap();

        assert!(coordinator.cleanup_stale("gateway", 60).await.unwrap().is_empty());
        assert_eq!(coordinator.cancel_all("gateway").await.unwrap(), vec![run.id]);
        assert_eq!(
            store.get_run(run.id).await.unwrap().unwrap().status,
            SyncStatus::Cancelled
        );
        assert!(coordinator.cancel_all("gateway").await.unwrap().is_empty());
    }
}
