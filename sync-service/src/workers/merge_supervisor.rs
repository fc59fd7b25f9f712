//! Supervises background merges of staged imports.
//!
//! The staging response returns before merging starts; the merge runs here
//! as a tracked task and its progress is polled through the ImportRun.

use crate::import::{MergeReport, MergeWorker};
use crate::models::ImportStatus;
use crate::services::metrics::record_error;
use crate::services::store::Store;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use service_core::error::AppError;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

/// Statuses a merge can claim.
const MERGEABLE: [ImportStatus; 3] = [
    ImportStatus::Staged,
    ImportStatus::Processing,
    ImportStatus::Failed,
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeTaskState {
    Running,
    Finished(MergeReport),
    Failed(String),
}

pub struct MergeSupervisor {
    store: Arc<dyn Store>,
    worker: Arc<MergeWorker>,
    tasks: Arc<DashMap<Uuid, MergeTaskState>>,
    tracker: TaskTracker,
    shutdown_token: CancellationToken,
}

impl MergeSupervisor {
    pub fn new(store: Arc<dyn Store>, worker: MergeWorker) -> Self {
        Self {
            store,
            worker: Arc::new(worker),
            tasks: Arc::new(DashMap::new()),
            tracker: TaskTracker::new(),
            shutdown_token: CancellationToken::new(),
        }
    }

    pub fn state(&self, import_id: Uuid) -> Option<MergeTaskState> {
        self.tasks.get(&import_id).map(|s| s.value().clone())
    }

    /// Start merging `import_id` in the background.
    ///
    /// A `failed` import is claimable again so rows a broken pass left
    /// pending still reach a terminal status. Returns false when a merge for
    /// the import is already running or the import is not in a mergeable
    /// state.
    pub async fn spawn(&self, import_id: Uuid) -> Result<bool, AppError> {
        if self.shutdown_token.is_cancelled() {
            return Ok(false);
        }

        match self.tasks.entry(import_id) {
            Entry::Occupied(mut entry) => {
                if *entry.get() == MergeTaskState::Running {
                    tracing::debug!(import_id = %import_id, "Merge already running");
                    return Ok(false);
                }
                entry.insert(MergeTaskState::Running);
            }
            Entry::Vacant(entry) => {
                entry.insert(MergeTaskState::Running);
            }
        }

        let claimed = match self
            .store
            .transition_import(import_id, &MERGEABLE, ImportStatus::Processing, None)
            .await
        {
            Ok(claimed) => claimed,
            Err(e) => {
                self.tasks.remove(&import_id);
                return Err(e);
            }
        };
        if !claimed {
            self.tasks.remove(&import_id);
            return Ok(false);
        }

        let store = self.store.clone();
        let worker = self.worker.clone();
        let tasks = self.tasks.clone();
        self.tracker.spawn(async move {
            tracing::info!(import_id = %import_id, "Merge started");
            let state = match run_merge(store.as_ref(), &worker, import_id).await {
                Ok(report) => MergeTaskState::Finished(report),
                Err(e) => {
                    record_error("merge");
                    tracing::error!(import_id = %import_id, error = %e, "Merge failed");
                    let message = e.to_string();
                    if let Err(e) = store
                        .transition_import(
                            import_id,
                            &[ImportStatus::Processing],
                            ImportStatus::Failed,
                            Some(&message),
                        )
                        .await
                    {
                        tracing::error!(import_id = %import_id, error = %e, "Failed to mark import failed");
                    }
                    MergeTaskState::Failed(message)
                }
            };
            tasks.insert(import_id, state);
        });

        Ok(true)
    }

    /// Re-spawn merges for imports left `staged` or `processing`, and for
    /// failed imports that still have pending rows.
    pub async fn recover(&self) -> Result<usize, AppError> {
        let candidates = self.store.list_imports_by_status(&MERGEABLE).await?;
        let mut spawned = 0;
        for import in candidates {
            if import.status == ImportStatus::Failed
                && self.store.count_rows_by_status(import.id).await?.pending == 0
            {
                continue;
            }
            if self.spawn(import.id).await? {
                spawned += 1;
            }
        }
        if spawned > 0 {
            tracing::info!(count = spawned, "Recovered unfinished imports");
        }
        Ok(spawned)
    }

    /// Stop spawning and wait up to `grace` for running merges. Rows left
    /// pending are picked up by `recover` on the next start.
    pub async fn shutdown(&self, grace: Duration) {
        self.shutdown_token.cancel();
        self.tracker.close();
        if tokio::time::timeout(grace, self.tracker.wait()).await.is_err() {
            tracing::warn!("Merges did not finish within the grace period");
        }
    }
}

async fn run_merge(
    store: &dyn Store,
    worker: &MergeWorker,
    import_id: Uuid,
) -> Result<MergeReport, AppError> {
    let report = worker.run(import_id).await?;

    let remaining = store.count_rows_by_status(import_id).await?;
    if remaining.pending > 0 {
        return Err(AppError::InternalError(anyhow::anyhow!(
            "{} rows still pending after merge",
            remaining.pending
        )));
    }

    store
        .transition_import(import_id, &[ImportStatus::Processing], ImportStatus::Completed, None)
        .await?;
    tracing::info!(import_id = %import_id, merged = report.merged, "Import completed");
    Ok(report)
}
