//! Persistence seams.
//!
//! Every cross-invocation fact lives behind these traits. Status changes are
//! conditional updates, so rows double as the mutual-exclusion primitive.
//! `Database` is the Postgres implementation; `MemoryStore` mirrors its
//! semantics for tests and local runs.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::Database;

use crate::models::{
    ImportRun, ImportStatus, MergedCustomer, NewStagingRow, NewSyncRun,
    NormalizedRecord, RowStatus, RunProgress, StagedChunk, StagingRow, SyncRun, SyncStatus,
    UpsertCounts,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use uuid::Uuid;

/// Result of inserting a new run.
#[derive(Debug, Clone)]
pub enum CreateRunOutcome {
    Created(SyncRun),
    /// Another active run holds the source.
    Conflict(Uuid),
}

/// Result of committing one merge group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupCommit {
    pub customer_id: Uuid,
    pub rows: u64,
    /// The customer existed before this group was merged.
    pub existed: bool,
}

/// Merge outcome counters added to an import run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeCounts {
    pub merged: i64,
    pub conflict: i64,
    pub skipped: i64,
    pub error: i64,
}

/// Staging rows of one import, by processing status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RowCounts {
    pub pending: i64,
    pub merged: i64,
    pub skipped: i64,
    pub error: i64,
}

impl RowCounts {
    pub fn total(&self) -> i64 {
        self.pending + self.merged + self.skipped + self.error
    }
}

#[async_trait]
pub trait SyncRunStore: Send + Sync {
    async fn find_active_run(&self, source: &str) -> Result<Option<SyncRun>, AppError>;

    /// Insert a `running` run unless the source already has an active one.
    async fn insert_run(&self, run: NewSyncRun) -> Result<CreateRunOutcome, AppError>;

    async fn get_run(&self, id: Uuid) -> Result<Option<SyncRun>, AppError>;

    /// Write cursors and absolute counters for an active run.
    ///
    /// Returns the status observed after the write. A terminal status means
    /// the write was refused and the caller must stop. A cursor lower than
    /// the persisted one is ignored.
    async fn save_checkpoint(&self, id: Uuid, progress: &RunProgress)
        -> Result<SyncStatus, AppError>;

    /// Move a run from one of `from` to `to`; false when no row matched.
    async fn transition_run(
        &self,
        id: Uuid,
        from: &[SyncStatus],
        to: SyncStatus,
        error: Option<&str>,
    ) -> Result<bool, AppError>;

    /// Refresh `last_activity` of an active run.
    async fn touch_run(&self, id: Uuid) -> Result<bool, AppError>;

    async fn cancel_active_runs(&self, source: &str) -> Result<Vec<Uuid>, AppError>;

    /// Fail active runs of `source` idle since before `older_than`.
    async fn fail_stale_runs(
        &self,
        source: &str,
        older_than: DateTime<Utc>,
        reason: &str,
    ) -> Result<Vec<Uuid>, AppError>;

    /// Runs in `status` with activity after `active_since`, oldest first.
    async fn list_runs_by_status(
        &self,
        status: SyncStatus,
        active_since: DateTime<Utc>,
    ) -> Result<Vec<SyncRun>, AppError>;

    async fn is_paused(&self, source: &str) -> Result<bool, AppError>;

    async fn set_paused(&self, source: &str, paused: bool) -> Result<(), AppError>;
}

#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Upsert records on `(source, external_id)`. Keys must be unique within
    /// the slice.
    async fn upsert_transactions(
        &self,
        records: &[NormalizedRecord],
    ) -> Result<UpsertCounts, AppError>;
}

#[async_trait]
pub trait ImportStore: Send + Sync {
    async fn create_import(&self, filename: &str, source_type: &str)
        -> Result<ImportRun, AppError>;

    async fn get_import(&self, id: Uuid) -> Result<Option<ImportRun>, AppError>;

    /// Reserve `count` row numbers on an import still in `staging`.
    ///
    /// Returns the number of data rows staged before this call, or `None`
    /// when the import is not accepting rows.
    async fn reserve_rows(&self, id: Uuid, count: i64) -> Result<Option<i64>, AppError>;

    async fn insert_staging_rows(
        &self,
        import_id: Uuid,
        source_type: &str,
        rows: &[NewStagingRow],
    ) -> Result<u64, AppError>;

    /// Add chunk counters; `final_chunk` moves the import to `staged`.
    async fn record_staged_chunk(
        &self,
        id: Uuid,
        chunk: &StagedChunk,
        final_chunk: bool,
    ) -> Result<Option<ImportRun>, AppError>;

    async fn transition_import(
        &self,
        id: Uuid,
        from: &[ImportStatus],
        to: ImportStatus,
        error: Option<&str>,
    ) -> Result<bool, AppError>;

    async fn list_imports_by_status(
        &self,
        statuses: &[ImportStatus],
    ) -> Result<Vec<ImportRun>, AppError>;

    /// Pending rows of an import in row order.
    async fn fetch_pending_rows(
        &self,
        import_id: Uuid,
        limit: i64,
    ) -> Result<Vec<StagingRow>, AppError>;

    /// Set a terminal status on rows that are still pending.
    async fn mark_rows(
        &self,
        row_ids: &[Uuid],
        status: RowStatus,
        error: Option<&str>,
    ) -> Result<u64, AppError>;

    /// Atomically upsert the group's customer and mark its rows merged.
    ///
    /// `None` when any row was no longer pending; nothing is written then.
    async fn commit_merge_group(
        &self,
        row_ids: &[Uuid],
        customer: &MergedCustomer,
    ) -> Result<Option<GroupCommit>, AppError>;

    async fn add_merge_counts(&self, id: Uuid, counts: &MergeCounts) -> Result<(), AppError>;

    async fn count_rows_by_status(&self, import_id: Uuid) -> Result<RowCounts, AppError>;
}

/// Everything the service persists.
#[async_trait]
pub trait Store: SyncRunStore + TransactionStore + ImportStore {
    async fn health_check(&self) -> Result<(), AppError>;
}
