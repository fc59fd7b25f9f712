//! In-process store used by tests and `STORE_BACKEND=memory`.
//!
//! All tables sit behind one `tokio::sync::Mutex`, so each method is atomic
//! the same way a single conditional statement is in Postgres.

use super::{
    CreateRunOutcome, GroupCommit, ImportStore, MergeCounts, RowCounts, Store, SyncRunStore,
    TransactionStore,
};
use crate::models::{
    Customer, ImportRun, ImportStatus, MergedCustomer, NewStagingRow, NewSyncRun,
    NormalizedRecord, RowStatus, RunProgress, StagedChunk, StagingRow, SyncCheckpoint, SyncRun,
    SyncStatus, UpsertCounts,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    runs: HashMap<Uuid, SyncRun>,
    paused: HashMap<String, bool>,
    transactions: HashMap<(String, String), NormalizedRecord>,
    imports: HashMap<Uuid, ImportRun>,
    rows: HashMap<Uuid, StagingRow>,
    row_order: HashMap<Uuid, Vec<Uuid>>,
    customers: HashMap<Uuid, Customer>,
    customers_by_email: HashMap<String, Uuid>,
    customers_by_phone: HashMap<String, Uuid>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn cursor(chunk_index: u32, page: u32) -> (u32, u32) {
    (chunk_index, page)
}

#[async_trait]
impl SyncRunStore for MemoryStore {
    async fn find_active_run(&self, source: &str) -> Result<Option<SyncRun>, AppError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .runs
            .values()
            .find(|r| r.source == source && r.status.is_active())
            .cloned())
    }

    async fn insert_run(&self, run: NewSyncRun) -> Result<CreateRunOutcome, AppError> {
        let mut tables = self.tables.lock().await;
        if let Some(active) = tables
            .runs
            .values()
            .find(|r| r.source == run.source && r.status.is_active())
        {
            return Ok(CreateRunOutcome::Conflict(active.id));
        }

        let now = Utc::now();
        let created = SyncRun {
            id: run.id,
            source: run.source,
            status: SyncStatus::Running,
            started_at: now,
            completed_at: None,
            total_fetched: 0,
            total_inserted: 0,
            total_skipped: 0,
            checkpoint: SyncCheckpoint {
                page: run.params.start_page,
                chunk_index: 0,
                chunk_start: None,
                chunk_end: None,
                total_chunks: run.total_chunks,
                total_pages: None,
                last_activity: now,
            },
            params: run.params,
            metadata: run.metadata,
            error_message: None,
        };
        tables.runs.insert(created.id, created.clone());
        Ok(CreateRunOutcome::Created(created))
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<SyncRun>, AppError> {
        Ok(self.tables.lock().await.runs.get(&id).cloned())
    }

    async fn save_checkpoint(
        &self,
        id: Uuid,
        progress: &RunProgress,
    ) -> Result<SyncStatus, AppError> {
        let mut tables = self.tables.lock().await;
        let run = tables
            .runs
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Sync run {} not found", id)))?;

        if !run.status.is_active() {
            return Ok(run.status);
        }
        if cursor(progress.chunk_index, progress.page)
            < cursor(run.checkpoint.chunk_index, run.checkpoint.page)
        {
            return Ok(run.status);
        }

        run.checkpoint = SyncCheckpoint {
            page: progress.page,
            chunk_index: progress.chunk_index,
            chunk_start: progress.chunk_start,
            chunk_end: progress.chunk_end,
            total_chunks: progress.total_chunks,
            total_pages: progress.total_pages,
            last_activity: Utc::now(),
        };
        run.total_fetched = progress.total_fetched;
        run.total_inserted = progress.total_inserted;
        run.total_skipped = progress.total_skipped;
        Ok(run.status)
    }

    async fn transition_run(
        &self,
        id: Uuid,
        from: &[SyncStatus],
        to: SyncStatus,
        error: Option<&str>,
    ) -> Result<bool, AppError> {
        let mut tables = self.tables.lock().await;
        let Some(run) = tables.runs.get_mut(&id) else {
            return Ok(false);
        };
        if !from.contains(&run.status) {
            return Ok(false);
        }

        let now = Utc::now();
        run.status = to;
        run.checkpoint.last_activity = now;
        if !to.is_active() {
            run.completed_at = Some(now);
        }
        if let Some(message) = error {
            run.error_message = Some(message.to_string());
        }
        Ok(true)
    }

    async fn touch_run(&self, id: Uuid) -> Result<bool, AppError> {
        let mut tables = self.tables.lock().await;
        match tables.runs.get_mut(&id) {
            Some(run) if run.status.is_active() => {
                run.checkpoint.last_activity = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn cancel_active_runs(&self, source: &str) -> Result<Vec<Uuid>, AppError> {
        let mut tables = self.tables.lock().await;
        let now = Utc::now();
        let mut cancelled = Vec::new();
        for run in tables
            .runs
            .values_mut()
            .filter(|r| r.source == source && r.status.is_active())
        {
            run.status = SyncStatus::Cancelled;
            run.completed_at = Some(now);
            run.checkpoint.last_activity = now;
            cancelled.push(run.id);
        }
        Ok(cancelled)
    }

    async fn fail_stale_runs(
        &self,
        source: &str,
        older_than: DateTime<Utc>,
        reason: &str,
    ) -> Result<Vec<Uuid>, AppError> {
        let mut tables = self.tables.lock().await;
        let now = Utc::now();
        let mut failed = Vec::new();
        for run in tables.runs.values_mut().filter(|r| {
            r.source == source && r.status.is_active() && r.checkpoint.last_activity < older_than
        }) {
            run.status = SyncStatus::Failed;
            run.completed_at = Some(now);
            run.error_message = Some(reason.to_string());
            failed.push(run.id);
        }
        Ok(failed)
    }

    async fn list_runs_by_status(
        &self,
        status: SyncStatus,
        active_since: DateTime<Utc>,
    ) -> Result<Vec<SyncRun>, AppError> {
        let tables = self.tables.lock().await;
        let mut runs: Vec<SyncRun> = tables
            .runs
            .values()
            .filter(|r| r.status == status && r.checkpoint.last_activity >= active_since)
            .cloned()
            .collect();
        runs.sort_by_key(|r| r.started_at);
        Ok(runs)
    }

    async fn is_paused(&self, source: &str) -> Result<bool, AppError> {
        let tables = self.tables.lock().await;
        Ok(tables.paused.get(source).copied().unwrap_or(false))
    }

    async fn set_paused(&self, source: &str, paused: bool) -> Result<(), AppError> {
        let mut tables = self.tables.lock().await;
        tables.paused.insert(source.to_string(), paused);
        Ok(())
    }
}

#[async_trait]
impl TransactionStore for MemoryStore {
    async fn upsert_transactions(
        &self,
        records: &[NormalizedRecord],
    ) -> Result<UpsertCounts, AppError> {
        let mut tables = self.tables.lock().await;
        let mut counts = UpsertCounts::default();
        for record in records {
            let key = (record.source.clone(), record.external_id.clone());
            if tables.transactions.insert(key, record.clone()).is_some() {
                counts.updated += 1;
            } else {
                counts.inserted += 1;
            }
        }
        Ok(counts)
    }
}

#[async_trait]
impl ImportStore for MemoryStore {
    async fn create_import(
        &self,
        filename: &str,
        source_type: &str,
    ) -> Result<ImportRun, AppError> {
        let run = ImportRun {
            id: Uuid::new_v4(),
            filename: filename.to_string(),
            source_type: source_type.to_string(),
            total_rows: 0,
            rows_staged: 0,
            rows_parse_skipped: 0,
            rows_merged: 0,
            rows_conflict: 0,
            rows_skipped: 0,
            rows_error: 0,
            status: ImportStatus::Staging,
            started_at: Utc::now(),
            staged_at: None,
            completed_at: None,
            error_message: None,
        };
        self.tables.lock().await.imports.insert(run.id, run.clone());
        Ok(run)
    }

    async fn get_import(&self, id: Uuid) -> Result<Option<ImportRun>, AppError> {
        Ok(self.tables.lock().await.imports.get(&id).cloned())
    }

    async fn reserve_rows(&self, id: Uuid, count: i64) -> Result<Option<i64>, AppError> {
        let mut tables = self.tables.lock().await;
        match tables.imports.get_mut(&id) {
            Some(run) if run.status == ImportStatus::Staging => {
                let before = run.total_rows;
                run.total_rows += count;
                Ok(Some(before))
            }
            _ => Ok(None),
        }
    }

    async fn insert_staging_rows(
        &self,
        import_id: Uuid,
        source_type: &str,
        rows: &[NewStagingRow],
    ) -> Result<u64, AppError> {
        let mut tables = self.tables.lock().await;
        if !tables.imports.contains_key(&import_id) {
            return Err(AppError::DatabaseError(anyhow::anyhow!(
                "import {} does not exist",
                import_id
            )));
        }

        let mut ids = Vec::with_capacity(rows.len());
        for row in rows {
            let staged = StagingRow {
                id: Uuid::new_v4(),
                import_id,
                row_number: row.row_number,
                email: row.email.clone(),
                phone: row.phone.clone(),
                full_name: row.full_name.clone(),
                source_type: source_type.to_string(),
                raw_data: row.raw_data.clone(),
                processing_status: RowStatus::Pending,
                merged_entity_id: None,
                error_message: None,
                processed_at: None,
            };
            ids.push(staged.id);
            tables.rows.insert(staged.id, staged);
        }
        tables.row_order.entry(import_id).or_default().extend(ids);
        Ok(rows.len() as u64)
    }

    async fn record_staged_chunk(
        &self,
        id: Uuid,
        chunk: &StagedChunk,
        final_chunk: bool,
    ) -> Result<Option<ImportRun>, AppError> {
        let mut tables = self.tables.lock().await;
        let Some(run) = tables.imports.get_mut(&id) else {
            return Ok(None);
        };
        run.rows_staged += chunk.staged;
        run.rows_parse_skipped += chunk.parse_skipped;
        run.rows_error += chunk.errors;
        if final_chunk && run.status == ImportStatus::Staging {
            run.status = ImportStatus::Staged;
            run.staged_at = Some(Utc::now());
        }
        Ok(Some(run.clone()))
    }

    async fn transition_import(
        &self,
        id: Uuid,
        from: &[ImportStatus],
        to: ImportStatus,
        error: Option<&str>,
    ) -> Result<bool, AppError> {
        let mut tables = self.tables.lock().await;
        let Some(run) = tables.imports.get_mut(&id) else {
            return Ok(false);
        };
        if !from.contains(&run.status) {
            return Ok(false);
        }
        run.status = to;
        if matches!(to, ImportStatus::Completed | ImportStatus::Failed) {
            run.completed_at = Some(Utc::now());
        }
        if let Some(message) = error {
            run.error_message = Some(message.to_string());
        }
        Ok(true)
    }

    async fn list_imports_by_status(
        &self,
        statuses: &[ImportStatus],
    ) -> Result<Vec<ImportRun>, AppError> {
        let tables = self.tables.lock().await;
        let mut runs: Vec<ImportRun> = tables
            .imports
            .values()
            .filter(|r| statuses.contains(&r.status))
            .cloned()
            .collect();
        runs.sort_by_key(|r| r.started_at);
        Ok(runs)
    }

    async fn fetch_pending_rows(
        &self,
        import_id: Uuid,
        limit: i64,
    ) -> Result<Vec<StagingRow>, AppError> {
        let tables = self.tables.lock().await;
        let Some(order) = tables.row_order.get(&import_id) else {
            return Ok(Vec::new());
        };
        let mut rows: Vec<StagingRow> = order
            .iter()
            .filter_map(|id| tables.rows.get(id))
            .filter(|r| r.processing_status == RowStatus::Pending)
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.row_number);
        rows.truncate(limit.max(0) as usize);
        Ok(rows)
    }

    async fn mark_rows(
        &self,
        row_ids: &[Uuid],
        status: RowStatus,
        error: Option<&str>,
    ) -> Result<u64, AppError> {
        let mut tables = self.tables.lock().await;
        let now = Utc::now();
        let mut updated = 0;
        for id in row_ids {
            if let Some(row) = tables.rows.get_mut(id) {
                if row.processing_status == RowStatus::Pending {
                    row.processing_status = status;
                    row.error_message = error.map(str::to_string);
                    row.processed_at = Some(now);
                    updated += 1;
                }
            }
        }
        Ok(updated)
    }

    async fn commit_merge_group(
        &self,
        row_ids: &[Uuid],
        customer: &MergedCustomer,
    ) -> Result<Option<GroupCommit>, AppError> {
        let mut tables = self.tables.lock().await;
        let all_pending = row_ids.iter().all(|id| {
            tables
                .rows
                .get(id)
                .is_some_and(|r| r.processing_status == RowStatus::Pending)
        });
        if !all_pending {
            return Ok(None);
        }

        let existing_id = match (&customer.email, &customer.phone) {
            (Some(email), _) => tables.customers_by_email.get(email).copied(),
            (None, Some(phone)) => tables.customers_by_phone.get(phone).copied(),
            (None, None) => {
                return Err(AppError::BadRequest(anyhow::anyhow!(
                    "merge group has no identity"
                )))
            }
        };
        let existing = existing_id.and_then(|id| tables.customers.get(&id));
        let existed = existing.is_some();

        let now = Utc::now();
        let merged = customer.apply_to(existing, now);
        let customer_id = merged.id;

        match &merged.email {
            Some(email) => {
                tables.customers_by_email.insert(email.clone(), customer_id);
            }
            None => {
                if let Some(phone) = &merged.phone {
                    tables.customers_by_phone.insert(phone.clone(), customer_id);
                }
            }
        }
        tables.customers.insert(customer_id, merged);

        for id in row_ids {
            if let Some(row) = tables.rows.get_mut(id) {
                row.processing_status = RowStatus::Merged;
                row.merged_entity_id = Some(customer_id);
                row.error_message = None;
                row.processed_at = Some(now);
            }
        }

        Ok(Some(GroupCommit {
            customer_id,
            rows: row_ids.len() as u64,
            existed,
        }))
    }

    async fn add_merge_counts(&self, id: Uuid, counts: &MergeCounts) -> Result<(), AppError> {
        let mut tables = self.tables.lock().await;
        if let Some(run) = tables.imports.get_mut(&id) {
            run.rows_merged += counts.merged;
            run.rows_conflict += counts.conflict;
            run.rows_skipped += counts.skipped;
            run.rows_error += counts.error;
        }
        Ok(())
    }

    async fn count_rows_by_status(&self, import_id: Uuid) -> Result<RowCounts, AppError> {
        let tables = self.tables.lock().await;
        let mut counts = RowCounts::default();
        for row in tables
            .row_order
            .get(&import_id)
            .into_iter()
            .flatten()
            .filter_map(|id| tables.rows.get(id))
        {
            match row.processing_status {
                RowStatus::Pending => counts.pending += 1,
                RowStatus::Merged => counts.merged += 1,
                RowStatus::Skipped => counts.skipped += 1,
                RowStatus::Error => counts.error += 1,
            }
        }
        Ok(counts)
    }

}

/// Inspection queries used by operators and tests; not part of the
/// store traits.
impl MemoryStore {
    pub async fn count_transactions(&self, source: &str) -> Result<i64, AppError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .transactions
            .keys()
            .filter(|(s, _)| s == source)
            .count() as i64)
    }

    pub async fn find_customer_by_email(&self, email: &str) -> Result<Option<Customer>, AppError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .customers_by_email
            .get(email)
            .and_then(|id| tables.customers.get(id))
            .cloned())
    }

    pub async fn find_customer_by_phone(&self, phone: &str) -> Result<Option<Customer>, AppError> {
        let tables = self.tables.lock().await;
        if let Some(customer) = tables
            .customers_by_phone
            .get(phone)
            .and_then(|id| tables.customers.get(id))
        {
            return Ok(Some(customer.clone()));
        }
        Ok(tables
            .customers
            .values()
            .find(|c| c.phone.as_deref() == Some(phone))
            .cloned())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn health_check(&self) -> Result<(), AppError> {
        Ok(())
    }
}
