//! Postgres-backed store.

use super::{
    CreateRunOutcome, GroupCommit, ImportStore, MergeCounts, RowCounts, Store, SyncRunStore,
    TransactionStore,
};
use crate::models::{
    Customer, ImportRun, ImportStatus, MergedCustomer, NewStagingRow, NewSyncRun,
    NormalizedRecord, RowStatus, RunProgress, StagedChunk, StagingRow, SyncCheckpoint, SyncParams,
    SyncRun, SyncStatus, UpsertCounts,
};
use crate::services::metrics::record_store_query;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{FromRow, Postgres, QueryBuilder};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{info, instrument, warn};
use uuid::Uuid;

const SYNC_RUN_COLUMNS: &str = "sync_run_id, source, status, started_utc, completed_utc, \
     total_fetched, total_inserted, total_skipped, checkpoint_page, checkpoint_chunk_index, \
     checkpoint_chunk_start, checkpoint_chunk_end, checkpoint_total_chunks, \
     checkpoint_total_pages, last_activity_utc, params, metadata, error_message";

const IMPORT_RUN_COLUMNS: &str = "import_id, filename, source_type, total_rows, rows_staged, \
     rows_parse_skipped, rows_merged, rows_conflict, rows_skipped, rows_error, status, \
     started_utc, staged_utc, completed_utc, error_message";

const STAGING_ROW_COLUMNS: &str = "staging_row_id, import_id, row_number, email, phone, \
     full_name, source_type, raw_data, processing_status, merged_entity_id, error_message, \
     processed_utc";

const CUSTOMER_COLUMNS: &str = "customer_id, email, phone, full_name, currency, \
     total_spent_minor, payment_count, tags, created_utc, updated_utc";

#[derive(FromRow)]
struct SyncRunRow {
    sync_run_id: Uuid,
    source: String,
    status: String,
    started_utc: DateTime<Utc>,
    completed_utc: Option<DateTime<Utc>>,
    total_fetched: i64,
    total_inserted: i64,
    total_skipped: i64,
    checkpoint_page: i32,
    checkpoint_chunk_index: i32,
    checkpoint_chunk_start: Option<DateTime<Utc>>,
    checkpoint_chunk_end: Option<DateTime<Utc>>,
    checkpoint_total_chunks: i32,
    checkpoint_total_pages: Option<i32>,
    last_activity_utc: DateTime<Utc>,
    params: Json<SyncParams>,
    metadata: serde_json::Value,
    error_message: Option<String>,
}

impl From<SyncRunRow> for SyncRun {
    fn from(r: SyncRunRow) -> Self {
        Self {
            id: r.sync_run_id,
            source: r.source,
            status: SyncStatus::from_str(&r.status),
            started_at: r.started_utc,
            completed_at: r.completed_utc,
            total_fetched: r.total_fetched,
            total_inserted: r.total_inserted,
            total_skipped: r.total_skipped,
            checkpoint: SyncCheckpoint {
                page: r.checkpoint_page.max(0) as u32,
                chunk_index: r.checkpoint_chunk_index.max(0) as u32,
                chunk_start: r.checkpoint_chunk_start,
                chunk_end: r.checkpoint_chunk_end,
                total_chunks: r.checkpoint_total_chunks.max(0) as u32,
                total_pages: r.checkpoint_total_pages.map(|p| p.max(0) as u32),
                last_activity: r.last_activity_utc,
            },
            params: r.params.0,
            metadata: r.metadata,
            error_message: r.error_message,
        }
    }
}

#[derive(FromRow)]
struct ImportRunRow {
    import_id: Uuid,
    filename: String,
    source_type: String,
    total_rows: i64,
    rows_staged: i64,
    rows_parse_skipped: i64,
    rows_merged: i64,
    rows_conflict: i64,
    rows_skipped: i64,
    rows_error: i64,
    status: String,
    started_utc: DateTime<Utc>,
    staged_utc: Option<DateTime<Utc>>,
    completed_utc: Option<DateTime<Utc>>,
    error_message: Option<String>,
}

impl From<ImportRunRow> for ImportRun {
    fn from(r: ImportRunRow) -> Self {
        Self {
            id: r.import_id,
            filename: r.filename,
            source_type: r.source_type,
            total_rows: r.total_rows,
            rows_staged: r.rows_staged,
            rows_parse_skipped: r.rows_parse_skipped,
            rows_merged: r.rows_merged,
            rows_conflict: r.rows_conflict,
            rows_skipped: r.rows_skipped,
            rows_error: r.rows_error,
            status: ImportStatus::from_str(&r.status),
            started_at: r.started_utc,
            staged_at: r.staged_utc,
            completed_at: r.completed_utc,
            error_message: r.error_message,
        }
    }
}

#[derive(FromRow)]
struct StagingRowRow {
    staging_row_id: Uuid,
    import_id: Uuid,
    row_number: i64,
    email: Option<String>,
    phone: Option<String>,
    full_name: Option<String>,
    source_type: String,
    raw_data: Json<BTreeMap<String, String>>,
    processing_status: String,
    merged_entity_id: Option<Uuid>,
    error_message: Option<String>,
    processed_utc: Option<DateTime<Utc>>,
}

impl From<StagingRowRow> for StagingRow {
    fn from(r: StagingRowRow) -> Self {
        Self {
            id: r.staging_row_id,
            import_id: r.import_id,
            row_number: r.row_number,
            email: r.email,
            phone: r.phone,
            full_name: r.full_name,
            source_type: r.source_type,
            raw_data: r.raw_data.0,
            processing_status: RowStatus::from_str(&r.processing_status),
            merged_entity_id: r.merged_entity_id,
            error_message: r.error_message,
            processed_at: r.processed_utc,
        }
    }
}

#[derive(FromRow)]
struct CustomerRow {
    customer_id: Uuid,
    email: Option<String>,
    phone: Option<String>,
    full_name: Option<String>,
    currency: Option<String>,
    total_spent_minor: i64,
    payment_count: i64,
    tags: Vec<String>,
    created_utc: DateTime<Utc>,
    updated_utc: DateTime<Utc>,
}

impl From<CustomerRow> for Customer {
    fn from(r: CustomerRow) -> Self {
        Self {
            id: r.customer_id,
            email: r.email,
            phone: r.phone,
            full_name: r.full_name,
            currency: r.currency,
            total_spent_minor: r.total_spent_minor,
            payment_count: r.payment_count,
            tags: r.tags,
            created_at: r.created_utc,
            updated_at: r.updated_utc,
        }
    }
}

fn db_error(action: &str, e: sqlx::Error) -> AppError {
    AppError::DatabaseError(anyhow::anyhow!("Failed to {}: {}", action, e))
}

fn status_list(statuses: &[SyncStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_string()).collect()
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "sync-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    async fn fetch_run(&self, id: Uuid) -> Result<Option<SyncRun>, AppError> {
        let row = sqlx::query_as::<_, SyncRunRow>(&format!(
            "SELECT {} FROM sync_runs WHERE sync_run_id = $1",
            SYNC_RUN_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("get sync run", e))?;
        Ok(row.map(SyncRun::from))
    }
}

#[async_trait]
impl SyncRunStore for Database {
    #[instrument(skip(self))]
    async fn find_active_run(&self, source: &str) -> Result<Option<SyncRun>, AppError> {
        let started = Instant::now();
        let row = sqlx::query_as::<_, SyncRunRow>(&format!(
            "SELECT {} FROM sync_runs WHERE source = $1 AND status IN ('running', 'continuing') \
             ORDER BY started_utc DESC LIMIT 1",
            SYNC_RUN_COLUMNS
        ))
        .bind(source)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("find active sync run", e))?;

        record_store_query("find_active_run", started);
        Ok(row.map(SyncRun::from))
    }

    #[instrument(skip(self, run), fields(sync_run_id = %run.id, source = %run.source))]
    async fn insert_run(&self, run: NewSyncRun) -> Result<CreateRunOutcome, AppError> {
        let started = Instant::now();
        let result = sqlx::query_as::<_, SyncRunRow>(&format!(
            "INSERT INTO sync_runs (sync_run_id, source, status, checkpoint_page, \
             checkpoint_total_chunks, params, metadata) \
             VALUES ($1, $2, 'running', $3, $4, $5, $6) RETURNING {}",
            SYNC_RUN_COLUMNS
        ))
        .bind(run.id)
        .bind(&run.source)
        .bind(run.params.start_page as i32)
        .bind(run.total_chunks as i32)
        .bind(Json(&run.params))
        .bind(&run.metadata)
        .fetch_one(&self.pool)
        .await;

        record_store_query("insert_run", started);

        match result {
            Ok(row) => {
                info!("Sync run created");
                Ok(CreateRunOutcome::Created(row.into()))
            }
            Err(sqlx::Error::Database(ref db_err)) if db_err.is_unique_violation() => {
                warn!("Concurrent sync run detected for source");
                match self.find_active_run(&run.source).await? {
                    Some(existing) => Ok(CreateRunOutcome::Conflict(existing.id)),
                    None => Err(AppError::Conflict(anyhow::anyhow!(
                        "Sync run for '{}' raced with another start; retry",
                        run.source
                    ))),
                }
            }
            Err(e) => Err(db_error("create sync run", e)),
        }
    }

    #[instrument(skip(self))]
    async fn get_run(&self, id: Uuid) -> Result<Option<SyncRun>, AppError> {
        let started = Instant::now();
        let run = self.fetch_run(id).await?;
        record_store_query("get_run", started);
        Ok(run)
    }

    #[instrument(skip(self, progress), fields(chunk_index = progress.chunk_index, page = progress.page))]
    async fn save_checkpoint(
        &self,
        id: Uuid,
        progress: &RunProgress,
    ) -> Result<SyncStatus, AppError> {
        let started = Instant::now();
        let written = sqlx::query_scalar::<_, String>(
            r#"
            UPDATE sync_runs
            SET checkpoint_page = $2,
                checkpoint_chunk_index = $3,
                checkpoint_chunk_start = $4,
                checkpoint_chunk_end = $5,
                checkpoint_total_chunks = $6,
                checkpoint_total_pages = $7,
                total_fetched = $8,
                total_inserted = $9,
                total_skipped = $10,
                last_activity_utc = NOW()
            WHERE sync_run_id = $1
              AND status IN ('running', 'continuing')
              AND (checkpoint_chunk_index, checkpoint_page) <= ($3, $2)
            RETURNING status
            "#,
        )
        .bind(id)
        .bind(progress.page as i32)
        .bind(progress.chunk_index as i32)
        .bind(progress.chunk_start)
        .bind(progress.chunk_end)
        .bind(progress.total_chunks as i32)
        .bind(progress.total_pages.map(|p| p as i32))
        .bind(progress.total_fetched)
        .bind(progress.total_inserted)
        .bind(progress.total_skipped)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("save checkpoint", e))?;

        let status = match written {
            Some(status) => SyncStatus::from_str(&status),
            None => {
                let run = self.fetch_run(id).await?.ok_or_else(|| {
                    AppError::NotFound(anyhow::anyhow!("Sync run {} not found", id))
                })?;
                run.status
            }
        };

        record_store_query("save_checkpoint", started);
        Ok(status)
    }

    #[instrument(skip(self, from))]
    async fn transition_run(
        &self,
        id: Uuid,
        from: &[SyncStatus],
        to: SyncStatus,
        error: Option<&str>,
    ) -> Result<bool, AppError> {
        let started = Instant::now();
        let result = sqlx::query(
            r#"
            UPDATE sync_runs
            SET status = $3,
                last_activity_utc = NOW(),
                completed_utc = CASE WHEN $3 IN ('running', 'continuing') THEN completed_utc ELSE NOW() END,
                error_message = COALESCE($4, error_message)
            WHERE sync_run_id = $1 AND status = ANY($2)
            "#,
        )
        .bind(id)
        .bind(status_list(from))
        .bind(to.as_str())
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("transition sync run", e))?;

        record_store_query("transition_run", started);
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn touch_run(&self, id: Uuid) -> Result<bool, AppError> {
        let started = Instant::now();
        let result = sqlx::query(
            "UPDATE sync_runs SET last_activity_utc = NOW() \
             WHERE sync_run_id = $1 AND status IN ('running', 'continuing')",
        )
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("touch sync run", e))?;

        record_store_query("touch_run", started);
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn cancel_active_runs(&self, source: &str) -> Result<Vec<Uuid>, AppError> {
        let started = Instant::now();
        let ids = sqlx::query_scalar::<_, Uuid>(
            r#"
            UPDATE sync_runs
            SET status = 'cancelled', completed_utc = NOW(), last_activity_utc = NOW()
            WHERE source = $1 AND status IN ('running', 'continuing')
            RETURNING sync_run_id
            "#,
        )
        .bind(source)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("cancel sync runs", e))?;

        record_store_query("cancel_active_runs", started);
        Ok(ids)
    }

    #[instrument(skip(self))]
    async fn fail_stale_runs(
        &self,
        source: &str,
        older_than: DateTime<Utc>,
        reason: &str,
    ) -> Result<Vec<Uuid>, AppError> {
        let started = Instant::now();
        let ids = sqlx::query_scalar::<_, Uuid>(
            r#"
            UPDATE sync_runs
            SET status = 'failed', completed_utc = NOW(), error_message = $3
            WHERE source = $1
              AND status IN ('running', 'continuing')
              AND last_activity_utc < $2
            RETURNING sync_run_id
            "#,
        )
        .bind(source)
        .bind(older_than)
        .bind(reason)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("fail stale sync runs", e))?;

        record_store_query("fail_stale_runs", started);
        Ok(ids)
    }

    #[instrument(skip(self))]
    async fn list_runs_by_status(
        &self,
        status: SyncStatus,
        active_since: DateTime<Utc>,
    ) -> Result<Vec<SyncRun>, AppError> {
        let started = Instant::now();
        let rows = sqlx::query_as::<_, SyncRunRow>(&format!(
            "SELECT {} FROM sync_runs WHERE status = $1 AND last_activity_utc >= $2 \
             ORDER BY started_utc",
            SYNC_RUN_COLUMNS
        ))
        .bind(status.as_str())
        .bind(active_since)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("list sync runs", e))?;

        record_store_query("list_runs_by_status", started);
        Ok(rows.into_iter().map(SyncRun::from).collect())
    }

    #[instrument(skip(self))]
    async fn is_paused(&self, source: &str) -> Result<bool, AppError> {
        let started = Instant::now();
        let paused =
            sqlx::query_scalar::<_, bool>("SELECT paused FROM sync_settings WHERE source = $1")
                .bind(source)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| db_error("read pause flag", e))?;

        record_store_query("is_paused", started);
        Ok(paused.unwrap_or(false))
    }

    #[instrument(skip(self))]
    async fn set_paused(&self, source: &str, paused: bool) -> Result<(), AppError> {
        let started = Instant::now();
        sqlx::query(
            r#"
            INSERT INTO sync_settings (source, paused) VALUES ($1, $2)
            ON CONFLICT (source) DO UPDATE SET paused = EXCLUDED.paused, updated_utc = NOW()
            "#,
        )
        .bind(source)
        .bind(paused)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("set pause flag", e))?;

        record_store_query("set_paused", started);
        info!(paused = paused, "Pause flag updated");
        Ok(())
    }
}

#[async_trait]
impl TransactionStore for Database {
    #[instrument(skip(self, records), fields(batch_size = records.len()))]
    async fn upsert_transactions(
        &self,
        records: &[NormalizedRecord],
    ) -> Result<UpsertCounts, AppError> {
        if records.is_empty() {
            return Ok(UpsertCounts::default());
        }
        let started = Instant::now();

        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO payment_transactions (transaction_id, source, external_id, \
             customer_email, amount_minor, currency, status, occurred_utc, raw_metadata) ",
        );
        builder.push_values(records, |mut b, record| {
            b.push_bind(Uuid::new_v4())
                .push_bind(record.source.clone())
                .push_bind(record.external_id.clone())
                .push_bind(record.customer_email.clone())
                .push_bind(record.amount_minor)
                .push_bind(record.currency.clone())
                .push_bind(record.status.as_str())
                .push_bind(record.occurred_at)
                .push_bind(record.raw_metadata.clone());
        });
        builder.push(
            " ON CONFLICT (source, external_id) DO UPDATE SET \
             customer_email = EXCLUDED.customer_email, \
             amount_minor = EXCLUDED.amount_minor, \
             currency = EXCLUDED.currency, \
             status = EXCLUDED.status, \
             occurred_utc = EXCLUDED.occurred_utc, \
             raw_metadata = EXCLUDED.raw_metadata, \
             updated_utc = NOW() \
             RETURNING (xmax = 0) AS inserted",
        );

        let flags = builder
            .build_query_scalar::<bool>()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_error("upsert transactions", e))?;

        record_store_query("upsert_transactions", started);

        let inserted = flags.iter().filter(|f| **f).count() as u64;
        Ok(UpsertCounts {
            inserted,
            updated: flags.len() as u64 - inserted,
        })
    }
}

#[async_trait]
impl ImportStore for Database {
    #[instrument(skip(self))]
    async fn create_import(
        &self,
        filename: &str,
        source_type: &str,
    ) -> Result<ImportRun, AppError> {
        let started = Instant::now();
        let row = sqlx::query_as::<_, ImportRunRow>(&format!(
            "INSERT INTO import_runs (import_id, filename, source_type, status) \
             VALUES ($1, $2, $3, 'staging') RETURNING {}",
            IMPORT_RUN_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(filename)
        .bind(source_type)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("create import run", e))?;

        record_store_query("create_import", started);
        info!(import_id = %row.import_id, "Import run created");
        Ok(row.into())
    }

    #[instrument(skip(self))]
    async fn get_import(&self, id: Uuid) -> Result<Option<ImportRun>, AppError> {
        let started = Instant::now();
        let row = sqlx::query_as::<_, ImportRunRow>(&format!(
            "SELECT {} FROM import_runs WHERE import_id = $1",
            IMPORT_RUN_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("get import run", e))?;

        record_store_query("get_import", started);
        Ok(row.map(ImportRun::from))
    }

    #[instrument(skip(self))]
    async fn reserve_rows(&self, id: Uuid, count: i64) -> Result<Option<i64>, AppError> {
        let started = Instant::now();
        let before = sqlx::query_scalar::<_, i64>(
            r#"
            UPDATE import_runs SET total_rows = total_rows + $2
            WHERE import_id = $1 AND status = 'staging'
            RETURNING total_rows - $2
            "#,
        )
        .bind(id)
        .bind(count)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("reserve staging rows", e))?;

        record_store_query("reserve_rows", started);
        Ok(before)
    }

    #[instrument(skip(self, rows), fields(rows = rows.len()))]
    async fn insert_staging_rows(
        &self,
        import_id: Uuid,
        source_type: &str,
        rows: &[NewStagingRow],
    ) -> Result<u64, AppError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let started = Instant::now();

        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO staging_rows (staging_row_id, import_id, row_number, email, phone, \
             full_name, source_type, raw_data) ",
        );
        builder.push_values(rows, |mut b, row| {
            b.push_bind(Uuid::new_v4())
                .push_bind(import_id)
                .push_bind(row.row_number)
                .push_bind(row.email.clone())
                .push_bind(row.phone.clone())
                .push_bind(row.full_name.clone())
                .push_bind(source_type.to_string())
                .push_bind(Json(row.raw_data.clone()));
        });

        let result = builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("insert staging rows", e))?;

        record_store_query("insert_staging_rows", started);
        Ok(result.rows_affected())
    }

    #[instrument(skip(self, chunk))]
    async fn record_staged_chunk(
        &self,
        id: Uuid,
        chunk: &StagedChunk,
        final_chunk: bool,
    ) -> Result<Option<ImportRun>, AppError> {
        let started = Instant::now();
        let row = sqlx::query_as::<_, ImportRunRow>(&format!(
            r#"
            UPDATE import_runs
            SET rows_staged = rows_staged + $2,
                rows_parse_skipped = rows_parse_skipped + $3,
                rows_error = rows_error + $4,
                status = CASE WHEN $5 AND status = 'staging' THEN 'staged' ELSE status END,
                staged_utc = CASE WHEN $5 AND status = 'staging' THEN NOW() ELSE staged_utc END
            WHERE import_id = $1
            RETURNING {}
            "#,
            IMPORT_RUN_COLUMNS
        ))
        .bind(id)
        .bind(chunk.staged)
        .bind(chunk.parse_skipped)
        .bind(chunk.errors)
        .bind(final_chunk)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("record staged chunk", e))?;

        record_store_query("record_staged_chunk", started);
        Ok(row.map(ImportRun::from))
    }

    #[instrument(skip(self, from))]
    async fn transition_import(
        &self,
        id: Uuid,
        from: &[ImportStatus],
        to: ImportStatus,
        error: Option<&str>,
    ) -> Result<bool, AppError> {
        let started = Instant::now();
        let from: Vec<String> = from.iter().map(|s| s.as_str().to_string()).collect();
        let result = sqlx::query(
            r#"
            UPDATE import_runs
            SET status = $3,
                completed_utc = CASE WHEN $3 IN ('completed', 'failed') THEN NOW() ELSE completed_utc END,
                error_message = COALESCE($4, error_message)
            WHERE import_id = $1 AND status = ANY($2)
            "#,
        )
        .bind(id)
        .bind(from)
        .bind(to.as_str())
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("transition import run", e))?;

        record_store_query("transition_import", started);
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn list_imports_by_status(
        &self,
        statuses: &[ImportStatus],
    ) -> Result<Vec<ImportRun>, AppError> {
        let started = Instant::now();
        let statuses: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
        let rows = sqlx::query_as::<_, ImportRunRow>(&format!(
            "SELECT {} FROM import_runs WHERE status = ANY($1) ORDER BY started_utc",
            IMPORT_RUN_COLUMNS
        ))
        .bind(statuses)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("list import runs", e))?;

        record_store_query("list_imports_by_status", started);
        Ok(rows.into_iter().map(ImportRun::from).collect())
    }

    #[instrument(skip(self))]
    async fn fetch_pending_rows(
        &self,
        import_id: Uuid,
        limit: i64,
    ) -> Result<Vec<StagingRow>, AppError> {
        let started = Instant::now();
        let rows = sqlx::query_as::<_, StagingRowRow>(&format!(
            "SELECT {} FROM staging_rows \
             WHERE import_id = $1 AND processing_status = 'pending' \
             ORDER BY row_number LIMIT $2",
            STAGING_ROW_COLUMNS
        ))
        .bind(import_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("fetch pending rows", e))?;

        record_store_query("fetch_pending_rows", started);
        Ok(rows.into_iter().map(StagingRow::from).collect())
    }

    #[instrument(skip(self, row_ids), fields(rows = row_ids.len()))]
    async fn mark_rows(
        &self,
        row_ids: &[Uuid],
        status: RowStatus,
        error: Option<&str>,
    ) -> Result<u64, AppError> {
        if row_ids.is_empty() {
            return Ok(0);
        }
        let started = Instant::now();
        let result = sqlx::query(
            r#"
            UPDATE staging_rows
            SET processing_status = $2, error_message = $3, processed_utc = NOW()
            WHERE staging_row_id = ANY($1) AND processing_status = 'pending'
            "#,
        )
        .bind(row_ids)
        .bind(status.as_str())
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("mark staging rows", e))?;

        record_store_query("mark_rows", started);
        Ok(result.rows_affected())
    }

    #[instrument(skip(self, row_ids, customer), fields(rows = row_ids.len()))]
    async fn commit_merge_group(
        &self,
        row_ids: &[Uuid],
        customer: &MergedCustomer,
    ) -> Result<Option<GroupCommit>, AppError> {
        let started = Instant::now();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("begin merge transaction", e))?;

        let locked = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT staging_row_id FROM staging_rows
            WHERE staging_row_id = ANY($1) AND processing_status = 'pending'
            FOR UPDATE
            "#,
        )
        .bind(row_ids)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| db_error("lock staging rows", e))?;

        if locked.len() != row_ids.len() {
            tx.rollback().await.ok();
            return Ok(None);
        }

        let conflict_target = match (&customer.email, &customer.phone) {
            (Some(_), _) => "(email) WHERE email IS NOT NULL",
            (None, Some(_)) => "(phone) WHERE email IS NULL",
            (None, None) => {
                tx.rollback().await.ok();
                return Err(AppError::BadRequest(anyhow::anyhow!(
                    "merge group has no identity"
                )));
            }
        };

        let (customer_id, existed) = sqlx::query_as::<_, (Uuid, bool)>(&format!(
            r#"
            INSERT INTO customers (customer_id, email, phone, full_name, currency,
                                   total_spent_minor, payment_count, tags)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT {} DO UPDATE SET
                phone = COALESCE(customers.phone, EXCLUDED.phone),
                full_name = COALESCE(customers.full_name, EXCLUDED.full_name),
                currency = COALESCE(customers.currency, EXCLUDED.currency),
                total_spent_minor = customers.total_spent_minor + EXCLUDED.total_spent_minor,
                payment_count = customers.payment_count + EXCLUDED.payment_count,
                tags = ARRAY(SELECT DISTINCT t FROM unnest(customers.tags || EXCLUDED.tags) AS t ORDER BY t),
                updated_utc = NOW()
            RETURNING customer_id, NOT (xmax = 0) AS existed
            "#,
            conflict_target
        ))
        .bind(Uuid::new_v4())
        .bind(&customer.email)
        .bind(&customer.phone)
        .bind(&customer.full_name)
        .bind(&customer.currency)
        .bind(customer.total_spent_minor)
        .bind(customer.payment_count)
        .bind(&customer.tags)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| db_error("upsert customer", e))?;

        let marked = sqlx::query(
            r#"
            UPDATE staging_rows
            SET processing_status = 'merged', merged_entity_id = $2,
                error_message = NULL, processed_utc = NOW()
            WHERE staging_row_id = ANY($1)
            "#,
        )
        .bind(row_ids)
        .bind(customer_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| db_error("mark merged rows", e))?;

        tx.commit()
            .await
            .map_err(|e| db_error("commit merge transaction", e))?;

        record_store_query("commit_merge_group", started);
        Ok(Some(GroupCommit {
            customer_id,
            rows: marked.rows_affected(),
            existed,
        }))
    }

    #[instrument(skip(self, counts))]
    async fn add_merge_counts(&self, id: Uuid, counts: &MergeCounts) -> Result<(), AppError> {
        let started = Instant::now();
        sqlx::query(
            r#"
            UPDATE import_runs
            SET rows_merged = rows_merged + $2,
                rows_conflict = rows_conflict + $3,
                rows_skipped = rows_skipped + $4,
                rows_error = rows_error + $5
            WHERE import_id = $1
            "#,
        )
        .bind(id)
        .bind(counts.merged)
        .bind(counts.conflict)
        .bind(counts.skipped)
        .bind(counts.error)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("add merge counts", e))?;

        record_store_query("add_merge_counts", started);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn count_rows_by_status(&self, import_id: Uuid) -> Result<RowCounts, AppError> {
        let started = Instant::now();
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT processing_status, COUNT(*) FROM staging_rows \
             WHERE import_id = $1 GROUP BY processing_status",
        )
        .bind(import_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("count staging rows", e))?;

        record_store_query("count_rows_by_status", started);

        let mut counts = RowCounts::default();
        for (status, count) in rows {
            match RowStatus::from_str(&status) {
                RowStatus::Pending => counts.pending = count,
                RowStatus::Merged => counts.merged = count,
                RowStatus::Skipped => counts.skipped = count,
                RowStatus::Error => counts.error = count,
            }
        }
        Ok(counts)
    }
}

/// Inspection queries used by operators and tests; not part of the
/// store traits.
impl Database {
    #[instrument(skip(self))]
    pub async fn count_transactions(&self, source: &str) -> Result<i64, AppError> {
        let started = Instant::now();
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM payment_transactions WHERE source = $1",
        )
        .bind(source)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("count transactions", e))?;

        record_store_query("count_transactions", started);
        Ok(count)
    }

    #[instrument(skip(self, email))]
    pub async fn find_customer_by_email(&self, email: &str) -> Result<Option<Customer>, AppError> {
        let started = Instant::now();
        let row = sqlx::query_as::<_, CustomerRow>(&format!(
            "SELECT {} FROM customers WHERE email = $1",
            CUSTOMER_COLUMNS
        ))
        .bind(email)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("find customer", e))?;

        record_store_query("find_customer_by_email", started);
        Ok(row.map(Customer::from))
    }

    #[instrument(skip(self, phone))]
    pub async fn find_customer_by_phone(&self, phone: &str) -> Result<Option<Customer>, AppError> {
        let started = Instant::now();
        let row = sqlx::query_as::<_, CustomerRow>(&format!(
            "SELECT {} FROM customers WHERE phone = $1 ORDER BY (email IS NULL) DESC LIMIT 1",
            CUSTOMER_COLUMNS
        ))
        .bind(phone)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("find customer", e))?;

        record_store_query("find_customer_by_phone", started);
        Ok(row.map(Customer::from))
    }
}

#[async_trait]
impl Store for Database {
    /// Check database health.
    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), AppError> {
        let started = Instant::now();
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;
        record_store_query("health_check", started);
        Ok(())
    }
}
