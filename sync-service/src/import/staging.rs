//! Writes uploaded CSV rows into the holding area with minimal validation.

use crate::import::csv_fields::{normalize_header, CsvSourceType, RowView};
use crate::models::{ImportRun, NewStagingRow, StagedChunk};
use crate::services::metrics::record_import_rows;
use crate::services::store::Store;
use csv::{ReaderBuilder, Trim};
use service_core::error::AppError;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// What one staged chunk did.
#[derive(Debug, Clone)]
pub struct StageReport {
    pub import_id: Uuid,
    /// Rows in this chunk, malformed ones included.
    pub total_data_rows: u64,
    pub staged: u64,
    /// Malformed rows plus rows without email or phone.
    pub skipped: u64,
    /// Rows lost to failed insert batches.
    pub errors: u64,
    pub batches: u64,
    pub final_chunk: bool,
    pub import: ImportRun,
}

pub struct StageRequest<'a> {
    pub csv_text: &'a str,
    pub source_type: CsvSourceType,
    pub filename: &'a str,
    pub import_id: Option<Uuid>,
    pub final_chunk: bool,
}

struct ParsedChunk {
    rows: Vec<NewStagingRow>,
    data_rows: u64,
    skipped: u64,
}

pub struct StagingWriter {
    store: Arc<dyn Store>,
    batch_size: usize,
}

impl StagingWriter {
    pub fn new(store: Arc<dyn Store>, batch_size: usize) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
        }
    }

    /// Stage one chunk of a file, creating the import on the first chunk.
    #[instrument(skip(self, request), fields(import_id = ?request.import_id, final_chunk = request.final_chunk))]
    pub async fn stage(&self, request: StageRequest<'_>) -> Result<StageReport, AppError> {
        let mut parsed = parse_rows(request.csv_text);

        let import_id = match request.import_id {
            Some(id) => id,
            None => {
                self.store
                    .create_import(request.filename, request.source_type.as_str())
                    .await?
                    .id
            }
        };

        let before = match self
            .store
            .reserve_rows(import_id, parsed.data_rows as i64)
            .await?
        {
            Some(before) => before,
            None => return Err(self.not_accepting(import_id).await),
        };
        for row in &mut parsed.rows {
            row.row_number += before;
        }

        let mut staged = 0_u64;
        let mut errors = 0_u64;
        let mut batches = 0_u64;
        for batch in parsed.rows.chunks(self.batch_size) {
            batches += 1;
            match self
                .store
                .insert_staging_rows(import_id, request.source_type.as_str(), batch)
                .await
            {
                Ok(written) => staged += written,
                Err(e) => {
                    errors += batch.len() as u64;
                    warn!(
                        import_id = %import_id,
                        batch = batches,
                        rows = batch.len(),
                        error = %e,
                        "Staging batch failed"
                    );
                }
            }
        }

        let chunk = StagedChunk {
            data_rows: parsed.data_rows as i64,
            staged: staged as i64,
            parse_skipped: parsed.skipped as i64,
            errors: errors as i64,
        };
        let import = self
            .store
            .record_staged_chunk(import_id, &chunk, request.final_chunk)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("import {} not found", import_id)))?;

        record_import_rows("staging", "staged", staged);
        record_import_rows("staging", "skipped", parsed.skipped);
        record_import_rows("staging", "error", errors);

        info!(
            import_id = %import_id,
            staged = staged,
            skipped = parsed.skipped,
            errors = errors,
            batches = batches,
            "CSV chunk staged"
        );

        Ok(StageReport {
            import_id,
            total_data_rows: parsed.data_rows,
            staged,
            skipped: parsed.skipped,
            errors,
            batches,
            final_chunk: request.final_chunk,
            import,
        })
    }

    async fn not_accepting(&self, import_id: Uuid) -> AppError {
        match self.store.get_import(import_id).await {
            Ok(Some(run)) => AppError::Conflict(anyhow::anyhow!(
                "import {} is {} and no longer accepts rows",
                import_id,
                run.status.as_str()
            )),
            Ok(None) => AppError::NotFound(anyhow::anyhow!("import {} not found", import_id)),
            Err(e) => e,
        }
    }
}

/// Parse CSV text into staging rows numbered from 1 within the chunk.
fn parse_rows(csv_text: &str) -> ParsedChunk {
    let mut reader = ReaderBuilder::new()
        .flexible(false)
        .trim(Trim::All)
        .from_reader(csv_text.as_bytes());

    let headers: Vec<String> = match reader.headers() {
        Ok(headers) => headers.iter().map(normalize_header).collect(),
        Err(e) => {
            warn!(error = %e, "Unreadable CSV header");
            return ParsedChunk {
                rows: Vec::new(),
                data_rows: 0,
                skipped: 0,
            };
        }
    };

    let mut rows = Vec::new();
    let mut data_rows = 0_u64;
    let mut skipped = 0_u64;

    for record in reader.records() {
        data_rows += 1;
        let record = match record {
            Ok(record) => record,
            Err(e) => {
                skipped += 1;
                warn!(row = data_rows, error = %e, "Skipping malformed CSV row");
                continue;
            }
        };

        let raw_data: BTreeMap<String, String> = headers
            .iter()
            .zip(record.iter())
            .filter(|(header, _)| !header.is_empty())
            .map(|(header, value)| (header.clone(), value.to_string()))
            .collect();

        let identity = RowView::new(&raw_data).identity();
        if identity.is_empty() {
            skipped += 1;
            continue;
        }

        rows.push(NewStagingRow {
            row_number: data_rows as i64,
            email: identity.email,
            phone: identity.phone,
            full_name: identity.full_name,
            raw_data,
        });
    }

    ParsedChunk {
        rows,
        data_rows,
        skipped,
    }
}
