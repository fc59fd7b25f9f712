use crate::dtos::{ImportCsvRequest, ImportCsvResponse, MergeTriggerResponse};
use crate::import::{CsvSourceType, StageRequest};
use crate::models::ImportRun;
use crate::services::auth::Identity;
use crate::startup::AppState;
use axum::{
    extract::{Path, State},
    Json,
};
use service_core::error::AppError;
use uuid::Uuid;
use validator::Validate;

/// POST /import/csv
///
/// Stages one chunk. The final chunk hands the import to the merge
/// supervisor; the response does not wait for the merge.
pub async fn import_csv(
    State(state): State<AppState>,
    identity: Identity,
    Json(body): Json<ImportCsvRequest>,
) -> Result<Json<ImportCsvResponse>, AppError> {
    body.validate()?;

    let source_type = CsvSourceType::parse(body.csv_type.as_deref());
    let filename = body
        .filename
        .unwrap_or_else(|| format!("{}.csv", source_type.as_str()));
    let final_chunk = body.is_final_chunk.unwrap_or(true);

    tracing::info!(
        caller = %identity.0,
        filename = %filename,
        source_type = source_type.as_str(),
        import_id = ?body.import_id,
        bytes = body.csv_text.len(),
        "CSV import chunk received"
    );

    let report = state
        .staging
        .stage(StageRequest {
            csv_text: &body.csv_text,
            source_type,
            filename: &filename,
            import_id: body.import_id,
            final_chunk,
        })
        .await?;

    let merge_started = if final_chunk {
        match state.merges.spawn(report.import_id).await {
            Ok(started) => started,
            Err(e) => {
                // Rows are staged; the merge can be retried explicitly.
                tracing::error!(import_id = %report.import_id, error = %e, "Failed to start merge");
                false
            }
        }
    } else {
        false
    };

    Ok(Json(ImportCsvResponse::new(&report, merge_started)))
}

/// GET /import/:id
pub async fn get_import(
    State(state): State<AppState>,
    _identity: Identity,
    Path(id): Path<Uuid>,
) -> Result<Json<ImportRun>, AppError> {
    state
        .store
        .get_import(id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("import {} not found", id)))
}

/// POST /import/:id/merge
pub async fn trigger_merge(
    State(state): State<AppState>,
    _identity: Identity,
    Path(id): Path<Uuid>,
) -> Result<Json<MergeTriggerResponse>, AppError> {
    if state.store.get_import(id).await?.is_none() {
        return Err(AppError::NotFound(anyhow::anyhow!("import {} not found", id)));
    }
    let merge_started = state.merges.spawn(id).await?;
    Ok(Json(MergeTriggerResponse {
        import_id: id,
        merge_started,
    }))
}
