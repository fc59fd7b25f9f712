use crate::dtos::{
    parse_request_date, CancelResponse, ConflictResponse, PauseRequest, PauseResponse,
    SyncRequest, SyncResponse,
};
use crate::ingest::{InvocationOutcome, StartRequest, SyncError};
use crate::models::{SyncRun, SyncStatus};
use crate::services::auth::Identity;
use crate::startup::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use service_core::error::AppError;
use std::time::Instant;
use uuid::Uuid;
use validator::Validate;

fn ensure_known_source(state: &AppState, source: &str) -> Result<(), AppError> {
    if state.config.payment_api.source == source {
        Ok(())
    } else {
        Err(AppError::NotFound(anyhow::anyhow!("unknown source '{}'", source)))
    }
}

/// POST /sync/:source
///
/// Runs the first invocation inline. Work left over when the budget runs
/// out is handed to the continuation workers and reported as `hasMore`.
pub async fn trigger_sync(
    State(state): State<AppState>,
    identity: Identity,
    Path(source): Path<String>,
    body: Option<Json<SyncRequest>>,
) -> Result<Response, AppError> {
    ensure_known_source(&state, &source)?;
    let started = Instant::now();
    let body = body.map(|Json(b)| b).unwrap_or_default();
    body.validate()?;

    tracing::info!(
        source = %source,
        caller = %identity.0,
        fetch_all = body.fetch_all,
        force_cancel = body.force_cancel,
        continuation = body.continuation,
        "Sync triggered"
    );

    if body.force_cancel {
        let cancelled = state.coordinator.cancel_all(&source).await?;
        return Ok(Json(CancelResponse {
            success: true,
            status: "cancelled",
            cancelled: cancelled.len(),
            sync_run_ids: cancelled,
        })
        .into_response());
    }

    if body.cleanup_stale {
        let minutes = state.config.sync.stale_threshold_minutes;
        let failed = state.coordinator.cleanup_stale(&source, minutes).await?;
        tracing::info!(source = %source, count = failed.len(), "Stale runs cleaned up");
    }

    let request = StartRequest {
        start: body
            .start_date
            .as_deref()
            .map(|d| parse_request_date(d, false))
            .transpose()?,
        end: body
            .end_date
            .as_deref()
            .map(|d| parse_request_date(d, true))
            .transpose()?,
        fetch_all: body.fetch_all,
        page: body.page,
        resume: body.sync_run_id,
        continuation: body.continuation,
    };

    let run = match state.coordinator.start_or_resume(&source, &request).await {
        Ok(run) => run,
        Err(SyncError::Conflict { existing }) => {
            return Ok((
                StatusCode::CONFLICT,
                Json(ConflictResponse {
                    success: false,
                    error: "A sync is already in progress for this source".to_string(),
                    existing_sync_id: existing,
                }),
            )
                .into_response());
        }
        Err(e) => return Err(e.into()),
    };

    let budget = state.coordinator.policy().invocation_budget;
    let outcome = match state.engine.run_invocation(&run, budget).await {
        Ok(outcome) => outcome,
        Err(e) => {
            let message = e.to_string();
            tracing::error!(sync_run_id = %run.id, error = %message, "Sync invocation failed");
            state.coordinator.fail(&run, &message).await?;
            InvocationOutcome::Failed(message)
        }
    };

    let (status, has_more) = match outcome {
        InvocationOutcome::Completed => (SyncStatus::Completed, false),
        InvocationOutcome::HandOff(reason) => {
            tracing::info!(sync_run_id = %run.id, reason = ?reason, "Handing run to continuation workers");
            match state.continuation.trigger_continuation(&run).await {
                Ok(()) => (SyncStatus::Continuing, true),
                Err(e) => {
                    tracing::error!(sync_run_id = %run.id, error = %e, "Continuation dispatch failed");
                    (SyncStatus::Failed, false)
                }
            }
        }
        InvocationOutcome::Stopped(status) => (status, false),
        InvocationOutcome::Failed(_) => (SyncStatus::Failed, false),
    };

    let latest = state.store.get_run(run.id).await?.unwrap_or(run);
    let response = SyncResponse::from_run(
        &latest,
        status.as_str(),
        has_more,
        started.elapsed().as_millis() as u64,
    );
    let code = if status == SyncStatus::Failed {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::OK
    };
    Ok((code, Json(response)).into_response())
}

/// GET /sync/:source/runs/:id
pub async fn get_run(
    State(state): State<AppState>,
    _identity: Identity,
    Path((source, id)): Path<(String, Uuid)>,
) -> Result<Json<SyncRun>, AppError> {
    ensure_known_source(&state, &source)?;
    state
        .store
        .get_run(id)
        .await?
        .filter(|run| run.source == source)
        .map(Json)
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("sync run {} not found", id)))
}

/// PUT /sync/:source/pause
pub async fn set_pause(
    State(state): State<AppState>,
    identity: Identity,
    Path(source): Path<String>,
    Json(body): Json<PauseRequest>,
) -> Result<Json<PauseResponse>, AppError> {
    ensure_known_source(&state, &source)?;
    state.store.set_paused(&source, body.paused).await?;
    tracing::info!(source = %source, paused = body.paused, caller = %identity.0, "Pause flag updated");
    Ok(Json(PauseResponse {
        source,
        paused: body.paused,
    }))
}
