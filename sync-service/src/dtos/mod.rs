use crate::import::StageReport;
use crate::models::SyncRun;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use service_core::error::AppError;
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Default, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    #[serde(default)]
    pub fetch_all: bool,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
    #[serde(default)]
    pub cleanup_stale: bool,
    #[serde(default)]
    pub force_cancel: bool,
    #[validate(range(min = 1, message = "page starts at 1"))]
    pub page: Option<u32>,
    pub sync_run_id: Option<Uuid>,
    /// Set by callers re-triggering a run that reported `hasMore`; the
    /// source's `continuing` run is resumed instead of answering 409.
    #[serde(default)]
    pub continuation: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    pub success: bool,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync_run_id: Option<Uuid>,
    pub total_fetched: i64,
    pub total_inserted: i64,
    pub total_skipped: i64,
    pub has_more: bool,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SyncResponse {
    pub fn from_run(run: &SyncRun, status: &str, has_more: bool, duration_ms: u64) -> Self {
        Self {
            success: status != "failed",
            status: status.to_string(),
            sync_run_id: Some(run.id),
            total_fetched: run.total_fetched,
            total_inserted: run.total_inserted,
            total_skipped: run.total_skipped,
            has_more,
            duration_ms,
            error: run.error_message.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelResponse {
    pub success: bool,
    pub status: &'static str,
    pub cancelled: usize,
    pub sync_run_ids: Vec<Uuid>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictResponse {
    pub success: bool,
    pub error: String,
    pub existing_sync_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct PauseRequest {
    pub paused: bool,
}

#[derive(Debug, Serialize)]
pub struct PauseResponse {
    pub source: String,
    pub paused: bool,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ImportCsvRequest {
    #[validate(length(min = 1, message = "csvText cannot be empty"))]
    pub csv_text: String,
    pub csv_type: Option<String>,
    pub filename: Option<String>,
    pub import_id: Option<Uuid>,
    pub is_final_chunk: Option<bool>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportCsvResponse {
    pub ok: bool,
    pub import_id: Uuid,
    pub staged: u64,
    pub skipped: u64,
    pub errors: u64,
    pub phase: &'static str,
    pub merge_started: bool,
}

impl ImportCsvResponse {
    pub fn new(report: &StageReport, merge_started: bool) -> Self {
        Self {
            ok: true,
            import_id: report.import_id,
            staged: report.staged,
            skipped: report.skipped,
            errors: report.errors,
            phase: "staged",
            merge_started,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeTriggerResponse {
    pub import_id: Uuid,
    pub merge_started: bool,
}

/// Parse `YYYY-MM-DD` or RFC 3339. Bare dates cover the whole day, so an
/// end date means 23:59:59 of that day.
pub fn parse_request_date(raw: &str, end_of_day: bool) -> Result<DateTime<Utc>, AppError> {
    let raw = raw.trim();
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        let time = if end_of_day {
            NaiveTime::from_hms_opt(23, 59, 59)
        } else {
            NaiveTime::from_hms_opt(0, 0, 0)
        }
        .unwrap_or_default();
        return Ok(date.and_time(time).and_utc());
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| AppError::BadRequest(anyhow::anyhow!("invalid date '{}'", raw)))
}
