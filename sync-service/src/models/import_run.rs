use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportStatus {
    Staging,
    Staged,
    Processing,
    Completed,
    Failed,
}

impl ImportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Staging => "staging",
            Self::Staged => "staged",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "staging" => Self::Staging,
            "staged" => Self::Staged,
            "processing" => Self::Processing,
            "completed" => Self::Completed,
            _ => Self::Failed,
        }
    }
}

/// Processing state of one staged row. Only `Pending` is non-terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RowStatus {
    Pending,
    Merged,
    Skipped,
    Error,
}

impl RowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Merged => "merged",
            Self::Skipped => "skipped",
            Self::Error => "error",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "merged" => Self::Merged,
            "skipped" => Self::Skipped,
            "error" => Self::Error,
            _ => Self::Pending,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportRun {
    pub id: Uuid,
    pub filename: String,
    pub source_type: String,
    pub total_rows: i64,
    pub rows_staged: i64,
    pub rows_parse_skipped: i64,
    pub rows_merged: i64,
    pub rows_conflict: i64,
    pub rows_skipped: i64,
    pub rows_error: i64,
    pub status: ImportStatus,
    pub started_at: DateTime<Utc>,
    pub staged_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StagingRow {
    pub id: Uuid,
    pub import_id: Uuid,
    pub row_number: i64,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub full_name: Option<String>,
    pub source_type: String,
    pub raw_data: BTreeMap<String, String>,
    pub processing_status: RowStatus,
    pub merged_entity_id: Option<Uuid>,
    pub error_message: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// A parsed CSV row ready to be written to the holding area.
#[derive(Debug, Clone, PartialEq)]
pub struct NewStagingRow {
    pub row_number: i64,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub full_name: Option<String>,
    pub raw_data: BTreeMap<String, String>,
}

/// Counters contributed by one staged chunk of a file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StagedChunk {
    pub data_rows: i64,
    pub staged: i64,
    pub parse_skipped: i64,
    pub errors: i64,
}
