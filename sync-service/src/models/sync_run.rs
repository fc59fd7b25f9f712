use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Running,
    Continuing,
    Completed,
    Failed,
    Cancelled,
}

impl SyncStatus {
    pub const ACTIVE: [SyncStatus; 2] = [SyncStatus::Running, SyncStatus::Continuing];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Continuing => "continuing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "running" => Self::Running,
            "continuing" => Self::Continuing,
            "completed" => Self::Completed,
            "cancelled" => Self::Cancelled,
            _ => Self::Failed,
        }
    }

    /// Running or continuing; terminal runs are immutable.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Continuing)
    }
}

/// Requested range, persisted so any invocation can resume from the row alone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncParams {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub fetch_all: bool,
    pub start_page: u32,
}

/// Cursor position of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCheckpoint {
    pub page: u32,
    pub chunk_index: u32,
    pub chunk_start: Option<DateTime<Utc>>,
    pub chunk_end: Option<DateTime<Utc>>,
    pub total_chunks: u32,
    pub total_pages: Option<u32>,
    pub last_activity: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRun {
    pub id: Uuid,
    pub source: String,
    pub status: SyncStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub total_fetched: i64,
    pub total_inserted: i64,
    pub total_skipped: i64,
    pub checkpoint: SyncCheckpoint,
    pub params: SyncParams,
    pub metadata: serde_json::Value,
    pub error_message: Option<String>,
}

impl SyncRun {
    /// Whether the run has shown no activity since `threshold` ago.
    pub fn is_stale(&self, now: DateTime<Utc>, threshold: chrono::Duration) -> bool {
        now - self.checkpoint.last_activity > threshold
    }

    pub fn progress(&self) -> RunProgress {
        RunProgress {
            page: self.checkpoint.page,
            chunk_index: self.checkpoint.chunk_index,
            chunk_start: self.checkpoint.chunk_start,
            chunk_end: self.checkpoint.chunk_end,
            total_chunks: self.checkpoint.total_chunks,
            total_pages: self.checkpoint.total_pages,
            total_fetched: self.total_fetched,
            total_inserted: self.total_inserted,
            total_skipped: self.total_skipped,
        }
    }
}

/// Absolute cursor and counter values written by a checkpoint.
///
/// The caller computes the totals; the store never increments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunProgress {
    pub page: u32,
    pub chunk_index: u32,
    pub chunk_start: Option<DateTime<Utc>>,
    pub chunk_end: Option<DateTime<Utc>>,
    pub total_chunks: u32,
    pub total_pages: Option<u32>,
    pub total_fetched: i64,
    pub total_inserted: i64,
    pub total_skipped: i64,
}

#[derive(Debug, Clone)]
pub struct NewSyncRun {
    pub id: Uuid,
    pub source: String,
    pub params: SyncParams,
    pub total_chunks: u32,
    pub metadata: serde_json::Value,
}
