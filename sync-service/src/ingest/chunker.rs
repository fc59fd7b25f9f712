//! Splits a date range into windows the payment API accepts.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChunkError {
    #[error("start {start} is after end {end}")]
    InvertedRange {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    #[error("maximum window must be at least one day")]
    ZeroWindow,
}

/// Smallest step between consecutive windows.
fn step() -> Duration {
    Duration::seconds(1)
}

/// Cover `[start, end]` with ordered, non-overlapping windows no wider than
/// `max_window_days`.
///
/// Each window ends at `min(start + max_window_days, end)` and the next one
/// starts one second later. `start == end` yields a single instant window.
pub fn chunk_range(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    max_window_days: u32,
) -> Result<Vec<ChunkWindow>, ChunkError> {
    if max_window_days == 0 {
        return Err(ChunkError::ZeroWindow);
    }
    if start > end {
        return Err(ChunkError::InvertedRange { start, end });
    }

    let window = Duration::days(i64::from(max_window_days));
    let mut chunks = Vec::new();
    let mut chunk_start = start;

    loop {
        let chunk_end = (chunk_start + window).min(end);
        chunks.push(ChunkWindow {
            start: chunk_start,
            end: chunk_end,
        });

        if chunk_end >= end {
            break;
        }
        chunk_start = chunk_end + step();
        if chunk_start > end {
            break;
        }
    }

    Ok(chunks)
}
