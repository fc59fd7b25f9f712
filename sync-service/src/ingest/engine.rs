//! One bounded unit of sync work.
//!
//! An invocation resumes from the run's persisted cursor, processes pages
//! until the run is done or its budget is spent, and checkpoints after every
//! page. Everything it needs to continue lives in the run row.

use crate::ingest::coordinator::{decide_continuation, plan_chunks, Continuation, RunCoordinator, SyncError};
use crate::ingest::normalize::normalize;
use crate::ingest::writer::BatchUpsertWriter;
use crate::models::{SyncRun, SyncStatus};
use crate::services::payment_api::TransactionSource;
use crate::services::store::Store;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandOffReason {
    /// Wall-clock budget spent with work remaining.
    Budget,
    /// The source was paused by an operator.
    Paused,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvocationOutcome {
    Completed,
    /// Checkpoint written, work remains.
    HandOff(HandOffReason),
    /// The run left the active states underneath us (cancelled, failed).
    Stopped(SyncStatus),
    /// Fetching failed for good; the run is marked failed.
    Failed(String),
}

pub struct SyncEngine {
    store: Arc<dyn Store>,
    source: Arc<dyn TransactionSource>,
    coordinator: Arc<RunCoordinator>,
    writer: BatchUpsertWriter,
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn Store>,
        source: Arc<dyn TransactionSource>,
        coordinator: Arc<RunCoordinator>,
    ) -> Self {
        let writer = BatchUpsertWriter::new(coordinator.policy().upsert_batch_size);
        Self {
            store,
            source,
            coordinator,
            writer,
        }
    }

    /// Process `run` (which must be `running`) for at most `budget`.
    ///
    /// At least one page is processed before the budget is consulted, so
    /// every invocation makes progress.
    pub async fn run_invocation(
        &self,
        run: &SyncRun,
        budget: Duration,
    ) -> Result<InvocationOutcome, SyncError> {
        let started = Instant::now();
        let max_window_days = self.coordinator.policy().max_window_days;
        let chunks = plan_chunks(&run.params, max_window_days)?;
        let total_chunks = chunks.len() as u32;
        let mut progress = run.progress();
        let mut pages_done = 0_u32;

        loop {
            let chunk_index = progress.chunk_index;
            let Some(window) = chunks.get(chunk_index as usize).copied() else {
                // Nothing (left) to fetch.
                return self.finish(run).await;
            };

            if self.coordinator.is_paused(&run.source).await? {
                info!(source = %run.source, sync_run_id = %run.id, "Source paused, handing off");
                return Ok(InvocationOutcome::HandOff(HandOffReason::Paused));
            }
            if pages_done > 0 && started.elapsed() >= budget {
                debug!(
                    sync_run_id = %run.id,
                    pages_done = pages_done,
                    "Invocation budget spent, handing off"
                );
                return Ok(InvocationOutcome::HandOff(HandOffReason::Budget));
            }

            let page_number = progress.page;
            let page = match self.source.fetch_page(&window, page_number).await {
                Ok(page) => page,
                Err(e) => {
                    let message = format!(
                        "fetch failed at chunk {} page {}: {}",
                        chunk_index, page_number, e
                    );
                    self.coordinator.fail(run, &message).await?;
                    return Ok(InvocationOutcome::Failed(message));
                }
            };

            let fetched = page.records.len() as i64;
            let mut rejected = 0_i64;
            let mut records = Vec::with_capacity(page.records.len());
            for raw in &page.records {
                match normalize(&run.source, raw) {
                    Ok(record) => records.push(record),
                    Err(e) => {
                        rejected += 1;
                        warn!(sync_run_id = %run.id, error = %e, "Skipping unusable record");
                    }
                }
            }

            let report = self.writer.write(self.store.as_ref(), records).await;

            progress.total_fetched += fetched;
            progress.total_inserted += report.written() as i64;
            progress.total_skipped +=
                (report.skipped_duplicate + report.failed) as i64 + rejected;
            progress.total_chunks = total_chunks;

            let decision = decide_continuation(
                chunk_index,
                page_number,
                page.total_pages,
                total_chunks,
                run.params.fetch_all,
            );

            match decision {
                Continuation::Continue { chunk_index: next_chunk, page: next_page } => {
                    progress.total_pages = if next_chunk == chunk_index {
                        Some(page.total_pages)
                    } else {
                        None
                    };
                    progress.chunk_index = next_chunk;
                    progress.page = next_page;
                    if let Some(next) = chunks.get(next_chunk as usize) {
                        progress.chunk_start = Some(next.start);
                        progress.chunk_end = Some(next.end);
                    }
                }
                Continuation::Complete => {
                    progress.total_pages = Some(page.total_pages);
                    progress.chunk_start = Some(window.start);
                    progress.chunk_end = Some(window.end);
                }
            }

            let status = self.coordinator.checkpoint(run.id, &progress).await?;
            if !status.is_active() {
                info!(
                    sync_run_id = %run.id,
                    status = status.as_str(),
                    "Run left active state, stopping invocation"
                );
                return Ok(InvocationOutcome::Stopped(status));
            }

            debug!(
                sync_run_id = %run.id,
                chunk_index = chunk_index,
                page = page_number,
                total_pages = page.total_pages,
                fetched = fetched,
                inserted = report.inserted,
                updated = report.updated,
                "Page processed"
            );

            pages_done += 1;
            if decision == Continuation::Complete {
                return self.finish(run).await;
            }
        }
    }

    async fn finish(&self, run: &SyncRun) -> Result<InvocationOutcome, SyncError> {
        if self.coordinator.complete(run).await? {
            return Ok(InvocationOutcome::Completed);
        }
        let status = self
            .store
            .get_run(run.id)
            .await?
            .map(|r| r.status)
            .unwrap_or(SyncStatus::Failed);
        Ok(InvocationOutcome::Stopped(status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::chunker::ChunkWindow;
    use crate::ingest::coordinator::{StartRequest, SyncPolicy};
    use crate::ingest::normalize::RawTransaction;
    use crate::services::payment_api::{FetchError, FetchedPage};
    use crate::services::store::{MemoryStore, SyncRunStore};
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, Utc};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Every window has `pages` pages of two records each; ids are unique
    /// per (window, page).
    struct FakeSource {
        pages: u32,
        calls: AtomicU32,
        fail: bool,
    }

    impl FakeSource {
        fn new(pages: u32) -> Self {
            Self {
                pages,
                calls: AtomicU32::new(0),
                fail: false,
            }
        }
    }

    #[async_trait]
    impl TransactionSource for FakeSource {
        async fn fetch_page(
            &self,
            window: &ChunkWindow,
            page: u32,
        ) -> Result<FetchedPage, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(FetchError::AuthFailure("revoked".into()));
            }
            let records = (0..2)
                .map(|i| {
                    serde_json::from_value::<RawTransaction>(json!({
                        "id": format!("{}-{}-{}", window.start.timestamp(), page, i),
                        "amount": "1.00",
                        "currency": "USD",
                        "status": "PAID",
                        "createdAt": window.start.to_rfc3339(),
                    }))
                    .unwrap()
                })
                .collect();
            Ok(FetchedPage {
                records,
                total_pages: self.pages,
                total_items: u64::from(self.pages) * 2,
            })
        }
    }

    fn policy() -> SyncPolicy {
        SyncPolicy {
            stale_threshold: ChronoDuration::minutes(15),
            max_window_days: 31,
            end_date_safety: ChronoDuration::minutes(5),
            default_lookback: ChronoDuration::days(90),
            invocation_budget: Duration::from_secs(30),
            upsert_batch_size: 500,
            pause_poll_interval: Duration::from_millis(10),
        }
    }

    fn setup(source: FakeSource) -> (Arc<MemoryStore>, Arc<RunCoordinator>, SyncEngine) {
        let store = Arc::new(MemoryStore::new());
        let coordinator = Arc::new(RunCoordinator::new(store.clone(), policy()));
        let engine = SyncEngine::new(store.clone(), Arc::new(source), coordinator.clone());
        (store, coordinator, engine)
    }

    fn ninety_three_days(fetch_all: bool) -> StartRequest {
        let end = Utc::now() - ChronoDuration::hours(1);
        StartRequest {
            start: Some(end - ChronoDuration::days(93)),
            end: Some(end),
            fetch_all,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn fetch_all_walks_every_chunk_and_page() {
        let (store, coordinator, engine) = setup(FakeSource::new(2));
        let run = coordinator
            .start_or_resume("gateway", &ninety_three_days(true))
            .await
            .unwrap();
        assert_eq!(run.checkpoint.total_chunks, 3);

        let outcome = engine.run_invocation(&run, Duration::from_secs(30)).await.unwrap();

        assert_eq!(outcome, InvocationOutcome::Completed);
        let done = store.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(done.status, SyncStatus::Completed);
        assert_eq!(done.total_fetched, 12);
        assert_eq!(done.total_inserted, 12);
        assert_eq!(store.count_transactions("gateway").await.unwrap(), 12);
    }

    #[tokio::test]
    async fn without_fetch_all_only_the_first_chunk_is_read() {
        let (store, coordinator, engine) = setup(FakeSource::new(2));
        let run = coordinator
            .start_or_resume("gateway", &ninety_three_days(false))
            .await
            .unwrap();

        engine.run_invocation(&run, Duration::from_secs(30)).await.unwrap();

        assert_eq!(store.count_transactions("gateway").await.unwrap(), 4);
    }

    #[tokio::test]
    async fn zero_budget_processes_one_page_then_hands_off() {
        let (store, coordinator, engine) = setup(FakeSource::new(3));
        let run = coordinator
            .start_or_resume("gateway", &ninety_three_days(true))
            .await
            .unwrap();

        let outcome = engine.run_invocation(&run, Duration::ZERO).await.unwrap();

        assert_eq!(outcome, InvocationOutcome::HandOff(HandOffReason::Budget));
        let saved = store.get_run(run.id).await.unwrap().unwrap();
        assert_eq!((saved.checkpoint.chunk_index, saved.checkpoint.page), (0, 2));
        assert_eq!(saved.total_fetched, 2);

        // The next invocation resumes from the checkpoint, not from the start.
        let outcome = engine.run_invocation(&saved, Duration::from_secs(30)).await.unwrap();
        assert_eq!(outcome, InvocationOutcome::Completed);
        let done = store.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(done.total_fetched, 18);
        assert_eq!(store.count_transactions("gateway").await.unwrap(), 18);
    }

    #[tokio::test]
    async fn auth_failure_fails_the_run() {
        let mut source = FakeSource::new(1);
        source.fail = true;
        let (store, coordinator, engine) = setup(source);
        let run = coordinator
            .start_or_resume("gateway", &ninety_three_days(true))
            .await
            .unwrap();

        let outcome = engine.run_invocation(&run, Duration::from_secs(30)).await.unwrap();

        assert!(matches!(outcome, InvocationOutcome::Failed(_)));
        let failed = store.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(failed.status, SyncStatus::Failed);
        assert!(failed.error_message.unwrap().contains("revoked"));
    }

    #[tokio::test]
    async fn paused_source_hands_off_without_fetching() {
        let (store, coordinator, engine) = setup(FakeSource::new(1));
        store.set_paused("gateway", true).await.unwrap();
        let run = coordinator
            .start_or_resume("gateway", &ninety_three_days(true))
            .await
            .unwrap();

        let outcome = engine.run_invocation(&run, Duration::from_secs(30)).await.unwrap();

        assert_eq!(outcome, InvocationOutcome::HandOff(HandOffReason::Paused));
        assert_eq!(store.count_transactions("gateway").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn cancelled_run_stops_at_next_checkpoint() {
        let (store, coordinator, engine) = setup(FakeSource::new(5));
        let run = coordinator
            .start_or_resume("gateway", &ninety_three_days(true))
            .await
            .unwrap();
        coordinator.cancel_all("gateway").await.unwrap();

        let outcome = engine.run_invocation(&run, Duration::from_secs(30)).await.unwrap();

        assert_eq!(outcome, InvocationOutcome::Stopped(SyncStatus::Cancelled));
        assert_eq!(store.get_run(run.id).await.unwrap().unwrap().total_fetched, 0);
    }

    #[tokio::test]
    async fn future_range_completes_immediately() {
        let (_, coordinator, engine) = setup(FakeSource::new(1));
        let now = Utc::now();
        let run = coordinator
            .start_or_resume(
                "gateway",
                &StartRequest {
                    start: Some(now + ChronoDuration::days(1)),
                    end: Some(now + ChronoDuration::days(2)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let outcome = engine.run_invocation(&run, Duration::from_secs(30)).await.unwrap();
        assert_eq!(outcome, InvocationOutcome::Completed);
    }
}
