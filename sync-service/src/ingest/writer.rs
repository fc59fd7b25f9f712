//! Deduplicating batch writer for normalized transactions.

use crate::models::NormalizedRecord;
use crate::services::metrics::{record_error, record_sync_records};
use crate::services::store::TransactionStore;
use std::collections::HashMap;

/// Outcome of writing one page of records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertReport {
    pub inserted: u64,
    pub updated: u64,
    pub skipped_duplicate: u64,
    /// Records in sub-batches the store refused.
    pub failed: u64,
    pub batches: u64,
}

impl UpsertReport {
    /// Records that reached the store.
    pub fn written(&self) -> u64 {
        self.inserted + self.updated
    }
}

/// Collapse records sharing a natural key, keeping the last occurrence in
/// its first position. Returns the survivors and the number dropped.
pub fn dedupe_by_natural_key(records: Vec<NormalizedRecord>) -> (Vec<NormalizedRecord>, u64) {
    let total = records.len();
    let mut slots: HashMap<(String, String), usize> = HashMap::with_capacity(total);
    let mut unique: Vec<NormalizedRecord> = Vec::with_capacity(total);

    for record in records {
        let key = (record.source.clone(), record.external_id.clone());
        match slots.get(&key) {
            Some(&slot) => unique[slot] = record,
            None => {
                slots.insert(key, unique.len());
                unique.push(record);
            }
        }
    }

    let dropped = (total - unique.len()) as u64;
    (unique, dropped)
}

pub struct BatchUpsertWriter {
    batch_size: usize,
}

impl BatchUpsertWriter {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
        }
    }

    /// Dedupe, split into sub-batches and upsert each one.
    ///
    /// A failing sub-batch is logged and counted; the rest still run.
    pub async fn write<S: TransactionStore + ?Sized>(
        &self,
        store: &S,
        records: Vec<NormalizedRecord>,
    ) -> UpsertReport {
        let source = records.first().map(|r| r.source.clone()).unwrap_or_default();
        let (unique, skipped_duplicate) = dedupe_by_natural_key(records);
        let mut report = UpsertReport {
            skipped_duplicate,
            ..Default::default()
        };

        if skipped_duplicate > 0 {
            tracing::debug!(
                source = %source,
                skipped_duplicate = skipped_duplicate,
                "Dropped duplicate natural keys within page"
            );
        }

        for (index, batch) in unique.chunks(self.batch_size).enumerate() {
            report.batches += 1;
            match store.upsert_transactions(batch).await {
                Ok(counts) => {
                    report.inserted += counts.inserted;
                    report.updated += counts.updated;
                }
                Err(e) => {
                    report.failed += batch.len() as u64;
                    record_error(e.kind());
                    tracing::error!(
                        source = %source,
                        batch_index = index,
                        batch_len = batch.len(),
                        error = %e,
                        "Sub-batch upsert failed; continuing with remaining batches"
                    );
                }
            }
        }

        record_sync_records(&source, "inserted", report.inserted);
        record_sync_records(&source, "updated", report.updated);
        record_sync_records(&source, "duplicate", report.skipped_duplicate);
        record_sync_records(&source, "failed", report.failed);

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CanonicalStatus, UpsertCounts};
    use crate::services::store::MemoryStore;
    use async_trait::async_trait;
    use chrono::Utc;
    use service_core::error::AppError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn record(id: &str, amount_minor: i64) -> NormalizedRecord {
        NormalizedRecord {
            source: "gateway".to_string(),
            external_id: id.to_string(),
            customer_email: None,
            amount_minor,
            currency: "USD".to_string(),
            status: CanonicalStatus::Paid,
            occurred_at: Utc::now(),
            raw_metadata: serde_json::json!({}),
        }
    }

    #[test]
    fn dedupe_keeps_last_occurrence() {
        let (unique, dropped) =
            dedupe_by_natural_key(vec![record("a", 1), record("b", 2), record("a", 3)]);
        assert_eq!(dropped, 1);
        assert_eq!(unique.len(), 2);
        assert_eq!(unique[0].external_id, "a");
        assert_eq!(unique[0].amount_minor, 3);
    }

    #[tokio::test]
    async fn duplicate_keys_in_a_page_persist_once() {
        let store = MemoryStore::new();
        let writer = BatchUpsertWriter::new(500);

        let report = writer
            .write(&store, vec![record("dup", 100), record("dup", 100)])
            .await;

        assert_eq!(report.inserted, 1);
        assert_eq!(report.skipped_duplicate, 1);
        assert_eq!(store.count_transactions("gateway").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn rewriting_the_same_records_updates_instead_of_inserting() {
        let store = MemoryStore::new();
        let writer = BatchUpsertWriter::new(2);
        let page = vec![record("a", 1), record("b", 2), record("c", 3)];

        let first = writer.write(&store, page.clone()).await;
        let second = writer.write(&store, page).await;

        assert_eq!((first.inserted, first.batches), (3, 2));
        assert_eq!((second.inserted, second.updated), (0, 3));
        assert_eq!(store.count_transactions("gateway").await.unwrap(), 3);
    }

    struct FlakyStore {
        calls: AtomicUsize,
        fail_on: usize,
    }

    #[async_trait]
    impl TransactionStore for FlakyStore {
        async fn upsert_transactions(
            &self,
            records: &[NormalizedRecord],
        ) -> Result<UpsertCounts, AppError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call == self.fail_on {
                return Err(AppError::DatabaseError(anyhow::anyhow!("deadlock detected")));
            }
            Ok(UpsertCounts {
                inserted: records.len() as u64,
                updated: 0,
            })
        }
    }

    #[tokio::test]
    async fn failed_sub_batch_does_not_abort_the_rest() {
        let store = FlakyStore {
            calls: AtomicUsize::new(0),
            fail_on: 1,
        };
        let writer = BatchUpsertWriter::new(2);
        let page = (0..5).map(|i| record(&i.to_string(), i)).collect();

        let report = writer.write(&store, page).await;

        assert_eq!(report.batches, 3);
        assert_eq!(report.failed, 2);
        assert_eq!(report.inserted, 3);
    }
}
