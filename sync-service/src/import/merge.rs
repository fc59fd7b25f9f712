//! Merges staged rows into canonical customers.
//!
//! Rows are read in pages of `pending` rows only, so re-running the worker
//! after an interruption picks up exactly where the last run stopped. Each
//! identity group commits atomically with its rows' terminal status.

use crate::import::csv_fields::{CsvSourceType, RowView};
use crate::ingest::normalize::{
    normalize_email, normalize_phone, parse_decimal_lenient, to_minor_units, DEFAULT_CURRENCY,
};
use crate::models::{CanonicalStatus, MergedCustomer, RowStatus, StagingRow};
use crate::services::metrics::record_import_rows;
use crate::services::store::{GroupCommit, MergeCounts, Store};
use backoff::future::retry;
use backoff::ExponentialBackoff;
use service_core::error::AppError;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Totals of one merge pass over an import.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeReport {
    /// Rows marked merged, including those folded into existing customers.
    pub merged: u64,
    /// Merged rows whose customer already existed.
    pub conflict: u64,
    pub skipped: u64,
    pub error: u64,
    pub groups: u64,
    pub pages: u64,
}

impl MergeReport {
    fn add(&mut self, counts: &MergeCounts) {
        self.merged += counts.merged as u64;
        self.conflict += counts.conflict as u64;
        self.skipped += counts.skipped as u64;
        self.error += counts.error as u64;
    }
}

/// Grouping key: email first, phone when no email.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum IdentityKey {
    Email(String),
    Phone(String),
}

struct MergeGroup {
    row_ids: Vec<Uuid>,
    customer: MergedCustomer,
}

pub struct MergeWorker {
    store: Arc<dyn Store>,
    page_size: i64,
    retry_max_elapsed: Duration,
}

impl MergeWorker {
    pub fn new(store: Arc<dyn Store>, page_size: i64, retry_max_elapsed: Duration) -> Self {
        Self {
            store,
            page_size: page_size.max(1),
            retry_max_elapsed,
        }
    }

    /// Drain every pending row of `import_id`.
    pub async fn run(&self, import_id: Uuid) -> Result<MergeReport, AppError> {
        let mut report = MergeReport::default();

        loop {
            let rows = self
                .store
                .fetch_pending_rows(import_id, self.page_size)
                .await?;
            if rows.is_empty() {
                break;
            }
            report.pages += 1;

            let (groups, unidentified) = group_rows(&rows);
            let mut counts = MergeCounts::default();

            if !unidentified.is_empty() {
                let marked = self
                    .store
                    .mark_rows(&unidentified, RowStatus::Skipped, Some("no usable email or phone"))
                    .await?;
                counts.skipped += marked as i64;
            }

            for group in groups {
                report.groups += 1;
                match self.commit_group(&group).await {
                    Ok(Some(commit)) => {
                        counts.merged += commit.rows as i64;
                        if commit.existed {
                            counts.conflict += commit.rows as i64;
                        }
                    }
                    Ok(None) => {
                        // Some rows were finished elsewhere; the rest are
                        // picked up again on the next page.
                        debug!(import_id = %import_id, rows = group.row_ids.len(), "Merge group changed underneath, re-reading");
                    }
                    Err(e) => {
                        warn!(
                            import_id = %import_id,
                            rows = group.row_ids.len(),
                            error = %e,
                            "Merge group failed after retries"
                        );
                        let message = format!("merge failed: {}", e);
                        let marked = self
                            .store
                            .mark_rows(&group.row_ids, RowStatus::Error, Some(&message))
                            .await?;
                        counts.error += marked as i64;
                    }
                }
            }

            self.store.add_merge_counts(import_id, &counts).await?;
            report.add(&counts);

            if counts.merged + counts.skipped + counts.error == 0 {
                // Every group lost its race; avoid spinning on rows someone
                // else is finishing.
                warn!(import_id = %import_id, "Merge page made no progress, stopping");
                break;
            }
        }

        record_import_rows("merge", "merged", report.merged);
        record_import_rows("merge", "conflict", report.conflict);
        record_import_rows("merge", "skipped", report.skipped);
        record_import_rows("merge", "error", report.error);

        info!(
            import_id = %import_id,
            merged = report.merged,
            conflict = report.conflict,
            skipped = report.skipped,
            error = report.error,
            pages = report.pages,
            "Merge pass finished"
        );

        Ok(report)
    }

    async fn commit_group(&self, group: &MergeGroup) -> Result<Option<GroupCommit>, AppError> {
        let backoff = ExponentialBackoff {
            initial_interval: Duration::from_millis(100),
            max_elapsed_time: Some(self.retry_max_elapsed),
            ..Default::default()
        };

        retry(backoff, || async {
            self.store
                .commit_merge_group(&group.row_ids, &group.customer)
                .await
                .map_err(backoff::Error::transient)
        })
        .await
    }
}

fn identity_key(row: &StagingRow) -> Option<IdentityKey> {
    if let Some(email) = row.email.as_deref().and_then(normalize_email) {
        return Some(IdentityKey::Email(email));
    }
    row.phone
        .as_deref()
        .and_then(normalize_phone)
        .map(IdentityKey::Phone)
}

/// Split a page into identity groups (first-seen order) and rows with no
/// identity.
fn group_rows(rows: &[StagingRow]) -> (Vec<MergeGroup>, Vec<Uuid>) {
    let mut index: HashMap<IdentityKey, usize> = HashMap::new();
    let mut groups: Vec<MergeGroup> = Vec::new();
    let mut unidentified = Vec::new();

    for row in rows {
        let Some(key) = identity_key(row) else {
            unidentified.push(row.id);
            continue;
        };
        let slot = *index.entry(key.clone()).or_insert_with(|| {
            let (email, phone) = match &key {
                IdentityKey::Email(email) => (Some(email.clone()), None),
                IdentityKey::Phone(phone) => (None, Some(phone.clone())),
            };
            groups.push(MergeGroup {
                row_ids: Vec::new(),
                customer: MergedCustomer {
                    email,
                    phone,
                    ..Default::default()
                },
            });
            groups.len() - 1
        });
        let group = &mut groups[slot];
        group.row_ids.push(row.id);
        fold_row(&mut group.customer, row);
    }

    for group in &mut groups {
        group.customer.tags.sort();
        group.customer.tags.dedup();
    }

    (groups, unidentified)
}

/// First non-null wins for scalars; successful amounts add up.
fn fold_row(customer: &mut MergedCustomer, row: &StagingRow) {
    let source_type = CsvSourceType::parse(Some(&row.source_type));
    let aggregates = RowView::new(&row.raw_data).aggregates(source_type);

    if customer.phone.is_none() {
        customer.phone = row.phone.as_deref().and_then(normalize_phone);
    }
    if customer.full_name.is_none() {
        customer.full_name = row
            .full_name
            .as_deref()
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string);
    }
    if customer.currency.is_none() {
        customer.currency = aggregates.currency.clone();
    }

    let successful = aggregates
        .status
        .as_deref()
        .map_or(true, |s| CanonicalStatus::from_external(s) == CanonicalStatus::Paid);
    if successful {
        let currency = aggregates
            .currency
            .as_deref()
            .or(customer.currency.as_deref())
            .unwrap_or(DEFAULT_CURRENCY);
        if let Some(minor) = aggregates
            .amount
            .as_deref()
            .and_then(parse_decimal_lenient)
            .and_then(|amount| to_minor_units(amount, currency))
        {
            customer.total_spent_minor = customer.total_spent_minor.saturating_add(minor);
            customer.payment_count += 1;
        }
    }

    customer.tags.extend(aggregates.tags);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewStagingRow;
    use crate::services::store::{ImportStore, MemoryStore};
    use std::collections::BTreeMap;

    fn staged(row_number: i64, pairs: &[(&str, &str)]) -> NewStagingRow {
        let raw_data: BTreeMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let view = RowView::new(&raw_data);
        let identity = view.identity();
        NewStagingRow {
            row_number,
            email: identity.email,
            phone: identity.phone,
            full_name: identity.full_name,
            raw_data,
        }
    }

    async fn seed(store: &MemoryStore, source_type: &str, rows: Vec<NewStagingRow>) -> Uuid {
        let import = store.create_import("test.csv", source_type).await.unwrap();
        store
            .insert_staging_rows(import.id, source_type, &rows)
            .await
            .unwrap();
        import.id
    }

    fn worker(store: Arc<MemoryStore>, page_size: i64) -> MergeWorker {
        MergeWorker::new(store, page_size, Duration::from_millis(200))
    }

    #[tokio::test]
    async fn non_null_name_wins_within_a_group() {
        let store = Arc::new(MemoryStore::new());
        let import_id = seed(
            &store,
            "customers",
            vec![
                staged(1, &[("email", "pat@example.com"), ("total_spent", "10.00")]),
                staged(
                    2,
                    &[
                        ("email", "PAT@example.com"),
                        ("full_name", "Pat Lee"),
                        ("total_spent", "$5.50"),
                        ("tags", "vip,new"),
                    ],
                ),
            ],
        )
        .await;

        let report = worker(store.clone(), 100).run(import_id).await.unwrap();

        assert_eq!(report.merged, 2);
        assert_eq!(report.groups, 1);
        let customer = store
            .find_customer_by_email("pat@example.com")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(customer.full_name.as_deref(), Some("Pat Lee"));
        assert_eq!(customer.total_spent_minor, 1550);
        assert_eq!(customer.payment_count, 2);
        assert_eq!(customer.tags, vec!["new", "vip"]);
    }

    #[tokio::test]
    async fn only_successful_transactions_count_toward_totals() {
        let store = Arc::new(MemoryStore::new());
        let import_id = seed(
            &store,
            "transactions",
            vec![
                staged(1, &[("email", "a@example.com"), ("amount", "20"), ("status", "paid")]),
                staged(2, &[("email", "a@example.com"), ("amount", "99"), ("status", "failed")]),
                staged(3, &[("email", "a@example.com"), ("amount", "1.25"), ("status", "succeeded")]),
            ],
        )
        .await;

        worker(store.clone(), 100).run(import_id).await.unwrap();

        let customer = store
            .find_customer_by_email("a@example.com")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(customer.total_spent_minor, 2125);
        assert_eq!(customer.payment_count, 2);
    }

    #[tokio::test]
    async fn every_row_reaches_a_terminal_status_across_pages() {
        let store = Arc::new(MemoryStore::new());
        let mut rows: Vec<NewStagingRow> = (0..7)
            .map(|i| staged(i + 1, &[("email", format!("u{}@example.com", i % 3).as_str())]))
            .collect();
        rows.push(NewStagingRow {
            row_number: 8,
            email: None,
            phone: None,
            full_name: Some("ghost".into()),
            raw_data: BTreeMap::new(),
        });
        rows.push(staged(9, &[("phone", "555 123 4567")]));
        let import_id = seed(&store, "generic", rows).await;

        let report = worker(store.clone(), 3).run(import_id).await.unwrap();

        let counts = store.count_rows_by_status(import_id).await.unwrap();
        assert_eq!(counts.pending, 0);
        assert_eq!(counts.merged, 8);
        assert_eq!(counts.skipped, 1);
        assert_eq!(report.merged, 8);
        assert_eq!(report.skipped, 1);
        // Emails repeat across pages, so later pages fold into existing customers.
        assert!(report.conflict > 0);
        assert!(store.find_customer_by_phone("5551234567").await.unwrap().is_some());

        let import = store.get_import(import_id).await.unwrap().unwrap();
        assert_eq!(import.rows_merged, 8);
        assert_eq!(import.rows_skipped, 1);
    }

    #[tokio::test]
    async fn existing_customer_keeps_its_name() {
        let store = Arc::new(MemoryStore::new());
        let first = seed(
            &store,
            "customers",
            vec![staged(1, &[("email", "kim@example.com"), ("name", "Kim"), ("total_spent", "3")])],
        )
        .await;
        worker(store.clone(), 10).run(first).await.unwrap();

        let second = seed(
            &store,
            "customers",
            vec![staged(1, &[("email", "kim@example.com"), ("name", "K. Doe"), ("total_spent", "4")])],
        )
        .await;
        let report = worker(store.clone(), 10).run(second).await.unwrap();

        assert_eq!(report.conflict, 1);
        let customer = store
            .find_customer_by_email("kim@example.com")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(customer.full_name.as_deref(), Some("Kim"));
        assert_eq!(customer.total_spent_minor, 700);
    }

    #[tokio::test]
    async fn rerun_after_completion_is_a_no_op() {
        let store = Arc::new(MemoryStore::new());
        let import_id = seed(&store, "customers", vec![staged(1, &[("email", "x@example.com")])]).await;
        let merge = worker(store.clone(), 10);

        merge.run(import_id).await.unwrap();
        let again = merge.run(import_id).await.unwrap();

        assert_eq!(again, MergeReport::default());
    }
}
