//! Domain models for sync-service.

#![allow(clippy::should_implement_trait)]

mod customer;
mod import_run;
mod sync_run;
mod transaction;

pub use customer::{Customer, MergedCustomer};
pub use import_run::{
    ImportRun, ImportStatus, NewStagingRow, RowStatus, StagedChunk, StagingRow,
};
pub use sync_run::{NewSyncRun, RunProgress, SyncCheckpoint, SyncParams, SyncRun, SyncStatus};
pub use transaction::{CanonicalStatus, NormalizedRecord, UpsertCounts};
