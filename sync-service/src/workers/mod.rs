mod continuation;
mod merge_supervisor;

pub use continuation::{ContinuationQueue, SyncJob};
pub use merge_supervisor::{MergeSupervisor, MergeTaskState};
