pub mod chunker;
pub mod coordinator;
pub mod engine;
pub mod normalize;
pub mod writer;

pub use coordinator::{RunCoordinator, StartRequest, SyncError, SyncPolicy};
pub use engine::{HandOffReason, InvocationOutcome, SyncEngine};
