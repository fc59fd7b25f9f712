pub mod health;
pub mod import;
pub mod sync;

pub use health::{health_check, metrics_handler, readiness_check};
pub use import::{get_import, import_csv, trigger_merge};
pub use sync::{get_run, set_pause, trigger_sync};
