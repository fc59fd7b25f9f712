pub mod csv_fields;
pub mod merge;
pub mod staging;

pub use csv_fields::CsvSourceType;
pub use merge::{MergeReport, MergeWorker};
pub use staging::{StageReport, StageRequest, StagingWriter};
