pub mod build;
pub mod config;
pub mod duck;
pub mod error;
pub mod mirror;
pub mod progress;
pub mod publish;
pub mod slice;
pub mod stage;
pub mod table;

pub use build::{BuildOptions, DateRange, MainTableBuilder, MainTableSummary, Strategy};
pub use config::{ColumnType, FailurePolicy, PublishConfig, SchemaVersion};
pub use error::PublishError;
pub use progress::{LogProgress, NoProgress, Progress};
pub use stage::StageReport;
