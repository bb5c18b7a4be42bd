use std::path::PathBuf;

use thiserror::Error;

/// Precondition failures a caller may want to tell apart from plain I/O errors.
///
/// Everything else travels as `anyhow::Error` with path context attached.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("index table not found: {}", .0.display())]
    MissingIndexTable(PathBuf),

    #[error("column `{column}` not found in {}", .table.display())]
    MissingColumn { table: PathBuf, column: String },

    #[error("table {} has no header row", .0.display())]
    EmptyTable(PathBuf),
}
