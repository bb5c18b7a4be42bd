// src/table/mod.rs
//
// Streaming CSV primitives the publisher is assembled from. None of them holds a
// whole input in memory except the right-hand side of a join or cross product.

pub mod join;
pub mod keyed;
pub mod ops;
pub mod sort;

pub use join::{cross_product, join};
pub use keyed::{breakout, is_safe_key, KeyedWriter};
pub use ops::{drop_empty_columns, group_tail, rename};
pub use sort::{sort, SortKey};

use anyhow::{Context, Result};
use csv::{Reader, ReaderBuilder, StringRecord, Terminator, Writer, WriterBuilder};
use glob::glob;
use std::{
    fs::File,
    path::{Path, PathBuf},
};

use crate::error::PublishError;

/// Column holding the ISO-8601 day of a dated table.
pub const DATE_COLUMN: &str = "date";

pub fn open_reader(path: &Path) -> Result<Reader<File>> {
    ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .with_context(|| format!("opening table {}", path.display()))
}

pub fn create_writer(path: &Path) -> Result<Writer<File>> {
    WriterBuilder::new()
        .terminator(Terminator::Any(b'\n'))
        .from_path(path)
        .with_context(|| format!("creating table {}", path.display()))
}

/// Read the header row, failing on a table without one.
pub fn read_header(reader: &mut Reader<File>, path: &Path) -> Result<StringRecord> {
    let header = reader
        .headers()
        .with_context(|| format!("reading header of {}", path.display()))?
        .clone();
    if header.is_empty() {
        return Err(PublishError::EmptyTable(path.to_path_buf()).into());
    }
    Ok(header)
}

/// Ordered column names of the table at `path`.
pub fn columns(path: &Path) -> Result<Vec<String>> {
    let mut reader = open_reader(path)?;
    let header = read_header(&mut reader, path)?;
    Ok(header.iter().map(str::to_string).collect())
}

pub fn is_dated(path: &Path) -> Result<bool> {
    Ok(columns(path)?.iter().any(|c| c == DATE_COLUMN))
}

pub fn column_index(header: &StringRecord, column: &str, path: &Path) -> Result<usize> {
    header
        .iter()
        .position(|c| c == column)
        .ok_or_else(|| {
            PublishError::MissingColumn {
                table: path.to_path_buf(),
                column: column.to_string(),
            }
            .into()
        })
}

/// Every value of `column`, in row order.
pub fn read_column(path: &Path, column: &str) -> Result<Vec<String>> {
    let mut reader = open_reader(path)?;
    let header = read_header(&mut reader, path)?;
    let idx = column_index(&header, column, path)?;

    let mut values = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record =
            record.with_context(|| format!("reading row {} of {}", row + 1, path.display()))?;
        values.push(record.get(idx).unwrap_or_default().to_string());
    }
    Ok(values)
}

/// Top-level `*.csv` files of `dir`, sorted by path so runs are reproducible.
pub fn list_tables(dir: &Path) -> Result<Vec<PathBuf>> {
    let pattern = format!("{}/*.csv", dir.display());
    let mut tables: Vec<PathBuf> = glob(&pattern)
        .with_context(|| format!("invalid glob pattern {pattern}"))?
        .filter_map(|entry| entry.ok())
        .filter(|p| p.is_file())
        .collect();
    tables.sort();
    Ok(tables)
}

/// Table name as used by exclusion lists: the file stem.
pub fn table_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default()
}
