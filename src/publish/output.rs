use anyhow::{Context, Result};
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};
use tracing::{debug, info, instrument};

use crate::{
    config::FailurePolicy,
    progress::Progress,
    stage::run_stage,
    table::{self, list_tables, rename, sort, SortKey, DATE_COLUMN},
};

/// Empty `dir`, creating it if needed. Entries whose name starts with `.` are kept.
#[instrument(level = "info")]
pub fn wipe_output(dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let mut removed = 0usize;
    for entry in fs::read_dir(dir).with_context(|| format!("listing {}", dir.display()))? {
        let entry = entry?;
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        let path = entry.path();
        let result = if entry.file_type()?.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        };
        result.with_context(|| format!("removing {}", path.display()))?;
        removed += 1;
    }
    debug!(removed, "output folder wiped");
    Ok(())
}

/// Copy every table of `tables_dir` into `dest` unchanged.
pub fn copy_tables(tables_dir: &Path, dest: &Path) -> Result<Vec<PathBuf>> {
    let mut copied = Vec::new();
    for table in list_tables(tables_dir)? {
        let file_name = table
            .file_name()
            .with_context(|| format!("table path {} has no file name", table.display()))?;
        let target = dest.join(file_name);
        fs::copy(&table, &target)
            .with_context(|| format!("copying {} to {}", table.display(), target.display()))?;
        copied.push(target);
    }
    info!(tables = copied.len(), "tables copied");
    Ok(copied)
}

/// Publish every table of `tables_dir` into `dest` with its columns renamed through
/// `adapter` and its rows sorted by `(key_column[, date])`.
#[instrument(level = "info", skip(adapter, progress))]
pub fn publish_global_tables(
    tables_dir: &Path,
    dest: &Path,
    adapter: &BTreeMap<String, Option<String>>,
    key_column: &str,
    workers: usize,
    sort_chunk_rows: usize,
    progress: &dyn Progress,
) -> Result<Vec<PathBuf>> {
    let tables = list_tables(tables_dir)?;
    run_stage(
        "global",
        &tables,
        workers,
        FailurePolicy::FailFast,
        progress,
        |path| table::table_name(path),
        |path| publish_global_table(path, dest, adapter, key_column, sort_chunk_rows),
    )?;

    Ok(tables
        .iter()
        .filter_map(|t| t.file_name().map(|n| dest.join(n)))
        .collect())
}

fn publish_global_table(
    table: &Path,
    dest: &Path,
    adapter: &BTreeMap<String, Option<String>>,
    key_column: &str,
    sort_chunk_rows: usize,
) -> Result<()> {
    let file_name = table
        .file_name()
        .with_context(|| format!("table path {} has no file name", table.display()))?;
    let renamed = tempfile::Builder::new()
        .prefix(".rename-")
        .suffix(".csv")
        .tempfile_in(dest)?;
    rename(table, renamed.path(), adapter)?;

    let by: Vec<&str> = if table::is_dated(renamed.path())? {
        vec![key_column, DATE_COLUMN]
    } else {
        vec![key_column]
    };
    let rows = sort(
        renamed.path(),
        &dest.join(file_name),
        SortKey::Columns(&by),
        sort_chunk_rows,
    )?;
    debug!(table = %table.display(), rows, "published global table");
    Ok(())
}
