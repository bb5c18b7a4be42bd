// src/build/mod.rs
//
// The main table is the left-outer denormalization of every topic table over the
// universe {index keys} x {dates in range}. Three strategies build it; they are
// interchangeable and produce the same rows.

pub mod buffered;
pub mod direct;
pub mod staged;

pub use buffered::{BufferedJoin, WorkingBuffer};
pub use direct::DirectJoin;
pub use staged::StagedMerge;

use anyhow::{Context, Result};
use chrono::{Duration, Local, NaiveDate};
use std::{
    collections::{BTreeSet, HashSet},
    fs,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};
use tempfile::TempDir;
use tracing::{info, warn};

use crate::{
    error::PublishError,
    table::{self, DATE_COLUMN},
};

/// File name of the mandatory index table.
pub const INDEX_TABLE: &str = "index.csv";

/// Inclusive range of days the main table covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    /// `[2020-01-01, tomorrow]`, tomorrow being relative to the local clock.
    pub fn publish_default() -> Self {
        let start = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap_or_default();
        let end = Local::now().date_naive() + Duration::days(1);
        Self { start, end }
    }

    /// Every day of the range as `YYYY-MM-DD`.
    pub fn days(&self) -> Vec<String> {
        let end = self.end;
        self.start
            .iter_days()
            .take_while(|d| *d <= end)
            .map(|d| d.format("%Y-%m-%d").to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        if self.end < self.start {
            0
        } else {
            (self.end - self.start).num_days() as usize + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// `key` or `location_key`, depending on the schema generation.
    pub key_column: String,
    pub date_range: DateRange,
    /// Table names (file stems) withheld from the join.
    pub exclude: Vec<String>,
    /// Drop columns that are empty in every output row.
    pub drop_empty_columns: bool,
    pub sort_chunk_rows: usize,
}

impl BuildOptions {
    pub fn new(key_column: impl Into<String>) -> Self {
        Self {
            key_column: key_column.into(),
            date_range: DateRange::publish_default(),
            exclude: vec!["main".to_string()],
            drop_empty_columns: false,
            sort_chunk_rows: 1_000_000,
        }
    }

    pub fn with_date_range(mut self, date_range: DateRange) -> Self {
        self.date_range = date_range;
        self
    }

    pub fn with_exclude(mut self, exclude: Vec<String>) -> Self {
        self.exclude = exclude;
        self
    }

    pub fn with_drop_empty_columns(mut self, drop: bool) -> Self {
        self.drop_empty_columns = drop;
        self
    }

    pub fn with_sort_chunk_rows(mut self, rows: usize) -> Self {
        self.sort_chunk_rows = rows;
        self
    }

    pub fn is_excluded(&self, table_name: &str) -> bool {
        self.exclude.iter().any(|t| t == table_name)
    }
}

/// What a build produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MainTableSummary {
    pub rows: u64,
    pub columns: Vec<String>,
    /// Columns contributed by tables without a date axis.
    pub static_columns: BTreeSet<String>,
    /// Names of the topic tables joined, in join order.
    pub tables: Vec<String>,
    pub dropped_columns: Vec<String>,
}

/// One way of building the main table from a directory of topic tables.
pub trait MainTableBuilder: Send + Sync {
    fn name(&self) -> &'static str;

    /// Build the main table of the tables in `tables_dir` into `output`.
    ///
    /// `output` is only replaced once the whole build has succeeded.
    fn build(
        &self,
        tables_dir: &Path,
        output: &Path,
        options: &BuildOptions,
    ) -> Result<MainTableSummary>;
}

/// Strategy selector for the CLI and configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum Strategy {
    /// Join every table into a single working file.
    #[default]
    Direct,
    /// Join alternating between two working files.
    Buffered,
    /// Merge inside an embedded DuckDB.
    Staged,
}

impl Strategy {
    pub fn builder(&self) -> Box<dyn MainTableBuilder> {
        match self {
            Strategy::Direct => Box::new(DirectJoin),
            Strategy::Buffered => Box::new(BufferedJoin),
            Strategy::Staged => Box::new(StagedMerge),
        }
    }
}

/// Temporary workspace for one build, next to `output` so results can be renamed
/// into place. Removed when dropped.
pub(crate) fn workspace_for(output: &Path) -> Result<TempDir> {
    let parent = match output.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent).with_context(|| format!("creating {}", parent.display()))?;
    tempfile::Builder::new()
        .prefix(".build-")
        .tempdir_in(&parent)
        .with_context(|| format!("creating build workspace in {}", parent.display()))
}

pub(crate) fn index_table(tables_dir: &Path) -> Result<PathBuf> {
    let index = tables_dir.join(INDEX_TABLE);
    if !index.is_file() {
        return Err(PublishError::MissingIndexTable(index).into());
    }
    Ok(index)
}

/// Write every `(key, date)` pair of the universe to `output`, keys in index order.
pub(crate) fn write_key_date_table(
    tables_dir: &Path,
    options: &BuildOptions,
    workdir: &Path,
    output: &Path,
) -> Result<u64> {
    let index = index_table(tables_dir)?;

    let keys_path = workdir.join("keys.csv");
    let mut seen = HashSet::new();
    let mut empty = 0usize;
    {
        let mut writer = table::create_writer(&keys_path)?;
        writer.write_record([options.key_column.as_str()])?;
        for key in table::read_column(&index, &options.key_column)? {
            if key.is_empty() {
                empty += 1;
                continue;
            }
            if seen.insert(key.clone()) {
                writer.write_record([key.as_str()])?;
            }
        }
        writer.flush()?;
    }
    if empty > 0 {
        warn!(empty, index = %index.display(), "index rows without a key were ignored");
    }

    let dates_path = workdir.join("dates.csv");
    {
        let file = fs::File::create(&dates_path)
            .with_context(|| format!("creating {}", dates_path.display()))?;
        let mut writer = BufWriter::new(file);
        writeln!(writer, "{DATE_COLUMN}")?;
        for day in options.date_range.days() {
            writeln!(writer, "{day}")?;
        }
        writer.flush()?;
    }

    let rows = table::cross_product(&keys_path, &dates_path, output)?;
    info!(keys = seen.len(), days = options.date_range.len(), rows, "created key x date table");
    Ok(rows)
}

/// Topic tables of `tables_dir` taking part in the join, in path order.
pub(crate) fn topic_tables(tables_dir: &Path, options: &BuildOptions) -> Result<Vec<PathBuf>> {
    Ok(table::list_tables(tables_dir)?
        .into_iter()
        .filter(|p| !options.is_excluded(&table::table_name(p)))
        .collect())
}

/// Join columns for `table`: `(key, date)` if it is dated, else `(key)`.
pub(crate) fn join_columns<'a>(columns: &[String], options: &'a BuildOptions) -> Vec<&'a str> {
    if columns.iter().any(|c| c == DATE_COLUMN) {
        vec![options.key_column.as_str(), DATE_COLUMN]
    } else {
        vec![options.key_column.as_str()]
    }
}

/// Move a finished file into its final place.
pub(crate) fn promote(finished: &Path, output: &Path) -> Result<()> {
    fs::rename(finished, output).with_context(|| {
        format!(
            "moving {} into place at {}",
            finished.display(),
            output.display()
        )
    })
}
