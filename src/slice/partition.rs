use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::{info, instrument, warn};

use crate::{
    progress::Progress,
    table::{column_index, is_safe_key, open_reader, read_header, KeyedWriter},
};

const STAGE: &str = "partition";

/// Split `main_table` into `<output_dir>/<key>/main.csv`, one file per key.
///
/// All rows of a key must be contiguous in the input; a key seen again after another
/// key truncates its earlier file. Returns the written files in key order.
#[instrument(level = "info", skip(progress))]
pub fn partition_by_key(
    main_table: &Path,
    output_dir: &Path,
    key_column: &str,
    progress: &dyn Progress,
) -> Result<Vec<PathBuf>> {
    // 1) First pass: count keys so progress has a total
    let mut reader = open_reader(main_table)?;
    let header = read_header(&mut reader, main_table)?;
    let key_idx = column_index(&header, key_column, main_table)?;
    let mut keys = 0usize;
    let mut previous: Option<String> = None;
    for record in reader.records() {
        let record = record.with_context(|| format!("reading {}", main_table.display()))?;
        let key = &record[key_idx];
        if previous.as_deref() != Some(key) {
            keys += 1;
            previous = Some(key.to_string());
        }
    }
    progress.start(STAGE, keys);

    // 2) Second pass: stream rows into their key's file
    let mut reader = open_reader(main_table)?;
    read_header(&mut reader, main_table)?;
    let mut writer = KeyedWriter::new(output_dir, "main.csv", header);
    let mut skipped = 0u64;
    for record in reader.records() {
        let record = record.with_context(|| format!("reading {}", main_table.display()))?;
        let key = &record[key_idx];
        if !is_safe_key(key) {
            skipped += 1;
            continue;
        }
        if writer.write(key, &record)? {
            progress.advance(STAGE, key);
        }
    }
    let files = writer.finish()?;
    progress.finish(STAGE);

    if skipped > 0 {
        warn!(skipped, "rows without a usable key were not partitioned");
    }
    info!(files = files.len(), "main table partitioned");
    Ok(files)
}
