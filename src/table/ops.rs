use anyhow::{Context, Result};
use csv::StringRecord;
use std::{collections::BTreeMap, path::Path};
use tracing::debug;

use super::{column_index, create_writer, open_reader, read_header};

/// Copy `input` to `output` renaming columns through `mapping`.
///
/// Columns absent from the mapping keep their name; columns mapped to `None` are dropped.
pub fn rename(
    input: &Path,
    output: &Path,
    mapping: &BTreeMap<String, Option<String>>,
) -> Result<()> {
    let mut reader = open_reader(input)?;
    let header = read_header(&mut reader, input)?;

    let mut keep = Vec::with_capacity(header.len());
    let mut out_header = StringRecord::new();
    for (idx, name) in header.iter().enumerate() {
        match mapping.get(name) {
            Some(None) => continue,
            Some(Some(renamed)) => out_header.push_field(renamed),
            None => out_header.push_field(name),
        }
        keep.push(idx);
    }

    let mut writer = create_writer(output)?;
    writer.write_record(&out_header)?;
    for record in reader.records() {
        let record = record.with_context(|| format!("reading {}", input.display()))?;
        writer.write_record(keep.iter().map(|&i| &record[i]))?;
    }
    writer
        .flush()
        .with_context(|| format!("flushing {}", output.display()))?;
    Ok(())
}

/// Copy `input` to `output` without the columns that are empty in every row.
/// Returns the names of the dropped columns.
pub fn drop_empty_columns(input: &Path, output: &Path) -> Result<Vec<String>> {
    // 1) First pass: which columns carry at least one value
    let mut reader = open_reader(input)?;
    let header = read_header(&mut reader, input)?;
    let mut has_value = vec![false; header.len()];
    let mut rows = 0u64;
    for record in reader.records() {
        let record = record.with_context(|| format!("reading {}", input.display()))?;
        rows += 1;
        for (idx, field) in record.iter().enumerate() {
            if !field.is_empty() {
                has_value[idx] = true;
            }
        }
        if has_value.iter().all(|&v| v) {
            break;
        }
    }

    if rows == 0 {
        // nothing to judge emptiness by
        has_value.fill(true);
    }

    let keep: Vec<usize> = (0..header.len()).filter(|&i| has_value[i]).collect();
    let dropped: Vec<String> = (0..header.len())
        .filter(|&i| !has_value[i])
        .map(|i| header[i].to_string())
        .collect();

    // 2) Second pass: write the surviving columns
    let mut reader = open_reader(input)?;
    read_header(&mut reader, input)?;
    let mut writer = create_writer(output)?;
    writer.write_record(keep.iter().map(|&i| &header[i]))?;
    for record in reader.records() {
        let record = record.with_context(|| format!("reading {}", input.display()))?;
        writer.write_record(keep.iter().map(|&i| &record[i]))?;
    }
    writer
        .flush()
        .with_context(|| format!("flushing {}", output.display()))?;

    debug!(dropped = ?dropped, table = %input.display(), "dropped empty columns");
    Ok(dropped)
}

/// Keep only the last row of every contiguous run of equal `key` values.
///
/// With rows ordered by `(key, date)` this is the most recent row of each key.
pub fn group_tail(input: &Path, output: &Path, key: &str) -> Result<u64> {
    let mut reader = open_reader(input)?;
    let header = read_header(&mut reader, input)?;
    let key_idx = column_index(&header, key, input)?;

    let mut writer = create_writer(output)?;
    writer.write_record(&header)?;

    let mut last: Option<StringRecord> = None;
    let mut rows = 0u64;
    for record in reader.records() {
        let record = record.with_context(|| format!("reading {}", input.display()))?;
        if let Some(prev) = &last {
            if prev[key_idx] != record[key_idx] {
                writer.write_record(prev)?;
                rows += 1;
            }
        }
        last = Some(record);
    }
    if let Some(prev) = &last {
        writer.write_record(prev)?;
        rows += 1;
    }
    writer
        .flush()
        .with_context(|| format!("flushing {}", output.display()))?;
    Ok(rows)
}
