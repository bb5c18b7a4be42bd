use anyhow::{anyhow, Context, Result};
use csv::{ReaderBuilder, StringRecord, Terminator, WriterBuilder};
use std::{
    cmp::{Ordering, Reverse},
    collections::BinaryHeap,
    fs::File,
    path::{Path, PathBuf},
};
use tempfile::TempDir;
use tracing::debug;

use super::{column_index, create_writer, open_reader, read_header};

/// What rows are ordered by.
#[derive(Debug, Clone, Copy)]
pub enum SortKey<'a> {
    /// The whole serialized row, i.e. plain lexical order of the output lines.
    Row,
    /// The listed columns, compared left to right as strings. Ties keep input order.
    Columns(&'a [&'a str]),
}

/// The serialized form of `record` as it appears in an output line, without terminator.
fn row_string(record: &StringRecord) -> Result<String> {
    let mut writer = WriterBuilder::new()
        .terminator(Terminator::Any(b'\n'))
        .from_writer(Vec::with_capacity(128));
    writer.write_record(record)?;
    let mut bytes = writer
        .into_inner()
        .map_err(|e| anyhow!("encoding row: {}", e))?;
    bytes.pop();
    Ok(String::from_utf8(bytes)?)
}

struct KeyFn {
    columns: Option<Vec<usize>>,
}

impl KeyFn {
    fn key(&self, record: &StringRecord) -> Result<Vec<String>> {
        match &self.columns {
            None => Ok(vec![row_string(record)?]),
            Some(cols) => Ok(cols
                .iter()
                .map(|&i| record.get(i).unwrap_or_default().to_string())
                .collect()),
        }
    }
}

/// Head of one sorted run during the k-way merge.
struct RunHead {
    key: Vec<String>,
    run: usize,
    record: StringRecord,
}

impl PartialEq for RunHead {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for RunHead {}

impl PartialOrd for RunHead {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for RunHead {
    // earlier runs win ties, which keeps the merge stable
    fn cmp(&self, other: &Self) -> Ordering {
        self.key
            .cmp(&other.key)
            .then_with(|| self.run.cmp(&other.run))
    }
}

/// External merge sort of the table at `input` into `output`.
///
/// At most `chunk_rows` rows are held in memory; larger inputs are spilled into sorted
/// runs in a private temporary directory and merged. The header is preserved.
pub fn sort(input: &Path, output: &Path, by: SortKey<'_>, chunk_rows: usize) -> Result<u64> {
    let chunk_rows = chunk_rows.max(1);
    let mut reader = open_reader(input)?;
    let header = read_header(&mut reader, input)?;
    let key_fn = KeyFn {
        columns: match by {
            SortKey::Row => None,
            SortKey::Columns(cols) => Some(
                cols.iter()
                    .map(|c| column_index(&header, c, input))
                    .collect::<Result<_>>()?,
            ),
        },
    };

    let mut spill: Option<TempDir> = None;
    let mut runs: Vec<PathBuf> = Vec::new();
    let mut chunk: Vec<(Vec<String>, StringRecord)> = Vec::with_capacity(chunk_rows.min(1 << 16));
    let mut rows = 0u64;

    for record in reader.records() {
        let record = record.with_context(|| format!("reading {}", input.display()))?;
        chunk.push((key_fn.key(&record)?, record));
        rows += 1;
        if chunk.len() >= chunk_rows {
            if spill.is_none() {
                spill = Some(tempfile::Builder::new().prefix("sort-").tempdir()?);
            }
            let run_path = run_path(spill.as_ref(), runs.len())?;
            write_run(&mut chunk, &run_path)?;
            runs.push(run_path);
        }
    }

    let mut writer = create_writer(output)?;
    writer.write_record(&header)?;

    if runs.is_empty() {
        // fits in a single chunk, nothing was spilled
        chunk.sort_by(|a, b| a.0.cmp(&b.0));
        for (_, record) in &chunk {
            writer.write_record(record)?;
        }
    } else {
        if !chunk.is_empty() {
            let run_path = run_path(spill.as_ref(), runs.len())?;
            write_run(&mut chunk, &run_path)?;
            runs.push(run_path);
        }
        debug!(runs = runs.len(), rows, input = %input.display(), "merging sorted runs");

        let mut readers = runs
            .iter()
            .map(|p| {
                ReaderBuilder::new()
                    .has_headers(false)
                    .from_path(p)
                    .with_context(|| format!("opening sort run {}", p.display()))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut heap = BinaryHeap::with_capacity(readers.len());
        for (run, reader) in readers.iter_mut().enumerate() {
            if let Some(head) = next_head(reader, run, &key_fn)? {
                heap.push(Reverse(head));
            }
        }
        while let Some(Reverse(head)) = heap.pop() {
            writer.write_record(&head.record)?;
            if let Some(next) = next_head(&mut readers[head.run], head.run, &key_fn)? {
                heap.push(Reverse(next));
            }
        }
    }

    writer
        .flush()
        .with_context(|| format!("flushing {}", output.display()))?;
    Ok(rows)
}

fn run_path(spill: Option<&TempDir>, run: usize) -> Result<PathBuf> {
    let dir = spill.ok_or_else(|| anyhow!("sort spill directory missing"))?;
    Ok(dir.path().join(format!("run-{run}.csv")))
}

fn write_run(chunk: &mut Vec<(Vec<String>, StringRecord)>, path: &Path) -> Result<()> {
    chunk.sort_by(|a, b| a.0.cmp(&b.0));
    let mut writer = WriterBuilder::new()
        .terminator(Terminator::Any(b'\n'))
        .from_path(path)
        .with_context(|| format!("creating sort run {}", path.display()))?;
    for (_, record) in chunk.iter() {
        writer.write_record(record)?;
    }
    writer.flush()?;
    chunk.clear();
    Ok(())
}

fn next_head(
    reader: &mut csv::Reader<File>,
    run: usize,
    key_fn: &KeyFn,
) -> Result<Option<RunHead>> {
    let mut record = StringRecord::new();
    if !reader.read_record(&mut record)? {
        return Ok(None);
    }
    Ok(Some(RunHead {
        key: key_fn.key(&record)?,
        run,
        record,
    }))
}

#[cfg(test)]
mod tests {
    use super::super::test_util::{read_lines, write_table};
    use super::*;
    use tempfile::tempdir;

    fn unsorted_table(path: &Path) -> Result<()> {
        write_table(
            path,
            &[
                "location_key,date,value",
                "US_FL,2020-01-02,3",
                "AD,2020-01-02,1",
                "US,2020-01-01,7",
                "AD,2020-01-01,2",
                "US_FL,2020-01-01,4",
                "AD_01,2020-01-01,5",
                "US,2020-01-02,6",
            ],
        )
    }

    #[test]
    fn row_sort_is_lexical() -> Result<()> {
        let dir = tempdir()?;
        let input = dir.path().join("in.csv");
        let output = dir.path().join("out.csv");
        unsorted_table(&input)?;

        assert_eq!(sort(&input, &output, SortKey::Row, 1_000)?, 7);
        let lines = read_lines(&output)?;
        assert_eq!(lines[0], "location_key,date,value");
        let mut expected = lines[1..].to_vec();
        expected.sort();
        assert_eq!(lines[1..], expected[..]);
        assert_eq!(lines[1], "AD,2020-01-01,2");
        Ok(())
    }

    #[test]
    fn spilled_sort_matches_in_memory_sort() -> Result<()> {
        let dir = tempdir()?;
        let input = dir.path().join("in.csv");
        unsorted_table(&input)?;

        let in_memory = dir.path().join("a.csv");
        let spilled = dir.path().join("b.csv");
        sort(&input, &in_memory, SortKey::Row, 100)?;
        sort(&input, &spilled, SortKey::Row, 2)?;
        assert_eq!(read_lines(&in_memory)?, read_lines(&spilled)?);
        Ok(())
    }

    #[test]
    fn column_sort_is_stable() -> Result<()> {
        let dir = tempdir()?;
        let input = dir.path().join("in.csv");
        let output = dir.path().join("out.csv");
        unsorted_table(&input)?;

        sort(&input, &output, SortKey::Columns(&["location_key"]), 3)?;
        assert_eq!(
            read_lines(&output)?[1..],
            [
                "AD,2020-01-02,1",
                "AD,2020-01-01,2",
                "AD_01,2020-01-01,5",
                "US,2020-01-01,7",
                "US,2020-01-02,6",
                "US_FL,2020-01-02,3",
                "US_FL,2020-01-01,4",
            ]
        );
        Ok(())
    }
}
