// src/mirror/mod.rs
//
// CSV -> JSON mirror of a published tree. Best effort: a table that cannot be
// converted is logged and reported, never fatal, and never leaves a partial file.

use anyhow::{anyhow, bail, Context, Result};
use rayon::{prelude::*, ThreadPoolBuilder};
use serde_json::{Map, Number, Value};
use std::{
    fs,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};
use tempfile::NamedTempFile;
use tracing::{error, info, instrument};
use walkdir::WalkDir;

use crate::{
    config::{ColumnType, PublishConfig},
    progress::Progress,
    table::{open_reader, read_header},
};

const STAGE: &str = "mirror";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorOutcome {
    Converted { source: PathBuf, output: PathBuf },
    Failed { source: PathBuf, reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MirrorReport {
    pub outcomes: Vec<MirrorOutcome>,
}

impl MirrorReport {
    pub fn converted(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, MirrorOutcome::Converted { .. }))
            .count()
    }

    pub fn failures(&self) -> impl Iterator<Item = (&Path, &str)> {
        self.outcomes.iter().filter_map(|o| match o {
            MirrorOutcome::Failed { source, reason } => Some((source.as_path(), reason.as_str())),
            MirrorOutcome::Converted { .. } => None,
        })
    }
}

/// Coerce one cell to its declared type. Empty cells are `null`.
pub fn coerce(value: &str, ty: ColumnType) -> Result<Value> {
    if value.is_empty() {
        return Ok(Value::Null);
    }
    Ok(match ty {
        ColumnType::String => Value::String(value.to_string()),
        ColumnType::Integer => match value.parse::<i64>() {
            Ok(i) => Value::Number(i.into()),
            Err(_) => {
                // integers are sometimes serialized with a trailing `.0`
                let f: f64 = value
                    .parse()
                    .map_err(|_| anyhow!("`{value}` is not an integer"))?;
                if f.fract() != 0.0 {
                    bail!("`{value}` is not an integer");
                }
                // `as` saturates, so reject anything outside i64 first
                if !(f >= i64::MIN as f64 && f < i64::MAX as f64) {
                    bail!("`{value}` is out of range for an integer");
                }
                Value::Number((f as i64).into())
            }
        },
        ColumnType::Float => {
            let f: f64 = value
                .parse()
                .map_err(|_| anyhow!("`{value}` is not a number"))?;
            Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
        }
        ColumnType::Boolean => match value.to_ascii_lowercase().as_str() {
            "true" | "1" => Value::Bool(true),
            "false" | "0" => Value::Bool(false),
            _ => bail!("`{value}` is not a boolean"),
        },
    })
}

/// Every CSV file under `root`, skipping hidden entries.
fn csv_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let walker = WalkDir::new(root).sort_by_file_name().into_iter().filter_entry(|e| {
        e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.')
    });
    for entry in walker {
        let entry = entry.with_context(|| format!("walking {}", root.display()))?;
        let path = entry.path();
        if entry.file_type().is_file() && path.extension().map_or(false, |ext| ext == "csv") {
            files.push(path.to_path_buf());
        }
    }
    Ok(files)
}

/// Convert one table into a JSON array of row objects at `output`.
pub fn convert_table(source: &Path, output: &Path, config: &PublishConfig) -> Result<()> {
    let mut reader = open_reader(source)?;
    let header = read_header(&mut reader, source)?;
    let types: Vec<ColumnType> = header.iter().map(|c| config.column_type(c)).collect();

    let dir = output
        .parent()
        .with_context(|| format!("{} has no parent directory", output.display()))?;
    fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let tmp = NamedTempFile::new_in(dir)
        .with_context(|| format!("creating temp file in {}", dir.display()))?;

    {
        let mut writer = BufWriter::new(tmp.as_file());
        writer.write_all(b"[")?;
        for (row, record) in reader.records().enumerate() {
            let record = record.with_context(|| format!("reading {}", source.display()))?;
            let mut object = Map::with_capacity(header.len());
            for ((column, value), ty) in header.iter().zip(record.iter()).zip(&types) {
                let value = coerce(value, *ty)
                    .with_context(|| format!("row {} column `{}`", row + 1, column))?;
                object.insert(column.to_string(), value);
            }
            if row > 0 {
                writer.write_all(b",")?;
            }
            serde_json::to_writer(&mut writer, &object)?;
        }
        writer.write_all(b"]")?;
        writer.flush()?;
    }

    tmp.persist(output)
        .with_context(|| format!("persisting {}", output.display()))?;
    Ok(())
}

/// Mirror every `**/*.csv` under `csv_root` to `json_root/<same relative path>.json`.
///
/// Never fails as a whole: each table's result is returned in the report and failures
/// are logged.
#[instrument(level = "info", skip(config, progress))]
pub fn convert_tables_to_json(
    csv_root: &Path,
    json_root: &Path,
    config: &PublishConfig,
    workers: usize,
    progress: &dyn Progress,
) -> MirrorReport {
    let files = match csv_files(csv_root) {
        Ok(files) => files,
        Err(e) => {
            error!(
                root = %csv_root.display(),
                error = %format!("{e:#}"),
                "cannot list tables to mirror"
            );
            return MirrorReport::default();
        }
    };

    let pool = match ThreadPoolBuilder::new()
        .num_threads(workers.max(1))
        .thread_name(|i| format!("mirror-{i}"))
        .build()
    {
        Ok(pool) => pool,
        Err(e) => {
            error!(error = %e, "cannot build mirror worker pool");
            return MirrorReport::default();
        }
    };

    progress.start(STAGE, files.len());
    let outcomes: Vec<MirrorOutcome> = pool.install(|| {
        files
            .par_iter()
            .map(|source| {
                let relative = source.strip_prefix(csv_root).unwrap_or(source.as_path());
                let output = json_root.join(relative).with_extension("json");
                let outcome = match convert_table(source, &output, config) {
                    Ok(()) => MirrorOutcome::Converted {
                        source: source.clone(),
                        output,
                    },
                    Err(e) => {
                        let reason = format!("{e:#}");
                        error!(
                            table = %source.display(),
                            error = %reason,
                            "mirror conversion failed"
                        );
                        MirrorOutcome::Failed {
                            source: source.clone(),
                            reason,
                        }
                    }
                };
                progress.advance(STAGE, &relative.to_string_lossy());
                outcome
            })
            .collect()
    });
    progress.finish(STAGE);

    let report = MirrorReport { outcomes };
    info!(
        converted = report.converted(),
        failed = report.outcomes.len() - report.converted(),
        "mirror complete"
    );
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{progress::NoProgress, table::test_util::write_table};
    use tempfile::tempdir;

    #[test]
    fn coerce_follows_column_types() -> Result<()> {
        assert_eq!(coerce("", ColumnType::Integer)?, Value::Null);
        assert_eq!(coerce("42", ColumnType::Integer)?, Value::from(42));
        assert_eq!(coerce("42.0", ColumnType::Integer)?, Value::from(42));
        assert!(coerce("4.2", ColumnType::Integer).is_err());
        assert!(coerce("1e20", ColumnType::Integer).is_err());
        assert!(coerce("-1e20", ColumnType::Integer).is_err());
        assert_eq!(coerce("1e3", ColumnType::Integer)?, Value::from(1000));
        assert_eq!(coerce("1.5", ColumnType::Float)?, Value::from(1.5));
        assert_eq!(coerce("TRUE", ColumnType::Boolean)?, Value::Bool(true));
        assert_eq!(coerce("007", ColumnType::String)?, Value::from("007"));
        Ok(())
    }

    #[test]
    fn mirrors_tree_and_isolates_bad_tables() -> Result<()> {
        let dir = tempdir()?;
        let root = dir.path();
        write_table(
            &root.join("cases.csv"),
            &["location_key,date,new_confirmed", "AD,2020-03-02,1", "AD,2020-03-03,"],
        )?;
        write_table(
            &root.join("AD").join("main.csv"),
            &["location_key,population", "AD,77543"],
        )?;
        // ragged row
        write_table(&root.join("broken.csv"), &["location_key,population", "AD,1,2"])?;
        // bad integer
        write_table(&root.join("typed.csv"), &["location_key,population", "AD,many"])?;
        write_table(&root.join(".cache").join("skip.csv"), &["a", "1"])?;

        let config = PublishConfig::default();
        let report = convert_tables_to_json(root, root, &config, 2, &NoProgress);
        assert_eq!(report.converted(), 2);
        let mut failed: Vec<_> = report.failures().map(|(p, _)| p.to_path_buf()).collect();
        failed.sort();
        assert_eq!(failed, vec![root.join("broken.csv"), root.join("typed.csv")]);

        assert!(!root.join("broken.json").exists());
        assert!(!root.join("typed.json").exists());
        assert!(!root.join(".cache").join("skip.json").exists());

        let cases: Value = serde_json::from_str(&fs::read_to_string(root.join("cases.json"))?)?;
        assert_eq!(
            cases,
            serde_json::json!([
                {"location_key": "AD", "date": "2020-03-02", "new_confirmed": 1},
                {"location_key": "AD", "date": "2020-03-03", "new_confirmed": null},
            ])
        );
        let main: Value =
            serde_json::from_str(&fs::read_to_string(root.join("AD").join("main.json"))?)?;
        assert_eq!(main, serde_json::json!([{"location_key": "AD", "population": 77543}]));

        // only the converted files and their sources remain
        let leftovers = fs::read_dir(root)?
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
        Ok(())
    }
}
