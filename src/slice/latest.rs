use anyhow::{Context, Result};
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::instrument;

use crate::{
    config::FailurePolicy,
    progress::Progress,
    stage::{run_stage, StageReport},
    table::{self, group_tail, sort, SortKey, DATE_COLUMN},
};

/// Write `<output_dir>/<table>.csv` holding the most recent row of every key of each table.
///
/// Tables are ordered by `(key, date)` first, so the input does not need to be sorted.
/// Any failing table aborts the stage.
#[instrument(level = "info", skip(tables, progress), fields(tables = tables.len()))]
pub fn latest_subsets(
    tables: &[PathBuf],
    output_dir: &Path,
    key_column: &str,
    workers: usize,
    sort_chunk_rows: usize,
    progress: &dyn Progress,
) -> Result<StageReport> {
    fs::create_dir_all(output_dir)
        .with_context(|| format!("creating {}", output_dir.display()))?;

    run_stage(
        "latest",
        tables,
        workers,
        FailurePolicy::FailFast,
        progress,
        |path| table::table_name(path),
        |path| latest_subset(path, output_dir, key_column, sort_chunk_rows),
    )
}

fn latest_subset(
    path: &Path,
    output_dir: &Path,
    key_column: &str,
    sort_chunk_rows: usize,
) -> Result<()> {
    let file_name = path
        .file_name()
        .with_context(|| format!("table path {} has no file name", path.display()))?;

    let by: Vec<&str> = if table::is_dated(path)? {
        vec![key_column, DATE_COLUMN]
    } else {
        vec![key_column]
    };
    let sorted = tempfile::Builder::new()
        .prefix(".latest-")
        .suffix(".csv")
        .tempfile_in(output_dir)?;
    sort(path, sorted.path(), SortKey::Columns(&by), sort_chunk_rows)?;
    group_tail(sorted.path(), &output_dir.join(file_name), key_column)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        progress::NoProgress,
        table::test_util::{read_lines, write_table},
    };
    use tempfile::tempdir;

    #[test]
    fn latest_row_has_the_max_date_of_each_key() -> Result<()> {
        let dir = tempdir()?;
        let cases = dir.path().join("cases.csv");
        let index = dir.path().join("index.csv");
        write_table(
            &cases,
            &[
                "location_key,date,new_confirmed",
                "US,2020-01-03,7",
                "AD,2020-01-02,2",
                "US,2020-01-01,5",
                "AD,2020-01-01,1",
            ],
        )?;
        write_table(&index, &["location_key,name", "US,United States", "AD,Andorra"])?;

        let out = dir.path().join("latest");
        let report = latest_subsets(
            &[cases, index],
            &out,
            "location_key",
            2,
            1_000,
            &NoProgress,
        )?;
        assert_eq!(report.succeeded, 2);
        assert_eq!(
            read_lines(&out.join("cases.csv"))?,
            vec![
                "location_key,date,new_confirmed",
                "AD,2020-01-02,2",
                "US,2020-01-03,7",
            ]
        );
        assert_eq!(
            read_lines(&out.join("index.csv"))?,
            vec!["location_key,name", "AD,Andorra", "US,United States"]
        );
        // the sort scratch files are gone
        assert_eq!(fs::read_dir(&out)?.count(), 2);
        Ok(())
    }

    #[test]
    fn table_without_key_fails_the_stage() -> Result<()> {
        let dir = tempdir()?;
        let bad = dir.path().join("bad.csv");
        write_table(&bad, &["name", "x"])?;
        let result = latest_subsets(
            &[bad],
            &dir.path().join("latest"),
            "location_key",
            1,
            1_000,
            &NoProgress,
        );
        assert!(result.is_err());
        Ok(())
    }
}
