use anyhow::Result;
use std::{
    collections::HashSet,
    path::{Path, PathBuf},
};
use tracing::{debug, instrument, warn};

use crate::{
    build::{BufferedJoin, BuildOptions, MainTableBuilder},
    config::FailurePolicy,
    progress::Progress,
    stage::{run_stage, StageReport},
    table::{self, breakout, is_safe_key},
};

/// Split every table into `<output_dir>/<key>/<table>.csv`. Must complete before
/// `publish_location_aggregates` reads the per-key folders.
#[instrument(level = "info", skip(tables, progress), fields(tables = tables.len()))]
pub fn publish_location_breakouts(
    tables: &[PathBuf],
    output_dir: &Path,
    key_column: &str,
    workers: usize,
    progress: &dyn Progress,
) -> Result<StageReport> {
    run_stage(
        "breakout",
        tables,
        workers,
        FailurePolicy::FailFast,
        progress,
        |path| table::table_name(path),
        |path| {
            let files = breakout(path, output_dir, key_column)?;
            debug!(table = %path.display(), files = files.len(), "broke out table");
            Ok(())
        },
    )
}

/// Build `<output_dir>/<key>/main.csv` for every key of `index` from the tables broken
/// out into that key's folder. Columns empty for the location are dropped.
#[instrument(level = "info", skip(options, progress))]
pub fn publish_location_aggregates(
    output_dir: &Path,
    index: &Path,
    options: &BuildOptions,
    workers: usize,
    policy: FailurePolicy,
    progress: &dyn Progress,
) -> Result<StageReport> {
    let mut seen = HashSet::new();
    let mut unusable = 0usize;
    let keys: Vec<String> = table::read_column(index, &options.key_column)?
        .into_iter()
        .filter(|k| {
            if !is_safe_key(k) {
                unusable += 1;
                return false;
            }
            seen.insert(k.clone())
        })
        .collect();
    if unusable > 0 {
        warn!(
            unusable,
            index = %index.display(),
            "index keys that are not folder names were skipped"
        );
    }

    let options = options.clone().with_drop_empty_columns(true);
    let builder = BufferedJoin;
    run_stage(
        "aggregate",
        &keys,
        workers,
        policy,
        progress,
        |key| key.clone(),
        |key| {
            let folder = output_dir.join(key);
            builder.build(&folder, &folder.join("main.csv"), &options)?;
            Ok(())
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        build::test_util::{march_2020, row_set},
        progress::NoProgress,
        table::test_util::write_table,
    };
    use tempfile::tempdir;

    fn write_inputs(dir: &Path) -> Result<Vec<PathBuf>> {
        let index = dir.join("index.csv");
        let cases = dir.join("cases.csv");
        let health = dir.join("health.csv");
        write_table(&index, &["location_key,name", "AD,Andorra", "US,United States"])?;
        write_table(
            &cases,
            &["location_key,date,new_confirmed", "AD,2020-03-02,1", "US,2020-03-03,4"],
        )?;
        write_table(&health, &["location_key,life_expectancy", "US,78.5"])?;
        Ok(vec![cases, health, index])
    }

    #[test]
    fn aggregates_each_location_from_its_breakouts() -> Result<()> {
        let inputs = tempdir()?;
        let out = tempdir()?;
        let tables = write_inputs(inputs.path())?;

        publish_location_breakouts(&tables, out.path(), "location_key", 2, &NoProgress)?;
        assert!(out.path().join("US").join("health.csv").exists());
        assert!(!out.path().join("AD").join("health.csv").exists());

        let options = BuildOptions::new("location_key").with_date_range(march_2020());
        let report = publish_location_aggregates(
            out.path(),
            &inputs.path().join("index.csv"),
            &options,
            2,
            FailurePolicy::FailFast,
            &NoProgress,
        )?;
        assert_eq!(report.succeeded, 2);

        let ad = row_set(&out.path().join("AD").join("main.csv"))?;
        assert_eq!(ad.len(), 5);
        assert!(ad.iter().all(|row| row["location_key"] == "AD" && row["name"] == "Andorra"));
        assert!(ad.iter().any(|row| row["new_confirmed"] == "1"));

        let us = row_set(&out.path().join("US").join("main.csv"))?;
        assert!(us.iter().all(|row| row["life_expectancy"] == "78.5"));
        Ok(())
    }

    #[test]
    fn index_keys_that_are_not_folder_names_are_skipped() -> Result<()> {
        let inputs = tempdir()?;
        let out = tempdir()?;
        let tables = write_inputs(inputs.path())?;
        publish_location_breakouts(&tables, out.path(), "location_key", 1, &NoProgress)?;

        let index = inputs.path().join("index.csv");
        write_table(
            &index,
            &["location_key,name", "AD,Andorra", "..,Parent", "../US,Escaped"],
        )?;
        let options = BuildOptions::new("location_key").with_date_range(march_2020());
        let report = publish_location_aggregates(
            out.path(),
            &index,
            &options,
            1,
            FailurePolicy::FailFast,
            &NoProgress,
        )?;
        assert_eq!(report.succeeded, 1);
        assert!(report.failures.is_empty());
        Ok(())
    }

    #[test]
    fn isolated_failures_are_reported_per_location() -> Result<()> {
        let inputs = tempdir()?;
        let out = tempdir()?;
        let tables = write_inputs(inputs.path())?;
        publish_location_breakouts(&tables, out.path(), "location_key", 1, &NoProgress)?;
        // a location whose folder lost its index table cannot be aggregated
        std::fs::remove_file(out.path().join("US").join("index.csv"))?;

        let options = BuildOptions::new("location_key").with_date_range(march_2020());
        let index = inputs.path().join("index.csv");
        let report = publish_location_aggregates(
            out.path(),
            &index,
            &options,
            2,
            FailurePolicy::Isolate,
            &NoProgress,
        )?;
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, "US");

        let fail_fast = publish_location_aggregates(
            out.path(),
            &index,
            &options,
            2,
            FailurePolicy::FailFast,
            &NoProgress,
        );
        assert!(fail_fast.is_err());
        Ok(())
    }
}
