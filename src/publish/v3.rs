use anyhow::Result;
use tracing::{info, instrument};

use super::{mirror_stage, publish_global_tables, wipe_output, PublishOptions, PublishReport};
use crate::{
    build::{index_table, INDEX_TABLE},
    progress::Progress,
    slice::{latest_subsets, publish_location_aggregates, publish_location_breakouts},
};

/// v3 layout: adapted and sorted global tables, `latest/` per table, and per location
/// the breakout of every table plus its own `main.csv`.
#[instrument(level = "info", skip_all, fields(version = "v3"))]
pub fn main_v3(options: &PublishOptions, progress: &dyn Progress) -> Result<PublishReport> {
    index_table(&options.tables_dir)?;
    let out = options.output_dir();
    let key = options.key_column();
    let config = &options.config;
    let mut report = PublishReport::new(options);

    wipe_output(&out)?;
    let tables = publish_global_tables(
        &options.tables_dir,
        &out,
        &config.column_adapter,
        key,
        config.workers.latest,
        config.sort_chunk_rows,
        progress,
    )?;

    report.stages.push(latest_subsets(
        &tables,
        &out.join("latest"),
        key,
        config.workers.latest,
        config.sort_chunk_rows,
        progress,
    )?);

    report.stages.push(publish_location_breakouts(
        &tables,
        &out,
        key,
        config.workers.latest,
        progress,
    )?);

    report.stages.push(publish_location_aggregates(
        &out,
        &out.join(INDEX_TABLE),
        &options.build_options(),
        config.workers.aggregate,
        config.aggregate_failures,
        progress,
    )?);

    mirror_stage(options, &mut report, progress);
    info!(output = %out.display(), "v3 publish complete");
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        build::test_util::{march_2020, row_set},
        config::SchemaVersion,
        progress::NoProgress,
        publish::{test_util::init_logging, PublishOptions},
        table::test_util::{read_lines, write_table},
    };
    use std::{fs, path::Path};
    use tempfile::tempdir;

    fn v3_inputs(dir: &Path) -> Result<()> {
        write_table(
            &dir.join("index.csv"),
            &[
                "key,country_name,subregion1_name",
                "US_FL_12001,United States of America,Florida",
                "AD,Andorra,",
            ],
        )?;
        write_table(
            &dir.join("epidemiology.csv"),
            &[
                "key,date,new_confirmed,total_confirmed",
                "US_FL_12001,2020-03-03,4,4",
                "AD,2020-03-04,2,3",
                "AD,2020-03-02,1,1",
            ],
        )?;
        write_table(
            &dir.join("demographics.csv"),
            &["key,population", "US_FL_12001,269043", "AD,77543"],
        )?;
        Ok(())
    }

    #[test]
    fn publishes_full_v3_tree() -> Result<()> {
        init_logging();
        let tables = tempdir()?;
        let out = tempdir()?;
        v3_inputs(tables.path())?;
        let v3 = out.path().join("v3");
        write_table(&v3.join("stale.csv"), &["key"])?;
        fs::write(v3.join(".keep"), "")?;

        let mut options = PublishOptions::new(tables.path(), out.path(), SchemaVersion::V3);
        options.date_range = march_2020();
        options.json = true;
        let report = main_v3(&options, &NoProgress)?;
        assert!(report.stages.iter().all(|s| s.is_clean()));

        assert!(!v3.join("stale.csv").exists());
        assert!(v3.join(".keep").exists());

        // adapted and sorted global tables
        assert_eq!(
            read_lines(&v3.join("epidemiology.csv"))?,
            vec![
                "location_key,date,new_confirmed,cumulative_confirmed",
                "AD,2020-03-02,1,1",
                "AD,2020-03-04,2,3",
                "US_FL_12001,2020-03-03,4,4",
            ]
        );
        assert_eq!(
            read_lines(&v3.join("index.csv"))?[1],
            "AD,Andorra,"
        );

        assert_eq!(
            read_lines(&v3.join("latest").join("epidemiology.csv"))?[1..],
            ["AD,2020-03-04,2,3", "US_FL_12001,2020-03-03,4,4"]
        );

        assert_eq!(
            read_lines(&v3.join("AD").join("epidemiology.csv"))?,
            vec![
                "location_key,date,new_confirmed,cumulative_confirmed",
                "AD,2020-03-02,1,1",
                "AD,2020-03-04,2,3",
            ]
        );

        // per-location main tables drop the columns empty for that location
        let ad_main = v3.join("AD").join("main.csv");
        let columns = crate::table::columns(&ad_main)?;
        assert!(!columns.iter().any(|c| c == "subregion1_name"));
        let rows = row_set(&ad_main)?;
        assert_eq!(rows.len(), 5);
        assert!(rows.iter().all(|r| r["population"] == "77543"));

        let fl_main = crate::table::columns(&v3.join("US_FL_12001").join("main.csv"))?;
        assert!(fl_main.iter().any(|c| c == "subregion1_name"));

        let mirror = report.mirror.expect("mirror enabled");
        assert_eq!(mirror.failures().count(), 0);
        assert!(v3.join("AD").join("main.json").exists());
        assert!(v3.join("latest").join("index.json").exists());
        Ok(())
    }
}
