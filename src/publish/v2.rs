use anyhow::Result;
use tracing::{info, instrument};

use super::{copy_tables, mirror_stage, wipe_output, PublishOptions, PublishReport};
use crate::{
    build::index_table,
    progress::Progress,
    slice::{latest_subsets, partition_by_key},
    table::list_tables,
};

/// v2 layout: the input tables as they are, the global `main.csv`, `latest/` for every
/// table including main, and `<key>/main.csv` per key.
#[instrument(level = "info", skip_all, fields(version = "v2"))]
pub fn main_v2(options: &PublishOptions, progress: &dyn Progress) -> Result<PublishReport> {
    index_table(&options.tables_dir)?;
    let out = options.output_dir();
    let key = options.key_column();
    let mut report = PublishReport::new(options);

    wipe_output(&out)?;
    copy_tables(&options.tables_dir, &out)?;

    let main = out.join("main.csv");
    let builder = options.strategy.builder();
    report.main = Some(builder.build(&options.tables_dir, &main, &options.build_options())?);

    let tables = list_tables(&out)?;
    report.stages.push(latest_subsets(
        &tables,
        &out.join("latest"),
        key,
        options.config.workers.latest,
        options.config.sort_chunk_rows,
        progress,
    )?);

    report.partitions = partition_by_key(&main, &out, key, progress)?.len();

    mirror_stage(options, &mut report, progress);
    info!(output = %out.display(), "v2 publish complete");
    Ok(report)
}
