// src/publish/mod.rs
//
// One publish run: the ordered stages of a schema generation, writing under
// `<output_root>/<version>/`.

pub mod output;
pub mod v2;
pub mod v3;

pub use output::{copy_tables, publish_global_tables, wipe_output};
pub use v2::main_v2;
pub use v3::main_v3;

use anyhow::Result;
use std::path::PathBuf;

use crate::{
    build::{BuildOptions, DateRange, MainTableSummary, Strategy},
    config::{PublishConfig, SchemaVersion},
    mirror::{convert_tables_to_json, MirrorReport},
    progress::Progress,
    stage::StageReport,
};

#[derive(Debug, Clone)]
pub struct PublishOptions {
    pub tables_dir: PathBuf,
    pub output_root: PathBuf,
    pub version: SchemaVersion,
    /// Builder of the global v2 main table.
    pub strategy: Strategy,
    /// Mirror every published CSV as JSON.
    pub json: bool,
    pub date_range: DateRange,
    pub config: PublishConfig,
}

impl PublishOptions {
    pub fn new(
        tables_dir: impl Into<PathBuf>,
        output_root: impl Into<PathBuf>,
        version: SchemaVersion,
    ) -> Self {
        Self {
            tables_dir: tables_dir.into(),
            output_root: output_root.into(),
            version,
            strategy: Strategy::default(),
            json: false,
            date_range: DateRange::publish_default(),
            config: PublishConfig::default(),
        }
    }

    pub fn output_dir(&self) -> PathBuf {
        self.output_root.join(self.version.as_str())
    }

    pub fn key_column(&self) -> &'static str {
        self.version.key_column()
    }

    pub(crate) fn build_options(&self) -> BuildOptions {
        BuildOptions::new(self.key_column())
            .with_date_range(self.date_range)
            .with_exclude(self.config.exclude_from_main_table.clone())
            .with_sort_chunk_rows(self.config.sort_chunk_rows)
    }
}

#[derive(Debug, Clone)]
pub struct PublishReport {
    pub version: SchemaVersion,
    pub output_dir: PathBuf,
    /// Global main table, v2 only.
    pub main: Option<MainTableSummary>,
    pub stages: Vec<StageReport>,
    /// Number of per-key files written by the partitioner, v2 only.
    pub partitions: usize,
    pub mirror: Option<MirrorReport>,
}

impl PublishReport {
    fn new(options: &PublishOptions) -> Self {
        Self {
            version: options.version,
            output_dir: options.output_dir(),
            main: None,
            stages: Vec::new(),
            partitions: 0,
            mirror: None,
        }
    }
}

/// Run the publish pipeline of `options.version`.
pub fn publish(options: &PublishOptions, progress: &dyn Progress) -> Result<PublishReport> {
    match options.version {
        SchemaVersion::V2 => main_v2(options, progress),
        SchemaVersion::V3 => main_v3(options, progress),
    }
}

/// Last stage of both generations.
fn mirror_stage(
    options: &PublishOptions,
    report: &mut PublishReport,
    progress: &dyn Progress,
) {
    if options.json {
        let out = options.output_dir();
        report.mirror = Some(convert_tables_to_json(
            &out,
            &out,
            &options.config,
            options.config.workers.mirror,
            progress,
        ));
    }
}
