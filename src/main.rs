use anyhow::Result;
use clap::Parser;
use opendata_publish::{
    publish::{publish, PublishOptions},
    LogProgress, NoProgress, Progress, PublishConfig, SchemaVersion, Strategy,
};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(author, about = "Publish the per-topic tables as a denormalized dataset")]
struct Args {
    /// Folder holding the input tables, `index.csv` included.
    #[arg(long, default_value = "./tables")]
    tables_folder: PathBuf,
    /// Publish root; output goes to `<output-folder>/<version>/`.
    #[arg(long, default_value = "./output")]
    output_folder: PathBuf,
    #[arg(long = "version", value_enum, default_value_t = SchemaVersion::V3)]
    schema_version: SchemaVersion,
    /// How the v2 global main table is built.
    #[arg(long, value_enum, default_value_t = Strategy::Direct)]
    strategy: Strategy,
    /// YAML file overriding the built-in configuration.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Also mirror every published table as JSON.
    #[arg(long)]
    json: bool,
    #[arg(long)]
    no_progress: bool,
    /// Log the elapsed time of every stage.
    #[arg(long)]
    profile: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // ─── 1) init logging ─────────────────────────────────────────────
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let span_events = if args.profile {
        fmt::format::FmtSpan::CLOSE
    } else {
        fmt::format::FmtSpan::NONE
    };
    fmt::Subscriber::builder()
        .with_env_filter(env)
        .with_span_events(span_events)
        .init();

    // ─── 2) configuration ────────────────────────────────────────────
    let config = PublishConfig::load(args.config.as_deref())?;
    let mut options = PublishOptions::new(
        &args.tables_folder,
        &args.output_folder,
        args.schema_version,
    );
    options.strategy = args.strategy;
    options.json = args.json;
    options.config = config;
    if args.schema_version == SchemaVersion::V3 && args.strategy != Strategy::Direct {
        warn!("--strategy only applies to v2, ignoring it");
    }
    info!(
        tables = %args.tables_folder.display(),
        output = %options.output_dir().display(),
        version = args.schema_version.as_str(),
        "startup"
    );

    // ─── 3) publish ──────────────────────────────────────────────────
    let progress: Box<dyn Progress> = if args.no_progress {
        Box::new(NoProgress)
    } else {
        Box::new(LogProgress::new())
    };
    let report = publish(&options, progress.as_ref())?;

    for stage in &report.stages {
        for (item, reason) in &stage.failures {
            warn!(stage = %stage.stage, item = %item, reason = %reason, "stage task failed");
        }
    }
    if let Some(mirror) = &report.mirror {
        let failed = mirror.failures().count();
        if failed > 0 {
            warn!(failed, converted = mirror.converted(), "some tables were not mirrored");
        }
    }
    info!(output = %report.output_dir.display(), "done");
    Ok(())
}
