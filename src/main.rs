use anyhow::Result;
use buildforge::builder::{Builder, BuilderSettings};
use buildforge::constants;
use buildforge::logging::init_logging;
use buildforge::registry::{BuilderCleaner, BuilderRegistry};
use buildforge::sources::HttpSourceClient;
use buildforge::strategy::{ShellCommandLine, WorkDirResultExtractor};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Build task execution engine
#[derive(Parser, Debug)]
#[command(name = "buildforge", version, about)]
struct Cli {
    /// Base directory holding every builder's repository tree
    #[arg(long, env = "BUILDFORGE_REPOSITORY_DIR", default_value = ".buildforge")]
    repository_dir: PathBuf,

    /// Name of the builder instance to expose
    #[arg(long, env = "BUILDFORGE_BUILDER_NAME", default_value = "default")]
    builder_name: String,

    /// Worker count; defaults to the logical CPU count
    #[arg(long, env = "BUILDFORGE_WORKERS")]
    workers: Option<usize>,

    /// Bounded queue size beyond the workers
    #[arg(long, env = "BUILDFORGE_QUEUE_SIZE", default_value_t = constants::DEFAULT_QUEUE_SIZE)]
    queue_size: usize,

    /// Seconds a finished task stays queryable before eviction
    #[arg(long, env = "BUILDFORGE_KEEP_RESULT_SECS", default_value_t = constants::DEFAULT_KEEP_RESULT_SECS)]
    keep_result_secs: u64,

    /// Seconds a task may wait in the queue before cancellation
    #[arg(long, env = "BUILDFORGE_MAX_QUEUE_SECS", default_value_t = constants::DEFAULT_MAX_QUEUE_TIME_SECS)]
    max_queue_secs: u64,

    /// Days an untouched sources cache survives before eviction
    #[arg(long, env = "BUILDFORGE_SOURCES_RETENTION_DAYS", default_value_t = constants::DEFAULT_SOURCES_RETENTION_DAYS)]
    sources_retention_days: u64,

    /// Emit JSON logs instead of pretty console output
    #[arg(long, env = "BUILDFORGE_JSON_LOGS")]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.json_logs).map_err(|e| anyhow::anyhow!("logging setup failed: {}", e))?;

    let mut settings = BuilderSettings {
        queue_size: cli.queue_size,
        keep_result_time: Duration::from_secs(cli.keep_result_secs),
        max_queue_time: Duration::from_secs(cli.max_queue_secs),
        sources_retention: Duration::from_secs(cli.sources_retention_days * 24 * 3600),
        ..BuilderSettings::default()
    };
    if let Some(workers) = cli.workers {
        settings.workers = workers.max(1);
    }

    let builder = Builder::new(
        &cli.builder_name,
        &cli.repository_dir,
        settings,
        Arc::new(ShellCommandLine),
        Arc::new(WorkDirResultExtractor::default()),
        Arc::new(HttpSourceClient::new()),
    );
    builder.start()?;

    let registry = Arc::new(BuilderRegistry::new());
    registry.add(builder);

    let cleaner = BuilderCleaner::new(
        registry.clone(),
        Duration::from_secs(constants::CLEANER_INTERVAL_SECS),
    );
    cleaner.start();

    tracing::info!(
        builder = %cli.builder_name,
        repository = %cli.repository_dir.display(),
        "engine ready, press ctrl-c to stop"
    );
    tokio::signal::ctrl_c().await?;

    tracing::info!("shutting down");
    cleaner.shutdown().await;
    Ok(())
}
