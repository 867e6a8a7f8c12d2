//! cur-exporter - Export AWS Cost and Usage Reports as Prometheus metrics

use clap::Parser;
use cur_exporter::{
    cli::Cli,
    config::ExporterConfig,
    exporter_metrics::ExporterMetrics,
    metrics::{builtin_definitions, load_definitions},
    orchestrator::Exporter,
    server,
    state::{ExporterState, StateFile},
};
use cur_exporter_core::bucket::ReportBucket;
use cur_exporter_core::error::{ExporterError, Result};
use cur_exporter_source::{LocalBucket, S3Bucket};
use cur_exporter_store::RecordStore;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Load persisted state, starting over on corruption only when allowed
async fn load_state(config: &ExporterConfig, reset_corrupt_state: bool) -> Result<ExporterState> {
    let state_file = StateFile::new(&config.state_path);
    match state_file.load().await {
        Ok(state) => Ok(state),
        Err(ExporterError::CorruptState { path, reason }) if reset_corrupt_state => {
            warn!(
                "State file {} is corrupt ({}), starting from an empty state",
                path.display(),
                reason
            );
            state_file.remove().await?;
            Ok(ExporterState::default())
        }
        Err(e) => Err(e),
    }
}

async fn connect_bucket(cli: &Cli) -> Result<Arc<dyn ReportBucket>> {
    match &cli.source_dir {
        Some(dir) => {
            info!("Reading reports from local mirror {}", dir.display());
            Ok(Arc::new(LocalBucket::new(dir)))
        }
        None => {
            info!("Reading reports from s3://{}", cli.bucket);
            Ok(Arc::new(S3Bucket::connect(cli.s3_config()).await?))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging. --verbose and --quiet override RUST_LOG.
    let filter = if cli.quiet {
        tracing_subscriber::EnvFilter::new("warn")
    } else if cli.verbose {
        tracing_subscriber::EnvFilter::new("cur_exporter=debug,cur_exporter_core=debug,cur_exporter_source=debug,cur_exporter_store=debug")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::new(
                "cur_exporter=info,cur_exporter_source=info,cur_exporter_store=info",
            )
        })
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = cli.exporter_config()?;
    let server_config = cli.server_config()?;

    let definitions = match &config.queries_path {
        Some(path) => load_definitions(path)?,
        None => builtin_definitions(),
    };

    let state = load_state(&config, cli.reset_corrupt_state).await?;
    let store = RecordStore::open(&config.database_path)?;
    let bucket = connect_bucket(&cli).await?;

    let mut exporter = Exporter::new(config, bucket, store, state, definitions)?;
    if !cli.disable_exporter_metrics {
        exporter = exporter.with_exporter_metrics(ExporterMetrics::new()?);
    }

    if let Err(e) = exporter.prime().await {
        warn!("Initial sync failed, retrying on the next scrape: {}", e);
    }

    server::serve(Arc::new(Mutex::new(exporter)), &server_config).await
}
