//! Command line interface for cur-exporter
//!
//! Every flag can also be set through a `CUR_EXPORTER_*` environment
//! variable, which is how the exporter is usually configured in a container.
//!
//! # Example
//!
//! ```bash
//! # Export the "daily" report from a bucket
//! cur-exporter --bucket my-billing-bucket --report daily
//!
//! # Read a local mirror instead of S3, keep six months
//! cur-exporter --bucket my-billing-bucket --report daily \
//!     --source-dir ./mirror --retained-periods 6
//! ```

use crate::config::{DEFAULT_DATABASE_PATH, DEFAULT_STATE_PATH, ExporterConfig, SyncPolicy};
use crate::server::{DEFAULT_LISTEN_ADDRESS, DEFAULT_METRICS_PATH, ServerConfig};
use clap::Parser;
use cur_exporter_core::error::Result;
use cur_exporter_core::manifest::ReportSource;
use cur_exporter_source::S3Config;
use std::path::PathBuf;
use std::time::Duration;

/// Export AWS Cost and Usage Reports as Prometheus metrics
#[derive(Parser, Debug, Clone)]
#[command(name = "cur-exporter")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Bucket the reports are delivered to
    #[arg(long, env = "CUR_EXPORTER_BUCKET")]
    pub bucket: String,

    /// Report name
    #[arg(long, env = "CUR_EXPORTER_REPORT")]
    pub report: String,

    /// Report path prefix inside the bucket
    #[arg(long, env = "CUR_EXPORTER_REPORT_PREFIX", default_value = "")]
    pub report_prefix: String,

    /// AWS region of the bucket
    #[arg(long, env = "CUR_EXPORTER_REGION")]
    pub region: Option<String>,

    /// Endpoint override for S3-compatible stores
    #[arg(long, env = "CUR_EXPORTER_ENDPOINT_URL")]
    pub endpoint_url: Option<String>,

    /// Role to assume before reading the bucket
    #[arg(long, env = "CUR_EXPORTER_ASSUME_ROLE_ARN")]
    pub assume_role_arn: Option<String>,

    /// Read reports from a local mirror of the bucket instead of S3
    #[arg(long, env = "CUR_EXPORTER_SOURCE_DIR")]
    pub source_dir: Option<PathBuf>,

    /// SQLite record store
    #[arg(long, env = "CUR_EXPORTER_DATABASE", default_value = DEFAULT_DATABASE_PATH)]
    pub database: PathBuf,

    /// Persisted state file
    #[arg(long, env = "CUR_EXPORTER_STATE_PATH", default_value = DEFAULT_STATE_PATH)]
    pub state_path: PathBuf,

    /// JSON file of aggregation definitions (built-in set when omitted)
    #[arg(long, env = "CUR_EXPORTER_QUERIES")]
    pub queries: Option<PathBuf>,

    /// Address to listen on
    #[arg(long, env = "CUR_EXPORTER_LISTEN_ADDRESS", default_value = DEFAULT_LISTEN_ADDRESS)]
    pub listen_address: String,

    /// Path metrics are exposed on
    #[arg(long, env = "CUR_EXPORTER_METRICS_PATH", default_value = DEFAULT_METRICS_PATH)]
    pub metrics_path: String,

    /// Do not export metrics about the exporter itself
    #[arg(long, env = "CUR_EXPORTER_DISABLE_EXPORTER_METRICS")]
    pub disable_exporter_metrics: bool,

    /// Number of most recent billing periods to keep
    #[arg(long, env = "CUR_EXPORTER_RETAINED_PERIODS", default_value_t = 3)]
    pub retained_periods: usize,

    /// Hours after a period ends before the period list is refreshed
    #[arg(long, env = "CUR_EXPORTER_PAST_DUE_GRACE_HOURS", default_value_t = 0)]
    pub past_due_grace_hours: u32,

    /// Timeout for listing and manifest requests, in seconds
    #[arg(long, env = "CUR_EXPORTER_METADATA_TIMEOUT_SECS", default_value_t = 30)]
    pub metadata_timeout_secs: u64,

    /// Timeout for a whole report ingestion, in seconds
    #[arg(long, env = "CUR_EXPORTER_TRANSFER_TIMEOUT_SECS", default_value_t = 900)]
    pub transfer_timeout_secs: u64,

    /// Records written to the store per batch
    #[arg(long, env = "CUR_EXPORTER_BATCH_SIZE", default_value_t = 1000)]
    pub batch_size: usize,

    /// Serve the last published metrics when a scrape fails
    #[arg(long, env = "CUR_EXPORTER_SERVE_STALE_ON_ERROR")]
    pub serve_stale_on_error: bool,

    /// Start from an empty state if the state file is corrupt
    #[arg(long, env = "CUR_EXPORTER_RESET_CORRUPT_STATE")]
    pub reset_corrupt_state: bool,

    /// Log debug output
    #[arg(long, short = 'v', conflicts_with = "quiet")]
    pub verbose: bool,

    /// Only log warnings and errors
    #[arg(long, short = 'q')]
    pub quiet: bool,
}

impl Cli {
    /// Pipeline configuration
    pub fn exporter_config(&self) -> Result<ExporterConfig> {
        let config = ExporterConfig {
            source: ReportSource::new(&self.bucket, &self.report).with_prefix(&self.report_prefix),
            database_path: self.database.clone(),
            state_path: self.state_path.clone(),
            queries_path: self.queries.clone(),
            policy: SyncPolicy {
                retained_periods: self.retained_periods,
                past_due_grace: chrono::Duration::hours(i64::from(self.past_due_grace_hours)),
                metadata_timeout: Duration::from_secs(self.metadata_timeout_secs),
                transfer_timeout: Duration::from_secs(self.transfer_timeout_secs),
                batch_size: self.batch_size,
            },
        };
        config.validate()?;
        Ok(config)
    }

    /// HTTP configuration
    pub fn server_config(&self) -> Result<ServerConfig> {
        let config = ServerConfig {
            listen_address: self.listen_address.clone(),
            metrics_path: self.metrics_path.clone(),
            serve_stale_on_error: self.serve_stale_on_error,
        };
        config.validate()?;
        Ok(config)
    }

    /// S3 connection settings
    pub fn s3_config(&self) -> S3Config {
        S3Config {
            bucket: self.bucket.clone(),
            region: self.region.clone(),
            endpoint_url: self.endpoint_url.clone(),
            assume_role_arn: self.assume_role_arn.clone(),
        }
    }
}
