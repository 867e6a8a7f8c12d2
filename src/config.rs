//! Exporter configuration
//!
//! [`ExporterConfig`] holds everything the pipeline needs once the command
//! line has been parsed. It can also be built directly when the exporter is
//! embedded:
//!
//! ```
//! use cur_exporter::config::ExporterConfig;
//! use cur_exporter_core::ReportSource;
//!
//! let config = ExporterConfig::new(ReportSource::new("billing-bucket", "daily"));
//! assert!(config.validate().is_ok());
//! assert_eq!(config.policy.retained_periods, 3);
//! ```

use crate::ingestor::DEFAULT_BATCH_SIZE;
use crate::resolver::DEFAULT_RETAINED_PERIODS;
use cur_exporter_core::error::{ExporterError, Result};
use cur_exporter_core::manifest::ReportSource;
use std::path::PathBuf;
use std::time::Duration;

/// Default record store location
pub const DEFAULT_DATABASE_PATH: &str = "cur-exporter.db";
/// Default state file location
pub const DEFAULT_STATE_PATH: &str = "cur-exporter-state.json";

/// When and how hard the pipeline talks to the bucket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncPolicy {
    /// Number of most recent periods kept
    pub retained_periods: usize,
    /// How long after a period ends it still counts as current
    pub past_due_grace: chrono::Duration,
    /// Bound on listing and manifest requests
    pub metadata_timeout: Duration,
    /// Bound on a whole report ingestion
    pub transfer_timeout: Duration,
    /// Records per store batch
    pub batch_size: usize,
}

impl Default for SyncPolicy {
    fn default() -> Self {
        Self {
            retained_periods: DEFAULT_RETAINED_PERIODS,
            past_due_grace: chrono::Duration::zero(),
            metadata_timeout: Duration::from_secs(30),
            transfer_timeout: Duration::from_secs(15 * 60),
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }
}

/// Pipeline configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExporterConfig {
    /// Where reports are read from
    pub source: ReportSource,
    /// SQLite record store
    pub database_path: PathBuf,
    /// Persisted state document
    pub state_path: PathBuf,
    /// JSON aggregation definitions; the built-in set when absent
    pub queries_path: Option<PathBuf>,
    /// Sync behaviour
    pub policy: SyncPolicy,
}

impl ExporterConfig {
    /// Configuration for `source` with default paths and policy
    pub fn new(source: ReportSource) -> Self {
        Self {
            source,
            database_path: PathBuf::from(DEFAULT_DATABASE_PATH),
            state_path: PathBuf::from(DEFAULT_STATE_PATH),
            queries_path: None,
            policy: SyncPolicy::default(),
        }
    }

    /// Reject configurations the pipeline cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.source.bucket.trim().is_empty() {
            return Err(ExporterError::Config("bucket must not be empty".to_string()));
        }
        if self.source.report_name.trim().is_empty() || self.source.report_name.contains('/') {
            return Err(ExporterError::Config(format!(
                "invalid report name: {:?}",
                self.source.report_name
            )));
        }
        if self.policy.retained_periods == 0 {
            return Err(ExporterError::Config(
                "retained periods must be at least 1".to_string(),
            ));
        }
        if self.policy.past_due_grace < chrono::Duration::zero() {
            return Err(ExporterError::Config(
                "past-due grace must not be negative".to_string(),
            ));
        }
        if self.policy.metadata_timeout.is_zero() || self.policy.transfer_timeout.is_zero() {
            return Err(ExporterError::Config("timeouts must be positive".to_string()));
        }
        if self.policy.batch_size == 0 {
            return Err(ExporterError::Config("batch size must be at least 1".to_string()));
        }
        if self.database_path == self.state_path {
            return Err(ExporterError::Config(
                "database and state file must be different paths".to_string(),
            ));
        }
        Ok(())
    }
}
