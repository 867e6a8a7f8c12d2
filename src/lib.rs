//! cur-exporter - Export AWS Cost and Usage Reports as Prometheus metrics
//!
//! This library provides functionality to:
//! - Discover the recent billing periods of a report in S3
//! - Skip unchanged reports with conditional manifest requests
//! - Load changed reports into a local SQLite store in one transaction
//! - Persist per-period watermarks so restarts do not re-download
//! - Aggregate the stored records into labeled gauges
//!
//! # Examples
//!
//! ```no_run
//! use cur_exporter::{
//!     config::ExporterConfig,
//!     metrics::builtin_definitions,
//!     orchestrator::Exporter,
//!     state::StateFile,
//! };
//! use cur_exporter_core::ReportSource;
//! use cur_exporter_source::{S3Bucket, S3Config};
//! use cur_exporter_store::RecordStore;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> cur_exporter::Result<()> {
//!     let config = ExporterConfig::new(ReportSource::new("billing-bucket", "daily"));
//!     let bucket = S3Bucket::connect(S3Config {
//!         bucket: "billing-bucket".to_string(),
//!         ..Default::default()
//!     })
//!     .await?;
//!     let store = RecordStore::open(&config.database_path)?;
//!     let state = StateFile::new(&config.state_path).load().await?;
//!
//!     let mut exporter = Exporter::new(config, Arc::new(bucket), store, state, builtin_definitions())?;
//!     let families = exporter.scrape().await?;
//!     println!("{} metric families", families.len());
//!     Ok(())
//! }
//! ```

pub mod cli;
pub mod config;
pub mod exporter_metrics;
pub mod fetch_guard;
pub mod ingestor;
pub mod metrics;
pub mod orchestrator;
pub mod resolver;
pub mod server;
pub mod state;

// Re-export commonly used types
pub use cur_exporter_core::{BillingPeriod, ExporterError, ReportManifest, ReportSource, Result};
pub use orchestrator::{Exporter, SyncOutcome};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
