//! Metrics about the exporter itself

use chrono::{DateTime, Utc};
use cur_exporter_core::error::{ExporterError, Result};
use cur_exporter_core::period::BillingPeriod;
use prometheus::proto::MetricFamily;
use prometheus::{Gauge, GaugeVec, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry};
use std::collections::BTreeMap;

fn metrics_error(err: prometheus::Error) -> ExporterError {
    ExporterError::Metrics(err.to_string())
}

/// Pipeline counters, exported next to the cost metrics
#[derive(Clone)]
pub struct ExporterMetrics {
    registry: Registry,
    syncs_total: IntCounterVec,
    ingested_rows_total: IntCounter,
    sync_duration_seconds: Histogram,
    report_last_modified: GaugeVec,
    last_recompute: Gauge,
}

impl ExporterMetrics {
    /// Create and register every exporter metric
    pub fn new() -> Result<Self> {
        let metrics = Self {
            registry: Registry::new(),
            syncs_total: IntCounterVec::new(
                Opts::new("cur_exporter_syncs_total", "Pipeline runs by outcome"),
                &["outcome"],
            )
            .map_err(metrics_error)?,
            ingested_rows_total: IntCounter::new(
                "cur_exporter_ingested_rows_total",
                "Report rows written to the record store",
            )
            .map_err(metrics_error)?,
            sync_duration_seconds: Histogram::with_opts(
                HistogramOpts::new(
                    "cur_exporter_sync_duration_seconds",
                    "Duration of scrape-triggered pipeline runs",
                )
                .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 900.0]),
            )
            .map_err(metrics_error)?,
            report_last_modified: GaugeVec::new(
                Opts::new(
                    "cur_exporter_report_last_modified_timestamp_seconds",
                    "Modification time of the last ingested manifest per billing period",
                ),
                &["billing_period"],
            )
            .map_err(metrics_error)?,
            last_recompute: Gauge::new(
                "cur_exporter_last_recompute_timestamp_seconds",
                "When the cost metrics were last recomputed",
            )
            .map_err(metrics_error)?,
        };

        metrics.register()?;
        Ok(metrics)
    }

    fn register(&self) -> Result<()> {
        self.registry
            .register(Box::new(self.syncs_total.clone()))
            .map_err(metrics_error)?;
        self.registry
            .register(Box::new(self.ingested_rows_total.clone()))
            .map_err(metrics_error)?;
        self.registry
            .register(Box::new(self.sync_duration_seconds.clone()))
            .map_err(metrics_error)?;
        self.registry
            .register(Box::new(self.report_last_modified.clone()))
            .map_err(metrics_error)?;
        self.registry
            .register(Box::new(self.last_recompute.clone()))
            .map_err(metrics_error)?;
        Ok(())
    }

    /// Count a pipeline run that ended with `outcome`
    pub fn observe_sync(&self, outcome: &str, seconds: f64) {
        self.syncs_total.with_label_values(&[outcome]).inc();
        self.sync_duration_seconds.observe(seconds);
    }

    /// Count rows written by one ingestion
    pub fn add_ingested_rows(&self, rows: u64) {
        self.ingested_rows_total.inc_by(rows);
    }

    /// Mirror the watermarks of the periods in the window
    pub fn set_watermarks(&self, watermarks: &BTreeMap<BillingPeriod, DateTime<Utc>>) {
        self.report_last_modified.reset();
        for (period, ts) in watermarks {
            let label = period.to_string();
            self.report_last_modified
                .with_label_values(&[label.as_str()])
                .set(ts.timestamp() as f64);
        }
    }

    /// Record a finished recomputation
    pub fn mark_recomputed(&self, at: DateTime<Utc>) {
        self.last_recompute.set(at.timestamp() as f64);
    }

    /// Current values
    pub fn gather(&self) -> Vec<MetricFamily> {
        self.registry.gather()
    }
}
