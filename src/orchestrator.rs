//! Scrape-driven sync pipeline
//!
//! [`Exporter`] owns everything one pipeline run touches: the bucket, the
//! record store, the persisted state, the aggregation definitions, and the
//! published metric snapshot. It is driven by scrapes; nothing runs in the
//! background.
//!
//! A run goes through these steps:
//!
//! 1. Re-resolve the period window when no period is known yet or the most
//!    recent one has ended (plus a grace period). A changed window is saved
//!    and periods that left it are pruned from the store.
//! 2. Check the most recent period's manifest against its watermark.
//! 3. On change, ingest the report, advance and save the watermark, then
//!    recompute and publish the cost metrics.
//!
//! A recompute that fails is attempted again by every later run until one
//! publishes, whether or not anything changed remotely in between.
//!
//! The first run (priming) additionally ingests every older period in the
//! window that has never been ingested. Priming that fails is retried by the
//! next run.

use crate::config::ExporterConfig;
use crate::exporter_metrics::ExporterMetrics;
use crate::fetch_guard::{ManifestCheck, fetch_manifest_if_changed};
use crate::ingestor::{IngestOutcome, ReportIngestor};
use crate::metrics::{AggregationDef, CostMetrics, compute, validate_definitions};
use crate::resolver::resolve;
use crate::state::{ExporterState, StateFile};
use chrono::{DateTime, Utc};
use cur_exporter_core::bucket::ReportBucket;
use cur_exporter_core::error::{ExporterError, Result};
use cur_exporter_core::period::BillingPeriod;
use cur_exporter_store::RecordStore;
use prometheus::proto::MetricFamily;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How a pipeline run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// No data changed; the published metrics were left as they were
    Unchanged,
    /// Data changed and the metrics were recomputed
    Recomputed,
}

impl SyncOutcome {
    fn label(&self) -> &'static str {
        match self {
            SyncOutcome::Unchanged => "unchanged",
            SyncOutcome::Recomputed => "recomputed",
        }
    }
}

/// The long-lived pipeline instance
pub struct Exporter {
    config: ExporterConfig,
    bucket: Arc<dyn ReportBucket>,
    store: RecordStore,
    ingestor: ReportIngestor,
    state_file: StateFile,
    state: ExporterState,
    definitions: Arc<Vec<AggregationDef>>,
    cost_metrics: CostMetrics,
    exporter_metrics: Option<ExporterMetrics>,
    primed: bool,
    /// Store content changed since the last successful publish
    needs_recompute: bool,
}

impl Exporter {
    /// Assemble an exporter from its parts
    ///
    /// `state` is the state loaded from `config.state_path`.
    ///
    /// # Errors
    ///
    /// Fails if the configuration or the aggregation definitions are invalid.
    pub fn new(
        config: ExporterConfig,
        bucket: Arc<dyn ReportBucket>,
        store: RecordStore,
        state: ExporterState,
        definitions: Vec<AggregationDef>,
    ) -> Result<Self> {
        config.validate()?;
        validate_definitions(&definitions)?;

        let ingestor = ReportIngestor::new(Arc::clone(&bucket), store.clone())
            .with_batch_size(config.policy.batch_size);
        let state_file = StateFile::new(&config.state_path);

        Ok(Self {
            config,
            bucket,
            store,
            ingestor,
            state_file,
            state,
            definitions: Arc::new(definitions),
            cost_metrics: CostMetrics::new(),
            exporter_metrics: None,
            primed: false,
            needs_recompute: false,
        })
    }

    /// Export pipeline metrics alongside the cost metrics
    pub fn with_exporter_metrics(mut self, metrics: ExporterMetrics) -> Self {
        metrics.set_watermarks(self.state.watermarks());
        self.exporter_metrics = Some(metrics);
        self
    }

    /// Current state
    pub fn state(&self) -> &ExporterState {
        &self.state
    }

    /// The record store
    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    /// Whether priming has completed
    pub fn is_primed(&self) -> bool {
        self.primed
    }

    /// Resolve the window, ingest what was never seen, and publish metrics
    pub async fn prime(&mut self) -> Result<()> {
        info!("Priming from report {}", self.config.source.report_name);

        let periods = self.resolve_periods().await?;
        self.apply_periods(periods).await?;
        self.refresh_window().await?;
        self.persist_state().await?;
        self.recompute().await?;

        self.primed = true;
        info!(
            "Primed with {} period(s)",
            self.state.periods().len()
        );
        Ok(())
    }

    /// Run the pipeline once
    pub async fn sync(&mut self) -> Result<SyncOutcome> {
        self.sync_at(Utc::now()).await
    }

    /// Run the pipeline once, deciding staleness as of `now`
    pub async fn sync_at(&mut self, now: DateTime<Utc>) -> Result<SyncOutcome> {
        if !self.primed {
            self.prime().await?;
            return Ok(SyncOutcome::Recomputed);
        }

        let mut data_changed = false;
        if self.periods_stale(now) {
            debug!("Period window is stale, re-resolving");
            let periods = self.resolve_periods().await?;
            if self.apply_periods(periods).await? {
                data_changed = true;
                data_changed |= self.refresh_window().await?;
            }
        }

        if !data_changed {
            if let Some(latest) = self.state.latest_period().copied() {
                data_changed = self.refresh_period(&latest).await?;
            }
        }

        if data_changed || self.needs_recompute {
            self.recompute().await?;
            Ok(SyncOutcome::Recomputed)
        } else {
            Ok(SyncOutcome::Unchanged)
        }
    }

    /// Run the pipeline, then return the metrics to expose
    pub async fn scrape(&mut self) -> Result<Vec<MetricFamily>> {
        let started = Instant::now();
        let result = self.sync().await;
        let elapsed = started.elapsed().as_secs_f64();

        if let Some(metrics) = &self.exporter_metrics {
            let outcome = match &result {
                Ok(outcome) => outcome.label(),
                Err(_) => "error",
            };
            metrics.observe_sync(outcome, elapsed);
        }

        let outcome = result?;
        debug!("Sync finished as {:?} in {:.3}s", outcome, elapsed);
        Ok(self.gather())
    }

    /// The published cost metrics, plus pipeline metrics when enabled
    pub fn gather(&self) -> Vec<MetricFamily> {
        let mut families: Vec<MetricFamily> = self.cost_metrics.gather().as_ref().clone();
        if let Some(metrics) = &self.exporter_metrics {
            families.extend(metrics.gather());
        }
        families
    }

    fn periods_stale(&self, now: DateTime<Utc>) -> bool {
        match self.state.latest_period() {
            None => true,
            Some(latest) => now >= latest.end_instant() + self.config.policy.past_due_grace,
        }
    }

    async fn resolve_periods(&self) -> Result<Vec<BillingPeriod>> {
        bounded(
            self.config.policy.metadata_timeout,
            "listing billing periods",
            resolve(
                self.bucket.as_ref(),
                &self.config.source,
                self.config.policy.retained_periods,
            ),
        )
        .await
    }

    /// Adopt a resolved window, returning whether it differs from the current one
    async fn apply_periods(&mut self, periods: Vec<BillingPeriod>) -> Result<bool> {
        if !self.state.replace_periods(periods) {
            return Ok(false);
        }

        let keep: Vec<String> = self.state.periods().iter().map(ToString::to_string).collect();
        let pruned = self.store.retain_periods(&keep)?;
        if pruned > 0 {
            self.needs_recompute = true;
        }
        info!(
            "Billing periods now {:?} ({} pruned from the store)",
            keep, pruned
        );

        self.persist_state().await?;
        Ok(true)
    }

    /// Ingest older periods never seen before, and always check the latest
    async fn refresh_window(&mut self) -> Result<bool> {
        let periods = self.state.periods().to_vec();
        let Some((latest, older)) = periods.split_last() else {
            return Ok(false);
        };

        let mut changed = false;
        for period in older {
            if self.state.watermark(period).is_none() || !self.is_stored(period)? {
                changed |= self.refresh_period(period).await?;
            } else {
                debug!("Skipping {}, already ingested", period);
            }
        }
        changed |= self.refresh_period(latest).await?;
        Ok(changed)
    }

    fn is_stored(&self, period: &BillingPeriod) -> Result<bool> {
        Ok(self
            .store
            .ingested_assembly(&period.canonical_form())?
            .is_some())
    }

    /// Check one period and ingest it if its manifest changed
    ///
    /// Returns whether the store's content changed.
    async fn refresh_period(&mut self, period: &BillingPeriod) -> Result<bool> {
        // A watermark without stored rows would hide the report forever
        let watermark = if self.is_stored(period)? {
            self.state.watermark(period)
        } else {
            None
        };

        let check = bounded(
            self.config.policy.metadata_timeout,
            "fetching manifest",
            fetch_manifest_if_changed(self.bucket.as_ref(), &self.config.source, period, watermark),
        )
        .await?;

        let (manifest, last_modified) = match check {
            ManifestCheck::Unchanged => {
                debug!("{} unchanged", period);
                return Ok(false);
            }
            ManifestCheck::Changed {
                manifest,
                last_modified,
            } => (manifest, last_modified),
        };

        let outcome = bounded(
            self.config.policy.transfer_timeout,
            "ingesting report",
            self.ingestor.ingest(period, &manifest),
        )
        .await?;

        if let IngestOutcome::Ingested { rows, parts } = outcome {
            self.needs_recompute = true;
            info!("Ingested {} rows from {} part(s) for {}", rows, parts, period);
            if let Some(metrics) = &self.exporter_metrics {
                metrics.add_ingested_rows(rows);
            }
        }

        if !self.state.advance_watermark(period, last_modified) {
            warn!(
                "Manifest of {} is older than its watermark, keeping {:?}",
                period,
                self.state.watermark(period)
            );
        }
        self.persist_state().await?;

        Ok(matches!(outcome, IngestOutcome::Ingested { .. }))
    }

    async fn persist_state(&self) -> Result<()> {
        self.state_file.save(&self.state).await?;
        if let Some(metrics) = &self.exporter_metrics {
            metrics.set_watermarks(self.state.watermarks());
        }
        Ok(())
    }

    async fn recompute(&mut self) -> Result<()> {
        let store = self.store.clone();
        let definitions = Arc::clone(&self.definitions);

        let families = tokio::task::spawn_blocking(move || compute(&store, &definitions))
            .await
            .map_err(|e| ExporterError::QueryFailure(format!("metrics computation failed: {e}")))??;

        self.cost_metrics.publish(&families)?;
        self.needs_recompute = false;

        let samples: usize = families.iter().map(|family| family.rows.len()).sum();
        info!(
            "Published {} metric families with {} samples",
            families.len(),
            samples
        );
        if let Some(metrics) = &self.exporter_metrics {
            metrics.mark_recomputed(Utc::now());
        }
        Ok(())
    }
}

async fn bounded<T>(limit: Duration, what: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(ExporterError::TransferFailure(format!(
            "{what} timed out after {}s",
            limit.as_secs_f64()
        ))),
    }
}
