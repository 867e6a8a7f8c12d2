//! Cost metrics computation and publication
//!
//! Each [`AggregationDef`] describes one exported gauge family: the measure
//! to aggregate, the dimensions that become labels, and optional equality
//! filters. [`compute`] evaluates every definition against the record store
//! and [`CostMetrics::publish`] turns the result into a prometheus snapshot
//! that scrapes read until the next publication.
//!
//! Definitions are either the built-in set or a JSON array:
//!
//! ```json
//! [
//!   {
//!     "name": "aws_billing_cost_by_service",
//!     "help": "Unblended cost per service",
//!     "measure": "cost",
//!     "group_by": ["billing_period", "product", "currency"],
//!     "filters": {"line_item_type": "Usage"}
//!   }
//! ]
//! ```

use cur_exporter_core::error::{ExporterError, Result};
use cur_exporter_core::record::{AggregateQuery, Dimension, GroupRow, Measure};
use cur_exporter_store::RecordStore;
use prometheus::proto::MetricFamily;
use prometheus::{GaugeVec, Opts, Registry};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::sync::{Arc, RwLock};
use tracing::{debug, info};

/// One exported gauge family
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationDef {
    /// Metric name
    pub name: String,
    /// Metric help text
    pub help: String,
    /// Value aggregated per group
    pub measure: Measure,
    /// Dimensions exported as labels
    #[serde(default)]
    pub group_by: Vec<Dimension>,
    /// Records must match every filter to be counted
    #[serde(default)]
    pub filters: BTreeMap<Dimension, String>,
}

impl AggregationDef {
    /// Definition of `name` aggregating `measure` grouped by `group_by`
    pub fn new(
        name: impl Into<String>,
        help: impl Into<String>,
        measure: Measure,
        group_by: &[Dimension],
    ) -> Self {
        Self {
            name: name.into(),
            help: help.into(),
            measure,
            group_by: group_by.to_vec(),
            filters: BTreeMap::new(),
        }
    }

    /// Add an equality filter
    pub fn with_filter(mut self, dimension: Dimension, value: impl Into<String>) -> Self {
        self.filters.insert(dimension, value.into());
        self
    }

    /// Label names, in group-by order
    pub fn label_names(&self) -> Vec<&'static str> {
        self.group_by.iter().map(Dimension::label_name).collect()
    }

    /// The store query this definition runs
    pub fn query(&self) -> AggregateQuery {
        AggregateQuery {
            measure: self.measure,
            group_by: self.group_by.clone(),
            filters: self.filters.clone(),
        }
    }

    /// Check the definition can be exported
    pub fn validate(&self) -> Result<()> {
        if !is_valid_metric_name(&self.name) {
            return Err(ExporterError::InvalidAggregation(format!(
                "invalid metric name: {:?}",
                self.name
            )));
        }

        if self.help.trim().is_empty() {
            return Err(ExporterError::InvalidAggregation(format!(
                "{} has no help text",
                self.name
            )));
        }

        let mut seen = HashSet::new();
        for dimension in &self.group_by {
            if !seen.insert(dimension) {
                return Err(ExporterError::InvalidAggregation(format!(
                    "{} groups by {} twice",
                    self.name, dimension
                )));
            }
        }

        Ok(())
    }
}

fn is_valid_metric_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == ':' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}

/// Validate a whole definition set, including name uniqueness
pub fn validate_definitions(defs: &[AggregationDef]) -> Result<()> {
    let mut names = HashSet::new();
    for def in defs {
        def.validate()?;
        if !names.insert(def.name.as_str()) {
            return Err(ExporterError::InvalidAggregation(format!(
                "metric {} defined twice",
                def.name
            )));
        }
    }
    Ok(())
}

/// Definitions exported when no file is configured
pub fn builtin_definitions() -> Vec<AggregationDef> {
    vec![
        AggregationDef::new(
            "aws_billing_cost",
            "Unblended cost per billing period, product, and line item type",
            Measure::Cost,
            &[
                Dimension::BillingPeriod,
                Dimension::Product,
                Dimension::LineItemType,
                Dimension::Currency,
            ],
        ),
        AggregationDef::new(
            "aws_billing_cost_by_account",
            "Unblended cost per billing period and usage account",
            Measure::Cost,
            &[Dimension::BillingPeriod, Dimension::Account, Dimension::Currency],
        ),
        AggregationDef::new(
            "aws_billing_cost_by_usage_type",
            "Unblended usage cost per billing period, product, and usage type",
            Measure::Cost,
            &[
                Dimension::BillingPeriod,
                Dimension::Product,
                Dimension::UsageType,
                Dimension::Currency,
            ],
        )
        .with_filter(Dimension::LineItemType, "Usage"),
        AggregationDef::new(
            "aws_billing_usage_amount",
            "Usage amount per billing period, product, usage type, and pricing unit",
            Measure::UsageAmount,
            &[
                Dimension::BillingPeriod,
                Dimension::Product,
                Dimension::UsageType,
                Dimension::Unit,
            ],
        ),
        AggregationDef::new(
            "aws_billing_line_items",
            "Number of report line items per billing period and line item type",
            Measure::LineItems,
            &[Dimension::BillingPeriod, Dimension::LineItemType],
        ),
    ]
}

/// Read and validate definitions from a JSON file
pub fn load_definitions(path: &Path) -> Result<Vec<AggregationDef>> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        ExporterError::Config(format!("reading {}: {}", path.display(), e))
    })?;
    let defs: Vec<AggregationDef> = serde_json::from_str(&text).map_err(|e| {
        ExporterError::InvalidAggregation(format!("parsing {}: {}", path.display(), e))
    })?;
    validate_definitions(&defs)?;
    info!("Loaded {} aggregation(s) from {}", defs.len(), path.display());
    Ok(defs)
}

/// Computed rows of one definition
#[derive(Debug, Clone, PartialEq)]
pub struct CostFamily {
    /// The definition the rows belong to
    pub def: AggregationDef,
    /// One row per label combination, ordered by labels
    pub rows: Vec<GroupRow>,
}

/// Evaluate every definition against `store`
///
/// Reads only. For an unchanged store the result is identical on every call.
pub fn compute(store: &RecordStore, defs: &[AggregationDef]) -> Result<Vec<CostFamily>> {
    validate_definitions(defs)?;

    defs.iter()
        .map(|def| {
            let rows = store.aggregate(&def.query())?;
            debug!("{}: {} sample(s)", def.name, rows.len());
            Ok(CostFamily {
                def: def.clone(),
                rows,
            })
        })
        .collect()
}

fn metrics_error(err: prometheus::Error) -> ExporterError {
    ExporterError::Metrics(err.to_string())
}

/// Build a registry holding `families`
fn build_registry(families: &[CostFamily]) -> Result<Registry> {
    let registry = Registry::new();
    for family in families {
        let labels = family.def.label_names();
        let gauge = GaugeVec::new(Opts::new(&family.def.name, &family.def.help), &labels)
            .map_err(metrics_error)?;

        for row in &family.rows {
            let values: Vec<&str> = row.labels.iter().map(String::as_str).collect();
            gauge
                .get_metric_with_label_values(&values)
                .map_err(metrics_error)?
                .set(row.value);
        }

        registry.register(Box::new(gauge)).map_err(metrics_error)?;
    }
    Ok(registry)
}

/// The published cost metric snapshot
///
/// Clones share the snapshot.
#[derive(Clone, Default)]
pub struct CostMetrics {
    snapshot: Arc<RwLock<Arc<Vec<MetricFamily>>>>,
}

impl CostMetrics {
    /// Start with nothing published
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the snapshot with `families`
    ///
    /// On error the previous snapshot stays in place.
    pub fn publish(&self, families: &[CostFamily]) -> Result<()> {
        let registry = build_registry(families)?;
        let gathered = Arc::new(registry.gather());

        let mut snapshot = self
            .snapshot
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *snapshot = gathered;
        Ok(())
    }

    /// The current snapshot
    pub fn gather(&self) -> Arc<Vec<MetricFamily>> {
        self.snapshot
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Number of samples in the current snapshot
    pub fn sample_count(&self) -> usize {
        self.gather().iter().map(|family| family.get_metric().len()).sum()
    }
}
