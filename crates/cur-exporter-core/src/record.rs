//! Usage records and declarative aggregation queries
//!
//! [`UsageRecord`] is one normalized report line. Aggregations over stored
//! records are described with [`AggregateQuery`] rather than raw SQL, so the
//! store decides how to run them and every grouping column is a known
//! [`Dimension`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// One normalized usage line from a Cost and Usage Report
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    /// `bill/BillingPeriodStartDate`
    pub billing_period_start: String,
    /// `bill/BillingPeriodEndDate`
    pub billing_period_end: String,
    /// `product/ProductName`
    pub product: String,
    /// `lineItem/Operation`
    pub operation: String,
    /// `lineItem/LineItemType`
    pub line_item_type: String,
    /// `lineItem/UsageType`
    pub usage_type: String,
    /// `pricing/unit`
    pub unit: String,
    /// `lineItem/CurrencyCode`
    pub currency: String,
    /// `lineItem/UsageAccountId`
    pub account: String,
    /// `lineItem/UsageAmount`
    pub usage_amount: f64,
    /// `lineItem/UnblendedCost`
    pub cost: f64,
}

/// Report columns every part must carry, in [`UsageRecord`] field order
pub const REQUIRED_COLUMNS: [&str; 11] = [
    "bill/BillingPeriodStartDate",
    "bill/BillingPeriodEndDate",
    "product/ProductName",
    "lineItem/Operation",
    "lineItem/LineItemType",
    "lineItem/UsageType",
    "pricing/unit",
    "lineItem/CurrencyCode",
    "lineItem/UsageAccountId",
    "lineItem/UsageAmount",
    "lineItem/UnblendedCost",
];

/// A column records can be grouped or filtered by
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    /// Billing period the record was ingested under
    BillingPeriod,
    /// Product name
    Product,
    /// API operation
    Operation,
    /// Line item type (Usage, Tax, Credit, ...)
    LineItemType,
    /// Usage type
    UsageType,
    /// Pricing unit
    Unit,
    /// Currency code
    Currency,
    /// Usage account id
    Account,
}

impl Dimension {
    /// Every dimension, in declaration order
    pub const ALL: [Dimension; 8] = [
        Dimension::BillingPeriod,
        Dimension::Product,
        Dimension::Operation,
        Dimension::LineItemType,
        Dimension::UsageType,
        Dimension::Unit,
        Dimension::Currency,
        Dimension::Account,
    ];

    /// Label name used when the dimension is exported
    pub fn label_name(&self) -> &'static str {
        match self {
            Dimension::BillingPeriod => "billing_period",
            Dimension::Product => "product",
            Dimension::Operation => "operation",
            Dimension::LineItemType => "line_item_type",
            Dimension::UsageType => "usage_type",
            Dimension::Unit => "unit",
            Dimension::Currency => "currency",
            Dimension::Account => "account_id",
        }
    }
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label_name())
    }
}

/// Numeric column an aggregation reduces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Measure {
    /// Sum of `lineItem/UsageAmount`
    UsageAmount,
    /// Sum of `lineItem/UnblendedCost`
    Cost,
    /// Number of line items
    LineItems,
}

/// A grouped aggregation over stored records
///
/// # Examples
///
/// ```
/// use cur_exporter_core::record::{AggregateQuery, Dimension, Measure};
///
/// let query = AggregateQuery::new(Measure::Cost)
///     .group_by(Dimension::BillingPeriod)
///     .group_by(Dimension::Product)
///     .filter(Dimension::LineItemType, "Usage");
///
/// assert_eq!(query.group_by.len(), 2);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregateQuery {
    /// Value to reduce
    pub measure: Measure,
    /// Grouping dimensions, in label order
    #[serde(default)]
    pub group_by: Vec<Dimension>,
    /// Equality filters applied before grouping
    #[serde(default)]
    pub filters: BTreeMap<Dimension, String>,
}

impl AggregateQuery {
    /// Aggregate `measure` over all records
    pub fn new(measure: Measure) -> Self {
        Self {
            measure,
            group_by: Vec::new(),
            filters: BTreeMap::new(),
        }
    }

    /// Add a grouping dimension
    pub fn group_by(mut self, dimension: Dimension) -> Self {
        self.group_by.push(dimension);
        self
    }

    /// Keep only records whose `dimension` equals `value`
    pub fn filter(mut self, dimension: Dimension, value: impl Into<String>) -> Self {
        self.filters.insert(dimension, value.into());
        self
    }
}

/// One output row of an [`AggregateQuery`]
#[derive(Debug, Clone, PartialEq)]
pub struct GroupRow {
    /// Values of the grouping dimensions, in query order
    pub labels: Vec<String>,
    /// Aggregated value
    pub value: f64,
}
