//! Core types, traits, and utilities for cur-exporter
//!
//! This crate provides the billing period model, report manifests, usage
//! records and aggregation queries, the `ReportBucket` storage trait, and the
//! error type shared by all other cur-exporter crates.

pub mod bucket;
pub mod error;
pub mod manifest;
pub mod memory;
pub mod period;
pub mod record;

// Re-export commonly used types
pub use bucket::{ObjectFetch, RemoteObject, ReportBucket};
pub use error::{ExporterError, Result};
pub use manifest::{Compression, ReportManifest, ReportSource};
pub use period::BillingPeriod;
pub use record::{AggregateQuery, Dimension, GroupRow, Measure, UsageRecord};
