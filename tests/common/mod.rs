//! Common test utilities and helpers for cur-exporter tests
//!
//! Builders for report rows, gzip-compressed CSV parts and manifests, and a
//! fixture that publishes complete report instances into a `MemoryBucket`
//! the way AWS lays them out.

#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use cur_exporter::{
    config::ExporterConfig, metrics::builtin_definitions, orchestrator::Exporter,
    state::StateFile,
};
use cur_exporter_core::manifest::ReportSource;
use cur_exporter_core::memory::MemoryBucket;
use cur_exporter_core::record::REQUIRED_COLUMNS;
use cur_exporter_store::RecordStore;
use flate2::Compression;
use flate2::write::GzEncoder;
use std::io::Write;
use std::sync::Arc;
use tempfile::TempDir;

/// Bucket name used by every fixture
pub const BUCKET: &str = "billing-bucket";
/// Report name used by every fixture
pub const REPORT: &str = "daily";

/// UTC midnight of a date
pub fn utc(year: i32, month: u32, day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(year, month, day, 0, 0, 0).unwrap()
}

/// Builder for one report row
#[derive(Debug, Clone)]
pub struct RowBuilder {
    product: String,
    operation: String,
    line_item_type: String,
    usage_type: String,
    unit: String,
    account: String,
    usage_amount: String,
    cost: String,
}

impl RowBuilder {
    /// A usage row for EC2 with default values
    pub fn new() -> Self {
        Self {
            product: "Amazon Elastic Compute Cloud".to_string(),
            operation: "RunInstances".to_string(),
            line_item_type: "Usage".to_string(),
            usage_type: "BoxUsage:t3.micro".to_string(),
            unit: "Hrs".to_string(),
            account: "111122223333".to_string(),
            usage_amount: "1".to_string(),
            cost: "0.0104".to_string(),
        }
    }

    pub fn product(mut self, product: &str) -> Self {
        self.product = product.to_string();
        self
    }

    pub fn line_item_type(mut self, line_item_type: &str) -> Self {
        self.line_item_type = line_item_type.to_string();
        self
    }

    pub fn account(mut self, account: &str) -> Self {
        self.account = account.to_string();
        self
    }

    pub fn usage_amount(mut self, amount: &str) -> Self {
        self.usage_amount = amount.to_string();
        self
    }

    pub fn cost(mut self, cost: f64) -> Self {
        self.cost = cost.to_string();
        self
    }

    /// Cells in [`REQUIRED_COLUMNS`] order
    fn cells(&self, start: &str, end: &str) -> Vec<String> {
        vec![
            start.to_string(),
            end.to_string(),
            self.product.clone(),
            self.operation.clone(),
            self.line_item_type.clone(),
            self.usage_type.clone(),
            self.unit.clone(),
            "USD".to_string(),
            self.account.clone(),
            self.usage_amount.clone(),
            self.cost.clone(),
        ]
    }
}

impl Default for RowBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// CSV text with the standard header plus an extra leading column
///
/// The extra column makes sure nothing relies on column positions.
pub fn csv_part(rows: &[RowBuilder]) -> String {
    let mut text = String::from("identity/LineItemId");
    for column in REQUIRED_COLUMNS {
        text.push(',');
        text.push_str(column);
    }
    text.push('\n');

    for (i, row) in rows.iter().enumerate() {
        text.push_str(&format!("line-{i}"));
        for cell in row.cells("2024-01-01T00:00:00Z", "2024-02-01T00:00:00Z") {
            text.push(',');
            text.push_str(&cell);
        }
        text.push('\n');
    }
    text
}

/// gzip-compress `text`
pub fn gzip(text: &str) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(text.as_bytes()).unwrap();
    encoder.finish().unwrap()
}

/// Manifest document for a report instance
pub fn manifest_json(bucket: &str, assembly_id: &str, keys: &[String]) -> String {
    serde_json::json!({
        "assemblyId": assembly_id,
        "account": "111122223333",
        "columns": [],
        "charset": "UTF-8",
        "compression": "GZIP",
        "contentType": "text/csv",
        "reportId": "0000",
        "reportName": REPORT,
        "billingPeriod": {"start": "20240101T000000.000Z", "end": "20240201T000000.000Z"},
        "bucket": bucket,
        "reportKeys": keys,
        "additionalArtifactKeys": [],
    })
    .to_string()
}

/// Key of a period's manifest
pub fn manifest_key(period: &str) -> String {
    format!("/{REPORT}/{period}/{REPORT}-Manifest.json")
}

/// Key of part `index` (1-based) of a report instance
pub fn part_key(period: &str, assembly_id: &str, index: usize) -> String {
    format!("/{REPORT}/{period}/{assembly_id}/{REPORT}-{index}.csv.gz")
}

/// Publish a gzip report instance with one part per entry of `parts`
///
/// Returns the part keys.
pub fn publish_report(
    bucket: &MemoryBucket,
    period: &str,
    assembly_id: &str,
    parts: &[Vec<RowBuilder>],
    modified: DateTime<Utc>,
) -> Vec<String> {
    publish_report_in(bucket, BUCKET, period, assembly_id, parts, modified)
}

/// Like [`publish_report`], with the manifest naming `manifest_bucket`
pub fn publish_report_in(
    bucket: &MemoryBucket,
    manifest_bucket: &str,
    period: &str,
    assembly_id: &str,
    parts: &[Vec<RowBuilder>],
    modified: DateTime<Utc>,
) -> Vec<String> {
    let keys: Vec<String> = (1..=parts.len())
        .map(|index| part_key(period, assembly_id, index))
        .collect();

    for (key, rows) in keys.iter().zip(parts) {
        bucket.put(key.clone(), gzip(&csv_part(rows)), modified);
    }
    bucket.put(
        manifest_key(period),
        manifest_json(manifest_bucket, assembly_id, &keys),
        modified,
    );
    keys
}

/// Report source matching the fixtures
pub fn source() -> ReportSource {
    ReportSource::new(BUCKET, REPORT)
}

/// Exporter configuration with store and state inside `dir`
pub fn config(dir: &TempDir) -> ExporterConfig {
    let mut config = ExporterConfig::new(source());
    config.database_path = dir.path().join("records.db");
    config.state_path = dir.path().join("state.json");
    config
}

/// Build an exporter over `bucket` from whatever state is on disk in `dir`
pub async fn exporter(dir: &TempDir, bucket: &MemoryBucket) -> Exporter {
    let config = config(dir);
    let state = StateFile::new(&config.state_path).load().await.unwrap();
    let store = RecordStore::open(&config.database_path).unwrap();
    Exporter::new(
        config,
        Arc::new(bucket.clone()),
        store,
        state,
        builtin_definitions(),
    )
    .unwrap()
}

/// Total number of samples across metric families
pub fn sample_count(families: &[prometheus::proto::MetricFamily]) -> usize {
    families.iter().map(|family| family.get_metric().len()).sum()
}
