//! Integration tests for cur-exporter
//!
//! These exercise the ingestion path and the exporter against realistic
//! report layouts: gzip parts, foreign manifests, broken transfers, and a
//! local mirror of the bucket.

mod common;

use common::*;
use cur_exporter::ingestor::{IngestOutcome, ReportIngestor};
use cur_exporter::metrics::{builtin_definitions, compute};
use cur_exporter::state::StateFile;
use cur_exporter::{BillingPeriod, ExporterError, ReportManifest, SyncOutcome};
use cur_exporter_core::memory::MemoryBucket;
use cur_exporter_core::record::{AggregateQuery, Dimension, Measure, REQUIRED_COLUMNS};
use cur_exporter_source::LocalBucket;
use cur_exporter_store::RecordStore;
use std::sync::Arc;
use tempfile::TempDir;

const PERIOD: &str = "20240101-20240201";

fn period() -> BillingPeriod {
    BillingPeriod::parse(PERIOD).unwrap()
}

fn manifest(assembly_id: &str, keys: &[String]) -> ReportManifest {
    ReportManifest::from_slice(manifest_json(BUCKET, assembly_id, keys).as_bytes(), &source())
        .unwrap()
}

fn total_cost(store: &RecordStore) -> f64 {
    store.aggregate(&AggregateQuery::new(Measure::Cost)).unwrap()[0].value
}

#[tokio::test]
async fn test_multi_part_report_is_ingested_as_one() {
    let bucket = MemoryBucket::new();
    let parts = vec![
        vec![RowBuilder::new().cost(1.0), RowBuilder::new().cost(2.0)],
        vec![RowBuilder::new().cost(3.0)],
        vec![RowBuilder::new().account("444455556666").cost(4.0)],
    ];
    let keys = publish_report(&bucket, PERIOD, "a1", &parts, utc(2024, 2, 3));

    let store = RecordStore::open_in_memory().unwrap();
    let ingestor = ReportIngestor::new(Arc::new(bucket.clone()), store.clone()).with_batch_size(2);
    let outcome = ingestor.ingest(&period(), &manifest("a1", &keys)).await.unwrap();

    assert_eq!(outcome, IngestOutcome::Ingested { rows: 4, parts: 3 });
    assert_eq!(store.row_count(PERIOD).unwrap(), 4);
    assert!((total_cost(&store) - 10.0).abs() < 1e-9);

    let by_account = store
        .aggregate(&AggregateQuery::new(Measure::Cost).group_by(Dimension::Account))
        .unwrap();
    assert_eq!(by_account.len(), 2);
    assert_eq!(by_account[1].labels, vec!["444455556666"]);
}

#[tokio::test]
async fn test_failure_in_second_part_leaves_store_unchanged() {
    let bucket = MemoryBucket::new();
    let keys = publish_report(
        &bucket,
        PERIOD,
        "a1",
        &[vec![RowBuilder::new().cost(5.0)]],
        utc(2024, 2, 3),
    );
    let store = RecordStore::open_in_memory().unwrap();
    let ingestor = ReportIngestor::new(Arc::new(bucket.clone()), store.clone());
    ingestor.ingest(&period(), &manifest("a1", &keys)).await.unwrap();

    let rows: Vec<RowBuilder> = (0..50).map(|i| RowBuilder::new().cost(f64::from(i))).collect();
    let keys = publish_report(
        &bucket,
        PERIOD,
        "a2",
        &[rows.clone(), rows.clone(), rows],
        utc(2024, 2, 4),
    );
    bucket.fail_after(&keys[1], 40);

    let result = ingestor.ingest(&period(), &manifest("a2", &keys)).await;
    assert!(result.is_err());

    assert_eq!(store.row_count(PERIOD).unwrap(), 1);
    assert_eq!(store.ingested_assembly(PERIOD).unwrap().as_deref(), Some("a1"));
    assert!((total_cost(&store) - 5.0).abs() < 1e-9);
    // The third part is never requested
    assert!(!bucket.transferred_keys().contains(&keys[2]));
}

#[tokio::test]
async fn test_foreign_bucket_manifest_is_never_followed() {
    let dir = TempDir::new().unwrap();
    let bucket = MemoryBucket::new();
    publish_report(
        &bucket,
        PERIOD,
        "a1",
        &[vec![RowBuilder::new().cost(2.0), RowBuilder::new().cost(3.0)]],
        utc(2024, 2, 3),
    );
    let mut exporter = exporter(&dir, &bucket).await;
    assert_eq!(exporter.sync().await.unwrap(), SyncOutcome::Recomputed);

    let rows_before = exporter.store().row_count(PERIOD).unwrap();
    let published = exporter.gather();
    let transferred = bucket.transferred_keys().len();

    let keys = publish_report_in(
        &bucket,
        "someone-elses-bucket",
        PERIOD,
        "a2",
        &[vec![RowBuilder::new().cost(100.0)]],
        utc(2024, 2, 4),
    );
    let err = exporter.sync().await.unwrap_err();
    assert!(matches!(err, ExporterError::UntrustedManifest(_)));

    assert_eq!(rows_before, 2);
    assert_eq!(exporter.store().row_count(PERIOD).unwrap(), rows_before);
    assert_eq!(exporter.store().ingested_assembly(PERIOD).unwrap().as_deref(), Some("a1"));
    assert!((total_cost(exporter.store()) - 5.0).abs() < 1e-9);
    assert_eq!(exporter.gather(), published);

    // Only the manifest was transferred, never the foreign part
    assert_eq!(bucket.transferred_keys()[transferred..], [manifest_key(PERIOD)]);
    assert!(!bucket.transferred_keys().contains(&keys[0]));
    assert_eq!(exporter.state().watermark(&period()), Some(utc(2024, 2, 3)));
}

#[tokio::test]
async fn test_part_without_required_column_is_rejected() {
    let bucket = MemoryBucket::new();
    let header: Vec<&str> = REQUIRED_COLUMNS
        .iter()
        .copied()
        .filter(|column| *column != "lineItem/UnblendedCost")
        .collect();
    let text = format!("{}\n{}\n", header.join(","), vec!["x"; header.len()].join(","));
    let key = part_key(PERIOD, "a1", 1);
    bucket.put(key.clone(), gzip(&text), utc(2024, 2, 3));

    let store = RecordStore::open_in_memory().unwrap();
    let ingestor = ReportIngestor::new(Arc::new(bucket), store.clone());
    let err = ingestor
        .ingest(&period(), &manifest("a1", &[key]))
        .await
        .unwrap_err();

    match err {
        ExporterError::MissingColumn { column, .. } => assert_eq!(column, "lineItem/UnblendedCost"),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(store.total_rows().unwrap(), 0);
}

#[tokio::test]
async fn test_columns_are_matched_by_name() {
    let bucket = MemoryBucket::new();
    let mut header: Vec<&str> = REQUIRED_COLUMNS.to_vec();
    header.reverse();

    let mut cells: Vec<&str> = vec![
        "2024-01-01T00:00:00Z",
        "2024-02-01T00:00:00Z",
        "Amazon Simple Storage Service",
        "PutObject",
        "Usage",
        "Requests-Tier1",
        "Requests",
        "USD",
        "111122223333",
        "1000",
        "0.005",
    ];
    cells.reverse();
    let text = format!("{}\n{}\n", header.join(","), cells.join(","));
    let key = part_key(PERIOD, "a1", 1);
    bucket.put(key.clone(), gzip(&text), utc(2024, 2, 3));

    let store = RecordStore::open_in_memory().unwrap();
    let ingestor = ReportIngestor::new(Arc::new(bucket), store.clone());
    ingestor.ingest(&period(), &manifest("a1", &[key])).await.unwrap();

    let rows = store
        .aggregate(
            &AggregateQuery::new(Measure::UsageAmount)
                .group_by(Dimension::Product)
                .group_by(Dimension::Unit),
        )
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].labels, vec!["Amazon Simple Storage Service", "Requests"]);
    assert!((rows[0].value - 1000.0).abs() < 1e-9);
    assert!((total_cost(&store) - 0.005).abs() < 1e-9);
}

#[tokio::test]
async fn test_concatenated_gzip_members_are_read_fully() {
    let bucket = MemoryBucket::new();
    let full = csv_part(&[RowBuilder::new().cost(1.0), RowBuilder::new().cost(2.0)]);
    let (head, tail) = full.split_at(full.find("\nline-1").unwrap() + 1);

    let mut bytes = gzip(head);
    bytes.extend(gzip(tail));
    let key = part_key(PERIOD, "a1", 1);
    bucket.put(key.clone(), bytes, utc(2024, 2, 3));

    let store = RecordStore::open_in_memory().unwrap();
    let ingestor = ReportIngestor::new(Arc::new(bucket), store.clone());
    ingestor.ingest(&period(), &manifest("a1", &[key])).await.unwrap();

    assert_eq!(store.row_count(PERIOD).unwrap(), 2);
    assert!((total_cost(&store) - 3.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_compute_is_stable_across_calls() {
    let bucket = MemoryBucket::new();
    let keys = publish_report(
        &bucket,
        PERIOD,
        "a1",
        &[vec![
            RowBuilder::new().cost(1.5),
            RowBuilder::new().line_item_type("Credit").cost(-1.0),
            RowBuilder::new().product("AWS Lambda").cost(0.25),
        ]],
        utc(2024, 2, 3),
    );
    let store = RecordStore::open_in_memory().unwrap();
    ReportIngestor::new(Arc::new(bucket), store.clone())
        .ingest(&period(), &manifest("a1", &keys))
        .await
        .unwrap();

    let defs = builtin_definitions();
    let first = compute(&store, &defs).unwrap();
    let second = compute(&store, &defs).unwrap();
    assert_eq!(first, second);

    let usage_only = first
        .iter()
        .find(|family| family.def.name == "aws_billing_cost_by_usage_type")
        .unwrap();
    let usage_cost: f64 = usage_only.rows.iter().map(|row| row.value).sum();
    assert!((usage_cost - 1.75).abs() < 1e-9);
}

#[tokio::test]
async fn test_local_mirror_feeds_the_exporter() {
    let mirror = TempDir::new().unwrap();
    let period_dir = mirror.path().join(REPORT).join(PERIOD);
    std::fs::create_dir_all(period_dir.join("a1")).unwrap();

    let key = part_key(PERIOD, "a1", 1);
    std::fs::write(
        period_dir.join("a1").join(format!("{REPORT}-1.csv.gz")),
        gzip(&csv_part(&[RowBuilder::new().cost(7.0)])),
    )
    .unwrap();
    std::fs::write(
        period_dir.join(format!("{REPORT}-Manifest.json")),
        manifest_json(BUCKET, "a1", &[key]),
    )
    .unwrap();

    let dir = TempDir::new().unwrap();
    let config = config(&dir);
    let store = RecordStore::open(&config.database_path).unwrap();
    let mut exporter = cur_exporter::Exporter::new(
        config,
        Arc::new(LocalBucket::new(mirror.path())),
        store,
        Default::default(),
        builtin_definitions(),
    )
    .unwrap();

    assert_eq!(exporter.sync().await.unwrap(), SyncOutcome::Recomputed);
    assert_eq!(exporter.store().row_count(PERIOD).unwrap(), 1);
    assert_eq!(exporter.sync().await.unwrap(), SyncOutcome::Unchanged);

    let persisted = StateFile::new(dir.path().join("state.json")).load().await.unwrap();
    assert_eq!(persisted.periods(), &[period()]);
    assert!(persisted.watermark(&period()).is_some());
}

#[tokio::test]
async fn test_corrupt_state_file_is_reported() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("state.json");
    std::fs::write(&path, "{\"periods\": [\"not-a-period\"]}").unwrap();

    let err = StateFile::new(&path).load().await.unwrap_err();
    assert!(matches!(err, ExporterError::CorruptState { .. }));
}
