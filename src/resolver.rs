//! Billing period discovery
//!
//! Report exports live under one prefix per billing period below the report
//! root. Listing those prefixes tells which periods exist; only the most
//! recent few are kept, since older bills no longer receive corrections.

use cur_exporter_core::bucket::ReportBucket;
use cur_exporter_core::error::Result;
use cur_exporter_core::manifest::ReportSource;
use cur_exporter_core::period::BillingPeriod;
use tracing::debug;

/// Default number of periods kept in the window
pub const DEFAULT_RETAINED_PERIODS: usize = 3;

/// List the billing periods of `source`, oldest first, keeping the last
/// `retained`
///
/// # Errors
///
/// Fails with [`MalformedPeriod`](cur_exporter_core::ExporterError::MalformedPeriod)
/// if any listed prefix is not a billing period, or with the bucket's error
/// if listing fails.
pub async fn resolve(
    bucket: &dyn ReportBucket,
    source: &ReportSource,
    retained: usize,
) -> Result<Vec<BillingPeriod>> {
    let root = source.root_prefix();
    let prefixes = bucket.list_prefixes(&root).await?;

    let mut periods = prefixes
        .iter()
        .map(|prefix| {
            let name = prefix.strip_prefix(root.as_str()).unwrap_or(prefix);
            BillingPeriod::parse(name.trim_end_matches('/'))
        })
        .collect::<Result<Vec<_>>>()?;

    periods.sort();
    periods.dedup();
    if periods.len() > retained {
        periods.drain(..periods.len() - retained);
    }

    debug!(
        "Resolved {} period(s) under {}: {:?}",
        periods.len(),
        root,
        periods.iter().map(ToString::to_string).collect::<Vec<_>>()
    );
    Ok(periods)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use cur_exporter_core::error::ExporterError;
    use cur_exporter_core::memory::MemoryBucket;

    fn bucket_with(periods: &[&str]) -> MemoryBucket {
        let bucket = MemoryBucket::new();
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        for period in periods {
            bucket.put(format!("/daily/{period}/daily-Manifest.json"), "{}", at);
        }
        bucket
    }

    #[tokio::test]
    async fn test_keeps_most_recent_in_order() {
        let bucket = bucket_with(&[
            "20240201-20240301",
            "20231101-20231201",
            "20240101-20240201",
            "20231201-20240101",
        ]);
        let source = ReportSource::new("billing", "daily");

        let periods = resolve(&bucket, &source, DEFAULT_RETAINED_PERIODS).await.unwrap();
        let names: Vec<String> = periods.iter().map(ToString::to_string).collect();
        assert_eq!(
            names,
            vec!["20231201-20240101", "20240101-20240201", "20240201-20240301"]
        );

        let again = resolve(&bucket, &source, DEFAULT_RETAINED_PERIODS).await.unwrap();
        assert_eq!(periods, again);
    }

    #[tokio::test]
    async fn test_fewer_than_window() {
        let bucket = bucket_with(&["2024-02-01-2024-03-01", "2024-01-01-2024-02-01"]);
        let periods = resolve(&bucket, &ReportSource::new("billing", "daily"), 3)
            .await
            .unwrap();
        assert_eq!(periods.len(), 2);
        assert_eq!(periods[0].to_string(), "2024-01-01-2024-02-01");
    }

    #[tokio::test]
    async fn test_malformed_prefix_fails_resolution() {
        let bucket = bucket_with(&["20240101-20240201", "athena-metadata"]);
        let err = resolve(&bucket, &ReportSource::new("billing", "daily"), 3)
            .await
            .unwrap_err();
        assert!(matches!(err, ExporterError::MalformedPeriod(_)));
    }

    #[tokio::test]
    async fn test_report_prefix() {
        let bucket = MemoryBucket::new();
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        bucket.put("cur/daily/20240101-20240201/daily-Manifest.json", "{}", at);
        let source = ReportSource::new("billing", "daily").with_prefix("cur");

        let periods = resolve(&bucket, &source, 3).await.unwrap();
        assert_eq!(periods.len(), 1);
    }
}
