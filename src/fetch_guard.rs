//! Conditional manifest retrieval
//!
//! A period's manifest is rewritten whenever AWS delivers a new version of
//! its report. Fetching it with the period's watermark as
//! `If-Modified-Since` turns the common case (nothing changed) into a
//! metadata-only round trip.

use chrono::{DateTime, Utc};
use cur_exporter_core::bucket::{ObjectFetch, ReportBucket, modified_since};
use cur_exporter_core::error::Result;
use cur_exporter_core::manifest::{ReportManifest, ReportSource};
use cur_exporter_core::period::BillingPeriod;
use tracing::debug;

/// Result of checking a period's manifest
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManifestCheck {
    /// Not modified since the watermark
    Unchanged,
    /// A newer, validated manifest
    Changed {
        /// The parsed manifest
        manifest: ReportManifest,
        /// Modification time of the manifest object, the next watermark
        last_modified: DateTime<Utc>,
    },
}

/// Fetch the manifest of `period` unless it is unchanged since `watermark`
///
/// # Errors
///
/// Fails with the bucket's error, with
/// [`Json`](cur_exporter_core::ExporterError::Json) for an unparsable
/// manifest, and with
/// [`UntrustedManifest`](cur_exporter_core::ExporterError::UntrustedManifest)
/// when validation fails.
pub async fn fetch_manifest_if_changed(
    bucket: &dyn ReportBucket,
    source: &ReportSource,
    period: &BillingPeriod,
    watermark: Option<DateTime<Utc>>,
) -> Result<ManifestCheck> {
    let key = source.manifest_key(period);

    let object = match bucket.get_object(&key, watermark).await? {
        ObjectFetch::NotModified => {
            debug!("Manifest {} unchanged since {:?}", key, watermark);
            return Ok(ManifestCheck::Unchanged);
        }
        ObjectFetch::Modified(object) => object,
    };

    // Conditional requests are advisory for some stores
    if !modified_since(object.last_modified, watermark) {
        debug!("Manifest {} returned but not newer than watermark", key);
        return Ok(ManifestCheck::Unchanged);
    }

    let last_modified = object.last_modified;
    let bytes = object.read_to_end().await?;
    let manifest = ReportManifest::from_slice(&bytes, source)?;

    debug!(
        "Manifest {} changed (assembly {}, modified {})",
        key, manifest.assembly_id, last_modified
    );
    Ok(ManifestCheck::Changed {
        manifest,
        last_modified,
    })
}
