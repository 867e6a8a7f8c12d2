//! Report location and manifest types
//!
//! Each report instance is described by a `<report>-Manifest.json` object in
//! its period prefix. The manifest names the data parts and the bucket they
//! live in; it is validated before anything it points at is downloaded.

use crate::error::{ExporterError, Result};
use crate::period::BillingPeriod;
use serde::{Deserialize, Serialize};

/// Content type of the tabular report encoding the ingestor understands
pub const CSV_CONTENT_TYPE: &str = "text/csv";

/// Where the report exports live
///
/// AWS writes reports to `s3://<bucket>/<prefix>/<report>/<period>/`. With an
/// empty prefix the report root becomes `/<report>/`, matching how the
/// delivery service names objects in that case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportSource {
    /// Bucket holding the exports
    pub bucket: String,
    /// Report name as configured in the billing console
    pub report_name: String,
    /// Report path prefix (may be empty)
    pub prefix: String,
}

impl ReportSource {
    /// Create a source with an empty path prefix
    pub fn new(bucket: impl Into<String>, report_name: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            report_name: report_name.into(),
            prefix: String::new(),
        }
    }

    /// Set the report path prefix
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into().trim_end_matches('/').to_string();
        self
    }

    /// Prefix under which one sub-prefix per billing period exists
    pub fn root_prefix(&self) -> String {
        format!("{}/{}/", self.prefix, self.report_name)
    }

    /// Object key of a period's manifest
    pub fn manifest_key(&self, period: &BillingPeriod) -> String {
        format!(
            "{}{}/{}-Manifest.json",
            self.root_prefix(),
            period,
            self.report_name
        )
    }
}

/// Compression applied to report parts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Compression {
    /// gzip, the default for CSV exports
    #[serde(rename = "GZIP")]
    Gzip,
    /// Parts are stored uncompressed
    #[serde(rename = "NONE", alias = "")]
    None,
    /// Any encoding this exporter cannot decode
    #[serde(other)]
    Unknown,
}

/// Billing window as written in the manifest (`20240101T000000.000Z`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestPeriod {
    /// Period start timestamp
    pub start: String,
    /// Period end timestamp
    pub end: String,
}

/// Descriptor of one delivered report instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportManifest {
    /// Identifier shared by every part of this report instance
    pub assembly_id: String,
    /// Compression of the parts
    #[serde(default = "default_compression")]
    pub compression: Compression,
    /// MIME type of the decompressed parts
    pub content_type: String,
    /// Billing window the report covers
    pub billing_period: ManifestPeriod,
    /// Bucket holding the parts
    pub bucket: String,
    /// Ordered list of part object keys
    pub report_keys: Vec<String>,
}

fn default_compression() -> Compression {
    Compression::Gzip
}

impl ReportManifest {
    /// Parse a manifest and check it may be ingested from `source`
    ///
    /// # Errors
    ///
    /// [`ExporterError::Json`] when the document does not parse, and
    /// [`ExporterError::UntrustedManifest`] when validation fails.
    pub fn from_slice(bytes: &[u8], source: &ReportSource) -> Result<Self> {
        let manifest: ReportManifest = serde_json::from_slice(bytes)?;
        manifest.validate(source)?;
        Ok(manifest)
    }

    /// Reject manifests that point anywhere unexpected
    ///
    /// The content type must be CSV, the bucket must be the configured one,
    /// and at least one part must be listed.
    pub fn validate(&self, source: &ReportSource) -> Result<()> {
        if self.content_type != CSV_CONTENT_TYPE {
            return Err(ExporterError::UntrustedManifest(format!(
                "unknown content type: {}",
                self.content_type
            )));
        }

        if self.bucket != source.bucket {
            return Err(ExporterError::UntrustedManifest(format!(
                "unexpected bucket name: {}",
                self.bucket
            )));
        }

        if self.compression == Compression::Unknown {
            return Err(ExporterError::UntrustedManifest(
                "unknown compression".to_string(),
            ));
        }

        if self.report_keys.is_empty() {
            return Err(ExporterError::UntrustedManifest(
                "manifest contains no report keys".to_string(),
            ));
        }

        if self.assembly_id.is_empty() {
            return Err(ExporterError::UntrustedManifest(
                "manifest has no assembly id".to_string(),
            ));
        }

        Ok(())
    }
}
