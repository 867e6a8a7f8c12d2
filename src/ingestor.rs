//! Report ingestion
//!
//! Loads every part listed by a validated manifest into the record store as
//! one unit. Parts are fetched in order, decompressed while streaming, parsed
//! as CSV with a header row, and pushed to a [`PeriodWriter`] in batches. The
//! period's previous records stay visible until the writer commits; any error
//! on the way rolls the whole replacement back.
//!
//! Columns are looked up by header name, so parts with extra or reordered
//! columns load the same way.

use async_compression::tokio::bufread::GzipDecoder;
use csv_async::{AsyncReaderBuilder, StringRecord};
use cur_exporter_core::bucket::{ObjectBody, ObjectFetch, ReportBucket};
use cur_exporter_core::error::{ExporterError, Result};
use cur_exporter_core::manifest::{Compression, ReportManifest};
use cur_exporter_core::period::BillingPeriod;
use cur_exporter_core::record::{REQUIRED_COLUMNS, UsageRecord};
use cur_exporter_store::{PeriodWriter, RecordStore};
use futures::{Stream, StreamExt};
use std::sync::Arc;
use tokio::io::BufReader;
use tracing::{debug, info, warn};

/// Default number of records handed to the store at once
pub const DEFAULT_BATCH_SIZE: usize = 1_000;

/// Result of an ingestion attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// The period's records were replaced
    Ingested {
        /// Records written
        rows: u64,
        /// Parts read
        parts: usize,
    },
    /// The store already holds this report instance
    AlreadyIngested,
}

/// Loads report parts into a [`RecordStore`]
#[derive(Clone)]
pub struct ReportIngestor {
    bucket: Arc<dyn ReportBucket>,
    store: RecordStore,
    batch_size: usize,
}

impl ReportIngestor {
    /// Create an ingestor reading from `bucket` into `store`
    pub fn new(bucket: Arc<dyn ReportBucket>, store: RecordStore) -> Self {
        Self {
            bucket,
            store,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Set how many records are sent to the store per batch
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Replace the stored records of `period` with the parts of `manifest`
    ///
    /// Skips the work when the store's marker for the period already names
    /// the manifest's assembly id.
    ///
    /// # Errors
    ///
    /// Any transfer, decoding, or record error aborts the ingestion and
    /// leaves the period's previous records in place.
    pub async fn ingest(
        &self,
        period: &BillingPeriod,
        manifest: &ReportManifest,
    ) -> Result<IngestOutcome> {
        let period_key = period.canonical_form();

        if self.store.ingested_assembly(&period_key)?.as_deref() == Some(manifest.assembly_id.as_str()) {
            info!(
                "Report {} for {} already ingested, skipping",
                manifest.assembly_id, period
            );
            return Ok(IngestOutcome::AlreadyIngested);
        }

        info!(
            "Ingesting {} part(s) of report {} for {}",
            manifest.report_keys.len(),
            manifest.assembly_id,
            period
        );

        let mut writer = self.store.replace_period(&period_key, &manifest.assembly_id);
        for key in &manifest.report_keys {
            if let Err(e) = self.load_part(key, manifest.compression, &mut writer).await {
                warn!("Ingestion of {} failed at {}: {}", period, key, e);
                writer.abort().await;
                return Err(e);
            }
        }

        let rows = writer.commit().await?;
        Ok(IngestOutcome::Ingested {
            rows,
            parts: manifest.report_keys.len(),
        })
    }

    async fn load_part(
        &self,
        key: &str,
        compression: Compression,
        writer: &mut PeriodWriter,
    ) -> Result<u64> {
        let object = match self.bucket.get_object(key, None).await? {
            ObjectFetch::Modified(object) => object,
            ObjectFetch::NotModified => {
                return Err(ExporterError::TransferFailure(format!(
                    "unconditional get of {key} returned no body"
                )));
            }
        };

        let body = decode(object.body, compression)?;
        let records = read_usage_records(body, key.to_string());
        futures::pin_mut!(records);

        let mut rows = 0u64;
        let mut batch = Vec::with_capacity(self.batch_size);
        while let Some(record) = records.next().await {
            batch.push(record?);
            if batch.len() >= self.batch_size {
                rows += batch.len() as u64;
                writer
                    .write(std::mem::replace(&mut batch, Vec::with_capacity(self.batch_size)))
                    .await?;
            }
        }
        rows += batch.len() as u64;
        writer.write(batch).await?;

        debug!("Read {} records from {}", rows, key);
        Ok(rows)
    }
}

fn decode(body: ObjectBody, compression: Compression) -> Result<ObjectBody> {
    match compression {
        Compression::Gzip => {
            let mut decoder = GzipDecoder::new(BufReader::new(body));
            decoder.multiple_members(true);
            Ok(Box::pin(decoder))
        }
        Compression::None => Ok(body),
        Compression::Unknown => Err(ExporterError::UntrustedManifest(
            "unknown compression".to_string(),
        )),
    }
}

/// Stream the usage records of one CSV part
///
/// The header row is read once and every required column is resolved by
/// name before the first record is produced.
pub fn read_usage_records(body: ObjectBody, key: String) -> impl Stream<Item = Result<UsageRecord>> {
    async_stream::stream! {
        let mut reader = AsyncReaderBuilder::new()
            .has_headers(true)
            .create_reader(body);

        let columns = match reader.headers().await {
            Ok(headers) => ColumnMap::resolve(headers, &key),
            Err(e) => Err(csv_error(&key, e)),
        };
        let columns = match columns {
            Ok(columns) => columns,
            Err(e) => {
                yield Err(e);
                return;
            }
        };

        let mut row = StringRecord::new();
        loop {
            match reader.read_record(&mut row).await {
                Ok(true) => {
                    let line = row.position().map(|p| p.line()).unwrap_or_default();
                    yield columns.record(&row, &key, line);
                }
                Ok(false) => break,
                Err(e) => {
                    yield Err(csv_error(&key, e));
                    return;
                }
            }
        }
    }
}

fn csv_error(key: &str, err: csv_async::Error) -> ExporterError {
    let line = err.position().map(|p| p.line()).unwrap_or_default();
    match err.into_kind() {
        csv_async::ErrorKind::Io(e) => {
            ExporterError::TransferFailure(format!("reading {key}: {e}"))
        }
        kind => ExporterError::InvalidRecord {
            key: key.to_string(),
            line,
            reason: format!("{kind:?}"),
        },
    }
}

/// Positions of [`REQUIRED_COLUMNS`] in a part's header
#[derive(Debug, Clone, PartialEq, Eq)]
struct ColumnMap {
    indices: [usize; REQUIRED_COLUMNS.len()],
}

impl ColumnMap {
    fn resolve(headers: &StringRecord, key: &str) -> Result<Self> {
        let mut indices = [0; REQUIRED_COLUMNS.len()];
        for (slot, column) in indices.iter_mut().zip(REQUIRED_COLUMNS) {
            *slot = headers
                .iter()
                .position(|header| header.trim_start_matches('\u{feff}').trim() == column)
                .ok_or_else(|| ExporterError::MissingColumn {
                    column: column.to_string(),
                    key: key.to_string(),
                })?;
        }
        Ok(Self { indices })
    }

    fn record(&self, row: &StringRecord, key: &str, line: u64) -> Result<UsageRecord> {
        let text = |i: usize| row.get(self.indices[i]).unwrap_or_default().to_string();
        let amount = |i: usize| {
            parse_amount(row.get(self.indices[i]).unwrap_or_default()).map_err(|reason| {
                ExporterError::InvalidRecord {
                    key: key.to_string(),
                    line,
                    reason: format!("{}: {}", REQUIRED_COLUMNS[i], reason),
                }
            })
        };

        Ok(UsageRecord {
            billing_period_start: text(0),
            billing_period_end: text(1),
            product: text(2),
            operation: text(3),
            line_item_type: text(4),
            usage_type: text(5),
            unit: text(6),
            currency: text(7),
            account: text(8),
            usage_amount: amount(9)?,
            cost: amount(10)?,
        })
    }
}

/// Empty cells count as zero
fn parse_amount(raw: &str) -> std::result::Result<f64, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(0.0);
    }
    raw.parse::<f64>()
        .map_err(|_| format!("not a number: {raw:?}"))
}
