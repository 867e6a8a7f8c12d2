//! SQLite record store for cur-exporter
//!
//! Holds every ingested usage line, keyed by the billing period it was
//! ingested under, plus one marker row per period naming the report instance
//! (assembly) the rows came from.
//!
//! Replacing a period runs in a single transaction on a blocking thread. Rows
//! are streamed to it through a bounded channel by a [`PeriodWriter`]; if the
//! writer is dropped or aborted before [`PeriodWriter::commit`], the
//! transaction rolls back and the previous content of the period stays
//! visible.
//!
//! # Examples
//!
//! ```
//! use cur_exporter_core::record::{AggregateQuery, Dimension, Measure, UsageRecord};
//! use cur_exporter_store::RecordStore;
//!
//! # async fn example() -> cur_exporter_core::Result<()> {
//! let store = RecordStore::open_in_memory()?;
//!
//! let mut writer = store.replace_period("20240101-20240201", "assembly-1");
//! writer
//!     .write(vec![UsageRecord {
//!         product: "Amazon S3".to_string(),
//!         cost: 1.5,
//!         ..Default::default()
//!     }])
//!     .await?;
//! writer.commit().await?;
//!
//! let rows = store.aggregate(&AggregateQuery::new(Measure::Cost).group_by(Dimension::Product))?;
//! assert_eq!(rows[0].value, 1.5);
//! # Ok(())
//! # }
//! ```

use cur_exporter_core::error::{ExporterError, Result};
use cur_exporter_core::record::{AggregateQuery, Dimension, GroupRow, Measure, UsageRecord};
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Batches queued between the ingestor and the writer thread
const WRITER_QUEUE_DEPTH: usize = 4;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS records (
    period TEXT NOT NULL,
    billing_period_start TEXT NOT NULL,
    billing_period_end TEXT NOT NULL,
    product TEXT NOT NULL,
    operation TEXT NOT NULL,
    line_item_type TEXT NOT NULL,
    usage_type TEXT NOT NULL,
    unit TEXT NOT NULL,
    currency TEXT NOT NULL,
    account TEXT NOT NULL,
    usage_amount REAL NOT NULL,
    cost REAL NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_records_period ON records(period);
CREATE TABLE IF NOT EXISTS ingested_reports (
    period TEXT PRIMARY KEY,
    assembly_id TEXT NOT NULL,
    row_count INTEGER NOT NULL,
    ingested_at TEXT NOT NULL
);
";

const INSERT_RECORD: &str = "INSERT INTO records ( \
    period, billing_period_start, billing_period_end, product, operation, \
    line_item_type, usage_type, unit, currency, account, usage_amount, cost \
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)";

/// Durable table of usage records
///
/// Clones share one connection.
#[derive(Debug, Clone)]
pub struct RecordStore {
    conn: Arc<Mutex<Connection>>,
}

impl RecordStore {
    /// Open or create a store at `path`
    ///
    /// # Errors
    ///
    /// Returns an error if the parent directory cannot be created, the
    /// database cannot be opened, or the schema cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        debug!("Opened record store at {}", path.display());
        Self::with_connection(conn)
    }

    /// Open a store that lives only as long as this value and its clones
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Connection> {
        lock_connection(&self.conn)
    }

    /// Start replacing every record of `period` with the rows of report
    /// instance `assembly_id`
    ///
    /// The connection stays locked by the writer until it commits or is
    /// abandoned, so other store calls made in the meantime wait for it.
    pub fn replace_period(&self, period: &str, assembly_id: &str) -> PeriodWriter {
        let (commands, receiver) = mpsc::channel(WRITER_QUEUE_DEPTH);
        let conn = Arc::clone(&self.conn);
        let period = period.to_string();
        let assembly_id = assembly_id.to_string();

        let handle = tokio::task::spawn_blocking(move || {
            write_period(&conn, &period, &assembly_id, receiver)
        });

        PeriodWriter {
            commands,
            handle: Some(handle),
        }
    }

    /// Assembly id of the report instance last committed for `period`
    pub fn ingested_assembly(&self, period: &str) -> Result<Option<String>> {
        let conn = self.lock();
        let assembly = conn
            .query_row(
                "SELECT assembly_id FROM ingested_reports WHERE period = ?1",
                params![period],
                |row| row.get(0),
            )
            .optional()?;
        Ok(assembly)
    }

    /// Number of records stored for `period`
    pub fn row_count(&self, period: &str) -> Result<u64> {
        let conn = self.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM records WHERE period = ?1",
            params![period],
            |row| row.get(0),
        )?;
        Ok(count.max(0) as u64)
    }

    /// Number of records across all periods
    pub fn total_rows(&self) -> Result<u64> {
        let conn = self.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM records", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    /// Periods with a committed report, in ascending order
    pub fn periods(&self) -> Result<Vec<String>> {
        let conn = self.lock();
        let mut stmt = conn.prepare_cached("SELECT period FROM ingested_reports ORDER BY period")?;
        let periods = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(periods)
    }

    /// Delete every period not listed in `keep`, returning how many were dropped
    pub fn retain_periods(&self, keep: &[String]) -> Result<usize> {
        let mut conn = self.lock();
        let stale: Vec<String> = {
            let mut stmt = conn.prepare_cached(
                "SELECT period FROM ingested_reports \
                 UNION SELECT DISTINCT period FROM records",
            )?;
            stmt.query_map([], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?
                .into_iter()
                .filter(|period| !keep.contains(period))
                .collect()
        };

        if stale.is_empty() {
            return Ok(0);
        }

        let tx = conn.transaction()?;
        for period in &stale {
            let rows = tx.execute("DELETE FROM records WHERE period = ?1", params![period])?;
            tx.execute(
                "DELETE FROM ingested_reports WHERE period = ?1",
                params![period],
            )?;
            info!("Pruned period {} ({} records)", period, rows);
        }
        tx.commit()?;

        Ok(stale.len())
    }

    /// Run a grouped aggregation over all stored records
    ///
    /// Rows come back ordered by their labels. A query without grouping
    /// dimensions yields exactly one row.
    ///
    /// # Errors
    ///
    /// Returns [`ExporterError::QueryFailure`] if the store cannot evaluate
    /// the query.
    pub fn aggregate(&self, query: &AggregateQuery) -> Result<Vec<GroupRow>> {
        let sql = aggregate_sql(query);
        let filter_values: Vec<&str> = query.filters.values().map(String::as_str).collect();
        let label_count = query.group_by.len();

        let conn = self.lock();
        let query_failure = |e: rusqlite::Error| ExporterError::QueryFailure(e.to_string());

        let mut stmt = conn.prepare_cached(&sql).map_err(query_failure)?;
        let rows = stmt
            .query_map(params_from_iter(filter_values), |row| {
                let mut labels = Vec::with_capacity(label_count);
                for i in 0..label_count {
                    labels.push(row.get::<_, String>(i)?);
                }
                Ok(GroupRow {
                    labels,
                    value: row.get(label_count)?,
                })
            })
            .map_err(query_failure)?
            .collect::<rusqlite::Result<Vec<GroupRow>>>()
            .map_err(query_failure)?;

        Ok(rows)
    }
}

fn lock_connection(conn: &Mutex<Connection>) -> MutexGuard<'_, Connection> {
    conn.lock().unwrap_or_else(PoisonError::into_inner)
}

fn column(dimension: Dimension) -> &'static str {
    match dimension {
        Dimension::BillingPeriod => "period",
        Dimension::Product => "product",
        Dimension::Operation => "operation",
        Dimension::LineItemType => "line_item_type",
        Dimension::UsageType => "usage_type",
        Dimension::Unit => "unit",
        Dimension::Currency => "currency",
        Dimension::Account => "account",
    }
}

fn aggregate_sql(query: &AggregateQuery) -> String {
    let value = match query.measure {
        Measure::UsageAmount => "COALESCE(SUM(usage_amount), 0.0)",
        Measure::Cost => "COALESCE(SUM(cost), 0.0)",
        Measure::LineItems => "CAST(COUNT(*) AS REAL)",
    };

    let columns: Vec<&str> = query.group_by.iter().copied().map(column).collect();

    let mut sql = String::from("SELECT ");
    for col in &columns {
        sql.push_str(col);
        sql.push_str(", ");
    }
    sql.push_str(value);
    sql.push_str(" FROM records");

    if !query.filters.is_empty() {
        let conditions: Vec<String> = query
            .filters
            .keys()
            .enumerate()
            .map(|(i, dimension)| format!("{} = ?{}", column(*dimension), i + 1))
            .collect();
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }

    if !columns.is_empty() {
        let grouped = columns.join(", ");
        sql.push_str(" GROUP BY ");
        sql.push_str(&grouped);
        sql.push_str(" ORDER BY ");
        sql.push_str(&grouped);
    }

    sql
}

enum WriterCommand {
    Rows(Vec<UsageRecord>),
    Commit,
}

fn write_period(
    conn: &Mutex<Connection>,
    period: &str,
    assembly_id: &str,
    mut commands: mpsc::Receiver<WriterCommand>,
) -> Result<u64> {
    let mut conn = lock_connection(conn);
    let tx = conn.transaction()?;

    let replaced = tx.execute("DELETE FROM records WHERE period = ?1", params![period])?;
    debug!("Replacing {} existing records of {}", replaced, period);

    let mut rows = 0u64;
    let mut committed = false;
    {
        let mut insert = tx.prepare_cached(INSERT_RECORD)?;
        while let Some(command) = commands.blocking_recv() {
            match command {
                WriterCommand::Rows(batch) => {
                    for record in &batch {
                        insert.execute(params![
                            period,
                            record.billing_period_start,
                            record.billing_period_end,
                            record.product,
                            record.operation,
                            record.line_item_type,
                            record.usage_type,
                            record.unit,
                            record.currency,
                            record.account,
                            record.usage_amount,
                            record.cost,
                        ])?;
                    }
                    rows += batch.len() as u64;
                }
                WriterCommand::Commit => {
                    committed = true;
                    break;
                }
            }
        }
    }

    if !committed {
        warn!("Ingestion of {} abandoned, rolling back", period);
        return Err(ExporterError::QueryFailure(format!(
            "ingestion of {period} abandoned before commit"
        )));
    }

    tx.execute(
        "INSERT OR REPLACE INTO ingested_reports (period, assembly_id, row_count, ingested_at) \
         VALUES (?1, ?2, ?3, ?4)",
        params![
            period,
            assembly_id,
            rows as i64,
            chrono::Utc::now().to_rfc3339()
        ],
    )?;
    tx.commit()?;

    info!("Committed {} records for {} ({})", rows, period, assembly_id);
    Ok(rows)
}

/// Handle feeding one period replacement
///
/// Dropping it without calling [`commit`](Self::commit) rolls the
/// replacement back.
pub struct PeriodWriter {
    commands: mpsc::Sender<WriterCommand>,
    handle: Option<JoinHandle<Result<u64>>>,
}

impl PeriodWriter {
    /// Queue a batch of records, waiting while the writer is behind
    pub async fn write(&mut self, batch: Vec<UsageRecord>) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        if self.commands.send(WriterCommand::Rows(batch)).await.is_err() {
            return Err(self.writer_failure().await);
        }
        Ok(())
    }

    /// Commit the replacement, returning the number of records written
    pub async fn commit(mut self) -> Result<u64> {
        if self.commands.send(WriterCommand::Commit).await.is_err() {
            return Err(self.writer_failure().await);
        }
        match self.handle.take() {
            Some(handle) => handle.await.map_err(join_failure)?,
            None => Err(ExporterError::QueryFailure(
                "period writer already finished".to_string(),
            )),
        }
    }

    /// Roll the replacement back and wait for the writer to release the store
    pub async fn abort(self) {
        let PeriodWriter { commands, handle } = self;
        drop(commands);
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    async fn writer_failure(&mut self) -> ExporterError {
        match self.handle.take() {
            Some(handle) => match handle.await {
                Ok(Err(e)) => e,
                Ok(Ok(_)) => ExporterError::QueryFailure("period writer stopped early".to_string()),
                Err(e) => join_failure(e),
            },
            None => ExporterError::QueryFailure("period writer already finished".to_string()),
        }
    }
}

fn join_failure(err: tokio::task::JoinError) -> ExporterError {
    ExporterError::QueryFailure(format!("period writer failed: {err}"))
}
