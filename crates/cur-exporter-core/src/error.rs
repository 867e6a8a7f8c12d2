//! Error types for cur-exporter
//!
//! This module defines the error types used throughout the cur-exporter crates.
//! All errors are derived from `thiserror` for convenient error handling
//! and automatic `From` implementations.
//!
//! # Example
//!
//! ```
//! use cur_exporter_core::error::{ExporterError, Result};
//!
//! fn example_function() -> Result<()> {
//!     // This will automatically convert io::Error to ExporterError
//!     let _file = std::fs::read_to_string("nonexistent.txt")?;
//!     Ok(())
//! }
//! ```

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for cur-exporter operations
///
/// Each pipeline stage fails with its own variant so that callers can tell a
/// malformed listing from an untrusted manifest or a dropped connection.
#[derive(Error, Debug)]
pub enum ExporterError {
    /// IO error occurred
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    /// A remote period prefix could not be parsed
    #[error("Malformed billing period: {0}")]
    MalformedPeriod(String),

    /// The manifest failed validation and must not be ingested
    #[error("Untrusted report manifest: {0}")]
    UntrustedManifest(String),

    /// A required column is absent from a report part header
    #[error("Missing column {column} in {key}")]
    MissingColumn {
        /// The required column name
        column: String,
        /// Object key of the report part
        key: String,
    },

    /// A report row could not be converted into a usage record
    #[error("Invalid record at line {line} of {key}: {reason}")]
    InvalidRecord {
        /// Object key of the report part
        key: String,
        /// One-based line number including the header row
        line: u64,
        /// What was wrong with the row
        reason: String,
    },

    /// Network failure, timeout, or cancelled transfer
    #[error("Transfer failure: {0}")]
    TransferFailure(String),

    /// The persisted exporter state could not be read back
    #[error("Corrupt state file {path}: {reason}")]
    CorruptState {
        /// The state file path
        path: PathBuf,
        /// Why the file was rejected
        reason: String,
    },

    /// An aggregation failed to execute against the store
    #[error("Query failure: {0}")]
    QueryFailure(String),

    /// An aggregation definition is malformed
    #[error("Invalid aggregation: {0}")]
    InvalidAggregation(String),

    /// Record store error
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Metric registry error
    #[error("Metrics error: {0}")]
    Metrics(String),
}

impl ExporterError {
    /// Whether this error came from talking to the remote bucket
    pub fn is_transfer(&self) -> bool {
        matches!(self, ExporterError::TransferFailure(_))
    }
}

/// Convenience type alias for Results in cur-exporter
///
/// # Example
///
/// ```
/// use cur_exporter_core::Result;
///
/// fn process_data() -> Result<String> {
///     Ok("Processed successfully".to_string())
/// }
/// ```
pub type Result<T> = std::result::Result<T, ExporterError>;
