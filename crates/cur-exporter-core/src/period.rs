//! Billing period model
//!
//! Cost and Usage Reports are delivered under one prefix per billing period,
//! named after the period's start and end dates (`20240101-20240201`). This
//! module parses those names into [`BillingPeriod`] values that order
//! chronologically and print back exactly as they were read.
//!
//! # Examples
//!
//! ```
//! use cur_exporter_core::period::BillingPeriod;
//!
//! let january = BillingPeriod::parse("20240101-20240201").unwrap();
//! let february = BillingPeriod::parse("20240201-20240301").unwrap();
//!
//! assert!(january < february);
//! assert_eq!(january.canonical_form(), "20240101-20240201");
//! ```

use crate::error::{ExporterError, Result};
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Textual layout a period was written in
///
/// The layout is kept so that a parsed period formats back to the exact
/// string it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PeriodLayout {
    /// `YYYYMMDD-YYYYMMDD`, as written by AWS
    Compact,
    /// `YYYY-MM-DD-YYYY-MM-DD`
    Dashed,
}

/// A billing window `[start, end)` with UTC-midnight boundaries
///
/// Ordering is chronological: by start date, then end date. Periods are
/// serialized as their canonical string so they can key JSON maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BillingPeriod {
    start: NaiveDate,
    end: NaiveDate,
    layout: PeriodLayout,
}

impl BillingPeriod {
    /// Create a period from explicit dates using the compact layout
    ///
    /// # Errors
    ///
    /// Returns [`ExporterError::MalformedPeriod`] unless `start < end`.
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self> {
        Self::with_layout(start, end, PeriodLayout::Compact)
    }

    fn with_layout(start: NaiveDate, end: NaiveDate, layout: PeriodLayout) -> Result<Self> {
        if start >= end {
            return Err(ExporterError::MalformedPeriod(format!(
                "period start {start} is not before end {end}"
            )));
        }
        Ok(Self { start, end, layout })
    }

    /// Parse a period prefix name
    ///
    /// Accepts `YYYYMMDD-YYYYMMDD` and `YYYY-MM-DD-YYYY-MM-DD`.
    ///
    /// # Errors
    ///
    /// Returns [`ExporterError::MalformedPeriod`] for anything else, for
    /// impossible calendar dates, and when the start is not before the end.
    pub fn parse(raw: &str) -> Result<Self> {
        let malformed = || ExporterError::MalformedPeriod(raw.to_string());
        if !raw.is_ascii() {
            return Err(malformed());
        }

        let (layout, start_raw, end_raw) = match raw.len() {
            17 if raw.as_bytes()[8] == b'-' => (PeriodLayout::Compact, &raw[..8], &raw[9..]),
            21 if raw.as_bytes()[10] == b'-' => (PeriodLayout::Dashed, &raw[..10], &raw[11..]),
            _ => return Err(malformed()),
        };

        let start = parse_date(start_raw, layout).ok_or_else(malformed)?;
        let end = parse_date(end_raw, layout).ok_or_else(malformed)?;
        Self::with_layout(start, end, layout)
    }

    /// First day of the period
    pub fn start(&self) -> NaiveDate {
        self.start
    }

    /// First day after the period
    pub fn end(&self) -> NaiveDate {
        self.end
    }

    /// Layout used by [`canonical_form`](Self::canonical_form)
    pub fn layout(&self) -> PeriodLayout {
        self.layout
    }

    /// The instant the period closes
    pub fn end_instant(&self) -> DateTime<Utc> {
        self.end.and_time(chrono::NaiveTime::MIN).and_utc()
    }

    /// Canonical string form, identical to the string the period was parsed from
    pub fn canonical_form(&self) -> String {
        match self.layout {
            PeriodLayout::Compact => {
                format!("{}-{}", compact(self.start), compact(self.end))
            }
            PeriodLayout::Dashed => format!("{}-{}", dashed(self.start), dashed(self.end)),
        }
    }

    /// Whether the billing window has closed at `now`
    ///
    /// A closed period can still receive late corrections, and a new period
    /// has likely opened, so the orchestrator re-lists periods once this
    /// becomes true for the newest known period.
    pub fn is_past_due(&self, now: DateTime<Utc>) -> bool {
        now >= self.end_instant()
    }
}

fn parse_date(raw: &str, layout: PeriodLayout) -> Option<NaiveDate> {
    let bytes = raw.as_bytes();
    let (year, month, day) = match layout {
        PeriodLayout::Compact => (&raw[..4], &raw[4..6], &raw[6..8]),
        PeriodLayout::Dashed => {
            if bytes[4] != b'-' || bytes[7] != b'-' {
                return None;
            }
            (&raw[..4], &raw[5..7], &raw[8..10])
        }
    };

    if ![year, month, day]
        .iter()
        .all(|part| part.bytes().all(|b| b.is_ascii_digit()))
    {
        return None;
    }

    NaiveDate::from_ymd_opt(year.parse().ok()?, month.parse().ok()?, day.parse().ok()?)
}

fn compact(date: NaiveDate) -> String {
    format!("{:04}{:02}{:02}", date.year(), date.month(), date.day())
}

fn dashed(date: NaiveDate) -> String {
    format!("{:04}-{:02}-{:02}", date.year(), date.month(), date.day())
}

impl fmt::Display for BillingPeriod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical_form())
    }
}

impl FromStr for BillingPeriod {
    type Err = ExporterError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for BillingPeriod {
    type Error = ExporterError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<BillingPeriod> for String {
    fn from(period: BillingPeriod) -> Self {
        period.canonical_form()
    }
}
