//! Persisted exporter state
//!
//! The state records which billing periods are in the window and, per
//! period, the modification time of the last manifest that was ingested.
//! On disk it is a small JSON document:
//!
//! ```json
//! {"periods": ["20240101-20240201"], "lastModified": {"20240101-20240201": "2024-01-15T08:00:00Z"}}
//! ```
//!
//! Saves go through a temporary file in the same directory that is synced
//! and renamed over the target, so a reader sees either the old or the new
//! document.

use chrono::{DateTime, Utc};
use cur_exporter_core::error::{ExporterError, Result};
use cur_exporter_core::period::BillingPeriod;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::debug;

/// Periods in the window and their watermarks
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExporterState {
    periods: Vec<BillingPeriod>,
    #[serde(default)]
    last_modified: BTreeMap<BillingPeriod, DateTime<Utc>>,
}

impl ExporterState {
    /// Periods in the window, oldest first
    pub fn periods(&self) -> &[BillingPeriod] {
        &self.periods
    }

    /// Most recent period in the window
    pub fn latest_period(&self) -> Option<&BillingPeriod> {
        self.periods.last()
    }

    /// Modification time of the last ingested manifest of `period`
    pub fn watermark(&self, period: &BillingPeriod) -> Option<DateTime<Utc>> {
        self.last_modified.get(period).copied()
    }

    /// All recorded watermarks
    pub fn watermarks(&self) -> &BTreeMap<BillingPeriod, DateTime<Utc>> {
        &self.last_modified
    }

    /// Move the watermark of `period` forward to `ts`
    ///
    /// Returns `false` and leaves the watermark alone if `ts` is older.
    pub fn advance_watermark(&mut self, period: &BillingPeriod, ts: DateTime<Utc>) -> bool {
        match self.last_modified.get(period) {
            Some(current) if *current >= ts => false,
            _ => {
                self.last_modified.insert(*period, ts);
                true
            }
        }
    }

    /// Replace the period window
    ///
    /// Watermarks of periods leaving the window are dropped. Returns whether
    /// anything changed.
    pub fn replace_periods(&mut self, periods: Vec<BillingPeriod>) -> bool {
        let before = self.last_modified.len();
        self.last_modified.retain(|period, _| periods.contains(period));
        let changed = self.periods != periods || self.last_modified.len() != before;
        self.periods = periods;
        changed
    }
}

/// Location of the persisted [`ExporterState`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    /// State stored at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the state document
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the state back
    ///
    /// A missing file is an empty state.
    ///
    /// # Errors
    ///
    /// [`ExporterError::CorruptState`] if the file exists but cannot be read
    /// or parsed.
    pub async fn load(&self) -> Result<ExporterState> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No state at {}, starting empty", self.path.display());
                return Ok(ExporterState::default());
            }
            Err(e) => return Err(self.corrupt(e.to_string())),
        };

        let state: ExporterState =
            serde_json::from_slice(&bytes).map_err(|e| self.corrupt(e.to_string()))?;
        debug!(
            "Loaded state with {} period(s) from {}",
            state.periods.len(),
            self.path.display()
        );
        Ok(state)
    }

    /// Atomically replace the persisted state
    pub async fn save(&self, state: &ExporterState) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(state)?;
        let path = self.path.clone();

        tokio::task::spawn_blocking(move || write_atomically(&path, &bytes))
            .await
            .map_err(|e| ExporterError::Io(std::io::Error::other(e)))??;

        debug!("Saved state to {}", self.path.display());
        Ok(())
    }

    /// Remove the persisted state
    pub async fn remove(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn corrupt(&self, reason: String) -> ExporterError {
        ExporterError::CorruptState {
            path: self.path.clone(),
            reason,
        }
    }
}

fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let mut file = NamedTempFile::new_in(dir)?;
    file.write_all(bytes)?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| ExporterError::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn period(raw: &str) -> BillingPeriod {
        BillingPeriod::parse(raw).unwrap()
    }

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 2, day, 6, 0, 0).unwrap()
    }

    #[test]
    fn test_watermark_never_moves_backwards() {
        let mut state = ExporterState::default();
        let p = period("20240201-20240301");

        assert!(state.advance_watermark(&p, at(5)));
        assert!(!state.advance_watermark(&p, at(3)));
        assert!(!state.advance_watermark(&p, at(5)));
        assert_eq!(state.watermark(&p), Some(at(5)));
        assert!(state.advance_watermark(&p, at(9)));
        assert_eq!(state.watermark(&p), Some(at(9)));
    }

    #[test]
    fn test_replace_periods_drops_stale_watermarks() {
        let mut state = ExporterState::default();
        let old = period("20231201-20240101");
        let jan = period("20240101-20240201");
        let feb = period("20240201-20240301");

        assert!(state.replace_periods(vec![old, jan]));
        state.advance_watermark(&old, at(1));
        state.advance_watermark(&jan, at(1));

        assert!(!state.replace_periods(vec![old, jan]));
        assert!(state.replace_periods(vec![jan, feb]));
        assert_eq!(state.periods(), &[jan, feb]);
        assert_eq!(state.latest_period(), Some(&feb));
        assert_eq!(state.watermark(&old), None);
        assert_eq!(state.watermark(&jan), Some(at(1)));
    }

    #[test]
    fn test_json_layout() {
        let mut state = ExporterState::default();
        let p = period("2024-01-01-2024-02-01");
        state.replace_periods(vec![p]);
        state.advance_watermark(&p, Utc.with_ymd_and_hms(2024, 1, 15, 8, 0, 0).unwrap());

        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "periods": ["2024-01-01-2024-02-01"],
                "lastModified": {"2024-01-01-2024-02-01": "2024-01-15T08:00:00Z"},
            })
        );
    }

    #[tokio::test]
    async fn test_load_missing_is_empty() {
        let dir = TempDir::new().unwrap();
        let file = StateFile::new(dir.path().join("state.json"));
        assert_eq!(file.load().await.unwrap(), ExporterState::default());
    }

    #[tokio::test]
    async fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let file = StateFile::new(dir.path().join("sub").join("state.json"));

        let mut state = ExporterState::default();
        let p = period("20240201-20240301");
        state.replace_periods(vec![p]);
        state.advance_watermark(&p, at(2));

        file.save(&state).await.unwrap();
        assert_eq!(file.load().await.unwrap(), state);

        // Only the target remains in the directory
        let entries = std::fs::read_dir(dir.path().join("sub")).unwrap().count();
        assert_eq!(entries, 1);
    }

    #[tokio::test]
    async fn test_malformed_file_is_corrupt_state() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{\"periods\": [\"not-a-period\"]}").unwrap();

        let err = StateFile::new(&path).load().await.unwrap_err();
        match err {
            ExporterError::CorruptState { path: reported, .. } => assert_eq!(reported, path),
            other => panic!("unexpected error: {other}"),
        }

        std::fs::write(&path, "{truncated").unwrap();
        assert!(matches!(
            StateFile::new(&path).load().await.unwrap_err(),
            ExporterError::CorruptState { .. }
        ));
    }
}
