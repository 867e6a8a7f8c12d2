//! Local directory report bucket
//!
//! Serves a directory tree laid out like the report bucket, for example a
//! `aws s3 sync` mirror. Object keys map to paths below the root with any
//! leading `/` removed, and file modification times stand in for S3's
//! `Last-Modified`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cur_exporter_core::bucket::{ObjectFetch, RemoteObject, ReportBucket, modified_since};
use cur_exporter_core::error::{ExporterError, Result};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

/// Report bucket backed by a local directory
#[derive(Debug, Clone)]
pub struct LocalBucket {
    root: PathBuf,
}

impl LocalBucket {
    /// Serve objects below `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Directory this bucket reads from
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(key.trim_start_matches('/'))
    }
}

fn transfer_error(key: &str, err: std::io::Error) -> ExporterError {
    ExporterError::TransferFailure(format!("reading {key}: {err}"))
}

#[async_trait]
impl ReportBucket for LocalBucket {
    async fn list_prefixes(&self, prefix: &str) -> Result<Vec<String>> {
        let dir = self.path_for(prefix);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("Prefix directory {} does not exist", dir.display());
                return Ok(Vec::new());
            }
            Err(e) => return Err(transfer_error(prefix, e)),
        };

        let mut prefixes = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| transfer_error(prefix, e))?
        {
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| transfer_error(prefix, e))?;
            if !file_type.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                prefixes.push(format!("{prefix}{name}/"));
            }
        }

        prefixes.sort();
        Ok(prefixes)
    }

    async fn get_object(
        &self,
        key: &str,
        if_modified_since: Option<DateTime<Utc>>,
    ) -> Result<ObjectFetch> {
        let path = self.path_for(key);
        let metadata = tokio::fs::metadata(&path)
            .await
            .map_err(|e| transfer_error(key, e))?;
        let last_modified: DateTime<Utc> = metadata
            .modified()
            .map_err(|e| transfer_error(key, e))?
            .into();

        if !modified_since(last_modified, if_modified_since) {
            trace!("{} not modified since {:?}", path.display(), if_modified_since);
            return Ok(ObjectFetch::NotModified);
        }

        let file = tokio::fs::File::open(&path)
            .await
            .map_err(|e| transfer_error(key, e))?;

        Ok(ObjectFetch::Modified(RemoteObject {
            last_modified,
            body: Box::pin(file),
        }))
    }
}
