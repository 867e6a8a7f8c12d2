//! Object storage capability trait
//!
//! This module defines the `ReportBucket` trait every report source
//! implements. The pipeline only ever needs two things from object storage:
//! list the sub-prefixes under a prefix, and fetch an object, optionally only
//! if it changed since a given instant.

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Streaming object body
pub type ObjectBody = Pin<Box<dyn AsyncRead + Send>>;

/// A fetched object
pub struct RemoteObject {
    /// Modification time reported by the bucket
    pub last_modified: DateTime<Utc>,
    /// Object content, not yet transferred
    pub body: ObjectBody,
}

impl RemoteObject {
    /// Read the whole body into memory
    pub async fn read_to_end(mut self) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        self.body.read_to_end(&mut bytes).await?;
        Ok(bytes)
    }
}

impl fmt::Debug for RemoteObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteObject")
            .field("last_modified", &self.last_modified)
            .finish_non_exhaustive()
    }
}

/// Outcome of a (possibly conditional) object retrieval
#[derive(Debug)]
pub enum ObjectFetch {
    /// The object has not changed since the given instant; nothing was transferred
    NotModified,
    /// The object is newer than the given instant, or no condition was given
    Modified(RemoteObject),
}

/// Trait for report buckets.
///
/// Implementations map their native failures to
/// [`ExporterError::TransferFailure`](crate::error::ExporterError::TransferFailure).
#[async_trait]
pub trait ReportBucket: Send + Sync {
    /// List the common prefixes directly below `prefix`, delimited by `/`
    ///
    /// Returned prefixes are full keys ending in `/`, across all result pages.
    async fn list_prefixes(&self, prefix: &str) -> Result<Vec<String>>;

    /// Get an object, returning [`ObjectFetch::NotModified`] when
    /// `if_modified_since` is given and the object is not newer than it
    async fn get_object(
        &self,
        key: &str,
        if_modified_since: Option<DateTime<Utc>>,
    ) -> Result<ObjectFetch>;
}

/// Whether an object modified at `last_modified` counts as changed since `since`
///
/// HTTP conditional requests carry whole seconds, so sub-second differences
/// never count as a change.
pub fn modified_since(last_modified: DateTime<Utc>, since: Option<DateTime<Utc>>) -> bool {
    match since {
        Some(since) => last_modified.timestamp() > since.timestamp(),
        None => true,
    }
}
