//! In-process report bucket
//!
//! `MemoryBucket` keeps objects in a map and counts every call made against
//! it, which makes it useful wherever the pipeline should run without a
//! network: tests, dry runs, and embedding. It can also be told to cut a
//! body off part-way to simulate a dropped connection, or to stall it to
//! simulate one that hangs.

use crate::bucket::{ObjectFetch, RemoteObject, ReportBucket, modified_since};
use crate::error::{ExporterError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::io::StreamReader;
use tracing::trace;

/// Counters of calls served by a [`MemoryBucket`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BucketStats {
    /// `list_prefixes` calls
    pub list_calls: u64,
    /// `get_object` calls
    pub get_calls: u64,
    /// Conditional gets answered with "not modified"
    pub not_modified: u64,
    /// Gets that returned a body
    pub transfers: u64,
}

/// How a body is cut short after a number of bytes
#[derive(Debug, Clone, Copy)]
enum Cutoff {
    Fail(usize),
    Stall(usize),
}

#[derive(Debug, Clone)]
struct StoredObject {
    bytes: Bytes,
    last_modified: DateTime<Utc>,
    cutoff: Option<Cutoff>,
}

#[derive(Debug, Default)]
struct BucketState {
    objects: BTreeMap<String, StoredObject>,
    stats: BucketStats,
    transferred: Vec<String>,
    listing_failure: Option<String>,
}

/// Report bucket backed by an in-memory map
///
/// Clones share the same objects and counters.
///
/// # Examples
///
/// ```
/// use cur_exporter_core::bucket::{ObjectFetch, ReportBucket};
/// use cur_exporter_core::memory::MemoryBucket;
/// use chrono::Utc;
///
/// # async fn example() -> cur_exporter_core::Result<()> {
/// let bucket = MemoryBucket::new();
/// let now = Utc::now();
/// bucket.put("/daily/20240101-20240201/daily-Manifest.json", "{}", now);
///
/// let fetch = bucket
///     .get_object("/daily/20240101-20240201/daily-Manifest.json", Some(now))
///     .await?;
/// assert!(matches!(fetch, ObjectFetch::NotModified));
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryBucket {
    state: Arc<Mutex<BucketState>>,
}

impl MemoryBucket {
    /// Create an empty bucket
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BucketState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Store or replace an object
    pub fn put(&self, key: impl Into<String>, bytes: impl Into<Bytes>, last_modified: DateTime<Utc>) {
        self.lock().objects.insert(
            key.into(),
            StoredObject {
                bytes: bytes.into(),
                last_modified,
                cutoff: None,
            },
        );
    }

    /// Remove an object
    pub fn remove(&self, key: &str) {
        self.lock().objects.remove(key);
    }

    /// Make reads of `key` fail with a connection error after `bytes` bytes
    pub fn fail_after(&self, key: &str, bytes: usize) {
        self.set_cutoff(key, Cutoff::Fail(bytes));
    }

    /// Make reads of `key` hang forever after `bytes` bytes
    pub fn stall_after(&self, key: &str, bytes: usize) {
        self.set_cutoff(key, Cutoff::Stall(bytes));
    }

    fn set_cutoff(&self, key: &str, cutoff: Cutoff) {
        if let Some(object) = self.lock().objects.get_mut(key) {
            object.cutoff = Some(cutoff);
        }
    }

    /// Make every listing fail with `reason`, or succeed again with `None`
    pub fn fail_listing(&self, reason: Option<&str>) {
        self.lock().listing_failure = reason.map(str::to_string);
    }

    /// Call counters so far
    pub fn stats(&self) -> BucketStats {
        self.lock().stats
    }

    /// Keys whose bodies were handed out, in order
    pub fn transferred_keys(&self) -> Vec<String> {
        self.lock().transferred.clone()
    }
}

#[async_trait]
impl ReportBucket for MemoryBucket {
    async fn list_prefixes(&self, prefix: &str) -> Result<Vec<String>> {
        let mut state = self.lock();
        state.stats.list_calls += 1;

        if let Some(reason) = &state.listing_failure {
            return Err(ExporterError::TransferFailure(reason.clone()));
        }

        let prefixes: BTreeSet<String> = state
            .objects
            .keys()
            .filter_map(|key| {
                let rest = key.strip_prefix(prefix)?;
                let slash = rest.find('/')?;
                Some(format!("{prefix}{}", &rest[..=slash]))
            })
            .collect();

        Ok(prefixes.into_iter().collect())
    }

    async fn get_object(
        &self,
        key: &str,
        if_modified_since: Option<DateTime<Utc>>,
    ) -> Result<ObjectFetch> {
        let mut state = self.lock();
        state.stats.get_calls += 1;

        let object = state
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| ExporterError::TransferFailure(format!("no such key: {key}")))?;

        if !modified_since(object.last_modified, if_modified_since) {
            trace!("{} not modified since {:?}", key, if_modified_since);
            state.stats.not_modified += 1;
            return Ok(ObjectFetch::NotModified);
        }

        state.stats.transfers += 1;
        state.transferred.push(key.to_string());

        let head = |limit: usize| object.bytes.slice(..limit.min(object.bytes.len()));
        let chunks: BoxStream<'static, std::io::Result<Bytes>> = match object.cutoff {
            Some(Cutoff::Fail(limit)) => stream::iter(vec![
                Ok(head(limit)),
                Err(std::io::Error::new(
                    std::io::ErrorKind::ConnectionReset,
                    format!("connection reset while reading {key}"),
                )),
            ])
            .boxed(),
            Some(Cutoff::Stall(limit)) => stream::once(futures::future::ready(Ok(head(limit))))
                .chain(stream::pending())
                .boxed(),
            None => stream::once(futures::future::ready(Ok(object.bytes.clone()))).boxed(),
        };

        Ok(ObjectFetch::Modified(RemoteObject {
            last_modified: object.last_modified,
            body: Box::pin(StreamReader::new(chunks)),
        }))
    }
}
