//! Report buckets for cur-exporter
//!
//! Provides [`S3Bucket`], which reads report exports from Amazon S3 or an
//! S3-compatible store, and [`LocalBucket`], which serves a local mirror of
//! the same layout. Both implement
//! [`ReportBucket`](cur_exporter_core::ReportBucket).

pub mod local;
pub mod s3;

pub use local::LocalBucket;
pub use s3::{S3Bucket, S3Config};
