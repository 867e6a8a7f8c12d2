//! S3 report bucket
//!
//! Reads Cost and Usage Report exports through `aws-sdk-s3`. Credentials and
//! region come from the standard AWS environment chain; an endpoint override
//! allows S3-compatible stores, and an optional role is assumed on top of the
//! base credentials for cross-account report buckets.

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::primitives::DateTime as SmithyDateTime;
use chrono::{DateTime, Utc};
use cur_exporter_core::bucket::{ObjectFetch, RemoteObject, ReportBucket};
use cur_exporter_core::error::{ExporterError, Result};
use tracing::{debug, info};

/// Connection settings for [`S3Bucket`]
#[derive(Debug, Clone, Default)]
pub struct S3Config {
    /// Bucket name
    pub bucket: String,
    /// Region override; the SDK default chain is used otherwise
    pub region: Option<String>,
    /// Endpoint override for S3-compatible stores
    pub endpoint_url: Option<String>,
    /// Role to assume before talking to the bucket
    pub assume_role_arn: Option<String>,
}

/// Report bucket backed by Amazon S3
#[derive(Clone)]
pub struct S3Bucket {
    client: Client,
    bucket: String,
}

impl std::fmt::Debug for S3Bucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Bucket")
            .field("bucket", &self.bucket)
            .finish()
    }
}

impl S3Bucket {
    /// Build a client from the environment and `config`
    pub async fn connect(config: S3Config) -> Result<Self> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = config.region.clone() {
            loader = loader.region(Region::new(region));
        }
        let sdk_config = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);

        if let Some(role_arn) = &config.assume_role_arn {
            info!("Assuming role {} for report bucket access", role_arn);
            let provider = aws_config::sts::AssumeRoleProvider::builder(role_arn)
                .session_name("cur-exporter")
                .configure(&sdk_config)
                .build()
                .await;
            builder = builder.credentials_provider(provider);
        }

        if let Some(endpoint) = &config.endpoint_url {
            debug!("Using S3 endpoint override {}", endpoint);
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        Ok(Self::from_client(Client::from_conf(builder.build()), config.bucket))
    }

    /// Wrap a pre-built client
    pub fn from_client(client: Client, bucket: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
        }
    }

    /// Bucket this instance reads from
    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

#[async_trait]
impl ReportBucket for S3Bucket {
    async fn list_prefixes(&self, prefix: &str) -> Result<Vec<String>> {
        let mut prefixes = Vec::new();
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .delimiter("/")
            .into_paginator()
            .send();

        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| {
                ExporterError::TransferFailure(format!(
                    "listing s3://{}/{}: {}",
                    self.bucket,
                    prefix,
                    describe(&e)
                ))
            })?;

            prefixes.extend(
                page.common_prefixes()
                    .iter()
                    .filter_map(|common| common.prefix().map(str::to_string)),
            );
        }

        debug!("Listed {} prefixes under {}", prefixes.len(), prefix);
        Ok(prefixes)
    }

    async fn get_object(
        &self,
        key: &str,
        if_modified_since: Option<DateTime<Utc>>,
    ) -> Result<ObjectFetch> {
        let mut request = self.client.get_object().bucket(&self.bucket).key(key);
        if let Some(since) = if_modified_since {
            request = request.if_modified_since(to_smithy(since));
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) if is_not_modified(&e) => return Ok(ObjectFetch::NotModified),
            Err(e) => {
                return Err(ExporterError::TransferFailure(format!(
                    "getting s3://{}/{}: {}",
                    self.bucket,
                    key,
                    describe(&e)
                )));
            }
        };

        let last_modified = response
            .last_modified()
            .and_then(from_smithy)
            .ok_or_else(|| {
                ExporterError::TransferFailure(format!(
                    "s3://{}/{} has no modification time",
                    self.bucket, key
                ))
            })?;

        Ok(ObjectFetch::Modified(RemoteObject {
            last_modified,
            body: Box::pin(response.body.into_async_read()),
        }))
    }
}

/// S3 answers a failed `If-Modified-Since` precondition with 304, which the
/// SDK surfaces as a service error
fn is_not_modified(err: &SdkError<GetObjectError, HttpResponse>) -> bool {
    match err {
        SdkError::ServiceError(service_err) => {
            service_err.raw().status().as_u16() == 304
                || service_err.err().code() == Some("NotModified")
        }
        _ => false,
    }
}

fn describe<E, R>(err: &SdkError<E, R>) -> String
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    match err {
        SdkError::ServiceError(service_err) => {
            let inner = service_err.err();
            match (inner.code(), inner.message()) {
                (Some(code), Some(message)) => format!("{code}: {message}"),
                (Some(code), None) => code.to_string(),
                _ => inner.to_string(),
            }
        }
        SdkError::TimeoutError(_) => "request timed out".to_string(),
        other => other.to_string(),
    }
}

fn to_smithy(ts: DateTime<Utc>) -> SmithyDateTime {
    SmithyDateTime::from_secs(ts.timestamp())
}

fn from_smithy(ts: &SmithyDateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(ts.secs(), ts.subsec_nanos())
}
