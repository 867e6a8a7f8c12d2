//! HTTP exposition
//!
//! Serves the metrics path and a small landing page. Every metrics request
//! runs the pipeline first; requests are serialized on the exporter lock so
//! only one run is ever in flight.

use crate::orchestrator::Exporter;
use axum::extract::State;
use axum::http::{StatusCode, header};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use cur_exporter_core::error::{ExporterError, Result};
use prometheus::{Encoder, TextEncoder};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Default listen address
pub const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0:9100";
/// Default metrics path
pub const DEFAULT_METRICS_PATH: &str = "/metrics";

/// HTTP settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address to bind
    pub listen_address: String,
    /// Path metrics are served on
    pub metrics_path: String,
    /// Serve the last published metrics when a run fails
    pub serve_stale_on_error: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: DEFAULT_LISTEN_ADDRESS.to_string(),
            metrics_path: DEFAULT_METRICS_PATH.to_string(),
            serve_stale_on_error: false,
        }
    }
}

impl ServerConfig {
    /// Reject settings the router cannot be built with
    pub fn validate(&self) -> Result<()> {
        if !self.metrics_path.starts_with('/') || self.metrics_path == "/" {
            return Err(ExporterError::Config(format!(
                "metrics path must start with '/' and not be the root: {:?}",
                self.metrics_path
            )));
        }
        Ok(())
    }
}

#[derive(Clone)]
struct AppState {
    exporter: Arc<Mutex<Exporter>>,
    metrics_path: Arc<str>,
    serve_stale_on_error: bool,
}

/// Build the HTTP routes
pub fn router(exporter: Arc<Mutex<Exporter>>, config: &ServerConfig) -> Router {
    let state = AppState {
        exporter,
        metrics_path: Arc::from(config.metrics_path.as_str()),
        serve_stale_on_error: config.serve_stale_on_error,
    };

    Router::new()
        .route("/", get(landing))
        .route(&config.metrics_path, get(metrics))
        .with_state(state)
}

/// Bind and serve until the process is stopped
pub async fn serve(exporter: Arc<Mutex<Exporter>>, config: &ServerConfig) -> Result<()> {
    config.validate()?;
    let listener = TcpListener::bind(&config.listen_address).await?;
    info!(
        "Listening on {} (metrics at {})",
        listener.local_addr()?,
        config.metrics_path
    );
    axum::serve(listener, router(exporter, config)).await?;
    Ok(())
}

async fn metrics(State(state): State<AppState>) -> Response {
    let mut exporter = state.exporter.lock().await;
    let families = match exporter.scrape().await {
        Ok(families) => families,
        Err(e) if state.serve_stale_on_error => {
            warn!("Scrape failed, serving last published metrics: {}", e);
            exporter.gather()
        }
        Err(e) => {
            error!("Scrape failed: {}", e);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("scrape failed: {e}\n"),
            )
                .into_response();
        }
    };
    drop(exporter);

    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buffer) {
        error!("Encoding metrics failed: {}", e);
        return (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response();
    }

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, encoder.format_type().to_string())],
        buffer,
    )
        .into_response()
}

async fn landing(State(state): State<AppState>) -> Html<String> {
    Html(format!(
        "<html>\n\
         <head><title>AWS Cost Exporter</title></head>\n\
         <body>\n\
         <h1>AWS Cost Exporter</h1>\n\
         <p><a href=\"{}\">Metrics</a></p>\n\
         </body>\n\
         </html>\n",
        state.metrics_path
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExporterConfig;
    use crate::metrics::builtin_definitions;
    use crate::state::ExporterState;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use chrono::{TimeZone, Utc};
    use cur_exporter_core::manifest::ReportSource;
    use cur_exporter_core::memory::MemoryBucket;
    use cur_exporter_store::RecordStore;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn exporter(dir: &TempDir, bucket: &MemoryBucket) -> Arc<Mutex<Exporter>> {
        let mut config = ExporterConfig::new(ReportSource::new("billing", "daily"));
        config.state_path = dir.path().join("state.json");
        let exporter = Exporter::new(
            config,
            Arc::new(bucket.clone()),
            RecordStore::open_in_memory().unwrap(),
            ExporterState::default(),
            builtin_definitions(),
        )
        .unwrap();
        Arc::new(Mutex::new(exporter))
    }

    fn get(path: &str) -> Request<Body> {
        Request::builder().uri(path).body(Body::empty()).unwrap()
    }

    #[test]
    fn test_metrics_path_validation() {
        assert!(ServerConfig::default().validate().is_ok());
        let bad = ServerConfig {
            metrics_path: "metrics".to_string(),
            ..ServerConfig::default()
        };
        assert!(bad.validate().is_err());
    }

    #[tokio::test]
    async fn test_landing_links_metrics() {
        let dir = TempDir::new().unwrap();
        let config = ServerConfig {
            metrics_path: "/cost".to_string(),
            ..ServerConfig::default()
        };
        let app = router(exporter(&dir, &MemoryBucket::new()), &config);

        let response = app.oneshot(get("/")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(String::from_utf8_lossy(&body).contains("href=\"/cost\""));
    }

    #[tokio::test]
    async fn test_failed_scrape_is_server_error() {
        let dir = TempDir::new().unwrap();
        let bucket = MemoryBucket::new();
        bucket.fail_listing(Some("access denied"));
        let app = router(exporter(&dir, &bucket), &ServerConfig::default());

        let response = app.oneshot(get("/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_stale_metrics_served_on_error() {
        let dir = TempDir::new().unwrap();
        let bucket = MemoryBucket::new();
        let modified = Utc.with_ymd_and_hms(2024, 2, 5, 0, 0, 0).unwrap();
        bucket.put(
            "/daily/20240201-20240301/a1/daily-1.csv",
            "bill/BillingPeriodStartDate,bill/BillingPeriodEndDate,product/ProductName,lineItem/Operation,lineItem/LineItemType,lineItem/UsageType,pricing/unit,lineItem/CurrencyCode,lineItem/UsageAccountId,lineItem/UsageAmount,lineItem/UnblendedCost\n\
             2024,2024,EC2,Run,Usage,Box,Hrs,USD,1,1,2.5\n",
            modified,
        );
        bucket.put(
            "/daily/20240201-20240301/daily-Manifest.json",
            serde_json::json!({
                "assemblyId": "a1",
                "compression": "NONE",
                "contentType": "text/csv",
                "billingPeriod": {"start": "x", "end": "y"},
                "bucket": "billing",
                "reportKeys": ["/daily/20240201-20240301/a1/daily-1.csv"],
            })
            .to_string(),
            modified,
        );

        let config = ServerConfig {
            serve_stale_on_error: true,
            ..ServerConfig::default()
        };
        let app = router(exporter(&dir, &bucket), &config);

        let response = app.clone().oneshot(get("/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let first = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(String::from_utf8_lossy(&first).contains("aws_billing_cost{"));

        // The period has ended, so the next scrape lists again and fails
        bucket.fail_listing(Some("access denied"));
        let response = app.oneshot(get("/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let second = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(first, second);
    }
}
