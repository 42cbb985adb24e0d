//! HTTP surface
//!
//! ```text
//! POST /webhooks          -> webhook::webhook_handler
//! GET  /health            -> status::health_handler
//! GET  /ready             -> status::readiness_handler
//! GET  /status            -> status::status_handler
//! GET  /admin/audit       -> admin::audit_handler      (bearer token)
//! GET  /admin/jobs        -> admin::jobs_handler       (bearer token)
//! POST /admin/jobs/run    -> admin::run_jobs_handler   (bearer token)
//! ```

pub mod admin;
pub mod status;
pub mod webhook;

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::config::WishcraftConfig;
use crate::security::TokenAuthenticator;
use crate::store::Store;
use crate::webhooks::pipeline::WebhookPipeline;

pub use status::{LatencyHistogram, LatencyMetrics, SERVER_NAME, SERVER_VERSION};

/// Shared application state
pub struct AppState<S: Store> {
    pipeline: WebhookPipeline<S>,
    operator_auth: TokenAuthenticator,
    max_body_bytes: usize,
    start_time: Instant,
    latency_histogram: LatencyHistogram,
}

impl<S: Store> AppState<S> {
    /// Create state around an assembled pipeline
    pub fn new(pipeline: WebhookPipeline<S>, operator_auth: TokenAuthenticator, max_body_bytes: usize) -> Self {
        Self {
            pipeline,
            operator_auth,
            max_body_bytes,
            start_time: Instant::now(),
            latency_histogram: LatencyHistogram::new(),
        }
    }

    /// Create state from configuration
    pub fn from_config(config: &WishcraftConfig, store: Arc<S>) -> Self {
        Self::new(
            WebhookPipeline::from_config(config, store),
            TokenAuthenticator::new(&config.admin_token),
            config.max_body_bytes,
        )
    }

    /// The intake pipeline
    pub fn pipeline(&self) -> &WebhookPipeline<S> {
        &self.pipeline
    }

    /// Operator token check
    pub fn operator_auth(&self) -> &TokenAuthenticator {
        &self.operator_auth
    }

    /// Seconds since start
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Record how long one webhook request took
    pub fn record_latency(&self, duration: Duration) {
        self.latency_histogram.record_duration(duration);
    }

    /// Webhook latency percentiles
    pub fn latency_metrics(&self) -> LatencyMetrics {
        self.latency_histogram.metrics()
    }
}

/// Build the full router
pub fn router<S: Store>(state: Arc<AppState<S>>) -> Router {
    let webhooks = Router::new()
        .route("/webhooks", post(webhook::webhook_handler::<S>))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(state.max_body_bytes));

    Router::new()
        .merge(webhooks)
        .route("/health", get(status::health_handler))
        .route("/ready", get(status::readiness_handler::<S>))
        .route("/status", get(status::status_handler::<S>))
        .route("/admin/audit", get(admin::audit_handler::<S>))
        .route("/admin/jobs", get(admin::jobs_handler::<S>))
        .route("/admin/jobs/run", post(admin::run_jobs_handler::<S>))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
