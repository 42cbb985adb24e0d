//! `POST /webhooks`

use std::sync::Arc;
use std::time::Instant;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use tracing::instrument;

use super::AppState;
use crate::store::Store;
use crate::webhooks::pipeline::WebhookRequest;

/// Query parameters accepted on the intake route
#[derive(Debug, Default, Deserialize)]
pub struct WebhookQuery {
    /// Topic, for senders that cannot set the topic header
    pub topic: Option<String>,
}

/// Receive one delivery.
///
/// The body is taken as raw bytes so the signature is checked against exactly
/// what was sent.
#[instrument(skip_all)]
pub async fn webhook_handler<S: Store>(
    State(state): State<Arc<AppState<S>>>,
    Query(query): Query<WebhookQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let started = Instant::now();
    let request = WebhookRequest::from_parts(&headers, query.topic, body);

    let response = match state.pipeline().handle(request).await {
        Ok(ack) => (StatusCode::OK, Json(ack)).into_response(),
        Err(err) => err.into_response(),
    };

    state.record_latency(started.elapsed());
    response
}
