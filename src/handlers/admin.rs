//! Operator endpoints
//!
//! Read access to the audit trail and job queue, plus a trigger for the job
//! runner so an external scheduler can drive retries. Every route requires
//! `Authorization: Bearer <token>`.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, instrument};

use super::AppState;
use crate::error::WebhookError;
use crate::jobs::JobStatus;
use crate::model::ShopDomain;
use crate::store::Store;

/// Default page size for listings
pub const DEFAULT_LIMIT: usize = 100;
/// Largest page size a caller may request
pub const MAX_LIMIT: usize = 1000;

/// Filters for `GET /admin/audit`
#[derive(Debug, Default, Deserialize)]
pub struct AuditQuery {
    /// Shop domain, or a `redacted-` fingerprint
    pub shop: Option<String>,
    /// Page size
    pub limit: Option<usize>,
}

/// Filters for `GET /admin/jobs`
#[derive(Debug, Default, Deserialize)]
pub struct JobsQuery {
    /// Shop domain
    pub shop: Option<String>,
    /// `pending`, `running`, `completed`, `failed` or `cancelled`
    pub status: Option<String>,
    /// Page size
    pub limit: Option<usize>,
}

fn authorize<S: Store>(state: &AppState<S>, headers: &HeaderMap) -> Result<(), Response> {
    let header = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let result = state.operator_auth().authenticate(header);

    match result.error_message() {
        None => Ok(()),
        Some(message) => Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "unauthorized", "message": message})),
        )
            .into_response()),
    }
}

fn page_size(limit: Option<usize>) -> usize {
    limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
}

/// `GET /admin/audit?shop=&limit=`
#[instrument(skip_all)]
pub async fn audit_handler<S: Store>(
    State(state): State<Arc<AppState<S>>>,
    Query(query): Query<AuditQuery>,
    headers: HeaderMap,
) -> Response {
    if let Err(denied) = authorize(&state, &headers) {
        return denied;
    }

    let store = state.pipeline().executor().store();
    match store
        .list_audit(query.shop.as_deref().map(str::trim), page_size(query.limit))
        .await
    {
        Ok(records) => Json(json!({"records": records})).into_response(),
        Err(e) => WebhookError::from(e).into_response(),
    }
}

/// `GET /admin/jobs?shop=&status=&limit=`
#[instrument(skip_all)]
pub async fn jobs_handler<S: Store>(
    State(state): State<Arc<AppState<S>>>,
    Query(query): Query<JobsQuery>,
    headers: HeaderMap,
) -> Response {
    if let Err(denied) = authorize(&state, &headers) {
        return denied;
    }

    let shop = match query.shop.as_deref() {
        Some(raw) => match ShopDomain::parse(raw) {
            Some(shop) => Some(shop),
            None => return WebhookError::validation(format!("invalid shop: {raw}")).into_response(),
        },
        None => None,
    };
    let status = match query.status.as_deref() {
        Some(raw) => match JobStatus::parse(raw) {
            Some(status) => Some(status),
            None => {
                return WebhookError::validation(format!("invalid job status: {raw}")).into_response()
            }
        },
        None => None,
    };

    let store = state.pipeline().executor().store();
    match store
        .list_jobs(shop.as_ref(), status, page_size(query.limit))
        .await
    {
        Ok(jobs) => Json(json!({"jobs": jobs})).into_response(),
        Err(e) => WebhookError::from(e).into_response(),
    }
}

/// `POST /admin/jobs/run`
#[instrument(skip_all)]
pub async fn run_jobs_handler<S: Store>(
    State(state): State<Arc<AppState<S>>>,
    headers: HeaderMap,
) -> Response {
    if let Err(denied) = authorize(&state, &headers) {
        return denied;
    }

    match state.pipeline().executor().process_due_jobs(Utc::now()).await {
        Ok(summary) => {
            info!(?summary, "Job run triggered by operator");
            Json(summary).into_response()
        }
        Err(e) => e.into_response(),
    }
}
