//! Error types for WishCraft webhook intake
//!
//! This module provides the error hierarchy used across the pipeline. The
//! top-level [`WebhookError`] mirrors the delivery taxonomy: what the event
//! source observes (401/400/429) versus what is recovered internally through
//! the job queue (transient and compliance-critical failures).

use std::time::Duration;

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

/// Errors surfaced by the webhook pipeline
#[derive(Error, Debug)]
pub enum WebhookError {
    /// Missing or invalid signature header
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Malformed payload or missing required field/header
    #[error("Invalid payload: {0}")]
    Validation(String),

    /// No handler registered for the topic
    #[error("No handler for topic: {0}")]
    UnknownTopic(String),

    /// Too many deliveries for this shop and topic in the current window
    #[error("Rate limit exceeded for {shop} on {topic}")]
    RateLimited {
        /// Shop that exceeded its budget
        shop: String,
        /// Topic the budget applies to
        topic: String,
        /// Time until the window resets
        retry_after: Duration,
    },

    /// Database or network failure while running a handler
    #[error("Transient failure: {0}")]
    Transient(String),

    /// GDPR export/delete failure
    #[error("Compliance-critical failure: {0}")]
    ComplianceCritical(String),

    /// Anything else
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for webhook operations
pub type WebhookResult<T> = std::result::Result<T, WebhookError>;

impl WebhookError {
    /// HTTP status code reported to the event source.
    ///
    /// Transient and compliance-critical failures never reach the source;
    /// they are acknowledged and retried through the job queue. They only map
    /// to a 500 if some caller chooses to surface them directly.
    pub fn status_code(&self) -> StatusCode {
        match self {
            WebhookError::Authentication(_) => StatusCode::UNAUTHORIZED,
            WebhookError::Validation(_) | WebhookError::UnknownTopic(_) => StatusCode::BAD_REQUEST,
            WebhookError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            WebhookError::Transient(_)
            | WebhookError::ComplianceCritical(_)
            | WebhookError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short machine-readable error code
    pub fn code(&self) -> &'static str {
        match self {
            WebhookError::Authentication(_) => "authentication_failed",
            WebhookError::Validation(_) => "invalid_payload",
            WebhookError::UnknownTopic(_) => "unknown_topic",
            WebhookError::RateLimited { .. } => "rate_limited",
            WebhookError::Transient(_) => "transient_failure",
            WebhookError::ComplianceCritical(_) => "compliance_failure",
            WebhookError::Internal(_) => "internal_error",
        }
    }

    /// Whether the failure is recovered by an internal retry job
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            WebhookError::Transient(_) | WebhookError::ComplianceCritical(_)
        )
    }

    /// Create a validation error from a string
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        WebhookError::Validation(msg.into())
    }
}

impl From<StoreError> for WebhookError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Validation(msg) => WebhookError::Validation(msg),
            other => WebhookError::Transient(other.to_string()),
        }
    }
}

impl From<CryptoError> for WebhookError {
    fn from(err: CryptoError) -> Self {
        WebhookError::Internal(err.to_string())
    }
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(serde_json::json!({
            "error": self.code(),
            "message": self.to_string(),
        }));

        let mut response = (status, body).into_response();
        if let WebhookError::RateLimited { retry_after, .. } = &self {
            let secs = retry_after.as_secs().max(1);
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(http::header::RETRY_AFTER, value);
            }
        }
        response
    }
}

/// Persistence errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached or the transaction could not commit
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A row the operation depends on does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// The operation would violate a referential or tenant constraint
    #[error("Constraint violation: {0}")]
    Constraint(String),

    /// The data itself is unusable; retrying will not help
    #[error("Invalid data: {0}")]
    Validation(String),
}

/// Result type for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Gift message encryption errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Key material is missing or has the wrong length
    #[error("Invalid encryption key: {0}")]
    InvalidKey(String),

    /// Encryption failed
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    /// Ciphertext is malformed or fails authentication
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Required environment variable not set
    #[error("{0} environment variable not set")]
    Missing(&'static str),

    /// Environment variable present but unusable
    #[error("Invalid value for {name}: {reason}")]
    Invalid {
        /// Variable name
        name: &'static str,
        /// Why it was rejected
        reason: String,
    },
}
