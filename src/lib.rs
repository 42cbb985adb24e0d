//! WishCraft Webhooks - webhook intake for the WishCraft gift registry
//!
//! This crate receives the commerce platform's webhook deliveries and turns
//! them into registry state changes, safely:
//!
//! # Features
//!
//! - **Signature verification**: HMAC-SHA256 over the raw body, with secret rotation
//! - **Closed topic routing**: every handled topic is an enum variant
//! - **Idempotency and rate limiting**: duplicates acknowledged, bursts rejected with 429
//! - **Transactional handlers**: each delivery commits or rolls back as a unit
//! - **Durable retry queue**: failures become jobs with explicit status transitions
//! - **GDPR handlers**: data export, customer redaction, full shop redaction
//! - **Audit trail**: one record per invocation, PII masked in logs
//!
//! # Architecture
//!
//! ```text
//! Platform ──▶ POST /webhooks ──▶ Signature ──▶ Topic ──▶ Guard ──▶ Executor
//!                                    │            │         │          │
//!                                    ▼            ▼         ▼          ▼
//!                                   401          400     200/429   Store tx
//!                                                                  + Audit
//!                                                                  + Jobs
//! ```
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use wishcraft_webhooks::config::WishcraftConfig;
//! use wishcraft_webhooks::handlers::{router, AppState};
//! use wishcraft_webhooks::store::MemoryStore;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = WishcraftConfig::from_env()?;
//!     let state = Arc::new(AppState::from_config(&config, MemoryStore::shared()));
//!
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:3001").await?;
//!     axum::serve(listener, router(state)).await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod audit;
pub mod config;
pub mod crypto;
pub mod error;
pub mod handlers;
pub mod jobs;
pub mod model;
pub mod security;
pub mod store;
pub mod webhooks;

// Re-exports for convenience
pub use config::WishcraftConfig;
pub use error::{StoreError, WebhookError, WebhookResult};
pub use handlers::{router, AppState};
pub use store::{MemoryStore, Store};
pub use webhooks::{Topic, WebhookPipeline};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
