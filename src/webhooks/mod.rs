//! Webhook intake
//!
//! - **Signature verification**: HMAC-SHA256 over the raw body
//!   ([`signature`])
//! - **Routing**: a closed [`Topic`] enum, one typed payload per topic
//!   ([`topic`], [`events`])
//! - **Guard**: duplicate suppression and per shop+topic rate limiting
//!   ([`idempotency`], [`crate::security::RateLimiter`])
//! - **Execution**: transactional topic handlers, failure classification and
//!   the durable retry queue ([`effects`], [`executor`])
//!
//! [`pipeline::WebhookPipeline`] wires the stages together.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use wishcraft_webhooks::config::WishcraftConfig;
//! use wishcraft_webhooks::store::MemoryStore;
//! use wishcraft_webhooks::webhooks::{WebhookPipeline, WebhookRequest};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = WishcraftConfig::from_env()?;
//! let pipeline = WebhookPipeline::from_config(&config, MemoryStore::shared());
//!
//! let request = WebhookRequest {
//!     topic: Some("app/uninstalled".into()),
//!     shop: Some("example.myshopify.com".into()),
//!     ..Default::default()
//! };
//! match pipeline.handle(request).await {
//!     Ok(ack) => println!("accepted: {ack:?}"),
//!     Err(rejection) => println!("rejected: {rejection}"),
//! }
//! # Ok(())
//! # }
//! ```

pub mod effects;
pub mod events;
pub mod executor;
pub mod idempotency;
pub mod pipeline;
pub mod signature;
pub mod topic;

pub use effects::ExecutionReport;
pub use events::{Event, EventPayload};
pub use executor::{ExecutionOutcome, Executor, JobRunSummary};
pub use idempotency::{IdempotencyKey, IdempotencyStore, InMemoryIdempotencyStore};
pub use pipeline::{Ack, AckStatus, PipelineCounters, WebhookPipeline, WebhookRequest};
pub use signature::{sign_with, SignatureVerifier};
pub use topic::Topic;
