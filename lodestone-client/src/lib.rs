//! Client for observable REST resources.
//!
//! This crate models remote HTTP resources as long-lived observable state
//! rather than one-shot request/response pairs. A [`Service`] vends at most
//! one [`Resource`] per canonical URL; each resource holds its latest
//! successful data, its latest error, and its in-flight requests, updated
//! atomically and broadcast to registered observers on every transition.
//!
//! # Example
//!
//! ```rust,no_run
//! use lodestone_client::{ResourceEvent, Service};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let service = Service::builder()
//!         .base_url("https://api.example.com/v2")
//!         .build()?;
//!
//!     // Cache items for a minute instead of the default 30 seconds.
//!     service.configure("/items/**", |config| config.expiration_time = 60.0);
//!
//!     let items = service.resource("/items");
//!     let owner = Arc::new(());
//!     items.observe(&owner, |resource, event| {
//!         if let ResourceEvent::NewData(_) = event {
//!             println!("items now: {}", resource.json());
//!         }
//!     });
//!
//!     if let Some(request) = items.load_if_needed() {
//!         request.response().await;
//!     }
//!     Ok(())
//! }
//! ```
//!
//! The hard rules the crate upholds:
//!
//! - **Uniqueness** — one live resource per canonical URL per service.
//! - **Read consistency** — `latest_data`, `latest_error` and the loading
//!   flags change together; snapshots never show partial updates.
//! - **Total event order** — every observer of a resource sees the same
//!   event sequence, delivered on one notification sequencer.
//! - **Data preservation** — a failed load records the error but never
//!   discards previously loaded data; a 304 refreshes only the timestamp.

pub mod cache;
pub mod config;
mod dispatch;
pub mod pipeline;
pub mod request;
pub mod resource;
mod response;
pub mod service;
pub mod transformer;
pub mod transport;

pub use cache::{EntityCache, EntityCacheKey, InMemoryCache};
pub use config::{ConfigScope, Configuration, TransformerAction, TransformerOptions};
pub use pipeline::{Pipeline, PipelineStage, StageKey};
pub use request::{Request, RequestChainAction, RequestState};
pub use resource::{
    NewDataSource, Resource, ResourceEvent, ResourceObserver, ResourceSnapshot,
};
pub use response::{Response, ResponseInfo};
pub use service::{BuildError, Clock, Service, ServiceBuilder};
pub use transformer::{ContentTransformer, ContentTypeMatcher, InputTypeMismatchAction, ResponseTransformer};
pub use transport::{ProgressSink, RawResponse, TowerTransport, TransferMetrics, Transport};

#[cfg(feature = "hyper-transport")]
pub use transport::HyperTransport;

pub use lodestone_core as core;
pub use lodestone_core::{Content, Entity, ErrorCause, HttpRequest, RequestError, UrlPattern};
