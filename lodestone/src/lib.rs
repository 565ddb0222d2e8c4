//! lodestone models remote HTTP resources as long-lived observable state.
//!
//! For each URL a [`Service`] maintains at most one in-memory [`Resource`]
//! whose three facets — latest successful content, latest error, in-flight
//! request status — update atomically and broadcast to any number of
//! observers. Redundant loads coalesce, ETag/Last-Modified revalidation is
//! automatic, and a staged transformer [`Pipeline`] decodes raw bytes into
//! typed application models with per-stage persistent caching.
//!
//! ```rust,no_run
//! use lodestone::{ResourceEvent, Service};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let service = Service::builder()
//!         .base_url("https://api.example.com/v2")
//!         .build()?;
//!     let profile = service.resource("/profile");
//!
//!     let owner = Arc::new(());
//!     profile.observe(&owner, |resource, event| match event {
//!         ResourceEvent::NewData(_) => println!("profile: {}", resource.json()),
//!         ResourceEvent::Error => eprintln!("{}", resource.latest_error().unwrap()),
//!         _ => {}
//!     });
//!
//!     let _ = profile.load_if_needed();
//!     # Ok(())
//! }
//! ```
//!
//! The API surface lives in [`lodestone_client`]; transport-free types
//! (entities, errors, URL patterns) in [`lodestone_core`], re-exported
//! here as [`core`].

pub use lodestone_client::{
    cache, config, pipeline, request, resource, service, transformer, transport,
};

pub use lodestone_client::{
    BuildError, Clock, ConfigScope, Configuration, ContentTransformer, ContentTypeMatcher,
    EntityCache, EntityCacheKey, InMemoryCache, InputTypeMismatchAction, NewDataSource, Pipeline,
    PipelineStage, ProgressSink, RawResponse, Request, RequestChainAction, RequestState, Resource,
    ResourceEvent, ResourceObserver, ResourceSnapshot, Response, ResponseInfo, ResponseTransformer,
    Service, ServiceBuilder, StageKey, TowerTransport, TransferMetrics, TransformerAction,
    TransformerOptions, Transport,
};

#[cfg(feature = "hyper-transport")]
pub use lodestone_client::HyperTransport;

pub use lodestone_core as core;
pub use lodestone_core::{Content, Entity, ErrorCause, HttpRequest, RequestError, UrlPattern};

#[cfg(test)]
mod mock_tests;
