//! Shared types and client-less behavior for the lodestone resource cache.
//!
//! This crate holds everything that does not need a transport or a runtime:
//! the [`Entity`] payload model, the [`RequestError`] taxonomy, the outbound
//! [`HttpRequest`] template with its body encoders, URL pattern matching for
//! configuration, and URL navigation helpers that keep resource identity
//! canonical.

pub mod entity;
pub use entity::{Content, Entity};

pub mod error;
pub use error::{ErrorCause, RequestError};

pub mod request;
pub use request::HttpRequest;

pub mod params;

pub mod pattern;
pub use pattern::{CompiledPattern, UrlPattern};

pub mod navigation;

pub type Result<T, E = RequestError> = std::result::Result<T, E>;
