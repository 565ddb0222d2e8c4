//! Typed response payloads with HTTP metadata.

use std::{any::Any, fmt, sync::Arc};

use bytes::Bytes;
use http::{header, HeaderMap};

/// A dynamically typed, cheaply clonable payload.
///
/// The pipeline threads content through stages as an opaque value; typed
/// access from application code is via [`Content::downcast`], which returns
/// `None` on a type mismatch. The concrete type name is remembered at
/// construction for diagnostics and pipeline mismatch errors.
#[derive(Clone)]
pub struct Content {
    value: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
}

impl Content {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Content {
            value: Arc::new(value),
            type_name: std::any::type_name::<T>(),
        }
    }

    /// Borrow the payload as `T`, if that is what it holds.
    pub fn downcast<T: Any>(&self) -> Option<&T> {
        self.value.downcast_ref()
    }

    pub fn is<T: Any>(&self) -> bool {
        self.value.as_ref().is::<T>()
    }

    /// The concrete Rust type name of the payload.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }
}

impl fmt::Debug for Content {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Content<{}>", self.type_name)
    }
}

/// A response payload plus the metadata needed to cache and revalidate it.
///
/// Entities are immutable after publication; state transitions replace the
/// whole value. The `timestamp` is seconds on the service's logical clock
/// and is the basis for expiration and retry arithmetic.
#[derive(Clone, Debug)]
pub struct Entity {
    pub content: Content,
    pub content_type: String,
    pub charset: Option<String>,
    pub headers: HeaderMap,
    pub timestamp: f64,
}

impl Entity {
    /// An entity with no headers, timestamped at zero.
    ///
    /// Mostly useful for local overrides and tests; network entities are
    /// built from the raw response by the client.
    pub fn new<T: Any + Send + Sync>(content: T, content_type: impl Into<String>) -> Self {
        let content_type = content_type.into();
        Entity {
            charset: charset_of(&content_type),
            content: Content::new(content),
            content_type,
            headers: HeaderMap::new(),
            timestamp: 0.0,
        }
    }

    pub fn with_timestamp(mut self, timestamp: f64) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Build an entity from raw response parts. Content is the body `Bytes`.
    pub fn from_response(headers: HeaderMap, body: Bytes, timestamp: f64) -> Self {
        let content_type = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_owned())
            .unwrap_or_else(|| "application/octet-stream".to_owned());
        let charset = headers
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(charset_of);
        Entity {
            content: Content::new(body),
            content_type,
            charset,
            headers,
            timestamp,
        }
    }

    /// Replacement entity with new content but this entity's metadata.
    ///
    /// This is what transformers use to publish their output.
    pub fn retyped<T: Any + Send + Sync>(&self, content: T, content_type: Option<&str>) -> Self {
        Entity {
            content: Content::new(content),
            content_type: content_type.map_or_else(|| self.content_type.clone(), str::to_owned),
            charset: self.charset.clone(),
            headers: self.headers.clone(),
            timestamp: self.timestamp,
        }
    }

    /// Borrow the content as `T`, if that is what the pipeline produced.
    pub fn content<T: Any>(&self) -> Option<&T> {
        self.content.downcast()
    }

    /// The content as text, when the pipeline decoded it to a `String`.
    pub fn text(&self) -> Option<&str> {
        self.content::<String>().map(String::as_str)
    }

    /// The content as parsed JSON, when the pipeline produced a `Value`.
    pub fn json(&self) -> Option<&serde_json::Value> {
        self.content()
    }

    /// The content as raw bytes, when no transformer has consumed them.
    pub fn bytes(&self) -> Option<&Bytes> {
        self.content()
    }

    /// A response header value, looked up case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn etag(&self) -> Option<&str> {
        self.header("etag")
    }

    pub fn last_modified(&self) -> Option<&str> {
        self.header("last-modified")
    }

    /// Refresh the timestamp without touching content, as on a 304.
    pub fn touch(&mut self, now: f64) {
        self.timestamp = now;
    }
}

// "text/plain; charset=ISO-8859-1" → "ISO-8859-1"
fn charset_of(content_type: &str) -> Option<String> {
    content_type.split(';').skip(1).find_map(|param| {
        let mut kv = param.splitn(2, '=');
        let key = kv.next()?.trim();
        if key.eq_ignore_ascii_case("charset") {
            Some(kv.next()?.trim().trim_matches('"').to_owned())
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    #[test]
    fn content_downcast_round_trip() {
        let c = Content::new(String::from("hi"));
        assert_eq!(c.downcast::<String>().map(String::as_str), Some("hi"));
        assert!(c.downcast::<u32>().is_none());
        assert!(c.type_name().contains("String"));
    }

    #[test]
    fn entity_from_response_parses_content_type_and_charset() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=ISO-8859-1"),
        );
        headers.insert("ETag", HeaderValue::from_static("\"v1\""));
        let e = Entity::from_response(headers, Bytes::from_static(b"hola"), 7.0);
        assert_eq!(e.content_type, "text/plain");
        assert_eq!(e.charset.as_deref(), Some("ISO-8859-1"));
        assert_eq!(e.etag(), Some("\"v1\""));
        assert_eq!(e.header("etag"), Some("\"v1\""));
        assert_eq!(e.bytes().map(|b| &b[..]), Some(&b"hola"[..]));
        assert_eq!(e.timestamp, 7.0);
    }

    #[test]
    fn retyped_preserves_metadata() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let raw = Entity::from_response(headers, Bytes::from_static(b"{}"), 3.0);
        let parsed = raw.retyped(serde_json::json!({}), None);
        assert_eq!(parsed.content_type, "application/json");
        assert_eq!(parsed.timestamp, 3.0);
        assert!(parsed.json().is_some());
    }

    #[test]
    fn touch_only_moves_the_timestamp() {
        let mut e = Entity::new(String::from("A"), "text/plain").with_timestamp(1.0);
        e.touch(42.0);
        assert_eq!(e.timestamp, 42.0);
        assert_eq!(e.text(), Some("A"));
    }
}
