//! The mutable outbound request template.
//!
//! Configured and ad-hoc mutators edit this form; the client freezes it
//! into an `http::Request<Bytes>` at dispatch time.

use std::collections::BTreeMap;

use bytes::Bytes;
use http::{header, HeaderMap, HeaderName, HeaderValue, Method};
use serde::Serialize;
use url::Url;

use crate::{error::ErrorCause, params};

/// One outbound HTTP exchange, before dispatch.
#[derive(Clone, Debug)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
}

impl HttpRequest {
    pub fn new(method: Method, url: Url) -> Self {
        HttpRequest {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Set a header, replacing any prior value.
    ///
    /// Returns `false` (and leaves the request unchanged) when the name or
    /// value is not legal HTTP; mutators have no error channel.
    pub fn set_header(&mut self, name: &str, value: &str) -> bool {
        match (
            HeaderName::try_from(name),
            HeaderValue::try_from(value),
        ) {
            (Ok(name), Ok(value)) => {
                self.headers.insert(name, value);
                true
            }
            _ => false,
        }
    }

    pub fn remove_header(&mut self, name: &str) -> bool {
        HeaderName::try_from(name)
            .map(|name| self.headers.remove(name).is_some())
            .unwrap_or(false)
    }

    /// Attach a raw body with an explicit content type.
    pub fn set_body(&mut self, data: Bytes, content_type: &str) {
        self.set_header(header::CONTENT_TYPE.as_str(), content_type);
        self.body = Some(data);
    }

    /// Attach a JSON body (`application/json`).
    pub fn set_json<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<(), ErrorCause> {
        let body = params::json_body(value)?;
        self.set_body(body, params::JSON_CONTENT_TYPE);
        Ok(())
    }

    /// Attach a text body in the named encoding (`text/plain; charset=…`).
    pub fn set_text(&mut self, text: &str, encoding_label: &str) -> Result<(), ErrorCause> {
        let (body, content_type) = params::text_body(text, encoding_label)?;
        self.set_body(body, &content_type);
        Ok(())
    }

    /// Attach a canonical URL-encoded form body.
    pub fn set_url_encoded(
        &mut self,
        form: &BTreeMap<String, String>,
    ) -> Result<(), ErrorCause> {
        let body = params::url_encoded_body(form)?;
        self.set_body(body, params::FORM_CONTENT_TYPE);
        Ok(())
    }

    /// Freeze into the wire form handed to the transport.
    pub fn into_http(self) -> Result<http::Request<Bytes>, http::Error> {
        let mut builder = http::Request::builder()
            .method(self.method)
            .uri(self.url.as_str());
        if let Some(headers) = builder.headers_mut() {
            headers.extend(self.headers);
        }
        builder.body(self.body.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn req() -> HttpRequest {
        HttpRequest::new(Method::GET, Url::parse("https://api.example/items").unwrap())
    }

    #[test]
    fn headers_replace_and_remove() {
        let mut r = req();
        assert!(r.set_header("Accept", "application/json"));
        assert!(r.set_header("accept", "text/plain"));
        assert_eq!(r.header("ACCEPT"), Some("text/plain"));
        assert!(r.remove_header("Accept"));
        assert_eq!(r.header("accept"), None);
    }

    #[test]
    fn illegal_headers_are_refused() {
        let mut r = req();
        assert!(!r.set_header("bad name", "x"));
        assert!(!r.set_header("X-Ok", "bad\nvalue"));
        assert!(r.headers.is_empty());
    }

    #[test]
    fn body_helpers_set_content_type() {
        let mut r = req();
        r.set_json(&serde_json::json!({"a": 1})).unwrap();
        assert_eq!(r.header("content-type"), Some("application/json"));
        assert_eq!(r.body.as_deref(), Some(br#"{"a":1}"# as &[u8]));

        // ad-hoc mutators run later and may override what the helper set
        r.set_header("Content-Type", "application/vnd.example+json");
        assert_eq!(r.header("content-type"), Some("application/vnd.example+json"));
    }

    #[test]
    fn freezes_into_wire_form() {
        let mut r = req();
        r.set_header("X-Auth", "token");
        let http = r.into_http().unwrap();
        assert_eq!(http.method(), Method::GET);
        assert_eq!(http.uri(), "https://api.example/items");
        assert_eq!(http.headers().get("x-auth").unwrap(), "token");
        assert!(http.body().is_empty());
    }
}
