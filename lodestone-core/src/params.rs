//! Outbound body encoders.
//!
//! These are pure functions; the client stamps timestamps onto any
//! [`ErrorCause`] they return.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::Serialize;

use crate::error::ErrorCause;

pub const JSON_CONTENT_TYPE: &str = "application/json";
pub const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Everything outside the RFC 3986 unreserved set gets escaped.
const URL_ENCODED: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

/// Serialize a value as a JSON body.
pub fn json_body<T: Serialize + ?Sized>(value: &T) -> Result<Bytes, ErrorCause> {
    match serde_json::to_vec(value) {
        Ok(bytes) => Ok(Bytes::from(bytes)),
        Err(_) => Err(ErrorCause::InvalidJsonObject),
    }
}

/// Encode text in the named encoding, yielding the body and the full
/// `Content-Type` (with charset parameter).
pub fn text_body(text: &str, encoding_label: &str) -> Result<(Bytes, String), ErrorCause> {
    let encoding = encoding_rs::Encoding::for_label(encoding_label.as_bytes()).ok_or_else(|| {
        ErrorCause::InvalidTextEncoding {
            encoding_name: encoding_label.to_owned(),
        }
    })?;
    let (encoded, _, had_errors) = encoding.encode(text);
    if had_errors {
        return Err(ErrorCause::UnencodableText {
            encoding: encoding.name().to_owned(),
            text: text.to_owned(),
        });
    }
    let content_type = format!("text/plain; charset={}", encoding.name().to_lowercase());
    Ok((Bytes::from(encoded.into_owned()), content_type))
}

/// Escape a single form key or value.
pub fn url_encode(text: &str) -> String {
    utf8_percent_encode(text, URL_ENCODED).to_string()
}

/// Encode form parameters as `application/x-www-form-urlencoded`.
///
/// Pairs are alphabetized after escaping so the wire form is canonical
/// regardless of insertion order.
pub fn url_encoded_body(params: &BTreeMap<String, String>) -> Result<Bytes, ErrorCause> {
    let mut pairs: Vec<String> = params
        .iter()
        .map(|(k, v)| format!("{}={}", url_encode(k), url_encode(v)))
        .collect();
    pairs.sort();
    Ok(Bytes::from(pairs.join("&")))
}

/// Parse a response body as JSON.
///
/// Top-level fragments (strings, numbers, booleans, null) are rejected
/// unless `allow_fragments` is set.
pub fn parse_json(bytes: &[u8], allow_fragments: bool) -> Result<serde_json::Value, ErrorCause> {
    let value: serde_json::Value =
        serde_json::from_slice(bytes).map_err(|e| ErrorCause::InvalidJson(Arc::new(e)))?;
    if !allow_fragments && !(value.is_object() || value.is_array()) {
        return Err(ErrorCause::JsonResponseIsNotDictionaryOrArray);
    }
    Ok(value)
}

/// Decode response bytes as text in the named encoding (default UTF-8).
pub fn decode_text(bytes: &[u8], charset: Option<&str>) -> Result<String, ErrorCause> {
    let label = charset.unwrap_or("utf-8");
    let encoding = encoding_rs::Encoding::for_label(label.as_bytes()).ok_or_else(|| {
        ErrorCause::InvalidTextEncoding {
            encoding_name: label.to_owned(),
        }
    })?;
    encoding
        .decode_without_bom_handling_and_without_replacement(bytes)
        .map(|cow| cow.into_owned())
        .ok_or_else(|| ErrorCause::UndecodableText {
            encoding: encoding.name().to_owned(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_encoding_escapes_all_non_unreserved_bytes() {
        let mut params = BTreeMap::new();
        params.insert("f••".to_owned(), "b r".to_owned());
        params.insert("℥=&".to_owned(), "ℌℑ=&".to_owned());
        let body = url_encoded_body(&params).unwrap();
        assert_eq!(
            &body[..],
            b"%E2%84%A5%3D%26=%E2%84%8C%E2%84%91%3D%26&f%E2%80%A2%E2%80%A2=b%20r" as &[u8],
        );
    }

    #[test]
    fn unreserved_characters_pass_through() {
        assert_eq!(url_encode("AZaz09-._~"), "AZaz09-._~");
        assert_eq!(url_encode("a b+c"), "a%20b%2Bc");
    }

    #[test]
    fn json_body_round_trips() {
        let body = json_body(&serde_json::json!({"a": 1})).unwrap();
        assert_eq!(&body[..], br#"{"a":1}"#);
    }

    #[test]
    fn text_body_includes_charset() {
        let (body, content_type) = text_body("hola", "utf-8").unwrap();
        assert_eq!(&body[..], b"hola");
        assert_eq!(content_type, "text/plain; charset=utf-8");
    }

    #[test]
    fn text_body_rejects_unknown_encodings() {
        let err = text_body("hi", "not-a-real-encoding").unwrap_err();
        assert!(matches!(err, ErrorCause::InvalidTextEncoding { .. }));
    }

    #[test]
    fn text_body_rejects_unmappable_characters() {
        let err = text_body("Ω", "windows-1252").unwrap_err();
        assert!(matches!(err, ErrorCause::UnencodableText { .. }));
    }

    #[test]
    fn json_fragments_are_rejected_by_default() {
        assert!(matches!(
            parse_json(b"\"just a string\"", false),
            Err(ErrorCause::JsonResponseIsNotDictionaryOrArray)
        ));
        assert!(parse_json(b"\"just a string\"", true).is_ok());
        assert!(parse_json(b"{\"a\": 1}", false).is_ok());
        assert!(matches!(
            parse_json(b"{nope", false),
            Err(ErrorCause::InvalidJson(_))
        ));
    }

    #[test]
    fn decode_text_honors_charset() {
        assert_eq!(decode_text(b"hol\xe9", Some("ISO-8859-1")).unwrap(), "holé");
        assert!(matches!(
            decode_text(b"\xff\xfe\xfd", Some("utf-8")),
            Err(ErrorCause::UndecodableText { .. })
        ));
    }
}
