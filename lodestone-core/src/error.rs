//! The unified failure descriptor surfaced by every request path.

use std::sync::Arc;

use http::StatusCode;
use thiserror::Error;

use crate::entity::Entity;

/// Why a request failed, as a tagged variant.
///
/// Everything a transport, the pipeline, or a body encoder can produce ends
/// up in exactly one of these.
#[derive(Error, Debug, Clone)]
pub enum ErrorCause {
    /// The transport could not complete the exchange.
    #[error("{0}")]
    Transport(Arc<dyn std::error::Error + Send + Sync>),

    /// The server answered with a non-success status.
    #[error("server returned {0}")]
    HttpStatus(StatusCode),

    /// The request was cancelled before a response arrived.
    #[error("request cancelled")]
    RequestCancelled,

    /// Outbound text could not be represented in the requested encoding.
    #[error("text cannot be encoded as {encoding}")]
    UnencodableText { encoding: String, text: String },

    /// An outbound form parameter could not be URL-encoded.
    #[error("cannot URL-encode {offending_string:?}")]
    NotUrlEncodable { offending_string: String },

    /// The outbound value could not be serialized as JSON.
    #[error("not a valid JSON object")]
    InvalidJsonObject,

    /// The response body was not well-formed JSON.
    #[error("invalid JSON: {0}")]
    InvalidJson(#[source] Arc<serde_json::Error>),

    /// The response was a JSON fragment where a dictionary or array was required.
    #[error("JSON response is not a dictionary or array")]
    JsonResponseIsNotDictionaryOrArray,

    /// A transformer refused the response's content type.
    #[error("unexpected content type {0:?}")]
    WrongContentType(String),

    /// A transformer received content of a type it does not accept.
    #[error("pipeline expected {expected}, got {actual}")]
    WrongInputTypeInTransformerPipeline {
        expected: &'static str,
        actual: &'static str,
    },

    /// A transformer declined to produce output for this input.
    #[error("transformer produced no output")]
    TransformerReturnedNil,

    /// The response bytes are not a decodable image.
    #[error("cannot parse image")]
    UnparsableImage,

    /// The response bytes are not valid in the response's declared encoding.
    #[error("cannot decode text as {encoding}")]
    UndecodableText { encoding: String },

    /// The response declared an encoding this client does not know.
    #[error("invalid text encoding {encoding_name:?}")]
    InvalidTextEncoding { encoding_name: String },

    /// The server said 304 but there is no local entity to revalidate.
    #[error("received 304 with no existing data")]
    NoLocalDataFor304,
}

/// A failed exchange: a user-presentable message plus structured detail.
///
/// Copied into `Resource::latest_error` when a load fails. `entity` holds
/// the server's error body decoded as far as the pipeline got, for error
/// transformers and application-level display.
#[derive(Error, Debug, Clone)]
#[error("{user_message}")]
pub struct RequestError {
    pub user_message: String,
    pub http_status: Option<StatusCode>,
    pub entity: Option<Entity>,
    #[source]
    pub cause: ErrorCause,
    pub timestamp: f64,
}

impl RequestError {
    /// An error with the default message for its cause.
    pub fn new(cause: ErrorCause, now: f64) -> Self {
        RequestError {
            user_message: default_message(&cause),
            http_status: None,
            entity: None,
            cause,
            timestamp: now,
        }
    }

    /// An error for a non-success HTTP status, with the standard phrase as
    /// the user message and the server's body attached.
    pub fn from_status(status: StatusCode, entity: Option<Entity>, now: f64) -> Self {
        RequestError {
            user_message: status
                .canonical_reason()
                .map_or_else(|| format!("Server error ({})", status.as_u16()), str::to_owned),
            http_status: Some(status),
            entity,
            cause: ErrorCause::HttpStatus(status),
            timestamp: now,
        }
    }

    pub fn cancelled(now: f64) -> Self {
        RequestError::new(ErrorCause::RequestCancelled, now)
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.user_message = message.into();
        self
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self.cause, ErrorCause::RequestCancelled)
    }
}

fn default_message(cause: &ErrorCause) -> String {
    match cause {
        ErrorCause::Transport(_) => "Cannot connect to server".to_owned(),
        ErrorCause::RequestCancelled => "Request cancelled".to_owned(),
        ErrorCause::HttpStatus(status) => status
            .canonical_reason()
            .map_or_else(|| format!("Server error ({})", status.as_u16()), str::to_owned),
        _ => "Cannot parse server response".to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_errors_use_the_canonical_phrase() {
        let err = RequestError::from_status(StatusCode::NOT_FOUND, None, 5.0);
        assert_eq!(err.user_message, "Not Found");
        assert_eq!(err.http_status, Some(StatusCode::NOT_FOUND));
        assert!(matches!(err.cause, ErrorCause::HttpStatus(s) if s == StatusCode::NOT_FOUND));
        assert_eq!(err.timestamp, 5.0);
    }

    #[test]
    fn cancellation_is_detectable() {
        let err = RequestError::cancelled(1.0);
        assert!(err.is_cancellation());
        assert_eq!(err.user_message, "Request cancelled");
    }

    #[test]
    fn messages_are_overridable() {
        let err = RequestError::new(ErrorCause::TransformerReturnedNil, 0.0)
            .with_message("That didn't work");
        assert_eq!(err.to_string(), "That didn't work");
    }
}
