//! Response transformers: pure steps from one typed entity to another.

use std::{any::Any, marker::PhantomData, sync::Arc};

use bytes::Bytes;
use lodestone_core::{entity::Entity, error::ErrorCause, params, RequestError};
use regex::Regex;

use crate::response::Response;

/// One step of the pipeline.
///
/// Implementations must be pure with respect to resource state: they see a
/// [`Response`] and return a [`Response`], nothing else. `now` is the
/// service clock reading for the response being processed; transformers use
/// it to stamp errors they introduce.
pub trait ResponseTransformer: Send + Sync + 'static {
    fn process(&self, response: Response, now: f64) -> Response;
}

/// What to do when a transformer's input is not the type it expects.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InputTypeMismatchAction {
    /// Fail the pipeline.
    Error,
    /// Pass the entity through unchanged.
    Skip,
    /// Pass through only when the content already has the output type.
    SkipIfOutputTypeMatches,
}

/// A typed transformer over entity content.
///
/// Wraps a closure from `&In` to `Out`; mismatched input types are handled
/// per the configured [`InputTypeMismatchAction`]. With `transform_errors`
/// set, failed responses get their server-sent entity transformed too (best
/// effort; a refusal leaves the error unchanged).
pub struct ContentTransformer<In, Out, F> {
    transform: F,
    mismatch_action: InputTypeMismatchAction,
    transform_errors: bool,
    marker: PhantomData<fn(&In) -> Out>,
}

impl<In, Out, F> ContentTransformer<In, Out, F>
where
    In: Any + Send + Sync,
    Out: Any + Send + Sync,
    F: Fn(&In, &Entity) -> Result<Out, RequestError> + Send + Sync + 'static,
{
    pub fn new(transform: F) -> Self {
        ContentTransformer {
            transform,
            mismatch_action: InputTypeMismatchAction::Error,
            transform_errors: false,
            marker: PhantomData,
        }
    }

    pub fn on_type_mismatch(mut self, action: InputTypeMismatchAction) -> Self {
        self.mismatch_action = action;
        self
    }

    pub fn transform_errors(mut self, transform_errors: bool) -> Self {
        self.transform_errors = transform_errors;
        self
    }

    fn apply(&self, entity: &Entity, now: f64) -> Response {
        match entity.content::<In>() {
            Some(input) => match (self.transform)(input, entity) {
                Ok(output) => Response::Success(entity.retyped(output, None)),
                Err(mut error) => {
                    if error.timestamp == 0.0 {
                        error.timestamp = now;
                    }
                    if error.entity.is_none() {
                        error.entity = Some(entity.clone());
                    }
                    Response::Failure(error)
                }
            },
            None => match self.mismatch_action {
                InputTypeMismatchAction::Skip => Response::Success(entity.clone()),
                InputTypeMismatchAction::SkipIfOutputTypeMatches if entity.content.is::<Out>() => {
                    Response::Success(entity.clone())
                }
                _ => Response::Failure(RequestError::new(
                    ErrorCause::WrongInputTypeInTransformerPipeline {
                        expected: std::any::type_name::<In>(),
                        actual: entity.content.type_name(),
                    },
                    now,
                )),
            },
        }
    }
}

impl<In, Out, F> ResponseTransformer for ContentTransformer<In, Out, F>
where
    In: Any + Send + Sync,
    Out: Any + Send + Sync,
    F: Fn(&In, &Entity) -> Result<Out, RequestError> + Send + Sync + 'static,
{
    fn process(&self, response: Response, now: f64) -> Response {
        match response {
            Response::Success(entity) => self.apply(&entity, now),
            Response::Failure(mut error) => {
                if self.transform_errors {
                    if let Some(entity) = &error.entity {
                        if let Response::Success(transformed) = self.apply(entity, now) {
                            error.entity = Some(transformed);
                        }
                    }
                }
                Response::Failure(error)
            }
        }
    }
}

/// Gates an inner transformer on the entity's content type.
///
/// Patterns are media-type globs: `*/json`, `text/*`, `*/*+json`. A
/// response whose content type matches none of them passes through
/// untouched.
pub struct ContentTypeMatcher {
    regex: Regex,
    inner: Arc<dyn ResponseTransformer>,
}

impl ContentTypeMatcher {
    /// Returns `None` only if the pattern list compiles to an invalid
    /// regex, which literal media types and `*` globs never do.
    pub fn new(patterns: &[&str], inner: Arc<dyn ResponseTransformer>) -> Option<Self> {
        let alternatives: Vec<String> = patterns.iter().map(|p| media_glob(p)).collect();
        let regex = Regex::new(&format!("^(?:{})$", alternatives.join("|"))).ok()?;
        Some(ContentTypeMatcher { regex, inner })
    }

    fn matches(&self, entity: &Entity) -> bool {
        self.regex.is_match(&entity.content_type)
    }
}

impl ResponseTransformer for ContentTypeMatcher {
    fn process(&self, response: Response, now: f64) -> Response {
        let applies = match &response {
            Response::Success(entity) => self.matches(entity),
            Response::Failure(error) => error.entity.as_ref().is_some_and(|e| self.matches(e)),
        };
        if applies {
            self.inner.process(response, now)
        } else {
            response
        }
    }
}

fn media_glob(pattern: &str) -> String {
    let mut out = String::new();
    for c in pattern.chars() {
        if c == '*' {
            out.push_str("[^/]*");
        } else {
            out.push_str(&regex::escape(&c.to_string()));
        }
    }
    out
}

/// `*/json`, `*/*+json` → `serde_json::Value`, rejecting top-level
/// fragments.
pub fn json_transformer() -> Arc<dyn ResponseTransformer> {
    let parse = ContentTransformer::<Bytes, serde_json::Value, _>::new(
        |bytes: &Bytes, _entity: &Entity| {
            params::parse_json(bytes, false).map_err(|cause| RequestError::new(cause, 0.0))
        },
    )
    .transform_errors(true);
    match ContentTypeMatcher::new(&["*/json", "*/*+json"], Arc::new(parse)) {
        Some(matcher) => Arc::new(matcher),
        // unreachable with literal patterns; keep the transformer alive anyway
        None => Arc::new(PassThrough),
    }
}

/// `text/*` → `String`, honoring the response charset.
pub fn text_transformer() -> Arc<dyn ResponseTransformer> {
    let decode = ContentTransformer::<Bytes, String, _>::new(|bytes: &Bytes, entity: &Entity| {
        params::decode_text(bytes, entity.charset.as_deref())
            .map_err(|cause| RequestError::new(cause, 0.0))
    })
    .transform_errors(true);
    match ContentTypeMatcher::new(&["text/*"], Arc::new(decode)) {
        Some(matcher) => Arc::new(matcher),
        None => Arc::new(PassThrough),
    }
}

struct PassThrough;

impl ResponseTransformer for PassThrough {
    fn process(&self, response: Response, _now: f64) -> Response {
        response
    }
}
