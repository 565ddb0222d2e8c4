//! Per-resource configuration and the entries that produce it.
//!
//! Configuration is never set directly on a resource. Services hold an
//! ordered list of (pattern, methods, mutator) entries; the effective
//! [`Configuration`] for a (resource, method) pair is the fold of every
//! matching mutator over the service defaults, memoized per resource and
//! invalidated when the entry list changes.

use std::collections::HashMap;
use std::sync::Arc;

use http::Method;
use lodestone_core::{pattern::CompiledPattern, HttpRequest, UrlPattern};

use crate::{
    pipeline::{Pipeline, StageKey},
    request::Request,
    resource::Resource,
    transformer::InputTypeMismatchAction,
};

pub(crate) type RequestMutatorFn = dyn Fn(&mut HttpRequest) + Send + Sync;
pub(crate) type RequestDecoratorFn = dyn Fn(&Resource, Request) -> Request + Send + Sync;
pub(crate) type ConfigMutatorFn = dyn Fn(&mut Configuration) + Send + Sync;

/// Frozen settings for one (resource, method) pair.
#[derive(Clone)]
pub struct Configuration {
    /// Headers applied to every outbound request before mutators run.
    pub headers: HashMap<String, String>,
    /// Seconds before cached/held data is considered stale.
    pub expiration_time: f64,
    /// Seconds before `load_if_needed` retries after an error.
    pub retry_time: f64,
    /// The response-processing pipeline snapshot.
    pub pipeline: Pipeline,
    pub(crate) mutators: Vec<Arc<RequestMutatorFn>>,
    pub(crate) decorators: Vec<Arc<RequestDecoratorFn>>,
}

impl Configuration {
    pub(crate) fn with_pipeline(pipeline: Pipeline) -> Self {
        Configuration {
            headers: HashMap::new(),
            expiration_time: 30.0,
            retry_time: 1.0,
            pipeline,
            mutators: Vec::new(),
            decorators: Vec::new(),
        }
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name.into(), value.into());
    }

    /// Edit every outbound request (headers, body, method) before dispatch.
    ///
    /// Mutators registered here run before any ad-hoc per-request mutators.
    pub fn mutate_requests(&mut self, mutator: impl Fn(&mut HttpRequest) + Send + Sync + 'static) {
        self.mutators.push(Arc::new(mutator));
    }

    /// Replace or wrap requests before observers see them.
    ///
    /// Decorators run in declaration order, each seeing the previous one's
    /// output. A decorator must not start the request it receives; running
    /// the original stays conditional on a chain's decider passing to it.
    pub fn decorate_requests(
        &mut self,
        decorator: impl Fn(&Resource, Request) -> Request + Send + Sync + 'static,
    ) {
        self.decorators.push(Arc::new(decorator));
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Configuration::with_pipeline(Pipeline::default())
    }
}

/// Which requests a configuration entry applies to.
///
/// Built from a bare pattern (all methods) or explicitly scoped:
///
/// ```ignore
/// service.configure("/items/**", |c| c.expiration_time = 10.0);
/// service.configure(
///     ConfigScope::pattern("/items").methods(&[Method::POST]).description("item creation"),
///     |c| c.set_header("X-Idempotency", "on"),
/// );
/// ```
pub struct ConfigScope {
    pub(crate) pattern: UrlPattern,
    pub(crate) methods: Option<Vec<Method>>,
    pub(crate) description: Option<String>,
}

impl ConfigScope {
    pub fn pattern(pattern: impl Into<UrlPattern>) -> Self {
        ConfigScope {
            pattern: pattern.into(),
            methods: None,
            description: None,
        }
    }

    pub fn methods(mut self, methods: &[Method]) -> Self {
        self.methods = Some(methods.to_vec());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

impl From<&str> for ConfigScope {
    fn from(glob: &str) -> Self {
        ConfigScope::pattern(glob)
    }
}

impl From<String> for ConfigScope {
    fn from(glob: String) -> Self {
        ConfigScope::pattern(glob)
    }
}

impl From<regex::Regex> for ConfigScope {
    fn from(regex: regex::Regex) -> Self {
        ConfigScope::pattern(regex)
    }
}

impl From<UrlPattern> for ConfigScope {
    fn from(pattern: UrlPattern) -> Self {
        ConfigScope {
            pattern,
            methods: None,
            description: None,
        }
    }
}

/// Where and how `configure_transformer` installs its transformer.
#[derive(Clone)]
pub struct TransformerOptions {
    pub stage: StageKey,
    pub action: TransformerAction,
    pub transform_errors: bool,
    pub on_type_mismatch: InputTypeMismatchAction,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransformerAction {
    /// Replace the stage's transformer list.
    Replace,
    /// Append after the stage's existing transformers.
    Append,
}

impl Default for TransformerOptions {
    fn default() -> Self {
        TransformerOptions {
            stage: StageKey::Parsing,
            action: TransformerAction::Replace,
            transform_errors: false,
            on_type_mismatch: InputTypeMismatchAction::Error,
        }
    }
}

/// One registered configuration entry.
pub(crate) struct ConfigEntry {
    pub(crate) pattern: CompiledPattern,
    pub(crate) methods: Option<Vec<Method>>,
    pub(crate) description: String,
    pub(crate) mutator: Arc<ConfigMutatorFn>,
}

impl ConfigEntry {
    pub(crate) fn applies_to(&self, url: &url::Url, method: &Method) -> bool {
        self.methods
            .as_ref()
            .is_none_or(|methods| methods.contains(method))
            && self.pattern.matches(url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_times() {
        let c = Configuration::default();
        assert_eq!(c.expiration_time, 30.0);
        assert_eq!(c.retry_time, 1.0);
        assert!(c.headers.is_empty());
    }

    #[test]
    fn scope_from_bare_pattern_covers_all_methods() {
        let scope: ConfigScope = "/items/**".into();
        assert!(scope.methods.is_none());
    }
}
