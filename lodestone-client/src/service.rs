//! The root handle for one API: resource registry, configuration entries,
//! transport, and the logical clock.

use std::{
    any::Any,
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
    time::{SystemTime, UNIX_EPOCH},
};

use ahash::HashMap;
use http::Method;
use lodestone_core::{navigation, Entity, RequestError, UrlPattern};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::{
    config::{ConfigEntry, ConfigScope, Configuration, TransformerAction, TransformerOptions},
    dispatch::Sequencer,
    pipeline::Pipeline,
    resource::{Resource, ResourceInner},
    transformer::{ContentTransformer, ResponseTransformer},
    transport::Transport,
};

/// The logical clock: seconds, injectable for deterministic tests.
pub type Clock = Arc<dyn Fn() -> f64 + Send + Sync>;

fn system_clock() -> Clock {
    Arc::new(|| {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0)
    })
}

struct Registry {
    by_url: HashMap<String, Weak<ResourceInner>>,
    /// Strong retention ring for recently vended resources, bounded by the
    /// service's resource limit.
    recent: VecDeque<Resource>,
    /// Resources strongly retained because they have observers.
    observed: HashMap<String, Resource>,
}

impl Registry {
    fn remember(&mut self, resource: Resource, limit: usize) {
        self.recent.retain(|r| *r != resource);
        self.recent.push_back(resource);
        while self.recent.len() > limit {
            self.recent.pop_front();
        }
    }
}

pub(crate) struct ServiceInner {
    base_url: Option<Url>,
    transport: Arc<dyn Transport>,
    clock: Clock,
    sequencer: Sequencer,
    registry: Mutex<Registry>,
    entries: Mutex<Vec<ConfigEntry>>,
    generation: AtomicU64,
    default_pipeline: Pipeline,
    resource_limit: usize,
}

/// The root handle for one API.
///
/// Cheap to clone; clones share one registry. Construct with
/// [`Service::builder`] — a tokio runtime must be current, since the
/// service spawns its notification sequencer at construction.
#[derive(Clone)]
pub struct Service {
    inner: Arc<ServiceInner>,
}

impl Service {
    pub fn builder() -> ServiceBuilder {
        ServiceBuilder::default()
    }

    pub fn base_url(&self) -> Option<&Url> {
        self.inner.base_url.as_ref()
    }

    // ---------- resources ----------

    /// The canonical resource at `path` below the base URL.
    ///
    /// Path segments are appended to the base, not resolved as an href;
    /// use [`Resource::relative`] for RFC reference resolution.
    ///
    /// # Panics
    /// Panics when the service has no base URL; use
    /// [`Service::resource_from_url`] for absolute URLs.
    pub fn resource(&self, path: &str) -> Resource {
        let Some(base) = self.inner.base_url.as_ref() else {
            panic!("Service::resource({path:?}) requires a base URL; use resource_from_url");
        };
        self.resource_from_url(navigation::append_path(base, path))
    }

    /// The canonical resource for an absolute URL.
    ///
    /// At most one live resource exists per canonical URL; repeated lookups
    /// return the same instance for as long as anything holds it.
    pub fn resource_from_url(&self, url: Url) -> Resource {
        let url = navigation::canonical(url);
        let key = url.to_string();
        let mut registry = self.inner.registry.lock();
        if let Some(existing) = registry.by_url.get(&key).and_then(Weak::upgrade) {
            let resource = Resource { inner: existing };
            registry.remember(resource.clone(), self.inner.resource_limit);
            return resource;
        }
        let resource = Resource::new(self.clone(), url);
        registry.by_url.retain(|_, weak| weak.strong_count() > 0);
        registry
            .by_url
            .insert(key, Arc::downgrade(&resource.inner));
        registry.remember(resource.clone(), self.inner.resource_limit);
        debug!(target: "lodestone::state", url = %resource.url(), "resource created");
        resource
    }

    /// Drop strong references to resources nobody observes or holds.
    ///
    /// The portable equivalent of a low-memory flush; pair with
    /// [`Service::flush_unused_on`] for a pressure signal.
    pub fn flush_unused(&self) {
        let mut registry = self.inner.registry.lock();
        registry.recent.clear();
        registry.by_url.retain(|_, weak| weak.strong_count() > 0);
    }

    /// Flush unused resources whenever the signal fires.
    pub fn flush_unused_on(&self, mut signal: tokio::sync::mpsc::Receiver<()>) {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            while signal.recv().await.is_some() {
                match weak.upgrade() {
                    Some(inner) => Service { inner }.flush_unused(),
                    None => break,
                }
            }
        });
    }

    /// Clear data and errors on every resource matching the pattern. Does
    /// not cancel in-flight requests; `Resource::wipe` does.
    pub fn wipe_resources(&self, pattern: impl Into<UrlPattern>) {
        match pattern.into().compile(self.inner.base_url.as_ref()) {
            Ok(compiled) => {
                self.wipe_resources_matching(move |resource| compiled.matches(resource.url()))
            }
            Err(error) => {
                warn!(target: "lodestone::config", %error, "ignoring unparseable wipe pattern")
            }
        }
    }

    /// Clear data and errors on every resource the predicate selects.
    pub fn wipe_resources_matching(&self, predicate: impl Fn(&Resource) -> bool) {
        let resources: Vec<Resource> = {
            let registry = self.inner.registry.lock();
            registry
                .by_url
                .values()
                .filter_map(|weak| weak.upgrade().map(|inner| Resource { inner }))
                .collect()
        };
        for resource in resources {
            if predicate(&resource) {
                resource.clear_state();
            }
        }
    }

    // ---------- configuration ----------

    /// Register a configuration mutator for every (resource, method) the
    /// scope covers. Bare patterns cover all methods.
    pub fn configure(
        &self,
        scope: impl Into<ConfigScope>,
        mutator: impl Fn(&mut Configuration) + Send + Sync + 'static,
    ) {
        let scope = scope.into();
        let compiled = match scope.pattern.compile(self.inner.base_url.as_ref()) {
            Ok(compiled) => compiled,
            Err(error) => {
                warn!(target: "lodestone::config", %error, "ignoring unparseable configuration pattern");
                return;
            }
        };
        let description = scope
            .description
            .unwrap_or_else(|| compiled.description().to_owned());
        debug!(target: "lodestone::config", entry = %description, "configuration registered");
        self.inner.entries.lock().push(ConfigEntry {
            pattern: compiled,
            methods: scope.methods,
            description,
            mutator: Arc::new(mutator),
        });
        self.invalidate_configuration();
    }

    /// Register a typed transformer in the parsing stage for GETs; the
    /// common case of [`Service::configure_transformer_with`].
    pub fn configure_transformer<In, Out, F>(&self, scope: impl Into<ConfigScope>, transform: F)
    where
        In: Any + Send + Sync,
        Out: Any + Send + Sync,
        F: Fn(&In, &Entity) -> Result<Out, RequestError> + Send + Sync + 'static,
    {
        self.configure_transformer_with(scope, TransformerOptions::default(), transform);
    }

    /// Register a typed transformer with explicit stage, replace/append
    /// action, error transformation, and type-mismatch policy. Scopes
    /// without explicit methods apply to GET only.
    pub fn configure_transformer_with<In, Out, F>(
        &self,
        scope: impl Into<ConfigScope>,
        options: TransformerOptions,
        transform: F,
    ) where
        In: Any + Send + Sync,
        Out: Any + Send + Sync,
        F: Fn(&In, &Entity) -> Result<Out, RequestError> + Send + Sync + 'static,
    {
        let mut scope = scope.into();
        if scope.methods.is_none() {
            scope.methods = Some(vec![Method::GET]);
        }
        let transformer: Arc<dyn ResponseTransformer> = Arc::new(
            ContentTransformer::<In, Out, F>::new(transform)
                .on_type_mismatch(options.on_type_mismatch)
                .transform_errors(options.transform_errors),
        );
        let stage = options.stage;
        let action = options.action;
        self.configure(scope, move |config| {
            let slot = config.pipeline.stage_mut(stage);
            match action {
                TransformerAction::Replace => slot.set_transformer(transformer.clone()),
                TransformerAction::Append => slot.add_transformer(transformer.clone()),
            }
        });
    }

    /// Drop all memoized per-resource configurations; the next read
    /// recomputes from the entry list.
    pub fn invalidate_configuration(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn config_generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    /// Fold every matching entry, in registration order, over the service
    /// defaults.
    pub(crate) fn resolve_configuration(&self, url: &Url, method: &Method) -> Configuration {
        let matching: Vec<(String, Arc<crate::config::ConfigMutatorFn>)> = {
            let entries = self.inner.entries.lock();
            entries
                .iter()
                .filter(|entry| entry.applies_to(url, method))
                .map(|entry| (entry.description.clone(), entry.mutator.clone()))
                .collect()
        };
        let mut config = Configuration::with_pipeline(self.inner.default_pipeline.clone());
        for (description, mutator) in matching {
            debug!(target: "lodestone::config", %url, %method, entry = %description, "applying configuration");
            mutator(&mut config);
        }
        config
    }

    // ---------- registry retention ----------

    pub(crate) fn retain_observed(&self, resource: &Resource) {
        self.inner
            .registry
            .lock()
            .observed
            .insert(resource.url().to_string(), resource.clone());
    }

    pub(crate) fn release_observed(&self, resource: &Resource) {
        self.inner
            .registry
            .lock()
            .observed
            .remove(&resource.url().to_string());
    }

    // ---------- plumbing ----------

    pub(crate) fn clock_now(&self) -> f64 {
        (self.inner.clock)()
    }

    pub(crate) fn sequencer(&self) -> Sequencer {
        self.inner.sequencer.clone()
    }

    pub(crate) fn transport(&self) -> Arc<dyn Transport> {
        self.inner.transport.clone()
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("base_url", &self.inner.base_url.as_ref().map(Url::as_str))
            .finish()
    }
}

/// Errors constructing a [`Service`].
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("invalid base URL: {0}")]
    InvalidBaseUrl(#[source] url::ParseError),
    /// Only possible with the `hyper-transport` feature disabled.
    #[error("no transport configured and no default transport available")]
    MissingTransport,
}

/// Assembles a [`Service`].
pub struct ServiceBuilder {
    base_url: Option<String>,
    transport: Option<Arc<dyn Transport>>,
    clock: Option<Clock>,
    standard_transformers: bool,
    resource_limit: usize,
}

impl Default for ServiceBuilder {
    fn default() -> Self {
        ServiceBuilder {
            base_url: None,
            transport: None,
            clock: None,
            standard_transformers: true,
            resource_limit: 100,
        }
    }
}

impl ServiceBuilder {
    /// The URL that relative resource paths and configuration patterns
    /// resolve against.
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// Replace the default transport.
    pub fn transport(mut self, transport: impl Transport) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Inject the logical clock; tests use a fake for deterministic
    /// expiration and retry behavior.
    pub fn clock(mut self, clock: impl Fn() -> f64 + Send + Sync + 'static) -> Self {
        self.clock = Some(Arc::new(clock));
        self
    }

    /// Whether the stock JSON and text transformers are installed
    /// (default: true).
    pub fn standard_transformers(mut self, standard_transformers: bool) -> Self {
        self.standard_transformers = standard_transformers;
        self
    }

    /// How many unobserved resources the registry strongly retains.
    pub fn resource_limit(mut self, resource_limit: usize) -> Self {
        self.resource_limit = resource_limit;
        self
    }

    /// Build the service. Must be called within a tokio runtime.
    pub fn build(self) -> Result<Service, BuildError> {
        let base_url = self
            .base_url
            .map(|s| Url::parse(&s))
            .transpose()
            .map_err(BuildError::InvalidBaseUrl)?
            .map(navigation::canonical);
        let transport = match self.transport {
            Some(transport) => transport,
            None => default_transport().ok_or(BuildError::MissingTransport)?,
        };
        let default_pipeline = if self.standard_transformers {
            Pipeline::standard()
        } else {
            Pipeline::new()
        };
        Ok(Service {
            inner: Arc::new(ServiceInner {
                base_url,
                transport,
                clock: self.clock.unwrap_or_else(system_clock),
                sequencer: Sequencer::spawn(),
                registry: Mutex::new(Registry {
                    by_url: HashMap::default(),
                    recent: VecDeque::new(),
                    observed: HashMap::default(),
                }),
                entries: Mutex::new(Vec::new()),
                generation: AtomicU64::new(0),
                default_pipeline,
                resource_limit: self.resource_limit,
            }),
        })
    }
}

#[cfg(feature = "hyper-transport")]
fn default_transport() -> Option<Arc<dyn Transport>> {
    Some(Arc::new(crate::transport::HyperTransport::new()))
}

#[cfg(not(feature = "hyper-transport"))]
fn default_transport() -> Option<Arc<dyn Transport>> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_service() -> Service {
        Service::builder()
            .base_url("https://api.example/v2")
            .clock(|| 0.0)
            .build()
            .expect("valid base URL")
    }

    #[tokio::test]
    async fn configuration_folds_in_registration_order() {
        let service = test_service();
        service.configure("**", |config| {
            config.expiration_time = 60.0;
            config.set_header("X-Shared", "1");
        });
        service.configure("/items/**", |config| config.expiration_time = 5.0);

        let items = service.resource("/items/3");
        let other = service.resource("/other");
        assert_eq!(items.configuration().expiration_time, 5.0);
        assert_eq!(other.configuration().expiration_time, 60.0);
        assert_eq!(
            items.configuration().headers.get("X-Shared").map(String::as_str),
            Some("1")
        );
    }

    #[tokio::test]
    async fn method_scoped_entries_apply_only_to_their_methods() {
        let service = test_service();
        service.configure(
            ConfigScope::pattern("**").methods(&[Method::POST]),
            |config| config.set_header("X-Write", "on"),
        );
        let resource = service.resource("/x");
        assert!(resource
            .configuration_for(&Method::GET)
            .headers
            .get("X-Write")
            .is_none());
        assert_eq!(
            resource
                .configuration_for(&Method::POST)
                .headers
                .get("X-Write")
                .map(String::as_str),
            Some("on")
        );
    }

    #[tokio::test]
    async fn memoized_configuration_is_dropped_when_entries_change() {
        let service = test_service();
        let resource = service.resource("/x");
        assert_eq!(resource.configuration().expiration_time, 30.0);
        service.configure("**", |config| config.expiration_time = 99.0);
        assert_eq!(resource.configuration().expiration_time, 99.0);
    }

    #[tokio::test]
    async fn resources_stay_unique_across_flushes_while_held() {
        let service = test_service();
        let held = service.resource("/a");
        assert_eq!(held, service.resource("/a"));
        service.flush_unused();
        assert_eq!(held, service.resource("/a"));
    }

    #[tokio::test]
    async fn building_with_a_bad_base_url_fails() {
        let error = Service::builder().base_url("not a url").build().err();
        assert!(matches!(error, Some(BuildError::InvalidBaseUrl(_))));
    }
}
