//! The canonical in-memory model of one URL's latest-known state.
//!
//! A resource owns three atomically updated facets — latest successful
//! data, latest error, in-flight requests — plus its observer set. All
//! mutation happens under one lock; readers get consistent snapshots and
//! never see partial updates.

use std::{any::Any, collections::BTreeMap, sync::Arc};

use ahash::HashMap;
use bytes::Bytes;
use http::Method;
use lodestone_core::{navigation, params, Entity, HttpRequest, RequestError};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::debug;
use url::Url;

use crate::{
    config::Configuration,
    dispatch::Sequencer,
    request::{
        network::{BodySpec, NetworkRequest},
        Request,
    },
    response::{Response, ResponseInfo},
    service::Service,
    transport::Transport,
};

mod observers;
pub use observers::{NewDataSource, ResourceEvent, ResourceObserver};
use observers::ObserverEntry;

pub(crate) struct State {
    latest_data: Option<Entity>,
    latest_error: Option<RequestError>,
    observers: Vec<ObserverEntry>,
    load_requests: Vec<Request>,
    all_requests: Vec<Request>,
    config_cache: HashMap<Method, (u64, Arc<Configuration>)>,
    invalidated: bool,
    cache_checked: bool,
}

pub(crate) struct ResourceInner {
    service: Service,
    url: Url,
    state: Mutex<State>,
}

/// The unique state holder for one URL within a service.
///
/// Cheap to clone; all clones are the same resource. Obtain one through
/// [`Service::resource`] — two lookups of the same canonical URL return the
/// same instance for as long as any holder or observer keeps it alive.
#[derive(Clone)]
pub struct Resource {
    pub(crate) inner: Arc<ResourceInner>,
}

/// One read-consistent view of a resource's observable facets.
#[derive(Clone, Debug)]
pub struct ResourceSnapshot {
    pub latest_data: Option<Entity>,
    pub latest_error: Option<RequestError>,
    pub is_loading: bool,
    pub is_requesting: bool,
    pub timestamp: f64,
}

impl Resource {
    pub(crate) fn new(service: Service, url: Url) -> Self {
        Resource {
            inner: Arc::new(ResourceInner {
                service,
                url,
                state: Mutex::new(State {
                    latest_data: None,
                    latest_error: None,
                    observers: Vec::new(),
                    load_requests: Vec::new(),
                    all_requests: Vec::new(),
                    config_cache: HashMap::default(),
                    invalidated: false,
                    cache_checked: false,
                }),
            }),
        }
    }

    pub fn url(&self) -> &Url {
        &self.inner.url
    }

    pub fn service(&self) -> &Service {
        &self.inner.service
    }

    // ---------- state access ----------

    /// The latest successfully loaded entity, if any.
    pub fn latest_data(&self) -> Option<Entity> {
        self.inner.state.lock().latest_data.clone()
    }

    /// The most recent failure, cleared by the next success.
    pub fn latest_error(&self) -> Option<RequestError> {
        self.inner.state.lock().latest_error.clone()
    }

    /// Whether a load-class request is in flight.
    pub fn is_loading(&self) -> bool {
        !self.inner.state.lock().load_requests.is_empty()
    }

    /// Whether any request at all is in flight.
    pub fn is_requesting(&self) -> bool {
        !self.inner.state.lock().all_requests.is_empty()
    }

    /// `max` of the data and error timestamps, or zero.
    pub fn timestamp(&self) -> f64 {
        let state = self.inner.state.lock();
        state
            .latest_data
            .as_ref()
            .map(|d| d.timestamp)
            .unwrap_or(0.0)
            .max(
                state
                    .latest_error
                    .as_ref()
                    .map(|e| e.timestamp)
                    .unwrap_or(0.0),
            )
    }

    /// All observable facets in one atomic read.
    pub fn snapshot(&self) -> ResourceSnapshot {
        let state = self.inner.state.lock();
        let data_ts = state.latest_data.as_ref().map(|d| d.timestamp).unwrap_or(0.0);
        let err_ts = state.latest_error.as_ref().map(|e| e.timestamp).unwrap_or(0.0);
        ResourceSnapshot {
            latest_data: state.latest_data.clone(),
            latest_error: state.latest_error.clone(),
            is_loading: !state.load_requests.is_empty(),
            is_requesting: !state.all_requests.is_empty(),
            timestamp: data_ts.max(err_ts),
        }
    }

    /// The latest text content, or `""` if there is none.
    pub fn text(&self) -> String {
        self.inner
            .state
            .lock()
            .latest_data
            .as_ref()
            .and_then(|d| d.text().map(str::to_owned))
            .unwrap_or_default()
    }

    /// The latest JSON content, or `Null` if there is none.
    pub fn json(&self) -> serde_json::Value {
        self.inner
            .state
            .lock()
            .latest_data
            .as_ref()
            .and_then(|d| d.json().cloned())
            .unwrap_or(serde_json::Value::Null)
    }

    /// The latest content as `T`, if that is what the pipeline produced.
    pub fn content_as<T: Any + Clone>(&self) -> Option<T> {
        self.inner
            .state
            .lock()
            .latest_data
            .as_ref()
            .and_then(|d| d.content::<T>().cloned())
    }

    // ---------- navigation ----------

    /// The resource one path segment below this one.
    pub fn child(&self, segment: &str) -> Resource {
        self.service()
            .resource_from_url(navigation::child(&self.inner.url, segment))
    }

    /// The resource at `href` resolved relative to this one.
    pub fn relative(&self, href: &str) -> Result<Resource, url::ParseError> {
        Ok(self
            .service()
            .resource_from_url(navigation::relative(&self.inner.url, href)?))
    }

    /// This resource with one query parameter set (or removed, for `None`).
    pub fn with_param(&self, key: &str, value: Option<&str>) -> Resource {
        self.service()
            .resource_from_url(navigation::with_param(&self.inner.url, key, value))
    }

    // ---------- configuration ----------

    /// The effective configuration for `method`, memoized until the service
    /// configuration changes.
    pub fn configuration_for(&self, method: &Method) -> Arc<Configuration> {
        let generation = self.service().config_generation();
        {
            let state = self.inner.state.lock();
            if let Some((cached_generation, config)) = state.config_cache.get(method) {
                if *cached_generation == generation {
                    return config.clone();
                }
            }
        }
        let config = Arc::new(self.service().resolve_configuration(&self.inner.url, method));
        self.inner
            .state
            .lock()
            .config_cache
            .insert(method.clone(), (generation, config.clone()));
        config
    }

    /// The effective GET configuration.
    pub fn configuration(&self) -> Arc<Configuration> {
        self.configuration_for(&Method::GET)
    }

    // ---------- loading ----------

    /// Whether the held data is still fresh under the configured
    /// expiration time.
    pub fn is_up_to_date(&self) -> bool {
        let config = self.configuration();
        let now = self.clock_now();
        let state = self.inner.state.lock();
        !state.invalidated
            && state
                .latest_data
                .as_ref()
                .is_some_and(|d| d.timestamp + config.expiration_time > now)
    }

    /// Fetch this resource's content, replacing `latest_data` on success.
    ///
    /// Concurrent loads coalesce: while one load is in flight, further
    /// calls return the same request.
    pub fn load(&self) -> Request {
        if let Some(existing) = self.inner.state.lock().load_requests.first().cloned() {
            return existing;
        }
        let raw = NetworkRequest::create(self.clone(), Method::GET, Ok(None), Vec::new(), true);
        let request = self.decorate(&Method::GET, raw);
        self.track_load(&request);
        request.start();
        request
    }

    /// Load only when there is nothing fresh to show.
    ///
    /// Returns the in-flight load if one exists, `None` when held data is
    /// fresh or an error is within its retry window, and a new load
    /// otherwise. Stale held data stays visible while the load runs.
    pub fn load_if_needed(&self) -> Option<Request> {
        self.ensure_cache_checked();
        let config = self.configuration();
        let now = self.clock_now();
        {
            let state = self.inner.state.lock();
            if let Some(existing) = state.load_requests.first() {
                return Some(existing.clone());
            }
            if !state.invalidated {
                if let Some(data) = &state.latest_data {
                    if data.timestamp + config.expiration_time > now {
                        return None;
                    }
                }
                if let Some(error) = &state.latest_error {
                    if error.timestamp + config.retry_time > now {
                        return None;
                    }
                }
            }
        }
        Some(self.load())
    }

    /// Adopt an arbitrary request as a load: its completion updates this
    /// resource's state exactly as `load()` would.
    pub fn load_using(&self, request: &Request) -> Request {
        self.track_load(request);
        request.start();
        request.clone()
    }

    /// Mark held data stale so the next `load_if_needed` always loads.
    pub fn invalidate(&self) {
        self.inner.state.lock().invalidated = true;
    }

    // ---------- plain requests ----------

    /// A bodyless request. Does not touch resource state; see
    /// [`Resource::load_using`] to adopt it as a load.
    pub fn request(&self, method: Method) -> Request {
        self.start_plain(method, Ok(None), Vec::new())
    }

    /// A request with a JSON body (`application/json`).
    pub fn request_with_json<T: Serialize + ?Sized>(&self, method: Method, value: &T) -> Request {
        let body = params::json_body(value).map(|b| Some((b, params::JSON_CONTENT_TYPE.to_owned())));
        self.start_plain(method, body, Vec::new())
    }

    /// A request with a UTF-8 text body.
    pub fn request_with_text(&self, method: Method, text: &str) -> Request {
        self.request_with_text_encoded(method, text, "utf-8")
    }

    /// A request with a text body in the named encoding.
    pub fn request_with_text_encoded(
        &self,
        method: Method,
        text: &str,
        encoding_label: &str,
    ) -> Request {
        let body = params::text_body(text, encoding_label).map(Some);
        self.start_plain(method, body, Vec::new())
    }

    /// A request with a canonical URL-encoded form body.
    pub fn request_with_url_encoded(
        &self,
        method: Method,
        form: &BTreeMap<String, String>,
    ) -> Request {
        let body = params::url_encoded_body(form)
            .map(|b| Some((b, params::FORM_CONTENT_TYPE.to_owned())));
        self.start_plain(method, body, Vec::new())
    }

    /// A request with an arbitrary body and content type.
    pub fn request_with_data(&self, method: Method, data: Bytes, content_type: &str) -> Request {
        self.start_plain(method, Ok(Some((data, content_type.to_owned()))), Vec::new())
    }

    /// A request with an ad-hoc mutator, run after configured mutators.
    pub fn request_with(
        &self,
        method: Method,
        mutator: impl Fn(&mut HttpRequest) + Send + Sync + 'static,
    ) -> Request {
        let mutator: Arc<crate::config::RequestMutatorFn> = Arc::new(mutator);
        self.start_plain(method, Ok(None), vec![mutator])
    }

    fn start_plain(
        &self,
        method: Method,
        body: BodySpec,
        adhoc: Vec<Arc<crate::config::RequestMutatorFn>>,
    ) -> Request {
        let raw = NetworkRequest::create(self.clone(), method.clone(), body, adhoc, false);
        let request = self.decorate(&method, raw);
        self.track_plain(&request);
        request.start();
        request
    }

    // ---------- local mutation ----------

    /// Replace `latest_data` directly, bypassing transformers, and drop any
    /// cached entries for this resource.
    pub fn override_local_data(&self, entity: Entity) {
        let mut entity = entity;
        if entity.timestamp == 0.0 {
            entity.touch(self.clock_now());
        }
        let config = self.configuration();
        {
            let mut state = self.inner.state.lock();
            state.latest_data = Some(entity);
            state.latest_error = None;
        }
        self.broadcast(ResourceEvent::NewData(NewDataSource::LocalOverride));
        config.pipeline.remove_from_caches(self);
    }

    /// Replace only the content, reusing the previous entity's metadata
    /// when there is one.
    pub fn override_local_content<T: Any + Send + Sync>(&self, content: T) {
        let now = self.clock_now();
        let entity = match self.latest_data() {
            Some(existing) => {
                let mut entity = existing.retyped(content, None);
                entity.touch(now);
                entity
            }
            None => Entity::new(content, "application/x-local-override").with_timestamp(now),
        };
        self.override_local_data(entity);
    }

    /// Clear all state *and* cancel every outstanding request.
    pub fn wipe(&self) {
        let requests: Vec<Request> = self.inner.state.lock().all_requests.clone();
        for request in requests {
            request.cancel();
        }
        self.clear_state();
    }

    /// Clear data and error without touching in-flight requests, as
    /// `Service::wipe_resources` does.
    pub(crate) fn clear_state(&self) {
        {
            let mut state = self.inner.state.lock();
            state.latest_data = None;
            state.latest_error = None;
            state.invalidated = false;
            state.cache_checked = false;
        }
        self.broadcast(ResourceEvent::NewData(NewDataSource::Wipe));
    }

    // ---------- request tracking ----------

    fn decorate(&self, method: &Method, request: Request) -> Request {
        let config = self.configuration_for(method);
        let mut request = request;
        for decorator in &config.decorators {
            request = decorator(self, request);
        }
        request
    }

    pub(crate) fn track_load(&self, request: &Request) {
        {
            let mut state = self.inner.state.lock();
            state.load_requests.push(request.clone());
            state.all_requests.push(request.clone());
        }
        self.broadcast(ResourceEvent::Requested);
        let resource = self.clone();
        let id = request.id();
        request.add_hook(Box::new(move |info| {
            resource.receive_load_response(id, info);
        }));
    }

    fn track_plain(&self, request: &Request) {
        self.inner.state.lock().all_requests.push(request.clone());
        let resource = self.clone();
        let id = request.id();
        request.add_hook(Box::new(move |_info| {
            resource
                .inner
                .state
                .lock()
                .all_requests
                .retain(|r| r.id() != id);
        }));
    }

    /// Runs synchronously when an adopted load reaches its terminal state,
    /// before the request's public callbacks are posted.
    fn receive_load_response(&self, id: u64, info: &ResponseInfo) {
        let event = {
            let mut state = self.inner.state.lock();
            state.load_requests.retain(|r| r.id() != id);
            state.all_requests.retain(|r| r.id() != id);
            match &info.response {
                Response::Success(entity) => {
                    state.latest_data = Some(entity.clone());
                    state.latest_error = None;
                    state.invalidated = false;
                    if info.is_new {
                        ResourceEvent::NewData(NewDataSource::Network)
                    } else {
                        ResourceEvent::NotModified
                    }
                }
                // Cancellation is not a failure of the resource: state is
                // untouched and observers just learn the load stopped.
                Response::Failure(error) if error.is_cancellation() => {
                    ResourceEvent::RequestCancelled
                }
                Response::Failure(error) => {
                    state.latest_error = Some(error.clone());
                    ResourceEvent::Error
                }
            }
        };
        self.broadcast(event);
    }

    // ---------- cache warm-up ----------

    /// Kick off the one-time cache read, on first observation or first
    /// `load_if_needed`. A hit is applied only if the resource still has
    /// nothing newer by the time the read completes.
    pub(crate) fn ensure_cache_checked(&self) {
        {
            let mut state = self.inner.state.lock();
            if state.cache_checked {
                return;
            }
            state.cache_checked = true;
        }
        let config = self.configuration();
        if !config.pipeline.has_caches() {
            return;
        }
        let resource = self.clone();
        tokio::spawn(async move {
            let now = resource.clock_now();
            if let Some(entity) = config.pipeline.load_from_caches(&resource, now).await {
                resource.receive_cache_hit(entity);
            }
        });
    }

    fn receive_cache_hit(&self, entity: Entity) {
        {
            let mut state = self.inner.state.lock();
            let stale = state
                .latest_data
                .as_ref()
                .is_none_or(|d| d.timestamp < entity.timestamp);
            if !stale {
                return;
            }
            debug!(target: "lodestone::cache", url = %self.inner.url, "populated from cache");
            state.latest_data = Some(entity);
        }
        self.broadcast(ResourceEvent::NewData(NewDataSource::Cache));
    }

    // ---------- service plumbing ----------

    pub(crate) fn clock_now(&self) -> f64 {
        self.service().clock_now()
    }

    pub(crate) fn sequencer(&self) -> Sequencer {
        self.service().sequencer()
    }

    pub(crate) fn transport(&self) -> Arc<dyn Transport> {
        self.service().transport()
    }
}

impl PartialEq for Resource {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Resource {}

impl std::fmt::Debug for Resource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Resource")
            .field("url", &self.inner.url.as_str())
            .finish()
    }
}
