//! The request kind that actually talks to the transport.

use std::sync::Arc;

use bytes::Bytes;
use http::{Method, StatusCode};
use lodestone_core::{Entity, ErrorCause, HttpRequest, RequestError};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tower::BoxError;
use tracing::debug;

use super::{Request, RequestCore, RequestOps, RequestState};
use crate::{
    config::{Configuration, RequestMutatorFn},
    resource::Resource,
    response::{Response, ResponseInfo},
    transport::{ProgressSink, RawResponse},
};

/// Body captured at request-construction time. An encoding failure is held
/// here and surfaces the moment the request starts.
pub(crate) type BodySpec = Result<Option<(Bytes, String)>, ErrorCause>;

pub(crate) struct NetworkRequest {
    core: RequestCore,
    resource: Resource,
    method: Method,
    body: BodySpec,
    adhoc_mutators: Vec<Arc<RequestMutatorFn>>,
    is_load: bool,
    config: Mutex<Option<Arc<Configuration>>>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl NetworkRequest {
    pub(crate) fn create(
        resource: Resource,
        method: Method,
        body: BodySpec,
        adhoc_mutators: Vec<Arc<RequestMutatorFn>>,
        is_load: bool,
    ) -> Request {
        let core = RequestCore::new(resource.sequencer());
        Request::from_ops(Arc::new(NetworkRequest {
            core,
            resource,
            method,
            body,
            adhoc_mutators,
            is_load,
            config: Mutex::new(None),
            join: Mutex::new(None),
        }))
    }

    /// Assemble the outbound form: configured headers, conditional
    /// revalidation headers for loads, the captured body, then configured
    /// and ad-hoc mutators in that order.
    fn build(&self, config: &Configuration, now: f64) -> Result<HttpRequest, RequestError> {
        let mut request = HttpRequest::new(self.method.clone(), self.resource.url().clone());
        for (name, value) in &config.headers {
            request.set_header(name, value);
        }
        if self.is_load {
            if let Some(data) = self.resource.latest_data() {
                if let Some(etag) = data.etag() {
                    request.set_header("If-None-Match", etag);
                }
                if let Some(last_modified) = data.last_modified() {
                    request.set_header("If-Modified-Since", last_modified);
                }
            }
        }
        match &self.body {
            Err(cause) => return Err(RequestError::new(cause.clone(), now)),
            Ok(Some((bytes, content_type))) => request.set_body(bytes.clone(), content_type),
            Ok(None) => {}
        }
        for mutator in &config.mutators {
            mutator(&mut request);
        }
        for mutator in &self.adhoc_mutators {
            mutator(&mut request);
        }
        Ok(request)
    }

    fn interpret(&self, outcome: Result<RawResponse, BoxError>) -> ResponseInfo {
        let now = self.resource.clock_now();
        let config = self
            .config
            .lock()
            .clone()
            .unwrap_or_else(|| self.resource.configuration_for(&self.method));
        match outcome {
            Err(error) => ResponseInfo::new(Response::Failure(RequestError::new(
                ErrorCause::Transport(Arc::from(error)),
                now,
            ))),
            Ok(raw) if raw.status == StatusCode::NOT_MODIFIED => {
                match self.resource.latest_data() {
                    Some(mut entity) => {
                        entity.touch(now);
                        config.pipeline.touch_caches(&self.resource, &entity);
                        ResponseInfo::not_modified(Response::Success(entity))
                    }
                    None => ResponseInfo::new(Response::Failure(RequestError::new(
                        ErrorCause::NoLocalDataFor304,
                        now,
                    ))),
                }
            }
            Ok(raw) if raw.status.is_success() => {
                let entity = Entity::from_response(raw.headers, raw.body, now);
                // HEAD and 204 responses are zero-length by definition and
                // skip content transformation
                if raw.status == StatusCode::NO_CONTENT || self.method == Method::HEAD {
                    return ResponseInfo::new(Response::Success(entity));
                }
                ResponseInfo::new(config.pipeline.process(
                    Response::Success(entity),
                    &self.resource,
                    now,
                ))
            }
            Ok(raw) => {
                let status = raw.status;
                let entity = if raw.body.is_empty() {
                    None
                } else {
                    Some(Entity::from_response(raw.headers, raw.body, now))
                };
                let error = RequestError::from_status(status, entity, now);
                ResponseInfo::new(config.pipeline.process(
                    Response::Failure(error),
                    &self.resource,
                    now,
                ))
            }
        }
    }
}

impl RequestOps for NetworkRequest {
    fn id(&self) -> u64 {
        self.core.id()
    }

    fn sequencer(&self) -> crate::dispatch::Sequencer {
        self.core.sequencer()
    }

    fn start(self: Arc<Self>) {
        if !self.core.try_begin() {
            return;
        }
        let now = self.resource.clock_now();
        let config = self.resource.configuration_for(&self.method);
        *self.config.lock() = Some(config.clone());

        let request = self.build(&config, now).and_then(|request| {
            request
                .into_http()
                .map_err(|e| RequestError::new(ErrorCause::Transport(Arc::new(e)), now))
        });
        let request = match request {
            Ok(request) => request,
            Err(error) => {
                self.core
                    .complete(ResponseInfo::new(Response::Failure(error)));
                return;
            }
        };
        debug!(
            target: "lodestone::network",
            method = %self.method,
            url = %self.resource.url(),
            "dispatching request"
        );

        let progress_target = Arc::downgrade(&self);
        let sink: ProgressSink = Arc::new(move |metrics| {
            if let Some(request) = progress_target.upgrade() {
                request.core.set_progress(metrics.fraction());
            }
        });
        let exchange = self.resource.transport().send(request, sink);
        let task = Arc::clone(&self);
        let handle = tokio::spawn(async move {
            let outcome = exchange.await;
            let info = task.interpret(outcome);
            task.core.complete(info);
        });
        *self.join.lock() = Some(handle);
    }

    fn cancel(self: Arc<Self>) {
        let now = self.resource.clock_now();
        let cancelled = ResponseInfo::new(Response::Failure(RequestError::cancelled(now)));
        if self.core.complete(cancelled) {
            if let Some(handle) = self.join.lock().take() {
                handle.abort();
            }
            debug!(
                target: "lodestone::network",
                method = %self.method,
                url = %self.resource.url(),
                "request cancelled"
            );
        }
    }

    fn request_state(&self) -> RequestState {
        self.core.request_state()
    }

    fn progress(&self) -> f64 {
        self.core.progress()
    }

    fn add_hook(&self, hook: Box<dyn FnOnce(&ResponseInfo) + Send>) {
        self.core.add_hook(hook);
    }

    fn add_callback(&self, callback: Box<dyn FnOnce(&ResponseInfo) + Send>) {
        self.core.add_callback(callback);
    }

    fn add_progress_callback(&self, callback: Arc<dyn Fn(f64) + Send + Sync>) {
        self.core.add_progress_callback(callback);
    }

    fn repeated(&self) -> Request {
        NetworkRequest::create(
            self.resource.clone(),
            self.method.clone(),
            self.body.clone(),
            self.adhoc_mutators.clone(),
            self.is_load,
        )
    }
}
