use crate::{
    Entity, EntityCacheKey, ErrorCause, InMemoryCache, NewDataSource, RawResponse,
    RequestChainAction, RequestError, RequestState, Resource, ResourceEvent, ResourceObserver,
    Response, ResponseInfo, Service, StageKey, TowerTransport, TransformerAction,
    TransformerOptions, Transport,
};
use bytes::Bytes;
use futures::future::BoxFuture;
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use parking_lot::Mutex;
use std::{
    collections::{BTreeMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::{mpsc, oneshot};
use tower::BoxError;

// ------------------------------------------------------------------------
// mock transport & fixtures
// ------------------------------------------------------------------------

enum Reply {
    Now(RawResponse),
    Gated(oneshot::Receiver<RawResponse>),
}

#[derive(Clone)]
struct SentRequest {
    method: Method,
    url: String,
    headers: HeaderMap,
    body: Bytes,
}

/// Scripted transport: replies are consumed in order; an unscripted request
/// fails the exchange.
#[derive(Clone, Default)]
struct MockTransport {
    replies: Arc<Mutex<VecDeque<Reply>>>,
    log: Arc<Mutex<Vec<SentRequest>>>,
}

impl MockTransport {
    fn new() -> Self {
        MockTransport::default()
    }

    fn reply(&self, response: RawResponse) {
        self.replies.lock().push_back(Reply::Now(response));
    }

    /// Queue a reply the test releases manually, to observe in-flight state.
    fn reply_gated(&self) -> oneshot::Sender<RawResponse> {
        let (tx, rx) = oneshot::channel();
        self.replies.lock().push_back(Reply::Gated(rx));
        tx
    }

    fn requests(&self) -> Vec<SentRequest> {
        self.log.lock().clone()
    }
}

impl Transport for MockTransport {
    fn send(
        &self,
        request: http::Request<Bytes>,
        _progress: crate::ProgressSink,
    ) -> BoxFuture<'static, Result<RawResponse, BoxError>> {
        self.log.lock().push(SentRequest {
            method: request.method().clone(),
            url: request.uri().to_string(),
            headers: request.headers().clone(),
            body: request.body().clone(),
        });
        let reply = self.replies.lock().pop_front();
        Box::pin(async move {
            match reply {
                Some(Reply::Now(response)) => Ok(response),
                Some(Reply::Gated(gate)) => gate.await.map_err(|_| BoxError::from("gate dropped")),
                None => Err(BoxError::from("unscripted request")),
            }
        })
    }
}

fn response_with(status: StatusCode, content_type: &str, body: &[u8], extra: &[(&str, &str)]) -> RawResponse {
    let mut headers = HeaderMap::new();
    if !content_type.is_empty() {
        headers.insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_str(content_type).unwrap(),
        );
    }
    for (name, value) in extra {
        headers.insert(
            http::header::HeaderName::try_from(*name).unwrap(),
            HeaderValue::from_str(value).unwrap(),
        );
    }
    RawResponse {
        status,
        headers,
        body: Bytes::copy_from_slice(body),
    }
}

fn ok_text(body: &str, extra: &[(&str, &str)]) -> RawResponse {
    response_with(StatusCode::OK, "text/plain; charset=utf-8", body.as_bytes(), extra)
}

fn ok_json(body: &str) -> RawResponse {
    response_with(StatusCode::OK, "application/json", body.as_bytes(), &[])
}

fn not_modified() -> RawResponse {
    response_with(StatusCode::NOT_MODIFIED, "", b"", &[])
}

#[derive(Clone)]
struct FakeClock(Arc<Mutex<f64>>);

impl FakeClock {
    fn at(time: f64) -> Self {
        FakeClock(Arc::new(Mutex::new(time)))
    }

    fn set(&self, time: f64) {
        *self.0.lock() = time;
    }

    fn now(&self) -> f64 {
        *self.0.lock()
    }
}

fn make_service(transport: &MockTransport, clock: &FakeClock) -> Service {
    let clock = clock.clone();
    Service::builder()
        .base_url("https://api.example/v2")
        .transport(transport.clone())
        .clock(move || clock.now())
        .build()
        .expect("valid service")
}

/// Records every event an owner-owned closure observer sees.
struct Recorder {
    events: Arc<Mutex<Vec<ResourceEvent>>>,
    rx: mpsc::UnboundedReceiver<ResourceEvent>,
}

impl Recorder {
    async fn next(&mut self) -> ResourceEvent {
        tokio::time::timeout(Duration::from_secs(5), self.rx.recv())
            .await
            .expect("timed out waiting for a resource event")
            .expect("observer dropped")
    }

    fn seen(&self) -> Vec<ResourceEvent> {
        self.events.lock().clone()
    }

    fn no_pending_events(&mut self) -> bool {
        self.rx.try_recv().is_err()
    }
}

fn observe(resource: &Resource) -> (Arc<()>, Recorder) {
    let (tx, rx) = mpsc::unbounded_channel();
    let events = Arc::new(Mutex::new(Vec::new()));
    let owner = Arc::new(());
    let log = events.clone();
    resource.observe(&owner, move |_resource, event| {
        log.lock().push(*event);
        let _ = tx.send(*event);
    });
    (owner, Recorder { events, rx })
}

// ------------------------------------------------------------------------
// scenarios
// ------------------------------------------------------------------------

#[tokio::test]
async fn conditional_revalidation_round_trip() {
    let transport = MockTransport::new();
    let clock = FakeClock::at(1000.0);
    let service = make_service(&transport, &clock);
    let resource = service.resource("/doc");
    let (_owner, mut recorder) = observe(&resource);
    assert_eq!(recorder.next().await, ResourceEvent::ObserverAdded);

    transport.reply(ok_text("A", &[("ETag", "\"v1\"")]));
    let info = resource.load().response().await;
    assert!(info.response.is_success());
    assert_eq!(recorder.next().await, ResourceEvent::Requested);
    assert_eq!(
        recorder.next().await,
        ResourceEvent::NewData(NewDataSource::Network)
    );
    let data = resource.latest_data().expect("loaded");
    assert_eq!(data.text(), Some("A"));
    assert_eq!(data.timestamp, 1000.0);

    clock.set(2000.0);
    transport.reply(not_modified());
    let info = resource.load().response().await;
    assert!(info.response.is_success());
    assert!(!info.is_new);
    assert_eq!(recorder.next().await, ResourceEvent::Requested);
    assert_eq!(recorder.next().await, ResourceEvent::NotModified);
    let data = resource.latest_data().expect("still loaded");
    assert_eq!(data.text(), Some("A"));
    assert_eq!(data.timestamp, 2000.0);
    assert!(resource.latest_error().is_none());

    let sent = transport.requests();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].url, "https://api.example/v2/doc");
    assert!(sent[0].headers.get("if-none-match").is_none());
    assert_eq!(sent[1].headers.get("if-none-match").unwrap(), "\"v1\"");
}

#[tokio::test]
async fn a_304_with_no_local_data_is_an_error() {
    let transport = MockTransport::new();
    let clock = FakeClock::at(1000.0);
    let service = make_service(&transport, &clock);
    let resource = service.resource("/doc");

    transport.reply(not_modified());
    let info = resource.load().response().await;
    let error = info.response.error().expect("must fail");
    assert!(matches!(error.cause, ErrorCause::NoLocalDataFor304));
    assert!(matches!(
        resource.latest_error().unwrap().cause,
        ErrorCause::NoLocalDataFor304
    ));
}

#[tokio::test]
async fn cached_data_satisfies_fresh_reads_then_revalidates_when_stale() {
    let transport = MockTransport::new();
    let clock = FakeClock::at(1000.0);
    let service = make_service(&transport, &clock);
    let cache = InMemoryCache::new();
    let resource = service.resource("/doc");
    cache.insert(
        EntityCacheKey {
            resource_key: resource.url().to_string(),
            stage: StageKey::Cleanup,
        },
        Entity::new("cached".to_owned(), "text/plain").with_timestamp(995.0),
    );
    let bound = cache.clone();
    service.configure("/doc", move |config| {
        config.expiration_time = 10.0;
        config
            .pipeline
            .stage_mut(StageKey::Cleanup)
            .set_cache(Arc::new(bound.clone()));
    });

    let (_owner, mut recorder) = observe(&resource);
    assert_eq!(recorder.next().await, ResourceEvent::ObserverAdded);
    assert_eq!(
        recorder.next().await,
        ResourceEvent::NewData(NewDataSource::Cache)
    );
    assert_eq!(resource.latest_data().unwrap().text(), Some("cached"));
    assert_eq!(resource.latest_data().unwrap().timestamp, 995.0);

    // fresh: the resource stays quiescent
    assert!(resource.load_if_needed().is_none());
    assert!(transport.requests().is_empty());

    // stale: cache hit stays visible while the network runs
    clock.set(2000.0);
    let gate = transport.reply_gated();
    let request = resource.load_if_needed().expect("stale data triggers a load");
    assert_eq!(recorder.next().await, ResourceEvent::Requested);
    assert_eq!(resource.latest_data().unwrap().text(), Some("cached"));
    assert!(resource.is_loading());

    assert!(gate.send(ok_text("fresh", &[])).is_ok());
    request.response().await;
    assert_eq!(
        recorder.next().await,
        ResourceEvent::NewData(NewDataSource::Network)
    );
    assert_eq!(resource.latest_data().unwrap().text(), Some("fresh"));
}

#[tokio::test]
async fn successful_loads_write_behind_to_bound_caches() {
    let transport = MockTransport::new();
    let clock = FakeClock::at(1000.0);
    let service = make_service(&transport, &clock);
    let cache = InMemoryCache::new();
    let bound = cache.clone();
    service.configure("**", move |config| {
        config
            .pipeline
            .stage_mut(StageKey::Cleanup)
            .set_cache(Arc::new(bound.clone()));
    });
    let resource = service.resource("/doc");

    transport.reply(ok_text("A", &[]));
    resource.load().response().await;

    let key = EntityCacheKey {
        resource_key: resource.url().to_string(),
        stage: StageKey::Cleanup,
    };
    let entity = wait_for(|| cache.get(&key)).await;
    assert_eq!(entity.text(), Some("A"));
}

#[tokio::test]
async fn concurrent_loads_share_one_request() {
    let transport = MockTransport::new();
    let clock = FakeClock::at(1000.0);
    let service = make_service(&transport, &clock);
    let resource = service.resource("/doc");

    let gate = transport.reply_gated();
    let first = resource.load();
    let second = resource.load();
    assert_eq!(first, second);

    let completions = Arc::new(AtomicUsize::new(0));
    for request in [&first, &second] {
        let completions = completions.clone();
        request.on_completion(move |_| {
            completions.fetch_add(1, Ordering::SeqCst);
        });
    }

    assert!(gate.send(ok_text("A", &[])).is_ok());
    let (a, b) = tokio::join!(first.response(), second.response());
    assert!(a.response.is_success());
    assert!(b.response.is_success());
    assert_eq!(completions.load(Ordering::SeqCst), 2);
    assert_eq!(transport.requests().len(), 1);
}

#[tokio::test]
async fn chained_decider_substitutes_the_response() {
    let transport = MockTransport::new();
    let clock = FakeClock::at(1000.0);
    let service = make_service(&transport, &clock);
    service.configure("**", |config| {
        config.decorate_requests(|_resource, request| {
            request.chained(|info| match &info.response {
                Response::Success(entity) => match entity.text() {
                    Some(text) => RequestChainAction::UseResponse(ResponseInfo {
                        response: Response::Success(
                            entity.retyped(format!("{text} redux"), None),
                        ),
                        is_new: info.is_new,
                    }),
                    None => RequestChainAction::UseThisResponse,
                },
                Response::Failure(_) => RequestChainAction::UseThisResponse,
            })
        });
    });
    let resource = service.resource("/doc");

    transport.reply(ok_text("ducks", &[]));
    resource.load().response().await;
    assert_eq!(resource.text(), "ducks redux");
}

#[tokio::test]
async fn chained_pass_to_subscribes_to_the_follow_up_request() {
    let transport = MockTransport::new();
    let clock = FakeClock::at(1000.0);
    let service = make_service(&transport, &clock);
    let resource = service.resource("/doc");

    transport.reply(response_with(StatusCode::UNAUTHORIZED, "text/plain", b"no", &[]));
    transport.reply(ok_text("yes", &[]));

    // 401 → retry once through a not-yet-started twin
    let inner = resource.request(Method::GET);
    let twin = inner.repeated();
    let chained = inner.chained(move |info| {
        let unauthorized = matches!(
            info.response.error().and_then(|e| e.http_status),
            Some(StatusCode::UNAUTHORIZED)
        );
        if unauthorized {
            RequestChainAction::PassTo(twin.clone())
        } else {
            RequestChainAction::UseThisResponse
        }
    });

    let info = chained.response().await;
    assert_eq!(info.response.entity().unwrap().text(), Some("yes"));
    assert_eq!(transport.requests().len(), 2);
}

#[tokio::test]
async fn transformer_errors_surface_and_preserve_prior_data() {
    let transport = MockTransport::new();
    let clock = FakeClock::at(1000.0);
    let service = make_service(&transport, &clock);
    service.configure_transformer_with(
        "**",
        TransformerOptions {
            stage: StageKey::Model,
            action: TransformerAction::Append,
            ..TransformerOptions::default()
        },
        |text: &String, _entity: &Entity| {
            if text == "Orange" {
                Err(RequestError::new(ErrorCause::TransformerReturnedNil, 0.0))
            } else {
                Ok(format!("{text} is a color"))
            }
        },
    );
    let resource = service.resource("/doc");
    let (_owner, mut recorder) = observe(&resource);
    assert_eq!(recorder.next().await, ResourceEvent::ObserverAdded);

    transport.reply(ok_text("Green", &[]));
    resource.load().response().await;
    assert_eq!(recorder.next().await, ResourceEvent::Requested);
    assert_eq!(
        recorder.next().await,
        ResourceEvent::NewData(NewDataSource::Network)
    );
    assert_eq!(resource.text(), "Green is a color");

    clock.set(1100.0);
    transport.reply(ok_text("Orange", &[]));
    resource.load().response().await;
    assert_eq!(recorder.next().await, ResourceEvent::Requested);
    assert_eq!(recorder.next().await, ResourceEvent::Error);
    let error = resource.latest_error().expect("transformer failure recorded");
    assert!(matches!(error.cause, ErrorCause::TransformerReturnedNil));
    assert_eq!(error.timestamp, 1100.0);
    // prior data survives the failure
    assert_eq!(resource.text(), "Green is a color");
}

#[tokio::test]
async fn http_errors_preserve_prior_data_and_the_server_body() {
    let transport = MockTransport::new();
    let clock = FakeClock::at(1000.0);
    let service = make_service(&transport, &clock);
    let resource = service.resource("/doc");

    transport.reply(ok_json(r#"{"ok":true}"#));
    resource.load().response().await;
    assert_eq!(resource.json()["ok"], true);

    clock.set(1100.0);
    transport.reply(response_with(
        StatusCode::INTERNAL_SERVER_ERROR,
        "application/json",
        br#"{"detail":"boom"}"#,
        &[],
    ));
    let info = resource.load().response().await;
    let error = info.response.error().expect("500 is an error");
    assert_eq!(error.http_status, Some(StatusCode::INTERNAL_SERVER_ERROR));
    assert_eq!(error.user_message, "Internal Server Error");
    // the error body went through the standard JSON transformer
    assert_eq!(error.entity.as_ref().unwrap().json().unwrap()["detail"], "boom");
    assert_eq!(resource.json()["ok"], true);
}

#[tokio::test]
async fn cancellation_is_idempotent_and_terminal() {
    let transport = MockTransport::new();
    let clock = FakeClock::at(1000.0);
    let service = make_service(&transport, &clock);
    let resource = service.resource("/doc");
    let (_owner, mut recorder) = observe(&resource);
    assert_eq!(recorder.next().await, ResourceEvent::ObserverAdded);

    let _gate = transport.reply_gated();
    let request = resource.load();
    assert_eq!(recorder.next().await, ResourceEvent::Requested);

    request.cancel();
    request.cancel();
    request.cancel();
    let info = request.response().await;
    assert!(info.response.is_cancellation());
    assert_eq!(recorder.next().await, ResourceEvent::RequestCancelled);
    assert_eq!(
        recorder
            .seen()
            .iter()
            .filter(|e| **e == ResourceEvent::RequestCancelled)
            .count(),
        1
    );
    // cancellation is not a resource failure
    assert!(resource.latest_error().is_none());
    assert!(!resource.is_loading());
    assert_eq!(request.state(), RequestState::Completed);
}

#[tokio::test]
async fn cancelling_a_not_started_request_never_dispatches() {
    let transport = MockTransport::new();
    let clock = FakeClock::at(1000.0);
    let service = make_service(&transport, &clock);
    let resource = service.resource("/doc");

    transport.reply(ok_text("A", &[]));
    let loaded = resource.load();
    loaded.response().await;

    let twin = loaded.repeated();
    assert_eq!(twin.state(), RequestState::NotStarted);
    twin.cancel();
    assert_eq!(twin.state(), RequestState::Completed);
    assert!(twin.response().await.response.is_cancellation());
    assert_eq!(transport.requests().len(), 1);
}

#[tokio::test]
async fn repeated_requests_re_resolve_configuration_at_start() {
    let transport = MockTransport::new();
    let clock = FakeClock::at(1000.0);
    let service = make_service(&transport, &clock);
    let resource = service.resource("/doc");

    transport.reply(ok_text("A", &[]));
    let first = resource.request(Method::GET);
    first.response().await;

    service.configure("**", |config| config.set_header("X-Auth", "token-2"));
    transport.reply(ok_text("B", &[]));
    let twin = first.repeated();
    twin.start();
    twin.response().await;

    let sent = transport.requests();
    assert!(sent[0].headers.get("x-auth").is_none());
    assert_eq!(sent[1].headers.get("x-auth").unwrap(), "token-2");
}

#[tokio::test]
async fn plain_requests_do_not_touch_resource_state() {
    let transport = MockTransport::new();
    let clock = FakeClock::at(1000.0);
    let service = make_service(&transport, &clock);
    let resource = service.resource("/doc");
    let (_owner, mut recorder) = observe(&resource);
    assert_eq!(recorder.next().await, ResourceEvent::ObserverAdded);

    let gate = transport.reply_gated();
    let request = resource.request(Method::DELETE);
    assert!(resource.is_requesting());
    assert!(!resource.is_loading());
    assert!(gate.send(response_with(StatusCode::INTERNAL_SERVER_ERROR, "", b"", &[])).is_ok());
    let info = request.response().await;
    assert!(!info.response.is_success());

    assert!(resource.latest_error().is_none());
    assert!(resource.latest_data().is_none());
    assert!(!resource.is_requesting());
    assert!(recorder.no_pending_events());
}

#[tokio::test]
async fn url_encoded_bodies_are_canonical_on_the_wire() {
    let transport = MockTransport::new();
    let clock = FakeClock::at(1000.0);
    let service = make_service(&transport, &clock);
    let resource = service.resource("/submit");

    let mut form = BTreeMap::new();
    form.insert("f••".to_owned(), "b r".to_owned());
    form.insert("℥=&".to_owned(), "ℌℑ=&".to_owned());
    transport.reply(ok_text("ok", &[]));
    resource
        .request_with_url_encoded(Method::POST, &form)
        .response()
        .await;

    let sent = transport.requests();
    assert_eq!(sent[0].method, Method::POST);
    assert_eq!(
        sent[0].headers.get("content-type").unwrap(),
        "application/x-www-form-urlencoded"
    );
    assert_eq!(
        &sent[0].body[..],
        b"%E2%84%A5%3D%26=%E2%84%8C%E2%84%91%3D%26&f%E2%80%A2%E2%80%A2=b%20r" as &[u8]
    );
}

#[tokio::test]
async fn retry_time_gates_reloads_after_errors() {
    let transport = MockTransport::new();
    let clock = FakeClock::at(1000.0);
    let service = make_service(&transport, &clock);
    service.configure("**", |config| config.retry_time = 5.0);
    let resource = service.resource("/doc");

    transport.reply(response_with(StatusCode::INTERNAL_SERVER_ERROR, "", b"", &[]));
    resource.load().response().await;
    assert!(resource.latest_error().is_some());

    clock.set(1004.0);
    assert!(resource.load_if_needed().is_none());

    clock.set(1006.0);
    transport.reply(ok_text("recovered", &[]));
    let request = resource.load_if_needed().expect("retry window has passed");
    request.response().await;
    assert_eq!(resource.text(), "recovered");
}

#[tokio::test]
async fn invalidate_forces_the_next_load_if_needed() {
    let transport = MockTransport::new();
    let clock = FakeClock::at(1000.0);
    let service = make_service(&transport, &clock);
    let resource = service.resource("/doc");

    transport.reply(ok_text("A", &[]));
    resource.load().response().await;
    assert!(resource.load_if_needed().is_none());

    resource.invalidate();
    transport.reply(ok_text("B", &[]));
    let request = resource.load_if_needed().expect("invalidation forces a load");
    request.response().await;
    assert_eq!(resource.text(), "B");
}

#[tokio::test]
async fn wipe_cancels_requests_and_clears_state() {
    let transport = MockTransport::new();
    let clock = FakeClock::at(1000.0);
    let service = make_service(&transport, &clock);
    let resource = service.resource("/doc");
    let (_owner, mut recorder) = observe(&resource);
    assert_eq!(recorder.next().await, ResourceEvent::ObserverAdded);

    transport.reply(ok_text("A", &[]));
    resource.load().response().await;
    assert_eq!(recorder.next().await, ResourceEvent::Requested);
    assert_eq!(
        recorder.next().await,
        ResourceEvent::NewData(NewDataSource::Network)
    );

    let _gate = transport.reply_gated();
    let inflight = resource.load();
    assert_eq!(recorder.next().await, ResourceEvent::Requested);

    resource.wipe();
    assert_eq!(recorder.next().await, ResourceEvent::RequestCancelled);
    assert_eq!(
        recorder.next().await,
        ResourceEvent::NewData(NewDataSource::Wipe)
    );
    assert!(inflight.response().await.response.is_cancellation());
    assert!(resource.latest_data().is_none());
    assert!(resource.latest_error().is_none());
}

#[tokio::test]
async fn override_local_data_bypasses_transformers_and_purges_caches() {
    let transport = MockTransport::new();
    let clock = FakeClock::at(1000.0);
    let service = make_service(&transport, &clock);
    let cache = InMemoryCache::new();
    let bound = cache.clone();
    service.configure("**", move |config| {
        config
            .pipeline
            .stage_mut(StageKey::Cleanup)
            .set_cache(Arc::new(bound.clone()));
    });
    let resource = service.resource("/doc");
    let key = EntityCacheKey {
        resource_key: resource.url().to_string(),
        stage: StageKey::Cleanup,
    };
    cache.insert(key.clone(), Entity::new("old".to_owned(), "text/plain").with_timestamp(1.0));
    let (_owner, mut recorder) = observe(&resource);
    assert_eq!(recorder.next().await, ResourceEvent::ObserverAdded);

    resource.override_local_data(Entity::new("local".to_owned(), "text/plain"));
    loop {
        match recorder.next().await {
            ResourceEvent::NewData(NewDataSource::LocalOverride) => break,
            ResourceEvent::NewData(NewDataSource::Cache) => continue,
            other => panic!("unexpected event {other:?}"),
        }
    }
    assert_eq!(resource.text(), "local");
    assert_eq!(resource.latest_data().unwrap().timestamp, 1000.0);

    wait_until(|| cache.get(&key).is_none()).await;
}

#[tokio::test]
async fn observers_stop_when_their_sole_owner_is_dropped() {
    let transport = MockTransport::new();
    let clock = FakeClock::at(1000.0);
    let service = make_service(&transport, &clock);
    let resource = service.resource("/doc");
    let (owner, mut recorder) = observe(&resource);
    assert_eq!(recorder.next().await, ResourceEvent::ObserverAdded);

    transport.reply(ok_text("A", &[]));
    resource.load().response().await;
    assert_eq!(recorder.next().await, ResourceEvent::Requested);
    assert_eq!(
        recorder.next().await,
        ResourceEvent::NewData(NewDataSource::Network)
    );

    drop(owner);
    transport.reply(ok_text("B", &[]));
    resource.load().response().await;
    assert!(recorder.no_pending_events());
}

struct Farewell {
    stopped: Arc<AtomicBool>,
}

impl ResourceObserver for Farewell {
    fn resource_changed(&self, _resource: &Resource, _event: &ResourceEvent) {}

    fn stopped_observing(&self, _resource: &Resource) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn removed_observers_receive_stopped_observing() {
    let transport = MockTransport::new();
    let clock = FakeClock::at(1000.0);
    let service = make_service(&transport, &clock);
    let resource = service.resource("/doc");

    let stopped = Arc::new(AtomicBool::new(false));
    let owner = Arc::new(());
    resource.add_observer_owned_by(
        Arc::new(Farewell {
            stopped: stopped.clone(),
        }),
        &owner,
    );

    drop(owner);
    // the next transition detects the dead owner and posts the farewell
    transport.reply(ok_text("A", &[]));
    resource.load().response().await;
    assert!(stopped.load(Ordering::SeqCst));
}

struct Counter {
    count: Arc<AtomicUsize>,
}

impl ResourceObserver for Counter {
    fn resource_changed(&self, _resource: &Resource, _event: &ResourceEvent) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn adding_the_same_observer_twice_is_a_no_op() {
    let transport = MockTransport::new();
    let clock = FakeClock::at(1000.0);
    let service = make_service(&transport, &clock);
    let resource = service.resource("/doc");

    let count = Arc::new(AtomicUsize::new(0));
    let observer: Arc<dyn ResourceObserver> = Arc::new(Counter { count: count.clone() });
    resource.add_observer(observer.clone());
    resource.add_observer(observer.clone());

    transport.reply(ok_text("A", &[]));
    resource.load().response().await;
    // ObserverAdded + Requested + NewData, each exactly once
    assert_eq!(count.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn resources_are_unique_per_canonical_url() {
    let transport = MockTransport::new();
    let clock = FakeClock::at(1000.0);
    let service = make_service(&transport, &clock);

    let built = service
        .resource("/items")
        .with_param("b", Some("2"))
        .with_param("a", Some("1"));
    let parsed = service.resource("/items?a=1&b=2");
    assert_eq!(built, parsed);
    assert_eq!(built.url().as_str(), "https://api.example/v2/items?a=1&b=2");

    assert_eq!(service.resource("/items").child("3"), service.resource("/items/3"));
    assert_eq!(
        service.resource("/items/3").relative("../users").unwrap(),
        service.resource("/users")
    );
    assert_eq!(
        built.with_param("a", None).with_param("b", None),
        service.resource("/items")
    );
}

#[tokio::test]
async fn wipe_resources_matches_patterns() {
    let transport = MockTransport::new();
    let clock = FakeClock::at(1000.0);
    let service = make_service(&transport, &clock);
    let items = service.resource("/items");
    let users = service.resource("/users");

    transport.reply(ok_text("items", &[]));
    items.load().response().await;
    transport.reply(ok_text("users", &[]));
    users.load().response().await;

    service.wipe_resources("/items/**");
    assert!(items.latest_data().is_none());
    assert_eq!(users.text(), "users");
}

#[tokio::test]
async fn progress_callbacks_precede_the_terminal_callback() {
    let transport = MockTransport::new();
    let clock = FakeClock::at(1000.0);
    let service = make_service(&transport, &clock);
    let resource = service.resource("/doc");

    let order = Arc::new(Mutex::new(Vec::new()));
    transport.reply(ok_text("A", &[]));
    let request = resource.load();
    {
        let order = order.clone();
        request.on_progress(move |fraction| order.lock().push(format!("progress {fraction}")));
    }
    {
        let order = order.clone();
        request.on_completion(move |_| order.lock().push("completed".to_owned()));
    }
    request.response().await;

    let order = order.lock().clone();
    assert_eq!(order.last().map(String::as_str), Some("completed"));
    assert!(order.iter().any(|o| o == "progress 1"));
    assert_eq!(request.progress_fraction(), 1.0);
}

#[tokio::test]
async fn tower_transport_integrates_end_to_end() {
    use http_body_util::Full;

    let (mock, mut handle) =
        tower_test::mock::pair::<http::Request<Bytes>, http::Response<Full<Bytes>>>();
    let service = Service::builder()
        .base_url("https://api.example/v2")
        .transport(TowerTransport::new(mock))
        .build()
        .expect("valid service");
    let resource = service.resource("/ping");

    let server = tokio::spawn(async move {
        let (request, send) = handle.next_request().await.expect("request dispatched");
        assert_eq!(request.uri().to_string(), "https://api.example/v2/ping");
        send.send_response(
            http::Response::builder()
                .status(StatusCode::OK)
                .header("content-type", "application/json")
                .body(Full::new(Bytes::from_static(br#"{"pong":true}"#)))
                .unwrap(),
        );
    });

    let info = resource.load().response().await;
    assert!(info.response.is_success());
    assert_eq!(resource.json()["pong"], true);
    server.await.unwrap();
}

// ------------------------------------------------------------------------
// async assertion helpers
// ------------------------------------------------------------------------

async fn wait_for<T>(mut probe: impl FnMut() -> Option<T>) -> T {
    for _ in 0..1000 {
        if let Some(value) = probe() {
            return value;
        }
        tokio::task::yield_now().await;
    }
    panic!("condition not reached");
}

async fn wait_until(mut probe: impl FnMut() -> bool) {
    wait_for(|| probe().then_some(())).await;
}
