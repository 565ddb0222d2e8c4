//! The request abstraction: one logical HTTP exchange.
//!
//! [`Request`] is a cheap cloneable handle over a trait object; the
//! concrete behaviors are the network request, the chained request, and
//! whatever decorators substitute. All share [`RequestCore`], the terminal
//! state machine with its callback bookkeeping.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use lodestone_core::{Entity, RequestError};
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::{dispatch::Sequencer, response::ResponseInfo};

pub(crate) mod chain;
pub(crate) mod network;

pub use chain::RequestChainAction;

/// Where a request is in its lifecycle. All completed states are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestState {
    NotStarted,
    InProgress,
    Completed,
}

/// A handle on one logical HTTP exchange.
///
/// Callback registration methods return `&Self` for chaining. Each
/// completion-class callback fires exactly once, on the main sequencer,
/// after the owning resource's observers have been notified. Attaching a
/// callback to an already-completed request enqueues it immediately.
#[derive(Clone)]
pub struct Request {
    pub(crate) ops: Arc<dyn RequestOps>,
}

impl Request {
    pub(crate) fn from_ops(ops: Arc<dyn RequestOps>) -> Self {
        Request { ops }
    }

    /// Begin the exchange. A no-op on started or completed requests.
    pub fn start(&self) -> &Self {
        Arc::clone(&self.ops).start();
        self
    }

    /// Transition to `Cancelled` immediately and best-effort abort the
    /// transport. Idempotent; a no-op once completed. A not-yet-started
    /// request completes without ever starting.
    pub fn cancel(&self) {
        Arc::clone(&self.ops).cancel();
    }

    pub fn state(&self) -> RequestState {
        self.ops.request_state()
    }

    pub fn is_completed(&self) -> bool {
        self.state() == RequestState::Completed
    }

    /// Latest progress estimate in `[0, 1]`; exactly `1.0` once completed.
    pub fn progress_fraction(&self) -> f64 {
        self.ops.progress()
    }

    /// A restartable twin: same method, URL and body as this request had at
    /// construction, with configuration, headers and mutators re-resolved
    /// at `start()`. Callbacks are not copied and decorators that wrapped
    /// this request are not re-applied. The twin never updates resource
    /// state; adopt it with `Resource::load_using` if it should.
    pub fn repeated(&self) -> Request {
        self.ops.repeated()
    }

    /// Wrap this request in a decision point that runs when it completes.
    pub fn chained(
        &self,
        decider: impl Fn(&ResponseInfo) -> RequestChainAction + Send + Sync + 'static,
    ) -> Request {
        chain::ChainedRequest::wrap(self.clone(), Arc::new(decider))
    }

    /// Called for any terminal outcome.
    pub fn on_completion(&self, callback: impl FnOnce(&ResponseInfo) + Send + 'static) -> &Self {
        self.ops.add_callback(Box::new(callback));
        self
    }

    /// Called on success, including 304 revalidations.
    pub fn on_success(&self, callback: impl FnOnce(&Entity) + Send + 'static) -> &Self {
        self.on_completion(move |info| {
            if let Some(entity) = info.response.entity() {
                callback(entity);
            }
        })
    }

    /// Called on success with fresh content; skipped for 304s.
    pub fn on_new_data(&self, callback: impl FnOnce(&Entity) + Send + 'static) -> &Self {
        self.on_completion(move |info| {
            if info.is_new {
                if let Some(entity) = info.response.entity() {
                    callback(entity);
                }
            }
        })
    }

    /// Called only for a 304 revalidation.
    pub fn on_not_modified(&self, callback: impl FnOnce() + Send + 'static) -> &Self {
        self.on_completion(move |info| {
            if !info.is_new && info.response.is_success() {
                callback();
            }
        })
    }

    /// Called on any failure, including cancellation.
    pub fn on_failure(&self, callback: impl FnOnce(&RequestError) + Send + 'static) -> &Self {
        self.on_completion(move |info| {
            if let Some(error) = info.response.error() {
                callback(error);
            }
        })
    }

    /// Called with each progress estimate; all progress callbacks fire
    /// before the terminal completion callbacks.
    pub fn on_progress(&self, callback: impl Fn(f64) + Send + Sync + 'static) -> &Self {
        self.ops.add_progress_callback(Arc::new(callback));
        self
    }

    /// Await the terminal outcome.
    pub async fn response(&self) -> ResponseInfo {
        let (tx, rx) = oneshot::channel();
        self.on_completion(move |info| {
            let _ = tx.send(info.clone());
        });
        match rx.await {
            Ok(info) => info,
            // The sequencer only drops callbacks when the runtime is
            // tearing down; report that as a cancellation.
            Err(_) => ResponseInfo::new(crate::response::Response::Failure(
                RequestError::cancelled(0.0),
            )),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.ops.id()
    }

    pub(crate) fn add_hook(&self, hook: Box<dyn FnOnce(&ResponseInfo) + Send>) {
        self.ops.add_hook(hook);
    }
}

impl PartialEq for Request {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Request {}

impl std::fmt::Debug for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}

/// The behavior seam between the handle and concrete request kinds.
pub(crate) trait RequestOps: Send + Sync {
    fn id(&self) -> u64;
    fn sequencer(&self) -> Sequencer;
    fn start(self: Arc<Self>);
    fn cancel(self: Arc<Self>);
    fn request_state(&self) -> RequestState;
    fn progress(&self) -> f64;
    /// Internal hooks run synchronously at the terminal transition, before
    /// public callbacks are posted. Resource state wiring lives here.
    fn add_hook(&self, hook: Box<dyn FnOnce(&ResponseInfo) + Send>);
    fn add_callback(&self, callback: Box<dyn FnOnce(&ResponseInfo) + Send>);
    fn add_progress_callback(&self, callback: Arc<dyn Fn(f64) + Send + Sync>);
    fn repeated(&self) -> Request;
}

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

enum Phase {
    NotStarted,
    InProgress,
    Completed(ResponseInfo),
}

struct CoreState {
    phase: Phase,
    hooks: Vec<Box<dyn FnOnce(&ResponseInfo) + Send>>,
    callbacks: Vec<Box<dyn FnOnce(&ResponseInfo) + Send>>,
    progress_callbacks: Vec<Arc<dyn Fn(f64) + Send + Sync>>,
}

/// Terminal state machine shared by all request kinds.
pub(crate) struct RequestCore {
    id: u64,
    sequencer: Sequencer,
    state: Mutex<CoreState>,
    progress_bits: AtomicU64,
}

impl RequestCore {
    pub(crate) fn new(sequencer: Sequencer) -> Self {
        RequestCore {
            id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
            sequencer,
            state: Mutex::new(CoreState {
                phase: Phase::NotStarted,
                hooks: Vec::new(),
                callbacks: Vec::new(),
                progress_callbacks: Vec::new(),
            }),
            progress_bits: AtomicU64::new(0),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn sequencer(&self) -> Sequencer {
        self.sequencer.clone()
    }

    pub(crate) fn request_state(&self) -> RequestState {
        match self.state.lock().phase {
            Phase::NotStarted => RequestState::NotStarted,
            Phase::InProgress => RequestState::InProgress,
            Phase::Completed(_) => RequestState::Completed,
        }
    }

    /// NotStarted → InProgress; false if that transition already happened.
    pub(crate) fn try_begin(&self) -> bool {
        let mut state = self.state.lock();
        match state.phase {
            Phase::NotStarted => {
                state.phase = Phase::InProgress;
                true
            }
            _ => false,
        }
    }

    /// Drive the terminal transition. Exactly one call wins; the rest are
    /// no-ops. Hooks run synchronously here, then the final progress and
    /// the public callbacks are posted, in that order.
    pub(crate) fn complete(&self, info: ResponseInfo) -> bool {
        let (hooks, callbacks) = {
            let mut state = self.state.lock();
            if matches!(state.phase, Phase::Completed(_)) {
                return false;
            }
            state.phase = Phase::Completed(info.clone());
            (
                std::mem::take(&mut state.hooks),
                std::mem::take(&mut state.callbacks),
            )
        };
        for hook in hooks {
            hook(&info);
        }
        self.set_progress(1.0);
        if !callbacks.is_empty() {
            self.sequencer.post(move || {
                for callback in callbacks {
                    callback(&info);
                }
            });
        }
        true
    }

    pub(crate) fn add_hook(&self, hook: Box<dyn FnOnce(&ResponseInfo) + Send>) {
        let completed = {
            let mut state = self.state.lock();
            match &state.phase {
                Phase::Completed(info) => Some(info.clone()),
                _ => {
                    state.hooks.push(hook);
                    return;
                }
            }
        };
        if let Some(info) = completed {
            hook(&info);
        }
    }

    pub(crate) fn add_callback(&self, callback: Box<dyn FnOnce(&ResponseInfo) + Send>) {
        let mut state = self.state.lock();
        match &state.phase {
            Phase::Completed(info) => {
                let info = info.clone();
                self.sequencer.post(move || callback(&info));
            }
            _ => state.callbacks.push(callback),
        }
    }

    pub(crate) fn add_progress_callback(&self, callback: Arc<dyn Fn(f64) + Send + Sync>) {
        let completed = {
            let mut state = self.state.lock();
            let completed = matches!(state.phase, Phase::Completed(_));
            if !completed {
                state.progress_callbacks.push(callback.clone());
            }
            completed
        };
        if completed {
            self.sequencer.post(move || callback(1.0));
        }
    }

    pub(crate) fn set_progress(&self, fraction: f64) {
        self.progress_bits
            .store(fraction.to_bits(), Ordering::Relaxed);
        let callbacks = self.state.lock().progress_callbacks.clone();
        if !callbacks.is_empty() {
            self.sequencer.post(move || {
                for callback in &callbacks {
                    callback(fraction);
                }
            });
        }
    }

    pub(crate) fn progress(&self) -> f64 {
        f64::from_bits(self.progress_bits.load(Ordering::Relaxed))
    }
}
