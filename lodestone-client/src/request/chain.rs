//! Request chaining: a decision point that runs when an inner request
//! completes and picks the chain's final response, possibly from another
//! request entirely.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

use parking_lot::Mutex;

use super::{Request, RequestCore, RequestOps, RequestState};
use crate::response::ResponseInfo;

/// What a chain decider wants done with the inner request's response.
#[derive(Debug)]
pub enum RequestChainAction {
    /// Finish the chain with the inner request's response.
    UseThisResponse,
    /// Finish the chain with the supplied response instead.
    UseResponse(ResponseInfo),
    /// Subscribe to another request and finish with its response, starting
    /// it if it has not started.
    PassTo(Request),
}

type Decider = dyn Fn(&ResponseInfo) -> RequestChainAction + Send + Sync;

pub(crate) struct ChainedRequest {
    core: RequestCore,
    decider: Arc<Decider>,
    cancelled: AtomicBool,
    /// The request whose completion we are currently subscribed to: the
    /// original inner request, or whatever a `PassTo` handed us.
    current: Mutex<Request>,
    original: Request,
    /// Kept for re-registration when `PassTo` swaps the current request.
    progress_callbacks: Mutex<Vec<Arc<dyn Fn(f64) + Send + Sync>>>,
}

impl ChainedRequest {
    pub(crate) fn wrap(inner: Request, decider: Arc<Decider>) -> Request {
        let chain = Arc::new(ChainedRequest {
            core: RequestCore::new(inner.ops.sequencer()),
            decider,
            cancelled: AtomicBool::new(false),
            current: Mutex::new(inner.clone()),
            original: inner.clone(),
            progress_callbacks: Mutex::new(Vec::new()),
        });
        chain.subscribe(&inner);
        Request::from_ops(chain)
    }

    fn subscribe(self: &Arc<Self>, request: &Request) {
        let weak = Arc::downgrade(self);
        request.add_hook(Box::new(move |info| {
            if let Some(chain) = weak.upgrade() {
                chain.step(info);
            }
        }));
    }

    /// Runs synchronously when the current request reaches its terminal
    /// state, before that request's public callbacks are posted.
    fn step(self: &Arc<Self>, info: &ResponseInfo) {
        if self.core.request_state() == RequestState::Completed {
            return;
        }
        if self.cancelled.load(Ordering::SeqCst) || info.response.is_cancellation() {
            // The decider still sees the cancellation, but its verdict no
            // longer redirects the chain.
            let _ = (self.decider)(info);
            self.core.complete(info.clone());
            return;
        }
        match (self.decider)(info) {
            RequestChainAction::UseThisResponse => {
                self.core.complete(info.clone());
            }
            RequestChainAction::UseResponse(response) => {
                self.core.complete(response);
            }
            RequestChainAction::PassTo(next) => {
                *self.current.lock() = next.clone();
                for callback in self.progress_callbacks.lock().iter() {
                    next.ops.add_progress_callback(callback.clone());
                }
                self.subscribe(&next);
                next.start();
            }
        }
    }
}

impl RequestOps for ChainedRequest {
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
        let current = self.current.lock().clone();
        current.start();
    }

    fn cancel(self: Arc<Self>) {
        if self.core.request_state() == RequestState::Completed {
            return;
        }
        self.cancelled.store(true, Ordering::SeqCst);
        // Cancellation propagates back through the completion hook, which
        // completes the chain with the RequestCancelled response.
        let current = self.current.lock().clone();
        current.cancel();
    }

    fn request_state(&self) -> RequestState {
        self.core.request_state()
    }

    fn progress(&self) -> f64 {
        if self.core.request_state() == RequestState::Completed {
            1.0
        } else {
            self.current.lock().progress_fraction()
        }
    }

    fn add_hook(&self, hook: Box<dyn FnOnce(&ResponseInfo) + Send>) {
        self.core.add_hook(hook);
    }

    fn add_callback(&self, callback: Box<dyn FnOnce(&ResponseInfo) + Send>) {
        self.core.add_callback(callback);
    }

    fn add_progress_callback(&self, callback: Arc<dyn Fn(f64) + Send + Sync>) {
        self.progress_callbacks.lock().push(callback.clone());
        self.current.lock().ops.add_progress_callback(callback);
    }

    fn repeated(&self) -> Request {
        ChainedRequest::wrap(self.original.repeated(), self.decider.clone())
    }
}
