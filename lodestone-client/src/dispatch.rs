//! The main sequencer.
//!
//! All observer notification and request-callback delivery funnels through
//! one unbounded queue drained by a single spawned task, so every observer
//! of every resource sees events in the same total order. State mutation
//! itself is lock-protected and synchronous; only delivery is deferred.

use tokio::sync::mpsc;

type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Clone)]
pub(crate) struct Sequencer {
    tx: mpsc::UnboundedSender<Task>,
}

impl Sequencer {
    /// Spawns the drain task on the current tokio runtime.
    pub(crate) fn spawn() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Task>();
        tokio::spawn(async move {
            while let Some(task) = rx.recv().await {
                task();
            }
        });
        Sequencer { tx }
    }

    /// Enqueue a task. Posting never blocks; tasks run in posting order.
    ///
    /// Silently drops the task when the runtime is shutting down, which is
    /// the only time the drain task can be gone.
    pub(crate) fn post(&self, task: impl FnOnce() + Send + 'static) {
        let _ = self.tx.send(Box::new(task));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    #[tokio::test]
    async fn tasks_run_in_posting_order() {
        let sequencer = Sequencer::spawn();
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let counter = Arc::new(AtomicUsize::new(0));
        for i in 0..10 {
            let log = log.clone();
            let counter = counter.clone();
            sequencer.post(move || {
                log.lock().push(i);
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        while counter.load(Ordering::SeqCst) < 10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(*log.lock(), (0..10).collect::<Vec<_>>());
    }
}
