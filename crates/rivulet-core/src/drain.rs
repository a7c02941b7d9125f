//! Shared backpressure queue for multi-producer operator stages.
//!
//! `merge`, `flat_map`, and `limit_rate` all face the same problem: values
//! arrive from one or more producer contexts at the producers' pace, while
//! the downstream subscriber must only ever see as many `on_next` calls as
//! it has requested. [`DrainQueue`] solves it once: producers push from any
//! thread, a work-in-progress counter elects a single draining thread, and
//! the drain delivers strictly against the downstream demand ledger.
//!
//! Terminal discipline: the first error cuts ahead of buffered values;
//! completion is delivered only after the buffer has been emptied; the
//! terminal latch in [`Demand`] guarantees at most one terminal signal.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::signal::{ProtocolViolation, StreamError};
use crate::subscriber::Subscriber;
use crate::subscription::{Demand, Subscription, SubscriptionHandle};

type CancelFn = Box<dyn FnOnce() + Send>;

// ---------------------------------------------------------------------------
// DrainQueue
// ---------------------------------------------------------------------------

/// Multi-producer, demand-gated delivery queue in front of one subscriber.
///
/// The queue itself implements [`Subscription`]: hand
/// [`subscription_handle`](Self::subscription_handle) to the downstream in
/// `on_subscribe`, then feed signals in via [`push`](Self::push)/
/// [`complete`](Self::complete)/[`error`](Self::error).
pub(crate) struct DrainQueue<T> {
    inner: Arc<DrainInner<T>>,
}

impl<T> Clone for DrainQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct DrainInner<T> {
    downstream: Mutex<Box<dyn Subscriber<T>>>,
    queue: Mutex<VecDeque<T>>,
    demand: Demand,
    /// Drain election counter; non-zero means a thread is draining.
    wip: AtomicUsize,
    /// All producers finished; completion fires once the queue empties.
    done: AtomicBool,
    /// First error wins; later ones are dropped.
    error: Mutex<Option<StreamError>>,
    /// Upstream teardown invoked once on downstream cancel.
    on_cancel: Mutex<Option<CancelFn>>,
}

impl<T: Send + 'static> DrainQueue<T> {
    pub(crate) fn new(downstream: Box<dyn Subscriber<T>>) -> Self {
        Self {
            inner: Arc::new(DrainInner {
                downstream: Mutex::new(downstream),
                queue: Mutex::new(VecDeque::new()),
                demand: Demand::new(),
                wip: AtomicUsize::new(0),
                done: AtomicBool::new(false),
                error: Mutex::new(None),
                on_cancel: Mutex::new(None),
            }),
        }
    }

    /// Registers the teardown that cancels this stage's upstreams.
    pub(crate) fn set_on_cancel(&self, f: impl FnOnce() + Send + 'static) {
        *self.inner.on_cancel.lock() = Some(Box::new(f));
    }

    /// Delivers `on_subscribe` downstream with this queue as the
    /// subscription.
    pub(crate) fn deliver_on_subscribe(&self) {
        let handle = self.subscription_handle();
        self.inner.downstream.lock().on_subscribe(handle);
    }

    pub(crate) fn subscription_handle(&self) -> SubscriptionHandle {
        SubscriptionHandle::new(Arc::new(self.clone()))
    }

    /// Enqueues a value and drains. Values arriving after a terminal or a
    /// cancel are dropped.
    pub(crate) fn push(&self, value: T) {
        if self.inner.demand.is_terminated() || self.inner.demand.is_cancelled() {
            return;
        }
        self.inner.queue.lock().push_back(value);
        self.drain();
    }

    /// Marks all producers finished; completion fires after the buffer
    /// empties.
    pub(crate) fn complete(&self) {
        self.inner.done.store(true, Ordering::Release);
        self.drain();
    }

    /// Stores the first error and drains; the error cuts ahead of any
    /// still-buffered values.
    ///
    /// Returns `false` when the error lost the terminal race and was
    /// dropped. Outside a cancel race that is a producer offering a
    /// signal after the terminal, which is flagged through the default
    /// diagnostic log.
    pub(crate) fn error(&self, error: StreamError) -> bool {
        {
            let mut slot = self.inner.error.lock();
            if self.inner.demand.is_terminated() || slot.is_some() {
                drop(slot);
                if !self.inner.demand.is_cancelled() {
                    tracing::debug!(
                        violation = %ProtocolViolation::SignalAfterTerminal,
                        %error,
                        "late terminal dropped"
                    );
                }
                return false;
            }
            *slot = Some(error);
        }
        self.drain();
        true
    }

    /// Returns `true` once a terminal signal has been delivered.
    pub(crate) fn is_terminated(&self) -> bool {
        self.inner.demand.is_terminated()
    }

    fn drain(&self) {
        if self.inner.wip.fetch_add(1, Ordering::AcqRel) != 0 {
            // Another thread is draining; it will observe our work.
            return;
        }
        let mut missed = 1;
        loop {
            self.drain_pass();
            // Settle the passes that piled up while we were draining.
            let previous = self.inner.wip.fetch_sub(missed, Ordering::AcqRel);
            if previous == missed {
                return;
            }
            missed = previous - missed;
        }
    }

    fn drain_pass(&self) {
        loop {
            if self.inner.demand.is_cancelled() {
                self.inner.queue.lock().clear();
                return;
            }
            // Errors cut ahead of buffered values.
            let pending_error = self.inner.error.lock().take();
            if let Some(e) = pending_error {
                if self.inner.demand.terminate() {
                    self.inner.queue.lock().clear();
                    self.inner.downstream.lock().on_error(e);
                }
                return;
            }
            if self.inner.demand.is_terminated() {
                return;
            }

            let value = {
                let mut queue = self.inner.queue.lock();
                if queue.is_empty() {
                    None
                } else if self.inner.demand.try_claim() {
                    queue.pop_front()
                } else {
                    // Buffered value but no demand; wait for a request.
                    return;
                }
            };

            match value {
                Some(v) => {
                    self.inner.downstream.lock().on_next(v);
                }
                None => {
                    if self.inner.done.load(Ordering::Acquire) && self.inner.demand.terminate() {
                        self.inner.downstream.lock().on_complete();
                    }
                    return;
                }
            }
        }
    }

    fn run_cancel_hook(&self) {
        let hook = self.inner.on_cancel.lock().take();
        if let Some(hook) = hook {
            hook();
        }
    }
}

impl<T: Send + 'static> Subscription for DrainQueue<T> {
    fn request(&self, n: u64) {
        if n == 0 {
            // Routed through the drain: a reentrant call from inside
            // on_next defers instead of deadlocking on the downstream
            // lock.
            self.error(ProtocolViolation::NonPositiveRequest.into());
            self.run_cancel_hook();
            return;
        }
        self.inner.demand.add(n);
        self.drain();
    }

    fn cancel(&self) {
        if self.inner.demand.cancel() {
            self.run_cancel_hook();
            self.inner.queue.lock().clear();
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    struct Probe {
        values: Arc<Mutex<Vec<i32>>>,
        terminals: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Subscriber<i32> for Probe {
        fn on_subscribe(&mut self, _subscription: SubscriptionHandle) {}
        fn on_next(&mut self, value: i32) {
            self.values.lock().push(value);
        }
        fn on_error(&mut self, _error: StreamError) {
            self.terminals.lock().push("error");
        }
        fn on_complete(&mut self) {
            self.terminals.lock().push("complete");
        }
    }

    fn probe() -> (Box<Probe>, Arc<Mutex<Vec<i32>>>, Arc<Mutex<Vec<&'static str>>>) {
        let values = Arc::new(Mutex::new(Vec::new()));
        let terminals = Arc::new(Mutex::new(Vec::new()));
        (
            Box::new(Probe {
                values: Arc::clone(&values),
                terminals: Arc::clone(&terminals),
            }),
            values,
            terminals,
        )
    }

    #[test]
    fn test_delivery_gated_by_demand() {
        let (p, values, _) = probe();
        let q = DrainQueue::new(p as Box<dyn Subscriber<i32>>);

        q.push(1);
        q.push(2);
        q.push(3);
        assert!(values.lock().is_empty());

        q.request(2);
        assert_eq!(*values.lock(), vec![1, 2]);

        q.request(5);
        assert_eq!(*values.lock(), vec![1, 2, 3]);
    }

    #[test]
    fn test_completion_waits_for_buffer() {
        let (p, values, terminals) = probe();
        let q = DrainQueue::new(p as Box<dyn Subscriber<i32>>);

        q.push(1);
        q.complete();
        assert!(terminals.lock().is_empty());

        q.request(1);
        assert_eq!(*values.lock(), vec![1]);
        assert_eq!(*terminals.lock(), vec!["complete"]);
    }

    #[test]
    fn test_error_cuts_ahead_of_buffer() {
        let (p, values, terminals) = probe();
        let q = DrainQueue::new(p as Box<dyn Subscriber<i32>>);

        q.push(1);
        q.error(StreamError::source("boom"));
        q.request(10);

        assert!(values.lock().is_empty());
        assert_eq!(*terminals.lock(), vec!["error"]);
    }

    #[test]
    fn test_first_terminal_wins() {
        let (p, _, terminals) = probe();
        let q = DrainQueue::new(p as Box<dyn Subscriber<i32>>);

        q.request(10);
        q.complete();
        q.error(StreamError::source("late"));
        q.push(1);

        assert_eq!(*terminals.lock(), vec!["complete"]);
    }

    #[test]
    fn test_cancel_runs_hook_once_and_drops_values() {
        let (p, values, _) = probe();
        let q = DrainQueue::new(p as Box<dyn Subscriber<i32>>);
        let cancelled = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&cancelled);
        q.set_on_cancel(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });

        q.push(1);
        q.cancel();
        q.cancel();
        q.request(10);
        q.push(2);

        assert!(values.lock().is_empty());
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_zero_request_reports_protocol_violation() {
        let (p, _, terminals) = probe();
        let q = DrainQueue::new(p as Box<dyn Subscriber<i32>>);

        q.request(0);
        assert_eq!(*terminals.lock(), vec!["error"]);
    }

    #[test]
    fn test_zero_request_inside_on_next_reports_without_deadlock() {
        struct Misbehaving {
            handle: Arc<Mutex<Option<SubscriptionHandle>>>,
            values: Arc<Mutex<Vec<i32>>>,
            terminals: Arc<Mutex<Vec<&'static str>>>,
        }

        impl Subscriber<i32> for Misbehaving {
            fn on_subscribe(&mut self, subscription: SubscriptionHandle) {
                *self.handle.lock() = Some(subscription);
            }
            fn on_next(&mut self, value: i32) {
                self.values.lock().push(value);
                if let Some(handle) = self.handle.lock().clone() {
                    handle.request(0);
                }
            }
            fn on_error(&mut self, _error: StreamError) {
                self.terminals.lock().push("error");
            }
            fn on_complete(&mut self) {
                self.terminals.lock().push("complete");
            }
        }

        let handle = Arc::new(Mutex::new(None));
        let values = Arc::new(Mutex::new(Vec::new()));
        let terminals = Arc::new(Mutex::new(Vec::new()));
        let q = DrainQueue::new(Box::new(Misbehaving {
            handle: Arc::clone(&handle),
            values: Arc::clone(&values),
            terminals: Arc::clone(&terminals),
        }) as Box<dyn Subscriber<i32>>);
        q.deliver_on_subscribe();

        q.push(1);
        q.push(2);
        q.request(2);

        assert_eq!(*values.lock(), vec![1]);
        assert_eq!(*terminals.lock(), vec!["error"]);
    }

    #[test]
    fn test_late_terminal_is_dropped_and_flagged() {
        let (p, _, terminals) = probe();
        let q = DrainQueue::new(p as Box<dyn Subscriber<i32>>);

        q.request(10);
        q.complete();
        assert!(!q.error(StreamError::source("late")));
        assert_eq!(*terminals.lock(), vec!["complete"]);
    }

    #[test]
    fn test_concurrent_producers_never_exceed_demand() {
        let (p, values, _) = probe();
        let q = DrainQueue::new(p as Box<dyn Subscriber<i32>>);
        q.request(100);

        let mut producers = Vec::new();
        for t in 0..4 {
            let q = q.clone();
            producers.push(std::thread::spawn(move || {
                for i in 0..100 {
                    q.push(t * 100 + i);
                }
            }));
        }
        for t in producers {
            t.join().unwrap();
        }

        assert_eq!(values.lock().len(), 100);
    }
}
