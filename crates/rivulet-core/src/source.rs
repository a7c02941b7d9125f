//! Leaf producers: demand-driven iterator sources, immediate terminals,
//! and the timer-driven `interval`.
//!
//! The iterator source is the workhorse behind `just`, `from_iterable`,
//! and `range`: each subscription gets a fresh iterator from a factory
//! closure (so publishers stay immutable and re-subscribable), values are
//! pulled lazily and only against claimed demand, and a one-slot prefetch
//! lets exhausted iterators complete promptly even with zero demand.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::publisher::RawPublisher;
use crate::scheduler::{Scheduler, TaskHandle};
use crate::signal::{ProtocolViolation, StreamError};
use crate::subscriber::{SerializedSubscriber, Subscriber};
use crate::subscription::{Demand, Subscription, SubscriptionHandle};

// ---------------------------------------------------------------------------
// IteratorSource
// ---------------------------------------------------------------------------

/// Publisher over a factory of iterators; one fresh iterator per
/// subscription.
pub(crate) struct IteratorSource<F> {
    make: F,
}

impl<F> IteratorSource<F> {
    pub(crate) fn new(make: F) -> Self {
        Self { make }
    }
}

impl<T, I, F> RawPublisher<T> for IteratorSource<F>
where
    T: Send + 'static,
    I: Iterator<Item = T> + Send + 'static,
    F: Fn() -> I + Send + Sync,
{
    fn subscribe_raw(&self, subscriber: Box<dyn Subscriber<T>>) {
        let inner = Arc::new(IterInner {
            state: Mutex::new(IterState {
                iter: Box::new((self.make)()),
                pending: None,
            }),
            demand: Demand::new(),
            wip: AtomicUsize::new(0),
            violation: Mutex::new(None),
            subscriber: Mutex::new(subscriber),
        });

        // Enter the drain before on_subscribe so a request made inside the
        // hook only accumulates demand instead of re-entering delivery.
        inner.wip.store(1, Ordering::Release);
        let handle = SubscriptionHandle::new(Arc::new(IterSubscription {
            inner: Arc::clone(&inner),
        }));
        inner.subscriber.lock().on_subscribe(handle);
        inner.drain_entered();
    }
}

struct IterInner<T> {
    state: Mutex<IterState<T>>,
    demand: Demand,
    wip: AtomicUsize,
    /// Pending protocol error; the drain delivers it ahead of values.
    violation: Mutex<Option<StreamError>>,
    subscriber: Mutex<Box<dyn Subscriber<T>>>,
}

struct IterState<T> {
    iter: Box<dyn Iterator<Item = T> + Send>,
    /// One-slot prefetch so exhaustion is visible without spending demand.
    pending: Option<T>,
}

impl<T: Send + 'static> IterInner<T> {
    fn drain(self: &Arc<Self>) {
        if self.wip.fetch_add(1, Ordering::AcqRel) != 0 {
            return;
        }
        self.drain_entered();
    }

    fn drain_entered(self: &Arc<Self>) {
        let mut missed = 1;
        loop {
            self.drain_pass();
            let previous = self.wip.fetch_sub(missed, Ordering::AcqRel);
            if previous == missed {
                return;
            }
            missed = previous - missed;
        }
    }

    /// Parks a protocol error for the drain to deliver.
    fn fail(self: &Arc<Self>, error: StreamError) {
        *self.violation.lock() = Some(error);
        self.drain();
    }

    fn drain_pass(self: &Arc<Self>) {
        loop {
            if self.demand.is_cancelled() || self.demand.is_terminated() {
                return;
            }
            let pending_error = self.violation.lock().take();
            if let Some(e) = pending_error {
                if self.demand.terminate() {
                    self.subscriber.lock().on_error(e);
                }
                self.demand.cancel();
                return;
            }
            let step = {
                let mut state = self.state.lock();
                if state.pending.is_none() {
                    state.pending = state.iter.next();
                }
                match state.pending {
                    None => DrainStep::Exhausted,
                    Some(_) => {
                        if self.demand.try_claim() {
                            DrainStep::Emit(state.pending.take().expect("prefetched value"))
                        } else {
                            DrainStep::AwaitDemand
                        }
                    }
                }
            };
            match step {
                DrainStep::Emit(v) => self.subscriber.lock().on_next(v),
                DrainStep::Exhausted => {
                    if self.demand.terminate() {
                        self.subscriber.lock().on_complete();
                    }
                    return;
                }
                DrainStep::AwaitDemand => return,
            }
        }
    }
}

enum DrainStep<T> {
    Emit(T),
    Exhausted,
    AwaitDemand,
}

struct IterSubscription<T> {
    inner: Arc<IterInner<T>>,
}

impl<T: Send + 'static> Subscription for IterSubscription<T> {
    fn request(&self, n: u64) {
        if n == 0 {
            // Routed through the drain: a reentrant call from inside
            // on_next defers instead of deadlocking on the subscriber
            // lock.
            self.inner
                .fail(ProtocolViolation::NonPositiveRequest.into());
            return;
        }
        self.inner.demand.add(n);
        self.inner.drain();
    }

    fn cancel(&self) {
        if self.inner.demand.cancel() {
            // Free the iterator (and whatever it borrows) eagerly.
            let mut state = self.inner.state.lock();
            state.pending = None;
            state.iter = Box::new(std::iter::empty());
        }
    }
}

// ---------------------------------------------------------------------------
// EmptySource / ErrorSource
// ---------------------------------------------------------------------------

/// Completes at subscribe time without emitting.
pub(crate) struct EmptySource;

impl<T: Send + 'static> RawPublisher<T> for EmptySource {
    fn subscribe_raw(&self, mut subscriber: Box<dyn Subscriber<T>>) {
        subscriber.on_subscribe(SubscriptionHandle::inert());
        subscriber.on_complete();
    }
}

/// Fails at subscribe time without emitting.
pub(crate) struct ErrorSource {
    error: StreamError,
}

impl ErrorSource {
    pub(crate) fn new(error: StreamError) -> Self {
        Self { error }
    }
}

impl<T: Send + 'static> RawPublisher<T> for ErrorSource {
    fn subscribe_raw(&self, mut subscriber: Box<dyn Subscriber<T>>) {
        subscriber.on_subscribe(SubscriptionHandle::inert());
        subscriber.on_error(self.error.clone());
    }
}

// ---------------------------------------------------------------------------
// IntervalSource
// ---------------------------------------------------------------------------

/// Emits 0, 1, 2, … on a timer; conceptually infinite.
///
/// Runs entirely on the scheduler's context. A tick that finds no
/// outstanding demand terminates the subscription with
/// [`StreamError::Overflow`]; completion only ever happens through
/// cancellation (typically an enclosing `take`).
pub(crate) struct IntervalSource {
    period: Duration,
    scheduler: Arc<dyn Scheduler>,
}

impl IntervalSource {
    pub(crate) fn new(period: Duration, scheduler: Arc<dyn Scheduler>) -> Self {
        Self { period, scheduler }
    }
}

struct IntervalState {
    demand: Demand,
    counter: AtomicU64,
    task: Mutex<Option<TaskHandle>>,
    /// Keeps the timer worker alive for as long as the subscription is
    /// live, independent of the publisher value's lifetime.
    scheduler: Mutex<Option<Arc<dyn Scheduler>>>,
}

impl IntervalState {
    fn stop(&self) {
        self.demand.cancel();
        if let Some(task) = self.task.lock().as_ref() {
            task.cancel();
        }
        self.scheduler.lock().take();
    }
}

impl RawPublisher<u64> for IntervalSource {
    fn subscribe_raw(&self, subscriber: Box<dyn Subscriber<u64>>) {
        let serialized = SerializedSubscriber::new(subscriber);
        let state = Arc::new(IntervalState {
            demand: Demand::new(),
            counter: AtomicU64::new(0),
            task: Mutex::new(None),
            scheduler: Mutex::new(Some(Arc::clone(&self.scheduler))),
        });

        serialized.subscribe(SubscriptionHandle::new(Arc::new(IntervalSubscription {
            state: Arc::clone(&state),
            downstream: serialized.clone(),
        })));

        let tick_state = Arc::clone(&state);
        let downstream = serialized.clone();
        let task = self.scheduler.schedule_periodic(
            self.period,
            Box::new(move || {
                if tick_state.demand.is_cancelled() {
                    return;
                }
                if tick_state.demand.try_claim() {
                    let n = tick_state.counter.fetch_add(1, Ordering::AcqRel);
                    downstream.next(n);
                } else {
                    let tick = tick_state.counter.load(Ordering::Acquire);
                    downstream.error(StreamError::Overflow(tick));
                    tick_state.stop();
                }
            }),
        );

        // The subscriber may have cancelled during on_subscribe, before
        // the task handle existed; close that window now.
        let cancelled = state.demand.is_cancelled();
        *state.task.lock() = Some(task);
        if cancelled {
            state.stop();
        }
    }
}

struct IntervalSubscription {
    state: Arc<IntervalState>,
    downstream: SerializedSubscriber<u64>,
}

impl Subscription for IntervalSubscription {
    fn request(&self, n: u64) {
        if n == 0 {
            self.downstream
                .error(ProtocolViolation::NonPositiveRequest.into());
            self.state.stop();
            return;
        }
        self.state.demand.add(n);
    }

    fn cancel(&self) {
        self.state.stop();
        self.downstream.cancel();
    }
}

// ===========================================================================
// Tests
// ===========================================================================
