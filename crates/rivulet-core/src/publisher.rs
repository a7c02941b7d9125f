//! The user-facing publisher types: [`Flux`] (0..n values) and [`Mono`]
//! (0..1 values).
//!
//! Both are thin cloneable handles over an [`Arc`]ed [`RawPublisher`];
//! assembly is cheap and subscription-free, and every subscription is
//! independent — subscribing twice replays the pipeline from the sources.
//! Operator methods take `&self` and return a new publisher wrapping the
//! old one, so pipelines read top-down the way they execute.

use std::sync::Arc;
use std::time::Duration;

use crate::operator::concat::ConcatPublisher;
use crate::operator::delay::DelayPublisher;
use crate::operator::flat_map::FlatMapPublisher;
use crate::operator::limit_rate::LimitRatePublisher;
use crate::operator::map::MapPublisher;
use crate::operator::merge::MergePublisher;
use crate::operator::peek::{logging_hooks, PeekHooks, PeekPublisher, SuccessPeekPublisher};
use crate::operator::recover::ResumePublisher;
use crate::operator::subscribe_on::SubscribeOnPublisher;
use crate::operator::take::TakePublisher;
use crate::operator::timeout::TimeoutPublisher;
use crate::operator::zip::{ZipAllPublisher, ZipPublisher};
use crate::scheduler::Scheduler;
use crate::signal::StreamError;
use crate::source::{EmptySource, ErrorSource, IntervalSource, IteratorSource};
use crate::subscriber::{CallbackSubscriber, Subscriber};
use crate::subscription::SubscriptionHandle;

// ---------------------------------------------------------------------------
// RawPublisher
// ---------------------------------------------------------------------------

/// Object-safe producer seam every source and operator stage implements.
///
/// `subscribe_raw` must deliver `on_subscribe` exactly once before any
/// other signal, honor requested demand, and deliver at most one terminal
/// signal.
pub trait RawPublisher<T>: Send + Sync {
    /// Attaches `subscriber` and starts a fresh subscription.
    fn subscribe_raw(&self, subscriber: Box<dyn Subscriber<T>>);
}

// ---------------------------------------------------------------------------
// Flux
// ---------------------------------------------------------------------------

/// An asynchronous sequence of zero or more values.
pub struct Flux<T> {
    inner: Arc<dyn RawPublisher<T>>,
}

impl<T> Clone for Flux<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> Flux<T> {
    pub(crate) fn from_raw(publisher: impl RawPublisher<T> + 'static) -> Self {
        Self {
            inner: Arc::new(publisher),
        }
    }

    // -- factories ----------------------------------------------------------

    /// Emits the given values in order, then completes.
    pub fn just<C>(values: C) -> Self
    where
        C: IntoIterator<Item = T> + Clone + Send + Sync + 'static,
        C::IntoIter: Send,
    {
        Self::from_iterable(move || values.clone())
    }

    /// Completes immediately without emitting.
    #[must_use]
    pub fn empty() -> Self {
        Self::from_raw(EmptySource)
    }

    /// Fails immediately with `error`.
    #[must_use]
    pub fn error(error: StreamError) -> Self {
        Self::from_raw(ErrorSource::new(error))
    }

    /// Lazily pulls values from a fresh iterator per subscription.
    ///
    /// The factory runs at subscribe time, so side effects inside it are
    /// deferred until someone actually subscribes.
    pub fn from_iterable<C, F>(factory: F) -> Self
    where
        C: IntoIterator<Item = T>,
        C::IntoIter: Send + 'static,
        F: Fn() -> C + Send + Sync + 'static,
    {
        Self::from_raw(IteratorSource::new(move || factory().into_iter()))
    }

    // -- transforms ---------------------------------------------------------

    /// Applies a synchronous transform to each value.
    pub fn map<U: Send + 'static>(
        &self,
        transform: impl Fn(T) -> U + Send + Sync + 'static,
    ) -> Flux<U> {
        Flux::from_raw(MapPublisher::new(self.clone(), Arc::new(transform)))
    }

    /// Maps each value to a publisher and merges the inner emissions.
    pub fn flat_map<U: Send + 'static>(
        &self,
        transform: impl Fn(T) -> Flux<U> + Send + Sync + 'static,
    ) -> Flux<U> {
        Flux::from_raw(FlatMapPublisher::new(self.clone(), Arc::new(transform)))
    }

    /// Passes through at most `n` values, then completes and cancels
    /// upstream. `take(0)` completes without subscribing upstream.
    #[must_use]
    pub fn take(&self, n: u64) -> Self {
        Self::from_raw(TakePublisher::new(self.clone(), n))
    }

    /// Caps upstream demand to fixed batches of `prefetch`.
    #[must_use]
    pub fn limit_rate(&self, prefetch: u64) -> Self {
        Self::from_raw(LimitRatePublisher::new(self.clone(), prefetch))
    }

    /// Delivers each value `delay` after it arrived, on the scheduler.
    #[must_use]
    pub fn delay_elements(&self, delay: Duration, scheduler: Arc<dyn Scheduler>) -> Self {
        Self::from_raw(DelayPublisher::new(self.clone(), delay, scheduler))
    }

    /// Errors with [`StreamError::Timeout`] when the gap between signals
    /// exceeds `deadline`.
    #[must_use]
    pub fn timeout(&self, deadline: Duration, scheduler: Arc<dyn Scheduler>) -> Self {
        Self::from_raw(TimeoutPublisher::new(self.clone(), deadline, scheduler))
    }

    /// Runs the subscription (and a synchronous source's emissions) on the
    /// scheduler instead of the caller's thread.
    #[must_use]
    pub fn subscribe_on(&self, scheduler: Arc<dyn Scheduler>) -> Self {
        Self::from_raw(SubscribeOnPublisher::new(self.clone(), scheduler))
    }

    // -- error recovery -----------------------------------------------------

    /// Switches to the publisher produced by `fallback` if this one fails.
    pub fn on_error_resume(
        &self,
        fallback: impl Fn(&StreamError) -> Flux<T> + Send + Sync + 'static,
    ) -> Self {
        Self::from_raw(ResumePublisher::new(self.clone(), Arc::new(fallback)))
    }

    /// Replaces a failure with a single fallback value, then completes.
    #[must_use]
    pub fn on_error_return(&self, value: T) -> Self
    where
        T: Clone + Sync,
    {
        self.on_error_resume(move |_| Flux::just([value.clone()]))
    }

    // -- observation --------------------------------------------------------

    /// Observes each value without altering the stream.
    pub fn do_on_next(&self, hook: impl Fn(&T) + Send + Sync + 'static) -> Self {
        self.peek(PeekHooks {
            on_next: Some(Arc::new(hook)),
            ..PeekHooks::default()
        })
    }

    /// Observes a terminal error before it reaches the downstream.
    pub fn do_on_error(&self, hook: impl Fn(&StreamError) + Send + Sync + 'static) -> Self {
        self.peek(PeekHooks {
            on_error: Some(Arc::new(hook)),
            ..PeekHooks::default()
        })
    }

    /// Observes successful completion.
    pub fn do_on_complete(&self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.peek(PeekHooks {
            on_complete: Some(Arc::new(hook)),
            ..PeekHooks::default()
        })
    }

    /// Observes the subscription before the downstream sees it.
    pub fn do_on_subscribe(
        &self,
        hook: impl Fn(&SubscriptionHandle) + Send + Sync + 'static,
    ) -> Self {
        self.peek(PeekHooks {
            on_subscribe: Some(Arc::new(hook)),
            ..PeekHooks::default()
        })
    }

    /// Observes downstream demand as it flows upstream.
    pub fn do_on_request(&self, hook: impl Fn(u64) + Send + Sync + 'static) -> Self {
        self.peek(PeekHooks {
            on_request: Some(Arc::new(hook)),
            ..PeekHooks::default()
        })
    }

    /// Observes cancellation.
    pub fn do_on_cancel(&self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.peek(PeekHooks {
            on_cancel: Some(Arc::new(hook)),
            ..PeekHooks::default()
        })
    }

    /// Mirrors every signal into `tracing` at debug level.
    #[must_use]
    pub fn log(&self) -> Self
    where
        T: std::fmt::Debug,
    {
        self.peek(logging_hooks())
    }

    fn peek(&self, hooks: PeekHooks<T>) -> Self {
        Self::from_raw(PeekPublisher::new(self.clone(), hooks))
    }

    // -- combinators --------------------------------------------------------

    /// Subscribes the sources one after another, preserving order.
    #[must_use]
    pub fn concat(sources: Vec<Flux<T>>) -> Self {
        Self::from_raw(ConcatPublisher::new(sources))
    }

    /// Subscribes all sources eagerly, interleaving by emission timing.
    #[must_use]
    pub fn merge(sources: Vec<Flux<T>>) -> Self {
        Self::from_raw(MergePublisher::new(sources))
    }

    /// Combines one value from each side per emission, in lock step.
    pub fn zip<B, O>(
        left: Flux<T>,
        right: Flux<B>,
        combiner: impl Fn(T, B) -> O + Send + Sync + 'static,
    ) -> Flux<O>
    where
        B: Send + 'static,
        O: Send + 'static,
    {
        Flux::from_raw(ZipPublisher::new(left, right, Arc::new(combiner)))
    }

    /// N-ary homogeneous zip: one value from every source per emission.
    pub fn zip_all<O: Send + 'static>(
        sources: Vec<Flux<T>>,
        combiner: impl Fn(Vec<T>) -> O + Send + Sync + 'static,
    ) -> Flux<O> {
        Flux::from_raw(ZipAllPublisher::new(sources, Arc::new(combiner)))
    }

    /// This sequence, then `other`.
    #[must_use]
    pub fn concat_with(&self, other: Flux<T>) -> Self {
        Self::concat(vec![self.clone(), other])
    }

    /// This sequence interleaved with `other`.
    #[must_use]
    pub fn merge_with(&self, other: Flux<T>) -> Self {
        Self::merge(vec![self.clone(), other])
    }

    /// This sequence zipped against `other`.
    pub fn zip_with<B, O>(
        &self,
        other: Flux<B>,
        combiner: impl Fn(T, B) -> O + Send + Sync + 'static,
    ) -> Flux<O>
    where
        B: Send + 'static,
        O: Send + 'static,
    {
        Self::zip(self.clone(), other, combiner)
    }

    // -- subscription entry points ------------------------------------------

    /// Subscribes with a value callback and unbounded demand.
    ///
    /// Returns the subscription handle so the caller can cancel. For a
    /// publisher that defers subscription (`subscribe_on`), the handle may
    /// still be inert when this returns.
    pub fn subscribe(&self, on_next: impl FnMut(T) + Send + 'static) -> SubscriptionHandle {
        self.subscribe_callback(CallbackSubscriber::new(on_next))
    }

    /// Subscribes with value, error, and completion callbacks.
    pub fn subscribe_full(
        &self,
        on_next: impl FnMut(T) + Send + 'static,
        on_error: impl FnMut(StreamError) + Send + 'static,
        on_complete: impl FnMut() + Send + 'static,
    ) -> SubscriptionHandle {
        self.subscribe_callback(
            CallbackSubscriber::new(on_next)
                .with_on_error(on_error)
                .with_on_complete(on_complete),
        )
    }

    /// Subscribes a fully custom [`Subscriber`]; the subscriber drives its
    /// own demand from `on_subscribe`.
    pub fn subscribe_with(&self, subscriber: impl Subscriber<T> + 'static) {
        self.subscribe_boxed(Box::new(subscriber));
    }

    /// Subscribes an assembled [`CallbackSubscriber`], returning the handle
    /// it was given.
    pub fn subscribe_callback(&self, subscriber: CallbackSubscriber<T>) -> SubscriptionHandle {
        let slot = subscriber.handle_slot();
        self.subscribe_boxed(Box::new(subscriber));
        let handle = slot.lock().clone();
        handle.unwrap_or_else(SubscriptionHandle::inert)
    }

    pub(crate) fn subscribe_boxed(&self, subscriber: Box<dyn Subscriber<T>>) {
        self.inner.subscribe_raw(subscriber);
    }
}

impl Flux<i64> {
    /// Emits `count` consecutive integers starting at `start`.
    #[must_use]
    pub fn range(start: i64, count: u32) -> Self {
        Self::from_iterable(move || start..start + i64::from(count))
    }
}

impl Flux<u64> {
    /// Emits 0, 1, 2, … every `period` on the scheduler's context.
    ///
    /// Never completes on its own; a tick that finds zero outstanding
    /// demand fails the stream with [`StreamError::Overflow`].
    #[must_use]
    pub fn interval(period: Duration, scheduler: Arc<dyn Scheduler>) -> Self {
        Self::from_raw(IntervalSource::new(period, scheduler))
    }
}

// ---------------------------------------------------------------------------
// Mono
// ---------------------------------------------------------------------------

/// An asynchronous result: zero or one value, then a terminal signal.
///
/// Internally a [`Flux`] whose stages emit at most once; the type exists
/// to make the cardinality part of an API's signature.
pub struct Mono<T> {
    inner: Flux<T>,
}

impl<T> Clone for Mono<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> Mono<T> {
    fn wrap(inner: Flux<T>) -> Self {
        Self { inner }
    }

    // -- factories ----------------------------------------------------------

    /// Emits `value`, then completes.
    pub fn just(value: T) -> Self
    where
        T: Clone + Sync,
    {
        Self::wrap(Flux::just([value]))
    }

    /// Completes immediately without a value.
    #[must_use]
    pub fn empty() -> Self {
        Self::wrap(Flux::empty())
    }

    /// Fails immediately with `error`.
    #[must_use]
    pub fn error(error: StreamError) -> Self {
        Self::wrap(Flux::error(error))
    }

    /// Produces the value by calling `f` at subscribe time.
    pub fn from_fn(f: impl Fn() -> T + Send + Sync + 'static) -> Self {
        Self::wrap(Flux::from_iterable(move || std::iter::once(f())))
    }

    // -- transforms ---------------------------------------------------------

    /// Applies a synchronous transform to the value, if one arrives.
    pub fn map<U: Send + 'static>(
        &self,
        transform: impl Fn(T) -> U + Send + Sync + 'static,
    ) -> Mono<U> {
        Mono::wrap(self.inner.map(transform))
    }

    /// Maps the value to another `Mono` and flattens it.
    pub fn flat_map<U: Send + 'static>(
        &self,
        transform: impl Fn(T) -> Mono<U> + Send + Sync + 'static,
    ) -> Mono<U> {
        Mono::wrap(self.inner.flat_map(move |v| transform(v).inner))
    }

    /// Maps the value to a `Flux` and flattens it into a full sequence.
    pub fn flat_map_many<U: Send + 'static>(
        &self,
        transform: impl Fn(T) -> Flux<U> + Send + Sync + 'static,
    ) -> Flux<U> {
        self.inner.flat_map(transform)
    }

    /// Switches to the `Mono` produced by `fallback` if this one fails.
    pub fn on_error_resume(
        &self,
        fallback: impl Fn(&StreamError) -> Mono<T> + Send + Sync + 'static,
    ) -> Self {
        Self::wrap(self.inner.on_error_resume(move |e| fallback(e).inner))
    }

    /// Replaces a failure with a fallback value.
    #[must_use]
    pub fn on_error_return(&self, value: T) -> Self
    where
        T: Clone + Sync,
    {
        Self::wrap(self.inner.on_error_return(value))
    }

    // -- observation --------------------------------------------------------

    /// Observes the outcome: `Some(&value)` when a value is emitted,
    /// `None` when the `Mono` completes empty. Errors skip the hook.
    pub fn do_on_success(&self, hook: impl Fn(Option<&T>) + Send + Sync + 'static) -> Self {
        Self::wrap(Flux::from_raw(SuccessPeekPublisher::new(
            self.inner.clone(),
            Arc::new(hook),
        )))
    }

    /// Observes a terminal error before it reaches the downstream.
    pub fn do_on_error(&self, hook: impl Fn(&StreamError) + Send + Sync + 'static) -> Self {
        Self::wrap(self.inner.do_on_error(hook))
    }

    /// Mirrors every signal into `tracing` at debug level.
    #[must_use]
    pub fn log(&self) -> Self
    where
        T: std::fmt::Debug,
    {
        Self::wrap(self.inner.log())
    }

    // -- conversions and subscription ---------------------------------------

    /// Widens to a [`Flux`] that emits at most one value.
    #[must_use]
    pub fn as_flux(&self) -> Flux<T> {
        self.inner.clone()
    }

    /// Subscribes with a value callback and unbounded demand.
    pub fn subscribe(&self, on_next: impl FnMut(T) + Send + 'static) -> SubscriptionHandle {
        self.inner.subscribe(on_next)
    }

    /// Subscribes with value, error, and completion callbacks.
    pub fn subscribe_full(
        &self,
        on_next: impl FnMut(T) + Send + 'static,
        on_error: impl FnMut(StreamError) + Send + 'static,
        on_complete: impl FnMut() + Send + 'static,
    ) -> SubscriptionHandle {
        self.inner.subscribe_full(on_next, on_error, on_complete)
    }

    /// Subscribes a fully custom [`Subscriber`].
    pub fn subscribe_with(&self, subscriber: impl Subscriber<T> + 'static) {
        self.inner.subscribe_with(subscriber);
    }
}

impl Mono<u64> {
    /// Emits `0` after `delay`, then completes.
    #[must_use]
    pub fn delay(delay: Duration, scheduler: Arc<dyn Scheduler>) -> Self {
        Self::wrap(Flux::interval(delay, scheduler).take(1))
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::TestSubscriber;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_just_emits_in_order_and_completes() {
        let ts = TestSubscriber::unbounded();
        Flux::just([3, 1, 2]).subscribe_with(ts.probe());
        assert_eq!(ts.values(), vec![3, 1, 2]);
        assert!(ts.is_completed());
    }

    #[test]
    fn test_pipelines_replay_per_subscription() {
        let pulls = Arc::new(AtomicUsize::new(0));
        let p = Arc::clone(&pulls);
        let flux = Flux::from_iterable(move || {
            p.fetch_add(1, Ordering::SeqCst);
            1..=3
        })
        .map(|v| v * 10);

        for _ in 0..2 {
            let ts = TestSubscriber::unbounded();
            flux.subscribe_with(ts.probe());
            assert_eq!(ts.values(), vec![10, 20, 30]);
            assert!(ts.is_completed());
        }
        assert_eq!(pulls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_assembly_is_lazy() {
        let pulls = Arc::new(AtomicUsize::new(0));
        let p = Arc::clone(&pulls);
        let _flux = Flux::from_iterable(move || {
            p.fetch_add(1, Ordering::SeqCst);
            0..5
        })
        .map(|v| v + 1)
        .take(2);
        assert_eq!(pulls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_subscribe_returns_usable_handle() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        let handle = Flux::range(1, 100)
            .subscribe_callback(
                CallbackSubscriber::new(move |v: i64| s.lock().push(v)).with_initial_request(2),
            );
        assert_eq!(*seen.lock(), vec![1, 2]);
        handle.request(1);
        assert_eq!(*seen.lock(), vec![1, 2, 3]);
        handle.cancel();
        handle.request(10);
        assert_eq!(*seen.lock(), vec![1, 2, 3]);
    }

    #[test]
    fn test_subscribe_full_routes_terminals() {
        let completes = Arc::new(AtomicUsize::new(0));
        let errors = Arc::new(Mutex::new(Vec::new()));

        let c = Arc::clone(&completes);
        Flux::range(1, 2).subscribe_full(
            |_| {},
            |_| {},
            move || {
                c.fetch_add(1, Ordering::SeqCst);
            },
        );
        assert_eq!(completes.load(Ordering::SeqCst), 1);

        let e = Arc::clone(&errors);
        Flux::<i64>::error(StreamError::source("boom")).subscribe_full(
            |_| {},
            move |err| e.lock().push(err),
            || {},
        );
        assert_eq!(*errors.lock(), vec![StreamError::source("boom")]);
    }

    #[test]
    fn test_range_bounds() {
        let ts = TestSubscriber::unbounded();
        Flux::range(-2, 5).subscribe_with(ts.probe());
        assert_eq!(ts.values(), vec![-2, -1, 0, 1, 2]);
    }

    #[test]
    fn test_mono_just_and_map() {
        let ts = TestSubscriber::unbounded();
        Mono::just(21).map(|v| v * 2).subscribe_with(ts.probe());
        assert_eq!(ts.values(), vec![42]);
        assert!(ts.is_completed());
    }

    #[test]
    fn test_mono_from_fn_defers_to_subscribe() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        let mono = Mono::from_fn(move || c.fetch_add(1, Ordering::SeqCst) + 1);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        let ts = TestSubscriber::unbounded();
        mono.subscribe_with(ts.probe());
        assert_eq!(ts.values(), vec![1]);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_mono_flat_map_chains_results() {
        let ts = TestSubscriber::unbounded();
        Mono::just(4)
            .flat_map(|v| Mono::just(v + 10))
            .subscribe_with(ts.probe());
        assert_eq!(ts.values(), vec![14]);
        assert!(ts.is_completed());
    }

    #[test]
    fn test_mono_error_recovery() {
        let ts = TestSubscriber::unbounded();
        Mono::<i64>::error(StreamError::source("down"))
            .on_error_return(7)
            .subscribe_with(ts.probe());
        assert_eq!(ts.values(), vec![7]);
        assert!(ts.is_completed());
    }

    #[test]
    fn test_mono_as_flux_preserves_signals() {
        let ts = TestSubscriber::unbounded();
        Mono::just(9).as_flux().subscribe_with(ts.probe());
        assert_eq!(ts.values(), vec![9]);
        assert!(ts.is_completed());
    }
}
