//! Side-effecting observer stage: the `do_on_*` hooks and `log()`.
//!
//! The stage forwards every signal unchanged; hooks observe by reference.
//! `log()` is just a peek with tracing hooks, so tests can watch a whole
//! pipeline without a hidden console dependency. A panicking `on_next`
//! hook fails the stream like a transform error; panics in terminal hooks
//! are logged and swallowed because the terminal signal must still go out.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::operator::panic_message;
use crate::publisher::{Flux, RawPublisher};
use crate::signal::StreamError;
use crate::subscriber::Subscriber;
use crate::subscription::{Subscription, SubscriptionHandle};

type ValueHook<T> = Arc<dyn Fn(&T) + Send + Sync>;
type ErrorHook = Arc<dyn Fn(&StreamError) + Send + Sync>;
type UnitHook = Arc<dyn Fn() + Send + Sync>;
type SubscribeHook = Arc<dyn Fn(&SubscriptionHandle) + Send + Sync>;
type RequestHook = Arc<dyn Fn(u64) + Send + Sync>;

/// Hook set for one peek stage; unset hooks cost nothing.
pub(crate) struct PeekHooks<T> {
    pub(crate) on_subscribe: Option<SubscribeHook>,
    pub(crate) on_next: Option<ValueHook<T>>,
    pub(crate) on_error: Option<ErrorHook>,
    pub(crate) on_complete: Option<UnitHook>,
    pub(crate) on_request: Option<RequestHook>,
    pub(crate) on_cancel: Option<UnitHook>,
}

impl<T> Default for PeekHooks<T> {
    fn default() -> Self {
        Self {
            on_subscribe: None,
            on_next: None,
            on_error: None,
            on_complete: None,
            on_request: None,
            on_cancel: None,
        }
    }
}

/// Hooks that mirror every signal into `tracing` at debug level.
pub(crate) fn logging_hooks<T: std::fmt::Debug>() -> PeekHooks<T> {
    PeekHooks {
        on_subscribe: Some(Arc::new(|_| tracing::debug!("onSubscribe"))),
        on_next: Some(Arc::new(|v: &T| tracing::debug!("onNext({v:?})"))),
        on_error: Some(Arc::new(|e: &StreamError| tracing::debug!("onError({e})"))),
        on_complete: Some(Arc::new(|| tracing::debug!("onComplete"))),
        on_request: Some(Arc::new(|n: u64| tracing::debug!("request({n})"))),
        on_cancel: Some(Arc::new(|| tracing::debug!("cancel"))),
    }
}

pub(crate) struct PeekPublisher<T> {
    source: Flux<T>,
    hooks: Arc<PeekHooks<T>>,
}

impl<T> PeekPublisher<T> {
    pub(crate) fn new(source: Flux<T>, hooks: PeekHooks<T>) -> Self {
        Self {
            source,
            hooks: Arc::new(hooks),
        }
    }
}

impl<T: Send + 'static> RawPublisher<T> for PeekPublisher<T> {
    fn subscribe_raw(&self, subscriber: Box<dyn Subscriber<T>>) {
        self.source.subscribe_boxed(Box::new(PeekSubscriber {
            downstream: subscriber,
            hooks: Arc::clone(&self.hooks),
            upstream: None,
            done: false,
        }));
    }
}

struct PeekSubscriber<T> {
    downstream: Box<dyn Subscriber<T>>,
    hooks: Arc<PeekHooks<T>>,
    upstream: Option<SubscriptionHandle>,
    done: bool,
}

impl<T: Send + 'static> Subscriber<T> for PeekSubscriber<T> {
    fn on_subscribe(&mut self, subscription: SubscriptionHandle) {
        if let Some(hook) = &self.hooks.on_subscribe {
            hook(&subscription);
        }
        self.upstream = Some(subscription.clone());
        self.downstream
            .on_subscribe(SubscriptionHandle::new(Arc::new(PeekSubscription {
                upstream: subscription,
                hooks: Arc::clone(&self.hooks),
            })));
    }

    fn on_next(&mut self, value: T) {
        if self.done {
            return;
        }
        if let Some(hook) = &self.hooks.on_next {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| hook(&value))) {
                self.done = true;
                if let Some(upstream) = &self.upstream {
                    upstream.cancel();
                }
                self.downstream
                    .on_error(StreamError::transform(panic_message(payload.as_ref())));
                return;
            }
        }
        self.downstream.on_next(value);
    }

    fn on_error(&mut self, error: StreamError) {
        if self.done {
            return;
        }
        self.done = true;
        if let Some(hook) = &self.hooks.on_error {
            if catch_unwind(AssertUnwindSafe(|| hook(&error))).is_err() {
                tracing::warn!("do_on_error hook panicked; error still propagated");
            }
        }
        self.downstream.on_error(error);
    }

    fn on_complete(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        if let Some(hook) = &self.hooks.on_complete {
            if catch_unwind(AssertUnwindSafe(|| hook())).is_err() {
                tracing::warn!("do_on_complete hook panicked; completion still propagated");
            }
        }
        self.downstream.on_complete();
    }
}

struct PeekSubscription<T> {
    upstream: SubscriptionHandle,
    hooks: Arc<PeekHooks<T>>,
}

impl<T> Subscription for PeekSubscription<T> {
    fn request(&self, n: u64) {
        if let Some(hook) = &self.hooks.on_request {
            hook(n);
        }
        self.upstream.request(n);
    }

    fn cancel(&self) {
        if let Some(hook) = &self.hooks.on_cancel {
            hook();
        }
        self.upstream.cancel();
    }
}

// ---------------------------------------------------------------------------
// Mono success observer
// ---------------------------------------------------------------------------

/// `do_on_success`: observes a Mono's outcome — `Some(&value)` when it
/// emits, `None` when it completes empty.
pub(crate) struct SuccessPeekPublisher<T> {
    source: Flux<T>,
    hook: Arc<dyn Fn(Option<&T>) + Send + Sync>,
}

impl<T> SuccessPeekPublisher<T> {
    pub(crate) fn new(source: Flux<T>, hook: Arc<dyn Fn(Option<&T>) + Send + Sync>) -> Self {
        Self { source, hook }
    }
}

impl<T: Send + 'static> RawPublisher<T> for SuccessPeekPublisher<T> {
    fn subscribe_raw(&self, subscriber: Box<dyn Subscriber<T>>) {
        self.source.subscribe_boxed(Box::new(SuccessPeekSubscriber {
            downstream: subscriber,
            hook: Arc::clone(&self.hook),
            saw_value: false,
            done: false,
        }));
    }
}

struct SuccessPeekSubscriber<T> {
    downstream: Box<dyn Subscriber<T>>,
    hook: Arc<dyn Fn(Option<&T>) + Send + Sync>,
    saw_value: bool,
    done: bool,
}

impl<T: Send + 'static> Subscriber<T> for SuccessPeekSubscriber<T> {
    fn on_subscribe(&mut self, subscription: SubscriptionHandle) {
        self.downstream.on_subscribe(subscription);
    }

    fn on_next(&mut self, value: T) {
        if self.done {
            return;
        }
        self.saw_value = true;
        (self.hook)(Some(&value));
        self.downstream.on_next(value);
    }

    fn on_error(&mut self, error: StreamError) {
        if self.done {
            return;
        }
        self.done = true;
        self.downstream.on_error(error);
    }

    fn on_complete(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        if !self.saw_value {
            (self.hook)(None);
        }
        self.downstream.on_complete();
    }
}
