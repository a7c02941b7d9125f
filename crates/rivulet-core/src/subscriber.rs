//! Subscriber capability set and the serialized fan-in wrapper.
//!
//! [`Subscriber`] is a capability set, not an inheritance root: every
//! signal hook has a default implementation so callers override only what
//! they need. The default `on_subscribe` requests unbounded demand; the
//! default `on_error` logs through `tracing` so an unhandled terminal
//! error is never silently dropped.
//!
//! [`SerializedSubscriber`] is the serialization point required by
//! multi-producer stages (`merge`, `flat_map`, timer-driven delivery): it
//! funnels concurrent signal calls through one mutex and a terminal latch,
//! so a shared downstream subscriber sees a legal, serialized stream.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::signal::{ProtocolViolation, StreamError};
use crate::subscription::{Demand, SubscriptionHandle, UNBOUNDED};

// ---------------------------------------------------------------------------
// Subscriber
// ---------------------------------------------------------------------------

/// The sink side of a subscription.
///
/// Implementations are driven by exactly one subscription at a time; the
/// engine serializes signal delivery, so `&mut self` access is safe even
/// when upstream work happens on scheduler threads.
pub trait Subscriber<T>: Send {
    /// First signal of every subscription. Default requests unbounded
    /// demand, which is what plain value consumers want.
    fn on_subscribe(&mut self, subscription: SubscriptionHandle) {
        subscription.request(UNBOUNDED);
    }

    /// A value, delivered only against previously requested demand.
    fn on_next(&mut self, value: T);

    /// Terminal failure. Default logs the error so it stays observable
    /// even when the consumer registered no error callback.
    fn on_error(&mut self, error: StreamError) {
        tracing::error!(%error, "unhandled stream error reached terminal subscriber");
    }

    /// Terminal success. Default is a no-op.
    fn on_complete(&mut self) {}
}

// ---------------------------------------------------------------------------
// CallbackSubscriber
// ---------------------------------------------------------------------------

type NextFn<T> = Box<dyn FnMut(T) + Send>;
type ErrorFn = Box<dyn FnMut(StreamError) + Send>;
type CompleteFn = Box<dyn FnMut() + Send>;
type SubscribeFn = Box<dyn FnMut(&SubscriptionHandle) + Send>;

/// Subscriber assembled from individual closures.
///
/// Backs the `subscribe`/`subscribe_full` entry points on `Flux`/`Mono`.
/// Missing callbacks fall back to the trait defaults (log on error, no-op
/// on complete).
pub struct CallbackSubscriber<T> {
    on_next: NextFn<T>,
    on_error: Option<ErrorFn>,
    on_complete: Option<CompleteFn>,
    on_subscribe: Option<SubscribeFn>,
    /// Demand issued at subscribe time; [`UNBOUNDED`] by default.
    initial_request: u64,
    /// Slot the owning `subscribe` call reads the handle back from.
    handle_slot: Arc<Mutex<Option<SubscriptionHandle>>>,
}

impl<T> CallbackSubscriber<T> {
    /// Creates a subscriber that only consumes values.
    pub fn new(on_next: impl FnMut(T) + Send + 'static) -> Self {
        Self {
            on_next: Box::new(on_next),
            on_error: None,
            on_complete: None,
            on_subscribe: None,
            initial_request: UNBOUNDED,
            handle_slot: Arc::new(Mutex::new(None)),
        }
    }

    /// Registers an error callback.
    #[must_use]
    pub fn with_on_error(mut self, f: impl FnMut(StreamError) + Send + 'static) -> Self {
        self.on_error = Some(Box::new(f));
        self
    }

    /// Registers a completion callback.
    #[must_use]
    pub fn with_on_complete(mut self, f: impl FnMut() + Send + 'static) -> Self {
        self.on_complete = Some(Box::new(f));
        self
    }

    /// Registers a subscription hook, invoked before the initial request.
    #[must_use]
    pub fn with_on_subscribe(mut self, f: impl FnMut(&SubscriptionHandle) + Send + 'static) -> Self {
        self.on_subscribe = Some(Box::new(f));
        self
    }

    /// Overrides the demand issued at subscribe time. Zero means the
    /// caller drives demand manually through the returned handle.
    #[must_use]
    pub fn with_initial_request(mut self, n: u64) -> Self {
        self.initial_request = n;
        self
    }

    /// Shared slot the subscription handle is published into.
    pub(crate) fn handle_slot(&self) -> Arc<Mutex<Option<SubscriptionHandle>>> {
        Arc::clone(&self.handle_slot)
    }
}

impl<T> Subscriber<T> for CallbackSubscriber<T> {
    fn on_subscribe(&mut self, subscription: SubscriptionHandle) {
        *self.handle_slot.lock() = Some(subscription.clone());
        if let Some(hook) = &mut self.on_subscribe {
            hook(&subscription);
        }
        if self.initial_request > 0 {
            subscription.request(self.initial_request);
        }
    }

    fn on_next(&mut self, value: T) {
        (self.on_next)(value);
    }

    fn on_error(&mut self, error: StreamError) {
        match &mut self.on_error {
            Some(hook) => hook(error),
            None => {
                tracing::error!(%error, "unhandled stream error reached terminal subscriber");
            }
        }
    }

    fn on_complete(&mut self) {
        if let Some(hook) = &mut self.on_complete {
            hook();
        }
    }
}

// ---------------------------------------------------------------------------
// SerializedSubscriber
// ---------------------------------------------------------------------------

/// Mutex-guarded fan-in wrapper around a downstream subscriber.
///
/// Multiple producer contexts may call [`next`](Self::next)/
/// [`error`](Self::error)/[`complete`](Self::complete) concurrently; at
/// most one thread is inside the downstream at a time, and the terminal
/// latch guarantees nothing follows the first terminal signal. Signals
/// arriving after the latch has fired are swallowed, which is exactly how
/// a cancel racing an in-flight emission must resolve.
pub struct SerializedSubscriber<T> {
    inner: Arc<SerializedInner<T>>,
}

struct SerializedInner<T> {
    downstream: Mutex<Box<dyn Subscriber<T>>>,
    /// Shared terminal/cancel state; `terminate` gates every terminal.
    state: Demand,
}

impl<T> Clone for SerializedSubscriber<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> SerializedSubscriber<T> {
    /// Wraps a downstream subscriber.
    pub fn new(downstream: Box<dyn Subscriber<T>>) -> Self {
        Self {
            inner: Arc::new(SerializedInner {
                downstream: Mutex::new(downstream),
                state: Demand::new(),
            }),
        }
    }

    /// Delivers `on_subscribe` to the downstream.
    pub fn subscribe(&self, handle: SubscriptionHandle) {
        self.inner.downstream.lock().on_subscribe(handle);
    }

    /// Delivers a value unless a terminal signal has already fired.
    ///
    /// The latch is checked under the downstream lock: a producer that
    /// loses the lock to a racing terminal observes the latch once it
    /// gets in, instead of delivering a value after the terminal.
    pub fn next(&self, value: T) {
        let mut downstream = self.inner.downstream.lock();
        if self.inner.state.is_terminated() || self.inner.state.is_cancelled() {
            return;
        }
        downstream.on_next(value);
    }

    /// Delivers the error if it wins the terminal race.
    pub fn error(&self, error: StreamError) {
        if self.inner.state.terminate() {
            self.inner.downstream.lock().on_error(error);
        } else if !self.inner.state.is_cancelled() {
            tracing::debug!(
                violation = %ProtocolViolation::SignalAfterTerminal,
                %error,
                "late terminal dropped"
            );
        }
    }

    /// Delivers completion if it wins the terminal race.
    pub fn complete(&self) {
        if self.inner.state.terminate() {
            self.inner.downstream.lock().on_complete();
        }
    }

    /// Marks the stream cancelled: all further signals are swallowed.
    pub fn cancel(&self) {
        self.inner.state.cancel();
    }

    /// Returns `true` once a terminal signal has been delivered.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.inner.state.is_terminated()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
