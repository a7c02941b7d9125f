//! Subscription protocol: the demand ledger and subscription handles.
//!
//! A [`Demand`] is the only state shared between a producer and the context
//! consuming from it: an atomic requested counter (saturating at
//! [`UNBOUNDED`]), a cancellation flag, and a terminal latch. `request` may
//! be called from a different thread than the one delivering `on_next`, so
//! all three live on atomics; claiming one unit of demand is a CAS loop.
//!
//! [`SubscriptionHandle`] is the cloneable, type-erased handle a subscriber
//! receives in `on_subscribe` and uses to pull values and to cancel.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use smallvec::SmallVec;

/// Sentinel demand value that removes the backpressure cap.
pub const UNBOUNDED: u64 = u64::MAX;

// ---------------------------------------------------------------------------
// Subscription
// ---------------------------------------------------------------------------

/// The live connection between one producer and one subscriber.
///
/// `request` is additive and saturating; `cancel` is idempotent. Both may
/// be called from any thread.
pub trait Subscription: Send + Sync {
    /// Signals willingness to receive up to `n` additional values.
    ///
    /// `n == 0` is a protocol violation; the producer reports it to this
    /// subscription's subscriber via `on_error` rather than panicking.
    fn request(&self, n: u64);

    /// Stops the producer. Signals already in flight may still be dropped
    /// on the floor, never duplicated.
    fn cancel(&self);
}

/// Cloneable type-erased handle to a [`Subscription`].
#[derive(Clone)]
pub struct SubscriptionHandle(Arc<dyn Subscription>);

impl SubscriptionHandle {
    /// Wraps a subscription implementation.
    pub fn new(subscription: Arc<dyn Subscription>) -> Self {
        Self(subscription)
    }

    /// Handle that accepts `request`/`cancel` and does nothing.
    ///
    /// Used by sources that terminate at subscribe time (`empty`, `error`)
    /// and by `take(0)`, which never subscribes upstream.
    #[must_use]
    pub fn inert() -> Self {
        Self(Arc::new(InertSubscription))
    }

    /// See [`Subscription::request`].
    pub fn request(&self, n: u64) {
        self.0.request(n);
    }

    /// See [`Subscription::cancel`].
    pub fn cancel(&self) {
        self.0.cancel();
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle").finish_non_exhaustive()
    }
}

struct InertSubscription;

impl Subscription for InertSubscription {
    fn request(&self, _n: u64) {}
    fn cancel(&self) {}
}

// ---------------------------------------------------------------------------
// Demand
// ---------------------------------------------------------------------------

/// Per-subscription demand ledger.
///
/// Tracks cumulative outstanding demand, the cancellation flag, and a
/// terminal latch that guarantees at most one terminal signal is ever
/// delivered downstream.
#[derive(Debug, Default)]
pub struct Demand {
    /// Outstanding requested count; [`UNBOUNDED`] removes the cap.
    requested: AtomicU64,
    /// Set once by `cancel`.
    cancelled: AtomicBool,
    /// Set once when a terminal signal is delivered downstream.
    terminated: AtomicBool,
}

impl Demand {
    /// Creates a ledger with zero outstanding demand.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `n` to the outstanding demand, saturating at [`UNBOUNDED`].
    ///
    /// Returns the previous outstanding demand, so the caller knows whether
    /// a drain needs to be kicked off (`previous == 0`).
    pub fn add(&self, n: u64) -> u64 {
        loop {
            let current = self.requested.load(Ordering::Acquire);
            if current == UNBOUNDED {
                return UNBOUNDED;
            }
            let next = current.saturating_add(n);
            if self
                .requested
                .compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return current;
            }
        }
    }

    /// Attempts to consume one unit of demand.
    ///
    /// Returns `false` when no demand is outstanding or the subscription
    /// has been cancelled. Unbounded demand is never decremented.
    #[inline]
    #[must_use]
    pub fn try_claim(&self) -> bool {
        if self.is_cancelled() {
            return false;
        }
        loop {
            let current = self.requested.load(Ordering::Acquire);
            if current == 0 {
                return false;
            }
            if current == UNBOUNDED {
                return true;
            }
            if self
                .requested
                .compare_exchange_weak(current, current - 1, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
        }
    }

    /// Returns the current outstanding demand.
    #[must_use]
    pub fn current(&self) -> u64 {
        self.requested.load(Ordering::Acquire)
    }

    /// Returns `true` if the cap has been removed.
    #[must_use]
    pub fn is_unbounded(&self) -> bool {
        self.current() == UNBOUNDED
    }

    /// Marks the subscription cancelled. Returns `true` on the first call.
    pub fn cancel(&self) -> bool {
        !self.cancelled.swap(true, Ordering::AcqRel)
    }

    /// Returns `true` once `cancel` has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Claims the right to deliver the terminal signal.
    ///
    /// Returns `true` exactly once; every stage checks this before calling
    /// `on_error`/`on_complete` so that racing terminals collapse to one.
    pub fn terminate(&self) -> bool {
        self.terminated
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Returns `true` once a terminal signal has been delivered.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }
}

// ---------------------------------------------------------------------------
// HandleBag
// ---------------------------------------------------------------------------

/// Set of upstream handles owned by a combinator stage.
///
/// Cancelling the bag cancels every handle exactly once; handles added
/// after cancellation are cancelled immediately, which closes the race
/// between a downstream `cancel` and a source whose `on_subscribe` has not
/// run yet (`merge`/`flat_map` subscribe their sources after handing the
/// downstream its own subscription).
#[derive(Default)]
pub(crate) struct HandleBag {
    inner: Mutex<BagState>,
}

#[derive(Default)]
struct BagState {
    handles: SmallVec<[SubscriptionHandle; 4]>,
    cancelled: bool,
}

impl HandleBag {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Adds a handle, cancelling it on the spot if the bag is closed.
    pub(crate) fn add(&self, handle: SubscriptionHandle) {
        let cancelled = {
            let mut state = self.inner.lock();
            if state.cancelled {
                true
            } else {
                state.handles.push(handle.clone());
                false
            }
        };
        if cancelled {
            handle.cancel();
        }
    }

    /// Cancels every held handle and closes the bag.
    pub(crate) fn cancel_all(&self) {
        let handles = {
            let mut state = self.inner.lock();
            state.cancelled = true;
            std::mem::take(&mut state.handles)
        };
        for handle in handles {
            handle.cancel();
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
