//! Test support: a recording subscriber with explicit demand control.
//!
//! [`TestSubscriber`] records every signal a pipeline delivers and lets
//! the test drive demand by hand, which is how the backpressure contracts
//! are asserted. For timer-driven pipelines the `await_*` methods park on
//! a condvar until the stream catches up, so tests never poll.

use std::time::{Duration, Instant};

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::signal::StreamError;
use crate::subscriber::Subscriber;
use crate::subscription::{SubscriptionHandle, UNBOUNDED};

/// Recording subscriber for pipeline assertions.
///
/// Create one, hand [`probe`](Self::probe) to `subscribe_with`, then
/// inspect [`values`](Self::values)/[`error`](Self::error)/
/// [`is_completed`](Self::is_completed) and drive demand with
/// [`request`](Self::request).
pub struct TestSubscriber<T> {
    inner: Arc<TestInner<T>>,
    initial_request: u64,
}

struct TestInner<T> {
    state: Mutex<TestState<T>>,
    condvar: Condvar,
}

struct TestState<T> {
    values: Vec<T>,
    error: Option<StreamError>,
    completed: bool,
    handle: Option<SubscriptionHandle>,
}

impl<T: Send + 'static> TestSubscriber<T> {
    /// Subscriber that requests unbounded demand at subscribe time.
    #[must_use]
    pub fn unbounded() -> Self {
        Self::with_initial_request(UNBOUNDED)
    }

    /// Subscriber that requests exactly `n` at subscribe time; further
    /// demand comes from [`request`](Self::request).
    #[must_use]
    pub fn with_initial_request(n: u64) -> Self {
        Self {
            inner: Arc::new(TestInner {
                state: Mutex::new(TestState {
                    values: Vec::new(),
                    error: None,
                    completed: false,
                    handle: None,
                }),
                condvar: Condvar::new(),
            }),
            initial_request: n,
        }
    }

    /// The [`Subscriber`] to pass to `subscribe_with`.
    #[must_use]
    pub fn probe(&self) -> TestProbe<T> {
        TestProbe {
            inner: Arc::clone(&self.inner),
            initial_request: self.initial_request,
        }
    }

    /// Values recorded so far.
    #[must_use]
    pub fn values(&self) -> Vec<T>
    where
        T: Clone,
    {
        self.inner.state.lock().values.clone()
    }

    /// The recorded error, if the stream failed.
    #[must_use]
    pub fn error(&self) -> Option<StreamError> {
        self.inner.state.lock().error.clone()
    }

    /// Whether `on_complete` has been recorded.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.inner.state.lock().completed
    }

    /// Requests `n` more values through the recorded subscription.
    pub fn request(&self, n: u64) {
        let handle = self.inner.state.lock().handle.clone();
        if let Some(handle) = handle {
            handle.request(n);
        }
    }

    /// Cancels the recorded subscription.
    pub fn cancel(&self) {
        let handle = self.inner.state.lock().handle.clone();
        if let Some(handle) = handle {
            handle.cancel();
        }
    }

    /// Blocks until a terminal signal arrives. Panics on timeout so a hung
    /// pipeline fails the test instead of wedging it.
    pub fn await_terminal(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        while state.error.is_none() && !state.completed {
            if self
                .inner
                .condvar
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                panic!("timed out waiting for a terminal signal");
            }
        }
    }

    /// Blocks until at least `count` values have been recorded. Panics on
    /// timeout.
    pub fn await_count(&self, count: usize, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        while state.values.len() < count {
            if self
                .inner
                .condvar
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                panic!(
                    "timed out with {} of {count} expected values",
                    state.values.len()
                );
            }
        }
    }
}

/// The [`Subscriber`] half of a [`TestSubscriber`].
pub struct TestProbe<T> {
    inner: Arc<TestInner<T>>,
    initial_request: u64,
}

impl<T: Send + 'static> Subscriber<T> for TestProbe<T> {
    fn on_subscribe(&mut self, subscription: SubscriptionHandle) {
        self.inner.state.lock().handle = Some(subscription.clone());
        if self.initial_request > 0 {
            subscription.request(self.initial_request);
        }
    }

    fn on_next(&mut self, value: T) {
        self.inner.state.lock().values.push(value);
        self.inner.condvar.notify_all();
    }

    fn on_error(&mut self, error: StreamError) {
        self.inner.state.lock().error = Some(error);
        self.inner.condvar.notify_all();
    }

    fn on_complete(&mut self) {
        self.inner.state.lock().completed = true;
        self.inner.condvar.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::Flux;

    #[test]
    fn test_records_values_and_completion() {
        let ts = TestSubscriber::unbounded();
        Flux::range(1, 3).subscribe_with(ts.probe());
        assert_eq!(ts.values(), vec![1, 2, 3]);
        assert!(ts.is_completed());
        assert!(ts.error().is_none());
    }

    #[test]
    fn test_manual_demand_is_respected() {
        let ts = TestSubscriber::with_initial_request(0);
        Flux::range(1, 3).subscribe_with(ts.probe());
        assert!(ts.values().is_empty());
        ts.request(2);
        assert_eq!(ts.values(), vec![1, 2]);
    }

    #[test]
    fn test_await_count_sees_async_values() {
        let ts = TestSubscriber::unbounded();
        let probe = ts.probe();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            Flux::range(1, 3).subscribe_with(probe);
        });
        ts.await_count(3, Duration::from_secs(5));
        assert_eq!(ts.values(), vec![1, 2, 3]);
    }
}
