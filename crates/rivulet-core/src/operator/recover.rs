//! Error recovery: swap in a fallback publisher when the source fails.
//!
//! Values delivered before the error stay delivered; the fallback picks up
//! whatever downstream demand the failed source left unconsumed. Only one
//! switch ever happens: an error from the fallback itself is terminal.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::operator::panic_message;
use crate::publisher::{Flux, RawPublisher};
use crate::signal::{ProtocolViolation, StreamError};
use crate::subscriber::Subscriber;
use crate::subscription::{Demand, Subscription, SubscriptionHandle};

type FallbackFn<T> = Arc<dyn Fn(&StreamError) -> Flux<T> + Send + Sync>;

pub(crate) struct ResumePublisher<T> {
    source: Flux<T>,
    fallback: FallbackFn<T>,
}

impl<T> ResumePublisher<T> {
    pub(crate) fn new(source: Flux<T>, fallback: FallbackFn<T>) -> Self {
        Self { source, fallback }
    }
}

impl<T: Send + 'static> RawPublisher<T> for ResumePublisher<T> {
    fn subscribe_raw(&self, subscriber: Box<dyn Subscriber<T>>) {
        let coordinator = Arc::new(ResumeCoordinator {
            demand: Demand::new(),
            current: Mutex::new(None),
            downstream: Mutex::new(subscriber),
        });
        let handle = SubscriptionHandle::new(Arc::clone(&coordinator) as Arc<dyn Subscription>);
        coordinator.downstream.lock().on_subscribe(handle);

        self.source.subscribe_boxed(Box::new(ResumeSubscriber {
            coordinator,
            fallback: Some(Arc::clone(&self.fallback)),
        }));
    }
}

struct ResumeCoordinator<T> {
    /// Downstream demand ledger, shared by the source and its fallback.
    demand: Demand,
    current: Mutex<Option<SubscriptionHandle>>,
    downstream: Mutex<Box<dyn Subscriber<T>>>,
}

impl<T: Send + 'static> Subscription for ResumeCoordinator<T> {
    fn request(&self, n: u64) {
        if n == 0 {
            if self.demand.terminate() {
                self.downstream
                    .lock()
                    .on_error(ProtocolViolation::NonPositiveRequest.into());
            }
            self.cancel();
            return;
        }
        let handle = {
            let current = self.current.lock();
            self.demand.add(n);
            current.clone()
        };
        if let Some(handle) = handle {
            handle.request(n);
        }
    }

    fn cancel(&self) {
        if self.demand.cancel() {
            if let Some(handle) = self.current.lock().take() {
                handle.cancel();
            }
        }
    }
}

/// Subscribes to the source first; after the one allowed switch, to the
/// fallback (`fallback == None` means errors are now terminal).
struct ResumeSubscriber<T> {
    coordinator: Arc<ResumeCoordinator<T>>,
    fallback: Option<FallbackFn<T>>,
}

impl<T: Send + 'static> Subscriber<T> for ResumeSubscriber<T> {
    fn on_subscribe(&mut self, subscription: SubscriptionHandle) {
        let pending = {
            let mut current = self.coordinator.current.lock();
            if self.coordinator.demand.is_cancelled() {
                drop(current);
                subscription.cancel();
                return;
            }
            *current = Some(subscription.clone());
            self.coordinator.demand.current()
        };
        if pending > 0 {
            subscription.request(pending);
        }
    }

    fn on_next(&mut self, value: T) {
        let coordinator = &self.coordinator;
        if coordinator.demand.is_terminated() || coordinator.demand.is_cancelled() {
            return;
        }
        if !coordinator.demand.try_claim() {
            // A source emitting past its granted demand is clamped here
            // rather than leaked downstream.
            return;
        }
        coordinator.downstream.lock().on_next(value);
    }

    fn on_error(&mut self, error: StreamError) {
        self.coordinator.current.lock().take();
        if self.coordinator.demand.is_cancelled() {
            return;
        }
        let Some(fallback) = self.fallback.take() else {
            if self.coordinator.demand.terminate() {
                self.coordinator.downstream.lock().on_error(error);
            }
            return;
        };
        let replacement = match catch_unwind(AssertUnwindSafe(|| fallback(&error))) {
            Ok(replacement) => replacement,
            Err(payload) => {
                if self.coordinator.demand.terminate() {
                    self.coordinator
                        .downstream
                        .lock()
                        .on_error(StreamError::transform(panic_message(payload.as_ref())));
                }
                return;
            }
        };
        replacement.subscribe_boxed(Box::new(ResumeSubscriber {
            coordinator: Arc::clone(&self.coordinator),
            fallback: None,
        }));
    }

    fn on_complete(&mut self) {
        self.coordinator.current.lock().take();
        if self.coordinator.demand.terminate() {
            self.coordinator.downstream.lock().on_complete();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::TestSubscriber;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn failing_after_two() -> Flux<i64> {
        Flux::range(1, 2).concat_with(Flux::error(StreamError::source("feed died")))
    }

    #[test]
    fn test_on_error_resume_switches_to_fallback() {
        let ts = TestSubscriber::unbounded();
        failing_after_two()
            .on_error_resume(|_| Flux::range(100, 2))
            .subscribe_with(ts.probe());
        assert_eq!(ts.values(), vec![1, 2, 100, 101]);
        assert!(ts.is_completed());
    }

    #[test]
    fn test_on_error_resume_sees_the_error() {
        let observed = Arc::new(Mutex::new(None));
        let o = Arc::clone(&observed);
        let ts = TestSubscriber::unbounded();
        failing_after_two()
            .on_error_resume(move |e| {
                *o.lock() = Some(e.clone());
                Flux::empty()
            })
            .subscribe_with(ts.probe());
        assert_eq!(*observed.lock(), Some(StreamError::source("feed died")));
        assert!(ts.is_completed());
    }

    #[test]
    fn test_on_error_resume_untouched_on_clean_completion() {
        let called = Arc::new(AtomicBool::new(false));
        let c = Arc::clone(&called);
        let ts = TestSubscriber::unbounded();
        Flux::range(1, 3)
            .on_error_resume(move |_| {
                c.store(true, Ordering::SeqCst);
                Flux::empty()
            })
            .subscribe_with(ts.probe());
        assert_eq!(ts.values(), vec![1, 2, 3]);
        assert!(!called.load(Ordering::SeqCst));
    }

    #[test]
    fn test_fallback_error_is_terminal() {
        let ts = TestSubscriber::<i64>::unbounded();
        Flux::<i64>::error(StreamError::source("first"))
            .on_error_resume(|_| Flux::error(StreamError::source("second")))
            .subscribe_with(ts.probe());
        assert_eq!(ts.error(), Some(StreamError::source("second")));
    }

    #[test]
    fn test_fallback_demand_continues_where_source_left_off() {
        let ts = TestSubscriber::with_initial_request(3);
        failing_after_two()
            .on_error_resume(|_| Flux::range(100, 3))
            .subscribe_with(ts.probe());
        assert_eq!(ts.values(), vec![1, 2, 100]);
        ts.request(10);
        assert_eq!(ts.values(), vec![1, 2, 100, 101, 102]);
        assert!(ts.is_completed());
    }

    #[test]
    fn test_on_error_return_emits_fallback_value() {
        let ts = TestSubscriber::unbounded();
        failing_after_two()
            .on_error_return(-1)
            .subscribe_with(ts.probe());
        assert_eq!(ts.values(), vec![1, 2, -1]);
        assert!(ts.is_completed());
    }

    #[test]
    fn test_overdelivering_source_is_clamped_to_demand() {
        /// Emits five values regardless of demand, then completes.
        struct Chatty;

        impl RawPublisher<i64> for Chatty {
            fn subscribe_raw(&self, mut subscriber: Box<dyn Subscriber<i64>>) {
                subscriber.on_subscribe(SubscriptionHandle::inert());
                for v in 1..=5 {
                    subscriber.on_next(v);
                }
                subscriber.on_complete();
            }
        }

        let ts = TestSubscriber::with_initial_request(2);
        Flux::from_raw(Chatty)
            .on_error_resume(|_| Flux::empty())
            .subscribe_with(ts.probe());
        assert_eq!(ts.values(), vec![1, 2]);
        assert!(ts.is_completed());
    }

    #[test]
    fn test_fallback_panic_becomes_error() {
        let ts = TestSubscriber::<i64>::unbounded();
        Flux::<i64>::error(StreamError::source("first"))
            .on_error_resume(|_| -> Flux<i64> { panic!("no fallback available") })
            .subscribe_with(ts.probe());
        assert!(matches!(ts.error(), Some(StreamError::Transform(_))));
    }
}
