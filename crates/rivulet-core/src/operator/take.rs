//! Pass through up to `n` values, then complete and cancel upstream.
//!
//! `take(0)` never subscribes upstream at all: the downstream gets an
//! inert subscription and an immediate `on_complete`, so an infinite
//! source's production logic is never observably invoked.
//!
//! Upstream demand is capped at `n` so the source is never asked to
//! produce values this stage would discard.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::publisher::{Flux, RawPublisher};
use crate::signal::StreamError;
use crate::subscriber::Subscriber;
use crate::subscription::{Subscription, SubscriptionHandle, UNBOUNDED};

pub(crate) struct TakePublisher<T> {
    source: Flux<T>,
    limit: u64,
}

impl<T> TakePublisher<T> {
    pub(crate) fn new(source: Flux<T>, limit: u64) -> Self {
        Self { source, limit }
    }
}

impl<T: Send + 'static> RawPublisher<T> for TakePublisher<T> {
    fn subscribe_raw(&self, mut subscriber: Box<dyn Subscriber<T>>) {
        if self.limit == 0 {
            subscriber.on_subscribe(SubscriptionHandle::inert());
            subscriber.on_complete();
            return;
        }
        self.source.subscribe_boxed(Box::new(TakeSubscriber {
            downstream: subscriber,
            remaining: self.limit,
            limit: self.limit,
            upstream: None,
            done: false,
        }));
    }
}

struct TakeSubscriber<T> {
    downstream: Box<dyn Subscriber<T>>,
    remaining: u64,
    limit: u64,
    upstream: Option<SubscriptionHandle>,
    done: bool,
}

impl<T: Send + 'static> Subscriber<T> for TakeSubscriber<T> {
    fn on_subscribe(&mut self, subscription: SubscriptionHandle) {
        self.upstream = Some(subscription.clone());
        self.downstream
            .on_subscribe(SubscriptionHandle::new(Arc::new(CappedSubscription {
                upstream: subscription,
                budget: AtomicU64::new(self.limit),
            })));
    }

    fn on_next(&mut self, value: T) {
        if self.done || self.remaining == 0 {
            return;
        }
        self.remaining -= 1;
        self.downstream.on_next(value);
        if self.remaining == 0 {
            self.done = true;
            if let Some(upstream) = &self.upstream {
                upstream.cancel();
            }
            self.downstream.on_complete();
        }
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
        self.downstream.on_complete();
    }
}

/// Forwards downstream requests, never letting more than the take limit
/// reach the source in total.
struct CappedSubscription {
    upstream: SubscriptionHandle,
    budget: AtomicU64,
}

impl Subscription for CappedSubscription {
    fn request(&self, n: u64) {
        if n == 0 {
            // Let the source report the protocol violation.
            self.upstream.request(0);
            return;
        }
        loop {
            let budget = self.budget.load(Ordering::Acquire);
            if budget == 0 {
                return;
            }
            let grant = if n == UNBOUNDED { budget } else { n.min(budget) };
            if self
                .budget
                .compare_exchange_weak(
                    budget,
                    budget - grant,
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                self.upstream.request(grant);
                return;
            }
        }
    }

    fn cancel(&self) {
        self.upstream.cancel();
    }
}

#[cfg(test)]
mod tests {
    use crate::publisher::Flux;
    use crate::testkit::TestSubscriber;

    #[test]
    fn test_take_truncates_and_completes() {
        let ts = TestSubscriber::unbounded();
        Flux::range(1, 100).take(3).subscribe_with(ts.probe());
        assert_eq!(ts.values(), vec![1, 2, 3]);
        assert!(ts.is_completed());
    }

    #[test]
    fn test_take_more_than_available_passes_completion_through() {
        let ts = TestSubscriber::unbounded();
        Flux::range(1, 3).take(10).subscribe_with(ts.probe());
        assert_eq!(ts.values(), vec![1, 2, 3]);
        assert!(ts.is_completed());
    }

    #[test]
    fn test_take_zero_completes_without_touching_source() {
        let touched = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let t = std::sync::Arc::clone(&touched);
        let source = Flux::from_iterable(move || {
            t.store(true, std::sync::atomic::Ordering::SeqCst);
            0..10
        });

        let ts = TestSubscriber::unbounded();
        source.take(0).subscribe_with(ts.probe());
        assert!(ts.values().is_empty());
        assert!(ts.is_completed());
        assert!(!touched.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[test]
    fn test_take_respects_downstream_demand() {
        let ts = TestSubscriber::with_initial_request(1);
        Flux::range(1, 10).take(3).subscribe_with(ts.probe());
        assert_eq!(ts.values(), vec![1]);
        ts.request(5);
        assert_eq!(ts.values(), vec![1, 2, 3]);
        assert!(ts.is_completed());
    }
}
