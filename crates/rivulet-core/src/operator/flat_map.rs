//! Asynchronous transform: map each value to a publisher and merge the
//! inner emissions.
//!
//! Inner publishers interleave by completion timing, not input order. The
//! stage completes only once the upstream has completed and every inner
//! publisher has completed; the first error (from upstream or any inner)
//! terminates the whole stage and cancels everything else.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::drain::DrainQueue;
use crate::operator::merge::MergeSourceSubscriber;
use crate::operator::panic_message;
use crate::publisher::{Flux, RawPublisher};
use crate::signal::StreamError;
use crate::subscriber::Subscriber;
use crate::subscription::{HandleBag, SubscriptionHandle, UNBOUNDED};

pub(crate) struct FlatMapPublisher<T, U> {
    source: Flux<T>,
    transform: Arc<dyn Fn(T) -> Flux<U> + Send + Sync>,
}

impl<T, U> FlatMapPublisher<T, U> {
    pub(crate) fn new(
        source: Flux<T>,
        transform: Arc<dyn Fn(T) -> Flux<U> + Send + Sync>,
    ) -> Self {
        Self { source, transform }
    }
}

impl<T, U> RawPublisher<U> for FlatMapPublisher<T, U>
where
    T: Send + 'static,
    U: Send + 'static,
{
    fn subscribe_raw(&self, subscriber: Box<dyn Subscriber<U>>) {
        let queue = DrainQueue::new(subscriber);
        let bag = Arc::new(HandleBag::new());
        // Upstream counts as one producer until it completes.
        let remaining = Arc::new(AtomicUsize::new(1));

        let cancel_bag = Arc::clone(&bag);
        queue.set_on_cancel(move || cancel_bag.cancel_all());
        queue.deliver_on_subscribe();

        self.source.subscribe_boxed(Box::new(FlatMapOuterSubscriber {
            queue,
            bag,
            remaining,
            transform: Arc::clone(&self.transform),
        }));
    }
}

struct FlatMapOuterSubscriber<T, U> {
    queue: DrainQueue<U>,
    bag: Arc<HandleBag>,
    remaining: Arc<AtomicUsize>,
    transform: Arc<dyn Fn(T) -> Flux<U> + Send + Sync>,
}

impl<T, U> Subscriber<T> for FlatMapOuterSubscriber<T, U>
where
    T: Send + 'static,
    U: Send + 'static,
{
    fn on_subscribe(&mut self, subscription: SubscriptionHandle) {
        subscription.request(UNBOUNDED);
        self.bag.add(subscription);
    }

    fn on_next(&mut self, value: T) {
        if self.queue.is_terminated() {
            return;
        }
        let transform = &self.transform;
        let inner = match catch_unwind(AssertUnwindSafe(move || transform(value))) {
            Ok(inner) => inner,
            Err(payload) => {
                self.bag.cancel_all();
                self.queue
                    .error(StreamError::transform(panic_message(payload.as_ref())));
                return;
            }
        };
        self.remaining.fetch_add(1, Ordering::AcqRel);
        inner.subscribe_boxed(Box::new(MergeSourceSubscriber {
            queue: self.queue.clone(),
            bag: Arc::clone(&self.bag),
            remaining: Arc::clone(&self.remaining),
        }));
    }

    fn on_error(&mut self, error: StreamError) {
        self.bag.cancel_all();
        self.queue.error(error);
    }

    fn on_complete(&mut self) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.queue.complete();
        }
    }
}
