//! Synchronous 1:1 value transform.
//!
//! Demand passes through untouched: the downstream's subscription is the
//! upstream's subscription. The only state is the transform itself and a
//! terminal guard for the failure path.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::operator::panic_message;
use crate::publisher::{Flux, RawPublisher};
use crate::signal::StreamError;
use crate::subscriber::Subscriber;
use crate::subscription::SubscriptionHandle;

pub(crate) struct MapPublisher<T, U> {
    source: Flux<T>,
    transform: Arc<dyn Fn(T) -> U + Send + Sync>,
}

impl<T, U> MapPublisher<T, U> {
    pub(crate) fn new(source: Flux<T>, transform: Arc<dyn Fn(T) -> U + Send + Sync>) -> Self {
        Self { source, transform }
    }
}

impl<T, U> RawPublisher<U> for MapPublisher<T, U>
where
    T: Send + 'static,
    U: Send + 'static,
{
    fn subscribe_raw(&self, subscriber: Box<dyn Subscriber<U>>) {
        self.source.subscribe_boxed(Box::new(MapSubscriber {
            downstream: subscriber,
            transform: Arc::clone(&self.transform),
            upstream: None,
            done: false,
        }));
    }
}

struct MapSubscriber<T, U> {
    downstream: Box<dyn Subscriber<U>>,
    transform: Arc<dyn Fn(T) -> U + Send + Sync>,
    upstream: Option<SubscriptionHandle>,
    done: bool,
}

impl<T, U> Subscriber<T> for MapSubscriber<T, U>
where
    T: Send + 'static,
    U: Send + 'static,
{
    fn on_subscribe(&mut self, subscription: SubscriptionHandle) {
        self.upstream = Some(subscription.clone());
        self.downstream.on_subscribe(subscription);
    }

    fn on_next(&mut self, value: T) {
        if self.done {
            return;
        }
        let transform = &self.transform;
        match catch_unwind(AssertUnwindSafe(move || transform(value))) {
            Ok(mapped) => self.downstream.on_next(mapped),
            Err(payload) => {
                self.done = true;
                if let Some(upstream) = &self.upstream {
                    upstream.cancel();
                }
                self.downstream
                    .on_error(StreamError::transform(panic_message(payload.as_ref())));
            }
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
