//! Move subscription-time work onto a scheduler.
//!
//! The whole subscribe call — and therefore everything a synchronous
//! source does eagerly, including its first emissions — runs on the
//! scheduler's context instead of the caller's. The downstream receives
//! `on_subscribe` from that context once the hop completes.

use std::sync::Arc;

use crate::publisher::{Flux, RawPublisher};
use crate::scheduler::Scheduler;
use crate::subscriber::Subscriber;

pub(crate) struct SubscribeOnPublisher<T> {
    source: Flux<T>,
    scheduler: Arc<dyn Scheduler>,
}

impl<T> SubscribeOnPublisher<T> {
    pub(crate) fn new(source: Flux<T>, scheduler: Arc<dyn Scheduler>) -> Self {
        Self { source, scheduler }
    }
}

impl<T: Send + 'static> RawPublisher<T> for SubscribeOnPublisher<T> {
    fn subscribe_raw(&self, subscriber: Box<dyn Subscriber<T>>) {
        let source = self.source.clone();
        // The task owns a scheduler reference of its own, so the hop
        // still runs when the caller drops the publisher (and with it the
        // only other reference) right after subscribing.
        let scheduler = Arc::clone(&self.scheduler);
        self.scheduler.schedule_now(Box::new(move || {
            source.subscribe_boxed(subscriber);
            drop(scheduler);
        }));
    }
}
