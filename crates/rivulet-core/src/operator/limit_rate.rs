//! Caps how much demand ever reaches the source at once.
//!
//! The stage requests `prefetch` values upstream, and requests the next
//! batch only after a full batch has been delivered downstream, so the
//! source never has more than `prefetch` values outstanding regardless of
//! how much the downstream asks for. Downstream demand is still honored
//! exactly; the [`DrainQueue`] holds values that arrived ahead of it.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::drain::DrainQueue;
use crate::publisher::{Flux, RawPublisher};
use crate::signal::StreamError;
use crate::subscriber::Subscriber;
use crate::subscription::SubscriptionHandle;

pub(crate) struct LimitRatePublisher<T> {
    source: Flux<T>,
    prefetch: u64,
}

impl<T> LimitRatePublisher<T> {
    pub(crate) fn new(source: Flux<T>, prefetch: u64) -> Self {
        Self {
            source,
            prefetch: prefetch.max(1),
        }
    }
}

impl<T: Send + 'static> RawPublisher<T> for LimitRatePublisher<T> {
    fn subscribe_raw(&self, subscriber: Box<dyn Subscriber<T>>) {
        let upstream = Arc::new(UpstreamSlot::default());

        let queue = DrainQueue::new(Box::new(RefillSubscriber {
            downstream: subscriber,
            upstream: Arc::clone(&upstream),
            prefetch: self.prefetch,
            delivered: 0,
        }) as Box<dyn Subscriber<T>>);

        let cancel_upstream = Arc::clone(&upstream);
        queue.set_on_cancel(move || cancel_upstream.cancel());
        queue.deliver_on_subscribe();

        self.source.subscribe_boxed(Box::new(BatchSubscriber {
            queue,
            upstream,
            prefetch: self.prefetch,
        }));
    }
}

/// Holds the source's subscription; closes the window where the downstream
/// cancels before the source has delivered its subscription.
#[derive(Default)]
struct UpstreamSlot {
    state: Mutex<SlotState>,
}

#[derive(Default)]
struct SlotState {
    handle: Option<SubscriptionHandle>,
    cancelled: bool,
}

impl UpstreamSlot {
    /// Stores the handle, cancelling it on the spot if the slot is closed.
    fn set(&self, handle: SubscriptionHandle) -> bool {
        let mut state = self.state.lock();
        if state.cancelled {
            drop(state);
            handle.cancel();
            return false;
        }
        state.handle = Some(handle);
        true
    }

    fn request(&self, n: u64) {
        let handle = self.state.lock().handle.clone();
        if let Some(handle) = handle {
            handle.request(n);
        }
    }

    fn cancel(&self) {
        let handle = {
            let mut state = self.state.lock();
            state.cancelled = true;
            state.handle.take()
        };
        if let Some(handle) = handle {
            handle.cancel();
        }
    }
}

/// Sits between the drain queue and the real downstream, counting delivered
/// values and requesting the next upstream batch when one completes.
struct RefillSubscriber<T> {
    downstream: Box<dyn Subscriber<T>>,
    upstream: Arc<UpstreamSlot>,
    prefetch: u64,
    delivered: u64,
}

impl<T: Send + 'static> Subscriber<T> for RefillSubscriber<T> {
    fn on_subscribe(&mut self, subscription: SubscriptionHandle) {
        self.downstream.on_subscribe(subscription);
    }

    fn on_next(&mut self, value: T) {
        self.downstream.on_next(value);
        self.delivered += 1;
        if self.delivered == self.prefetch {
            self.delivered = 0;
            self.upstream.request(self.prefetch);
        }
    }

    fn on_error(&mut self, error: StreamError) {
        self.downstream.on_error(error);
    }

    fn on_complete(&mut self) {
        self.downstream.on_complete();
    }
}

struct BatchSubscriber<T> {
    queue: DrainQueue<T>,
    upstream: Arc<UpstreamSlot>,
    prefetch: u64,
}

impl<T: Send + 'static> Subscriber<T> for BatchSubscriber<T> {
    fn on_subscribe(&mut self, subscription: SubscriptionHandle) {
        if self.upstream.set(subscription.clone()) {
            subscription.request(self.prefetch);
        }
    }

    fn on_next(&mut self, value: T) {
        self.queue.push(value);
    }

    fn on_error(&mut self, error: StreamError) {
        self.queue.error(error);
    }

    fn on_complete(&mut self) {
        self.queue.complete();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::TestSubscriber;

    #[test]
    fn test_limit_rate_passes_all_values_through() {
        let ts = TestSubscriber::unbounded();
        Flux::range(1, 10).limit_rate(3).subscribe_with(ts.probe());
        assert_eq!(ts.values(), (1..=10).collect::<Vec<_>>());
        assert!(ts.is_completed());
    }

    #[test]
    fn test_limit_rate_caps_upstream_batches() {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let r = Arc::clone(&requests);
        let ts = TestSubscriber::unbounded();
        Flux::range(1, 10)
            .do_on_request(move |n| r.lock().push(n))
            .limit_rate(3)
            .subscribe_with(ts.probe());

        assert_eq!(ts.values().len(), 10);
        let seen = requests.lock().clone();
        assert!(!seen.is_empty());
        assert!(seen.iter().all(|n| *n == 3), "batches were {seen:?}");
    }

    #[test]
    fn test_limit_rate_still_honors_downstream_demand() {
        let ts = TestSubscriber::with_initial_request(2);
        Flux::range(1, 10).limit_rate(4).subscribe_with(ts.probe());
        assert_eq!(ts.values(), vec![1, 2]);
        ts.request(3);
        assert_eq!(ts.values(), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_limit_rate_zero_is_clamped_to_one() {
        let ts = TestSubscriber::unbounded();
        Flux::range(1, 3).limit_rate(0).subscribe_with(ts.probe());
        assert_eq!(ts.values(), vec![1, 2, 3]);
        assert!(ts.is_completed());
    }
}
