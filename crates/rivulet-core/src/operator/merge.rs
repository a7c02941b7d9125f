//! Eager multi-source combination.
//!
//! All sources are subscribed at subscribe time; each value is forwarded
//! as soon as its source produces it, so the interleaving is a function of
//! emission timing, not source position. Per-source order is preserved;
//! cross-source order is not. Completion fires once every source has
//! completed; the first error terminates the merge and cancels the
//! surviving sources.
//!
//! Sources are drained at their own pace into the shared [`DrainQueue`],
//! which owns the downstream demand ledger, so the downstream never sees
//! more values than it requested no matter how fast sources produce.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::drain::DrainQueue;
use crate::publisher::{Flux, RawPublisher};
use crate::signal::StreamError;
use crate::subscriber::Subscriber;
use crate::subscription::{HandleBag, SubscriptionHandle, UNBOUNDED};

pub(crate) struct MergePublisher<T> {
    sources: Arc<Vec<Flux<T>>>,
}

impl<T> MergePublisher<T> {
    pub(crate) fn new(sources: Vec<Flux<T>>) -> Self {
        Self {
            sources: Arc::new(sources),
        }
    }
}

impl<T: Send + 'static> RawPublisher<T> for MergePublisher<T> {
    fn subscribe_raw(&self, subscriber: Box<dyn Subscriber<T>>) {
        let queue = DrainQueue::new(subscriber);
        let bag = Arc::new(HandleBag::new());
        let remaining = Arc::new(AtomicUsize::new(self.sources.len()));

        let cancel_bag = Arc::clone(&bag);
        queue.set_on_cancel(move || cancel_bag.cancel_all());
        queue.deliver_on_subscribe();

        if self.sources.is_empty() {
            queue.complete();
            return;
        }
        for source in self.sources.iter() {
            source.subscribe_boxed(Box::new(MergeSourceSubscriber {
                queue: queue.clone(),
                bag: Arc::clone(&bag),
                remaining: Arc::clone(&remaining),
            }));
        }
    }
}

/// Feeds one source into a shared drain queue; also the inner-subscriber
/// shape `flat_map` uses for the publishers its transform returns.
pub(crate) struct MergeSourceSubscriber<T> {
    pub(crate) queue: DrainQueue<T>,
    pub(crate) bag: Arc<HandleBag>,
    /// Producers (sources, plus the outer upstream for `flat_map`) still
    /// running; whoever hits zero completes the queue.
    pub(crate) remaining: Arc<AtomicUsize>,
}

impl<T: Send + 'static> Subscriber<T> for MergeSourceSubscriber<T> {
    fn on_subscribe(&mut self, subscription: SubscriptionHandle) {
        subscription.request(UNBOUNDED);
        self.bag.add(subscription);
    }

    fn on_next(&mut self, value: T) {
        self.queue.push(value);
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

#[cfg(test)]
mod tests {
    use crate::publisher::Flux;
    use crate::signal::StreamError;
    use crate::testkit::TestSubscriber;

    #[test]
    fn test_merge_delivers_every_value_from_every_source() {
        let ts = TestSubscriber::unbounded();
        Flux::merge(vec![Flux::range(1, 5), Flux::range(6, 5)]).subscribe_with(ts.probe());

        let mut values = ts.values();
        values.sort_unstable();
        assert_eq!(values, (1..=10).collect::<Vec<_>>());
        assert!(ts.is_completed());
    }

    #[test]
    fn test_merge_preserves_per_source_order() {
        let ts = TestSubscriber::unbounded();
        Flux::merge(vec![Flux::range(1, 3), Flux::range(10, 3)]).subscribe_with(ts.probe());

        let values = ts.values();
        let firsts: Vec<_> = values.iter().copied().filter(|v| *v < 10).collect();
        let seconds: Vec<_> = values.iter().copied().filter(|v| *v >= 10).collect();
        assert_eq!(firsts, vec![1, 2, 3]);
        assert_eq!(seconds, vec![10, 11, 12]);
    }

    #[test]
    fn test_merge_of_nothing_completes() {
        let ts = TestSubscriber::<i64>::unbounded();
        Flux::<i64>::merge(vec![]).subscribe_with(ts.probe());
        assert!(ts.values().is_empty());
        assert!(ts.is_completed());
    }

    #[test]
    fn test_merge_error_terminates_once() {
        let ts = TestSubscriber::unbounded();
        Flux::merge(vec![
            Flux::range(1, 3),
            Flux::error(StreamError::source("dead feed")),
            Flux::range(4, 3),
        ])
        .subscribe_with(ts.probe());

        assert_eq!(ts.error(), Some(StreamError::source("dead feed")));
        assert!(!ts.is_completed());
    }

    #[test]
    fn test_merge_respects_downstream_demand() {
        let ts = TestSubscriber::with_initial_request(4);
        Flux::merge(vec![Flux::range(1, 5), Flux::range(6, 5)]).subscribe_with(ts.probe());
        assert_eq!(ts.values().len(), 4);
        ts.request(100);
        assert_eq!(ts.values().len(), 10);
        assert!(ts.is_completed());
    }
}
