//! Sequential multi-source combination.
//!
//! Sources are subscribed strictly one at a time: the next source is not
//! subscribed until the previous one completes, so relative order within
//! and across sources is fully preserved. Downstream demand lives in a
//! single ledger at the stage; whatever demand a finished source left
//! unconsumed is forwarded to the next source when it attaches.
//!
//! Source switching runs through a work-in-progress counter, so a run of
//! sources that complete at subscribe time is walked iteratively instead
//! of recursing once per source.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::publisher::{Flux, RawPublisher};
use crate::signal::{ProtocolViolation, StreamError};
use crate::subscriber::Subscriber;
use crate::subscription::{Demand, Subscription, SubscriptionHandle};

pub(crate) struct ConcatPublisher<T> {
    sources: Arc<Vec<Flux<T>>>,
}

impl<T> ConcatPublisher<T> {
    pub(crate) fn new(sources: Vec<Flux<T>>) -> Self {
        Self {
            sources: Arc::new(sources),
        }
    }
}

impl<T: Send + 'static> RawPublisher<T> for ConcatPublisher<T> {
    fn subscribe_raw(&self, subscriber: Box<dyn Subscriber<T>>) {
        let coordinator = Arc::new(ConcatCoordinator {
            sources: Arc::clone(&self.sources),
            next_index: AtomicUsize::new(0),
            demand: Demand::new(),
            current: Mutex::new(None),
            downstream: Mutex::new(subscriber),
            switch_wip: AtomicUsize::new(0),
        });
        let handle = SubscriptionHandle::new(Arc::clone(&coordinator) as Arc<dyn Subscription>);
        coordinator.downstream.lock().on_subscribe(handle);
        coordinator.advance();
    }
}

struct ConcatCoordinator<T> {
    sources: Arc<Vec<Flux<T>>>,
    /// Next source to subscribe.
    next_index: AtomicUsize,
    /// Downstream demand ledger, shared by every source in turn.
    demand: Demand,
    /// Subscription of the source currently attached.
    ///
    /// The lock also orders `request` against source attachment, so demand
    /// arriving during a switch is counted exactly once.
    current: Mutex<Option<SubscriptionHandle>>,
    downstream: Mutex<Box<dyn Subscriber<T>>>,
    /// Election counter for the source-switch loop.
    switch_wip: AtomicUsize,
}

impl<T: Send + 'static> ConcatCoordinator<T> {
    /// Attaches the next source, or completes downstream when none remain.
    fn advance(self: &Arc<Self>) {
        if self.switch_wip.fetch_add(1, Ordering::AcqRel) != 0 {
            return;
        }
        let mut missed = 1;
        loop {
            self.switch_once();
            let previous = self.switch_wip.fetch_sub(missed, Ordering::AcqRel);
            if previous == missed {
                return;
            }
            missed = previous - missed;
        }
    }

    fn switch_once(self: &Arc<Self>) {
        if self.demand.is_cancelled() || self.demand.is_terminated() {
            return;
        }
        let index = self.next_index.fetch_add(1, Ordering::AcqRel);
        match self.sources.get(index) {
            Some(source) => {
                source.subscribe_boxed(Box::new(ConcatSourceSubscriber {
                    coordinator: Arc::clone(self),
                }));
            }
            None => {
                if self.demand.terminate() {
                    self.downstream.lock().on_complete();
                }
            }
        }
    }
}

impl<T: Send + 'static> Subscription for ConcatCoordinator<T> {
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

struct ConcatSourceSubscriber<T> {
    coordinator: Arc<ConcatCoordinator<T>>,
}

impl<T: Send + 'static> Subscriber<T> for ConcatSourceSubscriber<T> {
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
        if self.coordinator.demand.terminate() {
            self.coordinator.downstream.lock().on_error(error);
        }
    }

    fn on_complete(&mut self) {
        self.coordinator.current.lock().take();
        self.coordinator.advance();
    }
}
