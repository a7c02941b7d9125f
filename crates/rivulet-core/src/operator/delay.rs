//! Shift every value later in time by a fixed delay.
//!
//! Each arriving value is parked on the scheduler for the configured
//! delay and delivered from the timer context. Equal deadlines fire in
//! submission order on [`TimerScheduler`], so ordering survives the trip
//! through the heap. Demand passes through 1:1 — delaying changes when a
//! value arrives, not how many were asked for.
//!
//! Errors skip the queue: an upstream error cancels every pending timer
//! and goes downstream immediately. Completion waits until the last
//! delayed value has been delivered.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::publisher::{Flux, RawPublisher};
use crate::scheduler::{Scheduler, TaskBag};
use crate::signal::StreamError;
use crate::subscriber::{SerializedSubscriber, Subscriber};
use crate::subscription::{Subscription, SubscriptionHandle};

pub(crate) struct DelayPublisher<T> {
    source: Flux<T>,
    delay: Duration,
    scheduler: Arc<dyn Scheduler>,
}

impl<T> DelayPublisher<T> {
    pub(crate) fn new(source: Flux<T>, delay: Duration, scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            source,
            delay,
            scheduler,
        }
    }
}

impl<T: Send + 'static> RawPublisher<T> for DelayPublisher<T> {
    fn subscribe_raw(&self, subscriber: Box<dyn Subscriber<T>>) {
        self.source.subscribe_boxed(Box::new(DelaySubscriber {
            serialized: SerializedSubscriber::new(subscriber),
            scheduler: Arc::clone(&self.scheduler),
            delay: self.delay,
            tasks: Arc::new(TaskBag::new()),
            pending: Arc::new(AtomicUsize::new(0)),
            upstream_done: Arc::new(AtomicBool::new(false)),
        }));
    }
}

struct DelaySubscriber<T> {
    serialized: SerializedSubscriber<T>,
    scheduler: Arc<dyn Scheduler>,
    delay: Duration,
    /// Timers still holding an undelivered value.
    tasks: Arc<TaskBag>,
    pending: Arc<AtomicUsize>,
    upstream_done: Arc<AtomicBool>,
}

impl<T: Send + 'static> Subscriber<T> for DelaySubscriber<T> {
    fn on_subscribe(&mut self, subscription: SubscriptionHandle) {
        let handle = SubscriptionHandle::new(Arc::new(DelaySubscription {
            upstream: subscription,
            serialized: self.serialized.clone(),
            tasks: Arc::clone(&self.tasks),
        }));
        self.serialized.subscribe(handle);
    }

    fn on_next(&mut self, value: T) {
        if self.serialized.is_terminated() {
            return;
        }
        self.pending.fetch_add(1, Ordering::SeqCst);
        let serialized = self.serialized.clone();
        let pending = Arc::clone(&self.pending);
        let upstream_done = Arc::clone(&self.upstream_done);
        // Each parked value owns a scheduler reference, so pending
        // timers survive the caller dropping the publisher and handle.
        let scheduler = Arc::clone(&self.scheduler);
        let handle = self.scheduler.schedule_after(
            self.delay,
            Box::new(move || {
                serialized.next(value);
                if pending.fetch_sub(1, Ordering::SeqCst) == 1
                    && upstream_done.load(Ordering::SeqCst)
                {
                    serialized.complete();
                }
                drop(scheduler);
            }),
        );
        self.tasks.add(handle);
    }

    fn on_error(&mut self, error: StreamError) {
        // Errors are not delayed; pending values are dropped.
        self.tasks.cancel_all();
        self.serialized.error(error);
    }

    fn on_complete(&mut self) {
        self.upstream_done.store(true, Ordering::SeqCst);
        if self.pending.load(Ordering::SeqCst) == 0 {
            self.serialized.complete();
        }
    }
}

struct DelaySubscription<T> {
    upstream: SubscriptionHandle,
    serialized: SerializedSubscriber<T>,
    tasks: Arc<TaskBag>,
}

impl<T> Subscription for DelaySubscription<T> {
    fn request(&self, n: u64) {
        self.upstream.request(n);
    }

    fn cancel(&self) {
        self.serialized.cancel();
        self.tasks.cancel_all();
        self.upstream.cancel();
    }
}
