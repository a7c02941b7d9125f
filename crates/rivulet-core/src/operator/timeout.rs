//! Per-signal deadline: error out when the source goes quiet.
//!
//! A timer is armed at subscribe time and re-armed after every value; if
//! it fires before the next signal arrives, the stage cancels the source
//! and errors with [`StreamError::Timeout`]. A generation counter settles
//! the race between an expiring timer and an arriving signal: whichever
//! bumps the generation first wins, the loser is swallowed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::publisher::{Flux, RawPublisher};
use crate::scheduler::{Scheduler, TaskHandle};
use crate::signal::StreamError;
use crate::subscriber::{SerializedSubscriber, Subscriber};
use crate::subscription::{Subscription, SubscriptionHandle};

pub(crate) struct TimeoutPublisher<T> {
    source: Flux<T>,
    deadline: Duration,
    scheduler: Arc<dyn Scheduler>,
}

impl<T> TimeoutPublisher<T> {
    pub(crate) fn new(source: Flux<T>, deadline: Duration, scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            source,
            deadline,
            scheduler,
        }
    }
}

impl<T: Send + 'static> RawPublisher<T> for TimeoutPublisher<T> {
    fn subscribe_raw(&self, subscriber: Box<dyn Subscriber<T>>) {
        let core = Arc::new(TimeoutCore {
            serialized: SerializedSubscriber::new(subscriber),
            deadline: self.deadline,
            scheduler: Arc::clone(&self.scheduler),
            generation: AtomicU64::new(0),
            timer: Mutex::new(None),
            upstream: Mutex::new(None),
        });
        self.source
            .subscribe_boxed(Box::new(TimeoutSubscriber { core }));
    }
}

struct TimeoutCore<T> {
    serialized: SerializedSubscriber<T>,
    deadline: Duration,
    scheduler: Arc<dyn Scheduler>,
    /// Bumped by every signal; an armed timer only fires for the
    /// generation it was armed against.
    generation: AtomicU64,
    timer: Mutex<Option<TaskHandle>>,
    upstream: Mutex<Option<SubscriptionHandle>>,
}

impl<T: Send + 'static> TimeoutCore<T> {
    /// Invalidates any armed timer and returns the new generation.
    fn bump(&self) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        if let Some(timer) = self.timer.lock().take() {
            timer.cancel();
        }
        generation
    }

    fn arm(self: &Arc<Self>, expected: u64) {
        if self.serialized.is_terminated() {
            return;
        }
        let core = Arc::clone(self);
        let handle = self.scheduler.schedule_after(
            self.deadline,
            Box::new(move || core.expire(expected)),
        );
        *self.timer.lock() = Some(handle);
    }

    fn expire(&self, expected: u64) {
        // Losing the race against an in-flight signal means this deadline
        // no longer applies.
        if self
            .generation
            .compare_exchange(expected, expected + 1, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        if let Some(upstream) = self.upstream.lock().take() {
            upstream.cancel();
        }
        self.serialized.error(StreamError::Timeout(self.deadline));
    }
}

struct TimeoutSubscriber<T> {
    core: Arc<TimeoutCore<T>>,
}

impl<T: Send + 'static> Subscriber<T> for TimeoutSubscriber<T> {
    fn on_subscribe(&mut self, subscription: SubscriptionHandle) {
        *self.core.upstream.lock() = Some(subscription.clone());
        let handle = SubscriptionHandle::new(Arc::new(TimeoutSubscription {
            upstream: subscription,
            core: Arc::clone(&self.core),
        }));
        self.core.serialized.subscribe(handle);
        let generation = self.core.generation.load(Ordering::Acquire);
        self.core.arm(generation);
    }

    fn on_next(&mut self, value: T) {
        if self.core.serialized.is_terminated() {
            return;
        }
        let generation = self.core.bump();
        self.core.serialized.next(value);
        self.core.arm(generation);
    }

    fn on_error(&mut self, error: StreamError) {
        self.core.bump();
        self.core.serialized.error(error);
    }

    fn on_complete(&mut self) {
        self.core.bump();
        self.core.serialized.complete();
    }
}

struct TimeoutSubscription<T> {
    upstream: SubscriptionHandle,
    core: Arc<TimeoutCore<T>>,
}

impl<T: Send + 'static> Subscription for TimeoutSubscription<T> {
    fn request(&self, n: u64) {
        self.upstream.request(n);
    }

    fn cancel(&self) {
        self.core.bump();
        self.core.serialized.cancel();
        self.core.upstream.lock().take();
        self.upstream.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::TimerScheduler;
    use crate::testkit::TestSubscriber;

    #[test]
    fn test_timeout_passes_prompt_streams_through() {
        let scheduler = Arc::new(TimerScheduler::new());
        let ts = TestSubscriber::unbounded();
        Flux::range(1, 5)
            .timeout(Duration::from_secs(60), scheduler)
            .subscribe_with(ts.probe());

        ts.await_terminal(Duration::from_secs(5));
        assert_eq!(ts.values(), vec![1, 2, 3, 4, 5]);
        assert!(ts.is_completed());
    }

    #[test]
    fn test_timeout_fires_on_silent_source() {
        let scheduler: Arc<TimerScheduler> = Arc::new(TimerScheduler::new());
        let ts = TestSubscriber::<u64>::unbounded();
        // An interval far slower than the deadline never delivers in time.
        Flux::interval(Duration::from_secs(60), Arc::clone(&scheduler) as Arc<dyn Scheduler>)
            .timeout(Duration::from_millis(20), scheduler)
            .subscribe_with(ts.probe());

        ts.await_terminal(Duration::from_secs(5));
        assert_eq!(
            ts.error(),
            Some(StreamError::Timeout(Duration::from_millis(20)))
        );
        assert!(ts.values().is_empty());
    }

    #[test]
    fn test_timeout_measures_per_value_gaps() {
        let scheduler: Arc<TimerScheduler> = Arc::new(TimerScheduler::new());
        let ts = TestSubscriber::<u64>::unbounded();
        // Values every 10ms against a 200ms deadline: never times out.
        Flux::interval(
            Duration::from_millis(10),
            Arc::clone(&scheduler) as Arc<dyn Scheduler>,
        )
        .take(5)
        .timeout(Duration::from_millis(200), scheduler)
        .subscribe_with(ts.probe());

        ts.await_terminal(Duration::from_secs(5));
        assert_eq!(ts.values(), vec![0, 1, 2, 3, 4]);
        assert!(ts.is_completed());
    }
}
