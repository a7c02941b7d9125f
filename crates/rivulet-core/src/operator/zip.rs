//! Lock-step combination: one value from every source per emission.
//!
//! Each source runs at a request-one cadence: a source is asked for its
//! next value only when its previous one has been consumed into a pair,
//! so no source ever runs ahead by more than one buffered value per
//! pairing round. The stage completes as soon as any source is exhausted
//! with an empty buffer, cancelling the survivors; pairs already formed
//! are still delivered first through the [`DrainQueue`].

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::drain::DrainQueue;
use crate::operator::panic_message;
use crate::publisher::{Flux, RawPublisher};
use crate::signal::StreamError;
use crate::subscriber::Subscriber;
use crate::subscription::{HandleBag, SubscriptionHandle};

// ---------------------------------------------------------------------------
// Binary zip
// ---------------------------------------------------------------------------

pub(crate) struct ZipPublisher<A, B, O> {
    left: Flux<A>,
    right: Flux<B>,
    combiner: Arc<dyn Fn(A, B) -> O + Send + Sync>,
}

impl<A, B, O> ZipPublisher<A, B, O> {
    pub(crate) fn new(
        left: Flux<A>,
        right: Flux<B>,
        combiner: Arc<dyn Fn(A, B) -> O + Send + Sync>,
    ) -> Self {
        Self {
            left,
            right,
            combiner,
        }
    }
}

impl<A, B, O> RawPublisher<O> for ZipPublisher<A, B, O>
where
    A: Send + 'static,
    B: Send + 'static,
    O: Send + 'static,
{
    fn subscribe_raw(&self, subscriber: Box<dyn Subscriber<O>>) {
        let queue = DrainQueue::new(subscriber);
        let bag = Arc::new(HandleBag::new());
        let core = Arc::new(ZipCore {
            queue,
            bag: Arc::clone(&bag),
            combiner: Arc::clone(&self.combiner),
            state: Mutex::new(ZipBuffers::default()),
            wip: AtomicUsize::new(0),
        });

        core.queue.set_on_cancel(move || bag.cancel_all());
        core.queue.deliver_on_subscribe();

        self.left.subscribe_boxed(Box::new(ZipLeftSubscriber {
            core: Arc::clone(&core),
        }));
        self.right.subscribe_boxed(Box::new(ZipRightSubscriber { core }));
    }
}

struct ZipCore<A, B, O> {
    queue: DrainQueue<O>,
    bag: Arc<HandleBag>,
    combiner: Arc<dyn Fn(A, B) -> O + Send + Sync>,
    state: Mutex<ZipBuffers<A, B>>,
    /// Election counter for the pairing loop.
    wip: AtomicUsize,
}

struct ZipBuffers<A, B> {
    left: VecDeque<A>,
    right: VecDeque<B>,
    left_handle: Option<SubscriptionHandle>,
    right_handle: Option<SubscriptionHandle>,
    left_done: bool,
    right_done: bool,
}

impl<A, B> Default for ZipBuffers<A, B> {
    fn default() -> Self {
        Self {
            left: VecDeque::new(),
            right: VecDeque::new(),
            left_handle: None,
            right_handle: None,
            left_done: false,
            right_done: false,
        }
    }
}

impl<A, B, O> ZipCore<A, B, O>
where
    A: Send + 'static,
    B: Send + 'static,
    O: Send + 'static,
{
    fn fail(&self, error: StreamError) {
        self.bag.cancel_all();
        self.queue.error(error);
    }

    fn drain_pairs(&self) {
        if self.wip.fetch_add(1, Ordering::AcqRel) != 0 {
            return;
        }
        let mut missed = 1;
        loop {
            self.pair_pass();
            let previous = self.wip.fetch_sub(missed, Ordering::AcqRel);
            if previous == missed {
                return;
            }
            missed = previous - missed;
        }
    }

    fn pair_pass(&self) {
        loop {
            if self.queue.is_terminated() {
                return;
            }
            let (pair, refills, exhausted) = {
                let mut state = self.state.lock();
                let pair = if state.left.is_empty() || state.right.is_empty() {
                    None
                } else {
                    state.left.pop_front().zip(state.right.pop_front())
                };
                let exhausted = pair.is_none()
                    && ((state.left_done && state.left.is_empty())
                        || (state.right_done && state.right.is_empty()));
                let refills = (state.left_handle.clone(), state.right_handle.clone());
                (pair, refills, exhausted)
            };

            let Some((a, b)) = pair else {
                if exhausted {
                    self.bag.cancel_all();
                    self.queue.complete();
                }
                return;
            };

            let combiner = &self.combiner;
            match catch_unwind(AssertUnwindSafe(move || combiner(a, b))) {
                Ok(combined) => self.queue.push(combined),
                Err(payload) => {
                    self.fail(StreamError::transform(panic_message(payload.as_ref())));
                    return;
                }
            }
            if let Some(handle) = refills.0 {
                handle.request(1);
            }
            if let Some(handle) = refills.1 {
                handle.request(1);
            }
        }
    }
}

struct ZipLeftSubscriber<A, B, O> {
    core: Arc<ZipCore<A, B, O>>,
}

impl<A, B, O> Subscriber<A> for ZipLeftSubscriber<A, B, O>
where
    A: Send + 'static,
    B: Send + 'static,
    O: Send + 'static,
{
    fn on_subscribe(&mut self, subscription: SubscriptionHandle) {
        self.core.state.lock().left_handle = Some(subscription.clone());
        self.core.bag.add(subscription.clone());
        subscription.request(1);
    }

    fn on_next(&mut self, value: A) {
        self.core.state.lock().left.push_back(value);
        self.core.drain_pairs();
    }

    fn on_error(&mut self, error: StreamError) {
        self.core.fail(error);
    }

    fn on_complete(&mut self) {
        self.core.state.lock().left_done = true;
        self.core.drain_pairs();
    }
}

struct ZipRightSubscriber<A, B, O> {
    core: Arc<ZipCore<A, B, O>>,
}

impl<A, B, O> Subscriber<B> for ZipRightSubscriber<A, B, O>
where
    A: Send + 'static,
    B: Send + 'static,
    O: Send + 'static,
{
    fn on_subscribe(&mut self, subscription: SubscriptionHandle) {
        self.core.state.lock().right_handle = Some(subscription.clone());
        self.core.bag.add(subscription.clone());
        subscription.request(1);
    }

    fn on_next(&mut self, value: B) {
        self.core.state.lock().right.push_back(value);
        self.core.drain_pairs();
    }

    fn on_error(&mut self, error: StreamError) {
        self.core.fail(error);
    }

    fn on_complete(&mut self) {
        self.core.state.lock().right_done = true;
        self.core.drain_pairs();
    }
}

// ---------------------------------------------------------------------------
// N-ary homogeneous zip
// ---------------------------------------------------------------------------

pub(crate) struct ZipAllPublisher<T, O> {
    sources: Arc<Vec<Flux<T>>>,
    combiner: Arc<dyn Fn(Vec<T>) -> O + Send + Sync>,
}

impl<T, O> ZipAllPublisher<T, O> {
    pub(crate) fn new(
        sources: Vec<Flux<T>>,
        combiner: Arc<dyn Fn(Vec<T>) -> O + Send + Sync>,
    ) -> Self {
        Self {
            sources: Arc::new(sources),
            combiner,
        }
    }
}

impl<T, O> RawPublisher<O> for ZipAllPublisher<T, O>
where
    T: Send + 'static,
    O: Send + 'static,
{
    fn subscribe_raw(&self, subscriber: Box<dyn Subscriber<O>>) {
        let queue = DrainQueue::new(subscriber);
        let bag = Arc::new(HandleBag::new());
        let width = self.sources.len();
        let core = Arc::new(ZipAllCore {
            queue,
            bag: Arc::clone(&bag),
            combiner: Arc::clone(&self.combiner),
            state: Mutex::new(ZipAllBuffers {
                buffers: (0..width).map(|_| VecDeque::new()).collect(),
                handles: vec![None; width],
                done: vec![false; width],
            }),
            wip: AtomicUsize::new(0),
        });

        core.queue.set_on_cancel(move || bag.cancel_all());
        core.queue.deliver_on_subscribe();

        if width == 0 {
            core.queue.complete();
            return;
        }
        for (index, source) in self.sources.iter().enumerate() {
            source.subscribe_boxed(Box::new(ZipAllSubscriber {
                core: Arc::clone(&core),
                index,
            }));
        }
    }
}

struct ZipAllCore<T, O> {
    queue: DrainQueue<O>,
    bag: Arc<HandleBag>,
    combiner: Arc<dyn Fn(Vec<T>) -> O + Send + Sync>,
    state: Mutex<ZipAllBuffers<T>>,
    wip: AtomicUsize,
}

struct ZipAllBuffers<T> {
    buffers: Vec<VecDeque<T>>,
    handles: Vec<Option<SubscriptionHandle>>,
    done: Vec<bool>,
}

impl<T, O> ZipAllCore<T, O>
where
    T: Send + 'static,
    O: Send + 'static,
{
    fn fail(&self, error: StreamError) {
        self.bag.cancel_all();
        self.queue.error(error);
    }

    fn drain_rows(&self) {
        if self.wip.fetch_add(1, Ordering::AcqRel) != 0 {
            return;
        }
        let mut missed = 1;
        loop {
            self.row_pass();
            let previous = self.wip.fetch_sub(missed, Ordering::AcqRel);
            if previous == missed {
                return;
            }
            missed = previous - missed;
        }
    }

    fn row_pass(&self) {
        loop {
            if self.queue.is_terminated() {
                return;
            }
            let (row, refills, exhausted) = {
                let mut state = self.state.lock();
                if state.buffers.iter().all(|b| !b.is_empty()) {
                    let row: Vec<T> = state
                        .buffers
                        .iter_mut()
                        .filter_map(VecDeque::pop_front)
                        .collect();
                    (Some(row), state.handles.clone(), false)
                } else {
                    let exhausted = state
                        .buffers
                        .iter()
                        .zip(&state.done)
                        .any(|(buffer, done)| *done && buffer.is_empty());
                    (None, Vec::new(), exhausted)
                }
            };

            let Some(row) = row else {
                if exhausted {
                    self.bag.cancel_all();
                    self.queue.complete();
                }
                return;
            };

            let combiner = &self.combiner;
            match catch_unwind(AssertUnwindSafe(move || combiner(row))) {
                Ok(combined) => self.queue.push(combined),
                Err(payload) => {
                    self.fail(StreamError::transform(panic_message(payload.as_ref())));
                    return;
                }
            }
            for handle in refills.into_iter().flatten() {
                handle.request(1);
            }
        }
    }
}

struct ZipAllSubscriber<T, O> {
    core: Arc<ZipAllCore<T, O>>,
    index: usize,
}

impl<T, O> Subscriber<T> for ZipAllSubscriber<T, O>
where
    T: Send + 'static,
    O: Send + 'static,
{
    fn on_subscribe(&mut self, subscription: SubscriptionHandle) {
        self.core.state.lock().handles[self.index] = Some(subscription.clone());
        self.core.bag.add(subscription.clone());
        subscription.request(1);
    }

    fn on_next(&mut self, value: T) {
        self.core.state.lock().buffers[self.index].push_back(value);
        self.core.drain_rows();
    }

    fn on_error(&mut self, error: StreamError) {
        self.core.fail(error);
    }

    fn on_complete(&mut self) {
        self.core.state.lock().done[self.index] = true;
        self.core.drain_rows();
    }
}
