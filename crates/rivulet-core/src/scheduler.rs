//! Scheduler abstraction: where deferred and periodic work runs.
//!
//! The engine never assumes a threading model. The only stages that
//! consult a [`Scheduler`] are `interval`, `delay_elements`, `timeout`,
//! and `subscribe_on`; everything else is synchronous. Cancelling the
//! owning subscription cancels pending [`TaskHandle`]s, so no timer
//! outlives the subscription that scheduled it.
//!
//! Two implementations:
//!
//! - [`ImmediateScheduler`] — runs work inline on the calling context.
//! - [`TimerScheduler`] — one dedicated worker thread draining a
//!   deadline-ordered heap, parked on a condvar between deadlines.
//!   Entries with equal deadlines run in submission order, which is what
//!   keeps `delay_elements` order-preserving.

use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;

// ---------------------------------------------------------------------------
// TaskHandle
// ---------------------------------------------------------------------------

/// Cancellation handle for a scheduled task.
///
/// `cancel` is idempotent; a task observed cancelled before it fires is
/// skipped by the worker. Periodic tasks stop rescheduling once cancelled.
#[derive(Clone, Debug)]
pub struct TaskHandle {
    cancelled: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
}

impl TaskHandle {
    fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            finished: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Handle for work that already ran (or will never run).
    #[must_use]
    pub fn finished() -> Self {
        let handle = Self::new();
        handle.finished.store(true, Ordering::Release);
        handle
    }

    /// Prevents the task from firing (or firing again, for periodic work).
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Returns `true` once `cancel` has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Returns `true` once a one-shot task has run to completion.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    fn mark_finished(&self) {
        self.finished.store(true, Ordering::Release);
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Execution-context abstraction for deferred work.
pub trait Scheduler: Send + Sync {
    /// Runs `task` on this scheduler's context as soon as possible.
    fn schedule_now(&self, task: Box<dyn FnOnce() + Send>);

    /// Runs `task` once after `delay`.
    fn schedule_after(&self, delay: Duration, task: Box<dyn FnOnce() + Send>) -> TaskHandle;

    /// Runs `task` every `period`, first fire one period from now.
    fn schedule_periodic(&self, period: Duration, task: Box<dyn FnMut() + Send>) -> TaskHandle;
}

// ---------------------------------------------------------------------------
// ImmediateScheduler
// ---------------------------------------------------------------------------

/// Runs everything inline on the calling context, ignoring delays.
///
/// Useful in tests and wherever "the current context" is the right place
/// for work. Periodic scheduling is not expressible inline; the task runs
/// exactly once and the returned handle is already finished.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImmediateScheduler;

impl Scheduler for ImmediateScheduler {
    fn schedule_now(&self, task: Box<dyn FnOnce() + Send>) {
        task();
    }

    fn schedule_after(&self, _delay: Duration, task: Box<dyn FnOnce() + Send>) -> TaskHandle {
        task();
        TaskHandle::finished()
    }

    fn schedule_periodic(&self, _period: Duration, mut task: Box<dyn FnMut() + Send>) -> TaskHandle {
        task();
        TaskHandle::finished()
    }
}

// ---------------------------------------------------------------------------
// TimerScheduler
// ---------------------------------------------------------------------------

enum TaskKind {
    Once(Box<dyn FnOnce() + Send>),
    Periodic {
        period: Duration,
        task: Box<dyn FnMut() + Send>,
    },
}

struct TimerEntry {
    deadline: Instant,
    seq: u64,
    handle: TaskHandle,
    kind: TaskKind,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    // Reversed so the BinaryHeap pops the earliest deadline; seq breaks
    // ties in submission order.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct TimerState {
    queue: BinaryHeap<TimerEntry>,
    shutdown: bool,
    seq: u64,
}

struct TimerInner {
    state: Mutex<TimerState>,
    condvar: Condvar,
}

/// Timer-driven scheduler backed by one dedicated worker thread.
///
/// Dropping the scheduler shuts the worker down; tasks still pending at
/// shutdown are discarded.
pub struct TimerScheduler {
    inner: Arc<TimerInner>,
    worker: Option<std::thread::JoinHandle<()>>,
}

impl TimerScheduler {
    /// Spawns the worker thread and returns the scheduler.
    #[must_use]
    pub fn new() -> Self {
        let inner = Arc::new(TimerInner {
            state: Mutex::new(TimerState {
                queue: BinaryHeap::new(),
                shutdown: false,
                seq: 0,
            }),
            condvar: Condvar::new(),
        });
        let worker_inner = Arc::clone(&inner);
        let worker = std::thread::Builder::new()
            .name("rivulet-timer".into())
            .spawn(move || Self::run(&worker_inner))
            .expect("failed to spawn timer worker thread");
        tracing::debug!("timer scheduler started");
        Self {
            inner,
            worker: Some(worker),
        }
    }

    fn submit(&self, deadline: Instant, kind: TaskKind) -> TaskHandle {
        let handle = TaskHandle::new();
        {
            let mut state = self.inner.state.lock();
            if state.shutdown {
                tracing::warn!("task submitted after timer scheduler shutdown; dropped");
                handle.cancel();
                return handle;
            }
            state.seq += 1;
            let seq = state.seq;
            state.queue.push(TimerEntry {
                deadline,
                seq,
                handle: handle.clone(),
                kind,
            });
        }
        self.inner.condvar.notify_one();
        handle
    }

    fn run(inner: &Arc<TimerInner>) {
        let mut state = inner.state.lock();
        loop {
            if state.shutdown {
                return;
            }
            let now = Instant::now();
            let due = match state.queue.peek() {
                None => {
                    inner.condvar.wait(&mut state);
                    continue;
                }
                Some(entry) if entry.deadline > now => {
                    let deadline = entry.deadline;
                    inner.condvar.wait_until(&mut state, deadline);
                    continue;
                }
                Some(_) => state.queue.pop().expect("peeked entry vanished"),
            };

            // Run the task without holding the lock so it can schedule
            // more work (delay stages chain onto the worker context).
            drop(state);
            let repeat = Self::fire(due);
            state = inner.state.lock();
            if let Some(entry) = repeat {
                if !state.shutdown {
                    state.seq += 1;
                    let seq = state.seq;
                    state.queue.push(TimerEntry { seq, ..entry });
                }
            }
        }
    }

    fn fire(entry: TimerEntry) -> Option<TimerEntry> {
        if entry.handle.is_cancelled() {
            return None;
        }
        match entry.kind {
            TaskKind::Once(task) => {
                task();
                entry.handle.mark_finished();
                None
            }
            TaskKind::Periodic { period, mut task } => {
                task();
                if entry.handle.is_cancelled() {
                    None
                } else {
                    Some(TimerEntry {
                        deadline: entry.deadline + period,
                        seq: 0, // reassigned under the lock
                        handle: entry.handle,
                        kind: TaskKind::Periodic { period, task },
                    })
                }
            }
        }
    }
}

impl Default for TimerScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for TimerScheduler {
    fn schedule_now(&self, task: Box<dyn FnOnce() + Send>) {
        self.submit(Instant::now(), TaskKind::Once(task));
    }

    fn schedule_after(&self, delay: Duration, task: Box<dyn FnOnce() + Send>) -> TaskHandle {
        self.submit(Instant::now() + delay, TaskKind::Once(task))
    }

    fn schedule_periodic(&self, period: Duration, task: Box<dyn FnMut() + Send>) -> TaskHandle {
        self.submit(Instant::now() + period, TaskKind::Periodic { period, task })
    }
}

impl Drop for TimerScheduler {
    fn drop(&mut self) {
        self.inner.state.lock().shutdown = true;
        self.inner.condvar.notify_one();
        if let Some(worker) = self.worker.take() {
            // A scheduled task can hold the last reference to the
            // scheduler, in which case this drop runs on the worker
            // itself; the worker exits on the shutdown flag, so only
            // other threads wait for it.
            if worker.thread().id() == std::thread::current().id() {
                return;
            }
            let _ = worker.join();
        }
        tracing::debug!("timer scheduler stopped");
    }
}

// ---------------------------------------------------------------------------
// TaskBag
// ---------------------------------------------------------------------------

/// Pending task handles owned by one subscription.
///
/// Stages that schedule per-value work (`delay_elements`) park the handles
/// here so a downstream cancel can sweep every pending timer. Finished
/// entries are pruned on insert to keep the bag small.
#[derive(Default)]
pub(crate) struct TaskBag {
    inner: Mutex<TaskBagState>,
}

#[derive(Default)]
struct TaskBagState {
    handles: SmallVec<[TaskHandle; 4]>,
    cancelled: bool,
}

impl TaskBag {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Adds a handle; cancels it immediately if the bag is already closed.
    pub(crate) fn add(&self, handle: TaskHandle) {
        let cancel_now = {
            let mut state = self.inner.lock();
            if state.cancelled {
                true
            } else {
                state.handles.retain(|h| !h.is_finished() && !h.is_cancelled());
                state.handles.push(handle.clone());
                false
            }
        };
        if cancel_now {
            handle.cancel();
        }
    }

    /// Cancels every pending handle and closes the bag.
    pub(crate) fn cancel_all(&self) {
        let handles = {
            let mut state = self.inner.lock();
            state.cancelled = true;
            std::mem::take(&mut state.handles)
        };
        for handle in handles {
            handle.cancel();
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_immediate_runs_inline() {
        let ran = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&ran);
        ImmediateScheduler.schedule_now(Box::new(move || {
            r.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_timer_one_shot_fires() {
        let scheduler = TimerScheduler::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&ran);
        let handle = scheduler.schedule_after(
            Duration::from_millis(10),
            Box::new(move || {
                r.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let deadline = Instant::now() + Duration::from_secs(5);
        while !handle.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_timer_cancel_before_fire() {
        let scheduler = TimerScheduler::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&ran);
        let handle = scheduler.schedule_after(
            Duration::from_millis(100),
            Box::new(move || {
                r.fetch_add(1, Ordering::SeqCst);
            }),
        );
        handle.cancel();
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert!(!handle.is_finished());
    }

    #[test]
    fn test_timer_periodic_repeats_until_cancel() {
        let scheduler = TimerScheduler::new();
        let ticks = Arc::new(AtomicUsize::new(0));
        let t = Arc::clone(&ticks);
        let handle = scheduler.schedule_periodic(
            Duration::from_millis(5),
            Box::new(move || {
                t.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let deadline = Instant::now() + Duration::from_secs(5);
        while ticks.load(Ordering::SeqCst) < 3 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        handle.cancel();
        let settled = ticks.load(Ordering::SeqCst);
        assert!(settled >= 3);
        std::thread::sleep(Duration::from_millis(50));
        // At most one tick already in flight when cancel landed.
        assert!(ticks.load(Ordering::SeqCst) <= settled + 1);
    }

    #[test]
    fn test_timer_equal_deadlines_run_in_submission_order() {
        let scheduler = TimerScheduler::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        // One shared deadline so every entry ties and only the sequence
        // number decides the order.
        let shared = Instant::now() + Duration::from_millis(20);

        for i in 0..5 {
            let o = Arc::clone(&order);
            scheduler.submit(
                shared,
                TaskKind::Once(Box::new(move || {
                    o.lock().push(i);
                })),
            );
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        while order.lock().len() < 5 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_worker_may_drop_the_last_scheduler_reference() {
        let ran = Arc::new(AtomicUsize::new(0));
        let scheduler = Arc::new(TimerScheduler::new());
        let r = Arc::clone(&ran);
        let held = Arc::clone(&scheduler);
        scheduler.schedule_after(
            Duration::from_millis(10),
            Box::new(move || {
                r.fetch_add(1, Ordering::SeqCst);
                drop(held);
            }),
        );
        drop(scheduler);

        let deadline = Instant::now() + Duration::from_secs(5);
        while ran.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_shutdown_discards_pending_tasks() {
        let ran = Arc::new(AtomicUsize::new(0));
        {
            let scheduler = TimerScheduler::new();
            let r = Arc::clone(&ran);
            scheduler.schedule_after(
                Duration::from_secs(60),
                Box::new(move || {
                    r.fetch_add(1, Ordering::SeqCst);
                }),
            );
        }
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_task_bag_sweeps_pending_timers() {
        let scheduler = TimerScheduler::new();
        let bag = TaskBag::new();
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let r = Arc::clone(&ran);
            bag.add(scheduler.schedule_after(
                Duration::from_millis(100),
                Box::new(move || {
                    r.fetch_add(1, Ordering::SeqCst);
                }),
            ));
        }
        bag.cancel_all();
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(ran.load(Ordering::SeqCst), 0);

        // Late additions are cancelled on entry.
        let r = Arc::clone(&ran);
        bag.add(scheduler.schedule_after(
            Duration::from_millis(10),
            Box::new(move || {
                r.fetch_add(1, Ordering::SeqCst);
            }),
        ));
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }
}
