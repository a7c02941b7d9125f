//! End-to-end pipeline properties over synchronous sources.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use rivulet_core::testkit::TestSubscriber;
use rivulet_core::{Flux, Mono, StreamError};

#[test]
fn test_map_pipeline_replays_per_subscription() {
    let subscriptions = Arc::new(AtomicUsize::new(0));
    let s = Arc::clone(&subscriptions);
    let pipeline = Flux::from_iterable(move || {
        s.fetch_add(1, Ordering::SeqCst);
        1..=5
    })
    .map(|v| v * 10);

    for _ in 0..3 {
        let ts = TestSubscriber::unbounded();
        pipeline.subscribe_with(ts.probe());
        assert_eq!(ts.values(), vec![10, 20, 30, 40, 50]);
        assert!(ts.is_completed());
    }
    assert_eq!(subscriptions.load(Ordering::SeqCst), 3);
}

#[test]
fn test_zip_produces_expected_pairs() {
    let ts = TestSubscriber::unbounded();
    Flux::zip(Flux::range(1, 5), Flux::range(6, 5), |a, b| (a, b)).subscribe_with(ts.probe());
    assert_eq!(ts.values(), vec![(1, 6), (2, 7), (3, 8), (4, 9), (5, 10)]);
    assert!(ts.is_completed());
}

#[test]
fn test_on_error_return_caps_a_failing_pipeline() {
    let ts = TestSubscriber::unbounded();
    Flux::range(1, 3)
        .concat_with(Flux::error(StreamError::source("upstream gone")))
        .map(|v| v * 2)
        .on_error_return(0)
        .subscribe_with(ts.probe());
    assert_eq!(ts.values(), vec![2, 4, 6, 0]);
    assert!(ts.is_completed());
}

#[test]
fn test_delivery_never_exceeds_demand_across_operators() {
    let pipelines: Vec<(&str, Flux<i64>)> = vec![
        ("map", Flux::range(1, 20).map(|v| v + 1)),
        ("take", Flux::range(1, 20).take(10)),
        ("limit_rate", Flux::range(1, 20).limit_rate(4)),
        (
            "concat",
            Flux::concat(vec![Flux::range(1, 10), Flux::range(11, 10)]),
        ),
        (
            "merge",
            Flux::merge(vec![Flux::range(1, 10), Flux::range(11, 10)]),
        ),
        (
            "zip",
            Flux::zip(Flux::range(1, 20), Flux::range(1, 20), |a, b| a + b),
        ),
        (
            "flat_map",
            Flux::range(1, 5).flat_map(|v| Flux::range(v * 10, 4)),
        ),
    ];

    for (name, pipeline) in pipelines {
        let ts = TestSubscriber::with_initial_request(3);
        pipeline.subscribe_with(ts.probe());
        assert_eq!(ts.values().len(), 3, "{name} overdelivered");
        ts.request(2);
        assert_eq!(ts.values().len(), 5, "{name} ignored added demand");
    }
}

#[test]
fn test_no_signal_after_error_terminal() {
    let after_terminal = Arc::new(AtomicBool::new(false));
    let terminal_seen = Arc::new(AtomicBool::new(false));

    let at = Arc::clone(&after_terminal);
    let term = Arc::clone(&terminal_seen);
    Flux::merge(vec![
        Flux::range(1, 5),
        Flux::error(StreamError::source("poisoned")),
        Flux::range(6, 5),
    ])
    .subscribe_full(
        move |_| {
            if term.load(Ordering::SeqCst) {
                at.store(true, Ordering::SeqCst);
            }
        },
        {
            let term = Arc::clone(&terminal_seen);
            move |_| {
                term.store(true, Ordering::SeqCst);
            }
        },
        {
            let term = Arc::clone(&terminal_seen);
            move || {
                term.store(true, Ordering::SeqCst);
            }
        },
    );

    assert!(terminal_seen.load(Ordering::SeqCst));
    assert!(!after_terminal.load(Ordering::SeqCst));
}

#[test]
fn test_flat_map_many_bridges_mono_to_flux() {
    let ts = TestSubscriber::unbounded();
    Mono::just(3)
        .flat_map_many(|n| Flux::from_iterable(move || (1..=n)))
        .map(|v| v * 100)
        .subscribe_with(ts.probe());
    assert_eq!(ts.values(), vec![100, 200, 300]);
    assert!(ts.is_completed());
}

#[test]
fn test_peek_hooks_observe_a_full_lifecycle() {
    let subscribed = Arc::new(AtomicUsize::new(0));
    let nexts = Arc::new(AtomicUsize::new(0));
    let completes = Arc::new(AtomicUsize::new(0));
    let requests = Arc::new(Mutex::new(Vec::new()));

    let s = Arc::clone(&subscribed);
    let n = Arc::clone(&nexts);
    let c = Arc::clone(&completes);
    let r = Arc::clone(&requests);

    let ts = TestSubscriber::with_initial_request(2);
    Flux::range(1, 2)
        .do_on_subscribe(move |_| {
            s.fetch_add(1, Ordering::SeqCst);
        })
        .do_on_next(move |_| {
            n.fetch_add(1, Ordering::SeqCst);
        })
        .do_on_request(move |amount| r.lock().push(amount))
        .do_on_complete(move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
        .subscribe_with(ts.probe());

    assert_eq!(subscribed.load(Ordering::SeqCst), 1);
    assert_eq!(nexts.load(Ordering::SeqCst), 2);
    assert_eq!(completes.load(Ordering::SeqCst), 1);
    assert_eq!(*requests.lock(), vec![2]);
}

#[test]
fn test_log_stage_is_transparent() {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let ts = TestSubscriber::unbounded();
    Flux::range(1, 3)
        .log()
        .map(|v| v + 1)
        .log()
        .subscribe_with(ts.probe());
    assert_eq!(ts.values(), vec![2, 3, 4]);
    assert!(ts.is_completed());
}

#[test]
fn test_error_propagates_through_transform_chain() {
    let observed = Arc::new(Mutex::new(None));
    let o = Arc::clone(&observed);
    let ts = TestSubscriber::<i64>::unbounded();
    Flux::<i64>::error(StreamError::source("root cause"))
        .map(|v| v + 1)
        .take(10)
        .do_on_error(move |e| *o.lock() = Some(e.clone()))
        .subscribe_with(ts.probe());

    assert_eq!(ts.error(), Some(StreamError::source("root cause")));
    assert_eq!(*observed.lock(), Some(StreamError::source("root cause")));
}
