//! # Rivulet Core
//!
//! A reactive-streams engine: composable asynchronous sequences with
//! demand-driven backpressure.
//!
//! This crate provides:
//! - **Publishers**: [`Flux`] (0..n values) and [`Mono`] (0..1 values),
//!   cheap to clone and re-subscribable
//! - **Operators**: map, flatMap, concat, merge, zip, take, limitRate,
//!   delayElements, timeout, error recovery, and peek hooks
//! - **Backpressure**: additive, saturating demand with an unbounded
//!   sentinel; no stage ever emits more than was requested
//! - **Schedulers**: pluggable execution contexts for timer-driven stages
//!
//! ## Protocol
//!
//! Every subscription follows the same discipline: `on_subscribe` first,
//! values only against requested demand, at most one terminal signal,
//! nothing after it. Cancellation is idempotent and races with in-flight
//! signals by swallowing them, never duplicating.
//!
//! ## Example
//!
//! ```rust
//! use rivulet_core::Flux;
//! use std::sync::{Arc, Mutex};
//!
//! let seen = Arc::new(Mutex::new(Vec::new()));
//! let sink = Arc::clone(&seen);
//! // A second subscription would replay the pipeline from the source.
//! let doubled = Flux::range(1, 5).map(|v| v * 2);
//! doubled.subscribe(move |v| sink.lock().unwrap().push(v));
//! assert_eq!(*seen.lock().unwrap(), vec![2, 4, 6, 8, 10]);
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

mod drain;
mod operator;
pub mod publisher;
pub mod scheduler;
pub mod signal;
mod source;
pub mod subscriber;
pub mod subscription;
pub mod testkit;

pub use publisher::{Flux, Mono, RawPublisher};
pub use scheduler::{ImmediateScheduler, Scheduler, TaskHandle, TimerScheduler};
pub use signal::{ProtocolViolation, Signal, StreamError};
pub use subscriber::{CallbackSubscriber, SerializedSubscriber, Subscriber};
pub use subscription::{Subscription, SubscriptionHandle, UNBOUNDED};
