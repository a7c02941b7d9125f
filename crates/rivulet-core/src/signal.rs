//! Signal and error types for the reactive protocol.
//!
//! A subscription carries a stream of signals: zero or more `Next` values
//! followed by at most one terminal signal (`Error` or `Complete`). The
//! at-most-one-terminal rule is the core invariant of the whole engine;
//! every stage enforces it with a terminal latch before touching its
//! downstream subscriber.
//!
//! Errors are cheaply cloneable ([`Arc<str>`] payloads) so that a recovery
//! stage and a `do_on_error` observer chained before it can both see the
//! same error without ownership gymnastics.

use std::sync::Arc;

// ---------------------------------------------------------------------------
// Signal
// ---------------------------------------------------------------------------

/// A single event in a subscription's signal stream.
#[derive(Debug, Clone, PartialEq)]
pub enum Signal<T> {
    /// A value emitted against previously requested demand.
    Next(T),
    /// Terminal failure. No further signals may follow.
    Error(StreamError),
    /// Terminal success. No further signals may follow.
    Complete,
}

impl<T> Signal<T> {
    /// Returns `true` for `Error` and `Complete`.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Next(_))
    }

    /// Returns the contained value if this is a `Next` signal.
    #[must_use]
    pub fn into_value(self) -> Option<T> {
        match self {
            Self::Next(v) => Some(v),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// StreamError
// ---------------------------------------------------------------------------

/// Terminal error carried by an `on_error` signal.
///
/// Cloneable so multiple observers (peek hooks, recovery stages, the
/// terminal subscriber) can inspect the same failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// The source publisher failed to produce.
    #[error("source error: {0}")]
    Source(Arc<str>),
    /// A user-supplied function (`map` transform, `zip` combiner, peek
    /// hook) failed or panicked inside an operator stage.
    #[error("transform error: {0}")]
    Transform(Arc<str>),
    /// A timer-driven producer fired while the subscriber had no
    /// outstanding demand.
    #[error("could not emit tick {0}: no outstanding demand")]
    Overflow(u64),
    /// A deadline elapsed before the upstream produced a signal.
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),
    /// The subscriber violated the subscription protocol.
    #[error("protocol violation: {0}")]
    Protocol(#[from] ProtocolViolation),
}

impl StreamError {
    /// Builds a `Source` error from any displayable cause.
    pub fn source(cause: impl std::fmt::Display) -> Self {
        Self::Source(Arc::from(cause.to_string().as_str()))
    }

    /// Builds a `Transform` error from any displayable cause.
    pub fn transform(cause: impl std::fmt::Display) -> Self {
        Self::Transform(Arc::from(cause.to_string().as_str()))
    }
}

// ---------------------------------------------------------------------------
// ProtocolViolation
// ---------------------------------------------------------------------------

/// Violations of the subscription protocol.
///
/// Reported to the offending subscriber via `on_error`; the producer keeps
/// running and sibling subscriptions are unaffected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolViolation {
    /// `request` was called with a demand of zero.
    #[error("request amount must be positive")]
    NonPositiveRequest,
    /// A signal was offered after a terminal signal had already fired.
    #[error("signal delivered after terminal signal")]
    SignalAfterTerminal,
}

// ===========================================================================
// Tests
// ===========================================================================
