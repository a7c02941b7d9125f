//! Operator stages.
//!
//! Each stage is a publisher wrapping an upstream publisher plus a
//! subscriber wrapping the downstream subscriber; it owns only the
//! transient state its contract needs (a counter for `take`, per-source
//! buffers for `zip`, a drain queue for `merge`/`flat_map`/`limit_rate`).
//! User-supplied functions never run unprotected: a panic inside a
//! transform, combiner, or peek hook becomes `StreamError::Transform` and
//! cancels upstream.

pub(crate) mod concat;
pub(crate) mod delay;
pub(crate) mod flat_map;
pub(crate) mod limit_rate;
pub(crate) mod map;
pub(crate) mod merge;
pub(crate) mod peek;
pub(crate) mod recover;
pub(crate) mod subscribe_on;
pub(crate) mod take;
pub(crate) mod timeout;
pub(crate) mod zip;

use std::any::Any;

/// Best-effort extraction of a panic payload for error reporting.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic in user-supplied function".to_string()
    }
}
