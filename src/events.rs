//! Abstract events emitted at the boundary of a `run`.
//!
//! Subscribers are registered at loader construction and receive events
//! synchronously on the task driving the run. Delivery is best-effort: a
//! panicking subscriber is contained and the run continues.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use crate::outcome::OutcomeCounts;

/// Lifecycle of a single source within a `run`.
#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    /// The source is about to dispatch its pending batches.
    Start { source: String },
    /// The source finished; `counts` tallies the outcomes it produced.
    Stop { source: String, duration: Duration, counts: OutcomeCounts },
    /// A batch inside the source's dispatch failed as a whole: the backend or
    /// callback raised (an `Err` or a caught panic), a `run_batch` override
    /// broke its contract, or the per-batch deadline expired. Emitted in
    /// addition to the normal `Stop`. Item-level error values inside an
    /// otherwise successful batch are plain outcomes, not exceptions.
    Exception { source: String, cause: String },
}

impl RunEvent {
    pub fn source(&self) -> &str {
        match self {
            RunEvent::Start { source }
            | RunEvent::Stop { source, .. }
            | RunEvent::Exception { source, .. } => source,
        }
    }
}

/// An event callback. Must be fast; the run engine delivers synchronously.
pub type Subscriber = Arc<dyn Fn(&RunEvent) + Send + Sync>;

pub(crate) fn emit(subscribers: &[Subscriber], event: &RunEvent) {
    for subscriber in subscribers {
        if catch_unwind(AssertUnwindSafe(|| subscriber(event))).is_err() {
            tracing::warn!(source = event.source(), "event subscriber panicked");
        }
    }
}
