use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

/// Default dispatch fan-out: twice the logical CPU count.
pub(crate) fn default_concurrency() -> usize {
    std::thread::available_parallelism().map(|n| n.get() * 2).unwrap_or(4)
}

/// Renders a caught panic payload for the `error(cause)` outcome.
pub(crate) fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "batch dispatch panicked".to_owned()
    }
}

use crate::error::LoaderResult;
use crate::key::{BatchKey, Key};
use crate::outcome::{Outcome, OutcomeCounts};

/// What a source's `run` produced, for event reporting.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    /// Tallies of the outcomes appended to the result table by this run.
    pub counts: OutcomeCounts,
    /// Causes of whole-batch dispatch failures (backend/callback errors,
    /// caught panics, protocol violations, timeouts). Each triggers a
    /// `RunEvent::Exception` in addition to the normal `Stop`.
    pub exceptions: Vec<String>,
}

/// A pluggable backend adapter.
///
/// A source owns two tables: a *pending table* of item keys awaiting execution,
/// grouped by batch key, and a *result table* of outcomes keyed by
/// `(batch_key, item_key)`. `load` only mutates the pending table; `run`
/// drains it and appends to the result table; `fetch` reads the result table
/// and performs no I/O. Implementations decide how pending batches are grouped
/// and dispatched, as long as every pending item has an outcome once `run`
/// returns.
///
/// Result tables are monotonic for the life of the source: an outcome, once
/// recorded, is never overwritten by a later `run`.
#[async_trait]
pub trait Source: Send {
    /// Adds an item to the pending table under `batch`. Must be a no-op when
    /// the pair is already resolved.
    fn load(&mut self, batch: &BatchKey, item: &Key) -> LoaderResult<()>;

    /// Drains the pending table, producing an outcome for every pending item.
    ///
    /// `fallback_timeout` is the loader-level per-batch deadline, used when
    /// the source was not configured with its own.
    async fn run(&mut self, fallback_timeout: Duration) -> RunReport;

    /// Pure lookup over the result table. `Ok(None)` means the pair has no
    /// recorded outcome (never loaded, or loaded after the last `run`);
    /// `Err` reports caller mistakes such as a batch key this source cannot
    /// serve.
    fn fetch(&self, batch: &BatchKey, item: &Key) -> LoaderResult<Option<Outcome>>;

    /// True iff the pending table is non-empty.
    fn pending_batches(&self) -> bool;

    /// The source's own per-batch timeout, if configured.
    fn timeout(&self) -> Option<Duration>;

    /// Whether this source dispatches its batches concurrently.
    fn is_async(&self) -> bool;

    /// Records an `ok(value)` outcome out-of-band. Refuses to overwrite an
    /// already-resolved pair.
    fn prime(&mut self, batch: &BatchKey, item: &Key, value: Value) -> LoaderResult<()>;

    /// Forgets the outcome for a pair so it may be loaded again.
    fn clear(&mut self, batch: &BatchKey, item: &Key) -> LoaderResult<()>;
}
