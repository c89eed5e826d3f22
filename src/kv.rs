//! A source backed by an arbitrary user fetch callback.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use serde_json::Value;
use tracing::debug;

use crate::error::{BatchError, BoxError, LoaderError, LoaderResult};
use crate::key::{BatchKey, Key};
use crate::outcome::Outcome;
use crate::source::{default_concurrency, panic_message, RunReport, Source};

/// Per-item results returned by a KV fetch callback.
///
/// Present `Ok` values become `ok(value)` outcomes, present `Err` values
/// become `error(cause)` outcomes for that item alone, and requested keys
/// absent from the map become `not_found`. Keys the batch never asked for are
/// discarded.
pub type KvResults = HashMap<Key, Result<Value, BoxError>>;

/// The user fetch callback: receives the batch tag and the deduplicated item
/// keys accumulated under it, and resolves them in one shot.
///
/// Returning `Err` at this level (or panicking, or exceeding the batch
/// timeout) fails every item in the batch.
pub type KvFetchFn =
    Arc<dyn Fn(Key, Vec<Key>) -> BoxFuture<'static, Result<KvResults, BoxError>> + Send + Sync>;

/// Options for a [`KvSource`].
#[derive(Clone)]
pub struct KvOptions {
    /// Upper bound on concurrently executing batches.
    pub max_concurrency: usize,
    /// Per-batch deadline. `None` defers to the loader's timeout.
    pub timeout: Option<Duration>,
    /// When false, batches run sequentially on the calling task.
    pub concurrent: bool,
}

impl Default for KvOptions {
    fn default() -> Self {
        Self {
            max_concurrency: default_concurrency(),
            timeout: Some(Duration::from_secs(30)),
            concurrent: true,
        }
    }
}

/// A [`Source`] that batches item keys per tag and hands each batch to a user
/// callback.
///
/// The pending table groups item keys under their batch tag; `run` invokes the
/// callback once per tag, with batches dispatched concurrently up to
/// `max_concurrency`. The callback is free to resolve keys however it likes —
/// the source only interprets the returned mapping.
pub struct KvSource {
    fetch: KvFetchFn,
    options: KvOptions,
    pending: HashMap<Key, HashSet<Key>>,
    results: HashMap<Key, HashMap<Key, Outcome>>,
}

impl std::fmt::Debug for KvSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvSource").finish_non_exhaustive()
    }
}

impl KvSource {
    /// Creates a source with default options from any compatible closure.
    pub fn new<F>(fetch: F) -> Self
    where
        F: Fn(Key, Vec<Key>) -> BoxFuture<'static, Result<KvResults, BoxError>>
            + Send
            + Sync
            + 'static,
    {
        Self {
            fetch: Arc::new(fetch),
            options: KvOptions::default(),
            pending: HashMap::new(),
            results: HashMap::new(),
        }
    }

    /// Creates a source with explicit options.
    pub fn with_options<F>(fetch: F, options: KvOptions) -> LoaderResult<Self>
    where
        F: Fn(Key, Vec<Key>) -> BoxFuture<'static, Result<KvResults, BoxError>>
            + Send
            + Sync
            + 'static,
    {
        if options.max_concurrency == 0 {
            return Err(LoaderError::config("max_concurrency must be at least 1"));
        }
        if options.timeout == Some(Duration::ZERO) {
            return Err(LoaderError::config("timeout must be non-zero"));
        }
        let mut source = Self::new(fetch);
        source.options = options;
        Ok(source)
    }

    fn tag<'a>(&self, batch: &'a BatchKey) -> LoaderResult<&'a Key> {
        match batch {
            BatchKey::Kv(tag) => Ok(tag),
            other => {
                Err(LoaderError::config(format!("kv source cannot serve batch key {other}")))
            }
        }
    }

    fn resolved(&self, tag: &Key, item: &Key) -> bool {
        self.results.get(tag).is_some_and(|slot| slot.contains_key(item))
    }
}

/// Outcomes for one dispatched batch, aligned with its input items.
struct BatchResult {
    tag: Key,
    items: Vec<Key>,
    outcomes: Vec<Outcome>,
    exception: Option<String>,
}

async fn dispatch(fetch: KvFetchFn, tag: Key, items: Vec<Key>, deadline: Duration) -> BatchResult {
    let call = std::panic::AssertUnwindSafe(fetch(tag.clone(), items.clone())).catch_unwind();
    // Whole-batch failures (timeout, panic, batch-level Err) carry a cause so
    // the run engine can emit its exception event; item-level errors inside a
    // successful mapping are plain outcomes.
    let (outcomes, exception) = match tokio::time::timeout(deadline, call).await {
        Err(_) => {
            let error = BatchError::Timeout { timeout: deadline };
            let cause = error.to_string();
            (vec![Outcome::Error(error); items.len()], Some(cause))
        }
        Ok(Err(panic)) => {
            let cause = panic_message(panic);
            let err = Outcome::Error(BatchError::Backend { message: cause.clone() });
            (vec![err; items.len()], Some(cause))
        }
        Ok(Ok(Err(error))) => {
            let cause = error.to_string();
            let err = Outcome::Error(BatchError::Backend { message: cause.clone() });
            (vec![err; items.len()], Some(cause))
        }
        Ok(Ok(Ok(mut values))) => {
            let outcomes = items
                .iter()
                .map(|item| match values.remove(item) {
                    Some(Ok(value)) => Outcome::Ok(value),
                    Some(Err(error)) => Outcome::Error(BatchError::backend(error)),
                    None => Outcome::NotFound,
                })
                .collect();
            (outcomes, None)
        }
    };
    BatchResult { tag, items, outcomes, exception }
}

#[async_trait]
impl Source for KvSource {
    fn load(&mut self, batch: &BatchKey, item: &Key) -> LoaderResult<()> {
        let tag = self.tag(batch)?.clone();
        if self.resolved(&tag, item) {
            return Ok(());
        }
        self.pending.entry(tag).or_default().insert(item.clone());
        Ok(())
    }

    async fn run(&mut self, fallback_timeout: Duration) -> RunReport {
        let pending = std::mem::take(&mut self.pending);
        let deadline = self.options.timeout.unwrap_or(fallback_timeout);
        let limit = if self.options.concurrent { self.options.max_concurrency } else { 1 };

        let fetch = self.fetch.clone();
        let dispatches = pending
            .into_iter()
            .map(|(tag, items)| dispatch(fetch.clone(), tag, items.into_iter().collect(), deadline));

        let mut report = RunReport::default();
        let mut stream = stream::iter(dispatches).buffer_unordered(limit);
        while let Some(batch) = stream.next().await {
            debug!(tag = %batch.tag, items = batch.items.len(), "kv batch resolved");
            let slot = self.results.entry(batch.tag).or_default();
            for (item, outcome) in batch.items.into_iter().zip(batch.outcomes) {
                if let Entry::Vacant(cell) = slot.entry(item) {
                    report.counts.record(&outcome);
                    cell.insert(outcome);
                }
            }
            if let Some(cause) = batch.exception {
                report.exceptions.push(cause);
            }
        }
        report
    }

    fn fetch(&self, batch: &BatchKey, item: &Key) -> LoaderResult<Option<Outcome>> {
        let tag = self.tag(batch)?;
        Ok(self.results.get(tag).and_then(|slot| slot.get(item)).cloned())
    }

    fn pending_batches(&self) -> bool {
        !self.pending.is_empty()
    }

    fn timeout(&self) -> Option<Duration> {
        self.options.timeout
    }

    fn is_async(&self) -> bool {
        self.options.concurrent
    }

    fn prime(&mut self, batch: &BatchKey, item: &Key, value: Value) -> LoaderResult<()> {
        let tag = self.tag(batch)?.clone();
        self.results.entry(tag).or_default().entry(item.clone()).or_insert(Outcome::Ok(value));
        Ok(())
    }

    fn clear(&mut self, batch: &BatchKey, item: &Key) -> LoaderResult<()> {
        let tag = self.tag(batch)?;
        if let Some(slot) = self.results.get_mut(tag) {
            slot.remove(item);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use futures::FutureExt;
    use serde_json::json;

    use super::*;

    fn identity_source() -> KvSource {
        KvSource::new(|_tag, items: Vec<Key>| {
            async move {
                Ok(items.into_iter().map(|k| (k.clone(), Ok(k.into_value()))).collect::<KvResults>())
            }
            .boxed()
        })
    }

    #[test]
    fn load_rejects_foreign_batch_keys() {
        let mut source = identity_source();
        let err = source.load(&BatchKey::entity("User"), &Key::from(1)).unwrap_err();
        assert!(matches!(err, LoaderError::Config { .. }));
    }

    #[test]
    fn zero_concurrency_is_a_config_error() {
        let options = KvOptions { max_concurrency: 0, ..KvOptions::default() };
        let err = KvSource::with_options(
            |_t, _i| async move { Ok(KvResults::new()) }.boxed(),
            options,
        )
        .unwrap_err();
        assert!(matches!(err, LoaderError::Config { .. }));
    }

    #[tokio::test]
    async fn duplicate_loads_resolve_once() {
        let mut source = identity_source();
        let batch = BatchKey::kv("users");
        source.load(&batch, &Key::from(1)).unwrap();
        source.load(&batch, &Key::from(1)).unwrap();
        source.load(&batch, &Key::from(2)).unwrap();

        let report = source.run(Duration::from_secs(5)).await;
        assert_eq!(report.counts.ok, 2);
        assert_eq!(source.fetch(&batch, &Key::from(1)).unwrap(), Some(Outcome::Ok(json!(1))));
    }

    #[tokio::test]
    async fn absent_keys_are_not_found_and_extras_are_discarded() {
        let mut source = KvSource::new(|_tag, _items| {
            async move {
                let mut results = KvResults::new();
                results.insert(Key::from("kept"), Ok(json!("v")));
                results.insert(Key::from("stray"), Ok(json!("never asked")));
                Ok(results)
            }
            .boxed()
        });
        let batch = BatchKey::kv("t");
        source.load(&batch, &Key::from("kept")).unwrap();
        source.load(&batch, &Key::from("gone")).unwrap();

        source.run(Duration::from_secs(5)).await;
        assert_eq!(source.fetch(&batch, &Key::from("kept")).unwrap(), Some(Outcome::Ok(json!("v"))));
        assert_eq!(source.fetch(&batch, &Key::from("gone")).unwrap(), Some(Outcome::NotFound));
        assert_eq!(source.fetch(&batch, &Key::from("stray")).unwrap(), None);
    }

    #[tokio::test]
    async fn panicking_callback_fails_the_batch_and_reports() {
        let mut source = KvSource::new(|_tag, _items| {
            async move { panic!("fetch blew up") }.boxed()
        });
        let batch = BatchKey::kv("t");
        source.load(&batch, &Key::from(1)).unwrap();

        let report = source.run(Duration::from_secs(5)).await;
        assert_eq!(report.exceptions, vec!["fetch blew up".to_owned()]);
        assert!(matches!(
            source.fetch(&batch, &Key::from(1)).unwrap(),
            Some(Outcome::Error(BatchError::Backend { .. }))
        ));
    }

    #[tokio::test]
    async fn slow_batches_time_out() {
        let options = KvOptions { timeout: Some(Duration::from_millis(20)), ..KvOptions::default() };
        let mut source = KvSource::with_options(
            |_tag, _items| {
                async move {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(KvResults::new())
                }
                .boxed()
            },
            options,
        )
        .unwrap();
        let batch = BatchKey::kv("t");
        source.load(&batch, &Key::from(1)).unwrap();

        let report = source.run(Duration::from_secs(5)).await;
        assert_eq!(report.exceptions.len(), 1);
        assert!(matches!(
            source.fetch(&batch, &Key::from(1)).unwrap(),
            Some(Outcome::Error(BatchError::Timeout { .. }))
        ));
    }

    #[tokio::test]
    async fn failing_callback_reports_an_exception() {
        let mut source = KvSource::new(|_tag, _items| {
            async move { Err("connection refused".into()) }.boxed()
        });
        let batch = BatchKey::kv("t");
        source.load(&batch, &Key::from(1)).unwrap();

        let report = source.run(Duration::from_secs(5)).await;
        assert_eq!(report.exceptions, vec!["connection refused".to_owned()]);
        assert!(matches!(
            source.fetch(&batch, &Key::from(1)).unwrap(),
            Some(Outcome::Error(BatchError::Backend { .. }))
        ));
    }

    // Item-level errors inside a successful mapping are outcomes, not
    // source exceptions.
    #[tokio::test]
    async fn item_errors_do_not_report_exceptions() {
        let mut source = KvSource::new(|_tag, items: Vec<Key>| {
            async move {
                Ok(items.into_iter().map(|k| (k, Err("broken row".into()))).collect::<KvResults>())
            }
            .boxed()
        });
        let batch = BatchKey::kv("t");
        source.load(&batch, &Key::from(1)).unwrap();

        let report = source.run(Duration::from_secs(5)).await;
        assert!(report.exceptions.is_empty());
        assert_eq!(report.counts.error, 1);
    }
}
