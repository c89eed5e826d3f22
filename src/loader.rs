use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use serde_json::Value;

use crate::error::{LoaderError, LoaderResult};
use crate::events::{self, RunEvent, Subscriber};
use crate::key::{BatchKey, Key};
use crate::outcome::{ErrorPolicy, GetResult};
use crate::source::{default_concurrency, Source};

/// Options applied to a [`Loader`] at construction.
#[derive(Clone)]
pub struct LoaderOptions {
    /// How batch errors surface from `get`.
    pub policy: ErrorPolicy,
    /// Per-batch deadline for sources that do not carry their own.
    pub timeout: Duration,
    /// When false, sources run sequentially within `run`.
    pub concurrent: bool,
    /// Run-event subscribers.
    pub subscribers: Vec<Subscriber>,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            policy: ErrorPolicy::default(),
            timeout: Duration::from_secs(15),
            concurrent: true,
            subscribers: Vec::new(),
        }
    }
}

impl LoaderOptions {
    pub fn policy(mut self, policy: ErrorPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn concurrent(mut self, concurrent: bool) -> Self {
        self.concurrent = concurrent;
        self
    }

    /// Registers a run-event subscriber. Delivery is synchronous and
    /// best-effort; subscribers must be fast and must not panic.
    pub fn subscribe(mut self, subscriber: impl Fn(&RunEvent) + Send + Sync + 'static) -> Self {
        self.subscribers.push(std::sync::Arc::new(subscriber));
        self
    }
}

/// Batch-loads values from named sources, primarily intended for mitigating
/// the N+1 problem when resolving related data.
///
/// Usage is two-phased: callers record intent with [`Loader::load`] /
/// [`Loader::load_many`] — which never touch a backend — then drain every
/// pending batch with a single [`Loader::run`]. Afterwards [`Loader::get`] and
/// [`Loader::get_many`] answer from the per-source result tables, shaped by
/// the loader's [`ErrorPolicy`]. Identical loads are memoised for the life of
/// the loader, so repeated load/run/get cycles cost at most one backend call
/// per distinct `(batch key, item)` pair.
///
/// A loader is a request-scoped value owned by one task: create one per unit
/// of work, thread it through the request, drop it at the end. Two loaders
/// never share cache state.
pub struct Loader {
    options: LoaderOptions,
    sources: HashMap<String, Box<dyn Source>>,
    logged: Mutex<HashSet<(String, BatchKey, Key)>>,
}

impl std::fmt::Debug for Loader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Loader").finish_non_exhaustive()
    }
}

impl Loader {
    /// Creates a loader with default options.
    pub fn new() -> Self {
        Self {
            options: LoaderOptions::default(),
            sources: HashMap::new(),
            logged: Mutex::new(HashSet::new()),
        }
    }

    /// Creates a loader with explicit options.
    pub fn with_options(options: LoaderOptions) -> LoaderResult<Self> {
        if options.timeout.is_zero() {
            return Err(LoaderError::config("timeout must be non-zero"));
        }
        let mut loader = Self::new();
        loader.options = options;
        Ok(loader)
    }

    /// Binds `source` under `name`. Rebinding a name replaces the previous
    /// source; later `run` calls use the latest binding.
    pub fn add_source(
        &mut self,
        name: impl Into<String>,
        source: impl Source + 'static,
    ) -> &mut Self {
        self.sources.insert(name.into(), Box::new(source));
        self
    }

    /// Records the intent to fetch `item` under `batch` from the named
    /// source. Performs no I/O; an already-resolved pair is a no-op.
    pub fn load(
        &mut self,
        source: &str,
        batch: &BatchKey,
        item: impl Into<Key>,
    ) -> LoaderResult<&mut Self> {
        let item = item.into();
        self.source_mut(source)?.load(batch, &item)?;
        Ok(self)
    }

    /// [`Loader::load`] folded over `items`, preserving their order.
    pub fn load_many<I, K>(
        &mut self,
        source: &str,
        batch: &BatchKey,
        items: I,
    ) -> LoaderResult<&mut Self>
    where
        I: IntoIterator<Item = K>,
        K: Into<Key>,
    {
        let src = self.source_mut(source)?;
        for item in items {
            src.load(batch, &item.into())?;
        }
        Ok(self)
    }

    /// Dispatches every source with pending work and waits for all of their
    /// outcomes. This is the only operation that suspends; with no pending
    /// work it returns immediately without touching a backend.
    ///
    /// Sources run concurrently (subject to an engine-wide cap), and batches
    /// within a source fan out per that source's own configuration. A failing
    /// or slow batch becomes error outcomes for its items; it never aborts
    /// the rest of the run.
    pub async fn run(&mut self) -> &mut Self {
        let fallback = self.options.timeout;
        let limit = if self.options.concurrent { default_concurrency() } else { 1 };
        let subscribers = self.options.subscribers.clone();

        let runs = self
            .sources
            .iter_mut()
            .filter(|(_, source)| source.pending_batches())
            .map(|(name, source)| {
                let subscribers = subscribers.clone();
                async move {
                    events::emit(&subscribers, &RunEvent::Start { source: name.clone() });
                    let started = Instant::now();
                    let report = source.run(fallback).await;
                    for cause in &report.exceptions {
                        events::emit(
                            &subscribers,
                            &RunEvent::Exception { source: name.clone(), cause: cause.clone() },
                        );
                    }
                    events::emit(
                        &subscribers,
                        &RunEvent::Stop {
                            source: name.clone(),
                            duration: started.elapsed(),
                            counts: report.counts,
                        },
                    );
                }
            });

        stream::iter(runs).buffer_unordered(limit).for_each(|()| async {}).await;
        tracing::debug!("run complete");
        self
    }

    /// Looks up the outcome for a pair, shaped by the loader's policy.
    ///
    /// Fails with [`LoaderError::Unrun`] when the pair was never loaded, or
    /// was loaded after the most recent `run` — a programming error that
    /// surfaces identically under every policy.
    pub fn get(
        &self,
        source: &str,
        batch: &BatchKey,
        item: impl Into<Key>,
    ) -> LoaderResult<GetResult> {
        let item = item.into();
        let src = self.source_ref(source)?;
        let outcome = src.fetch(batch, &item)?.ok_or_else(|| LoaderError::Unrun {
            source_name: source.to_owned(),
            batch: batch.clone(),
            item: item.clone(),
        })?;
        self.options.policy.shape(source, &outcome, |error| {
            let mut logged = self.logged.lock().unwrap();
            if logged.insert((source.to_owned(), batch.clone(), item.clone())) {
                tracing::error!(source, batch = %batch, item = %item, %error, "load failed");
            }
        })
    }

    /// [`Loader::get`] folded over `items`, returning outcomes in their order.
    pub fn get_many<I, K>(
        &self,
        source: &str,
        batch: &BatchKey,
        items: I,
    ) -> LoaderResult<Vec<GetResult>>
    where
        I: IntoIterator<Item = K>,
        K: Into<Key>,
    {
        items.into_iter().map(|item| self.get(source, batch, item)).collect()
    }

    /// True iff any bound source has pending work.
    pub fn pending_batches(&self) -> bool {
        self.sources.values().any(|source| source.pending_batches())
    }

    /// Records an `ok(value)` outcome out-of-band, e.g. for data fetched
    /// elsewhere. An already-resolved pair keeps its outcome.
    pub fn prime(
        &mut self,
        source: &str,
        batch: &BatchKey,
        item: impl Into<Key>,
        value: Value,
    ) -> LoaderResult<&mut Self> {
        let item = item.into();
        self.source_mut(source)?.prime(batch, &item, value)?;
        Ok(self)
    }

    /// Forgets the outcome for a pair, so the next load fetches it again.
    pub fn clear(
        &mut self,
        source: &str,
        batch: &BatchKey,
        item: impl Into<Key>,
    ) -> LoaderResult<&mut Self> {
        let item = item.into();
        self.source_mut(source)?.clear(batch, &item)?;
        Ok(self)
    }

    fn source_ref(&self, name: &str) -> LoaderResult<&dyn Source> {
        self.sources
            .get(name)
            .map(|boxed| boxed.as_ref())
            .ok_or_else(|| LoaderError::UnknownSource { name: name.to_owned() })
    }

    fn source_mut(&mut self, name: &str) -> LoaderResult<&mut Box<dyn Source>> {
        self.sources
            .get_mut(name)
            .ok_or_else(|| LoaderError::UnknownSource { name: name.to_owned() })
    }
}

impl Default for Loader {
    fn default() -> Self {
        Self::new()
    }
}
