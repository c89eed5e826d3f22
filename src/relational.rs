//! A source that loads entities by primary key, arbitrary column, or
//! association, through a [`Repo`] handle.
//!
//! The source never generates SQL. It builds abstract [`Query`] values —
//! starting from the user's `query` hook, then layering on the batching
//! predicate — and leaves execution to the repo. Row-to-item partitioning
//! happens back on this side, by primary-key equality, the batched column, or
//! the foreign-key walk the association dictates.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::{self, StreamExt};
use futures::FutureExt;
use serde_json::Value;
use tracing::debug;

use crate::error::{BatchError, LoaderError, LoaderResult};
use crate::key::{BatchKey, Cardinality, Key, Params};
use crate::outcome::Outcome;
use crate::query::{row_key, JoinClause, Query, Row};
use crate::repo::{Repo, RepoOpts};
use crate::schema::{AssocKind, EntitySchema, SchemaRegistry};
use crate::source::{default_concurrency, panic_message, RunReport, Source};

/// Last-mile query customisation: receives the entity being queried and the
/// merged params, returns the base query. Must describe, never execute.
pub type QueryFn = Arc<dyn Fn(&EntitySchema, &Params) -> Query + Send + Sync>;

/// Replacement for the default dispatch (store call + partitioning). Must
/// return exactly one outcome per item, in the input order.
pub type RunBatchFn =
    Arc<dyn Fn(RunBatchCall) -> BoxFuture<'static, Result<Vec<Outcome>, BatchError>> + Send + Sync>;

/// Everything a `run_batch` override gets to work with.
pub struct RunBatchCall {
    /// Entity whose rows the query returns.
    pub entity: String,
    /// Base query with the batching predicate already applied.
    pub query: Query,
    /// The column the batch predicate ranges over.
    pub column: String,
    /// Normalised item identities, in pending order.
    pub items: Vec<Key>,
    pub repo_opts: RepoOpts,
}

/// Options for a [`RelationalSource`].
#[derive(Clone)]
pub struct RelationalOptions {
    /// Base params merged under every call-site's params (caller wins).
    pub default_params: Params,
    /// Opaque options forwarded to every store call.
    pub repo_opts: RepoOpts,
    /// Per-batch deadline. `None` defers to the loader's timeout.
    pub timeout: Option<Duration>,
    /// When false, batches run sequentially on the calling task.
    pub concurrent: bool,
    /// Upper bound on concurrently executing batches.
    pub max_concurrency: usize,
}

impl Default for RelationalOptions {
    fn default() -> Self {
        Self {
            default_params: Params::new(),
            repo_opts: RepoOpts::new(),
            timeout: Some(Duration::from_secs(15)),
            concurrent: true,
            max_concurrency: default_concurrency(),
        }
    }
}

/// How a normalised batch selects its rows.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Mode {
    Pk,
    Column { cardinality: Cardinality, column: String },
    Assoc { assoc: String },
}

/// Internal batch identity: the public batch key with params merged and the
/// column lifted out of the item key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct NormBatch {
    entity: String,
    mode: Mode,
    params: Params,
}

impl NormBatch {
    fn label(&self) -> String {
        match &self.mode {
            Mode::Pk => self.entity.clone(),
            Mode::Column { cardinality, column } => {
                let card = match cardinality {
                    Cardinality::One => "one",
                    Cardinality::Many => "many",
                };
                format!("{card}:{entity}.{column}", entity = self.entity, column = column)
            }
            Mode::Assoc { assoc } => format!("{entity}.{assoc}", entity = self.entity),
        }
    }
}

/// A pending item, normalised at `load` time.
#[derive(Debug, Clone)]
enum PendingItem {
    /// `ident` is the coerced id / column value / parent primary key.
    /// `record` carries the parent row for association loads.
    Ready { ident: Key, record: Option<Key> },
    /// Normalisation failed; resolved to an error outcome at `run` without
    /// joining the store call.
    Bad { ident: Key, error: BatchError },
}

impl PendingItem {
    fn ident(&self) -> &Key {
        match self {
            PendingItem::Ready { ident, .. } | PendingItem::Bad { ident, .. } => ident,
        }
    }
}

/// A [`Source`] over a relational store.
pub struct RelationalSource {
    repo: Arc<dyn Repo>,
    schemas: Arc<SchemaRegistry>,
    query: QueryFn,
    run_batch: Option<RunBatchFn>,
    options: RelationalOptions,
    /// Pending items per normalised batch, keyed by item identity.
    pending: HashMap<NormBatch, HashMap<Key, PendingItem>>,
    results: HashMap<NormBatch, HashMap<Key, Outcome>>,
}

impl RelationalSource {
    /// Creates a source with default options and the identity `query` hook.
    pub fn new(repo: Arc<dyn Repo>, schemas: SchemaRegistry) -> Self {
        Self {
            repo,
            schemas: Arc::new(schemas),
            query: Arc::new(|schema: &EntitySchema, _params: &Params| Query::table(schema.table())),
            run_batch: None,
            options: RelationalOptions::default(),
            pending: HashMap::new(),
            results: HashMap::new(),
        }
    }

    pub fn with_options(
        repo: Arc<dyn Repo>,
        schemas: SchemaRegistry,
        options: RelationalOptions,
    ) -> LoaderResult<Self> {
        if options.max_concurrency == 0 {
            return Err(LoaderError::config("max_concurrency must be at least 1"));
        }
        if options.timeout == Some(Duration::ZERO) {
            return Err(LoaderError::config("timeout must be non-zero"));
        }
        let mut source = Self::new(repo, schemas);
        source.options = options;
        Ok(source)
    }

    /// Installs a custom base-query hook.
    pub fn query_fn(
        mut self,
        query: impl Fn(&EntitySchema, &Params) -> Query + Send + Sync + 'static,
    ) -> Self {
        self.query = Arc::new(query);
        self
    }

    /// Replaces the default dispatch with a user `run_batch`.
    pub fn run_batch_fn(
        mut self,
        run_batch: impl Fn(RunBatchCall) -> BoxFuture<'static, Result<Vec<Outcome>, BatchError>>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.run_batch = Some(Arc::new(run_batch));
        self
    }

    fn merged_params(&self, params: &Params) -> Params {
        let mut merged = self.options.default_params.clone();
        for (name, value) in params {
            merged.insert(name.clone(), value.clone());
        }
        merged
    }

    /// Normalises a public `(batch_key, item)` pair into the internal batch
    /// identity and pending item. Caller mistakes (foreign batch keys,
    /// unknown entities or associations, malformed column items) surface as
    /// configuration errors; failed id coercions become `Bad` items that
    /// resolve to bad-id outcomes.
    fn normalize(&self, batch: &BatchKey, item: &Key) -> LoaderResult<(NormBatch, PendingItem)> {
        match batch {
            BatchKey::Kv(_) => Err(LoaderError::config(
                "relational source cannot serve a kv batch key",
            )),
            BatchKey::Entity { entity, params } => {
                let schema = self.schemas.get(entity)?;
                let norm = NormBatch {
                    entity: entity.clone(),
                    mode: Mode::Pk,
                    params: self.merged_params(params),
                };
                let pending = match schema.id_type().coerce(entity, item) {
                    Ok(ident) => PendingItem::Ready { ident, record: None },
                    Err(error) => PendingItem::Bad { ident: item.clone(), error },
                };
                Ok((norm, pending))
            }
            BatchKey::Column { cardinality, entity, params } => {
                self.schemas.get(entity)?;
                let entry = item.as_object().filter(|map| map.len() == 1).and_then(|map| {
                    map.iter().next().map(|(column, value)| (column.clone(), Key::from(value)))
                });
                let Some((column, value)) = entry else {
                    return Err(LoaderError::config(
                        "column load items must be single-entry {column: value} maps",
                    ));
                };
                let norm = NormBatch {
                    entity: entity.clone(),
                    mode: Mode::Column { cardinality: *cardinality, column },
                    params: self.merged_params(params),
                };
                Ok((norm, PendingItem::Ready { ident: value, record: None }))
            }
            BatchKey::Assoc { entity, assoc, params } => {
                let schema = self.schemas.get(entity)?;
                if schema.association(assoc).is_none() {
                    return Err(LoaderError::config(format!(
                        "unknown association {assoc} on entity {entity}"
                    )));
                }
                let norm = NormBatch {
                    entity: entity.clone(),
                    mode: Mode::Assoc { assoc: assoc.clone() },
                    params: self.merged_params(params),
                };
                let pending = match schema.record_id(item) {
                    Ok(ident) => PendingItem::Ready { ident, record: Some(item.clone()) },
                    Err(error) => PendingItem::Bad { ident: item.clone(), error },
                };
                Ok((norm, pending))
            }
        }
    }

    fn resolved(&self, norm: &NormBatch, ident: &Key) -> bool {
        self.results.get(norm).is_some_and(|slot| slot.contains_key(ident))
    }
}

/// Immutable context shared by every batch dispatched in one `run`.
struct DispatchCtx {
    repo: Arc<dyn Repo>,
    schemas: Arc<SchemaRegistry>,
    query: QueryFn,
    run_batch: Option<RunBatchFn>,
    repo_opts: RepoOpts,
}

/// One batch's contribution to the result table.
struct BatchResult {
    norm: NormBatch,
    outcomes: Vec<(Key, Outcome)>,
    exception: Option<String>,
}

async fn dispatch(
    ctx: Arc<DispatchCtx>,
    norm: NormBatch,
    items: Vec<PendingItem>,
    deadline: Duration,
) -> BatchResult {
    let mut outcomes: Vec<(Key, Outcome)> = Vec::with_capacity(items.len());
    let mut ready: Vec<(Key, Option<Key>)> = Vec::new();
    for item in items {
        match item {
            PendingItem::Ready { ident, record } => ready.push((ident, record)),
            PendingItem::Bad { ident, error } => outcomes.push((ident, Outcome::Error(error))),
        }
    }
    if ready.is_empty() {
        return BatchResult { norm, outcomes, exception: None };
    }

    let idents: Vec<Key> = ready.iter().map(|(ident, _)| ident.clone()).collect();
    let call = {
        let ctx = ctx.clone();
        let norm = norm.clone();
        AssertUnwindSafe(async move { run_default_or_override(&ctx, &norm, ready).await })
            .catch_unwind()
    };

    let (resolved, exception) = match tokio::time::timeout(deadline, call).await {
        Err(_) => {
            let error = BatchError::Timeout { timeout: deadline };
            let cause = error.to_string();
            let err = Outcome::Error(error);
            (idents.iter().cloned().map(|ident| (ident, err.clone())).collect(), Some(cause))
        }
        Ok(Err(panic)) => {
            let cause = panic_message(panic);
            let err = Outcome::Error(BatchError::Backend { message: cause.clone() });
            (idents.iter().cloned().map(|ident| (ident, err.clone())).collect(), Some(cause))
        }
        Ok(Ok((resolved, cause))) => (resolved, cause),
    };
    outcomes.extend(resolved);
    BatchResult { norm, outcomes, exception }
}

/// Builds the batch query, runs it (or the user override), and partitions
/// rows back to items. Returns one outcome per ready item, plus the cause
/// when the batch failed as a whole (reported as a source exception).
async fn run_default_or_override(
    ctx: &DispatchCtx,
    norm: &NormBatch,
    ready: Vec<(Key, Option<Key>)>,
) -> (Vec<(Key, Outcome)>, Option<String>) {
    let plan = match build_plan(ctx, norm, &ready) {
        Ok(plan) => plan,
        Err(error) => {
            let cause = error.to_string();
            let err = Outcome::Error(error);
            return (
                ready.into_iter().map(|(ident, _)| (ident, err.clone())).collect(),
                Some(cause),
            );
        }
    };

    if let Some(run_batch) = &ctx.run_batch {
        let items: Vec<Key> = ready.iter().map(|(ident, _)| ident.clone()).collect();
        let call = RunBatchCall {
            entity: plan.target_entity.clone(),
            query: plan.query.clone(),
            column: plan.partition_column.clone(),
            items: items.clone(),
            repo_opts: ctx.repo_opts.clone(),
        };
        let (outcomes, cause) = match run_batch(call).await {
            Ok(outcomes) if outcomes.len() == items.len() => (outcomes, None),
            Ok(outcomes) => {
                let error = BatchError::protocol(format!(
                    "expected {} outcomes, got {}",
                    items.len(),
                    outcomes.len()
                ));
                let cause = error.to_string();
                (vec![Outcome::Error(error); items.len()], Some(cause))
            }
            Err(error) => {
                let cause = error.to_string();
                (vec![Outcome::Error(error); items.len()], Some(cause))
            }
        };
        return (items.into_iter().zip(outcomes).collect(), cause);
    }

    match ctx.repo.all(&plan.query, &ctx.repo_opts).await {
        Ok(rows) => (partition(norm, &plan, ready, rows), None),
        Err(error) => {
            let error = BatchError::backend(error);
            let cause = error.to_string();
            let err = Outcome::Error(error);
            (
                ready.into_iter().map(|(ident, _)| (ident, err.clone())).collect(),
                Some(cause),
            )
        }
    }
}

/// The executable shape of one batch.
struct BatchPlan {
    query: Query,
    /// Entity whose rows come back.
    target_entity: String,
    /// Row column compared against each item's partition key.
    partition_column: String,
    /// Per-item value matched against `partition_column`. Defaults to the
    /// item ident; belongs-to loads use the parent's foreign-key value.
    partition_keys: Option<HashMap<Key, Key>>,
    /// `One` loads yield at most one row per item, `Many` loads a sequence.
    arity: Cardinality,
}

fn build_plan(
    ctx: &DispatchCtx,
    norm: &NormBatch,
    ready: &[(Key, Option<Key>)],
) -> Result<BatchPlan, BatchError> {
    let schema = ctx.schemas.get(&norm.entity).map_err(BatchError::backend)?;

    match &norm.mode {
        Mode::Pk => {
            let column = schema.pk_column().to_owned();
            let values = ready.iter().map(|(ident, _)| ident.clone()).collect();
            let query = (ctx.query)(schema, &norm.params).batched(&column, values);
            Ok(BatchPlan {
                query,
                target_entity: norm.entity.clone(),
                partition_column: column,
                partition_keys: None,
                arity: Cardinality::One,
            })
        }
        Mode::Column { cardinality, column } => {
            let values = ready.iter().map(|(ident, _)| ident.clone()).collect();
            let query = (ctx.query)(schema, &norm.params).batched(column, values);
            Ok(BatchPlan {
                query,
                target_entity: norm.entity.clone(),
                partition_column: column.clone(),
                partition_keys: None,
                arity: *cardinality,
            })
        }
        Mode::Assoc { assoc } => {
            let assoc_def = schema.association(assoc).ok_or_else(|| {
                BatchError::backend(format!("unknown association {assoc} on {}", norm.entity))
            })?;
            let target = ctx.schemas.get(&assoc_def.target).map_err(BatchError::backend)?;
            let mut base = (ctx.query)(target, &norm.params);
            for (column, value) in &assoc_def.filter {
                base = base.filter(column.clone(), value.clone());
            }

            match &assoc_def.kind {
                AssocKind::BelongsTo { owner_key } => {
                    // Partition key is the parent's foreign-key value, not its id.
                    let mut partition_keys = HashMap::new();
                    let mut fks = Vec::new();
                    for (ident, record) in ready {
                        let fk = record
                            .as_ref()
                            .and_then(|r| r.as_object())
                            .and_then(|row| row.get(owner_key))
                            .map(Key::from)
                            .unwrap_or_else(|| Key::from(Value::Null));
                        if !fk.value().is_null() && !fks.contains(&fk) {
                            fks.push(fk.clone());
                        }
                        partition_keys.insert(ident.clone(), fk);
                    }
                    let column = target.pk_column().to_owned();
                    Ok(BatchPlan {
                        query: base.batched(&column, fks),
                        target_entity: assoc_def.target.clone(),
                        partition_column: column,
                        partition_keys: Some(partition_keys),
                        arity: Cardinality::One,
                    })
                }
                AssocKind::HasOne { related_key } | AssocKind::HasMany { related_key } => {
                    let values = ready.iter().map(|(ident, _)| ident.clone()).collect();
                    let arity = if assoc_def.kind.single() {
                        Cardinality::One
                    } else {
                        Cardinality::Many
                    };
                    Ok(BatchPlan {
                        query: base.batched(related_key, values),
                        target_entity: assoc_def.target.clone(),
                        partition_column: related_key.clone(),
                        partition_keys: None,
                        arity,
                    })
                }
                AssocKind::ManyToMany { join_table, join_owner_key, join_related_key } => {
                    let values: Vec<Key> =
                        ready.iter().map(|(ident, _)| ident.clone()).collect();
                    let mut query = base.batched(join_owner_key, values);
                    query.join = Some(JoinClause {
                        table: join_table.clone(),
                        owner_column: join_owner_key.clone(),
                        related_column: join_related_key.clone(),
                        target_column: target.pk_column().to_owned(),
                    });
                    Ok(BatchPlan {
                        query,
                        target_entity: assoc_def.target.clone(),
                        partition_column: JoinClause::TAG.to_owned(),
                        partition_keys: None,
                        arity: Cardinality::Many,
                    })
                }
            }
        }
    }
}

/// Binds rows back to items. Rows not matched to any pending item are
/// discarded; row ordering within a multi-valued outcome is the query's.
fn partition(
    norm: &NormBatch,
    plan: &BatchPlan,
    ready: Vec<(Key, Option<Key>)>,
    rows: Vec<Row>,
) -> Vec<(Key, Outcome)> {
    let joined = plan.partition_column == JoinClause::TAG;
    ready
        .into_iter()
        .map(|(ident, _)| {
            let wanted = match &plan.partition_keys {
                Some(keys) => keys.get(&ident).cloned().unwrap_or_else(|| ident.clone()),
                None => ident.clone(),
            };
            let matches: Vec<Value> = rows
                .iter()
                .filter(|row| row_key(row, &plan.partition_column) == wanted)
                .map(|row| {
                    let mut row = row.clone();
                    if joined {
                        row.remove(JoinClause::TAG);
                    }
                    Value::Object(row)
                })
                .collect();

            let outcome = if plan.arity == Cardinality::Many {
                Outcome::Ok(Value::Array(matches))
            } else if wanted.value().is_null() && plan.partition_keys.is_some() {
                // A null foreign key resolves to nothing without matching rows.
                Outcome::NotFound
            } else {
                match matches.len() {
                    0 => Outcome::NotFound,
                    1 => Outcome::Ok(matches.into_iter().next().unwrap_or(Value::Null)),
                    count => Outcome::Error(BatchError::MultipleResults {
                        batch: norm.label(),
                        count,
                    }),
                }
            };
            (ident, outcome)
        })
        .collect()
}

#[async_trait]
impl Source for RelationalSource {
    fn load(&mut self, batch: &BatchKey, item: &Key) -> LoaderResult<()> {
        let (norm, pending) = self.normalize(batch, item)?;
        if self.resolved(&norm, pending.ident()) {
            return Ok(());
        }
        let ident = pending.ident().clone();
        self.pending.entry(norm).or_default().entry(ident).or_insert(pending);
        Ok(())
    }

    async fn run(&mut self, fallback_timeout: Duration) -> RunReport {
        let pending = std::mem::take(&mut self.pending);
        let deadline = self.options.timeout.unwrap_or(fallback_timeout);
        let limit = if self.options.concurrent { self.options.max_concurrency } else { 1 };

        let ctx = Arc::new(DispatchCtx {
            repo: self.repo.clone(),
            schemas: self.schemas.clone(),
            query: self.query.clone(),
            run_batch: self.run_batch.clone(),
            repo_opts: self.options.repo_opts.clone(),
        });
        let dispatches = pending.into_iter().map(|(norm, items)| {
            dispatch(ctx.clone(), norm, items.into_values().collect(), deadline)
        });

        let mut report = RunReport::default();
        let mut stream = stream::iter(dispatches).buffer_unordered(limit);
        while let Some(batch) = stream.next().await {
            debug!(batch = %batch.norm.label(), outcomes = batch.outcomes.len(), "batch resolved");
            let slot = self.results.entry(batch.norm).or_default();
            for (ident, outcome) in batch.outcomes {
                if let Entry::Vacant(cell) = slot.entry(ident) {
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
        let (norm, pending) = self.normalize(batch, item)?;
        Ok(self
            .results
            .get(&norm)
            .and_then(|slot| slot.get(pending.ident()))
            .cloned())
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
        let (norm, pending) = self.normalize(batch, item)?;
        self.results
            .entry(norm)
            .or_default()
            .entry(pending.ident().clone())
            .or_insert(Outcome::Ok(value));
        Ok(())
    }

    fn clear(&mut self, batch: &BatchKey, item: &Key) -> LoaderResult<()> {
        let (norm, pending) = self.normalize(batch, item)?;
        if let Some(slot) = self.results.get_mut(&norm) {
            slot.remove(pending.ident());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::repo::MemoryRepo;
    use crate::schema::{EntitySchema, IdType};

    use super::*;

    fn schemas() -> SchemaRegistry {
        SchemaRegistry::new()
            .entity(
                EntitySchema::new("User", "users")
                    .has_many("posts", "Post", "user_id")
                    .has_one("profile", "Profile", "user_id"),
            )
            .entity(EntitySchema::new("Post", "posts").belongs_to("author", "User", "user_id"))
            .entity(EntitySchema::new("Profile", "profiles"))
    }

    fn repo() -> Arc<MemoryRepo> {
        Arc::new(
            MemoryRepo::new()
                .table(
                    "users",
                    vec![
                        json!({"id": 1, "name": "Alice"}),
                        json!({"id": 2, "name": "Bob"}),
                    ],
                )
                .table(
                    "posts",
                    vec![
                        json!({"id": 10, "user_id": 1, "title": "first"}),
                        json!({"id": 11, "user_id": 1, "title": "second"}),
                        json!({"id": 12, "user_id": 2, "title": "third"}),
                    ],
                )
                .table(
                    "profiles",
                    vec![
                        json!({"id": 100, "user_id": 1}),
                        json!({"id": 101, "user_id": 1}),
                    ],
                ),
        )
    }

    #[tokio::test]
    async fn string_and_numeric_ids_coalesce_into_one_pending_item() {
        let mut source = RelationalSource::new(repo(), schemas());
        let batch = BatchKey::entity("User");
        source.load(&batch, &Key::from("1")).unwrap();
        source.load(&batch, &Key::from(1)).unwrap();

        source.run(Duration::from_secs(5)).await;
        let by_string = source.fetch(&batch, &Key::from("1")).unwrap().unwrap();
        let by_number = source.fetch(&batch, &Key::from(1)).unwrap().unwrap();
        assert_eq!(by_string, by_number);
        assert!(matches!(by_number, Outcome::Ok(_)));
    }

    #[tokio::test]
    async fn uncoercible_ids_fail_without_joining_the_store_call() {
        let store = repo();
        let mut source = RelationalSource::new(store.clone(), schemas());
        let batch = BatchKey::entity("User");
        source.load(&batch, &Key::from("not-a-number")).unwrap();
        source.load(&batch, &Key::from(1)).unwrap();

        source.run(Duration::from_secs(5)).await;
        assert_eq!(store.calls(), 1);
        assert!(matches!(
            source.fetch(&batch, &Key::from("not-a-number")).unwrap(),
            Some(Outcome::Error(BatchError::BadId { .. }))
        ));
        assert!(matches!(source.fetch(&batch, &Key::from(1)).unwrap(), Some(Outcome::Ok(_))));
    }

    #[tokio::test]
    async fn has_one_overflow_is_a_multiple_results_error() {
        let mut source = RelationalSource::new(repo(), schemas());
        let batch = BatchKey::assoc("User", "profile");
        let alice = Key::from(json!({"id": 1, "name": "Alice"}));
        source.load(&batch, &alice).unwrap();

        source.run(Duration::from_secs(5)).await;
        assert!(matches!(
            source.fetch(&batch, &alice).unwrap(),
            Some(Outcome::Error(BatchError::MultipleResults { count: 2, .. }))
        ));
    }

    #[tokio::test]
    async fn belongs_to_resolves_through_the_foreign_key() {
        let mut source = RelationalSource::new(repo(), schemas());
        let batch = BatchKey::assoc("Post", "author");
        let post = Key::from(json!({"id": 10, "user_id": 1, "title": "first"}));
        source.load(&batch, &post).unwrap();

        source.run(Duration::from_secs(5)).await;
        match source.fetch(&batch, &post).unwrap() {
            Some(Outcome::Ok(author)) => assert_eq!(author["name"], json!("Alice")),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn run_batch_override_must_answer_every_item() {
        let mut source = RelationalSource::new(repo(), schemas()).run_batch_fn(|call| {
            async move {
                // One outcome short, whatever the batch size.
                let mut outcomes: Vec<Outcome> =
                    call.items.iter().map(|_| Outcome::NotFound).collect();
                outcomes.pop();
                Ok(outcomes)
            }
            .boxed()
        });
        let batch = BatchKey::entity("User");
        source.load(&batch, &Key::from(1)).unwrap();
        source.load(&batch, &Key::from(2)).unwrap();

        let report = source.run(Duration::from_secs(5)).await;
        assert_eq!(report.exceptions.len(), 1);
        assert!(matches!(
            source.fetch(&batch, &Key::from(1)).unwrap(),
            Some(Outcome::Error(BatchError::Protocol { .. }))
        ));
    }

    #[tokio::test]
    async fn unknown_entities_are_configuration_errors() {
        let mut source = RelationalSource::new(repo(), schemas());
        let err = source.load(&BatchKey::entity("Ghost"), &Key::from(1)).unwrap_err();
        assert!(matches!(err, LoaderError::Config { .. }));
    }

    #[test]
    fn uuid_entities_coerce_ids_at_load() {
        let schemas = SchemaRegistry::new()
            .entity(EntitySchema::new("Account", "accounts").primary_key("id", IdType::Uuid));
        let mut source = RelationalSource::new(Arc::new(MemoryRepo::new()), schemas);
        let batch = BatchKey::entity("Account");
        source.load(&batch, &Key::from("67E5504410B1426F9247BB680E5FE0C8")).unwrap();
        source
            .load(&batch, &Key::from("67e55044-10b1-426f-9247-bb680e5fe0c8"))
            .unwrap();

        // Both spellings normalise to one pending item.
        assert_eq!(source.pending.values().map(|items| items.len()).sum::<usize>(), 1);
    }
}
