//! Request-scoped batch loading and caching for heterogeneous backends,
//! primarily intended for mitigating GraphQL's N+1 problem.
//!
//! Callers enqueue individual loads against named sources; the [`Loader`]
//! defers execution, coalesces value-equal batch keys, dispatches all pending
//! batches concurrently on [`Loader::run`], and memoises outcomes so that
//! identical subsequent loads cost nothing. Two source kinds ship in the box:
//! [`KvSource`] wraps an arbitrary fetch callback, and [`RelationalSource`]
//! loads entities by primary key, column, or association through a [`Repo`]
//! handle.
//!
//! # Example
//!
//! ```
//! use batchload::{BatchKey, GetResult, Key, KvResults, KvSource, Loader};
//! use futures::FutureExt;
//! use serde_json::json;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), batchload::LoaderError> {
//! let mut loader = Loader::new();
//! loader.add_source(
//!     "users",
//!     KvSource::new(|_tag, items: Vec<Key>| {
//!         async move {
//!             Ok(items
//!                 .into_iter()
//!                 .map(|k| {
//!                     let name = format!("user-{k}");
//!                     (k, Ok(json!({ "name": name })))
//!                 })
//!                 .collect::<KvResults>())
//!         }
//!         .boxed()
//!     }),
//! );
//!
//! let batch = BatchKey::kv("by-id");
//! loader.load_many("users", &batch, [1, 2, 3])?;
//! loader.run().await;
//!
//! match loader.get("users", &batch, 2)? {
//!     GetResult::Found(user) => assert_eq!(user["name"], json!("user-2")),
//!     other => panic!("unexpected: {other:?}"),
//! }
//! # Ok(())
//! # }
//! ```

mod error;
mod events;
mod key;
mod kv;
mod loader;
mod outcome;
mod query;
mod relational;
mod repo;
mod schema;
mod source;

pub use error::{BatchError, BoxError, LoaderError, LoaderResult};
pub use events::{RunEvent, Subscriber};
pub use key::{BatchKey, Cardinality, Key, Params};
pub use kv::{KvFetchFn, KvOptions, KvResults, KvSource};
pub use loader::{Loader, LoaderOptions};
pub use outcome::{ErrorPolicy, GetResult, Outcome, OutcomeCounts};
pub use query::{BatchClause, JoinClause, Query, Row};
pub use relational::{QueryFn, RelationalOptions, RelationalSource, RunBatchCall, RunBatchFn};
pub use repo::{MemoryRepo, Repo, RepoOpts};
pub use schema::{AssocKind, Association, EntitySchema, IdType, SchemaRegistry};
pub use source::{RunReport, Source};
