//! The store handle behind a relational source.
//!
//! The engine only needs one capability from the store: execute a [`Query`]
//! and return rows. SQL generation, pooling, and transactions stay on the
//! other side of this trait. [`MemoryRepo`] is the in-crate implementation:
//! JSON tables with a small query interpreter, used by tests and by embedders
//! that have no database at hand.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use std::sync::RwLock;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::BoxError;
use crate::key::{Key, Params};
use crate::query::{row_key, JoinClause, Query, Row};

/// Opaque options forwarded verbatim to every store call.
pub type RepoOpts = Params;

/// Executes queries against the underlying data store.
#[async_trait]
pub trait Repo: Send + Sync {
    /// Runs `query` and returns all matching rows.
    ///
    /// When `query.join` is set, each returned row must additionally carry the
    /// join owner value under [`JoinClause::TAG`].
    async fn all(&self, query: &Query, opts: &RepoOpts) -> Result<Vec<Row>, BoxError>;
}

/// In-memory [`Repo`] over JSON tables.
///
/// Rows keep their insertion order, so unordered queries return rows the way
/// they were seeded. Executed queries are counted, which the test suites use
/// to assert batching behaviour.
#[derive(Default)]
pub struct MemoryRepo {
    tables: RwLock<HashMap<String, Vec<Row>>>,
    calls: AtomicUsize,
}

impl MemoryRepo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a table from JSON objects. Non-object values are ignored.
    pub fn table(self, name: impl Into<String>, rows: Vec<Value>) -> Self {
        let rows = rows
            .into_iter()
            .filter_map(|v| match v {
                Value::Object(row) => Some(row),
                _ => None,
            })
            .collect();
        self.tables.write().unwrap().insert(name.into(), rows);
        self
    }

    /// Appends one row to a table.
    pub fn insert(&self, table: &str, row: Value) {
        if let Value::Object(row) = row {
            self.tables.write().unwrap().entry(table.to_owned()).or_default().push(row);
        }
    }

    /// Number of queries executed so far.
    pub fn calls(&self) -> usize {
        self.calls.load(AtomicOrdering::SeqCst)
    }

    fn plain_select(&self, query: &Query, tables: &HashMap<String, Vec<Row>>) -> Result<Vec<Row>, BoxError> {
        let rows = tables
            .get(&query.table)
            .ok_or_else(|| -> BoxError { format!("unknown table: {}", query.table).into() })?;
        Ok(rows
            .iter()
            .filter(|row| matches_filters(row, &query.filters))
            .filter(|row| match &query.batch {
                Some(batch) => batch.values.contains(&row_key(row, &batch.column)),
                None => true,
            })
            .cloned()
            .collect())
    }

    fn join_select(
        &self,
        query: &Query,
        join: &JoinClause,
        tables: &HashMap<String, Vec<Row>>,
    ) -> Result<Vec<Row>, BoxError> {
        let join_rows = tables
            .get(&join.table)
            .ok_or_else(|| -> BoxError { format!("unknown table: {}", join.table).into() })?;
        let target_rows = tables
            .get(&query.table)
            .ok_or_else(|| -> BoxError { format!("unknown table: {}", query.table).into() })?;

        let mut rows = Vec::new();
        for join_row in join_rows {
            if let Some(batch) = &query.batch {
                if !batch.values.contains(&row_key(join_row, &batch.column)) {
                    continue;
                }
            }
            let related = row_key(join_row, &join.related_column);
            for target in target_rows {
                if row_key(target, &join.target_column) != related
                    || !matches_filters(target, &query.filters)
                {
                    continue;
                }
                let mut tagged = target.clone();
                tagged.insert(
                    JoinClause::TAG.to_owned(),
                    row_key(join_row, &join.owner_column).into_value(),
                );
                rows.push(tagged);
            }
        }
        Ok(rows)
    }
}

fn matches_filters(row: &Row, filters: &[(String, Key)]) -> bool {
    filters.iter().all(|(column, value)| row_key(row, column) == *value)
}

/// Total order over JSON scalars, for `order_by`.
fn value_cmp(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Null, Value::Null) => Ordering::Equal,
        _ => a.to_string().cmp(&b.to_string()),
    }
}

#[async_trait]
impl Repo for MemoryRepo {
    async fn all(&self, query: &Query, _opts: &RepoOpts) -> Result<Vec<Row>, BoxError> {
        self.calls.fetch_add(1, AtomicOrdering::SeqCst);
        let tables = self.tables.read().unwrap();

        let mut rows = match &query.join {
            Some(join) => self.join_select(query, join, &tables)?,
            None => self.plain_select(query, &tables)?,
        };

        for column in query.order_by.iter().rev() {
            rows.sort_by(|a, b| {
                value_cmp(
                    a.get(column).unwrap_or(&Value::Null),
                    b.get(column).unwrap_or(&Value::Null),
                )
            });
        }
        let offset = query.offset.unwrap_or(0) as usize;
        let rows = rows.into_iter().skip(offset);
        Ok(match query.limit {
            Some(limit) => rows.take(limit as usize).collect(),
            None => rows.collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn repo() -> MemoryRepo {
        MemoryRepo::new()
            .table(
                "users",
                vec![
                    json!({"id": 1, "name": "Alice", "role": "admin"}),
                    json!({"id": 2, "name": "Bob", "role": "admin"}),
                    json!({"id": 3, "name": "Carol", "role": "user"}),
                ],
            )
            .table(
                "memberships",
                vec![
                    json!({"user_id": 1, "team_id": 10}),
                    json!({"user_id": 2, "team_id": 10}),
                    json!({"user_id": 1, "team_id": 11}),
                ],
            )
            .table(
                "teams",
                vec![json!({"id": 10, "name": "core"}), json!({"id": 11, "name": "infra"})],
            )
    }

    #[tokio::test]
    async fn filters_and_in_lists_apply() {
        let repo = repo();
        let query = Query::table("users")
            .filter("role", "admin")
            .batched("id", vec![Key::from(1), Key::from(3)]);
        let rows = repo.all(&query, &RepoOpts::new()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["name"], json!("Alice"));
        assert_eq!(repo.calls(), 1);
    }

    #[tokio::test]
    async fn join_rows_carry_the_owner_tag() {
        let repo = repo();
        let query = Query {
            table: "teams".into(),
            join: Some(JoinClause {
                table: "memberships".into(),
                owner_column: "user_id".into(),
                related_column: "team_id".into(),
                target_column: "id".into(),
            }),
            ..Query::default()
        };
        let query = query.batched("user_id", vec![Key::from(1)]);

        let rows = repo.all(&query, &RepoOpts::new()).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r[JoinClause::TAG] == json!(1)));
    }

    #[tokio::test]
    async fn order_offset_and_limit_shape_the_result() {
        let repo = repo();
        let query = Query::table("users").order_by("name").offset(1).limit(1);
        let rows = repo.all(&query, &RepoOpts::new()).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["name"], json!("Bob"));
    }

    #[tokio::test]
    async fn unknown_tables_error() {
        let repo = MemoryRepo::new();
        let err = repo.all(&Query::table("ghosts"), &RepoOpts::new()).await.unwrap_err();
        assert!(err.to_string().contains("unknown table"));
    }
}
