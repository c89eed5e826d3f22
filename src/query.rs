//! Abstract query values handed to a [`Repo`](crate::repo::Repo).
//!
//! A `Query` describes what to fetch; it never executes. The engine builds the
//! base query (through the user's `query` hook), layers on the batching
//! predicate, and hands the result to the repo, which translates it to its own
//! query language.

use serde_json::Value;

use crate::key::Key;

/// A fetched row: a JSON object of column values.
pub type Row = serde_json::Map<String, Value>;

/// The in-list predicate the engine adds for a batch. With a join clause
/// present, `column` refers to the join table; otherwise to the target table.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchClause {
    pub column: String,
    pub values: Vec<Key>,
}

/// Bridge through a join table for many-to-many associations.
///
/// Rows returned for a joined query must carry the join's owner value under
/// [`JoinClause::TAG`], so the engine can hand each row back to its parent.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinClause {
    /// The join table.
    pub table: String,
    /// Join-table column referencing the parent entity.
    pub owner_column: String,
    /// Join-table column referencing the target entity.
    pub related_column: String,
    /// Target-table column the join matches (normally its primary key).
    pub target_column: String,
}

impl JoinClause {
    /// Reserved row field carrying the join owner value on joined results.
    pub const TAG: &'static str = "__batch_parent";
}

/// A declarative select over one table.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Query {
    pub table: String,
    /// Equality filters, conjoined.
    pub filters: Vec<(String, Key)>,
    /// The batching predicate; set by the engine, not by `query` hooks.
    pub batch: Option<BatchClause>,
    pub join: Option<JoinClause>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    /// Column names to sort by, ascending, applied in order.
    pub order_by: Vec<String>,
}

impl Query {
    pub fn table(table: impl Into<String>) -> Self {
        Self { table: table.into(), ..Self::default() }
    }

    pub fn filter(mut self, column: impl Into<String>, value: impl Into<Key>) -> Self {
        self.filters.push((column.into(), value.into()));
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn order_by(mut self, column: impl Into<String>) -> Self {
        self.order_by.push(column.into());
        self
    }

    pub(crate) fn batched(mut self, column: impl Into<String>, values: Vec<Key>) -> Self {
        self.batch = Some(BatchClause { column: column.into(), values });
        self
    }
}

/// Reads one column of a row as a [`Key`], `Null` when absent.
pub(crate) fn row_key(row: &Row, column: &str) -> Key {
    row.get(column).map(Key::from).unwrap_or_else(|| Key::from(Value::Null))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builders_compose() {
        let query = Query::table("posts")
            .filter("published", true)
            .order_by("inserted_at")
            .limit(10)
            .batched("user_id", vec![Key::from(1), Key::from(2)]);

        assert_eq!(query.table, "posts");
        assert_eq!(query.filters, vec![("published".to_owned(), Key::from(true))]);
        assert_eq!(query.limit, Some(10));
        let batch = query.batch.unwrap();
        assert_eq!(batch.column, "user_id");
        assert_eq!(batch.values.len(), 2);
    }
}
