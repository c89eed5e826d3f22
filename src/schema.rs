//! Entity descriptors for the relational source.
//!
//! Schemas stay deliberately small: a table name, a typed primary key, and the
//! associations the engine may walk. Anything richer (column types, changesets,
//! migrations) belongs to the embedding application's data layer.

use std::collections::HashMap;

use serde_json::Value;
use uuid::Uuid;

use crate::error::{BatchError, LoaderError, LoaderResult};
use crate::key::Key;

/// Declared primary-key type. Caller-supplied string ids are coerced using
/// this declaration; mismatches fail the item with a bad-id outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdType {
    Integer,
    Uuid,
    /// Opaque string ids (e.g. externally minted binary ids).
    Binary,
}

impl IdType {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            IdType::Integer => "integer",
            IdType::Uuid => "uuid",
            IdType::Binary => "binary id",
        }
    }

    /// Coerces a caller-supplied id to this type. `"1"` becomes `1` for
    /// integer keys, uuid strings are normalised to their hyphenated
    /// lowercase form, binary ids pass through as strings.
    pub(crate) fn coerce(self, entity: &str, id: &Key) -> Result<Key, BatchError> {
        let bad = || BatchError::BadId {
            entity: entity.to_owned(),
            id: id.clone(),
            expected: self.as_str(),
        };
        match self {
            IdType::Integer => match id.value() {
                Value::Number(n) if n.is_i64() || n.is_u64() => Ok(id.clone()),
                Value::String(s) => {
                    s.parse::<i64>().map(Key::from).map_err(|_| bad())
                }
                _ => Err(bad()),
            },
            IdType::Uuid => match id.value() {
                Value::String(s) => Uuid::parse_str(s)
                    .map(|u| Key::from(u.hyphenated().to_string()))
                    .map_err(|_| bad()),
                _ => Err(bad()),
            },
            IdType::Binary => match id.value() {
                Value::String(_) => Ok(id.clone()),
                _ => Err(bad()),
            },
        }
    }
}

/// How an association reaches its target rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssocKind {
    /// The parent row holds the foreign key; the target is matched on its
    /// primary key. Single-valued.
    BelongsTo { owner_key: String },
    /// The target row holds `related_key` pointing at the parent's primary
    /// key. Single-valued; overflow is an error.
    HasOne { related_key: String },
    /// Like `HasOne` but multi-valued.
    HasMany { related_key: String },
    /// The target is reached through a join table carrying foreign keys to
    /// both sides. Multi-valued.
    ManyToMany { join_table: String, join_owner_key: String, join_related_key: String },
}

impl AssocKind {
    /// Single-valued kinds yield at most one row per parent.
    pub fn single(&self) -> bool {
        matches!(self, AssocKind::BelongsTo { .. } | AssocKind::HasOne { .. })
    }
}

/// A named association on an entity, with an optional equality filter layered
/// onto the target query.
#[derive(Debug, Clone, PartialEq)]
pub struct Association {
    pub target: String,
    pub kind: AssocKind,
    pub filter: Vec<(String, Key)>,
}

/// Descriptor for one entity: its table, primary key, and associations.
#[derive(Debug, Clone)]
pub struct EntitySchema {
    name: String,
    table: String,
    primary_key: String,
    id_type: IdType,
    associations: HashMap<String, Association>,
}

impl EntitySchema {
    /// New schema with the conventional `id` integer primary key.
    pub fn new(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            primary_key: "id".to_owned(),
            id_type: IdType::Integer,
            associations: HashMap::new(),
        }
    }

    pub fn primary_key(mut self, column: impl Into<String>, id_type: IdType) -> Self {
        self.primary_key = column.into();
        self.id_type = id_type;
        self
    }

    /// The parent row's `owner_key` column references the target's primary key.
    pub fn belongs_to(
        self,
        name: impl Into<String>,
        target: impl Into<String>,
        owner_key: impl Into<String>,
    ) -> Self {
        self.assoc(name, target, AssocKind::BelongsTo { owner_key: owner_key.into() })
    }

    /// The target's `related_key` column references this entity's primary key.
    pub fn has_one(
        self,
        name: impl Into<String>,
        target: impl Into<String>,
        related_key: impl Into<String>,
    ) -> Self {
        self.assoc(name, target, AssocKind::HasOne { related_key: related_key.into() })
    }

    pub fn has_many(
        self,
        name: impl Into<String>,
        target: impl Into<String>,
        related_key: impl Into<String>,
    ) -> Self {
        self.assoc(name, target, AssocKind::HasMany { related_key: related_key.into() })
    }

    /// Many-to-many through `join_table`, whose `join_owner_key` references
    /// this entity and `join_related_key` references the target.
    pub fn many_to_many(
        self,
        name: impl Into<String>,
        target: impl Into<String>,
        join_table: impl Into<String>,
        join_owner_key: impl Into<String>,
        join_related_key: impl Into<String>,
    ) -> Self {
        self.assoc(
            name,
            target,
            AssocKind::ManyToMany {
                join_table: join_table.into(),
                join_owner_key: join_owner_key.into(),
                join_related_key: join_related_key.into(),
            },
        )
    }

    /// Adds an equality filter to the most natural place for scoped
    /// associations ("published posts"): the named association's target query.
    pub fn assoc_filter(
        mut self,
        assoc: &str,
        column: impl Into<String>,
        value: impl Into<Key>,
    ) -> Self {
        if let Some(a) = self.associations.get_mut(assoc) {
            a.filter.push((column.into(), value.into()));
        }
        self
    }

    fn assoc(mut self, name: impl Into<String>, target: impl Into<String>, kind: AssocKind) -> Self {
        self.associations
            .insert(name.into(), Association { target: target.into(), kind, filter: Vec::new() });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn pk_column(&self) -> &str {
        &self.primary_key
    }

    pub fn id_type(&self) -> IdType {
        self.id_type
    }

    pub fn association(&self, name: &str) -> Option<&Association> {
        self.associations.get(name)
    }

    /// A record's identity: the value of its primary-key column.
    pub(crate) fn record_id(&self, record: &Key) -> Result<Key, BatchError> {
        record
            .as_object()
            .and_then(|row| row.get(&self.primary_key))
            .map(Key::from)
            .ok_or_else(|| BatchError::BadId {
                entity: self.name.clone(),
                id: record.clone(),
                expected: self.id_type.as_str(),
            })
    }
}

/// The set of entities a relational source can load.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    entities: HashMap<String, EntitySchema>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entity(mut self, schema: EntitySchema) -> Self {
        self.entities.insert(schema.name.clone(), schema);
        self
    }

    /// Looks up an entity; unknown names are configuration errors.
    pub fn get(&self, name: &str) -> LoaderResult<&EntitySchema> {
        self.entities
            .get(name)
            .ok_or_else(|| LoaderError::config(format!("unknown entity: {name}")))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn integer_ids_coerce_from_strings() {
        assert_eq!(IdType::Integer.coerce("User", &Key::from("7")), Ok(Key::from(7)));
        assert_eq!(IdType::Integer.coerce("User", &Key::from(7)), Ok(Key::from(7)));
        assert!(matches!(
            IdType::Integer.coerce("User", &Key::from("seven")),
            Err(BatchError::BadId { .. })
        ));
    }

    #[test]
    fn uuid_ids_normalise_to_hyphenated_lowercase() {
        let raw = Key::from("67E5504410B1426F9247BB680E5FE0C8");
        let coerced = IdType::Uuid.coerce("Account", &raw).unwrap();
        assert_eq!(coerced, Key::from("67e55044-10b1-426f-9247-bb680e5fe0c8"));
        assert!(matches!(
            IdType::Uuid.coerce("Account", &Key::from(5)),
            Err(BatchError::BadId { .. })
        ));
    }

    #[test]
    fn binary_ids_only_accept_strings() {
        assert!(IdType::Binary.coerce("Doc", &Key::from("abc")).is_ok());
        assert!(IdType::Binary.coerce("Doc", &Key::from(1)).is_err());
    }

    #[test]
    fn registry_resolves_entities_and_associations() {
        let registry = SchemaRegistry::new().entity(
            EntitySchema::new("User", "users")
                .has_many("posts", "Post", "user_id")
                .assoc_filter("posts", "published", true),
        );

        let user = registry.get("User").unwrap();
        let posts = user.association("posts").unwrap();
        assert_eq!(posts.target, "Post");
        assert_eq!(posts.filter, vec![("published".to_owned(), Key::from(true))]);
        assert!(!posts.kind.single());

        assert!(matches!(registry.get("Ghost"), Err(LoaderError::Config { .. })));
    }

    #[test]
    fn record_identity_is_the_primary_key_value() {
        let schema = EntitySchema::new("User", "users");
        let record = Key::from(json!({"id": 3, "name": "Carol"}));
        assert_eq!(schema.record_id(&record), Ok(Key::from(3)));
        assert!(schema.record_id(&Key::from(json!({"name": "no id"}))).is_err());
    }
}
