use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A canonicalised value used to identify batches and items.
///
/// `Key` wraps a [`serde_json::Value`] and gives it the `Eq + Hash` contract
/// the pending and result tables need. Equality is structural (maps compare as
/// maps, independent of entry order) and hashing matches it: object entries
/// are hashed in sorted-key order and integer representations are widened so
/// that `1u64` and `1i64` unify. Strings never unify with numbers; `"1"` and
/// `1` are distinct keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Key(Value);

impl Key {
    pub fn value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    pub fn as_str(&self) -> Option<&str> {
        self.0.as_str()
    }

    pub fn as_object(&self) -> Option<&serde_json::Map<String, Value>> {
        self.0.as_object()
    }
}

impl Eq for Key {}

impl Hash for Key {
    fn hash<H: Hasher>(&self, state: &mut H) {
        hash_value(&self.0, state);
    }
}

fn hash_value<H: Hasher>(value: &Value, state: &mut H) {
    match value {
        Value::Null => 0u8.hash(state),
        Value::Bool(b) => {
            1u8.hash(state);
            b.hash(state);
        }
        Value::Number(n) => {
            // Widen integers so u64/i64 spellings of the same id hash alike.
            if let Some(u) = n.as_u64() {
                2u8.hash(state);
                (u as i128).hash(state);
            } else if let Some(i) = n.as_i64() {
                2u8.hash(state);
                (i as i128).hash(state);
            } else {
                3u8.hash(state);
                n.as_f64().unwrap_or(0.0).to_bits().hash(state);
            }
        }
        Value::String(s) => {
            4u8.hash(state);
            s.hash(state);
        }
        Value::Array(items) => {
            5u8.hash(state);
            items.len().hash(state);
            for item in items {
                hash_value(item, state);
            }
        }
        Value::Object(map) => {
            6u8.hash(state);
            map.len().hash(state);
            // Sorted traversal keeps the hash stable however the map was built.
            let sorted: BTreeMap<&String, &Value> = map.iter().collect();
            for (k, v) in sorted {
                k.hash(state);
                hash_value(v, state);
            }
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Value> for Key {
    fn from(value: Value) -> Self {
        Key(value)
    }
}

impl From<&Value> for Key {
    fn from(value: &Value) -> Self {
        Key(value.clone())
    }
}

impl From<i64> for Key {
    fn from(value: i64) -> Self {
        Key(Value::from(value))
    }
}

impl From<u64> for Key {
    fn from(value: u64) -> Self {
        Key(Value::from(value))
    }
}

impl From<i32> for Key {
    fn from(value: i32) -> Self {
        Key(Value::from(value))
    }
}

impl From<&str> for Key {
    fn from(value: &str) -> Self {
        Key(Value::from(value))
    }
}

impl From<String> for Key {
    fn from(value: String) -> Self {
        Key(Value::from(value))
    }
}

impl From<bool> for Key {
    fn from(value: bool) -> Self {
        Key(Value::from(value))
    }
}

/// Source-specific load options, keyed by option name.
///
/// A `BTreeMap` keeps the option keys totally ordered, so two parameter sets
/// built in different orders are the same value.
pub type Params = BTreeMap<String, Key>;

/// Arity contract for column and association loads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cardinality {
    /// At most one row per item; overflow is an error.
    One,
    /// An ordered sequence per item, possibly empty.
    Many,
}

/// Identifies what kind of load an item belongs to.
///
/// Two loads coalesce into one backend call exactly when their batch keys are
/// value-equal, so everything that makes batches non-unifiable (entity,
/// cardinality, column, params such as `limit`/`offset`) lives in here.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BatchKey {
    /// Arbitrary tag for KV sources.
    Kv(Key),
    /// Primary-key load: items are scalar ids of `entity`.
    Entity { entity: String, params: Params },
    /// Column load: items are single-entry `{column: value}` maps.
    Column { cardinality: Cardinality, entity: String, params: Params },
    /// Association load: items are records of the parent `entity`.
    Assoc { entity: String, assoc: String, params: Params },
}

impl BatchKey {
    /// Batch key for a KV source, tagged with any value.
    pub fn kv(tag: impl Into<Key>) -> Self {
        BatchKey::Kv(tag.into())
    }

    /// Primary-key load of `entity`.
    pub fn entity(entity: impl Into<String>) -> Self {
        BatchKey::Entity { entity: entity.into(), params: Params::new() }
    }

    /// Column load with `Cardinality::One`.
    pub fn one(entity: impl Into<String>) -> Self {
        BatchKey::Column {
            cardinality: Cardinality::One,
            entity: entity.into(),
            params: Params::new(),
        }
    }

    /// Column load with `Cardinality::Many`.
    pub fn many(entity: impl Into<String>) -> Self {
        BatchKey::Column {
            cardinality: Cardinality::Many,
            entity: entity.into(),
            params: Params::new(),
        }
    }

    /// Association load: `assoc` as declared on the schema of `parent`.
    pub fn assoc(parent: impl Into<String>, assoc: impl Into<String>) -> Self {
        BatchKey::Assoc { entity: parent.into(), assoc: assoc.into(), params: Params::new() }
    }

    /// Adds a load option. Options are part of the batch identity: two keys
    /// differing on any option never share a backend call.
    ///
    /// # Panics
    ///
    /// Panics when called on a [`BatchKey::Kv`] key. KV tags are opaque to
    /// the engine and carry no option mapping; anything that should keep two
    /// KV batches apart belongs in the tag value itself.
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<Key>) -> Self {
        match &mut self {
            BatchKey::Kv(tag) => {
                panic!("load options are not supported on kv batch key {tag}; encode them into the tag")
            }
            BatchKey::Entity { params, .. }
            | BatchKey::Column { params, .. }
            | BatchKey::Assoc { params, .. } => {
                params.insert(name.into(), value.into());
            }
        }
        self
    }

    pub fn params(&self) -> Option<&Params> {
        match self {
            BatchKey::Kv(_) => None,
            BatchKey::Entity { params, .. }
            | BatchKey::Column { params, .. }
            | BatchKey::Assoc { params, .. } => Some(params),
        }
    }
}

impl fmt::Display for BatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchKey::Kv(tag) => write!(f, "kv:{tag}"),
            BatchKey::Entity { entity, .. } => write!(f, "{entity}"),
            BatchKey::Column { cardinality, entity, .. } => {
                let card = match cardinality {
                    Cardinality::One => "one",
                    Cardinality::Many => "many",
                };
                write!(f, "{card}:{entity}")
            }
            BatchKey::Assoc { entity, assoc, .. } => write!(f, "{entity}.{assoc}"),
        }
    }
}
