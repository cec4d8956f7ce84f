//! Document store boundary.
//!
//! The engine persists every record as a schemaless JSON document inside a named
//! collection. Backends assign ids, keep a per-document revision for
//! compare-and-swap updates, merge partial writes field by field and broadcast
//! a [`ChangeEvent`] for every mutation.

use std::cmp::Ordering;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::broadcast;

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Top-level fields of a document.
pub type Fields = Map<String, Value>;

/// Collection names used by the engine.
pub mod collections {
    pub const INVOICES: &str = "invoices";
    pub const CUSTOMERS: &str = "customers";
    pub const COUNTERS: &str = "counters";
}

/// Errors raised by a store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("document {collection}/{id} not found")]
    NotFound { collection: String, id: String },

    #[error("document {collection}/{id} already exists")]
    AlreadyExists { collection: String, id: String },

    #[error("document {collection}/{id} was modified concurrently")]
    RevisionMismatch { collection: String, id: String },

    #[error("document serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    pub(crate) fn not_found(collection: &str, id: &str) -> Self {
        StoreError::NotFound {
            collection: collection.to_string(),
            id: id.to_string(),
        }
    }

    pub(crate) fn already_exists(collection: &str, id: &str) -> Self {
        StoreError::AlreadyExists {
            collection: collection.to_string(),
            id: id.to_string(),
        }
    }

    pub(crate) fn revision_mismatch(collection: &str, id: &str) -> Self {
        StoreError::RevisionMismatch {
            collection: collection.to_string(),
            id: id.to_string(),
        }
    }
}

/// A stored document together with its server-side metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    /// Incremented on every write; used for compare-and-swap preconditions.
    pub revision: i64,
    pub fields: Fields,
}

impl Document {
    /// Deserializes the document body into a typed record.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, StoreError> {
        Ok(serde_json::from_value(Value::Object(self.fields.clone()))?)
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }
}

/// Serializes a record into document fields, dropping the `id` key which is
/// owned by the store.
pub fn to_fields<T: Serialize>(record: &T) -> Result<Fields, StoreError> {
    match serde_json::to_value(record)? {
        Value::Object(mut fields) => {
            fields.remove("id");
            Ok(fields)
        }
        other => Err(StoreError::Serialization(serde::ser::Error::custom(
            format!("expected a JSON object, got {}", other),
        ))),
    }
}

/// Serializes `record` and keeps only the named top-level fields, so a write
/// merges exactly what changed. Names missing from the record become `null`.
pub fn select_fields<'a, T: Serialize>(
    record: &T,
    names: impl IntoIterator<Item = &'a str>,
) -> Result<Fields, StoreError> {
    let mut all = to_fields(record)?;
    let mut selected = Fields::new();
    for name in names {
        let value = all.remove(name).unwrap_or(Value::Null);
        selected.insert(name.to_string(), value);
    }
    Ok(selected)
}

/// Query predicate on a top-level field.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq(String, Value),
    In(String, Vec<Value>),
}

impl Filter {
    pub fn matches(&self, fields: &Fields) -> bool {
        match self {
            Filter::Eq(field, expected) => fields.get(field) == Some(expected),
            Filter::In(field, candidates) => fields
                .get(field)
                .map(|value| candidates.contains(value))
                .unwrap_or(false),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

/// Filter, order and limit for [`DocumentStore::query`].
#[derive(Debug, Clone, Default)]
pub struct Query {
    pub filters: Vec<Filter>,
    pub order_by: Option<(String, Direction)>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter_eq(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.filters.push(Filter::Eq(field.to_string(), value.into()));
        self
    }

    pub fn filter_in(mut self, field: &str, values: Vec<Value>) -> Self {
        self.filters.push(Filter::In(field.to_string(), values));
        self
    }

    pub fn order_by(mut self, field: &str, direction: Direction) -> Self {
        self.order_by = Some((field.to_string(), direction));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, fields: &Fields) -> bool {
        self.filters.iter().all(|filter| filter.matches(fields))
    }
}

/// Guard applied to an update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Precondition {
    /// Last write wins.
    None,
    /// Apply only if the stored revision still equals this value.
    Revision(i64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

/// Notification published after every successful mutation.
///
/// `fields` carries the document body after the write (or before it, for
/// deletions). Backends may leave it empty when the body is too large to
/// ship; subscribers must then assume the change could concern them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub collection: String,
    pub id: String,
    pub kind: ChangeKind,
    #[serde(default)]
    pub fields: Option<Fields>,
}

impl ChangeEvent {
    /// Whether this change may affect documents of `collection` whose `field`
    /// equals `value`.
    pub fn may_touch(&self, collection: &str, field: &str, value: &Value) -> bool {
        if self.collection != collection {
            return false;
        }
        match &self.fields {
            Some(fields) => fields.get(field) == Some(value),
            None => true,
        }
    }
}

/// Storage backend used by every record adapter.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Inserts a document under a server-assigned id.
    async fn create(&self, collection: &str, fields: Fields) -> Result<Document, StoreError>;

    /// Inserts a document under a caller-chosen id, failing with
    /// [`StoreError::AlreadyExists`] if it is taken.
    async fn create_with_id(
        &self,
        collection: &str,
        id: &str,
        fields: Fields,
    ) -> Result<Document, StoreError>;

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError>;

    async fn query(&self, collection: &str, query: &Query) -> Result<Vec<Document>, StoreError>;

    /// Merges `fields` into the stored document (top-level keys only) and bumps
    /// its revision.
    async fn update(
        &self,
        collection: &str,
        id: &str,
        fields: Fields,
        precondition: Precondition,
    ) -> Result<Document, StoreError>;

    async fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError>;

    /// Subscribes to the change feed of every collection.
    fn changes(&self) -> broadcast::Receiver<ChangeEvent>;

    /// Cheap round trip used by health checks.
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Total order over JSON values used for in-process sorting: nulls first, then
/// booleans, numbers, strings and finally composite values.
pub(crate) fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(value: Option<&Value>) -> u8 {
        match value {
            None | Some(Value::Null) => 0,
            Some(Value::Bool(_)) => 1,
            Some(Value::Number(_)) => 2,
            Some(Value::String(_)) => 3,
            Some(Value::Array(_)) => 4,
            Some(Value::Object(_)) => 5,
        }
    }

    match (a, b) {
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(Value::Number(x)), Some(Value::Number(y))) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => {
                let x = x.as_f64().unwrap_or(f64::NAN);
                let y = y.as_f64().unwrap_or(f64::NAN);
                x.partial_cmp(&y).unwrap_or(Ordering::Equal)
            }
        },
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: Value) -> Fields {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_filters_match_top_level_fields() {
        let doc = fields(json!({"owner_id": "u1", "status": "sent"}));

        assert!(Filter::Eq("owner_id".into(), json!("u1")).matches(&doc));
        assert!(!Filter::Eq("owner_id".into(), json!("u2")).matches(&doc));
        assert!(Filter::In("status".into(), vec![json!("sent"), json!("overdue")]).matches(&doc));
        assert!(!Filter::In("missing".into(), vec![json!("sent")]).matches(&doc));
    }

    #[test]
    fn test_compare_values_orders_numbers_numerically() {
        assert_eq!(
            compare_values(Some(&json!(9)), Some(&json!(10))),
            Ordering::Less
        );
        assert_eq!(
            compare_values(Some(&json!(1.5)), Some(&json!(1))),
            Ordering::Greater
        );
        assert_eq!(compare_values(None, Some(&json!(0))), Ordering::Less);
    }

    #[test]
    fn test_change_event_without_body_may_touch_anything() {
        let event = ChangeEvent {
            collection: collections::INVOICES.into(),
            id: "x".into(),
            kind: ChangeKind::Deleted,
            fields: None,
        };
        assert!(event.may_touch(collections::INVOICES, "owner_id", &json!("u1")));
        assert!(!event.may_touch(collections::CUSTOMERS, "owner_id", &json!("u1")));
    }

    #[test]
    fn test_to_fields_drops_id() {
        let out = to_fields(&json!({"id": "abc", "name": "Acme"})).unwrap();
        assert!(!out.contains_key("id"));
        assert_eq!(out.get("name"), Some(&json!("Acme")));
    }

    #[test]
    fn test_select_fields_nulls_absent_names() {
        let out = select_fields(&json!({"a": 1, "b": 2}), ["a", "c"]).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out.get("a"), Some(&json!(1)));
        assert_eq!(out.get("c"), Some(&Value::Null));
    }
}
