use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

use async_trait::async_trait;
use tokio::sync::{broadcast, RwLock};
use tracing::debug;
use uuid::Uuid;

use super::{
    compare_values, ChangeEvent, ChangeKind, Direction, Document, DocumentStore, Fields,
    Precondition, Query, StoreError,
};

const CHANGE_FEED_CAPACITY: usize = 256;

struct Slot {
    /// Insertion sequence, used as the tie-breaker when ordering.
    seq: u64,
    revision: i64,
    fields: Fields,
}

impl Slot {
    fn to_document(&self, id: &str) -> Document {
        Document {
            id: id.to_string(),
            revision: self.revision,
            fields: self.fields.clone(),
        }
    }
}

/// In-process document store.
///
/// Used when no database is configured and by the test suite. Each collection
/// is a map guarded by a single async lock; the change feed is a broadcast
/// channel shared by every subscriber.
pub struct MemoryStore {
    collections: RwLock<HashMap<String, HashMap<String, Slot>>>,
    sequence: AtomicU64,
    changes: broadcast::Sender<ChangeEvent>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            collections: RwLock::new(HashMap::new()),
            sequence: AtomicU64::new(0),
            changes,
        }
    }

    fn publish(&self, collection: &str, id: &str, kind: ChangeKind, fields: Fields) {
        let event = ChangeEvent {
            collection: collection.to_string(),
            id: id.to_string(),
            kind,
            fields: Some(fields),
        };
        // No receivers simply means nobody is subscribed right now.
        if self.changes.send(event).is_err() {
            debug!(collection, id, "change published without subscribers");
        }
    }

    async fn insert(
        &self,
        collection: &str,
        id: String,
        fields: Fields,
    ) -> Result<Document, StoreError> {
        let document = {
            let mut collections = self.collections.write().await;
            let docs = collections.entry(collection.to_string()).or_default();
            if docs.contains_key(&id) {
                return Err(StoreError::already_exists(collection, &id));
            }
            let slot = Slot {
                seq: self.sequence.fetch_add(1, AtomicOrdering::SeqCst),
                revision: 1,
                fields,
            };
            let document = slot.to_document(&id);
            docs.insert(id, slot);
            document
        };

        self.publish(
            collection,
            &document.id,
            ChangeKind::Created,
            document.fields.clone(),
        );
        Ok(document)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn create(&self, collection: &str, fields: Fields) -> Result<Document, StoreError> {
        self.insert(collection, Uuid::new_v4().to_string(), fields)
            .await
    }

    async fn create_with_id(
        &self,
        collection: &str,
        id: &str,
        fields: Fields,
    ) -> Result<Document, StoreError> {
        self.insert(collection, id.to_string(), fields).await
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .and_then(|docs| docs.get(id))
            .map(|slot| slot.to_document(id)))
    }

    async fn query(&self, collection: &str, query: &Query) -> Result<Vec<Document>, StoreError> {
        let collections = self.collections.read().await;
        let Some(docs) = collections.get(collection) else {
            return Ok(Vec::new());
        };

        let mut matched: Vec<(&String, &Slot)> = docs
            .iter()
            .filter(|(_, slot)| query.matches(&slot.fields))
            .collect();

        match &query.order_by {
            Some((field, direction)) => matched.sort_by(|(_, a), (_, b)| {
                let ordering = compare_values(a.fields.get(field), b.fields.get(field))
                    .then(a.seq.cmp(&b.seq));
                match direction {
                    Direction::Ascending => ordering,
                    Direction::Descending => ordering.reverse(),
                }
            }),
            None => matched.sort_by_key(|(_, slot)| slot.seq),
        }

        let limit = query.limit.unwrap_or(usize::MAX);
        Ok(matched
            .into_iter()
            .take(limit)
            .map(|(id, slot)| slot.to_document(id))
            .collect())
    }

    async fn update(
        &self,
        collection: &str,
        id: &str,
        fields: Fields,
        precondition: Precondition,
    ) -> Result<Document, StoreError> {
        let document = {
            let mut collections = self.collections.write().await;
            let slot = collections
                .get_mut(collection)
                .and_then(|docs| docs.get_mut(id))
                .ok_or_else(|| StoreError::not_found(collection, id))?;

            if let Precondition::Revision(expected) = precondition {
                if slot.revision != expected {
                    return Err(StoreError::revision_mismatch(collection, id));
                }
            }

            for (key, value) in fields {
                slot.fields.insert(key, value);
            }
            slot.revision += 1;
            slot.to_document(id)
        };

        self.publish(collection, id, ChangeKind::Updated, document.fields.clone());
        Ok(document)
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError> {
        let removed = {
            let mut collections = self.collections.write().await;
            collections
                .get_mut(collection)
                .and_then(|docs| docs.remove(id))
                .ok_or_else(|| StoreError::not_found(collection, id))?
        };

        self.publish(collection, id, ChangeKind::Deleted, removed.fields);
        Ok(())
    }

    fn changes(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::to_fields;
    use serde_json::json;

    #[tokio::test]
    async fn test_update_merges_top_level_fields() {
        let store = MemoryStore::new();
        let doc = store
            .create("things", to_fields(&json!({"a": 1, "b": 2})).unwrap())
            .await
            .unwrap();

        let updated = store
            .update(
                "things",
                &doc.id,
                to_fields(&json!({"b": 3, "c": 4})).unwrap(),
                Precondition::None,
            )
            .await
            .unwrap();

        assert_eq!(updated.revision, 2);
        assert_eq!(updated.field("a"), Some(&json!(1)));
        assert_eq!(updated.field("b"), Some(&json!(3)));
        assert_eq!(updated.field("c"), Some(&json!(4)));
    }

    #[tokio::test]
    async fn test_revision_precondition_rejects_stale_writes() {
        let store = MemoryStore::new();
        let doc = store
            .create("things", to_fields(&json!({"a": 1})).unwrap())
            .await
            .unwrap();
        store
            .update("things", &doc.id, Fields::new(), Precondition::None)
            .await
            .unwrap();

        let stale = store
            .update(
                "things",
                &doc.id,
                Fields::new(),
                Precondition::Revision(doc.revision),
            )
            .await;
        assert!(matches!(stale, Err(StoreError::RevisionMismatch { .. })));
    }

    #[tokio::test]
    async fn test_query_orders_descending_with_insertion_tiebreak() {
        let store = MemoryStore::new();
        for (name, at) in [("first", 10), ("second", 20), ("third", 20)] {
            store
                .create(
                    "things",
                    to_fields(&json!({"name": name, "at": at, "owner": "u1"})).unwrap(),
                )
                .await
                .unwrap();
        }
        store
            .create("things", to_fields(&json!({"name": "other", "at": 99, "owner": "u2"})).unwrap())
            .await
            .unwrap();

        let docs = store
            .query(
                "things",
                &Query::new()
                    .filter_eq("owner", "u1")
                    .order_by("at", Direction::Descending),
            )
            .await
            .unwrap();
        let names: Vec<_> = docs
            .iter()
            .map(|d| d.field("name").and_then(|v| v.as_str()).unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["third", "second", "first"]);
    }

    #[tokio::test]
    async fn test_create_with_id_rejects_duplicates() {
        let store = MemoryStore::new();
        store
            .create_with_id("counters", "u1", Fields::new())
            .await
            .unwrap();
        let again = store.create_with_id("counters", "u1", Fields::new()).await;
        assert!(matches!(again, Err(StoreError::AlreadyExists { .. })));
    }

    #[tokio::test]
    async fn test_mutations_are_published() {
        let store = MemoryStore::new();
        let mut feed = store.changes();

        let doc = store
            .create("things", to_fields(&json!({"a": 1})).unwrap())
            .await
            .unwrap();
        store.delete("things", &doc.id).await.unwrap();

        let created = feed.recv().await.unwrap();
        let deleted = feed.recv().await.unwrap();
        assert_eq!(created.kind, ChangeKind::Created);
        assert_eq!(deleted.kind, ChangeKind::Deleted);
        assert_eq!(deleted.fields.unwrap().get("a"), Some(&json!(1)));
    }
}
