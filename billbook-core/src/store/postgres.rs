use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgListener, PgPool};
use sqlx::{Postgres, QueryBuilder};
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::{
    ChangeEvent, ChangeKind, Direction, Document, DocumentStore, Fields, Filter, Precondition,
    Query, StoreError,
};

/// `NOTIFY` channel carrying [`ChangeEvent`]s between processes.
const NOTIFY_CHANNEL: &str = "billbook_document_changes";

/// Postgres rejects notification payloads of 8000 bytes or more.
const MAX_NOTIFY_PAYLOAD: usize = 7900;

const CHANGE_FEED_CAPACITY: usize = 256;

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

type DocumentRow = (String, i64, Value);

fn into_document((id, revision, data): DocumentRow) -> Document {
    let fields = match data {
        Value::Object(fields) => fields,
        _ => Fields::new(),
    };
    Document {
        id,
        revision,
        fields,
    }
}

/// PostgreSQL-backed document store.
///
/// Every collection lives in a single `documents` table with a JSONB body.
/// Writes are announced with `pg_notify`, and a background [`PgListener`]
/// feeds them back into the local broadcast channel, so subscribers in this
/// process also see changes made by other processes (the sweep worker).
pub struct PgStore {
    pool: PgPool,
    changes: broadcast::Sender<ChangeEvent>,
}

impl PgStore {
    /// Prepares the schema and starts the change listener.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the schema cannot be created or
    /// the listener cannot subscribe to the notification channel.
    pub async fn connect(pool: PgPool) -> Result<Self, StoreError> {
        Self::ensure_schema(&pool).await?;

        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        let mut listener = PgListener::connect_with(&pool).await?;
        listener.listen(NOTIFY_CHANNEL).await?;
        tokio::spawn(forward_notifications(listener, changes.clone()));

        info!("PostgreSQL document store ready");
        Ok(Self { pool, changes })
    }

    async fn ensure_schema(pool: &PgPool) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                seq BIGSERIAL,
                collection TEXT NOT NULL,
                id TEXT NOT NULL,
                revision BIGINT NOT NULL DEFAULT 1,
                data JSONB NOT NULL,
                PRIMARY KEY (collection, id)
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS documents_owner_idx
            ON documents (collection, (data ->> 'owner_id'))
            "#,
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    async fn notify(&self, collection: &str, id: &str, kind: ChangeKind, fields: &Fields) {
        let mut event = ChangeEvent {
            collection: collection.to_string(),
            id: id.to_string(),
            kind,
            fields: Some(fields.clone()),
        };

        let payload = match serde_json::to_string(&event) {
            Ok(payload) if payload.len() <= MAX_NOTIFY_PAYLOAD => payload,
            _ => {
                event.fields = None;
                match serde_json::to_string(&event) {
                    Ok(payload) => payload,
                    Err(e) => {
                        error!(collection, id, error = %e, "Failed to encode change event");
                        return;
                    }
                }
            }
        };

        if let Err(e) = sqlx::query("SELECT pg_notify($1, $2)")
            .bind(NOTIFY_CHANNEL)
            .bind(payload)
            .execute(&self.pool)
            .await
        {
            // The write itself succeeded; subscribers catch up on the next change.
            warn!(collection, id, error = %e, "Failed to publish change notification");
        }
    }

    async fn insert(
        &self,
        collection: &str,
        id: &str,
        fields: Fields,
    ) -> Result<Document, StoreError> {
        let row = sqlx::query_as::<_, DocumentRow>(
            r#"
            INSERT INTO documents (collection, id, revision, data)
            VALUES ($1, $2, 1, $3)
            ON CONFLICT (collection, id) DO NOTHING
            RETURNING id, revision, data
            "#,
        )
        .bind(collection)
        .bind(id)
        .bind(Value::Object(fields))
        .fetch_optional(&self.pool)
        .await?;

        let document = row
            .map(into_document)
            .ok_or_else(|| StoreError::already_exists(collection, id))?;

        self.notify(collection, &document.id, ChangeKind::Created, &document.fields)
            .await;
        Ok(document)
    }
}

async fn forward_notifications(mut listener: PgListener, changes: broadcast::Sender<ChangeEvent>) {
    loop {
        match listener.recv().await {
            Ok(notification) => match serde_json::from_str::<ChangeEvent>(notification.payload()) {
                Ok(event) => {
                    let _ = changes.send(event);
                }
                Err(e) => warn!(error = %e, "Ignoring malformed change notification"),
            },
            Err(e) => {
                error!(error = %e, "Change listener lost its connection, retrying");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

fn push_filters(builder: &mut QueryBuilder<'_, Postgres>, filters: &[Filter]) {
    for filter in filters {
        match filter {
            Filter::Eq(field, value) => {
                builder.push(" AND data -> ");
                builder.push_bind(field.clone());
                builder.push(" = ");
                builder.push_bind(value.clone());
            }
            Filter::In(field, values) => {
                // A JSONB array contains a scalar if any element equals it.
                builder.push(" AND ");
                builder.push_bind(Value::Array(values.clone()));
                builder.push(" @> (data -> ");
                builder.push_bind(field.clone());
                builder.push(")");
            }
        }
    }
}

#[async_trait]
impl DocumentStore for PgStore {
    async fn create(&self, collection: &str, fields: Fields) -> Result<Document, StoreError> {
        self.insert(collection, &Uuid::new_v4().to_string(), fields)
            .await
    }

    async fn create_with_id(
        &self,
        collection: &str,
        id: &str,
        fields: Fields,
    ) -> Result<Document, StoreError> {
        self.insert(collection, id, fields).await
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Document>, StoreError> {
        let row = sqlx::query_as::<_, DocumentRow>(
            "SELECT id, revision, data FROM documents WHERE collection = $1 AND id = $2",
        )
        .bind(collection)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(into_document))
    }

    async fn query(&self, collection: &str, query: &Query) -> Result<Vec<Document>, StoreError> {
        let mut builder =
            QueryBuilder::<Postgres>::new("SELECT id, revision, data FROM documents WHERE collection = ");
        builder.push_bind(collection.to_string());
        push_filters(&mut builder, &query.filters);

        match &query.order_by {
            Some((field, direction)) => {
                let keyword = match direction {
                    Direction::Ascending => "ASC",
                    Direction::Descending => "DESC",
                };
                builder.push(" ORDER BY data -> ");
                builder.push_bind(field.clone());
                builder.push(format!(" {keyword}, seq {keyword}"));
            }
            None => {
                builder.push(" ORDER BY seq ASC");
            }
        }

        if let Some(limit) = query.limit {
            builder.push(" LIMIT ");
            builder.push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
        }

        let rows = builder
            .build_query_as::<DocumentRow>()
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(into_document).collect())
    }

    async fn update(
        &self,
        collection: &str,
        id: &str,
        fields: Fields,
        precondition: Precondition,
    ) -> Result<Document, StoreError> {
        let expected = match precondition {
            Precondition::None => None,
            Precondition::Revision(revision) => Some(revision),
        };

        let row = sqlx::query_as::<_, DocumentRow>(
            r#"
            UPDATE documents
            SET data = data || $3, revision = revision + 1
            WHERE collection = $1 AND id = $2
              AND ($4::BIGINT IS NULL OR revision = $4)
            RETURNING id, revision, data
            "#,
        )
        .bind(collection)
        .bind(id)
        .bind(Value::Object(fields))
        .bind(expected)
        .fetch_optional(&self.pool)
        .await?;

        let document = match row {
            Some(row) => into_document(row),
            None => {
                return Err(if self.get(collection, id).await?.is_some() {
                    StoreError::revision_mismatch(collection, id)
                } else {
                    StoreError::not_found(collection, id)
                });
            }
        };

        self.notify(collection, id, ChangeKind::Updated, &document.fields)
            .await;
        Ok(document)
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError> {
        let removed = sqlx::query_as::<_, (Value,)>(
            "DELETE FROM documents WHERE collection = $1 AND id = $2 RETURNING data",
        )
        .bind(collection)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let Some((data,)) = removed else {
            return Err(StoreError::not_found(collection, id));
        };
        let fields = match data {
            Value::Object(fields) => fields,
            _ => Fields::new(),
        };

        self.notify(collection, id, ChangeKind::Deleted, &fields).await;
        Ok(())
    }

    fn changes(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::to_fields;
    use serde_json::json;

    /// Creates a store against `DATABASE_URL`.
    async fn create_test_store() -> Result<PgStore, anyhow::Error> {
        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL not set for tests"))?;
        let pool = crate::db::create_pool(&database_url, 2).await?;
        Ok(PgStore::connect(pool).await?)
    }

    #[tokio::test]
    #[ignore] // Requires database setup
    async fn test_round_trip_against_postgres() {
        let store = create_test_store().await.expect("Failed to create test store");
        let collection = format!("test_{}", Uuid::new_v4().simple());

        let doc = store
            .create(&collection, to_fields(&json!({"owner_id": "u1", "at": 1})).unwrap())
            .await
            .expect("create should succeed");
        store
            .update(
                &collection,
                &doc.id,
                to_fields(&json!({"at": 2})).unwrap(),
                Precondition::Revision(doc.revision),
            )
            .await
            .expect("update should succeed");

        let found = store
            .query(
                &collection,
                &Query::new()
                    .filter_eq("owner_id", "u1")
                    .order_by("at", Direction::Descending)
                    .limit(1),
            )
            .await
            .expect("query should succeed");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].field("at"), Some(&json!(2)));
        assert_eq!(found[0].revision, 2);

        store.delete(&collection, &doc.id).await.expect("delete should succeed");
        assert!(store.get(&collection, &doc.id).await.unwrap().is_none());
    }
}
