use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::info;

use crate::config::Config;
use crate::store::{DocumentStore, MemoryStore, PgStore};

/// Create a Postgres connection pool for `database_url`.
///
/// Returns a `sqlx::PgPool` or an error if the pool cannot be created.
pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Opens the document store selected by the configuration: PostgreSQL when
/// `DATABASE_URL` is set, the in-memory store otherwise.
pub async fn open_store(config: &Config) -> anyhow::Result<Arc<dyn DocumentStore>> {
    match &config.database_url {
        Some(url) => {
            let pool = create_pool(url, config.database_max_connections).await?;
            let store = PgStore::connect(pool).await?;
            Ok(Arc::new(store))
        }
        None => {
            info!("DATABASE_URL not set, using the in-memory store");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}
