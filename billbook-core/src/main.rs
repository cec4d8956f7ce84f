use std::sync::Arc;

use billbook_core::api::{create_router, AppState};
use billbook_core::auth::JwtKeys;
use billbook_core::clock::SystemClock;
use billbook_core::config::Config;
use billbook_core::db;
use dotenv::dotenv;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenv().ok();
    billbook_core::init_tracing();

    info!("Starting Billbook Core Server...");

    let config = Config::from_env()?;
    let store = db::open_store(&config).await?;

    let app_state = AppState::new(
        store,
        Arc::new(SystemClock),
        JwtKeys::new(config.jwt_secret.as_bytes()),
        config.sync_channel_capacity,
    );
    let app = create_router(app_state);

    let address = config.bind_address();
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind to {}: {}", address, e))?;

    info!("Server listening on {}", address);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("Received Ctrl+C, shutting down gracefully...");
        })
        .await
        .map_err(|e| anyhow::anyhow!("Server error: {}", e))?;

    Ok(())
}
