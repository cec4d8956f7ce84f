//! HTTP surface over the engine.

pub mod customers;
pub mod invoices;

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    middleware,
    response::Json,
    routing::{get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::auth::{self, JwtKeys};
use crate::clock::Clock;
use crate::customers::CustomerStore;
use crate::invoices::InvoiceStore;
use crate::store::DocumentStore;
use crate::sync::{self, SyncChannel};

/// Application state shared with every route handler.
#[derive(Clone)]
pub struct AppState {
    pub invoices: InvoiceStore,
    pub customers: CustomerStore,
    pub sync: SyncChannel,
    pub keys: JwtKeys,
}

impl AppState {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        clock: Arc<dyn Clock>,
        keys: JwtKeys,
        sync_capacity: usize,
    ) -> Self {
        let invoices = InvoiceStore::new(store, clock);
        Self {
            customers: invoices.customers().clone(),
            sync: SyncChannel::new(invoices.clone(), sync_capacity),
            invoices,
            keys,
        }
    }
}

/// Health check endpoint.
///
/// Returns a simple JSON response indicating the server is running.
async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "billbook-core",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Verifies that the document store answers.
async fn store_health_check(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    state.invoices.store().ping().await.map_err(|e| {
        error!(error = %e, "Store health check failed");
        StatusCode::SERVICE_UNAVAILABLE
    })?;

    Ok(Json(serde_json::json!({
        "status": "ok",
        "store": "connected"
    })))
}

/// Creates the main application router.
///
/// Everything under `/api` requires a bearer token; `/api/admin` additionally
/// requires the `admin` claim.
pub fn create_router(state: AppState) -> Router {
    let admin: Router<AppState> = Router::new()
        .route("/api/admin/invoices", get(invoices::list_all))
        .route_layer(middleware::from_fn(auth::require_admin));

    let protected: Router<AppState> = Router::new()
        .route(
            "/api/invoices",
            get(invoices::list).post(invoices::create),
        )
        .route("/api/invoices/next-number", get(invoices::next_number))
        .route("/api/invoices/sweep-overdue", post(invoices::sweep_overdue))
        .route("/api/invoices/stream", get(sync::stream_handler))
        .route(
            "/api/invoices/:id",
            get(invoices::get)
                .patch(invoices::update)
                .delete(invoices::delete),
        )
        .route("/api/invoices/:id/send", post(invoices::send))
        .route("/api/invoices/:id/pay", post(invoices::pay))
        .route(
            "/api/customers",
            get(customers::list).post(customers::create),
        )
        .route(
            "/api/customers/:id",
            get(customers::get)
                .patch(customers::update)
                .delete(customers::delete),
        )
        .merge(admin)
        .route_layer(middleware::from_fn_with_state(
            state.keys.clone(),
            auth::jwt_middleware,
        ));

    Router::new()
        .route("/health", get(health_check))
        .route("/health/store", get(store_health_check))
        .merge(protected)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}
