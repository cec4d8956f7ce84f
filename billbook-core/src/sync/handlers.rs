use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
    Extension,
};
use futures::{Stream, StreamExt};
use tracing::info;

use crate::api::AppState;
use crate::auth::AuthContext;
use crate::models::InvoiceResponse;

/// Server-Sent Events stream of invoice snapshots.
///
/// Handles GET requests to `/api/invoices/stream`. Every event is named
/// `invoices` and carries the caller's full invoice list. The subscription
/// ends when the client disconnects.
pub async fn stream_handler(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    info!(user_id = %auth.user_id, "Invoice stream opened");

    let events = state.sync.subscribe(&auth.user_id).map(|snapshot| {
        let body: Vec<InvoiceResponse> = snapshot.into_iter().map(InvoiceResponse::from).collect();
        Event::default().event("invoices").json_data(body)
    });

    Sse::new(events).keep_alive(KeepAlive::default())
}
