use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    Extension,
};

use crate::auth::AuthContext;
use crate::error::{CoreError, Result};
use crate::lifecycle::SweepReport;
use crate::models::{Invoice, InvoicePatch, InvoiceResponse, NewInvoice};
use crate::numbering::AssignedNumber;

use super::AppState;

fn respond(invoices: Vec<Invoice>) -> Json<Vec<InvoiceResponse>> {
    Json(invoices.into_iter().map(InvoiceResponse::from).collect())
}

/// `GET /api/invoices`: the caller's invoices, newest first.
pub async fn list(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<Vec<InvoiceResponse>>> {
    let invoices = state.invoices.list_by_owner(&auth.user_id).await?;
    Ok(respond(invoices))
}

pub async fn create(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(input): Json<NewInvoice>,
) -> Result<(StatusCode, Json<InvoiceResponse>)> {
    let invoice = state.invoices.create(input, &auth.user_id).await?;
    Ok((StatusCode::CREATED, Json(invoice.into())))
}

pub async fn get(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<Json<InvoiceResponse>> {
    let invoice = state
        .invoices
        .get(&id, &auth.user_id)
        .await?
        .ok_or(CoreError::NotFound {
            entity: crate::invoices::ENTITY,
            id,
        })?;
    Ok(Json(invoice.into()))
}

pub async fn update(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
    Json(patch): Json<InvoicePatch>,
) -> Result<Json<InvoiceResponse>> {
    let invoice = state.invoices.update(&id, patch, &auth.user_id).await?;
    Ok(Json(invoice.into()))
}

pub async fn delete(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    state.invoices.delete(&id, &auth.user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn send(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<Json<InvoiceResponse>> {
    let invoice = state.invoices.mark_sent(&id, &auth.user_id).await?;
    Ok(Json(invoice.into()))
}

pub async fn pay(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<Json<InvoiceResponse>> {
    let invoice = state.invoices.mark_paid(&id, &auth.user_id).await?;
    Ok(Json(invoice.into()))
}

/// `POST /api/invoices/sweep-overdue`: runs the overdue sweep for the caller.
pub async fn sweep_overdue(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<SweepReport>> {
    let report = state.invoices.sweep_overdue(&auth.user_id).await?;
    Ok(Json(report))
}

/// `GET /api/invoices/next-number`: previews the number the next invoice
/// would get, without reserving it.
pub async fn next_number(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> Json<AssignedNumber> {
    Json(state.invoices.numbering().peek_number(&auth.user_id).await)
}

/// `GET /api/admin/invoices`: every invoice across owners.
pub async fn list_all(State(state): State<AppState>) -> Result<Json<Vec<InvoiceResponse>>> {
    let invoices = state.invoices.list_all().await?;
    Ok(respond(invoices))
}
