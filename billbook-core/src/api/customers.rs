use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    Extension,
};

use crate::auth::AuthContext;
use crate::error::{CoreError, Result};
use crate::models::{Customer, CustomerPatch, NewCustomer};

use super::AppState;

pub async fn list(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> Result<Json<Vec<Customer>>> {
    Ok(Json(state.customers.list_by_owner(&auth.user_id).await?))
}

pub async fn create(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Json(input): Json<NewCustomer>,
) -> Result<(StatusCode, Json<Customer>)> {
    let customer = state.customers.create(input, &auth.user_id).await?;
    Ok((StatusCode::CREATED, Json(customer)))
}

pub async fn get(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<Json<Customer>> {
    state
        .customers
        .get(&id, &auth.user_id)
        .await?
        .map(Json)
        .ok_or(CoreError::NotFound {
            entity: "customer",
            id,
        })
}

pub async fn update(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
    Json(patch): Json<CustomerPatch>,
) -> Result<Json<Customer>> {
    Ok(Json(state.customers.update(&id, patch, &auth.user_id).await?))
}

pub async fn delete(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    state.customers.delete(&id, &auth.user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
