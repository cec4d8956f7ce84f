use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

use crate::models::InvoiceStatus;
use crate::store::{collections, StoreError};
use crate::totals::TotalsOverflow;

/// Errors surfaced by the invoice engine.
///
/// Ownership and existence checks happen at the record adapter boundary and
/// keep their own variants so a UI can tell them apart. Store failures are
/// logged where they happen and surfaced as [`CoreError::OperationFailed`].
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("{entity} {id} belongs to another user")]
    Unauthorized { entity: &'static str, id: String },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("cannot move invoice from {from} to {to}")]
    InvalidTransition {
        from: InvoiceStatus,
        to: InvoiceStatus,
    },

    #[error("{operation} failed")]
    OperationFailed {
        operation: &'static str,
        #[source]
        source: StoreError,
    },
}

pub type Result<T, E = CoreError> = std::result::Result<T, E>;

fn entity_name(collection: &str) -> &'static str {
    match collection {
        collections::INVOICES => "invoice",
        collections::CUSTOMERS => "customer",
        collections::COUNTERS => "counter",
        _ => "document",
    }
}

impl CoreError {
    /// Converts a store failure, logging the underlying cause.
    ///
    /// A document vanishing between read and write is still reported as
    /// `NotFound`; everything else becomes `OperationFailed`.
    pub fn store(operation: &'static str, source: StoreError) -> Self {
        match source {
            StoreError::NotFound { collection, id } => CoreError::NotFound {
                entity: entity_name(&collection),
                id,
            },
            source => {
                error!(operation, error = %source, "Store operation failed");
                CoreError::OperationFailed { operation, source }
            }
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        CoreError::Validation(message.into())
    }
}

impl From<TotalsOverflow> for CoreError {
    fn from(e: TotalsOverflow) -> Self {
        CoreError::Validation(e.to_string())
    }
}

/// Fails with [`CoreError::Unauthorized`] unless `stored_owner` is `caller`.
pub(crate) fn ensure_owner(
    entity: &'static str,
    id: &str,
    stored_owner: &str,
    caller: &str,
) -> Result<()> {
    if stored_owner == caller {
        Ok(())
    } else {
        Err(CoreError::Unauthorized {
            entity,
            id: id.to_string(),
        })
    }
}

impl IntoResponse for CoreError {
    fn into_response(self) -> Response {
        #[derive(Serialize)]
        struct ErrorResponse {
            error: String,
            kind: &'static str,
        }

        let (status, kind) = match &self {
            CoreError::NotFound { .. } => (StatusCode::NOT_FOUND, "not_found"),
            CoreError::Unauthorized { .. } => (StatusCode::FORBIDDEN, "unauthorized"),
            CoreError::Validation(_) => (StatusCode::UNPROCESSABLE_ENTITY, "validation_failure"),
            CoreError::InvalidTransition { .. } => (StatusCode::CONFLICT, "invalid_transition"),
            CoreError::OperationFailed { .. } => {
                (StatusCode::SERVICE_UNAVAILABLE, "operation_failed")
            }
        };

        let body = ErrorResponse {
            error: self.to_string(),
            kind,
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_not_found_keeps_its_identity() {
        let err = CoreError::store(
            "update invoice",
            StoreError::not_found(collections::INVOICES, "abc"),
        );
        assert!(matches!(
            err,
            CoreError::NotFound { entity: "invoice", ref id } if id == "abc"
        ));
    }

    #[test]
    fn test_transport_failures_become_operation_failed() {
        let err = CoreError::store("list invoices", StoreError::Unavailable("down".into()));
        assert!(matches!(err, CoreError::OperationFailed { .. }));
        assert_eq!(err.to_string(), "list invoices failed");
    }

    #[test]
    fn test_status_codes() {
        let forbidden = CoreError::Unauthorized {
            entity: "invoice",
            id: "x".into(),
        }
        .into_response();
        assert_eq!(forbidden.status(), StatusCode::FORBIDDEN);

        let invalid = CoreError::validation("negative quantity").into_response();
        assert_eq!(invalid.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }
}
