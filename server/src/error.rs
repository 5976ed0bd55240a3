//! Error types for bloomd.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

use crate::catalog::CatalogError;
use crate::types::ConnectionId;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("catalog unavailable: {0}")]
    CatalogUnavailable(String),

    #[error("duplicate connection: {0}")]
    DuplicateConnection(ConnectionId),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<CatalogError> for GatewayError {
    fn from(e: CatalogError) -> Self {
        match e {
            CatalogError::NotFound(id) => GatewayError::NotFound(id),
            CatalogError::Unavailable(reason) => GatewayError::CatalogUnavailable(reason),
        }
    }
}

impl GatewayError {
    /// Short machine-readable code for `error` frames.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::NotFound(_) => "not_found",
            GatewayError::CatalogUnavailable(_) => "catalog_unavailable",
            GatewayError::DuplicateConnection(_) => "duplicate_connection",
            GatewayError::Protocol(_) => "protocol_error",
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = match &self {
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::Protocol(_) => StatusCode::BAD_REQUEST,
            GatewayError::DuplicateConnection(_) => StatusCode::CONFLICT,
            GatewayError::CatalogUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        (status, self.to_string()).into_response()
    }
}
