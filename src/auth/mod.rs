//! Bearer-token authentication: issuance and rotation (`issuer`), the request
//! gate (`gate`), and password hashing (`password`).

pub mod gate;
pub mod issuer;
pub mod password;

use thiserror::Error;

use crate::errors::AppError;
use crate::store::StoreError;

pub use issuer::{generate_token, TokenIssuer, TOKEN_BYTES, TOKEN_LEN};

/// Errors raised by the issuer and the gate. Converted to `AppError` only at
/// the HTTP boundary.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("token not found")]
    NotFound,

    #[error("token expired")]
    Expired,

    #[error("{0}")]
    Malformed(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl AuthError {
    /// Short label used for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            AuthError::NotFound => "not_found",
            AuthError::Expired => "expired",
            AuthError::Malformed(_) => "malformed",
            AuthError::Conflict(_) => "conflict",
            AuthError::Store(_) => "store_unavailable",
        }
    }

    /// Mapping used by the gate: every token problem becomes a 401 carrying the
    /// detail; store failures stay infrastructure errors.
    pub fn into_gate_rejection(self) -> AppError {
        match self {
            AuthError::Store(e) => e.into(),
            other => AppError::Unauthorized(format!("Unauthorized: {}", other)),
        }
    }
}

impl From<AuthError> for AppError {
    fn from(e: AuthError) -> Self {
        match e {
            AuthError::NotFound => AppError::NotFound("token not found".into()),
            AuthError::Expired => AppError::Expired,
            AuthError::Malformed(detail) => AppError::Malformed(detail),
            AuthError::Conflict(detail) => AppError::Conflict(detail),
            AuthError::Store(e) => e.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[test]
    fn test_gate_rejection_folds_token_errors_into_401() {
        for err in [
            AuthError::NotFound,
            AuthError::Expired,
            AuthError::Malformed("missing authorization header".into()),
        ] {
            assert_eq!(err.into_gate_rejection().status(), StatusCode::UNAUTHORIZED);
        }
    }

    #[test]
    fn test_gate_rejection_keeps_store_failures_distinct() {
        let rejection = AuthError::Store(StoreError::Timeout).into_gate_rejection();
        assert_eq!(rejection.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_gate_rejection_carries_detail() {
        match AuthError::Expired.into_gate_rejection() {
            AppError::Unauthorized(detail) => assert_eq!(detail, "Unauthorized: token expired"),
            other => panic!("unexpected rejection: {:?}", other),
        }
    }
}
