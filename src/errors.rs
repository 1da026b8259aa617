use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("store unavailable: {0}")]
    InfrastructureUnavailable(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("token expired")]
    Expired,

    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("invalid username or password")]
    InvalidCredentials,

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Conflict(what) => AppError::Conflict(what),
            StoreError::InvalidRow(detail) => AppError::Internal(anyhow::anyhow!(detail)),
            other => AppError::InfrastructureUnavailable(other.to_string()),
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(e: JsonRejection) -> Self {
        AppError::Malformed(e.body_text())
    }
}

impl From<QueryRejection> for AppError {
    fn from(e: QueryRejection) -> Self {
        AppError::Malformed(e.body_text())
    }
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::InfrastructureUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Expired | AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::Malformed(_) | AppError::Conflict(_) | AppError::InvalidCredentials => {
                StatusCode::BAD_REQUEST
            }
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let (error_type, code, msg) = match &self {
            AppError::InfrastructureUnavailable(detail) => {
                tracing::error!("store unavailable: {}", detail);
                (
                    "internal_error",
                    "store_unavailable",
                    "service temporarily unavailable".to_string(),
                )
            }
            AppError::NotFound(what) => ("not_found_error", "not_found", what.clone()),
            AppError::Expired => (
                "authentication_error",
                "token_expired",
                "token expired".to_string(),
            ),
            AppError::Malformed(detail) => {
                ("invalid_request_error", "malformed_request", detail.clone())
            }
            AppError::Conflict(detail) => ("invalid_request_error", "conflict", detail.clone()),
            AppError::Forbidden(detail) => ("permission_error", "forbidden", detail.clone()),
            AppError::InvalidCredentials => (
                "authentication_error",
                "invalid_credentials",
                "invalid username or password".to_string(),
            ),
            AppError::Unauthorized(detail) => {
                ("authentication_error", "unauthorized", detail.clone())
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {}", e);
                (
                    "internal_error",
                    "internal_server_error",
                    "internal server error".to_string(),
                )
            }
        };

        let body = Json(json!({
            "error": {
                "message": msg,
                "type": error_type,
                "code": code,
            }
        }));

        let mut response = (status, body).into_response();

        if status == StatusCode::UNAUTHORIZED {
            response.headers_mut().insert(
                "www-authenticate",
                axum::http::HeaderValue::from_static("Bearer"),
            );
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            AppError::InfrastructureUnavailable("x".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(AppError::NotFound("user".into()).status(), StatusCode::NOT_FOUND);
        assert_eq!(AppError::Expired.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(AppError::Malformed("x".into()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(AppError::Conflict("x".into()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(AppError::Forbidden("x".into()).status(), StatusCode::FORBIDDEN);
        assert_eq!(AppError::InvalidCredentials.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_store_conflict_maps_to_conflict() {
        let err: AppError = StoreError::Conflict("username already exists".into()).into();
        assert!(matches!(err, AppError::Conflict(_)));

        let err: AppError = StoreError::Timeout.into();
        assert!(matches!(err, AppError::InfrastructureUnavailable(_)));
    }

    #[tokio::test]
    async fn test_infrastructure_detail_is_not_exposed() {
        let resp = AppError::InfrastructureUnavailable("connection refused: 10.0.0.5:5432".into())
            .into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
        let bytes = axum::body::to_bytes(resp.into_body(), 4096).await.unwrap();
        let text = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(!text.contains("10.0.0.5"));
        assert!(text.contains("service temporarily unavailable"));
    }

    #[test]
    fn test_unauthorized_sets_challenge_header() {
        let resp = AppError::Unauthorized("missing authorization header".into()).into_response();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(resp.headers().get("www-authenticate").unwrap(), "Bearer");
    }
}
