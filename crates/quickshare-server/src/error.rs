use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Everything a paste operation can report to a client.
#[derive(Debug, thiserror::Error)]
pub enum AccessError {
    /// Bad create parameters. Nothing was stored.
    #[error("{0}")]
    Validation(String),

    /// Unknown, expired, or burned. Never says which.
    #[error("paste not found")]
    NotFound,

    #[error("password required")]
    PasswordRequired,

    #[error("invalid password")]
    InvalidPassword,

    /// Storage timed out or failed. Safe to retry: a view is either fully
    /// committed or not at all.
    #[error("storage unavailable: {0:#}")]
    StorageUnavailable(anyhow::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

const NOT_FOUND_DETAIL: &str = "link does not exist or is no longer available";

impl IntoResponse for AccessError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            AccessError::Validation(msg) => (StatusCode::BAD_REQUEST, json!({"detail": msg})),
            AccessError::NotFound => (StatusCode::NOT_FOUND, json!({"detail": NOT_FOUND_DETAIL})),
            AccessError::PasswordRequired => (
                StatusCode::UNAUTHORIZED,
                json!({"detail": "password required", "requires_password": true}),
            ),
            AccessError::InvalidPassword => (
                StatusCode::FORBIDDEN,
                json!({"detail": "invalid password", "requires_password": true}),
            ),
            AccessError::StorageUnavailable(e) => {
                tracing::warn!(error = %format!("{e:#}"), "storage unavailable");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    json!({"detail": "service temporarily unavailable, please retry"}),
                )
            }
            AccessError::Internal(e) => {
                tracing::error!(error = %format!("{e:#}"), "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({"detail": "internal server error"}),
                )
            }
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes() {
        let cases = [
            (AccessError::Validation("x".into()), StatusCode::BAD_REQUEST),
            (AccessError::NotFound, StatusCode::NOT_FOUND),
            (AccessError::PasswordRequired, StatusCode::UNAUTHORIZED),
            (AccessError::InvalidPassword, StatusCode::FORBIDDEN),
            (
                AccessError::StorageUnavailable(anyhow::anyhow!("timeout")),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                AccessError::Internal(anyhow::anyhow!("boom")),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(err.into_response().status(), status);
        }
    }
}
