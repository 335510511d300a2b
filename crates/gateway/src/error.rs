use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use keepsake_protocol::ErrorBody;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Unauthenticated(String),

    #[error("Please wait {wait} seconds before requesting a new OTP")]
    RateLimited { wait: u64 },

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Transport(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    fn status(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            AppError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Transport(_) | AppError::Database(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match &self {
            AppError::Unauthenticated(msg) => ErrorBody::unauthenticated(msg.clone()),
            AppError::RateLimited { wait } => ErrorBody::rate_limited(self.to_string(), *wait),
            AppError::Database(e) => {
                tracing::error!("Database error: {}", e);
                ErrorBody::new("Internal server error")
            }
            AppError::Internal(e) => {
                tracing::error!("Internal error: {}", e);
                ErrorBody::new("Internal server error")
            }
            other => ErrorBody::new(other.to_string()),
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_matches_taxonomy() {
        assert_eq!(
            AppError::Validation("x".into()).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::Unauthenticated("x".into()).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AppError::RateLimited { wait: 10 }.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            AppError::NotFound("x".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::Transport("x".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn rate_limited_message_carries_wait() {
        let e = AppError::RateLimited { wait: 37 };
        assert!(e.to_string().contains("37 seconds"));
    }
}
