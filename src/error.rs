use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use crate::store::StoreError;

/// Error type for HTTP handlers; renders as `{"error": ..., "code": ...}`.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Authentication required")]
    Unauthorized,

    #[error("Draft not found")]
    DraftNotFound,

    #[error("Draft is not ready for promotion")]
    DraftNotReady,

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("{0}")]
    BadRequest(String),

    #[error("{public}")]
    Internal {
        public: &'static str,
        cause: anyhow::Error,
    },
}

pub type ApiResult<T> = Result<T, ApiError>;

impl ApiError {
    pub fn internal(public: &'static str, cause: impl Into<anyhow::Error>) -> Self {
        ApiError::Internal {
            public,
            cause: cause.into(),
        }
    }

    /// Map a store failure, using `public` as the message for unexpected ones.
    pub fn from_store(err: StoreError, public: &'static str) -> Self {
        match err {
            StoreError::DraftNotFound => ApiError::DraftNotFound,
            StoreError::DraftNotReady => ApiError::DraftNotReady,
            other => ApiError::internal(public, other),
        }
    }

    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED"),
            ApiError::DraftNotFound => (StatusCode::NOT_FOUND, "DRAFT_NOT_FOUND"),
            ApiError::DraftNotReady => (StatusCode::BAD_REQUEST, "DRAFT_NOT_READY"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ApiError::Internal { .. } => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        if let ApiError::Internal { public, cause } = &self {
            tracing::error!(error = %cause, "{}", public);
        }
        let body = json!({
            "error": self.to_string(),
            "code": code,
        });
        (status, axum::Json(body)).into_response()
    }
}
