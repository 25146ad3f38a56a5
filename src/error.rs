//! Error types shared by the storage layer and the REST handlers.
//!
//! Handlers return `Result<_, ApiError>`; axum renders the error as a JSON
//! body `{"error": "..."}` with the matching HTTP status.

use axum::{
    extract::rejection::{JsonRejection, PathRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),

    #[error("JSON (de)serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0} already exists")]
    Conflict(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("corrupt key in tree {0}")]
    CorruptKey(&'static str),
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

impl From<sled::transaction::TransactionError<StorageError>> for StorageError {
    fn from(err: sled::transaction::TransactionError<StorageError>) -> Self {
        match err {
            sled::transaction::TransactionError::Abort(e) => e,
            sled::transaction::TransactionError::Storage(e) => StorageError::Sled(e),
        }
    }
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("Too Many Requests")]
    RateLimited,

    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ApiError::Forbidden(_) => StatusCode::FORBIDDEN,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn unauthorized() -> Self {
        ApiError::Unauthorized("unauthorized".to_string())
    }

    pub fn forbidden() -> Self {
        ApiError::Forbidden("forbidden".to_string())
    }
}

impl From<StorageError> for ApiError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Conflict(what) => ApiError::Conflict(format!("{} already exists", what)),
            StorageError::NotFound(what) => ApiError::NotFound(format!("{} not found", what)),
            other => {
                // Storage details stay in the logs
                tracing::error!(error = %other, "storage failure");
                ApiError::Internal("database error".to_string())
            }
        }
    }
}

// Extractor rejections (bad JSON, missing fields, bad path or query values)
// are client errors rendered like every other ApiError.
impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(%status, error = %self, "request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
