use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::manager::ManagerError;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error(transparent)]
    Manager(#[from] ManagerError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl ApiError {
    pub fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Manager(e) => match e {
                ManagerError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
                ManagerError::DirectoryUnresolved(_) => {
                    (StatusCode::SERVICE_UNAVAILABLE, "DIRECTORY_UNRESOLVED")
                }
                ManagerError::ChunkUnavailable { .. } | ManagerError::HostUnavailable { .. } => {
                    (StatusCode::SERVICE_UNAVAILABLE, "CHUNK_UNAVAILABLE")
                }
                ManagerError::InvalidReference(_) => (StatusCode::BAD_REQUEST, "INVALID_REFERENCE"),
                ManagerError::MissingKey(_) => (StatusCode::BAD_REQUEST, "MISSING_KEY"),
                _ => (StatusCode::BAD_REQUEST, "MANAGER_ERROR"),
            },
            ApiError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, "INVALID_REQUEST"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code) = self.status_and_code();

        let body = Json(json!({
            "error": self.to_string(),
            "code": error_code,
        }));

        (status, body).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
