use crate::validate::ValidationError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

pub type Result<T> = std::result::Result<T, ServiceError>;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("authentication failed")]
    Auth,

    #[error("invalid request: {0}")]
    Validation(#[from] ValidationError),

    #[error("query compilation failed")]
    Compilation(String),

    #[error("query execution failed")]
    Store(#[source] anyhow::Error),

    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl ServiceError {
    pub fn invalid(message: impl Into<String>) -> Self {
        ServiceError::Validation(ValidationError::Malformed(message.into()))
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ServiceError::Auth => StatusCode::UNAUTHORIZED,
            ServiceError::Validation(_) => StatusCode::BAD_REQUEST,
            ServiceError::Compilation(_)
            | ServiceError::Store(_)
            | ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status();

        match &self {
            ServiceError::Validation(_) | ServiceError::Auth => {}
            ServiceError::Compilation(detail) => {
                error!(error = %self, detail = %detail, "request failed")
            }
            ServiceError::Store(source) | ServiceError::Internal(source) => {
                error!(error = %self, source = ?source, "request failed")
            }
        }

        let body = ErrorBody {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
