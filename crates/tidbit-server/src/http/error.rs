use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use tidbit_core::{ErrorKind, StoreError};
use tracing::error;

pub type AppResult<T> = Result<T, AppError>;

/// An error turned into an HTTP response
#[derive(Debug, Clone)]
pub struct AppError {
    status: StatusCode,
    detail: Option<String>,
}

impl Default for AppError {
    fn default() -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            detail: None,
        }
    }
}

impl AppError {
    pub fn with_status(status: StatusCode) -> AppError {
        Self {
            status,
            detail: None,
        }
    }

    pub fn new(status: StatusCode, message: Option<impl ToString>) -> AppError {
        Self {
            status,
            detail: message.map(|m| m.to_string()),
        }
    }

    /// Log the cause and hide it behind a generic 500
    pub fn internal(cause: impl std::fmt::Display) -> AppError {
        error!("internal error: {cause}");
        Self::default()
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = match self.detail {
            Some(detail) => detail,
            None => self
                .status
                .canonical_reason()
                .unwrap_or("error")
                .to_lowercase(),
        };
        (self.status, body).into_response()
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err.kind() {
            ErrorKind::NotFound => Self::with_status(StatusCode::NOT_FOUND),
            ErrorKind::InvalidInput => Self::new(StatusCode::BAD_REQUEST, Some(err)),
            ErrorKind::MalformedMetadata | ErrorKind::Io | ErrorKind::Cancelled => {
                Self::internal(err)
            }
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(value: anyhow::Error) -> Self {
        Self::internal(value)
    }
}
