use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use crate::settings::SettingsError;
use crate::storage::StorageError;
use crate::transfer::TransferError;

/// Per-request failure, rendered as `{"error": "..."}` for the JSON API or as
/// plain text for the raw file verbs.
#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::BadRequest(m) | Self::NotFound(m) | Self::Internal(m) => m,
        }
    }

    /// Plain-text rendering for curl-style clients.
    pub fn into_plain(self) -> Response {
        self.log();
        (self.status(), format!("{}\n", self.message())).into_response()
    }

    fn log(&self) {
        if let Self::Internal(msg) = self {
            tracing::error!(error = %msg, "internal error");
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        self.log();
        (self.status(), Json(json!({ "error": self.message() }))).into_response()
    }
}

impl From<TransferError> for ApiError {
    fn from(e: TransferError) -> Self {
        match e {
            TransferError::InvalidName(_) | TransferError::Body(_) => Self::BadRequest(e.to_string()),
            TransferError::Empty => Self::NotFound(e.to_string()),
            TransferError::Archive(_) => Self::Internal(e.to_string()),
            TransferError::Storage(inner) => inner.into(),
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound(name) => Self::NotFound(format!("File '{name}' not found.")),
            StorageError::InvalidName(_) => Self::BadRequest(e.to_string()),
            StorageError::Access(_) | StorageError::AlreadyExists(_) | StorageError::Io(_) => {
                Self::Internal(e.to_string())
            }
        }
    }
}

impl From<SettingsError> for ApiError {
    fn from(e: SettingsError) -> Self {
        match e {
            SettingsError::IntervalOutOfRange(_) => Self::BadRequest(e.to_string()),
            SettingsError::Persist(_) | SettingsError::Parse(_) => Self::Internal(e.to_string()),
        }
    }
}
