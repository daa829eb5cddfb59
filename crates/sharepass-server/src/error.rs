use std::fmt;

use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Why a stored secret can no longer be redeemed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GoneReason {
    Expired,
    Exhausted,
}

impl fmt::Display for GoneReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Expired => f.write_str("secret has expired"),
            Self::Exhausted => f.write_str("no views left"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ShareError {
    #[error("{0}")]
    Validation(String),
    #[error("encryption key not configured: {0}")]
    Configuration(String),
    #[error("secret not found")]
    NotFound,
    #[error("{0}")]
    Gone(GoneReason),
    #[error("stored secret failed integrity check")]
    Integrity,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ShareError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Gone(_) => StatusCode::GONE,
            Self::Configuration(_) | Self::Integrity | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// Malformed bodies, missing fields and wrong types are all client errors.
impl From<JsonRejection> for ShareError {
    fn from(rejection: JsonRejection) -> Self {
        Self::Validation(rejection.body_text())
    }
}

impl IntoResponse for ShareError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = match &self {
            Self::Validation(_) | Self::NotFound | Self::Gone(_) => self.to_string(),
            Self::Configuration(_) | Self::Integrity | Self::Internal(_) => {
                tracing::error!(error = %self, "internal error");
                "internal server error".to_owned()
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}
