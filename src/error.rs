use std::collections::HashMap;
use std::path::PathBuf;

use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Validation,
    Authentication,
    NotFound,
    PayloadTooLarge,
    Inference,
    Storage,
    Internal,
}

impl ErrorKind {
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::Validation => "VALIDATION_ERROR",
            Self::Authentication => "AUTH_ERROR",
            Self::NotFound => "NOT_FOUND",
            Self::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            Self::Inference => "INFERENCE_ERROR",
            Self::Storage => "STORAGE_ERROR",
            Self::Internal => "INTERNAL_ERROR",
        }
    }

    #[must_use]
    pub const fn status(self) -> StatusCode {
        match self {
            Self::Validation => StatusCode::BAD_REQUEST,
            Self::Authentication => StatusCode::UNAUTHORIZED,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Inference | Self::Storage | Self::Internal => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Server-side kinds are logged with an error id; client-side kinds are not.
    #[must_use]
    pub const fn is_server_fault(self) -> bool {
        matches!(self, Self::Inference | Self::Storage | Self::Internal)
    }
}

/// The single error type crossing the HTTP boundary.
///
/// `message` is what the client sees. `internal_message` is logged and never
/// serialized into a response.
#[derive(Debug, Clone, PartialEq)]
pub struct AppError {
    pub kind: ErrorKind,
    pub message: String,
    pub internal_message: Option<String>,
    pub context: HashMap<String, String>,
}

impl AppError {
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            internal_message: None,
            context: HashMap::new(),
        }
    }

    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    #[must_use]
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Authentication, message)
    }

    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    #[must_use]
    pub fn internal(internal: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, "internal server error").with_internal(internal)
    }

    #[must_use]
    pub fn with_internal(mut self, internal: impl Into<String>) -> Self {
        self.internal_message = Some(internal.into());
        self
    }

    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub const fn code(&self) -> &'static str {
        self.kind.code()
    }

    #[must_use]
    pub const fn status(&self) -> StatusCode {
        self.kind.status()
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code(), self.message)?;
        if let Some(internal) = &self.internal_message {
            write!(f, " (internal: {internal})")?;
        }
        Ok(())
    }
}

impl std::error::Error for AppError {}

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_id: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let error_id = if self.kind.is_server_fault() {
            let id = uuid::Uuid::new_v4().to_string();
            tracing::error!(
                error_id = %id,
                code = self.code(),
                message = %self.message,
                internal = self.internal_message.as_deref().unwrap_or(""),
                context = ?self.context,
                "request failed"
            );
            Some(id)
        } else {
            tracing::warn!(code = self.code(), message = %self.message, "request rejected");
            None
        };

        let body = ErrorBody {
            code: self.code().to_string(),
            detail: self.message,
            error_id: error_id.clone(),
        };

        let mut response = (status, Json(body)).into_response();
        if let Some(id) = error_id {
            if let Ok(value) = HeaderValue::from_str(&id) {
                response.headers_mut().insert("x-error-id", value);
            }
        }
        response
    }
}

/// Failures that prevent the process from serving any request.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("label list {0} contains no labels")]
    EmptyLabels(PathBuf),

    #[error("failed to load model {path}: {reason}")]
    ModelLoad { path: PathBuf, reason: String },

    #[error("invalid label prefix pattern: {0}")]
    LabelPattern(#[from] regex::Error),
}
