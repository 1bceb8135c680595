use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    Unauthorized,
    Forbidden,
    NotFound,
    Validation,
    Conflict,
    RateLimited,
    Internal,
}

/// Error body returned by the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    pub code: ErrorCode,
    pub message: String,
}

impl ApiError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// How a failure is routed by the sync core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Retried with backoff.
    TransientNetwork,
    /// Routed through the auth gate, then retried.
    AuthExpired,
    /// Never retried.
    Validation,
    /// Treated as success.
    AlreadyExists,
    /// Local store is unusable; app continues read-only.
    FatalLocalStorage,
}

#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "message", rename_all = "snake_case")]
pub enum RemoteError {
    #[error("network failure: {0}")]
    Network(String),
    #[error("remote call timed out after {0:?}")]
    Timeout(Duration),
    #[error("credential rejected: {0}")]
    AuthExpired(String),
    #[error("request rejected: {0}")]
    Validation(String),
    #[error("record already exists: {0}")]
    AlreadyExists(String),
}

impl RemoteError {
    pub fn class(&self) -> FailureClass {
        match self {
            RemoteError::Network(_) | RemoteError::Timeout(_) => FailureClass::TransientNetwork,
            RemoteError::AuthExpired(_) => FailureClass::AuthExpired,
            RemoteError::Validation(_) => FailureClass::Validation,
            RemoteError::AlreadyExists(_) => FailureClass::AlreadyExists,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.class(),
            FailureClass::TransientNetwork | FailureClass::AuthExpired
        )
    }
}

impl From<ApiError> for RemoteError {
    fn from(value: ApiError) -> Self {
        match value.code {
            ErrorCode::Unauthorized => RemoteError::AuthExpired(value.message),
            ErrorCode::Forbidden | ErrorCode::NotFound | ErrorCode::Validation => {
                RemoteError::Validation(value.message)
            }
            ErrorCode::Conflict => RemoteError::AlreadyExists(value.message),
            ErrorCode::RateLimited | ErrorCode::Internal => RemoteError::Network(value.message),
        }
    }
}
