use serde::{Deserialize, Serialize};
use shared::{
    domain::{CorrelationKey, MessageId, SurfaceId},
    error::ApiError,
};
use thiserror::Error;

/// Outcome of a failed request against the backend.
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("rejected by server: {0}")]
    Rejected(ApiError),
}

impl BackendError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(value: reqwest::Error) -> Self {
        Self::Transport(value.to_string())
    }
}

/// Why an optimistic record ended up `failed`. Attached to the record for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureReason {
    Transport { detail: String },
    Rejected { error: ApiError },
}

impl FailureReason {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }
}

impl From<BackendError> for FailureReason {
    fn from(value: BackendError) -> Self {
        match value {
            BackendError::Transport(detail) => Self::Transport { detail },
            BackendError::Rejected(error) => Self::Rejected { error },
        }
    }
}

/// A user action that cannot be applied to the current local state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    #[error("surface {0} is not open")]
    UnknownSurface(SurfaceId),
    #[error("message {message_id:?} is not loaded in surface {surface}")]
    UnknownMessage {
        surface: SurfaceId,
        message_id: MessageId,
    },
    #[error("correlation key {0} is already attached to a record")]
    DuplicateCorrelationKey(CorrelationKey),
    #[error("no optimistic record for correlation key {0}")]
    UnknownCorrelationKey(CorrelationKey),
    #[error("record {0} is not in the failed state")]
    NotFailed(CorrelationKey),
    #[error("message {0:?} cannot be modified (unconfirmed or deleted)")]
    NotModifiable(MessageId),
    #[error("message must have a body or at least one attachment")]
    EmptyMessage,
    #[error("edited body must not be empty")]
    EmptyEdit,
    #[error("invalid reaction {0:?}")]
    InvalidEmoji(String),
}

#[derive(Debug, Clone, Error)]
pub enum ConnectionError {
    #[error("connection attempt failed: {0}")]
    ConnectFailed(String),
    #[error("connection was torn down before it settled")]
    Aborted,
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse settings file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("server_url must start with http:// or https://, got {0}")]
    InvalidServerUrl(String),
}
