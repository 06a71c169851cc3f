use thiserror::Error;

use shared_models::error::AppError;

/// Channel-level failures. Absorbed by adapters and turned into health state.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Transport unavailable: {0}")]
    Unavailable(String),

    #[error("Subscription closed: {0}")]
    Closed(String),

    #[error("Request failed: {0}")]
    Request(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// A native row or payload that cannot be turned into an event envelope.
#[derive(Error, Debug, PartialEq)]
pub enum NormalizeError {
    #[error("Missing field '{field}' in {source_name} payload")]
    MissingField { source_name: String, field: String },

    #[error("Invalid value for '{field}': {reason}")]
    InvalidField { field: String, reason: String },

    #[error("Unsupported table: {0}")]
    UnsupportedTable(String),
}

#[derive(Error, Debug)]
pub enum RealtimeError {
    #[error("Write for {local_id} was rejected: {reason}")]
    WriteFailure { local_id: String, reason: String },

    #[error("Send {local_id} was not confirmed in time")]
    ConfirmTimeout { local_id: String },

    #[error("Realtime session already torn down")]
    SessionClosed,

    #[error("Operation not supported: {0}")]
    Unsupported(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Normalization error: {0}")]
    Normalize(#[from] NormalizeError),
}

impl From<RealtimeError> for AppError {
    fn from(error: RealtimeError) -> Self {
        match error {
            RealtimeError::WriteFailure { .. } => AppError::ExternalService(error.to_string()),
            RealtimeError::ConfirmTimeout { .. } => AppError::ExternalService(error.to_string()),
            RealtimeError::SessionClosed => AppError::Unavailable(error.to_string()),
            RealtimeError::Unsupported(_) => AppError::BadRequest(error.to_string()),
            RealtimeError::Transport(_) => AppError::ExternalService(error.to_string()),
            RealtimeError::Normalize(_) => AppError::ValidationError(error.to_string()),
        }
    }
}
