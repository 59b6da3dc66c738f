//! Error taxonomy shared by the provider client, queue and coordinator

use crate::settings::SettingsError;
use crate::storage::StorageError;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Every terminal failure a caller can observe.
///
/// `Display` is the short, human-readable text handed back to the UI.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Missing API key. Add your OpenRouter key in the settings.")]
    MissingApiKey,

    #[error("No text selected")]
    EmptySelection,

    #[error("Selected text is too long ({len} characters, max {max})")]
    TooLong { len: usize, max: usize },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("Provider error {status}: {body}")]
    Provider { status: u16, body: String },

    #[error("No response content returned")]
    EmptyResponse,

    #[error("Failed to parse provider response: {0}")]
    Parse(String),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Queue cleared")]
    QueueCleared,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Stable category name, used as the telemetry error-type key.
    pub fn category(&self) -> &'static str {
        match self {
            Error::MissingApiKey => "configuration",
            Error::EmptySelection | Error::TooLong { .. } => "validation",
            Error::Network(_) => "network",
            Error::Timeout(_) => "timeout",
            Error::Provider { .. } => "provider",
            Error::EmptyResponse | Error::Parse(_) => "parse",
            Error::Cancelled | Error::QueueCleared => "queue",
            Error::Storage(_) => "storage",
            Error::Internal(_) => "internal",
        }
    }

    /// Whether the provider client may retry after this failure.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Network(_) => true,
            Error::Provider { status, .. } => is_retryable_status(*status),
            _ => false,
        }
    }
}

/// Statuses worth a second attempt: rate limiting and gateway trouble.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

impl From<StorageError> for Error {
    fn from(err: StorageError) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<SettingsError> for Error {
    fn from(err: SettingsError) -> Self {
        Error::Storage(err.to_string())
    }
}
