//! Error types for the tracing client.

use skein_trace::{CallId, TraceError, WriteError};
use thiserror::Error;

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors that can occur in the tracing client.
///
/// None of these ever reach the instrumented call path: delivery failures
/// are reported through the delivery-failure channel instead.
#[derive(Debug, Error)]
pub enum ClientError {
    /// HTTP/network error.
    #[error("Network error: {0}")]
    Network(String),

    /// The ingestion backend refused the whole request.
    #[error("Backend rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Local file error (call log transport).
    #[error("IO error: {0}")]
    Io(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// No record of the requested call is known to this client.
    #[error("Call not found: {0}")]
    CallNotFound(CallId),

    /// The client has already been shut down.
    #[error("Client already shut down")]
    AlreadyShutdown,

    /// Call state machine misuse.
    #[error(transparent)]
    State(#[from] TraceError),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ClientError {
    /// Whether a failed send may succeed if attempted again.
    ///
    /// Network failures, throttling and server-side errors are transient.
    /// Everything else is terminal.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Network(_) => true,
            ClientError::Rejected { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        ClientError::Network(e.to_string())
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(e: serde_json::Error) -> Self {
        ClientError::Serialization(e.to_string())
    }
}

impl From<std::io::Error> for ClientError {
    fn from(e: std::io::Error) -> Self {
        ClientError::Io(e.to_string())
    }
}

impl From<WriteError> for ClientError {
    fn from(e: WriteError) -> Self {
        match e {
            WriteError::Io(io) => ClientError::Io(io.to_string()),
            WriteError::Serialization(s) => ClientError::Serialization(s.to_string()),
        }
    }
}

impl From<toml::de::Error> for ClientError {
    fn from(e: toml::de::Error) -> Self {
        ClientError::Config(e.to_string())
    }
}
