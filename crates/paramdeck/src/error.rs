//! Error types for the paramdeck client.

use thiserror::Error;

use crate::validation::FieldError;

/// Terminal failure of an evaluation connection.
///
/// Delivered to [`ParameterHandler::on_error`](crate::client::ParameterHandler::on_error)
/// and surfaced to the page as a blocking banner. None of these are retried.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    /// The transport could not be established or signalled an error.
    #[error("websocket connection failed: {0}")]
    Failed(String),

    /// The server closed the connection without being asked to.
    #[error("websocket connection for dynamic parameters unexpectedly closed, refresh the page to reset the form")]
    UnexpectedlyClosed,

    /// The server sent a frame that does not match the wire format.
    #[error("malformed dynamic parameters message: {0}")]
    Protocol(String),
}

impl ConnectionError {
    /// Metric label for this failure.
    pub fn kind(&self) -> &'static str {
        match self {
            ConnectionError::Failed(_) => "transport",
            ConnectionError::UnexpectedlyClosed => "closed",
            ConnectionError::Protocol(_) => "protocol",
        }
    }
}

/// Errors from client operations.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The backend answered with a non-success status.
    #[error("{message} (status {status})")]
    Api {
        status: u16,
        message: String,
        detail: Option<String>,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid values file: {0}")]
    ValuesFile(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("external authentication required for: {}", .0.join(", "))]
    ExternalAuthRequired(Vec<String>),

    #[error("external authentication polling abandoned after {0} seconds")]
    ExternalAuthAbandoned(u64),

    #[error(transparent)]
    Form(#[from] FormError),

    #[error("session closed before parameters were received")]
    SessionClosed,

    #[error("timed out {0}")]
    Timeout(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("{0}")]
    NotFound(String),
}

impl ClientError {
    /// True for failures that can only be fixed by the caller (bad flags,
    /// bad input), as opposed to runtime failures.
    pub fn is_usage(&self) -> bool {
        matches!(
            self,
            ClientError::Config(_) | ClientError::ValuesFile(_) | ClientError::Form(_)
        )
    }
}

/// Client-side form validation failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FormError {
    #[error("{} invalid field(s): {}", .0.len(), describe(.0))]
    Invalid(Vec<FieldError>),

    #[error("submission is blocked: {0}")]
    Blocked(String),
}

fn describe(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(|e| format!("{}: {}", e.field, e.message))
        .collect::<Vec<_>>()
        .join("; ")
}
