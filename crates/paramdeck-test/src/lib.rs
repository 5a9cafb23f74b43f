//! Test harnesses for the paramdeck client.
//!
//! Provides `TestEvaluator`, an in-process dynamic parameter service, and
//! `TestBackend`, a mocked REST API, for end-to-end tests of sessions and
//! the create-workspace flow.

pub mod backend;
#[cfg(test)]
pub mod cli;
pub mod evaluator;
pub mod fixtures;

use thiserror::Error;

pub use backend::TestBackend;
pub use evaluator::{AcceptedConnection, Responder, ServerEvent, TestEvaluator};

/// Errors from harness operations.
#[derive(Debug, Error)]
pub enum TestError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("client error: {0}")]
    Client(#[from] paramdeck_lib::ClientError),

    #[error("timed out: {0}")]
    Timeout(String),
}
