//! Structured logging with JSON or pretty output.
//!
//! Logs always go to stderr so command output on stdout stays parseable.

use crate::{LogFormat, TelemetryConfig, TelemetryError};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Initialize the logging subsystem.
///
/// Sets up tracing-subscriber with either JSON or pretty format,
/// respecting the configured log level.
pub fn init_logging(config: &TelemetryConfig) -> Result<(), TelemetryError> {
    // Build the env filter from config or RUST_LOG
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    match config.log_format {
        LogFormat::Json => init_json_logging(filter),
        LogFormat::Pretty => init_pretty_logging(filter, config.ansi),
    }
}

fn init_json_logging(filter: EnvFilter) -> Result<(), TelemetryError> {
    let json_layer = fmt::layer()
        .json()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_current_span(true)
        .with_span_list(false)
        .with_file(false)
        .with_line_number(false)
        .flatten_event(true)
        .with_filter(filter);

    tracing_subscriber::registry()
        .with(json_layer)
        .try_init()
        .map_err(|e: tracing_subscriber::util::TryInitError| {
            TelemetryError::LoggingInit(e.to_string())
        })
}

fn init_pretty_logging(filter: EnvFilter, ansi: bool) -> Result<(), TelemetryError> {
    let pretty_layer = fmt::layer()
        .compact()
        .with_writer(std::io::stderr)
        .with_ansi(ansi)
        .with_target(false)
        .with_filter(filter);

    tracing_subscriber::registry()
        .with(pretty_layer)
        .try_init()
        .map_err(|e: tracing_subscriber::util::TryInitError| {
            TelemetryError::LoggingInit(e.to_string())
        })
}

/// Standard log event names.
pub mod events {
    /// A dynamic parameter session was opened.
    pub const SESSION_OPENED: &str = "session_opened";

    /// A snapshot replaced the working parameter set.
    pub const SNAPSHOT_APPLIED: &str = "snapshot_applied";

    /// A stale snapshot was ignored.
    pub const SNAPSHOT_DISCARDED: &str = "snapshot_discarded";

    /// The evaluation connection failed.
    pub const CONNECTION_FAILED: &str = "connection_failed";

    /// The evaluation connection closed.
    pub const CONNECTION_CLOSED: &str = "connection_closed";

    /// A workspace was created.
    pub const WORKSPACE_CREATED: &str = "workspace_created";
}

/// Helper macros for structured logging with standard fields.
///
/// These wrap the tracing macros to ensure consistent field naming.
#[macro_export]
macro_rules! log_session_opened {
    ($($field:tt)*) => {
        tracing::info!(
            event = $crate::logging::events::SESSION_OPENED,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_snapshot_applied {
    ($($field:tt)*) => {
        tracing::debug!(
            event = $crate::logging::events::SNAPSHOT_APPLIED,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_snapshot_discarded {
    ($($field:tt)*) => {
        tracing::debug!(
            event = $crate::logging::events::SNAPSHOT_DISCARDED,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_connection_failed {
    ($($field:tt)*) => {
        tracing::error!(
            event = $crate::logging::events::CONNECTION_FAILED,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_connection_closed {
    ($($field:tt)*) => {
        tracing::info!(
            event = $crate::logging::events::CONNECTION_CLOSED,
            $($field)*
        )
    };
}

#[macro_export]
macro_rules! log_workspace_created {
    ($($field:tt)*) => {
        tracing::info!(
            event = $crate::logging::events::WORKSPACE_CREATED,
            $($field)*
        )
    };
}
