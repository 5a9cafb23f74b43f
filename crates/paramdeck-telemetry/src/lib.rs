//! Observability infrastructure for the paramdeck client.
//!
//! This crate provides:
//! - Structured logging (JSON or pretty) with standard event names
//! - A Prometheus metrics registry for connection and snapshot activity
//!
//! # Usage
//!
//! ```ignore
//! use paramdeck_telemetry::{LogFormat, Telemetry, TelemetryConfig};
//!
//! let config = TelemetryConfig::new()
//!     .with_log_level("debug")
//!     .with_log_format(LogFormat::Pretty);
//!
//! let telemetry = Telemetry::init(config)?;
//! ```

pub mod config;
pub mod logging;
pub mod metrics;
pub mod prometheus;

pub use config::{LogFormat, TelemetryConfig};
pub use logging::events;
pub use metrics::MetricsRegistry;

use std::sync::Arc;
use thiserror::Error;

/// Telemetry errors.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// Failed to initialize logging.
    #[error("failed to initialize logging: {0}")]
    LoggingInit(String),
}

/// Main telemetry handle.
///
/// Holds the metrics registry shared with every client and session.
pub struct Telemetry {
    config: TelemetryConfig,
    metrics: Arc<MetricsRegistry>,
}

impl Telemetry {
    /// Initialize logging and create the metrics registry.
    pub fn init(config: TelemetryConfig) -> Result<Self, TelemetryError> {
        logging::init_logging(&config)?;
        Ok(Self::init_without_logging(config))
    }

    /// Create the metrics registry without installing a subscriber.
    ///
    /// Use this when logging is already initialized (e.g., in tests).
    pub fn init_without_logging(config: TelemetryConfig) -> Self {
        Self {
            config,
            metrics: Arc::new(MetricsRegistry::new()),
        }
    }

    /// Get the telemetry configuration.
    pub fn config(&self) -> &TelemetryConfig {
        &self.config
    }

    /// Get the metrics registry.
    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    /// Get a cloned Arc reference to the metrics registry.
    pub fn metrics_clone(&self) -> Arc<MetricsRegistry> {
        Arc::clone(&self.metrics)
    }

    /// Render metrics in Prometheus text format.
    pub fn render_prometheus(&self) -> String {
        prometheus::render_metrics(&self.metrics)
    }
}
