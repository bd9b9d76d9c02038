//! Telemetry: logging and metrics.
//!
//! - **Logging**: structured JSON/pretty/compact output through `tracing-subscriber`
//! - **Metrics**: counters and histograms through the `metrics` facade, with an
//!   optional Prometheus recorder
//!
//! # Example
//!
//! ```rust,no_run
//! use kvq_core::telemetry::{TelemetryConfig, init_telemetry};
//!
//! let config = TelemetryConfig::default();
//! let _handle = init_telemetry(&config).expect("Failed to initialize telemetry");
//! ```

pub mod logging;
pub mod metrics;

pub use logging::{init_logging, LogFormat, LoggingConfig, SpanEventConfig};
pub use metrics::{init_metrics, ClaimMetrics, JobMetrics, MetricsConfig, MetricsRegistry};

use serde::{Deserialize, Serialize};

/// Unified telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Service name attached to metrics
    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Environment (development, staging, production)
    #[serde(default = "default_environment")]
    pub environment: String,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Metrics configuration
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
            environment: default_environment(),
            logging: LoggingConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

fn default_service_name() -> String {
    "kvq".to_string()
}

fn default_environment() -> String {
    "production".to_string()
}

/// Handle returned by [`init_telemetry`].
#[derive(Debug)]
pub struct TelemetryHandle {
    pub metrics: MetricsRegistry,
}

/// Initialize metrics, then logging. Call once at startup.
pub fn init_telemetry(config: &TelemetryConfig) -> anyhow::Result<TelemetryHandle> {
    let metrics = init_metrics(&config.metrics, &config.service_name)?;
    init_logging(&config.logging, &config.environment)?;
    Ok(TelemetryHandle { metrics })
}
