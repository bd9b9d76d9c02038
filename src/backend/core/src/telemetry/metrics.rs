//! Queue metrics.
//!
//! Instrumented code records through the `metrics` facade; nothing is exported
//! unless a recorder is installed. [`init_metrics`] installs a Prometheus
//! recorder whose text output is available from [`MetricsRegistry::render`].
//!
//! | metric | type | labels |
//! |---|---|---|
//! | `kvq_errors_total` | counter | code, category, retryable |
//! | `kvq_claims_total` | counter | outcome |
//! | `kvq_locks_recovered_total` | counter | reason |
//! | `kvq_jobs_created_total` | counter | queue |
//! | `kvq_jobs_destroyed_total` | counter | |
//! | `kvq_scan_candidates` | histogram | |
//! | `kvq_store_op_duration_seconds` | histogram | backend, op |

use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Whether to install the Prometheus recorder
    #[serde(default)]
    pub enabled: bool,

    /// Histogram buckets for store operation durations (in seconds)
    #[serde(default = "default_duration_buckets")]
    pub duration_buckets: Vec<f64>,

    /// Global labels to add to all metrics
    #[serde(default)]
    pub global_labels: BTreeMap<String, String>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            duration_buckets: default_duration_buckets(),
            global_labels: BTreeMap::new(),
        }
    }
}

fn default_duration_buckets() -> Vec<f64> {
    vec![0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
}

/// Handle to the installed recorder, if any.
pub struct MetricsRegistry {
    prometheus_handle: Option<PrometheusHandle>,
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("prometheus_handle", &self.prometheus_handle.is_some())
            .finish()
    }
}

impl MetricsRegistry {
    /// A registry with no recorder behind it.
    pub fn disabled() -> Self {
        Self {
            prometheus_handle: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.prometheus_handle.is_some()
    }

    /// Render all metrics in Prometheus text format.
    pub fn render(&self) -> String {
        self.prometheus_handle
            .as_ref()
            .map(|h| h.render())
            .unwrap_or_default()
    }
}

/// Duration buckets apply to the store latency histogram only; the other
/// histograms record counts and stay summaries.
fn prometheus_builder(config: &MetricsConfig, service_name: &str) -> anyhow::Result<PrometheusBuilder> {
    let mut builder = PrometheusBuilder::new().add_global_label("service", service_name);
    for (key, value) in &config.global_labels {
        builder = builder.add_global_label(key, value);
    }
    let builder = builder.set_buckets_for_metric(
        Matcher::Full("kvq_store_op_duration_seconds".to_string()),
        &config.duration_buckets,
    )?;
    Ok(builder)
}

/// Install the Prometheus recorder.
///
/// # Errors
///
/// Returns an error if the buckets are invalid or a recorder is already
/// installed.
pub fn init_metrics(config: &MetricsConfig, service_name: &str) -> anyhow::Result<MetricsRegistry> {
    if !config.enabled {
        return Ok(MetricsRegistry::disabled());
    }

    let handle = prometheus_builder(config, service_name)?.install_recorder()?;
    register_metric_descriptions();

    tracing::info!(service_name = %service_name, "Metrics initialized");

    Ok(MetricsRegistry {
        prometheus_handle: Some(handle),
    })
}

fn register_metric_descriptions() {
    describe_counter!("kvq_errors_total", "Errors constructed, by code");
    describe_counter!("kvq_claims_total", "Claim attempts by outcome (won, conflict)");
    describe_counter!(
        "kvq_locks_recovered_total",
        "Locks returned to the primary keyspace, by reason (worker, expired)"
    );
    describe_counter!("kvq_jobs_created_total", "Jobs enqueued");
    describe_counter!("kvq_jobs_destroyed_total", "Jobs deleted after completion");
    describe_histogram!("kvq_scan_candidates", "Candidates returned per availability scan");
    describe_histogram!(
        "kvq_store_op_duration_seconds",
        "Key-value store round-trip time in seconds"
    );
}

// ═══════════════════════════════════════════════════════════════════════════════
// Recording helpers
// ═══════════════════════════════════════════════════════════════════════════════

/// Claim outcomes.
pub struct ClaimMetrics;

impl ClaimMetrics {
    pub fn won() {
        counter!("kvq_claims_total", "outcome" => "won").increment(1);
    }

    pub fn conflict() {
        counter!("kvq_claims_total", "outcome" => "conflict").increment(1);
    }
}

/// Job lifecycle counters.
pub struct JobMetrics;

impl JobMetrics {
    pub fn created(queue: &str) {
        counter!("kvq_jobs_created_total", "queue" => queue.to_string()).increment(1);
    }

    pub fn destroyed() {
        counter!("kvq_jobs_destroyed_total").increment(1);
    }

    pub fn locks_recovered(reason: &'static str, count: usize) {
        counter!("kvq_locks_recovered_total", "reason" => reason).increment(count as u64);
    }

    pub fn scan_candidates(count: usize) {
        histogram!("kvq_scan_candidates").record(count as f64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_metrics_render_empty() {
        let registry = init_metrics(&MetricsConfig::default(), "kvq-test").unwrap();
        assert!(!registry.is_enabled());
        assert_eq!(registry.render(), "");
    }

    #[test]
    fn test_duration_buckets_scoped_to_store_latency() {
        let config = MetricsConfig {
            enabled: true,
            ..Default::default()
        };
        let recorder = prometheus_builder(&config, "kvq-test").unwrap().build_recorder();
        let handle = recorder.handle();

        metrics::with_local_recorder(&recorder, || {
            histogram!("kvq_store_op_duration_seconds", "backend" => "redis", "op" => "get").record(0.002);
            JobMetrics::scan_candidates(5);
        });

        let rendered = handle.render();
        assert!(rendered.contains("kvq_store_op_duration_seconds_bucket"));
        assert!(rendered.contains("kvq_scan_candidates"));
        assert!(!rendered.contains("kvq_scan_candidates_bucket"));
    }

    #[test]
    fn test_helpers_without_recorder_are_noops() {
        ClaimMetrics::won();
        ClaimMetrics::conflict();
        JobMetrics::created("default");
        JobMetrics::destroyed();
        JobMetrics::locks_recovered("worker", 2);
        JobMetrics::scan_candidates(5);
    }
}
