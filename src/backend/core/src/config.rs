//! Configuration management.
//!
//! Values come from an optional file plus `KVQ__`-prefixed environment
//! variables (`KVQ__QUEUE__NAMESPACE=jobs`, `KVQ__STORE__BACKEND=redis`).
//! Environment wins over the file.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{KvqError, Result};
use crate::jobs::codec::{KeyCodec, LOCK_SEGMENT, SEPARATOR};
use crate::telemetry::TelemetryConfig;

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Key-value store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Queue behaviour shared by producers and workers
    #[serde(default)]
    pub queue: QueueSettings,

    /// Logging and metrics configuration
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Which [`KvStore`](crate::store::KvStore) implementation to build.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Prefix for every Redis key the store creates
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: default_redis_url(),
            key_prefix: default_key_prefix(),
        }
    }
}

/// Queue settings, passed explicitly to the lease manager, scanner and backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    /// Key namespace; must not contain `_`
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Queue used when a job names none
    #[serde(default = "default_queue")]
    pub default_queue: String,

    /// Queues this worker scans, in order; empty means the default queue only
    #[serde(default)]
    pub queues: Vec<String>,

    /// Inclusive lower priority bound for claimable jobs
    #[serde(default)]
    pub min_priority: Option<i32>,

    /// Inclusive upper priority bound for claimable jobs
    #[serde(default)]
    pub max_priority: Option<i32>,

    /// Scan `limit * read_ahead` candidates before filtering
    #[serde(default = "default_read_ahead")]
    pub read_ahead: usize,

    /// Candidates fetched per reservation attempt
    #[serde(default = "default_scan_limit")]
    pub scan_limit: usize,

    /// Lease age after which a lock counts as expired
    #[serde(default = "default_max_run_time", with = "humantime_serde")]
    pub max_run_time: Duration,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            default_queue: default_queue(),
            queues: Vec::new(),
            min_priority: None,
            max_priority: None,
            read_ahead: default_read_ahead(),
            scan_limit: default_scan_limit(),
            max_run_time: default_max_run_time(),
        }
    }
}

impl QueueSettings {
    pub fn codec(&self) -> KeyCodec {
        KeyCodec::new(&self.namespace)
    }

    /// Queues to scan, in order.
    pub fn effective_queues(&self) -> Vec<String> {
        if self.queues.is_empty() {
            vec![self.default_queue.clone()]
        } else {
            self.queues.clone()
        }
    }

    /// Whether `priority` lies inside the configured bounds.
    pub fn priority_allowed(&self, priority: i32) -> bool {
        self.min_priority.map_or(true, |min| priority >= min)
            && self.max_priority.map_or(true, |max| priority <= max)
    }

    pub fn validate(&self) -> Result<()> {
        if self.namespace.trim().is_empty() {
            return Err(KvqError::configuration("queue.namespace must not be blank"));
        }
        if self.namespace.contains(SEPARATOR) {
            return Err(KvqError::configuration(format!(
                "queue.namespace must not contain '{}': {}",
                SEPARATOR, self.namespace
            )));
        }
        if self.default_queue.trim().is_empty() {
            return Err(KvqError::configuration("queue.default_queue must not be blank"));
        }
        if let Some(q) = std::iter::once(&self.default_queue)
            .chain(self.queues.iter())
            .find(|q| q.as_str() == LOCK_SEGMENT)
        {
            return Err(KvqError::configuration(format!("queue name '{}' is reserved", q)));
        }
        if let (Some(min), Some(max)) = (self.min_priority, self.max_priority) {
            if min > max {
                return Err(KvqError::configuration(format!(
                    "queue.min_priority ({}) exceeds queue.max_priority ({})",
                    min, max
                )));
            }
        }
        if self.read_ahead == 0 {
            return Err(KvqError::configuration("queue.read_ahead must be at least 1"));
        }
        if self.scan_limit == 0 {
            return Err(KvqError::configuration("queue.scan_limit must be at least 1"));
        }
        Ok(())
    }
}

fn default_redis_url() -> String { "redis://localhost:6379".to_string() }
fn default_key_prefix() -> String { "kvq:".to_string() }
fn default_namespace() -> String { "kvq".to_string() }
fn default_queue() -> String { "default".to_string() }
fn default_read_ahead() -> usize { 1 }
fn default_scan_limit() -> usize { 5 }
fn default_max_run_time() -> Duration { Duration::from_secs(4 * 60 * 60) }

fn environment() -> config::Environment {
    config::Environment::with_prefix("KVQ")
        .separator("__")
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("queue.queues")
}

impl Config {
    /// Load configuration from the environment.
    pub fn load() -> Result<Self> {
        Self::build(None, environment())
    }

    /// Load from a specific file path, overlaid with the environment.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Self::build(Some(path.as_ref()), environment())
    }

    fn build(path: Option<&Path>, env: config::Environment) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path));
        }
        let config = builder.add_source(env).build()?;

        let cfg: Config = config.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        self.queue.validate()?;
        if self.store.backend == StoreBackend::Redis && self.store.redis_url.trim().is_empty() {
            return Err(KvqError::configuration("store.redis_url is required for the redis backend"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use std::collections::HashMap;
    use std::io::Write;

    fn env_from(pairs: &[(&str, &str)]) -> config::Environment {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        environment().source(Some(map))
    }

    #[test]
    fn test_defaults() {
        let cfg = Config::build(None, env_from(&[])).unwrap();
        assert_eq!(cfg.store.backend, StoreBackend::Memory);
        assert_eq!(cfg.queue.namespace, "kvq");
        assert_eq!(cfg.queue.default_queue, "default");
        assert_eq!(cfg.queue.read_ahead, 1);
        assert_eq!(cfg.queue.max_run_time, Duration::from_secs(14_400));
        assert_eq!(cfg.queue.effective_queues(), vec!["default".to_string()]);
    }

    #[test]
    fn test_file_then_environment() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[store]
backend = "redis"

[queue]
namespace = "mail"
queues = ["urgent", "bulk"]
min_priority = -10
max_run_time = "30m"
"#
        )
        .unwrap();

        let cfg = Config::build(
            Some(file.path()),
            env_from(&[("KVQ__QUEUE__READ_AHEAD", "3"), ("KVQ__QUEUE__NAMESPACE", "post")]),
        )
        .unwrap();

        assert_eq!(cfg.store.backend, StoreBackend::Redis);
        assert_eq!(cfg.queue.namespace, "post");
        assert_eq!(cfg.queue.read_ahead, 3);
        assert_eq!(cfg.queue.min_priority, Some(-10));
        assert_eq!(cfg.queue.max_run_time, Duration::from_secs(1800));
        assert_eq!(cfg.queue.effective_queues(), vec!["urgent", "bulk"]);
    }

    #[test]
    fn test_validation_rejects_bad_settings() {
        let cases: Vec<QueueSettings> = vec![
            QueueSettings { min_priority: Some(5), max_priority: Some(1), ..Default::default() },
            QueueSettings { read_ahead: 0, ..Default::default() },
            QueueSettings { namespace: " ".into(), ..Default::default() },
            QueueSettings { namespace: "kvq_job".into(), ..Default::default() },
            QueueSettings { default_queue: "".into(), ..Default::default() },
            QueueSettings { queues: vec!["lock".into()], ..Default::default() },
        ];
        for settings in cases {
            let err = settings.validate().unwrap_err();
            assert_eq!(err.code(), ErrorCode::InvalidConfiguration, "{:?}", settings);
        }
    }

    #[test]
    fn test_priority_bounds_are_inclusive() {
        let settings = QueueSettings {
            min_priority: Some(-1),
            max_priority: Some(3),
            ..Default::default()
        };
        assert!(settings.priority_allowed(-1));
        assert!(settings.priority_allowed(3));
        assert!(!settings.priority_allowed(4));
        assert!(!settings.priority_allowed(-2));
        assert!(QueueSettings::default().priority_allowed(i32::MIN));
    }

    #[test]
    fn test_invalid_file_is_configuration_error() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[queue]\nread_ahead = \"lots\"").unwrap();
        let err = Config::build(Some(file.path()), env_from(&[])).unwrap_err();
        assert!(matches!(
            err.code(),
            ErrorCode::ConfigurationError | ErrorCode::InvalidConfiguration
        ));
    }
}
