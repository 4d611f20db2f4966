//! Pipeline configuration loaded from `INGEST_*` environment variables.

use std::collections::BTreeMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::monitor::MonitorConfig;
use crate::orchestrator::OrchestratorConfig;
use crate::retry::RetryPolicy;
use crate::stage::FanInPolling;
use crate::worker::WorkerConfig;

/// Errors encountered while loading configuration from environment variables.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Environment variable contained a value that could not be parsed.
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
    /// Values parsed but do not make sense together.
    #[error("Invalid configuration: {0}")]
    Inconsistent(String),
}

/// Runtime configuration for the ingestion pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineConfig {
    /// How often a running stage refreshes the job heartbeat.
    pub heartbeat_interval: Duration,
    /// Heartbeat age after which the monitor treats a job as stuck.
    pub stuck_threshold: Duration,
    /// Monitor recoveries allowed before a job fails permanently.
    pub max_restarts: u32,
    pub monitor_interval: Duration,
    /// Backoff and attempt budget for fan-out tasks.
    pub task_retry: RetryPolicy,
    /// Backoff between stage retries; `max_attempts` is the retry budget per stage.
    pub stage_retry: RetryPolicy,
    pub stage_timeout: Duration,
    pub fan_in: FanInPolling,
    pub claim_batch_size: usize,
    pub lease_duration: Duration,
    pub worker_poll_interval: Duration,
    /// Concurrent workers per task type.
    pub workers: BTreeMap<String, usize>,
    /// Upper bound on chunk length in the chunking stage.
    pub max_chunk_chars: usize,
    /// Chunks shorter than this are never product candidates.
    pub min_product_chunk_chars: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            stuck_threshold: Duration::from_secs(120),
            max_restarts: 3,
            monitor_interval: Duration::from_secs(60),
            task_retry: RetryPolicy::default(),
            stage_retry: RetryPolicy::exponential(3, Duration::from_secs(5), Duration::from_secs(300)),
            stage_timeout: Duration::from_secs(30 * 60),
            fan_in: FanInPolling::default(),
            claim_batch_size: 1,
            lease_duration: Duration::from_secs(30),
            worker_poll_interval: Duration::from_millis(200),
            workers: BTreeMap::from([
                ("chunk_embedding".to_string(), 5),
                ("image_embedding".to_string(), 5),
                ("product_enrichment".to_string(), 2),
            ]),
            max_chunk_chars: 1500,
            min_product_chunk_chars: 100,
        }
    }
}

impl PipelineConfig {
    /// Load configuration from the process environment. Unset variables keep their defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through `lookup`, which maps variable names to values.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let lookup = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let mut config = Self::default();

        if let Some(v) = lookup("INGEST_HEARTBEAT_INTERVAL_SECS") {
            config.heartbeat_interval = secs("INGEST_HEARTBEAT_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = lookup("INGEST_STUCK_THRESHOLD_SECS") {
            config.stuck_threshold = secs("INGEST_STUCK_THRESHOLD_SECS", &v)?;
        }
        if let Some(v) = lookup("INGEST_MAX_RESTARTS") {
            config.max_restarts = parse("INGEST_MAX_RESTARTS", &v)?;
        }
        if let Some(v) = lookup("INGEST_MONITOR_INTERVAL_SECS") {
            config.monitor_interval = secs("INGEST_MONITOR_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = lookup("INGEST_TASK_MAX_ATTEMPTS") {
            config.task_retry.max_attempts = parse("INGEST_TASK_MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = lookup("INGEST_TASK_BACKOFF_BASE_MS") {
            config.task_retry.base_delay = millis("INGEST_TASK_BACKOFF_BASE_MS", &v)?;
        }
        if let Some(v) = lookup("INGEST_TASK_BACKOFF_MAX_MS") {
            config.task_retry.max_delay = millis("INGEST_TASK_BACKOFF_MAX_MS", &v)?;
        }
        if let Some(v) = lookup("INGEST_STAGE_MAX_RETRIES") {
            config.stage_retry.max_attempts = parse("INGEST_STAGE_MAX_RETRIES", &v)?;
        }
        if let Some(v) = lookup("INGEST_STAGE_TIMEOUT_SECS") {
            config.stage_timeout = secs("INGEST_STAGE_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("INGEST_CLAIM_BATCH_SIZE") {
            config.claim_batch_size = parse("INGEST_CLAIM_BATCH_SIZE", &v)?;
        }
        if let Some(v) = lookup("INGEST_LEASE_SECS") {
            config.lease_duration = secs("INGEST_LEASE_SECS", &v)?;
        }
        if let Some(v) = lookup("INGEST_WORKERS") {
            config.workers.extend(parse_workers(&v)?);
        }
        if let Some(v) = lookup("INGEST_MAX_CHUNK_CHARS") {
            config.max_chunk_chars = parse("INGEST_MAX_CHUNK_CHARS", &v)?;
        }
        if let Some(v) = lookup("INGEST_MIN_PRODUCT_CHUNK_CHARS") {
            config.min_product_chunk_chars = parse("INGEST_MIN_PRODUCT_CHUNK_CHARS", &v)?;
        }

        config.validate()?;
        tracing::debug!(
            heartbeat_interval = ?config.heartbeat_interval,
            stuck_threshold = ?config.stuck_threshold,
            max_restarts = config.max_restarts,
            workers = ?config.workers,
            "Loaded pipeline configuration"
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval.is_zero() || self.monitor_interval.is_zero() {
            return Err(ConfigError::Inconsistent("intervals must be non-zero".into()));
        }
        if self.stuck_threshold <= self.heartbeat_interval {
            return Err(ConfigError::Inconsistent(format!(
                "stuck threshold {:?} must exceed heartbeat interval {:?}",
                self.stuck_threshold, self.heartbeat_interval
            )));
        }
        if self.lease_duration.is_zero() {
            return Err(ConfigError::Inconsistent("lease duration must be non-zero".into()));
        }
        if self.task_retry.max_attempts == 0 {
            return Err(ConfigError::Inconsistent("task max attempts must be at least 1".into()));
        }
        if self.claim_batch_size == 0 || self.max_chunk_chars == 0 {
            return Err(ConfigError::Inconsistent(
                "batch size and chunk size must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            heartbeat_interval: self.heartbeat_interval,
            stage_retry: self.stage_retry.clone(),
            task_max_attempts: self.task_retry.max_attempts,
            fan_in: self.fan_in,
            autostart: true,
        }
    }

    pub fn monitor(&self) -> MonitorConfig {
        MonitorConfig {
            interval: self.monitor_interval,
            stuck_threshold: self.stuck_threshold,
            max_restarts: self.max_restarts,
            ..Default::default()
        }
    }

    /// Worker settings for `task_type`; unlisted types get a single worker.
    pub fn worker(&self, task_type: &str) -> WorkerConfig {
        WorkerConfig {
            concurrency: self.workers.get(task_type).copied().unwrap_or(1),
            batch_size: self.claim_batch_size,
            lease_duration: self.lease_duration,
            poll_interval: self.worker_poll_interval,
        }
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue(key.to_string(), value.to_string()))
}

fn secs(key: &str, value: &str) -> Result<Duration, ConfigError> {
    parse(key, value).map(Duration::from_secs)
}

fn millis(key: &str, value: &str) -> Result<Duration, ConfigError> {
    parse(key, value).map(Duration::from_millis)
}

/// Parse `type=count` pairs, e.g. `image_embedding=5,chunk_embedding=2`.
fn parse_workers(value: &str) -> Result<BTreeMap<String, usize>, ConfigError> {
    let invalid = || ConfigError::InvalidValue("INGEST_WORKERS".to_string(), value.to_string());
    value
        .split(',')
        .filter(|pair| !pair.trim().is_empty())
        .map(|pair| {
            let (name, count) = pair.split_once('=').ok_or_else(invalid)?;
            let name = name.trim();
            let count: usize = count.trim().parse().map_err(|_| invalid())?;
            if name.is_empty() || count == 0 {
                return Err(invalid());
            }
            Ok((name.to_string(), count))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<PipelineConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        PipelineConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        assert_eq!(load(&[]).unwrap(), PipelineConfig::default());
    }

    #[test]
    fn overrides_are_applied() {
        let config = load(&[
            ("INGEST_STUCK_THRESHOLD_SECS", "300"),
            ("INGEST_MAX_RESTARTS", "5"),
            ("INGEST_WORKERS", "image_embedding=8, chunk_embedding=2"),
            ("INGEST_TASK_BACKOFF_BASE_MS", "250"),
            ("INGEST_STAGE_MAX_RETRIES", "5"),
            ("INGEST_MONITOR_INTERVAL_SECS", ""),
        ])
        .unwrap();

        assert_eq!(config.stuck_threshold, Duration::from_secs(300));
        assert_eq!(config.max_restarts, 5);
        assert_eq!(config.task_retry.base_delay, Duration::from_millis(250));
        assert_eq!(config.stage_retry.max_attempts, 5);
        assert_eq!(config.monitor_interval, Duration::from_secs(60));
        assert_eq!(config.worker("image_embedding").concurrency, 8);
        assert_eq!(config.worker("chunk_embedding").concurrency, 2);
        assert_eq!(config.worker("unknown").concurrency, 1);
    }

    #[test]
    fn malformed_values_are_rejected() {
        assert_eq!(
            load(&[("INGEST_MAX_RESTARTS", "many")]).unwrap_err(),
            ConfigError::InvalidValue("INGEST_MAX_RESTARTS".into(), "many".into())
        );
        assert!(load(&[("INGEST_WORKERS", "image_embedding")]).is_err());
        assert!(load(&[("INGEST_WORKERS", "image_embedding=0")]).is_err());
    }

    #[test]
    fn stuck_threshold_must_exceed_heartbeat() {
        let err = load(&[
            ("INGEST_HEARTBEAT_INTERVAL_SECS", "60"),
            ("INGEST_STUCK_THRESHOLD_SECS", "60"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::Inconsistent(_)));
    }
}
