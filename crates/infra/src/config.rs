//! Configuration loading and representation.
//!
//! Everything is read from `PUBSCHED_*` environment variables (plus
//! `DATABASE_URL`). Unset variables fall back to defaults; set but malformed
//! variables are errors rather than silently ignored.

use std::time::Duration;

use reqwest::Url;
use serde::{Deserialize, Serialize};

use pubsched_core::WorkerId;
use pubsched_scheduler::SchedulerConfig;

pub const ENV_DATABASE_URL: &str = "DATABASE_URL";
pub const ENV_PUBLISHER_URL: &str = "PUBSCHED_PUBLISHER_URL";
pub const ENV_PUBLISH_TIMEOUT_MS: &str = "PUBSCHED_PUBLISH_TIMEOUT_MS";
pub const ENV_GRACE_SECONDS: &str = "PUBSCHED_GRACE_SECONDS";
pub const ENV_BACKOFF_SECONDS: &str = "PUBSCHED_BACKOFF_SECONDS";
pub const ENV_MAX_ATTEMPTS: &str = "PUBSCHED_MAX_ATTEMPTS";
pub const ENV_POLL_INTERVAL_MS: &str = "PUBSCHED_POLL_INTERVAL_MS";
pub const ENV_MAX_JOBS: &str = "PUBSCHED_MAX_JOBS";
pub const ENV_STOP_TIMEOUT_MS: &str = "PUBSCHED_STOP_TIMEOUT_MS";
pub const ENV_POLL_JITTER_MS: &str = "PUBSCHED_POLL_JITTER_MS";
pub const ENV_WORKER_ID: &str = "PUBSCHED_WORKER_ID";

const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?} ({reason})")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("{0} must be set")]
    Missing(&'static str),
}

impl ConfigError {
    fn invalid(key: &'static str, value: &str, reason: impl ToString) -> Self {
        Self::Invalid {
            key,
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Poller tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    /// Sleep between cycles.
    pub interval: Duration,
    /// Upper bound on jobs executed per cycle.
    pub max_jobs_per_cycle: usize,
    /// How long `stop()` waits for an in-flight cycle.
    pub stop_timeout: Duration,
    /// Random extra sleep, `0..=jitter`, added to each interval.
    pub jitter: Duration,
    pub worker_id: WorkerId,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            max_jobs_per_cycle: 50,
            stop_timeout: Duration::from_secs(30),
            jitter: Duration::from_millis(500),
            worker_id: WorkerId::generate(),
        }
    }
}

/// Process configuration for the worker binary.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Postgres connection string; `None` runs on the in-memory repository.
    pub database_url: Option<String>,
    pub publisher_url: Option<Url>,
    pub publish_timeout: Duration,
    pub scheduler: SchedulerConfig,
    pub poller: PollerConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup (the process environment in production).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &'static str| lookup(key).filter(|v| !v.trim().is_empty());

        let mut scheduler = SchedulerConfig::default();
        if let Some(v) = get(ENV_GRACE_SECONDS) {
            scheduler.grace_seconds = parse_number(ENV_GRACE_SECONDS, &v)?;
            scheduler
                .grace()
                .map_err(|e| ConfigError::invalid(ENV_GRACE_SECONDS, &v, e))?;
        }
        if let Some(v) = get(ENV_BACKOFF_SECONDS) {
            scheduler.backoff_seconds = parse_backoff_table(&v)?;
        }
        if let Some(v) = get(ENV_MAX_ATTEMPTS) {
            scheduler.max_attempts = parse_number(ENV_MAX_ATTEMPTS, &v)?;
        }
        scheduler.backoff_policy().map_err(|e| {
            ConfigError::invalid(
                ENV_BACKOFF_SECONDS,
                &get(ENV_BACKOFF_SECONDS).unwrap_or_default(),
                e,
            )
        })?;

        let mut poller = PollerConfig::default();
        if let Some(v) = get(ENV_POLL_INTERVAL_MS) {
            poller.interval = parse_millis(ENV_POLL_INTERVAL_MS, &v)?;
            if poller.interval.is_zero() {
                return Err(ConfigError::invalid(ENV_POLL_INTERVAL_MS, &v, "must be positive"));
            }
        }
        if let Some(v) = get(ENV_MAX_JOBS) {
            poller.max_jobs_per_cycle = parse_number(ENV_MAX_JOBS, &v)?;
            if poller.max_jobs_per_cycle == 0 {
                return Err(ConfigError::invalid(ENV_MAX_JOBS, &v, "must be positive"));
            }
        }
        if let Some(v) = get(ENV_STOP_TIMEOUT_MS) {
            poller.stop_timeout = parse_millis(ENV_STOP_TIMEOUT_MS, &v)?;
        }
        if let Some(v) = get(ENV_POLL_JITTER_MS) {
            poller.jitter = parse_millis(ENV_POLL_JITTER_MS, &v)?;
        }
        if let Some(v) = get(ENV_WORKER_ID) {
            poller.worker_id =
                WorkerId::new(v.trim()).map_err(|e| ConfigError::invalid(ENV_WORKER_ID, &v, e))?;
        }

        let publisher_url = get(ENV_PUBLISHER_URL)
            .map(|v| Url::parse(v.trim()).map_err(|e| ConfigError::invalid(ENV_PUBLISHER_URL, &v, e)))
            .transpose()?;

        let publish_timeout = match get(ENV_PUBLISH_TIMEOUT_MS) {
            Some(v) => parse_millis(ENV_PUBLISH_TIMEOUT_MS, &v)?,
            None => DEFAULT_PUBLISH_TIMEOUT,
        };

        Ok(Self {
            database_url: get(ENV_DATABASE_URL),
            publisher_url,
            publish_timeout,
            scheduler,
            poller,
        })
    }

    /// Publisher URL, required by modes that execute jobs.
    pub fn require_publisher_url(&self) -> Result<&Url, ConfigError> {
        self.publisher_url
            .as_ref()
            .ok_or(ConfigError::Missing(ENV_PUBLISHER_URL))
    }
}

fn parse_number<T>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| ConfigError::invalid(key, value, e))
}

fn parse_millis(key: &'static str, value: &str) -> Result<Duration, ConfigError> {
    parse_number::<u64>(key, value).map(Duration::from_millis)
}

fn parse_backoff_table(value: &str) -> Result<Vec<u64>, ConfigError> {
    value
        .split(',')
        .map(|entry| parse_number::<u64>(ENV_BACKOFF_SECONDS, entry))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let config = load(&[]).unwrap();
        assert!(config.database_url.is_none());
        assert!(config.publisher_url.is_none());
        assert_eq!(config.scheduler, SchedulerConfig::default());
        assert_eq!(config.poller.max_jobs_per_cycle, 50);
        assert_eq!(config.publish_timeout, DEFAULT_PUBLISH_TIMEOUT);
        assert!(matches!(
            config.require_publisher_url(),
            Err(ConfigError::Missing(ENV_PUBLISHER_URL))
        ));
    }

    #[test]
    fn reads_every_variable() {
        let config = load(&[
            (ENV_DATABASE_URL, "postgres://localhost/pubsched"),
            (ENV_PUBLISHER_URL, "http://cms.internal/api/"),
            (ENV_PUBLISH_TIMEOUT_MS, "2500"),
            (ENV_GRACE_SECONDS, "30"),
            (ENV_BACKOFF_SECONDS, "5, 15,60"),
            (ENV_MAX_ATTEMPTS, "3"),
            (ENV_POLL_INTERVAL_MS, "1000"),
            (ENV_MAX_JOBS, "10"),
            (ENV_STOP_TIMEOUT_MS, "2000"),
            (ENV_POLL_JITTER_MS, "0"),
            (ENV_WORKER_ID, "worker-a"),
        ])
        .unwrap();

        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/pubsched"));
        assert_eq!(config.publish_timeout, Duration::from_millis(2500));
        assert_eq!(config.scheduler.grace_seconds, 30);
        assert_eq!(config.scheduler.backoff_seconds, vec![5, 15, 60]);
        assert_eq!(config.scheduler.max_attempts, 3);
        assert_eq!(config.poller.interval, Duration::from_secs(1));
        assert_eq!(config.poller.max_jobs_per_cycle, 10);
        assert_eq!(config.poller.stop_timeout, Duration::from_secs(2));
        assert!(config.poller.jitter.is_zero());
        assert_eq!(config.poller.worker_id.as_str(), "worker-a");
        assert_eq!(
            config.require_publisher_url().unwrap().as_str(),
            "http://cms.internal/api/"
        );
    }

    #[test]
    fn malformed_values_are_errors() {
        assert!(matches!(
            load(&[(ENV_MAX_ATTEMPTS, "five")]),
            Err(ConfigError::Invalid { key: ENV_MAX_ATTEMPTS, .. })
        ));
        assert!(matches!(
            load(&[(ENV_BACKOFF_SECONDS, "5,,60")]),
            Err(ConfigError::Invalid { key: ENV_BACKOFF_SECONDS, .. })
        ));
        assert!(matches!(
            load(&[(ENV_POLL_INTERVAL_MS, "0")]),
            Err(ConfigError::Invalid { key: ENV_POLL_INTERVAL_MS, .. })
        ));
        assert!(matches!(
            load(&[(ENV_GRACE_SECONDS, "9000000000000")]),
            Err(ConfigError::Invalid { key: ENV_GRACE_SECONDS, .. })
        ));
        assert!(matches!(
            load(&[(ENV_BACKOFF_SECONDS, "5,9000000000000")]),
            Err(ConfigError::Invalid { key: ENV_BACKOFF_SECONDS, .. })
        ));
        assert!(matches!(
            load(&[(ENV_PUBLISHER_URL, "not a url")]),
            Err(ConfigError::Invalid { key: ENV_PUBLISHER_URL, .. })
        ));
    }

    #[test]
    fn blank_values_fall_back_to_defaults() {
        let config = load(&[(ENV_GRACE_SECONDS, "  "), (ENV_WORKER_ID, "")]).unwrap();
        assert_eq!(config.scheduler.grace_seconds, 0);
        assert!(config.poller.worker_id.as_str().starts_with("worker-"));
    }
}
