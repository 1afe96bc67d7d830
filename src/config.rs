//! Engine configuration.
//!
//! Configuration is assembled in layers:
//!
//! ```text
//! defaults ──► YAML file (optional) ──► WORKFORGE_* env vars ──► validate ──► Arc<Config>
//! ```
//!
//! Once finalized the configuration is shared read-only through an `Arc`,
//! so nothing can change it while the daemon is running.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::process;
use crate::strategy::StrategyKind;

/// Name of the queue that must always be configured.
pub const DEFAULT_QUEUE: &str = "default";

/// Errors that can occur while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required parameter was not provided.
    #[error("Missing configuration parameter: {0}")]
    MissingParameter(String),

    /// A value could not be parsed.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// Reading the configuration file failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration file is not valid YAML for this schema.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Engine configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Maximum number of live workers per host.
    pub concurrency: usize,
    /// Pause between daemon loop ticks.
    pub main_loop_delay: Duration,
    /// Dispatch strategy.
    pub strategy: StrategyKind,
    /// Queue names in priority order.
    pub queues: Vec<String>,
    /// Blocking pop timeout when waiting for a job.
    pub queue_timeout: Duration,
    /// How long to wait for a free worker slot.
    pub worker_lock_timeout: Duration,
    /// Maximum worker age before it is considered stale.
    pub worker_live_time: Duration,
    /// Maximum jobs processed by one worker before it is considered stale.
    pub worker_jobs_limit: u64,
    /// Minimum interval between dead-worker sweeps.
    pub maintenance_interval: Duration,
    /// Grace period after SIGTERM before giving up.
    pub process_term_timeout: Duration,
    /// Grace period after SIGKILL before giving up.
    pub process_kill_timeout: Duration,
    /// How long the daemon waits for in-flight workers on exit.
    pub shutdown_timeout: Duration,
    /// Key of the job id counter.
    pub sequence_key: String,
    /// Prefix of the per-host daemon pid keys.
    pub daemon_key: String,
    /// Prefix of the worker registry keys.
    pub workers_key: String,
    /// Prefix of the queue list keys.
    pub queue_key: String,
    /// Redis connection URL.
    pub redis_url: String,
    /// Namespace prepended to every store key.
    pub namespace: String,
    /// Host identity used for daemon and worker registration.
    pub hostname: String,
    /// Default log filter for the binary.
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            concurrency: 4,
            main_loop_delay: Duration::from_millis(25),
            strategy: StrategyKind::Single,
            queues: vec![DEFAULT_QUEUE.to_string()],
            queue_timeout: Duration::from_secs(5),
            worker_lock_timeout: Duration::from_secs(1),
            worker_live_time: Duration::from_secs(300),
            worker_jobs_limit: 1000,
            maintenance_interval: Duration::from_secs(60),
            process_term_timeout: Duration::from_secs(10),
            process_kill_timeout: Duration::from_secs(20),
            shutdown_timeout: Duration::from_secs(60),
            sequence_key: "sequence".to_string(),
            daemon_key: "daemon".to_string(),
            workers_key: "workers".to_string(),
            queue_key: "queue".to_string(),
            redis_url: "redis://localhost:6379".to_string(),
            namespace: "workforge".to_string(),
            hostname: process::hostname(),
            log_level: "info".to_string(),
        }
    }
}

/// On-disk representation. Every field is optional; durations are
/// expressed in milliseconds or seconds as the field name says.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    concurrency: Option<usize>,
    main_loop_delay_ms: Option<u64>,
    strategy: Option<StrategyKind>,
    queues: Option<Vec<String>>,
    queue_timeout_secs: Option<f64>,
    worker_lock_timeout_secs: Option<f64>,
    worker_live_time_secs: Option<u64>,
    worker_jobs_limit: Option<u64>,
    maintenance_interval_secs: Option<u64>,
    process_term_timeout_secs: Option<u64>,
    process_kill_timeout_secs: Option<u64>,
    shutdown_timeout_secs: Option<u64>,
    sequence_key: Option<String>,
    daemon_key: Option<String>,
    workers_key: Option<String>,
    queue_key: Option<String>,
    redis_url: Option<String>,
    namespace: Option<String>,
    hostname: Option<String>,
    log_level: Option<String>,
}

impl Config {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads the layered configuration: defaults, then the optional YAML
    /// file, then environment overrides. The result is validated.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => Self::from_yaml_file(path)?,
            None => Self::default(),
        };
        let config = config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Creates a configuration from defaults plus environment overrides.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if a variable cannot be parsed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().apply_env()
    }

    /// Reads a YAML configuration file on top of the defaults.
    pub fn from_yaml_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&raw)
    }

    /// Parses YAML configuration on top of the defaults.
    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = if raw.trim().is_empty() {
            ConfigFile::default()
        } else {
            serde_yaml::from_str(raw)?
        };
        Self::default().merge(file)
    }

    fn merge(mut self, file: ConfigFile) -> Result<Self, ConfigError> {
        if let Some(v) = file.concurrency {
            self.concurrency = v;
        }
        if let Some(ms) = file.main_loop_delay_ms {
            self.main_loop_delay = Duration::from_millis(ms);
        }
        if let Some(v) = file.strategy {
            self.strategy = v;
        }
        if let Some(v) = file.queues {
            self.queues = v;
        }
        if let Some(secs) = file.queue_timeout_secs {
            self.queue_timeout = secs_f64("queue_timeout_secs", secs)?;
        }
        if let Some(secs) = file.worker_lock_timeout_secs {
            self.worker_lock_timeout = secs_f64("worker_lock_timeout_secs", secs)?;
        }
        if let Some(secs) = file.worker_live_time_secs {
            self.worker_live_time = Duration::from_secs(secs);
        }
        if let Some(v) = file.worker_jobs_limit {
            self.worker_jobs_limit = v;
        }
        if let Some(secs) = file.maintenance_interval_secs {
            self.maintenance_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = file.process_term_timeout_secs {
            self.process_term_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = file.process_kill_timeout_secs {
            self.process_kill_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = file.shutdown_timeout_secs {
            self.shutdown_timeout = Duration::from_secs(secs);
        }
        if let Some(v) = file.sequence_key {
            self.sequence_key = v;
        }
        if let Some(v) = file.daemon_key {
            self.daemon_key = v;
        }
        if let Some(v) = file.workers_key {
            self.workers_key = v;
        }
        if let Some(v) = file.queue_key {
            self.queue_key = v;
        }
        if let Some(v) = file.redis_url {
            self.redis_url = v;
        }
        if let Some(v) = file.namespace {
            self.namespace = v;
        }
        if let Some(v) = file.hostname {
            self.hostname = v;
        }
        if let Some(v) = file.log_level {
            self.log_level = v;
        }
        Ok(self)
    }

    fn apply_env(mut self) -> Result<Self, ConfigError> {
        if let Ok(val) = std::env::var("WORKFORGE_CONCURRENCY") {
            self.concurrency = parse_env_value(&val, "WORKFORGE_CONCURRENCY")?;
        }

        if let Ok(val) = std::env::var("WORKFORGE_STRATEGY") {
            self.strategy = parse_env_value(&val, "WORKFORGE_STRATEGY")?;
        }

        if let Ok(val) = std::env::var("WORKFORGE_QUEUES") {
            self.queues = val
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        if let Ok(val) = std::env::var("WORKFORGE_QUEUE_TIMEOUT_SECS") {
            let secs: f64 = parse_env_value(&val, "WORKFORGE_QUEUE_TIMEOUT_SECS")?;
            self.queue_timeout = secs_f64("WORKFORGE_QUEUE_TIMEOUT_SECS", secs)?;
        }

        if let Ok(val) = std::env::var("WORKFORGE_WORKER_JOBS_LIMIT") {
            self.worker_jobs_limit = parse_env_value(&val, "WORKFORGE_WORKER_JOBS_LIMIT")?;
        }

        if let Ok(val) = std::env::var("WORKFORGE_WORKER_LIVE_TIME_SECS") {
            let secs: u64 = parse_env_value(&val, "WORKFORGE_WORKER_LIVE_TIME_SECS")?;
            self.worker_live_time = Duration::from_secs(secs);
        }

        if let Ok(val) = std::env::var("WORKFORGE_REDIS_URL") {
            self.redis_url = val;
        }

        if let Ok(val) = std::env::var("WORKFORGE_NAMESPACE") {
            self.namespace = val;
        }

        if let Ok(val) = std::env::var("WORKFORGE_HOSTNAME") {
            self.hostname = val;
        }

        if let Ok(val) = std::env::var("WORKFORGE_LOG_LEVEL") {
            self.log_level = val;
        }

        Ok(self)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::ValidationFailed(
                "concurrency must be greater than 0".to_string(),
            ));
        }

        if self.worker_jobs_limit == 0 {
            return Err(ConfigError::ValidationFailed(
                "worker_jobs_limit must be greater than 0".to_string(),
            ));
        }

        if self.queues.is_empty() {
            return Err(ConfigError::MissingParameter("queues".to_string()));
        }

        if !self.queues.iter().any(|q| q == DEFAULT_QUEUE) {
            return Err(ConfigError::ValidationFailed(format!(
                "queue list must contain '{}'",
                DEFAULT_QUEUE
            )));
        }

        for (i, name) in self.queues.iter().enumerate() {
            if name.is_empty() {
                return Err(ConfigError::ValidationFailed(
                    "queue names cannot be empty".to_string(),
                ));
            }
            if self.queues[..i].contains(name) {
                return Err(ConfigError::ValidationFailed(format!(
                    "queue '{}' is listed twice",
                    name
                )));
            }
        }

        for (key, value) in [
            ("sequence_key", &self.sequence_key),
            ("daemon_key", &self.daemon_key),
            ("workers_key", &self.workers_key),
            ("queue_key", &self.queue_key),
            ("namespace", &self.namespace),
            ("hostname", &self.hostname),
            ("redis_url", &self.redis_url),
        ] {
            if value.is_empty() {
                return Err(ConfigError::MissingParameter(key.to_string()));
            }
        }

        Ok(())
    }

    /// Validates and freezes the configuration.
    pub fn finalize(self) -> Result<Arc<Config>, ConfigError> {
        self.validate()?;
        Ok(Arc::new(self))
    }

    /// Sets the worker concurrency.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Sets the dispatch strategy.
    pub fn with_strategy(mut self, strategy: StrategyKind) -> Self {
        self.strategy = strategy;
        self
    }

    /// Sets the queue list (priority order).
    pub fn with_queues<I, S>(mut self, queues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.queues = queues.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the blocking pop timeout.
    pub fn with_queue_timeout(mut self, timeout: Duration) -> Self {
        self.queue_timeout = timeout;
        self
    }

    /// Sets the worker slot wait timeout.
    pub fn with_worker_lock_timeout(mut self, timeout: Duration) -> Self {
        self.worker_lock_timeout = timeout;
        self
    }

    /// Sets the worker staleness limits.
    pub fn with_worker_limits(mut self, jobs_limit: u64, live_time: Duration) -> Self {
        self.worker_jobs_limit = jobs_limit;
        self.worker_live_time = live_time;
        self
    }

    /// Sets the pause between daemon ticks.
    pub fn with_main_loop_delay(mut self, delay: Duration) -> Self {
        self.main_loop_delay = delay;
        self
    }

    /// Sets the dead-worker sweep interval.
    pub fn with_maintenance_interval(mut self, interval: Duration) -> Self {
        self.maintenance_interval = interval;
        self
    }

    /// Sets the process stop timeouts.
    pub fn with_process_timeouts(mut self, term: Duration, kill: Duration) -> Self {
        self.process_term_timeout = term;
        self.process_kill_timeout = kill;
        self
    }

    /// Sets the in-flight worker drain timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Sets the Redis URL.
    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    /// Sets the store namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Sets the host identity.
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    /// Key of the daemon pid entry for this host.
    pub fn daemon_pid_key(&self) -> String {
        format!("{}:{}", self.daemon_key, self.hostname)
    }

    /// Key of the worker collection set for this host.
    pub fn workers_host_key(&self) -> String {
        format!("{}:{}", self.workers_key, self.hostname)
    }
}

/// Helper function to parse environment variable values.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("cannot parse '{}'", value),
    })
}

fn secs_f64(key: &str, secs: f64) -> Result<Duration, ConfigError> {
    Duration::try_from_secs_f64(secs).map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        message: e.to_string(),
    })
}
