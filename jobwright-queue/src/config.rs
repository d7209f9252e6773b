//! Engine configuration.
//!
//! Loaded from TOML, JSON or `JOBWRIGHT_*` environment variables. Every
//! field has a default, so a config file only needs what it changes:
//!
//! ```toml
//! concurrency = 8
//! selection = "weighted"
//! queues = [{ name = "critical", weight = 3 }, { name = "default" }]
//!
//! [store]
//! backend = "file"
//! path = "/var/lib/jobwright/jobs.json"
//!
//! [[limiters]]
//! name = "erp"
//! kind = "concurrent"
//! capacity = 4
//! ```

use crate::error::ConfigError;
use crate::job::DEFAULT_MAX_RETRIES;
use crate::retry::{RetryConfig, RetryPolicy};
use crate::worker::{QueueSelection, QueueWeight, WorkerConfig};
use jobwright_ratelimit::LimiterDef;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Prefix of configuration environment variables.
pub const ENV_PREFIX: &str = "JOBWRIGHT_";

/// Where jobs are stored.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StoreConfig {
    /// Volatile in-process store
    #[default]
    Memory,
    /// In-process store snapshotted to a JSON file
    File {
        /// Snapshot path
        path: PathBuf,
    },
    /// Redis server (requires the `redis` feature)
    Redis {
        /// Connection URL
        url: String,
        /// Key prefix
        #[serde(default = "default_prefix")]
        prefix: String,
    },
}

fn default_prefix() -> String {
    "jobwright".to_string()
}

/// Limiter kind as written in config files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimiterKindConfig {
    /// At most `capacity` holders at once
    Concurrent,
    /// `capacity` admissions per aligned period
    Bucket,
    /// `capacity` admissions per rolling period
    Window,
}

/// A limiter definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Unique name
    pub name: String,
    /// Kind
    pub kind: LimiterKindConfig,
    /// Capacity
    pub capacity: u64,
    /// Period for bucket and window limiters
    #[serde(default)]
    pub period_ms: Option<u64>,
    /// Hold expiry for concurrent limiters
    #[serde(default)]
    pub lock_timeout_ms: Option<u64>,
    /// How long callers wait for capacity
    #[serde(default)]
    pub wait_timeout_ms: Option<u64>,
}

impl LimiterConfig {
    /// Convert to a registry definition
    pub fn to_def(&self) -> Result<LimiterDef, ConfigError> {
        let period = || {
            self.period_ms.map(Duration::from_millis).ok_or_else(|| {
                ConfigError::ValidationError(format!("limiter '{}' needs period_ms", self.name))
            })
        };

        let mut def = match self.kind {
            LimiterKindConfig::Concurrent => {
                let def = LimiterDef::concurrent(&self.name, self.capacity);
                match self.lock_timeout_ms {
                    Some(ms) => def.with_lock_timeout(Duration::from_millis(ms)),
                    None => def,
                }
            }
            LimiterKindConfig::Bucket => LimiterDef::bucket(&self.name, self.capacity, period()?),
            LimiterKindConfig::Window => LimiterDef::window(&self.name, self.capacity, period()?),
        };
        if let Some(ms) = self.wait_timeout_ms {
            def = def.with_wait_timeout(Duration::from_millis(ms));
        }

        def.validate()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        Ok(def)
    }
}

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Worker slots
    pub concurrency: usize,
    /// Queues the pool pulls from
    pub queues: Vec<QueueWeight>,
    /// Queue selection mode
    pub selection: QueueSelection,
    /// Longest an idle slot waits before polling
    pub poll_interval_ms: u64,
    /// Scheduler sweep interval
    pub scheduler_interval_ms: u64,
    /// Claim lease
    pub lease_timeout_ms: u64,
    /// Lease heartbeat interval
    pub heartbeat_interval_ms: u64,
    /// Job execution timeout
    pub job_timeout_ms: u64,
    /// Retries for job types registered without an explicit policy
    pub default_max_retries: u32,
    /// Base delay before rerunning a job refused by a limiter
    pub over_limit_backoff_ms: u64,
    /// Consecutive limiter refusals before counting as a failure
    pub max_over_limit_reschedules: u32,
    /// Dead jobs kept before the oldest are trimmed (`None` = unbounded)
    pub dead_max_jobs: Option<usize>,
    /// Job store
    pub store: StoreConfig,
    /// Limiters registered at startup
    pub limiters: Vec<LimiterConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let worker = WorkerConfig::default();
        let retry = RetryConfig::default();
        Self {
            concurrency: worker.concurrency,
            queues: worker.queues,
            selection: worker.selection,
            poll_interval_ms: worker.poll_interval.as_millis() as u64,
            scheduler_interval_ms: 5_000,
            lease_timeout_ms: worker.lease_timeout.as_millis() as u64,
            heartbeat_interval_ms: worker.heartbeat_interval.as_millis() as u64,
            job_timeout_ms: worker.job_timeout.as_millis() as u64,
            default_max_retries: DEFAULT_MAX_RETRIES,
            over_limit_backoff_ms: retry.over_limit_backoff.as_millis() as u64,
            max_over_limit_reschedules: retry.max_over_limit_reschedules,
            dead_max_jobs: retry.dead_max_jobs,
            store: StoreConfig::Memory,
            limiters: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Parse TOML
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse JSON
    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self =
            serde_json::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a `.toml` or `.json` file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::LoadError(format!("{}: {}", path.display(), e)))?;

        debug!(path = %path.display(), "Loading engine configuration");
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml_str(&content),
            Some("json") => Self::from_json_str(&content),
            other => Err(ConfigError::LoadError(format!(
                "unsupported config format: {:?}",
                other
            ))),
        }
    }

    /// Defaults overridden by `JOBWRIGHT_*` variables, after loading `.env` if present.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok(); // Ignore if .env doesn't exist
        let mut config = Self::default();
        config.apply_env(std::env::vars())?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `JOBWRIGHT_*` overrides from a set of variables.
    ///
    /// `JOBWRIGHT_QUEUES` takes `name[:weight]` entries separated by commas.
    pub fn apply_env<I>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let value = value.trim();
            match name.to_ascii_lowercase().as_str() {
                "concurrency" => self.concurrency = parse_var(&key, value)?,
                "queues" => self.queues = parse_queues(value)?,
                "selection" => {
                    self.selection = match value.to_ascii_lowercase().as_str() {
                        "strict" => QueueSelection::Strict,
                        "weighted" => QueueSelection::Weighted,
                        other => {
                            return Err(ConfigError::ParseError(format!(
                                "{}: unknown selection '{}'",
                                key, other
                            )));
                        }
                    }
                }
                "poll_interval_ms" => self.poll_interval_ms = parse_var(&key, value)?,
                "scheduler_interval_ms" => self.scheduler_interval_ms = parse_var(&key, value)?,
                "lease_timeout_ms" => self.lease_timeout_ms = parse_var(&key, value)?,
                "heartbeat_interval_ms" => self.heartbeat_interval_ms = parse_var(&key, value)?,
                "job_timeout_ms" => self.job_timeout_ms = parse_var(&key, value)?,
                "default_max_retries" => self.default_max_retries = parse_var(&key, value)?,
                "over_limit_backoff_ms" => self.over_limit_backoff_ms = parse_var(&key, value)?,
                "max_over_limit_reschedules" => {
                    self.max_over_limit_reschedules = parse_var(&key, value)?
                }
                "dead_max_jobs" => {
                    self.dead_max_jobs = match value {
                        "" | "none" | "unbounded" => None,
                        v => Some(parse_var(&key, v)?),
                    }
                }
                "store_path" => {
                    self.store = StoreConfig::File {
                        path: PathBuf::from(value),
                    }
                }
                "redis_url" => {
                    let prefix = match &self.store {
                        StoreConfig::Redis { prefix, .. } => prefix.clone(),
                        _ => default_prefix(),
                    };
                    self.store = StoreConfig::Redis {
                        url: value.to_string(),
                        prefix,
                    };
                }
                "redis_prefix" => {
                    if let StoreConfig::Redis { prefix, .. } = &mut self.store {
                        *prefix = value.to_string();
                    }
                }
                // JOBWRIGHT_LOG and friends belong to other layers
                _ => {}
            }
        }
        Ok(())
    }

    /// Check the configuration is usable
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.worker_config().validate()?;
        if self.scheduler_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "scheduler_interval_ms must be positive".to_string(),
            ));
        }
        for limiter in &self.limiters {
            limiter.to_def()?;
        }
        Ok(())
    }

    /// Set the number of worker slots
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    /// Replace the queue list
    pub fn with_queues(mut self, queues: Vec<QueueWeight>) -> Self {
        self.queues = queues;
        self
    }

    /// Set the queue selection mode
    pub fn with_selection(mut self, selection: QueueSelection) -> Self {
        self.selection = selection;
        self
    }

    /// Set the idle poll interval
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the scheduler sweep interval
    pub fn with_scheduler_interval(mut self, interval: Duration) -> Self {
        self.scheduler_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the job execution timeout
    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the over-limit reschedule delay
    pub fn with_over_limit_backoff(mut self, backoff: Duration) -> Self {
        self.over_limit_backoff_ms = backoff.as_millis() as u64;
        self
    }

    /// Set the store backend
    pub fn with_store(mut self, store: StoreConfig) -> Self {
        self.store = store;
        self
    }

    /// Add a limiter definition
    pub fn with_limiter(mut self, limiter: LimiterConfig) -> Self {
        self.limiters.push(limiter);
        self
    }

    /// Worker pool settings
    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            concurrency: self.concurrency,
            queues: self.queues.clone(),
            selection: self.selection,
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            lease_timeout: Duration::from_millis(self.lease_timeout_ms),
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            job_timeout: Duration::from_millis(self.job_timeout_ms),
        }
    }

    /// Failure path settings
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            over_limit_backoff: Duration::from_millis(self.over_limit_backoff_ms),
            max_over_limit_reschedules: self.max_over_limit_reschedules,
            dead_max_jobs: self.dead_max_jobs,
        }
    }

    /// Policy for job types without their own
    pub fn default_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.default_max_retries)
    }

    /// Scheduler sweep interval
    pub fn scheduler_interval(&self) -> Duration {
        Duration::from_millis(self.scheduler_interval_ms)
    }

    /// Limiter definitions
    pub fn limiter_defs(&self) -> Result<Vec<LimiterDef>, ConfigError> {
        self.limiters.iter().map(LimiterConfig::to_def).collect()
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::ParseError(format!("{}: invalid value '{}'", key, value)))
}

fn parse_queues(value: &str) -> Result<Vec<QueueWeight>, ConfigError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|entry| match entry.split_once(':') {
            Some((name, weight)) => Ok(QueueWeight::new(
                name.trim(),
                parse_var("JOBWRIGHT_QUEUES", weight.trim())?,
            )),
            None => Ok(QueueWeight::new(entry, 1)),
        })
        .collect()
}
