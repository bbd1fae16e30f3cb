//! Configuration for drover.
//!
//! Configuration is read from a YAML file. Durations are written in
//! humantime notation (`"60s"`, `"500ms"`, `"1m 30s"`).
//!
//! ```yaml
//! worker:
//!   command: php
//!   args: ["worker.php"]
//!   env:
//!     APP_ENV: production
//! pool:
//!   num_workers: 4
//!   max_jobs: 1000
//!   allocate_timeout: 60s
//!   destroy_timeout: 60s
//!   supervisor:
//!     watch_tick: 1s
//!     ttl: 1h
//!     idle_ttl: 10m
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{DroverError, Result};

/// Default time to wait for a free worker / a successful allocation.
pub const DEFAULT_ALLOCATE_TIMEOUT: Duration = Duration::from_secs(60);

/// Default time given to reset/destroy before workers are killed outright.
pub const DEFAULT_DESTROY_TIMEOUT: Duration = Duration::from_secs(60);

/// Default supervisor tick.
pub const DEFAULT_WATCH_TICK: Duration = Duration::from_secs(1);

/// Top-level configuration file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DroverConfig {
    /// How to start one worker process
    pub worker: WorkerCommandConfig,
    /// Pool sizing and timeouts
    #[serde(default)]
    pub pool: PoolConfig,
}

impl DroverConfig {
    /// Load and validate configuration from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                DroverError::config_not_found_with_source(path, e)
            } else {
                DroverError::io("reading config", path, e)
            }
        })?;

        let config = Self::from_yaml_str(&contents).map_err(|e| match e {
            DroverError::ConfigInvalid { message, .. } => DroverError::ConfigInvalid {
                path: path.to_path_buf(),
                message,
            },
            other => other,
        })?;

        tracing::debug!(path = %path.display(), "configuration loaded");
        Ok(config)
    }

    /// Parse and validate configuration from a YAML string.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml).map_err(|e| DroverError::ConfigInvalid {
            path: PathBuf::from("<inline>"),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check invariants serde cannot express.
    pub fn validate(&self) -> Result<()> {
        self.worker.validate()?;
        self.pool.validate()
    }
}

/// Command used to spawn one worker subprocess.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerCommandConfig {
    /// Program to execute
    pub command: String,
    /// Arguments passed to the program
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Working directory (defaults to the current directory)
    #[serde(default)]
    pub workdir: Option<PathBuf>,
}

impl WorkerCommandConfig {
    /// Create a command config with no arguments.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Default::default()
        }
    }

    /// Add an argument.
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add an environment variable.
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// The command line as a single display string.
    pub fn display(&self) -> String {
        std::iter::once(self.command.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn validate(&self) -> Result<()> {
        if self.command.trim().is_empty() {
            return Err(DroverError::config_validation("worker.command must not be empty"));
        }
        Ok(())
    }
}

/// Pool sizing and timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Target number of worker processes
    #[serde(default = "default_num_workers")]
    pub num_workers: u64,
    /// Executions after which a worker is replaced (0 = unlimited)
    #[serde(default)]
    pub max_jobs: u64,
    /// How long to wait for a free worker, and how long replacement
    /// allocation may keep retrying (0 = no retries)
    #[serde(default = "default_allocate_timeout", with = "duration_str")]
    pub allocate_timeout: Duration,
    /// Deadline handed to reset/destroy
    #[serde(default = "default_destroy_timeout", with = "duration_str")]
    pub destroy_timeout: Duration,
    /// Optional TTL supervision
    #[serde(default)]
    pub supervisor: Option<SupervisorConfig>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            num_workers: default_num_workers(),
            max_jobs: 0,
            allocate_timeout: DEFAULT_ALLOCATE_TIMEOUT,
            destroy_timeout: DEFAULT_DESTROY_TIMEOUT,
            supervisor: None,
        }
    }
}

impl PoolConfig {
    /// Create a pool config with `num_workers` and defaults elsewhere.
    pub fn new(num_workers: u64) -> Self {
        Self {
            num_workers,
            ..Default::default()
        }
    }

    /// Set the allocate timeout.
    pub fn with_allocate_timeout(mut self, timeout: Duration) -> Self {
        self.allocate_timeout = timeout;
        self
    }

    /// Set the destroy timeout.
    pub fn with_destroy_timeout(mut self, timeout: Duration) -> Self {
        self.destroy_timeout = timeout;
        self
    }

    /// Set the per-worker execution limit.
    pub fn with_max_jobs(mut self, max_jobs: u64) -> Self {
        self.max_jobs = max_jobs;
        self
    }

    /// Enable supervision.
    pub fn with_supervisor(mut self, supervisor: SupervisorConfig) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    /// Check pool sizing and supervisor settings.
    pub fn validate(&self) -> Result<()> {
        if self.num_workers == 0 {
            return Err(DroverError::config_validation(
                "pool.num_workers must be greater than zero",
            ));
        }
        if let Some(supervisor) = &self.supervisor {
            if supervisor.watch_tick.is_zero() {
                return Err(DroverError::config_validation(
                    "pool.supervisor.watch_tick must be greater than zero",
                ));
            }
        }
        Ok(())
    }
}

/// Periodic worker supervision. A zero duration disables that check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// How often the supervisor inspects the roster
    #[serde(default = "default_watch_tick", with = "duration_str")]
    pub watch_tick: Duration,
    /// Maximum worker lifetime
    #[serde(default, with = "duration_str")]
    pub ttl: Duration,
    /// Maximum time a worker may sit idle
    #[serde(default, with = "duration_str")]
    pub idle_ttl: Duration,
    /// Maximum time a single checkout may last
    #[serde(default, with = "duration_str")]
    pub exec_ttl: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            watch_tick: DEFAULT_WATCH_TICK,
            ttl: Duration::ZERO,
            idle_ttl: Duration::ZERO,
            exec_ttl: Duration::ZERO,
        }
    }
}

fn default_num_workers() -> u64 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u64)
        .unwrap_or(1)
}

fn default_allocate_timeout() -> Duration {
    DEFAULT_ALLOCATE_TIMEOUT
}

fn default_destroy_timeout() -> Duration {
    DEFAULT_DESTROY_TIMEOUT
}

fn default_watch_tick() -> Duration {
    DEFAULT_WATCH_TICK
}

/// Durations written as humantime strings ("500ms", "1m 30s").
mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&humantime::format_duration(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.trim()
            .parse::<humantime::Duration>()
            .map(Duration::from)
            .map_err(|e| D::Error::custom(format!("invalid duration `{raw}`: {e}")))
    }
}
