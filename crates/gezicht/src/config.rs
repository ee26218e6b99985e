//! Pool configuration.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::spawner::{ProcessSpawner, WorkerSpawner};

pub const DEFAULT_WORKER_BINARY: &str = "python3";
pub const DEFAULT_WORKER_SCRIPT: &str = "python/main.py";
pub const DEFAULT_MIN_INSTANCE_COUNT: usize = 2;
pub const DEFAULT_MAX_INSTANCE_COUNT: usize = 4;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("max_instance_count must be at least 1")]
    NoInstances,
    #[error("min_instance_count ({min}) exceeds max_instance_count ({max})")]
    MinAboveMax { min: usize, max: usize },
    #[error("invalid value for {var}: {value:?}")]
    InvalidEnv { var: &'static str, value: String },
}

pub struct PoolConfig {
    pub worker_binary: PathBuf,
    pub worker_script: PathBuf,
    /// Workers created by [`FacePool::warm_up`](crate::FacePool::warm_up).
    pub min_instance_count: usize,
    pub max_instance_count: usize,
    /// Per-command reply deadline. `None` waits forever.
    pub command_timeout: Option<Duration>,
    pub spawner: Arc<dyn WorkerSpawner>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_binary: PathBuf::from(DEFAULT_WORKER_BINARY),
            worker_script: PathBuf::from(DEFAULT_WORKER_SCRIPT),
            min_instance_count: DEFAULT_MIN_INSTANCE_COUNT,
            max_instance_count: DEFAULT_MAX_INSTANCE_COUNT,
            command_timeout: None,
            spawner: Arc::new(ProcessSpawner),
        }
    }
}

impl std::fmt::Debug for PoolConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolConfig")
            .field("worker_binary", &self.worker_binary)
            .field("worker_script", &self.worker_script)
            .field("min_instance_count", &self.min_instance_count)
            .field("max_instance_count", &self.max_instance_count)
            .field("command_timeout", &self.command_timeout)
            .finish_non_exhaustive()
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults overridden by `GEZICHT_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub(crate) fn from_lookup(
        lookup: impl Fn(&'static str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(binary) = lookup("GEZICHT_WORKER_BINARY") {
            config.worker_binary = PathBuf::from(binary);
        }
        if let Some(script) = lookup("GEZICHT_WORKER_SCRIPT") {
            config.worker_script = PathBuf::from(script);
        }
        if let Some(min) = parse_var(&lookup, "GEZICHT_MIN_INSTANCES")? {
            config.min_instance_count = min;
        }
        if let Some(max) = parse_var(&lookup, "GEZICHT_MAX_INSTANCES")? {
            config.max_instance_count = max;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "GEZICHT_COMMAND_TIMEOUT_MS")? {
            config.command_timeout = (ms > 0).then(|| Duration::from_millis(ms));
        }

        Ok(config)
    }

    pub fn with_worker_binary(mut self, binary: impl Into<PathBuf>) -> Self {
        self.worker_binary = binary.into();
        self
    }

    pub fn with_worker_script(mut self, script: impl Into<PathBuf>) -> Self {
        self.worker_script = script.into();
        self
    }

    pub fn with_min_instance_count(mut self, n: usize) -> Self {
        self.min_instance_count = n;
        self
    }

    pub fn with_max_instance_count(mut self, n: usize) -> Self {
        self.max_instance_count = n;
        self
    }

    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = Some(timeout);
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn WorkerSpawner>) -> Self {
        self.spawner = spawner;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_instance_count == 0 {
            return Err(ConfigError::NoInstances);
        }
        if self.min_instance_count > self.max_instance_count {
            return Err(ConfigError::MinAboveMax {
                min: self.min_instance_count,
                max: self.max_instance_count,
            });
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&'static str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    let Some(value) = lookup(var) else {
        return Ok(None);
    };
    value
        .trim()
        .parse()
        .map(Some)
        .map_err(|_| ConfigError::InvalidEnv { var, value })
}
