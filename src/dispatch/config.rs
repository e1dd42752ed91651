//! Engine configuration

use crate::core::class::DEFAULT_SIZE_THRESHOLD;
use crate::core::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Command;
use std::time::Duration;

/// Prefix of the environment variables read by [`EngineConfig::with_env_overrides`]
pub const ENV_PREFIX: &str = "DOCDISPATCH_";

/// Default light pool queue depth
pub const DEFAULT_LIGHT_QUEUE_DEPTH: usize = 256;
/// Default heavy pool queue depth
pub const DEFAULT_HEAVY_QUEUE_DEPTH: usize = 16;
/// Default per-request timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// How a heavy pool execution unit is launched
///
/// The program must speak the worker protocol on stdin/stdout, as the
/// `docdispatch-worker` binary built with the `cli` feature does.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerCommand {
    /// Executable path or name looked up in `PATH`
    pub program: String,
    /// Command line arguments
    pub args: Vec<String>,
    /// Extra environment variables
    pub env: BTreeMap<String, String>,
}

impl Default for WorkerCommand {
    fn default() -> Self {
        Self::new("docdispatch-worker")
    }
}

impl WorkerCommand {
    /// Launch `program` with no arguments
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    /// Append one argument
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set an environment variable for the worker
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub(crate) fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.args).envs(&self.env);
        command
    }
}

/// Configuration of a [`DispatchEngine`](crate::DispatchEngine)
///
/// Durations are (de)serialized as milliseconds; missing fields take their
/// defaults.
///
/// # Example
///
/// ```rust
/// use docdispatch::EngineConfig;
/// use std::time::Duration;
///
/// let config = EngineConfig::default()
///     .with_light_workers(8)
///     .with_heavy_workers(2)
///     .with_default_timeout(Duration::from_secs(30));
/// assert!(config.validate().is_ok());
/// ```
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Payloads of at least this many bytes go to the heavy pool
    pub size_threshold: u64,
    /// Light pool concurrency (threads)
    pub light_workers: usize,
    /// Heavy pool concurrency (worker processes)
    pub heavy_workers: usize,
    /// Light pool admission queue depth
    pub light_queue_depth: usize,
    /// Heavy pool admission queue depth
    pub heavy_queue_depth: usize,
    /// Timeout used when a dispatch call gives none
    #[serde(rename = "default_timeout_ms", with = "crate::core::millis")]
    pub default_timeout: Duration,
    /// How often idle workers re-check their queue
    #[serde(rename = "poll_interval_ms", with = "crate::core::millis")]
    pub poll_interval: Duration,
    /// How long shutdown waits for in-flight jobs before cancelling them
    #[serde(rename = "shutdown_grace_ms", with = "crate::core::millis")]
    pub shutdown_grace: Duration,
    /// Heavy unit launch command
    pub worker_command: WorkerCommand,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let cpus = num_cpus::get();
        Self {
            size_threshold: DEFAULT_SIZE_THRESHOLD,
            light_workers: (cpus + 4).min(32),
            heavy_workers: cpus.clamp(1, 4),
            light_queue_depth: DEFAULT_LIGHT_QUEUE_DEPTH,
            heavy_queue_depth: DEFAULT_HEAVY_QUEUE_DEPTH,
            default_timeout: DEFAULT_TIMEOUT,
            poll_interval: Duration::from_millis(100),
            shutdown_grace: Duration::from_secs(30),
            worker_command: WorkerCommand::default(),
        }
    }
}

impl EngineConfig {
    /// Parse a JSON configuration
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::ConfigParse`] on malformed JSON and
    /// [`EngineError::InvalidConfig`] when the values do not validate.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|source| EngineError::ConfigParse { source })?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a JSON configuration file
    ///
    /// # Errors
    ///
    /// Same as [`from_json_str`](Self::from_json_str), plus IO errors.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Set the light/heavy size threshold in bytes
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_size_threshold(mut self, bytes: u64) -> Self {
        self.size_threshold = bytes;
        self
    }

    /// Set the number of light pool threads
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_light_workers(mut self, workers: usize) -> Self {
        self.light_workers = workers;
        self
    }

    /// Set the number of heavy pool worker processes
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_heavy_workers(mut self, workers: usize) -> Self {
        self.heavy_workers = workers;
        self
    }

    /// Set the light pool queue depth
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_light_queue_depth(mut self, depth: usize) -> Self {
        self.light_queue_depth = depth;
        self
    }

    /// Set the heavy pool queue depth
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_heavy_queue_depth(mut self, depth: usize) -> Self {
        self.heavy_queue_depth = depth;
        self
    }

    /// Set the default per-request timeout
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Set the worker poll interval
    ///
    /// Shorter intervals make idle workers notice shutdown sooner at the cost
    /// of more wakeups.
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the heavy unit launch command
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_worker_command(mut self, command: WorkerCommand) -> Self {
        self.worker_command = command;
        self
    }

    /// Set the shutdown drain grace period
    #[must_use = "builder methods return a new value and do not modify the original"]
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Apply `DOCDISPATCH_*` environment variables on top of this config
    ///
    /// Recognized: `SIZE_THRESHOLD`, `LIGHT_WORKERS`, `HEAVY_WORKERS`,
    /// `LIGHT_QUEUE_DEPTH`, `HEAVY_QUEUE_DEPTH`, `TIMEOUT_MS`,
    /// `POLL_INTERVAL_MS`, `SHUTDOWN_GRACE_MS` and `WORKER_PROGRAM`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidConfig`] if a variable does not parse.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides looked up by full variable name
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidConfig`] if a value does not parse.
    pub fn with_overrides_from<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(v) = get("SIZE_THRESHOLD") {
            self.size_threshold = parse_number("SIZE_THRESHOLD", &v)?;
        }
        if let Some(v) = get("LIGHT_WORKERS") {
            self.light_workers = parse_number("LIGHT_WORKERS", &v)?;
        }
        if let Some(v) = get("HEAVY_WORKERS") {
            self.heavy_workers = parse_number("HEAVY_WORKERS", &v)?;
        }
        if let Some(v) = get("LIGHT_QUEUE_DEPTH") {
            self.light_queue_depth = parse_number("LIGHT_QUEUE_DEPTH", &v)?;
        }
        if let Some(v) = get("HEAVY_QUEUE_DEPTH") {
            self.heavy_queue_depth = parse_number("HEAVY_QUEUE_DEPTH", &v)?;
        }
        if let Some(v) = get("TIMEOUT_MS") {
            self.default_timeout = Duration::from_millis(parse_number("TIMEOUT_MS", &v)?);
        }
        if let Some(v) = get("POLL_INTERVAL_MS") {
            self.poll_interval = Duration::from_millis(parse_number("POLL_INTERVAL_MS", &v)?);
        }
        if let Some(v) = get("SHUTDOWN_GRACE_MS") {
            self.shutdown_grace = Duration::from_millis(parse_number("SHUTDOWN_GRACE_MS", &v)?);
        }
        if let Some(v) = get("WORKER_PROGRAM") {
            self.worker_command.program = v;
        }
        Ok(self)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidConfig`] naming the first bad parameter.
    pub fn validate(&self) -> Result<()> {
        if self.light_workers == 0 {
            return Err(EngineError::invalid_config(
                "light_workers",
                "Number of light workers must be greater than 0",
            ));
        }
        if self.heavy_workers == 0 {
            return Err(EngineError::invalid_config(
                "heavy_workers",
                "Number of heavy workers must be greater than 0",
            ));
        }
        if self.default_timeout.is_zero() {
            return Err(EngineError::invalid_config(
                "default_timeout",
                "Default timeout must be non-zero",
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(EngineError::invalid_config(
                "poll_interval",
                "Poll interval must be non-zero",
            ));
        }
        if self.worker_command.program.trim().is_empty() {
            return Err(EngineError::invalid_config(
                "worker_command",
                "Worker program must not be empty",
            ));
        }
        Ok(())
    }
}

fn parse_number<T: std::str::FromStr>(name: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e| {
        EngineError::invalid_config(format!("{ENV_PREFIX}{name}"), format!("'{value}': {e}"))
    })
}
