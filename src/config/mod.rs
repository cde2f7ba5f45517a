//! Configuration module
//!
//! Handles loading and layering of run configuration.

mod env;
mod file;

pub use env::{print_env_help, EnvBuilder, EnvConfig, EnvGuard};
pub use file::ConfigFile;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Default seconds the process pool waits for a free slot
pub const DEFAULT_RELEASE_TIMEOUT_SECS: u64 = 180;

/// Default worker reaping poll interval in milliseconds
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 1;

/// Named concurrency strategy
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyName {
    #[serde(alias = "simple")]
    Sequential,
    #[serde(alias = "gevent")]
    Green,
    #[serde(alias = "threading")]
    Threads,
    #[serde(alias = "multiprocessing")]
    Processes,
}

impl StrategyName {
    pub fn name(&self) -> &'static str {
        match self {
            StrategyName::Sequential => "sequential",
            StrategyName::Green => "green",
            StrategyName::Threads => "threads",
            StrategyName::Processes => "processes",
        }
    }
}

impl fmt::Display for StrategyName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for StrategyName {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "sequential" | "simple" => Ok(StrategyName::Sequential),
            "green" | "gevent" => Ok(StrategyName::Green),
            "threads" | "threading" => Ok(StrategyName::Threads),
            "processes" | "multiprocessing" => Ok(StrategyName::Processes),
            other => bail!(
                "Unknown strategy: {other} (expected one of: sequential, green, threads, processes)"
            ),
        }
    }
}

/// Run configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Explicit strategy; wins over every size knob
    pub strategy: Option<StrategyName>,

    /// Worker process count (0 = unset)
    pub processes: usize,

    /// Thread pool size (0 = unset)
    pub threads: usize,

    /// Green pool size (0 = unset)
    pub green_threads: usize,

    /// Seconds the process pool waits for a free slot
    pub release_timeout_secs: u64,

    /// Worker reaping poll interval in milliseconds
    pub poll_interval_ms: u64,

    /// Stop dispatching after the first failure or error
    pub fail_fast: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            strategy: None,
            processes: 0,
            threads: 0,
            green_threads: 0,
            release_timeout_secs: DEFAULT_RELEASE_TIMEOUT_SECS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            fail_fast: false,
        }
    }
}

impl RunConfig {
    pub fn with_strategy(mut self, strategy: StrategyName) -> Self {
        self.strategy = Some(strategy);
        self
    }

    pub fn with_processes(mut self, processes: usize) -> Self {
        self.processes = processes;
        self
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    pub fn with_green_threads(mut self, green_threads: usize) -> Self {
        self.green_threads = green_threads;
        self
    }

    pub fn with_release_timeout(mut self, secs: u64) -> Self {
        self.release_timeout_secs = secs;
        self
    }

    pub fn with_fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }

    pub fn release_timeout(&self) -> Duration {
        Duration::from_secs(self.release_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.release_timeout_secs == 0 {
            bail!("release_timeout_secs must be greater than zero");
        }
        if self.poll_interval_ms == 0 {
            bail!("poll_interval_ms must be greater than zero");
        }
        if self.poll_interval() >= self.release_timeout() {
            bail!(
                "poll_interval_ms ({}) must be shorter than the release timeout ({}s)",
                self.poll_interval_ms,
                self.release_timeout_secs
            );
        }
        Ok(())
    }

    /// Apply environment overrides on top of this configuration
    pub fn merge_env(mut self, env: &EnvConfig) -> Result<Self> {
        if let Some(strategy) = &env.strategy {
            self.strategy = Some(strategy.parse()?);
        }
        if let Some(processes) = env.processes {
            self.processes = processes;
        }
        if let Some(threads) = env.threads {
            self.threads = threads;
        }
        if let Some(green_threads) = env.green_threads {
            self.green_threads = green_threads;
        }
        if let Some(secs) = env.release_timeout {
            self.release_timeout_secs = secs;
        }
        if let Some(ms) = env.poll_interval_ms {
            self.poll_interval_ms = ms;
        }
        if let Some(fail_fast) = env.fail_fast {
            self.fail_fast = fail_fast;
        }
        Ok(self)
    }

    /// Resolve the effective configuration: defaults < file < environment.
    ///
    /// `explicit` names a config file to use instead of the standard locations.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let env = EnvConfig::load();
        let path = explicit
            .map(Path::to_path_buf)
            .or_else(|| env.config_file.as_ref().map(Into::into))
            .or_else(ConfigFile::find);

        let base = match path {
            Some(path) => ConfigFile::load(&path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?
                .run,
            None => RunConfig::default(),
        };

        let config = base.merge_env(&env)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content =
            std::fs::read_to_string(path.as_ref()).context("Failed to read config file")?;

        let config: Self = if is_yaml(path.as_ref()) {
            serde_yaml::from_str(&content).context("Failed to parse YAML config")?
        } else {
            serde_json::from_str(&content).context("Failed to parse JSON config")?
        };

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = if is_yaml(path.as_ref()) {
            serde_yaml::to_string(self).context("Failed to serialize config")?
        } else {
            serde_json::to_string_pretty(self).context("Failed to serialize config")?
        };

        std::fs::write(path, content).context("Failed to write config file")?;
        Ok(())
    }
}

pub(crate) fn is_yaml(path: &Path) -> bool {
    path.extension()
        .map(|e| e == "yaml" || e == "yml")
        .unwrap_or(false)
}
