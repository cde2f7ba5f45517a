//! Environment variable configuration
//!
//! Provides environment variable overrides for configuration.

use std::env;

/// Environment variable prefix
const ENV_PREFIX: &str = "SUITE_POOL";

/// Environment configuration from environment variables
#[derive(Clone, Debug, Default)]
pub struct EnvConfig {
    /// Strategy from SUITE_POOL_STRATEGY
    pub strategy: Option<String>,
    /// Worker processes from SUITE_POOL_PROCESSES
    pub processes: Option<usize>,
    /// Thread pool size from SUITE_POOL_THREADS
    pub threads: Option<usize>,
    /// Green pool size from SUITE_POOL_GREEN_THREADS
    pub green_threads: Option<usize>,
    /// Release timeout seconds from SUITE_POOL_RELEASE_TIMEOUT
    pub release_timeout: Option<u64>,
    /// Reaping poll interval from SUITE_POOL_POLL_INTERVAL_MS
    pub poll_interval_ms: Option<u64>,
    /// Fail-fast from SUITE_POOL_FAIL_FAST
    pub fail_fast: Option<bool>,
    /// Config file from SUITE_POOL_CONFIG
    pub config_file: Option<String>,
    /// Log level from SUITE_POOL_LOG
    pub log: Option<String>,
}

impl EnvConfig {
    /// Load configuration from environment variables
    pub fn load() -> Self {
        Self {
            strategy: get_env("STRATEGY"),
            processes: get_env_parse("PROCESSES"),
            threads: get_env_parse("THREADS"),
            green_threads: get_env_parse("GREEN_THREADS"),
            release_timeout: get_env_parse("RELEASE_TIMEOUT"),
            poll_interval_ms: get_env_parse("POLL_INTERVAL_MS"),
            fail_fast: get_env_bool("FAIL_FAST"),
            config_file: get_env("CONFIG"),
            log: get_env("LOG"),
        }
    }

    /// Print current environment configuration
    pub fn print_summary(&self) {
        println!("Environment Configuration:");
        println!("  {}_STRATEGY:         {:?}", ENV_PREFIX, self.strategy);
        println!("  {}_PROCESSES:        {:?}", ENV_PREFIX, self.processes);
        println!("  {}_THREADS:          {:?}", ENV_PREFIX, self.threads);
        println!("  {}_GREEN_THREADS:    {:?}", ENV_PREFIX, self.green_threads);
        println!("  {}_RELEASE_TIMEOUT:  {:?}", ENV_PREFIX, self.release_timeout);
        println!("  {}_POLL_INTERVAL_MS: {:?}", ENV_PREFIX, self.poll_interval_ms);
        println!("  {}_FAIL_FAST:        {:?}", ENV_PREFIX, self.fail_fast);
        println!("  {}_CONFIG:           {:?}", ENV_PREFIX, self.config_file);
        println!("  {}_LOG:              {:?}", ENV_PREFIX, self.log);
    }
}

/// Get environment variable with prefix
fn get_env(name: &str) -> Option<String> {
    env::var(format!("{ENV_PREFIX}_{name}")).ok()
}

/// Get environment variable and parse to type
fn get_env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    get_env(name).and_then(|v| v.parse().ok())
}

/// Get environment variable as boolean
fn get_env_bool(name: &str) -> Option<bool> {
    get_env(name).map(|v| {
        matches!(
            v.to_lowercase().as_str(),
            "1" | "true" | "yes" | "on" | "enabled"
        )
    })
}

/// Builder for setting environment variables (useful for testing)
pub struct EnvBuilder {
    vars: Vec<(String, String)>,
}

impl EnvBuilder {
    pub fn new() -> Self {
        Self { vars: Vec::new() }
    }

    fn var(mut self, name: &str, value: impl ToString) -> Self {
        self.vars.push((format!("{ENV_PREFIX}_{name}"), value.to_string()));
        self
    }

    pub fn strategy(self, strategy: impl Into<String>) -> Self {
        self.var("STRATEGY", strategy.into())
    }

    pub fn processes(self, processes: usize) -> Self {
        self.var("PROCESSES", processes)
    }

    pub fn threads(self, threads: usize) -> Self {
        self.var("THREADS", threads)
    }

    pub fn green_threads(self, green_threads: usize) -> Self {
        self.var("GREEN_THREADS", green_threads)
    }

    pub fn release_timeout(self, secs: u64) -> Self {
        self.var("RELEASE_TIMEOUT", secs)
    }

    pub fn fail_fast(self, fail_fast: bool) -> Self {
        self.var("FAIL_FAST", fail_fast)
    }

    /// Apply environment variables
    pub fn apply(self) {
        for (key, value) in self.vars {
            env::set_var(key, value);
        }
    }

    /// Apply and return guard that restores on drop
    pub fn apply_scoped(self) -> EnvGuard {
        let previous: Vec<_> = self
            .vars
            .iter()
            .map(|(k, _)| (k.clone(), env::var(k).ok()))
            .collect();

        self.apply();

        EnvGuard { previous }
    }
}

impl Default for EnvBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard that restores environment variables on drop
pub struct EnvGuard {
    previous: Vec<(String, Option<String>)>,
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, value) in &self.previous {
            match value {
                Some(v) => env::set_var(key, v),
                None => env::remove_var(key),
            }
        }
    }
}

/// Print all SUITE_POOL environment variables
pub fn print_env_help() {
    println!("Environment Variables:");
    println!();
    println!("  {ENV_PREFIX}_STRATEGY          sequential, green, threads or processes");
    println!("  {ENV_PREFIX}_PROCESSES         Worker process count");
    println!("  {ENV_PREFIX}_THREADS           Thread pool size");
    println!("  {ENV_PREFIX}_GREEN_THREADS     Green pool size");
    println!("  {ENV_PREFIX}_RELEASE_TIMEOUT   Seconds to wait for a free worker slot");
    println!("  {ENV_PREFIX}_POLL_INTERVAL_MS  Worker reaping poll interval");
    println!("  {ENV_PREFIX}_FAIL_FAST         Stop after the first failure (true/false)");
    println!("  {ENV_PREFIX}_CONFIG            Path to configuration file");
    println!("  {ENV_PREFIX}_LOG               Log level (trace, debug, info, warn, error)");
    println!();
    println!("Example:");
    println!("  export {ENV_PREFIX}_STRATEGY=processes");
    println!("  export {ENV_PREFIX}_PROCESSES=4");
    println!("  suite-pool run --suites 8");
}
