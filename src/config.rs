//! Configuration for the autodetect communication layer using Figment
//!
//! Configuration is loaded from:
//! 1. a TOML file (base configuration)
//! 2. Environment variables (prefixed with AUTODETECT_, nested keys split on `__`)
//!
//! # Example
//! ```no_run
//! use autodetect_comm::config::AutodetectConfig;
//!
//! let config = AutodetectConfig::load_from("config/autodetect.toml")?;
//! println!("Native binary: {}", config.process.executable.display());
//! # Ok::<(), autodetect_comm::error::AutodetectError>(())
//! ```

use crate::error::{AppResult, AutodetectError};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AutodetectConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Native process settings
    #[serde(default)]
    pub process: ProcessConfig,
    /// Flush acknowledgement settings
    #[serde(default)]
    pub flush: FlushConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// How the native autodetect binary is launched and shut down
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// Path to the autodetect executable
    #[serde(default = "default_executable")]
    pub executable: PathBuf,
    /// Arguments appended after the job-derived ones
    #[serde(default)]
    pub extra_args: Vec<String>,
    /// Upper bound on anomaly records the process emits per bucket
    #[serde(default = "default_max_anomaly_records")]
    pub max_anomaly_records: u32,
    /// Model state persistence interval in seconds
    #[serde(default)]
    pub persist_interval_secs: Option<u64>,
    /// Maximum interval between quantile outputs in seconds
    #[serde(default)]
    pub max_quantile_interval_secs: Option<u64>,
    /// Skip the empty buckets between the last and the next data point
    #[serde(default)]
    pub ignore_downtime: bool,
    /// How long close waits for the process to exit before killing it
    #[serde(default = "default_close_timeout")]
    pub close_timeout_ms: u64,
    /// Number of stderr lines kept for error reports
    #[serde(default = "default_error_buffer_lines")]
    pub error_buffer_lines: usize,
}

/// Flush acknowledgement wait settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlushConfig {
    /// Liveness re-check interval while waiting for an acknowledgement
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    /// Total time to wait for an acknowledgement
    #[serde(default = "default_flush_timeout")]
    pub timeout_ms: u64,
    /// Size of the blank message written after each flush (0 = none)
    #[serde(default = "default_padding_bytes")]
    pub padding_bytes: usize,
}

// Default value functions
fn default_name() -> String {
    "autodetect-comm".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_executable() -> PathBuf {
    PathBuf::from("autodetect")
}

fn default_max_anomaly_records() -> u32 {
    500
}

fn default_close_timeout() -> u64 {
    10_000
}

fn default_error_buffer_lines() -> usize {
    32
}

fn default_poll_interval() -> u64 {
    1_000
}

fn default_flush_timeout() -> u64 {
    30 * 60 * 1_000
}

fn default_padding_bytes() -> usize {
    8_192
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
        }
    }
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            executable: default_executable(),
            extra_args: Vec::new(),
            max_anomaly_records: default_max_anomaly_records(),
            persist_interval_secs: None,
            max_quantile_interval_secs: None,
            ignore_downtime: false,
            close_timeout_ms: default_close_timeout(),
            error_buffer_lines: default_error_buffer_lines(),
        }
    }
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval(),
            timeout_ms: default_flush_timeout(),
            padding_bytes: default_padding_bytes(),
        }
    }
}

impl ProcessConfig {
    /// Close timeout as a [`Duration`]
    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }
}

impl FlushConfig {
    /// The per-call flush options these settings imply
    pub fn options(&self) -> FlushOptions {
        FlushOptions {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            timeout: Duration::from_millis(self.timeout_ms),
        }
    }
}

/// Poll interval and timeout for one flush call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushOptions {
    /// How often the waiter wakes to re-check process liveness
    pub poll_interval: Duration,
    /// Total time allowed for the acknowledgement
    pub timeout: Duration,
}

impl FlushOptions {
    /// Options with an explicit poll interval and timeout in milliseconds.
    pub fn from_millis(poll_interval_ms: u64, timeout_ms: u64) -> Self {
        Self {
            poll_interval: Duration::from_millis(poll_interval_ms),
            timeout: Duration::from_millis(timeout_ms),
        }
    }
}

impl Default for FlushOptions {
    fn default() -> Self {
        FlushConfig::default().options()
    }
}

impl AutodetectConfig {
    /// Load configuration from a specific file path
    ///
    /// Missing keys fall back to defaults. Environment variables can override
    /// values with prefix AUTODETECT_, for example
    /// `AUTODETECT_FLUSH__TIMEOUT_MS=60000`.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config: Self = Figment::from(Serialized::defaults(AutodetectConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("AUTODETECT_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(AutodetectError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.flush.poll_interval_ms == 0 {
            return Err(AutodetectError::Configuration(
                "flush.poll_interval_ms must be greater than 0".to_string(),
            ));
        }

        if self.flush.timeout_ms == 0 {
            return Err(AutodetectError::Configuration(
                "flush.timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.flush.poll_interval_ms > self.flush.timeout_ms {
            return Err(AutodetectError::Configuration(format!(
                "flush.poll_interval_ms ({}) exceeds flush.timeout_ms ({})",
                self.flush.poll_interval_ms, self.flush.timeout_ms
            )));
        }

        if self.process.error_buffer_lines == 0 {
            return Err(AutodetectError::Configuration(
                "process.error_buffer_lines must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}
