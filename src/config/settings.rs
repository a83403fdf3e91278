//! Engine settings.
//!
//! Settings are deserialised from YAML. Every field has a default, so an
//! empty document yields a working configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::planner::{ExecutorConfig, DEFAULT_MAX_CONCURRENCY, DEFAULT_OPERATION_TIMEOUT_SECS};

/// Top-level engine settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Executor settings.
    pub executor: ExecutorSettings,
    /// Drift detection settings.
    pub drift: DriftSettings,
    /// Event delivery settings.
    pub events: EventSettings,
    /// Logging settings.
    pub logging: LoggingSettings,
}

/// Executor settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorSettings {
    /// Maximum concurrent operations.
    pub max_concurrency: usize,
    /// Per-operation timeout in seconds.
    pub operation_timeout_secs: u64,
    /// Unwind applied changes after a failure.
    pub rollback_enabled: bool,
}

/// Drift detection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriftSettings {
    /// Seconds between periodic checks.
    pub interval_secs: u64,
}

/// Event delivery settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventSettings {
    /// Capacity of the event channel.
    pub buffer: usize,
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default filter directive, overridden by `RUST_LOG`.
    pub level: String,
    /// Output format.
    pub format: LogFormat,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            operation_timeout_secs: DEFAULT_OPERATION_TIMEOUT_SECS,
            rollback_enabled: true,
        }
    }
}

impl Default for DriftSettings {
    fn default() -> Self {
        Self { interval_secs: 300 }
    }
}

impl Default for EventSettings {
    fn default() -> Self {
        Self { buffer: 256 }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: String::from("info"),
            format: LogFormat::Text,
        }
    }
}

impl ExecutorSettings {
    /// Converts to the executor's runtime configuration.
    #[must_use]
    pub const fn to_executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            max_concurrency: self.max_concurrency,
            operation_timeout: Duration::from_secs(self.operation_timeout_secs),
            rollback_enabled: self.rollback_enabled,
        }
    }
}

impl DriftSettings {
    /// Interval between periodic checks.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl std::str::FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format '{other}'")),
        }
    }
}
