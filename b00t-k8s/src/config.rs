//! Adapter configuration
//!
//! Loaded with confy from `b00t/k8s.toml` in the user config directory, or
//! from an explicit path. Every default lives here; nothing is read from
//! process-wide mutable state.

use crate::gateway::kubernetes::{ConnectOptions, expand_kubeconfig};
use crate::poller::ReadinessPoller;
use crate::workload::{DEFAULT_NAME_PREFIX, WorkloadDefaults, is_dns_label};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu, ensure};
use std::path::{Path, PathBuf};
use std::time::Duration;

const APP_NAME: &str = "b00t";
const CONFIG_NAME: &str = "k8s";

/// Upper bound on the pause between readiness polls
pub const MAX_POLL_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Snafu)]
pub enum ConfigError {
    #[snafu(display("failed to load configuration"))]
    Load { source: confy::ConfyError },

    #[snafu(display("invalid configuration: {reason}"))]
    Invalid { reason: String },
}

/// Readiness gate timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReadinessConfig {
    pub poll_interval_ms: u64,
    pub timeout_secs: u64,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2_000,
            timeout_secs: 120,
        }
    }
}

impl ReadinessConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn poller(&self) -> ReadinessPoller {
        ReadinessPoller::new(self.poll_interval(), self.timeout())
    }
}

/// Backoff around provisioning calls that fail with `ClusterUnavailable`.
/// Teardown and control calls are never retried.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Calls made per provisioning step, the first included; 1 means no retry
    pub max_attempts: u32,
    /// Pause after the first failed call
    pub initial_delay_ms: u64,
    /// Ceiling for any single pause
    pub max_delay_ms: u64,
    pub backoff_factor: f32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            max_attempts: 5,
            initial_delay_ms: 500,
            max_delay_ms: 10_000,
            backoff_factor: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `retry` (1-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry.saturating_sub(1)).unwrap_or(i32::MAX);
        let scaled = self.initial_delay_ms as f64 * f64::from(self.backoff_factor).powi(exponent);
        let capped = scaled.min(self.max_delay_ms as f64);
        Duration::from_millis(capped as u64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    pub namespace: String,
    /// Prepended to workload names to form resource names
    pub name_prefix: String,
    pub kubeconfig: Option<PathBuf>,
    pub context: Option<String>,
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub readiness: ReadinessConfig,
    pub retry: RetryConfig,
    pub defaults: WorkloadDefaults,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            name_prefix: DEFAULT_NAME_PREFIX.to_string(),
            kubeconfig: None,
            context: None,
            connect_timeout_secs: 5,
            read_timeout_secs: 30,
            readiness: ReadinessConfig::default(),
            retry: RetryConfig::default(),
            defaults: WorkloadDefaults::default(),
        }
    }
}

impl AdapterConfig {
    /// Load from `path`, or from the user config directory when `None`.
    /// confy writes the defaults out when the file does not exist yet.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config: Self = match path {
            Some(path) => confy::load_path(path).context(LoadSnafu)?,
            None => confy::load(APP_NAME, CONFIG_NAME).context(LoadSnafu)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Where the default configuration file lives
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        confy::get_configuration_file_path(APP_NAME, CONFIG_NAME).context(LoadSnafu)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        ensure!(
            is_dns_label(&self.namespace),
            InvalidSnafu {
                reason: format!("namespace '{}' is not a valid DNS-1123 label", self.namespace)
            }
        );
        ensure!(
            self.name_prefix.is_empty() || is_dns_label(&self.name_prefix),
            InvalidSnafu {
                reason: format!("name_prefix '{}' is not a valid DNS-1123 label", self.name_prefix)
            }
        );
        let interval = self.readiness.poll_interval();
        ensure!(
            !interval.is_zero(),
            InvalidSnafu {
                reason: "readiness.poll_interval_ms must be positive"
            }
        );
        ensure!(
            interval <= MAX_POLL_INTERVAL,
            InvalidSnafu {
                reason: format!(
                    "readiness.poll_interval_ms must not exceed {}",
                    MAX_POLL_INTERVAL.as_millis()
                )
            }
        );
        ensure!(
            interval <= self.readiness.timeout(),
            InvalidSnafu {
                reason: "readiness.poll_interval_ms is longer than readiness.timeout_secs"
            }
        );
        ensure!(
            self.retry.max_attempts >= 1,
            InvalidSnafu {
                reason: "retry.max_attempts must be at least 1"
            }
        );
        ensure!(
            self.retry.backoff_factor >= 1.0,
            InvalidSnafu {
                reason: "retry.backoff_factor must be at least 1.0"
            }
        );
        Ok(())
    }

    pub fn connect_options(&self) -> ConnectOptions {
        ConnectOptions {
            kubeconfig: self.kubeconfig.as_deref().map(expand_kubeconfig),
            context: self.context.clone(),
            connect_timeout: Some(Duration::from_secs(self.connect_timeout_secs)),
            read_timeout: Some(Duration::from_secs(self.read_timeout_secs)),
        }
    }
}
