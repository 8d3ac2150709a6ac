// SPDX-License-Identifier: Apache-2.0

//! Configuration model for the FinchDB network front-end.
//!
//! A YAML document deserialized with serde; every field has a default so
//! an empty document is a valid configuration. Durations use humantime
//! syntax (`"250ms"`, `"50us"`, `"1s"`).

pub mod error;

pub use error::Error;

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Network front-end settings.
    #[serde(default)]
    pub net: NetConfig,

    /// Service executor settings.
    #[serde(default)]
    pub executor: ExecutorConfig,

    /// Admin HTTP endpoint settings.
    #[serde(default)]
    pub admin: AdminConfig,
}

/// Network settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetConfig {
    /// Address the ingress listener binds.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Maximum simultaneously open connections; accepts beyond the cap
    /// are dropped.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Wire compression settings.
    #[serde(default)]
    pub compression: CompressionConfig,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            max_connections: default_max_connections(),
            compression: CompressionConfig::default(),
        }
    }
}

/// Wire compression settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CompressionConfig {
    /// Comma-separated list of compressors to offer, or `disabled`.
    #[serde(default = "default_compressors")]
    pub compressors: String,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            compressors: default_compressors(),
        }
    }
}

impl CompressionConfig {
    /// The configured compressor names, in preference order. Empty when
    /// compression is disabled.
    #[must_use]
    pub fn compressor_names(&self) -> Vec<String> {
        if self.compressors.trim() == "disabled" {
            return Vec::new();
        }
        self.compressors
            .split([',', ' '])
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// Which executor drives per-connection work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorMode {
    /// One thread per connection, blocking I/O.
    Synchronous,
    /// The elastic reactor-driven pool.
    Adaptive,
}

/// Service executor settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExecutorConfig {
    /// Which executor variant to run.
    #[serde(default = "default_executor_mode")]
    pub mode: ExecutorMode,

    /// Tunables for the synchronous executor.
    #[serde(default)]
    pub synchronous: SynchronousConfig,

    /// Tunables for the adaptive executor.
    #[serde(default)]
    pub adaptive: AdaptiveConfig,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            mode: default_executor_mode(),
            synchronous: SynchronousConfig::default(),
            adaptive: AdaptiveConfig::default(),
        }
    }
}

/// Synchronous executor tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SynchronousConfig {
    /// Inline recursion bound for `MAY_RECURSE` submissions.
    #[serde(default = "default_recursion_limit")]
    pub recursion_limit: usize,
}

impl Default for SynchronousConfig {
    fn default() -> Self {
        Self {
            recursion_limit: default_recursion_limit(),
        }
    }
}

/// Adaptive executor tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdaptiveConfig {
    /// Minimum live workers; 0 means one per available CPU.
    #[serde(default)]
    pub reserved_threads: usize,

    /// Worker run window before the exit policy is evaluated.
    #[serde(default = "default_worker_run_time", with = "humantime_serde")]
    pub worker_run_time: Duration,

    /// Run-window jitter as a percentage of `worker_run_time`.
    #[serde(default = "default_run_time_jitter_pct")]
    pub run_time_jitter_pct: u32,

    /// Controller poll period for forward-progress checks.
    #[serde(default = "default_stuck_thread_timeout", with = "humantime_serde")]
    pub stuck_thread_timeout: Duration,

    /// Queue wait beyond which tasks count as starved.
    #[serde(default = "default_max_queue_latency", with = "humantime_serde")]
    pub max_queue_latency: Duration,

    /// Workers executing below this percentage of a run window exit.
    #[serde(default = "default_idle_pct_threshold")]
    pub idle_pct_threshold: u32,

    /// Inline recursion bound for `MAY_RECURSE` submissions.
    #[serde(default = "default_recursion_limit")]
    pub recursion_limit: usize,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            reserved_threads: 0,
            worker_run_time: default_worker_run_time(),
            run_time_jitter_pct: default_run_time_jitter_pct(),
            stuck_thread_timeout: default_stuck_thread_timeout(),
            max_queue_latency: default_max_queue_latency(),
            idle_pct_threshold: default_idle_pct_threshold(),
            recursion_limit: default_recursion_limit(),
        }
    }
}

impl AdaptiveConfig {
    /// The effective reserve: the configured value, or one worker per
    /// available CPU when left at 0.
    #[must_use]
    pub fn effective_reserved_threads(&self) -> usize {
        if self.reserved_threads == 0 {
            num_cpus::get()
        } else {
            self.reserved_threads
        }
    }
}

/// Admin HTTP endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdminConfig {
    /// Whether the admin endpoint is served at all.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Address the admin endpoint binds.
    #[serde(default = "default_admin_bind_address")]
    pub bind_address: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind_address: default_admin_bind_address(),
        }
    }
}

fn default_bind_address() -> String {
    "127.0.0.1:27017".to_string()
}

fn default_admin_bind_address() -> String {
    "127.0.0.1:28017".to_string()
}

fn default_max_connections() -> usize {
    65_536
}

fn default_compressors() -> String {
    "snappy".to_string()
}

fn default_executor_mode() -> ExecutorMode {
    ExecutorMode::Adaptive
}

fn default_recursion_limit() -> usize {
    8
}

fn default_worker_run_time() -> Duration {
    Duration::from_secs(1)
}

fn default_run_time_jitter_pct() -> u32 {
    20
}

fn default_stuck_thread_timeout() -> Duration {
    Duration::from_millis(250)
}

fn default_max_queue_latency() -> Duration {
    Duration::from_micros(50)
}

fn default_idle_pct_threshold() -> u32 {
    60
}

fn default_true() -> bool {
    true
}

impl ServerConfig {
    /// Parses a YAML document and validates it.
    pub fn from_yaml(document: &str) -> Result<Self, Error> {
        let config: Self = serde_yaml::from_str(document)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads and parses a YAML config file.
    pub fn from_file(path: &Path) -> Result<Self, Error> {
        let document = std::fs::read_to_string(path).map_err(|source| Error::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&document)
    }

    /// Checks cross-field and range constraints.
    pub fn validate(&self) -> Result<(), Error> {
        if self.net.bind_address.parse::<SocketAddr>().is_err() {
            return Err(Error::Invalid {
                field: "net.bind_address",
                reason: format!("`{}` is not a socket address", self.net.bind_address),
            });
        }
        if self.admin.enabled && self.admin.bind_address.parse::<SocketAddr>().is_err() {
            return Err(Error::Invalid {
                field: "admin.bind_address",
                reason: format!("`{}` is not a socket address", self.admin.bind_address),
            });
        }
        if self.net.max_connections == 0 {
            return Err(Error::Invalid {
                field: "net.max_connections",
                reason: "must admit at least one connection".to_string(),
            });
        }
        if self.executor.adaptive.worker_run_time.is_zero() {
            return Err(Error::Invalid {
                field: "executor.adaptive.worker_run_time",
                reason: "must be positive".to_string(),
            });
        }
        if self.executor.adaptive.run_time_jitter_pct > 100 {
            return Err(Error::Invalid {
                field: "executor.adaptive.run_time_jitter_pct",
                reason: "is a percentage of the run time; at most 100".to_string(),
            });
        }
        if self.executor.adaptive.idle_pct_threshold > 100 {
            return Err(Error::Invalid {
                field: "executor.adaptive.idle_pct_threshold",
                reason: "is a percentage; at most 100".to_string(),
            });
        }
        if self.executor.adaptive.stuck_thread_timeout.is_zero() {
            return Err(Error::Invalid {
                field: "executor.adaptive.stuck_thread_timeout",
                reason: "must be positive".to_string(),
            });
        }
        Ok(())
    }
}
