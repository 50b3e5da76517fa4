//! Configuration schema definitions for testgrid.
//!
//! Every section and every field has a default, so an empty file is a valid
//! configuration.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── QueueConfig        - Capacity, queue timeout, sweep and retention
//! ├── PoolConfig         - Worker bounds and idle reclamation
//! ├── AutoScalerConfig   - Scaling thresholds and steps
//! ├── ExecutionConfig    - Whole-test retry delay, screenshot directory
//! └── StoreConfig        - Tagged enum selecting the store
//!     ├── Memory         - In-process maps
//!     └── File           - JSON files under a directory
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration structure for testgrid.
///
/// # TOML Structure
///
/// ```toml
/// [queue]
/// max_size = 100
/// timeout_secs = 1800
///
/// [pool]
/// min_workers = 3
/// max_workers = 10
///
/// [autoscaler]
/// enabled = true
/// check_interval_ms = 10000
///
/// [store]
/// type = "file"
/// dir = "~/.testgrid"
/// ```
///
/// # Example
///
/// ```
/// use testgrid::config::Config;
///
/// let config: Config = toml::from_str(r#"
///     [pool]
///     max_workers = 4
/// "#).unwrap();
/// assert_eq!(config.pool.max_workers, 4);
/// assert_eq!(config.queue.max_size, 100);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub autoscaler: AutoScalerConfig,

    #[serde(default)]
    pub execution: ExecutionConfig,

    #[serde(default)]
    pub store: StoreConfig,
}

/// Work queue settings.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `max_size` | 100 |
/// | `timeout_secs` | 1800 (30 minutes) |
/// | `sweep_interval_secs` | 60 |
/// | `retention_secs` | 300 (5 minutes) |
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct QueueConfig {
    /// Maximum number of queued tests. Submissions beyond this are rejected.
    #[serde(default = "default_queue_max_size")]
    pub max_size: usize,

    /// How long a test may wait in the queue before it times out.
    #[serde(default = "default_queue_timeout")]
    pub timeout_secs: u64,

    /// How often the timeout and retention sweep runs.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// How long finished tests stay queryable in memory.
    #[serde(default = "default_retention")]
    pub retention_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: default_queue_max_size(),
            timeout_secs: default_queue_timeout(),
            sweep_interval_secs: default_sweep_interval(),
            retention_secs: default_retention(),
        }
    }
}

impl QueueConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

fn default_queue_max_size() -> usize {
    100
}

fn default_queue_timeout() -> u64 {
    1800 // 30 minutes
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_retention() -> u64 {
    300
}

/// Worker pool settings.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `min_workers` | 3 |
/// | `max_workers` | 10 |
/// | `idle_timeout_secs` | 300 (5 minutes) |
/// | `reclaim_interval_secs` | 60 |
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PoolConfig {
    /// Workers created at startup; reclamation never goes below this.
    #[serde(default = "default_min_workers")]
    pub min_workers: usize,

    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Idle time after which a worker above the minimum may be removed.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    #[serde(default = "default_reclaim_interval")]
    pub reclaim_interval_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_workers: default_min_workers(),
            max_workers: default_max_workers(),
            idle_timeout_secs: default_idle_timeout(),
            reclaim_interval_secs: default_reclaim_interval(),
        }
    }
}

impl PoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn reclaim_interval(&self) -> Duration {
        Duration::from_secs(self.reclaim_interval_secs)
    }
}

fn default_min_workers() -> usize {
    3
}

fn default_max_workers() -> usize {
    10
}

fn default_idle_timeout() -> u64 {
    300
}

fn default_reclaim_interval() -> u64 {
    60
}

/// Autoscaler settings. Worker bounds come from `[pool]`.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `enabled` | false |
/// | `check_interval_ms` | 10000 |
/// | `scale_up_threshold` | 2 |
/// | `scale_down_threshold` | 0 |
/// | `scale_up_step` | 1 |
/// | `scale_down_step` | 1 |
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AutoScalerConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_check_interval")]
    pub check_interval_ms: u64,

    /// Queue length at or above which the pool grows when no worker is idle.
    #[serde(default = "default_scale_up_threshold")]
    pub scale_up_threshold: usize,

    /// Queue length at or below which surplus idle workers are removed.
    #[serde(default)]
    pub scale_down_threshold: usize,

    #[serde(default = "default_step")]
    pub scale_up_step: usize,

    #[serde(default = "default_step")]
    pub scale_down_step: usize,
}

impl Default for AutoScalerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            check_interval_ms: default_check_interval(),
            scale_up_threshold: default_scale_up_threshold(),
            scale_down_threshold: 0,
            scale_up_step: default_step(),
            scale_down_step: default_step(),
        }
    }
}

fn default_check_interval() -> u64 {
    10_000
}

fn default_scale_up_threshold() -> usize {
    2
}

fn default_step() -> usize {
    1
}

/// Test execution settings.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ExecutionConfig {
    /// Pause between whole-test retry attempts.
    ///
    /// Default: 3000
    #[serde(default = "default_test_retry_delay")]
    pub test_retry_delay_ms: u64,

    /// Where drivers that write image files put screenshots.
    ///
    /// Default: "screenshots"
    #[serde(default = "default_screenshots_dir")]
    pub screenshots_dir: PathBuf,

    /// Fallback period of the dispatcher when no wake-up arrives.
    ///
    /// Default: 1000
    #[serde(default = "default_dispatch_poll")]
    pub dispatch_poll_ms: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            test_retry_delay_ms: default_test_retry_delay(),
            screenshots_dir: default_screenshots_dir(),
            dispatch_poll_ms: default_dispatch_poll(),
        }
    }
}

fn default_test_retry_delay() -> u64 {
    3000
}

fn default_screenshots_dir() -> PathBuf {
    PathBuf::from("screenshots")
}

fn default_dispatch_poll() -> u64 {
    1000
}

/// Store selection.
///
/// ```toml
/// [store]
/// type = "file"
/// dir = "./testgrid-data"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StoreConfig {
    #[default]
    Memory,
    File {
        #[serde(default = "default_store_dir")]
        dir: PathBuf,
    },
}

fn default_store_dir() -> PathBuf {
    PathBuf::from("testgrid-data")
}
