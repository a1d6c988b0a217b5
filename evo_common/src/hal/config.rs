//! HAL runtime configuration.
//!
//! This module contains the configuration loaded from `hal.toml`:
//! - `HalConfig` - Top-level configuration
//! - `SegmentConfig` - Shared segment name and size
//! - `SchedulerConfig` - Thread execution mode and base period
//! - `ChangeDetectionConfig` - Initial epsilon table
//!
//! # TOML Example
//!
//! ```toml
//! [shared]
//! service_name = "evo_hal"
//!
//! [segment]
//! name = "hal"
//! size = 1048576
//!
//! [scheduler]
//! mode = "realtime"
//! base_period_ns = 1000000
//!
//! [change_detection]
//! epsilon = [0.00001, 0.001]
//! ```

use crate::config::{ConfigError, LogLevel, SharedConfig};
use crate::consts::HAL_SERVICE_NAME;
use crate::hal::consts::{DEFAULT_EPSILON, HAL_NAME_LEN, MAX_EPSILON};
use crate::shm::consts::{PAGE_SIZE, SHM_DEFAULT_SIZE, SHM_MAX_SIZE, SHM_MIN_SIZE};
use serde::{Deserialize, Serialize};

fn default_shared() -> SharedConfig {
    SharedConfig {
        log_level: LogLevel::Info,
        service_name: HAL_SERVICE_NAME.to_string(),
    }
}

fn default_segment_size() -> usize {
    SHM_DEFAULT_SIZE
}

fn default_epsilon() -> Vec<f64> {
    vec![DEFAULT_EPSILON; MAX_EPSILON]
}

/// Top-level HAL configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HalConfig {
    /// Common service fields.
    #[serde(default = "default_shared")]
    pub shared: SharedConfig,

    /// Shared segment settings.
    #[serde(default)]
    pub segment: SegmentConfig,

    /// Thread execution settings.
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Change detection settings.
    #[serde(default)]
    pub change_detection: ChangeDetectionConfig,
}

/// Shared segment settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentConfig {
    /// Segment name below `/dev/shm`. `None` maps a process-private
    /// anonymous segment.
    #[serde(default)]
    pub name: Option<String>,

    /// Segment size in bytes (page multiple).
    #[serde(default = "default_segment_size")]
    pub size: usize,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            name: None,
            size: SHM_DEFAULT_SIZE,
        }
    }
}

/// How HAL threads are driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SchedulerMode {
    /// One periodic OS thread per HAL thread.
    Realtime,
    /// No OS threads; cycles are driven by `run_thread_once`.
    #[default]
    Manual,
}

/// Thread execution settings.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SchedulerConfig {
    /// Execution mode.
    #[serde(default)]
    pub mode: SchedulerMode,

    /// Fixed base period in nanoseconds. 0 lets the first thread decide.
    #[serde(default)]
    pub base_period_ns: u64,

    /// Request `SCHED_FIFO` for thread tasks.
    #[serde(default)]
    pub rt_priority: bool,
}

/// Change detection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeDetectionConfig {
    /// Initial epsilon table. Missing slots keep the default epsilon.
    #[serde(default = "default_epsilon")]
    pub epsilon: Vec<f64>,
}

impl Default for ChangeDetectionConfig {
    fn default() -> Self {
        Self {
            epsilon: default_epsilon(),
        }
    }
}

impl Default for HalConfig {
    fn default() -> Self {
        Self {
            shared: default_shared(),
            segment: SegmentConfig::default(),
            scheduler: SchedulerConfig::default(),
            change_detection: ChangeDetectionConfig::default(),
        }
    }
}

impl HalConfig {
    /// Validate the configuration.
    ///
    /// # Validation Rules
    /// 1. `shared.service_name` not empty
    /// 2. `segment.size` within limits and page aligned
    /// 3. `segment.name` free of `/` and not longer than a HAL name
    /// 4. at most `MAX_EPSILON` non-negative epsilon values
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.shared.validate()?;

        let size = self.segment.size;
        if !(SHM_MIN_SIZE..=SHM_MAX_SIZE).contains(&size) || size % PAGE_SIZE != 0 {
            return Err(ConfigError::ValidationError(format!(
                "segment.size {size} must be a page multiple between {SHM_MIN_SIZE} and {SHM_MAX_SIZE}"
            )));
        }

        if let Some(name) = &self.segment.name {
            if name.is_empty() || name.contains('/') || name.len() > HAL_NAME_LEN {
                return Err(ConfigError::ValidationError(format!(
                    "segment.name '{name}' is not a valid segment name"
                )));
            }
        }

        let eps = &self.change_detection.epsilon;
        if eps.len() > MAX_EPSILON {
            return Err(ConfigError::ValidationError(format!(
                "Too many epsilon values: {} (max {})",
                eps.len(),
                MAX_EPSILON
            )));
        }
        if let Some(bad) = eps.iter().find(|e| !e.is_finite() || **e < 0.0) {
            return Err(ConfigError::ValidationError(format!(
                "epsilon {bad} must be a non-negative number"
            )));
        }

        Ok(())
    }

    /// Full epsilon table, padded with the default epsilon.
    pub fn epsilon_table(&self) -> [f64; MAX_EPSILON] {
        let mut table = [DEFAULT_EPSILON; MAX_EPSILON];
        for (slot, value) in table.iter_mut().zip(&self.change_detection.epsilon) {
            *slot = *value;
        }
        table
    }
}
