//! Prelude module for common re-exports.
//!
//! `use evo_common::prelude::*;` brings in the value types, error types
//! and configuration types that nearly every HAL user touches.

// ─── Configuration ──────────────────────────────────────────────────
pub use crate::config::{ConfigError, ConfigLoader, LogLevel, SharedConfig};
pub use crate::hal::config::{HalConfig, SchedulerMode};

// ─── Errors ─────────────────────────────────────────────────────────
pub use crate::hal::error::{HalError, HalResult};

// ─── Types ──────────────────────────────────────────────────────────
pub use crate::hal::lock::LockLevel;
pub use crate::hal::types::{
    CompState, CompType, FunctType, HalType, HalValue, ObjectType, ParamDir, PinDir,
};

// ─── Constants ──────────────────────────────────────────────────────
pub use crate::hal::consts::{
    DEFAULT_EPSILON, GROUP_MONITOR_ALL_MEMBERS, GROUP_REPORT_ON_CHANGE, HAL_NAME_LEN,
    MAX_EPSILON, MAX_NESTED_GROUPS, MEMBER_MONITOR_CHANGE,
};
