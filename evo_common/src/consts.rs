//! System-wide constants for the EVO workspace.
//!
//! Single source of truth for default paths and service names.

/// Canonical HAL service name (used for segment naming and logging).
pub const HAL_SERVICE_NAME: &str = "evo_hal";

/// Default configuration file path.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/evo/hal.toml";

/// Default name of the shared HAL segment (below `/dev/shm`).
pub const DEFAULT_SEGMENT_NAME: &str = "evo_hal";
