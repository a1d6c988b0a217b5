//! EVO Common Library
//!
//! Shared value types, error taxonomy, constants and configuration loading
//! used by the EVO HAL runtime crates.
//!
//! # Module Structure
//!
//! - [`consts`] - System-wide constants and default paths
//! - [`shm`] - Shared memory arena constants
//! - [`hal`] - HAL scalar types, lock levels, errors and configuration
//! - [`config`] - Configuration loading traits and types
//! - [`prelude`] - Common re-exports for convenience
//!
//! # Usage
//!
//! ```rust
//! use evo_common::prelude::*;
//!
//! let v = HalValue::parse(HalType::Float, "3.5").unwrap();
//! assert_eq!(v, HalValue::Float(3.5));
//! ```

pub mod config;
pub mod consts;
pub mod hal;
pub mod prelude;
pub mod shm;
