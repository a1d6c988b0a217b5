//! HAL scalar types, lock levels, errors and configuration.
//!
//! Everything in here is plain data: no shared-memory access happens in
//! this crate, so these types can be used by tools that never attach to
//! a segment.

pub mod config;
pub mod consts;
pub mod error;
pub mod lock;
pub mod types;
