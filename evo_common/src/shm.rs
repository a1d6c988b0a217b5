//! Shared memory subsystem constants.
//!
//! - `consts`: arena magic, size limits and cache line constants.

pub mod consts;
