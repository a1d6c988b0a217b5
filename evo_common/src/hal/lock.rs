//! Coarse lock levels gating classes of HAL mutation.
//!
//! Lock levels are a policy layer on top of the HAL mutex: the mutex keeps
//! the database consistent, the lock level decides which operations are
//! allowed at all.

use bitflags::bitflags;

bitflags! {
    /// Bitmask of blocked operation classes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct LockLevel: u32 {
        /// Block loading new components
        const LOAD = 1;
        /// Block linking and thread membership changes
        const CONFIG = 2;
        /// Block parameter writes
        const PARAMS = 4;
        /// Block thread start/stop
        const RUN = 8;
    }
}

impl LockLevel {
    /// No locking.
    pub const NONE: Self = Self::empty();

    /// Parse the command-interpreter spelling (`none`, `load`, `config`,
    /// `params`, `run`, `tune`, `all`).
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Some(Self::NONE),
            "load" => Some(Self::LOAD),
            "config" => Some(Self::LOAD | Self::CONFIG),
            "params" => Some(Self::PARAMS),
            "run" => Some(Self::RUN),
            "tune" => Some(Self::LOAD | Self::CONFIG),
            "all" => Some(Self::all()),
            _ => None,
        }
    }
}
