//! Error types for shared memory operations

use evo::hal::error::HalError;
use thiserror::Error;

/// Errors that can occur during shared memory operations
#[derive(Error, Debug)]
pub enum ShmError {
    /// Segment already exists
    #[error("Segment already exists: {name}")]
    AlreadyExists {
        /// Segment name
        name: String,
    },

    /// Segment not found
    #[error("Segment not found: {name}")]
    NotFound {
        /// Segment name
        name: String,
    },

    /// Invalid segment size
    #[error("Invalid segment size: {size} bytes (must be 64KB-1GB, page-aligned)")]
    InvalidSize {
        /// Attempted size in bytes
        size: usize,
    },

    /// Segment layout does not match this build
    #[error("Segment version mismatch: expected {expected:#010x}, found {found:#010x}")]
    VersionMismatch {
        /// Layout version of this build
        expected: u32,
        /// Layout version stored in the segment
        found: u32,
    },

    /// Segment was never initialized by its creator
    #[error("Segment not initialized: {name}")]
    NotInitialized {
        /// Segment name
        name: String,
    },

    /// Arena exhausted
    #[error("Out of shared memory: {requested} bytes requested, {available} available")]
    OutOfMemory {
        /// Requested size in bytes
        requested: usize,
        /// Bytes left in the gap between heap and realtime region
        available: usize,
    },

    /// Offset outside the segment or not an allocated block
    #[error("Invalid offset {offset:#x}")]
    InvalidOffset {
        /// Offending offset
        offset: u32,
    },

    /// IO error
    #[error("IO error: {source}")]
    Io {
        /// Source IO error
        #[from]
        source: std::io::Error,
    },

    /// Nix system call error
    #[error("System call error: {source}")]
    Nix {
        /// Source nix error
        #[from]
        source: nix::Error,
    },
}

impl From<ShmError> for HalError {
    fn from(e: ShmError) -> Self {
        match e {
            ShmError::OutOfMemory { .. } => HalError::NoMemory(e.to_string()),
            ShmError::InvalidOffset { .. } => HalError::Fault(e.to_string()),
            other => HalError::Shm(other.to_string()),
        }
    }
}

/// Result type for shared memory operations
pub type ShmResult<T> = Result<T, ShmError>;
