//! HAL error taxonomy.
//!
//! Every registry, entity, scheduler and change-detection operation returns
//! [`HalResult`]. Each variant maps onto a negative POSIX code through
//! [`HalError::errno`] so textual front-ends can pass return codes through
//! unchanged.

use thiserror::Error;

use crate::hal::types::ObjectType;

/// Error types for HAL operations.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum HalError {
    /// Bad argument, type or direction mismatch, invalid position
    #[error("Invalid argument: {0}")]
    Invalid(String),

    /// An object of the same type and name already exists
    #[error("Duplicate {kind} name '{name}'")]
    Exists {
        /// Object type
        kind: ObjectType,
        /// Conflicting name
        name: String,
    },

    /// Referenced object does not exist
    #[error("{kind} '{name}' not found")]
    NotFound {
        /// Object type
        kind: ObjectType,
        /// Name or id that was looked up
        name: String,
    },

    /// Arena or heap exhausted
    #[error("Insufficient shared memory for {0}")]
    NoMemory(String),

    /// Protocol violation or blocked by the current lock level
    #[error("Permission denied: {0}")]
    Permission(String),

    /// Object still referenced
    #[error("Busy: {0}")]
    Busy(String),

    /// Group nesting exceeded the compile limit
    #[error("Group nesting too deep: {stack}")]
    NestingTooDeep {
        /// Nesting chain, outermost first
        stack: String,
    },

    /// Corrupted reference or other invariant violation
    #[error("Internal fault: {0}")]
    Fault(String),

    /// Shared segment error
    #[error("Shared memory error: {0}")]
    Shm(String),
}

impl HalError {
    /// Shorthand for [`HalError::NotFound`].
    pub fn not_found(kind: ObjectType, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// Shorthand for [`HalError::Exists`].
    pub fn exists(kind: ObjectType, name: impl Into<String>) -> Self {
        Self::Exists {
            kind,
            name: name.into(),
        }
    }

    /// Negative POSIX error code for this error.
    pub fn errno(&self) -> i32 {
        let code = match self {
            Self::Invalid(_) => libc::EINVAL,
            Self::Exists { .. } => libc::EEXIST,
            Self::NotFound { .. } => libc::ENOENT,
            Self::NoMemory(_) => libc::ENOMEM,
            Self::Permission(_) => libc::EPERM,
            Self::Busy(_) => libc::EBUSY,
            Self::NestingTooDeep { .. } => libc::ELOOP,
            Self::Fault(_) => libc::EFAULT,
            Self::Shm(_) => libc::EIO,
        };
        -code
    }

    /// True for the configuration class of errors.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            Self::Invalid(_) | Self::Exists { .. } | Self::NotFound { .. } | Self::NestingTooDeep { .. }
        )
    }
}

/// Result type for HAL operations.
pub type HalResult<T> = Result<T, HalError>;
