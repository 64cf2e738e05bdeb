//! Error types for shared-memory objects

use std::io;
use thiserror::Error;

/// Result alias used throughout this crate
pub type ShmResult<T> = Result<T, ShmError>;

/// Errors raised while creating, importing or resolving shared objects
#[derive(Debug, Error)]
pub enum ShmError {
    /// An object of that name already exists for the calling process
    #[error("Shared object already exists: {name}")]
    AlreadyExists {
        /// Object name
        name: String,
    },

    /// No object of that name was exported by the given process
    #[error("Shared object {name} not found for pid {pid}")]
    NotFound {
        /// Object name
        name: String,
        /// Exporting process id
        pid: u32,
    },

    /// Name does not fit the fixed shared-object name budget
    #[error("Shared object name too long: {name} (max {max} bytes)")]
    NameTooLong {
        /// Offending name
        name: String,
        /// Maximum length
        max: usize,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Mapped object does not have the expected layout
    #[error("Bad layout in {name}: {reason}")]
    BadLayout {
        /// Object name
        name: String,
        /// What did not match
        reason: String,
    },

    /// Offset does not address a valid location in the mapping
    #[error("Offset {offset:#x} out of range (mapping size {size})")]
    OffsetOutOfRange {
        /// Offending offset
        offset: u64,
        /// Size of the mapping
        size: usize,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
