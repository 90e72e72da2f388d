//! Error types.
//!
//! Allocation failures are ordinary results the caller must handle; nothing
//! in the allocator retries internally.

use crate::region::FragOffset;
use std::path::PathBuf;
use thiserror::Error;

/// Errors returned by arena operations.
#[derive(Error, Debug)]
pub enum ArenaError {
    /// The region cannot hold the control structures plus one minimal fragment.
    #[error("region too small: need at least {required} bytes, have {available}")]
    Initialization {
        /// Bytes needed for control structures and a minimal fragment.
        required: usize,
        /// Usable bytes after alignment.
        available: usize,
    },

    /// No free fragment can satisfy the request.
    #[error("no free fragment for {requested} bytes (first bucket {bucket})")]
    NoSpace {
        /// Requested size in bytes, before rounding.
        requested: usize,
        /// Primary bucket the search started from.
        bucket: usize,
    },

    /// The region does not hold an arena this build can attach to.
    #[error("incompatible arena header: {reason}")]
    Incompatible {
        /// What did not match.
        reason: String,
    },

    /// A structural check found a broken fragment or free list.
    #[error("arena inconsistency at {offset}: {reason}")]
    Inconsistent {
        /// Fragment the check failed on.
        offset: FragOffset,
        /// Description of the broken invariant.
        reason: String,
    },

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Pattern file failure.
    #[error(transparent)]
    Pattern(#[from] PatternError),
}

/// Errors reading or writing a warm-up pattern file.
#[derive(Error, Debug)]
pub enum PatternError {
    /// The file could not be read or written.
    #[error("pattern file {path}: {source}")]
    Io {
        /// Pattern file path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The header is malformed or was written by an incompatible build.
    #[error("pattern file {path} is incompatible: {reason}")]
    Format {
        /// Pattern file path.
        path: PathBuf,
        /// What did not match.
        reason: String,
    },

    /// A fraction after a valid header could not be parsed.
    #[error("pattern file {path} is corrupt at entry {index}: {token:?}")]
    Corruption {
        /// Pattern file path.
        path: PathBuf,
        /// Class index of the bad entry.
        index: usize,
        /// Offending token, empty at premature end of file.
        token: String,
    },
}

impl PatternError {
    /// Whether the error must stop the process rather than skip warm-up.
    pub fn is_fatal(&self) -> bool {
        matches!(self, PatternError::Corruption { .. })
    }
}

/// Result alias for arena operations.
pub type Result<T, E = ArenaError> = std::result::Result<T, E>;
