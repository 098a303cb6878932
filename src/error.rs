//! Unified error type for every fallible operation in the engine.
//!
//! One enum covers all of C1–C11 rather than a per-module error type per
//! component, because callers (C8's rollback stack, C9's maintenance loop)
//! routinely need to match across component boundaries on the same kind.

use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Block {block_id} is corrupt: {reason}")]
    CorruptBlock { block_id: i64, reason: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Duplicate envelope hash, existing id: {existing}")]
    Duplicate { existing: String },

    #[error("Authentication failure: {0}")]
    AuthFailure(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Hash chain broken at sequence {sequence}: {reason}")]
    ChainBroken { sequence: u64, reason: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Unsupported format version {found} (minimum supported {minimum})")]
    VersionMismatch { found: u16, minimum: u16 },

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl Error {
    pub fn corrupt(block_id: i64, reason: impl Into<String>) -> Self {
        Error::CorruptBlock { block_id, reason: reason.into() }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Error::NotFound(what.into())
    }

    pub fn invalid(what: impl Into<String>) -> Self {
        Error::InvalidArgument(what.into())
    }

    /// Transient I/O failures are the only kind worth retrying (§5, §7).
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
