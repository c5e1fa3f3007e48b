#![forbid(unsafe_code)]
//! Error types for the membuf stream cache.
//!
//! Defines `MembufError` and a `Result<T>` alias used throughout the
//! workspace, plus the three-valued status code the host dispatch expects.

use std::sync::Arc;
use thiserror::Error;

/// Unified error type for all membuf operations.
#[derive(Debug, Error)]
pub enum MembufError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("source read failed at offset {offset}: {detail}")]
    SourceRead { offset: u64, detail: String },

    #[error("source seek to {requested} landed at {actual}")]
    SourceSeek { requested: u64, actual: u64 },

    #[error("buffer allocation of {bytes} bytes failed")]
    Alloc { bytes: usize },

    #[error("memory prebuffering disabled by configuration")]
    Disabled,

    #[error("prebuffer cache cannot be layered on itself")]
    AlreadyLayered,

    #[error("source size unknown or empty")]
    UnknownSize,

    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: &'static str },

    #[error("operation not supported")]
    Unsupported,

    #[error("stream cache closed")]
    Closed,

    #[error("prebuffer worker failed: {0}")]
    Faulted(Arc<MembufError>),
}

/// Three-valued return code of the host dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Error,
    Unsupported,
}

impl MembufError {
    /// Map this error onto the host's status code.
    #[must_use]
    pub fn status(&self) -> Status {
        match self {
            Self::Unsupported => Status::Unsupported,
            _ => Status::Error,
        }
    }

    /// Whether this error poisons the cache (latched worker faults do;
    /// seek failures and open gates do not).
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::SourceRead { .. } | Self::Alloc { .. } | Self::Faulted(_)
        )
    }
}

/// Result alias using `MembufError`.
pub type Result<T> = std::result::Result<T, MembufError>;
