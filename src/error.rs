//! Error types for fence and timeline operations.

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during fence and timeline operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FenceError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Failed to spawn worker thread: {0}")]
    ThreadSpawnFailed(String),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, FenceError>;

impl FenceError {
    /// Negative errno equivalent, for callers bridging to C-style status codes.
    pub fn errno(&self) -> i32 {
        let code = match self {
            FenceError::InvalidArgument(_) => libc::EINVAL,
            FenceError::OutOfMemory(_) => libc::ENOMEM,
            FenceError::Io(_) => libc::EIO,
            FenceError::Timeout(_) => libc::ETIMEDOUT,
            FenceError::ProtocolViolation(_) => libc::EPROTO,
            FenceError::ThreadSpawnFailed(_) => libc::EAGAIN,
        };
        -code
    }
}

impl From<std::io::Error> for FenceError {
    fn from(err: std::io::Error) -> Self {
        FenceError::Io(err.to_string())
    }
}
