// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime error types.
//!
//! Usage errors on channels (reading past an end-of-transmission marker,
//! opening a channel that is not closed) are panics, not values here.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// A failure while resolving runtime configuration from the environment.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var} must be a positive integer, got '{value}'")]
    NotPositive { var: &'static str, value: String },

    #[error("{var} must be a non-negative integer, got '{value}'")]
    NotCount { var: &'static str, value: String },
}

/// A failure while loading or running an external device.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("no device loader configured for target '{}'", .target.display())]
    NoLoader { target: PathBuf },

    #[error("failed to load '{}': {reason}", .target.display())]
    Load { target: PathBuf, reason: String },

    #[error("argument {index} rejected by device: {reason}")]
    Argument { index: usize, reason: String },

    #[error("device operation '{op}' failed: {reason}")]
    Operation { op: &'static str, reason: String },

    #[error("device invocation was killed")]
    Killed,

    #[error("failed to allocate shared memory for kernel timing")]
    SharedMemory(#[source] io::Error),

    #[error("failed to fork device invocation process")]
    Fork(#[source] io::Error),

    #[error("device invocation process exited abnormally (status {status})")]
    ChildFailed { status: i32 },

    #[error("device invocation panicked: {0}")]
    Panicked(String),
}

impl DeviceError {
    /// Shorthand for implementors of [`crate::device::Device`].
    pub fn operation(op: &'static str, reason: impl Into<String>) -> Self {
        DeviceError::Operation {
            op,
            reason: reason.into(),
        }
    }
}
