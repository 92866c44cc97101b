//! Error types for the backup engine.
//!
//! `EngineError` covers request-time failures: anything rejected before a job
//! exists (bad granularity, unknown or busy bitmap, unknown volume). I/O errors
//! hit while a job is copying are not `EngineError`s; they are recorded on the
//! job as an [`IoFault`] and handled by its `on_source_error` policy.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{IoOperation, JobId, JobStatus};

/// Result alias used across the engine.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Coarse error class reported to command callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorClass {
    GenericError,
    InvalidGranularity,
    BitmapBusy,
    BitmapNotFound,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GenericError => write!(f, "GenericError"),
            Self::InvalidGranularity => write!(f, "InvalidGranularity"),
            Self::BitmapBusy => write!(f, "BitmapBusy"),
            Self::BitmapNotFound => write!(f, "BitmapNotFound"),
        }
    }
}

/// Errors rejected synchronously at request time.
///
/// No job is ever created for a request that fails with one of these.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("granularity {granularity} is not a power of two")]
    InvalidGranularity { granularity: u64 },

    #[error("bitmap '{name}' on volume '{volume}' is in use by another job")]
    BitmapBusy { volume: String, name: String },

    #[error("bitmap '{name}' not found on volume '{volume}'")]
    BitmapNotFound { volume: String, name: String },

    #[error("bitmap '{name}' already exists on volume '{volume}'")]
    BitmapExists { volume: String, name: String },

    #[error("volume '{volume}' not found")]
    VolumeNotFound { volume: String },

    #[error("volume '{volume}' already exists")]
    VolumeExists { volume: String },

    #[error("target '{target}' already exists")]
    TargetExists { target: String },

    #[error("target '{target}' not found")]
    TargetNotFound { target: String },

    #[error("job '{job_id}' not found")]
    JobNotFound { job_id: JobId },

    #[error("job '{job_id}' already exists")]
    JobExists { job_id: JobId },

    #[error("job '{job_id}' is {status}, not paused")]
    JobNotPaused { job_id: JobId, status: JobStatus },

    #[error("range {offset}+{len} is outside volume '{volume}' of size {size}")]
    OutOfRange {
        volume: String,
        offset: u64,
        len: u64,
        size: u64,
    },

    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error(transparent)]
    Io(#[from] IoFault),

    #[error("malformed command: {0}")]
    Serde(#[from] serde_json::Error),
}

impl EngineError {
    /// Map this error onto the class reported to callers.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::InvalidGranularity { .. } => ErrorClass::InvalidGranularity,
            Self::BitmapBusy { .. } => ErrorClass::BitmapBusy,
            Self::BitmapNotFound { .. } => ErrorClass::BitmapNotFound,
            _ => ErrorClass::GenericError,
        }
    }

    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidRequest {
            reason: reason.into(),
        }
    }
}

/// An I/O error observed on a device during a copy.
///
/// `errno` follows the POSIX numbering (5 = EIO, 28 = ENOSPC, ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{operation} error on '{device}' (errno {errno})")]
pub struct IoFault {
    pub errno: i32,
    pub operation: IoOperation,
    pub device: String,
}

impl IoFault {
    pub fn new(errno: i32, operation: IoOperation, device: impl Into<String>) -> Self {
        IoFault {
            errno,
            operation,
            device: device.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        let err = EngineError::InvalidGranularity { granularity: 3 };
        assert_eq!(err.class(), ErrorClass::InvalidGranularity);

        let err = EngineError::BitmapBusy {
            volume: "drive0".into(),
            name: "bitmap0".into(),
        };
        assert_eq!(err.class(), ErrorClass::BitmapBusy);

        let err = EngineError::VolumeNotFound {
            volume: "drive9".into(),
        };
        assert_eq!(err.class(), ErrorClass::GenericError);
    }

    #[test]
    fn test_io_fault_display() {
        let fault = IoFault::new(5, IoOperation::Read, "drive0");
        assert_eq!(fault.to_string(), "read error on 'drive0' (errno 5)");

        let err: EngineError = fault.into();
        assert_eq!(err.class(), ErrorClass::GenericError);
    }
}
