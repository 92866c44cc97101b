//! Core value types shared by bitmaps, jobs and transactions.
//!
//! - JobId: identifier of a backup job
//! - SyncMode, OnSourceError, JobStatus: enums controlling and reporting job behavior
//! - Extent: a contiguous byte range on a volume
//! - IoOperation: which side of a copy an error happened on

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a backup job.
///
/// Callers may choose their own id when starting a job; otherwise a random
/// UUID is assigned.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        JobId(id.into())
    }

    /// Generate a fresh random id.
    pub fn generate() -> Self {
        JobId(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(id: &str) -> Self {
        JobId(id.to_string())
    }
}

/// Which ranges of the source a backup copies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// Copy the entire volume
    Full,
    /// Copy only the ranges dirty in the job's bitmap
    Incremental,
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncMode::Full => write!(f, "full"),
            SyncMode::Incremental => write!(f, "incremental"),
        }
    }
}

/// What a job does when a read or write fails mid-copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnSourceError {
    /// Fail the job and report the error
    #[default]
    Report,
    /// Pause the job until it is resumed or cancelled
    Stop,
}

impl fmt::Display for OnSourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OnSourceError::Report => write!(f, "report"),
            OnSourceError::Stop => write!(f, "stop"),
        }
    }
}

/// Lifecycle state of a backup job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Copying chunks
    Running,
    /// Suspended after an I/O error, waiting for resume or cancel
    Paused,
    /// All chunks copied and the target appended to its chain
    Completed,
    /// Stopped on an I/O error under the `report` policy
    Failed,
    /// Cancelled by a caller or by its transaction group
    Cancelled,
}

impl JobStatus {
    /// Returns true if this state is terminal (no further changes expected).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Running => "running",
            JobStatus::Paused => "paused",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Side of a copy on which an I/O error occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IoOperation {
    Read,
    Write,
}

impl fmt::Display for IoOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoOperation::Read => write!(f, "read"),
            IoOperation::Write => write!(f, "write"),
        }
    }
}

/// A contiguous byte range `[offset, offset + len)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extent {
    pub offset: u64,
    pub len: u64,
}

impl Extent {
    pub fn new(offset: u64, len: u64) -> Self {
        Extent { offset, len }
    }

    /// Exclusive end, clamped to `u64::MAX`.
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.len)
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Split this extent into pieces that never cross a `cluster_size` boundary.
    ///
    /// `cluster_size` must be a power of two.
    pub fn chunks(&self, cluster_size: u64) -> Vec<Extent> {
        let mut chunks = Vec::new();
        let mut pos = self.offset;
        let end = self.end();
        while pos < end {
            let boundary = (pos & !(cluster_size - 1)).saturating_add(cluster_size);
            let next = boundary.min(end);
            chunks.push(Extent::new(pos, next - pos));
            pos = next;
        }
        chunks
    }
}
