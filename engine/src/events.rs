//! Job event notification.
//!
//! This module defines the [`EventSink`] trait, which decouples backup jobs
//! from whoever observes them, and [`EventChannel`], the default sink that
//! fans every event out to any number of subscribers.
//!
//! Events for different jobs may arrive in any order; events for one job
//! arrive in the order the job emitted them.

use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::model::{IoOperation, JobId, JobStatus, OnSourceError};

/// What happened to a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventKind {
    /// Terminal event for completed and failed jobs; `error` is set on failure
    JobCompleted {
        job_id: JobId,
        offset: u64,
        len: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// A read or write failed; `action` is the policy that was applied
    JobError {
        job_id: JobId,
        action: OnSourceError,
        operation: IoOperation,
        errno: i32,
    },
    /// Terminal event for cancelled jobs
    JobCancelled { job_id: JobId, offset: u64, len: u64 },
    JobStatusChange { job_id: JobId, status: JobStatus },
}

impl EventKind {
    pub fn job_id(&self) -> &JobId {
        match self {
            EventKind::JobCompleted { job_id, .. }
            | EventKind::JobError { job_id, .. }
            | EventKind::JobCancelled { job_id, .. }
            | EventKind::JobStatusChange { job_id, .. } => job_id,
        }
    }

    /// True for the single event every job emits when it reaches a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventKind::JobCompleted { .. } | EventKind::JobCancelled { .. }
        )
    }
}

/// A timestamped event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Receiver of job events.
///
/// Called synchronously from job worker threads.
pub trait EventSink: Send + Sync {
    fn emit(&self, kind: EventKind);
}

/// Broadcast channel delivering every event to every live subscriber.
#[derive(Debug, Default)]
pub struct EventChannel {
    subscribers: Mutex<Vec<Sender<Event>>>,
}

impl EventChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Receive all events emitted from now on.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = unbounded();
        self.subscribers.lock().push(tx);
        Subscription { rx }
    }
}

impl EventSink for EventChannel {
    fn emit(&self, kind: EventKind) {
        trace!(?kind, "event");
        let event = Event {
            timestamp: Utc::now(),
            kind,
        };
        self.subscribers
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// Receiving end of an [`EventChannel`] subscription.
#[derive(Debug)]
pub struct Subscription {
    rx: Receiver<Event>,
}

impl Subscription {
    /// Events already delivered, without blocking.
    pub fn drain(&self) -> Vec<Event> {
        self.rx.try_iter().collect()
    }

    /// Next event, or `None` after `timeout`.
    pub fn next_timeout(&self, timeout: Duration) -> Option<Event> {
        match self.rx.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Wait for the next event matching `pred`, discarding others.
    pub fn wait_for(
        &self,
        timeout: Duration,
        mut pred: impl FnMut(&EventKind) -> bool,
    ) -> Option<Event> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            let event = self.next_timeout(remaining)?;
            if pred(&event.kind) {
                return Some(event);
            }
        }
    }
}
