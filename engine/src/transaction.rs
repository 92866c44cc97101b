//! Transactions: starting several backups as one unit.
//!
//! A transaction is checked as a whole before anything happens. Planning
//! works out which bitmap each backup holds and which `clear_bitmap` actions
//! anchor a new chain; the engine then acquires every bitmap and creates every
//! job, or none of them.
//!
//! With [`CompletionMode::Grouped`], a [`GroupCoordinator`] watches the
//! members. The first member to fail cancels every member that is not yet
//! terminal. Members race independently: one that completed before the
//! failure keeps its result.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{EngineError, Result};
use crate::job::{BackupRequest, JobHandle, JobObserver};
use crate::model::{JobId, JobStatus, SyncMode};

/// One step of a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum TransactionAction {
    StartBackup(BackupRequest),
    /// Clear a bitmap. Paired with a full backup of the same volume, the
    /// clear happens when that backup completes and the backup becomes the
    /// new anchor of the bitmap's chain.
    ClearBitmap { volume: String, name: String },
}

/// How the outcomes of a transaction's jobs relate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionMode {
    /// Every job succeeds or fails on its own
    #[default]
    Individual,
    /// A failed job cancels all members that have not finished
    Grouped,
}

/// A backup after planning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct PlannedBackup {
    pub request: BackupRequest,
    /// Bitmap the job acquires, if any
    pub bitmap: Option<String>,
    /// Job re-anchors the bitmap's chain on completion
    pub anchor: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub(crate) struct TransactionPlan {
    pub backups: Vec<PlannedBackup>,
    /// `(volume, bitmap)` pairs cleared right away, with no anchoring backup
    pub clears: Vec<(String, String)>,
}

/// Check a transaction's internal consistency and bind clears to backups.
///
/// Does not look at engine state; the engine resolves names afterwards.
pub(crate) fn plan(actions: &[TransactionAction]) -> Result<TransactionPlan> {
    if actions.is_empty() {
        return Err(EngineError::invalid("transaction has no actions"));
    }

    let mut clears: Vec<(String, String)> = Vec::new();
    let mut backups: Vec<PlannedBackup> = Vec::new();
    for action in actions {
        match action {
            TransactionAction::ClearBitmap { volume, name } => {
                let key = (volume.clone(), name.clone());
                if !clears.contains(&key) {
                    clears.push(key);
                }
            }
            TransactionAction::StartBackup(request) => {
                check_request(request)?;
                backups.push(PlannedBackup {
                    request: request.clone(),
                    bitmap: request.bitmap.clone(),
                    anchor: false,
                });
            }
        }
    }

    // Each clear anchors the first unbound full backup of its volume
    let mut standalone = Vec::new();
    for (volume, name) in clears {
        let anchor = backups.iter_mut().find(|b| {
            b.request.sync_mode == SyncMode::Full && b.bitmap.is_none() && b.request.volume == volume
        });
        match anchor {
            Some(backup) => {
                backup.bitmap = Some(name);
                backup.anchor = true;
            }
            None => standalone.push((volume, name)),
        }
    }

    let mut held: HashSet<(&str, &str)> = HashSet::new();
    let mut targets: HashSet<&str> = HashSet::new();
    let mut ids: HashSet<&JobId> = HashSet::new();
    for backup in &backups {
        let volume = backup.request.volume.as_str();
        if let Some(name) = backup.bitmap.as_deref() {
            let cleared = standalone.iter().any(|(v, n)| v == volume && n == name);
            if cleared || !held.insert((volume, name)) {
                return Err(EngineError::BitmapBusy {
                    volume: volume.to_string(),
                    name: name.to_string(),
                });
            }
        }
        if !targets.insert(backup.request.target.as_str()) {
            return Err(EngineError::TargetExists {
                target: backup.request.target.clone(),
            });
        }
        if let Some(id) = &backup.request.job_id {
            if !ids.insert(id) {
                return Err(EngineError::JobExists { job_id: id.clone() });
            }
        }
    }

    Ok(TransactionPlan {
        backups,
        clears: standalone,
    })
}

/// Checks that hold for a backup request regardless of engine state.
pub(crate) fn check_request(request: &BackupRequest) -> Result<()> {
    match (request.sync_mode, &request.bitmap) {
        (SyncMode::Incremental, None) => Err(EngineError::invalid(format!(
            "incremental backup of '{}' needs a bitmap",
            request.volume
        ))),
        (SyncMode::Full, Some(name)) => Err(EngineError::invalid(format!(
            "full backup of '{}' cannot name bitmap '{}'; pair it with clear_bitmap in a transaction",
            request.volume, name
        ))),
        _ if request.target.is_empty() => Err(EngineError::invalid("target name must not be empty")),
        _ => Ok(()),
    }
}

#[derive(Debug, Default)]
struct GroupState {
    members: Vec<JobHandle>,
    cancelled: bool,
}

/// Applies the completion mode of one transaction to its jobs.
#[derive(Debug)]
pub(crate) struct GroupCoordinator {
    mode: CompletionMode,
    state: Mutex<GroupState>,
}

impl GroupCoordinator {
    pub(crate) fn new(mode: CompletionMode, members: Vec<JobHandle>) -> Arc<Self> {
        Arc::new(GroupCoordinator {
            mode,
            state: Mutex::new(GroupState {
                members,
                cancelled: false,
            }),
        })
    }
}

impl JobObserver for GroupCoordinator {
    fn on_terminal(&self, job_id: &JobId, status: JobStatus) {
        if self.mode != CompletionMode::Grouped || status != JobStatus::Failed {
            return;
        }

        let members = {
            let mut state = self.state.lock();
            if state.cancelled {
                return;
            }
            state.cancelled = true;
            state.members.clone()
        };

        warn!(job_id = %job_id, members = members.len(), "group member failed, cancelling the rest");
        for member in members.iter().filter(|m| m.id() != job_id) {
            if member.cancel() {
                info!(job_id = %member.id(), "cancelled by group");
            }
        }
    }
}
