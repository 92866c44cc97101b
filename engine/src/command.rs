//! Typed commands and responses.
//!
//! A command is a JSON object naming the operation in `execute` and its
//! parameters in `arguments`:
//!
//! ```json
//! {"execute": "create_bitmap", "arguments": {"volume": "drive0", "name": "bitmap0"}}
//! ```
//!
//! Every command yields exactly one [`Response`]: `{"return": ...}` on
//! success, or `{"error": {"class": ..., "desc": ...}}`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;

use crate::checksums::ChecksumAlgorithm;
use crate::engine::BackupEngine;
use crate::error::{EngineError, ErrorClass, Result};
use crate::fault::FaultRule;
use crate::job::BackupRequest;
use crate::model::JobId;
use crate::transaction::{CompletionMode, TransactionAction};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "execute", content = "arguments", rename_all = "snake_case")]
pub enum Command {
    AddVolume {
        id: String,
        size: u64,
    },
    RemoveVolume {
        id: String,
    },
    WriteVolume {
        volume: String,
        offset: u64,
        data: Vec<u8>,
    },
    FillVolume {
        volume: String,
        offset: u64,
        len: u64,
        pattern: u8,
    },
    ReadVolume {
        volume: String,
        offset: u64,
        len: u64,
    },
    CreateBitmap {
        volume: String,
        name: String,
        #[serde(default)]
        granularity: Option<u64>,
        #[serde(default)]
        persistent: bool,
    },
    RemoveBitmap {
        volume: String,
        name: String,
    },
    ClearBitmap {
        volume: String,
        name: String,
    },
    EnableBitmap {
        volume: String,
        name: String,
    },
    DisableBitmap {
        volume: String,
        name: String,
    },
    QueryBitmap {
        volume: String,
        name: String,
    },
    QueryBitmaps {
        volume: String,
    },
    StartBackup(BackupRequest),
    StartTransaction {
        actions: Vec<TransactionAction>,
        #[serde(default)]
        completion_mode: CompletionMode,
    },
    ResumeJob {
        job_id: JobId,
    },
    CancelJob {
        job_id: JobId,
    },
    QueryJob {
        job_id: JobId,
    },
    QueryJobs,
    WaitJob {
        job_id: JobId,
    },
    DismissJob {
        job_id: JobId,
    },
    QueryTargets,
    RemoveTarget {
        target: String,
    },
    ValidateChain {
        volume: String,
        bitmap: String,
        #[serde(default)]
        algorithm: ChecksumAlgorithm,
    },
    InjectFault {
        device: String,
        rule: FaultRule,
    },
    ClearFaults {
        device: String,
    },
}

impl Command {
    /// Parse one JSON command.
    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Response {
    Return(Value),
    Error { class: ErrorClass, desc: String },
}

impl Response {
    pub fn is_error(&self) -> bool {
        matches!(self, Response::Error { .. })
    }
}

impl From<Result<Value>> for Response {
    fn from(result: Result<Value>) -> Self {
        match result {
            Ok(value) => Response::Return(value),
            Err(e) => Response::Error {
                class: e.class(),
                desc: e.to_string(),
            },
        }
    }
}

/// Run a command against `engine`.
pub fn execute(engine: &BackupEngine, command: Command) -> Response {
    debug!(?command, "execute");
    dispatch(engine, command).into()
}

/// Parse and run one JSON command. Malformed input is a `GenericError`.
pub fn execute_json(engine: &BackupEngine, text: &str) -> Response {
    match Command::from_json(text) {
        Ok(command) => execute(engine, command),
        Err(e) => Err::<Value, EngineError>(e).into(),
    }
}

fn dispatch(engine: &BackupEngine, command: Command) -> Result<Value> {
    let empty = || json!({});
    let value = match command {
        Command::AddVolume { id, size } => {
            engine.add_volume(&id, size)?;
            empty()
        }
        Command::RemoveVolume { id } => {
            engine.remove_volume(&id)?;
            empty()
        }
        Command::WriteVolume {
            volume,
            offset,
            data,
        } => {
            engine.write_volume(&volume, offset, &data)?;
            empty()
        }
        Command::FillVolume {
            volume,
            offset,
            len,
            pattern,
        } => {
            engine.fill_volume(&volume, offset, len, pattern)?;
            empty()
        }
        Command::ReadVolume {
            volume,
            offset,
            len,
        } => json!({ "data": engine.read_volume(&volume, offset, len)? }),
        Command::CreateBitmap {
            volume,
            name,
            granularity,
            persistent,
        } => {
            engine.create_bitmap(&volume, &name, granularity, persistent)?;
            empty()
        }
        Command::RemoveBitmap { volume, name } => {
            engine.remove_bitmap(&volume, &name)?;
            empty()
        }
        Command::ClearBitmap { volume, name } => {
            engine.clear_bitmap(&volume, &name)?;
            empty()
        }
        Command::EnableBitmap { volume, name } => {
            engine.enable_bitmap(&volume, &name)?;
            empty()
        }
        Command::DisableBitmap { volume, name } => {
            engine.disable_bitmap(&volume, &name)?;
            empty()
        }
        Command::QueryBitmap { volume, name } => {
            serde_json::to_value(engine.query_bitmap(&volume, &name)?)?
        }
        Command::QueryBitmaps { volume } => serde_json::to_value(engine.query_bitmaps(&volume)?)?,
        Command::StartBackup(request) => json!({ "job_id": engine.start_backup(request)? }),
        Command::StartTransaction {
            actions,
            completion_mode,
        } => json!({ "job_ids": engine.start_transaction(&actions, completion_mode)? }),
        Command::ResumeJob { job_id } => {
            engine.resume_job(&job_id)?;
            empty()
        }
        Command::CancelJob { job_id } => json!({ "cancelled": engine.cancel_job(&job_id)? }),
        Command::QueryJob { job_id } => serde_json::to_value(engine.query_job(&job_id)?)?,
        Command::QueryJobs => serde_json::to_value(engine.query_jobs())?,
        Command::WaitJob { job_id } => serde_json::to_value(engine.wait_job(&job_id)?)?,
        Command::DismissJob { job_id } => serde_json::to_value(engine.dismiss_job(&job_id)?)?,
        Command::QueryTargets => json!(engine.targets()),
        Command::RemoveTarget { target } => {
            engine.remove_target(&target)?;
            empty()
        }
        Command::ValidateChain {
            volume,
            bitmap,
            algorithm,
        } => serde_json::to_value(engine.validate_chain(&volume, &bitmap, algorithm)?)?,
        Command::InjectFault { device, rule } => {
            engine.inject_fault(&device, rule);
            empty()
        }
        Command::ClearFaults { device } => {
            engine.clear_faults(&device);
            empty()
        }
    };
    Ok(value)
}
