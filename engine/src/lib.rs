//! # BlockBackup Engine - Dirty-Bitmap Incremental Backup Library
//!
//! A change-tracking and incremental-backup engine for block volumes.
//! Designed as the foundation for multiple front ends (CLI, scripted tests, automation).
//!
//! ## Overview
//!
//! The engine records which regions of a volume were written since a
//! checkpoint and copies only those regions into a chain of backup targets.
//! It features:
//! - Dirty bitmaps at any power-of-two granularity
//! - Full and incremental backup jobs on worker threads
//! - Pause on I/O error with resume from the first uncopied chunk
//! - Transactions whose members can be cancelled together on failure
//! - Chain replay and checksum validation against the live volume
//! - Job events delivered to any number of subscribers
//!
//! ## Basic Usage
//!
//! ```no_run
//! use blockbackup_engine::{
//!     BackupEngine, BackupRequest, ChecksumAlgorithm, CompletionMode, EngineConfig,
//!     TransactionAction,
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = BackupEngine::new(EngineConfig::default())?;
//! engine.add_volume("drive0", 16 * 1024 * 1024)?;
//! engine.create_bitmap("drive0", "bitmap0", None, false)?;
//!
//! // Anchor the chain with a full backup
//! let ids = engine.start_transaction(
//!     &[
//!         TransactionAction::ClearBitmap { volume: "drive0".into(), name: "bitmap0".into() },
//!         TransactionAction::StartBackup(BackupRequest::full("drive0", "full0")),
//!     ],
//!     CompletionMode::Grouped,
//! )?;
//! engine.wait_job(&ids[0])?;
//!
//! // Only the written cluster is copied
//! engine.write_volume("drive0", 4096, b"changed")?;
//! let id = engine.start_backup(BackupRequest::incremental("drive0", "inc0", "bitmap0"))?;
//! println!("copied {} bytes", engine.wait_job(&id)?.bytes_copied);
//!
//! let report = engine.validate_chain("drive0", "bitmap0", ChecksumAlgorithm::Sha256)?;
//! assert!(report.matches);
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - **model**: Shared value types (JobId, Extent, SyncMode, JobStatus)
//! - **error**: Error types and error classes
//! - **bitmap**: Dirty bitmaps
//! - **volume**: In-memory volumes that dirty their bitmaps on write
//! - **image**: Sparse backup targets
//! - **chain**: Backup chains, replay and validation
//! - **job**: Backup job workers and handles
//! - **transaction**: Transaction planning and grouped cancellation
//! - **engine**: The engine and its registries
//! - **command**: JSON commands and responses
//! - **events**: Job event delivery
//! - **fault**: Simulated I/O errors
//! - **checksums**: Checksum computation
//! - **config**: Engine configuration
//! - **logging**: Tracing subscriber setup

pub mod model;
pub mod error;
pub mod config;
pub mod logging;
pub mod fault;
pub mod volume;
pub mod bitmap;
pub mod image;
pub mod chain;
pub mod checksums;
pub mod events;
pub mod job;
pub mod transaction;
pub mod engine;
pub mod command;

// Re-export main types and functions
pub use model::{Extent, IoOperation, JobId, JobStatus, OnSourceError, SyncMode};
pub use error::{EngineError, ErrorClass, IoFault};
pub use config::EngineConfig;
pub use logging::{init_logging, LogFormat};
pub use fault::FaultRule;
pub use bitmap::{BitmapState, BitmapStatus};
pub use chain::{ChainLink, ChainReport};
pub use checksums::{compute_checksum, ChecksumAlgorithm, ChecksumValue};
pub use events::{Event, EventKind, EventSink, Subscription};
pub use job::{BackupRequest, JobHandle, JobInfo};
pub use transaction::{CompletionMode, TransactionAction};
pub use engine::BackupEngine;
pub use command::{execute, execute_json, Command, Response};
