//! Backup jobs.
//!
//! A job copies a copy set (the whole volume, or the dirty extents of its
//! bitmap) into a fresh target image, chunk by chunk, on its own worker
//! thread. Callers observe and steer it through a [`JobHandle`]:
//!
//! ```text
//! running --> completed
//!    |    --> failed      (I/O error, on_source_error = report)
//!    |    --> cancelled   (cancel)
//!    +-----> paused       (I/O error, on_source_error = stop)
//!              |  --> running    (resume, continues at the first uncopied chunk)
//!              +----> cancelled  (cancel)
//! ```
//!
//! Every exit path, a panicking worker included, releases the job's bitmap
//! before the terminal status is published. Only a completed job clears bits and appends its target to the
//! chain; failed and cancelled jobs leave every snapshotted bit dirty and
//! discard their target.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::bitmap::DirtyBitmap;
use crate::chain::{ChainEntry, TargetChain};
use crate::error::{EngineError, IoFault, Result};
use crate::events::{EventKind, EventSink};
use crate::image::{TargetImage, TargetRegistry};
use crate::model::{Extent, JobId, JobStatus, OnSourceError, SyncMode};
use crate::volume::Volume;

/// A request to back up one volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRequest {
    pub volume: String,
    pub target: String,
    pub sync_mode: SyncMode,
    /// Bitmap to consume; required for incremental backups
    #[serde(default)]
    pub bitmap: Option<String>,
    #[serde(default)]
    pub on_source_error: OnSourceError,
    /// Caller-chosen job id; a random one is assigned otherwise
    #[serde(default)]
    pub job_id: Option<JobId>,
}

impl BackupRequest {
    pub fn full(volume: &str, target: &str) -> Self {
        BackupRequest {
            volume: volume.to_string(),
            target: target.to_string(),
            sync_mode: SyncMode::Full,
            bitmap: None,
            on_source_error: OnSourceError::Report,
            job_id: None,
        }
    }

    pub fn incremental(volume: &str, target: &str, bitmap: &str) -> Self {
        BackupRequest {
            volume: volume.to_string(),
            target: target.to_string(),
            sync_mode: SyncMode::Incremental,
            bitmap: Some(bitmap.to_string()),
            on_source_error: OnSourceError::Report,
            job_id: None,
        }
    }

    pub fn with_job_id(mut self, id: &str) -> Self {
        self.job_id = Some(JobId::from(id));
        self
    }

    pub fn with_on_source_error(mut self, policy: OnSourceError) -> Self {
        self.on_source_error = policy;
        self
    }
}

/// Snapshot of a job's progress and state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobInfo {
    pub id: JobId,
    pub volume: String,
    pub target: String,
    pub sync_mode: SyncMode,
    pub bitmap: Option<String>,
    pub on_source_error: OnSourceError,
    pub status: JobStatus,
    pub bytes_copied: u64,
    pub bytes_total: u64,
    /// Last I/O error, kept while paused and after failure
    pub error: Option<IoFault>,
    /// Non-I/O failure reason, e.g. a chain that refused the target
    pub failure: Option<String>,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Notified once a job has published its terminal state.
pub(crate) trait JobObserver: Send + Sync {
    fn on_terminal(&self, job_id: &JobId, status: JobStatus);
}

#[derive(Debug)]
enum JobControl {
    Resume,
    Cancel,
}

#[derive(Debug)]
struct JobShared {
    info: Mutex<JobInfo>,
    changed: Condvar,
    cancel: AtomicBool,
}

/// Caller-side handle to a job. Cheap to clone.
#[derive(Debug, Clone)]
pub struct JobHandle {
    id: JobId,
    shared: Arc<JobShared>,
    control: Sender<JobControl>,
}

impl JobHandle {
    pub fn id(&self) -> &JobId {
        &self.id
    }

    pub fn info(&self) -> JobInfo {
        self.shared.info.lock().clone()
    }

    pub fn status(&self) -> JobStatus {
        self.shared.info.lock().status
    }

    /// Request cancellation.
    ///
    /// Returns false if the job had already reached a terminal state, in which
    /// case nothing changes. A true return guarantees the job ends cancelled.
    pub fn cancel(&self) -> bool {
        let info = self.shared.info.lock();
        if info.status.is_terminal() {
            return false;
        }
        self.shared.cancel.store(true, Ordering::SeqCst);
        let _ = self.control.send(JobControl::Cancel);
        debug!(job_id = %self.id, status = %info.status, "cancel requested");
        true
    }

    /// Resume a paused job.
    ///
    /// # Errors
    /// `JobNotPaused` unless the job is currently paused.
    pub fn resume(&self) -> Result<()> {
        let mut info = self.shared.info.lock();
        if info.status != JobStatus::Paused {
            return Err(EngineError::JobNotPaused {
                job_id: self.id.clone(),
                status: info.status,
            });
        }
        info.status = JobStatus::Running;
        info.error = None;
        self.shared.changed.notify_all();
        let _ = self.control.send(JobControl::Resume);
        debug!(job_id = %self.id, "resume requested");
        Ok(())
    }

    /// Block until the job is terminal.
    pub fn wait(&self) -> JobInfo {
        let mut info = self.shared.info.lock();
        while !info.status.is_terminal() {
            self.shared.changed.wait(&mut info);
        }
        info.clone()
    }

    /// Block until `pred` holds for the job's status, or `timeout` passes.
    pub fn wait_until(
        &self,
        timeout: Duration,
        pred: impl Fn(JobStatus) -> bool,
    ) -> Option<JobInfo> {
        let deadline = std::time::Instant::now() + timeout;
        let mut info = self.shared.info.lock();
        while !pred(info.status) {
            if self.shared.changed.wait_until(&mut info, deadline).timed_out() {
                return pred(info.status).then(|| info.clone());
            }
        }
        Some(info.clone())
    }
}

/// Everything a job needs, resolved and validated by the engine.
///
/// When `bitmap` is set it has already been acquired and `snapshot` holds the
/// extents it reported; the job owns the release from then on.
pub(crate) struct JobSetup {
    pub id: JobId,
    pub request: BackupRequest,
    pub volume: Arc<Volume>,
    pub target: Arc<TargetImage>,
    pub bitmap: Option<Arc<DirtyBitmap>>,
    pub snapshot: Vec<Extent>,
    pub chain: Option<Arc<Mutex<TargetChain>>>,
    /// Start a new chain instead of backing onto the current tip
    pub anchor: bool,
    pub cluster_size: u64,
    pub events: Arc<dyn EventSink>,
    pub targets: Arc<TargetRegistry>,
}

enum PassOutcome {
    Done,
    Cancelled,
    Error(IoFault),
}

enum Finish {
    Completed,
    Failed(Option<IoFault>, String),
    Cancelled,
}

/// The worker side of a job.
pub(crate) struct BackupJob {
    id: JobId,
    shared: Arc<JobShared>,
    control: Receiver<JobControl>,
    volume: Arc<Volume>,
    target: Arc<TargetImage>,
    bitmap: Option<Arc<DirtyBitmap>>,
    snapshot: Vec<Extent>,
    chunks: Vec<Extent>,
    next_chunk: usize,
    chain: Option<Arc<Mutex<TargetChain>>>,
    anchor: bool,
    sync_mode: SyncMode,
    on_source_error: OnSourceError,
    events: Arc<dyn EventSink>,
    targets: Arc<TargetRegistry>,
    observers: Vec<Arc<dyn JobObserver>>,
}

impl BackupJob {
    /// Build a job and its handle. Nothing runs until [`BackupJob::spawn`].
    pub(crate) fn new(setup: JobSetup) -> (BackupJob, JobHandle) {
        let copy_set = match setup.request.sync_mode {
            SyncMode::Full => vec![Extent::new(0, setup.volume.size())],
            SyncMode::Incremental => setup.snapshot.clone(),
        };
        let chunks: Vec<Extent> = copy_set
            .iter()
            .flat_map(|extent| extent.chunks(setup.cluster_size))
            .collect();
        let bytes_total = chunks.iter().map(|c| c.len).sum();

        let info = JobInfo {
            id: setup.id.clone(),
            volume: setup.request.volume.clone(),
            target: setup.request.target.clone(),
            sync_mode: setup.request.sync_mode,
            bitmap: setup.request.bitmap.clone(),
            on_source_error: setup.request.on_source_error,
            status: JobStatus::Running,
            bytes_copied: 0,
            bytes_total,
            error: None,
            failure: None,
            created_at: Utc::now(),
            ended_at: None,
        };
        let shared = Arc::new(JobShared {
            info: Mutex::new(info),
            changed: Condvar::new(),
            cancel: AtomicBool::new(false),
        });
        let (tx, rx) = unbounded();

        let handle = JobHandle {
            id: setup.id.clone(),
            shared: Arc::clone(&shared),
            control: tx,
        };
        let job = BackupJob {
            id: setup.id,
            shared,
            control: rx,
            volume: setup.volume,
            target: setup.target,
            bitmap: setup.bitmap,
            snapshot: setup.snapshot,
            chunks,
            next_chunk: 0,
            chain: setup.chain,
            anchor: setup.anchor,
            sync_mode: setup.request.sync_mode,
            on_source_error: setup.request.on_source_error,
            events: setup.events,
            targets: setup.targets,
            observers: Vec::new(),
        };
        (job, handle)
    }

    pub(crate) fn add_observer(&mut self, observer: Arc<dyn JobObserver>) {
        self.observers.push(observer);
    }

    /// Start the worker thread.
    pub(crate) fn spawn(self) {
        info!(
            job_id = %self.id,
            volume = self.volume.id(),
            target_name = self.target.name(),
            sync_mode = %self.sync_mode,
            chunks = self.chunks.len(),
            "backup job started"
        );
        self.events.emit(EventKind::JobStatusChange {
            job_id: self.id.clone(),
            status: JobStatus::Running,
        });
        thread::spawn(move || self.run());
    }

    fn run(mut self) {
        let finish = match panic::catch_unwind(AssertUnwindSafe(|| self.drive())) {
            Ok(finish) => finish,
            Err(_) => {
                error!(job_id = %self.id, next_chunk = self.next_chunk, "backup worker panicked");
                Finish::Failed(None, "backup worker panicked".to_string())
            }
        };
        self.finish(finish);
    }

    fn drive(&mut self) -> Finish {
        loop {
            match self.copy_pass() {
                PassOutcome::Done => return Finish::Completed,
                PassOutcome::Cancelled => return Finish::Cancelled,
                PassOutcome::Error(fault) => match self.on_source_error {
                    OnSourceError::Report => {
                        let reason = fault.to_string();
                        return Finish::Failed(Some(fault), reason);
                    }
                    OnSourceError::Stop => {
                        if !self.pause(fault) {
                            return Finish::Cancelled;
                        }
                    }
                },
            }
        }
    }

    /// Copy chunks from the first uncopied one onward.
    fn copy_pass(&mut self) -> PassOutcome {
        while let Some(chunk) = self.chunks.get(self.next_chunk).copied() {
            if self.shared.cancel.load(Ordering::SeqCst) {
                return PassOutcome::Cancelled;
            }

            let mut buf = vec![0u8; chunk.len as usize];
            if let Err(fault) = self.volume.read_at(chunk.offset, &mut buf) {
                return PassOutcome::Error(fault);
            }
            if let Err(fault) = self.target.write_chunk(chunk.offset, &buf) {
                return PassOutcome::Error(fault);
            }

            self.next_chunk += 1;
            self.shared.info.lock().bytes_copied += chunk.len;
        }
        PassOutcome::Done
    }

    /// Suspend after an error until resumed (true) or cancelled (false).
    fn pause(&mut self, fault: IoFault) -> bool {
        {
            let mut info = self.shared.info.lock();
            if self.shared.cancel.load(Ordering::SeqCst) {
                return false;
            }
            warn!(
                job_id = %self.id,
                operation = %fault.operation,
                device = %fault.device,
                errno = fault.errno,
                next_chunk = self.next_chunk,
                "backup job paused on I/O error"
            );
            // Emitted before a resume can be accepted
            self.events.emit(EventKind::JobError {
                job_id: self.id.clone(),
                action: OnSourceError::Stop,
                operation: fault.operation,
                errno: fault.errno,
            });
            self.events.emit(EventKind::JobStatusChange {
                job_id: self.id.clone(),
                status: JobStatus::Paused,
            });
            info.status = JobStatus::Paused;
            info.error = Some(fault);
            self.shared.changed.notify_all();
        }

        match self.control.recv() {
            Ok(JobControl::Resume) => {
                info!(job_id = %self.id, next_chunk = self.next_chunk, "backup job resumed");
                self.events.emit(EventKind::JobStatusChange {
                    job_id: self.id.clone(),
                    status: JobStatus::Running,
                });
                true
            }
            Ok(JobControl::Cancel) | Err(_) => false,
        }
    }

    /// Commit or roll back, then publish the terminal state.
    ///
    /// Terminal events go out before waiters are woken, so anyone who saw the
    /// terminal status can also see the event.
    fn finish(self, finish: Finish) {
        let status = {
            let mut info = self.shared.info.lock();
            let finish = if self.shared.cancel.load(Ordering::SeqCst) {
                Finish::Cancelled
            } else {
                finish
            };
            let finish = match finish {
                Finish::Completed => match self.commit() {
                    Ok(()) => Finish::Completed,
                    Err(e) => Finish::Failed(None, e.to_string()),
                },
                other => other,
            };

            if let Some(bitmap) = &self.bitmap {
                bitmap.release();
            }
            let status = match finish {
                Finish::Completed => JobStatus::Completed,
                Finish::Failed(fault, reason) => {
                    self.targets.discard(self.target.name());
                    info.error = fault;
                    info.failure = Some(reason);
                    JobStatus::Failed
                }
                Finish::Cancelled => {
                    self.targets.discard(self.target.name());
                    JobStatus::Cancelled
                }
            };
            info.status = status;
            info.ended_at = Some(Utc::now());
            self.publish(&info);
            self.shared.changed.notify_all();
            status
        };

        for observer in &self.observers {
            observer.on_terminal(&self.id, status);
        }
    }

    /// Clear copied bits and append the target to its chain.
    ///
    /// Runs under the job's info lock, so a cancel either lands before this
    /// (and the job never commits) or finds the job already terminal.
    fn commit(&self) -> Result<()> {
        if let Some(chain) = &self.chain {
            let mut chain = chain.lock();
            let backing = if self.anchor {
                None
            } else {
                match chain.tip() {
                    Some(tip) => Some(tip.to_string()),
                    None => {
                        return Err(EngineError::invalid(
                            "chain lost its anchor while the backup was running",
                        ))
                    }
                }
            };
            chain.append(ChainEntry {
                target: Arc::clone(&self.target),
                backing,
                sync_mode: self.sync_mode,
                job_id: self.id.clone(),
                created_at: Utc::now(),
            })?;
        }
        if let Some(bitmap) = &self.bitmap {
            bitmap.clear(&self.snapshot);
        }
        Ok(())
    }

    fn publish(&self, info: &JobInfo) {
        let job_id = self.id.clone();
        match info.status {
            JobStatus::Completed => {
                info!(job_id = %job_id, bytes = info.bytes_copied, "backup job completed");
            }
            JobStatus::Failed => {
                warn!(job_id = %job_id, failure = ?info.failure, "backup job failed");
                if let Some(fault) = &info.error {
                    self.events.emit(EventKind::JobError {
                        job_id: job_id.clone(),
                        action: OnSourceError::Report,
                        operation: fault.operation,
                        errno: fault.errno,
                    });
                }
            }
            _ => {
                info!(job_id = %job_id, bytes = info.bytes_copied, "backup job cancelled");
            }
        }

        self.events.emit(EventKind::JobStatusChange {
            job_id: job_id.clone(),
            status: info.status,
        });
        let terminal = match info.status {
            JobStatus::Cancelled => EventKind::JobCancelled {
                job_id,
                offset: info.bytes_copied,
                len: info.bytes_total,
            },
            _ => EventKind::JobCompleted {
                job_id,
                offset: info.bytes_copied,
                len: if info.status == JobStatus::Completed {
                    info.bytes_copied
                } else {
                    info.bytes_total
                },
                error: info.failure.clone(),
            },
        };
        self.events.emit(terminal);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::{FaultRegistry, FaultRule};
    use crate::model::IoOperation;

    const KIB: u64 = 1024;
    const SIZE: u64 = 1024 * KIB;
    const CLUSTER: u64 = 64 * KIB;

    // Test helper: records every event in order
    #[derive(Default)]
    struct RecordingSink {
        events: Mutex<Vec<EventKind>>,
    }

    impl RecordingSink {
        fn events(&self) -> Vec<EventKind> {
            self.events.lock().clone()
        }
    }

    impl EventSink for RecordingSink {
        fn emit(&self, kind: EventKind) {
            self.events.lock().push(kind);
        }
    }

    // Test helper: panics on the first job_error, records everything else
    struct PanickingSink {
        armed: AtomicBool,
        inner: RecordingSink,
    }

    impl EventSink for PanickingSink {
        fn emit(&self, kind: EventKind) {
            if matches!(kind, EventKind::JobError { .. }) && self.armed.swap(false, Ordering::SeqCst) {
                panic!("event sink failure");
            }
            self.inner.emit(kind);
        }
    }

    struct Fixture {
        faults: Arc<FaultRegistry>,
        volume: Arc<Volume>,
        bitmap: Arc<DirtyBitmap>,
        chain: Arc<Mutex<TargetChain>>,
        targets: Arc<TargetRegistry>,
        sink: Arc<RecordingSink>,
    }

    impl Fixture {
        fn new() -> Self {
            let faults = Arc::new(FaultRegistry::new());
            let volume = Arc::new(Volume::new("drive0", SIZE, Arc::clone(&faults)).unwrap());
            let bitmap =
                Arc::new(DirtyBitmap::create("drive0", SIZE, "bitmap0", CLUSTER, false).unwrap());
            volume.attach_bitmap(Arc::clone(&bitmap)).unwrap();
            Fixture {
                faults,
                volume,
                bitmap,
                chain: Arc::new(Mutex::new(TargetChain::new("drive0", "bitmap0"))),
                targets: Arc::new(TargetRegistry::new()),
                sink: Arc::new(RecordingSink::default()),
            }
        }

        fn start(&self, request: BackupRequest, anchor: bool) -> JobHandle {
            self.start_with(request, anchor, self.sink.clone())
        }

        fn start_with(
            &self,
            request: BackupRequest,
            anchor: bool,
            events: Arc<dyn EventSink>,
        ) -> JobHandle {
            let (bitmap, snapshot) = if request.bitmap.is_some() {
                let snapshot = self.bitmap.acquire_for_job().unwrap();
                (Some(Arc::clone(&self.bitmap)), snapshot)
            } else {
                (None, Vec::new())
            };
            let target = self
                .targets
                .create(&request.target, SIZE, Arc::clone(&self.faults))
                .unwrap();
            let (job, handle) = BackupJob::new(JobSetup {
                id: request.job_id.clone().unwrap_or_else(JobId::generate),
                request,
                volume: Arc::clone(&self.volume),
                target,
                bitmap,
                snapshot,
                chain: Some(Arc::clone(&self.chain)),
                anchor,
                cluster_size: CLUSTER,
                events,
                targets: Arc::clone(&self.targets),
            });
            job.spawn();
            handle
        }

        fn anchor(&self) {
            let mut request = BackupRequest::full("drive0", "full").with_job_id("anchor");
            request.bitmap = Some("bitmap0".to_string());
            let info = self.start(request, true).wait();
            assert_eq!(info.status, JobStatus::Completed);
        }

        fn validate(&self) -> bool {
            let chain = self.chain.lock();
            chain.reconstruct(SIZE) == self.volume.contents()
        }
    }

    #[test]
    fn test_full_backup_copies_whole_volume() {
        let fx = Fixture::new();
        fx.volume.fill(0, 4 * KIB, 0x11).unwrap();
        fx.volume.fill(512 * KIB, 4 * KIB, 0x22).unwrap();

        fx.anchor();

        assert_eq!(fx.bitmap.dirty_count(), 0);
        assert!(!fx.bitmap.is_busy());
        assert_eq!(fx.chain.lock().tip(), Some("full"));
        assert!(fx.validate());
    }

    #[test]
    fn test_incremental_copies_only_dirty_ranges() {
        let fx = Fixture::new();
        fx.anchor();

        fx.volume.fill(0, 512, 0xab).unwrap();
        fx.volume.fill(256 * KIB, 128 * KIB, 0xcd).unwrap();
        assert_eq!(fx.bitmap.dirty_count(), 3 * CLUSTER);

        let handle = fx.start(BackupRequest::incremental("drive0", "inc0", "bitmap0"), false);
        let info = handle.wait();

        assert_eq!(info.status, JobStatus::Completed);
        assert_eq!(info.bytes_copied, 3 * CLUSTER);
        assert_eq!(info.bytes_total, 3 * CLUSTER);
        assert_eq!(fx.bitmap.dirty_count(), 0);
        assert!(!fx.bitmap.is_busy());

        let chain = fx.chain.lock();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain.entries()[1].backing.as_deref(), Some("full"));
        drop(chain);
        assert!(fx.validate());
    }

    #[test]
    fn test_hollow_incremental_completes_with_zero_bytes() {
        let fx = Fixture::new();
        fx.anchor();

        let handle = fx.start(
            BackupRequest::incremental("drive0", "inc0", "bitmap0").with_job_id("hollow"),
            false,
        );
        let info = handle.wait();
        assert_eq!(info.status, JobStatus::Completed);
        assert_eq!(info.bytes_copied, 0);
        assert_eq!(fx.chain.lock().tip(), Some("inc0"));
        assert!(fx.validate());

        let events = fx.sink.events();
        assert!(events.contains(&EventKind::JobCompleted {
            job_id: JobId::from("hollow"),
            offset: 0,
            len: 0,
            error: None,
        }));
    }

    #[test]
    fn test_report_policy_fails_and_keeps_bits() {
        let fx = Fixture::new();
        fx.anchor();
        fx.volume.fill(0, CLUSTER, 1).unwrap();
        fx.volume.fill(512 * KIB, CLUSTER, 2).unwrap();
        fx.faults.inject(
            "drive0",
            FaultRule::once(IoOperation::Read, Extent::new(512 * KIB, 512)),
        );

        let handle = fx.start(
            BackupRequest::incremental("drive0", "inc0", "bitmap0").with_job_id("failing"),
            false,
        );
        let info = handle.wait();

        assert_eq!(info.status, JobStatus::Failed);
        assert_eq!(info.error.as_ref().map(|e| e.operation), Some(IoOperation::Read));
        assert_eq!(info.bytes_copied, CLUSTER);
        assert!(!fx.bitmap.is_busy());
        assert_eq!(fx.bitmap.dirty_count(), 2 * CLUSTER);
        assert_eq!(fx.chain.lock().tip(), Some("full"));
        assert!(fx.targets.get("inc0").is_none());

        let events = fx.sink.events();
        let failing = JobId::from("failing");
        assert!(events.contains(&EventKind::JobError {
            job_id: failing.clone(),
            action: OnSourceError::Report,
            operation: IoOperation::Read,
            errno: 5,
        }));
        let terminal: Vec<_> = events
            .iter()
            .filter(|e| e.job_id() == &failing && e.is_terminal())
            .collect();
        assert_eq!(terminal.len(), 1);
        assert!(matches!(terminal[0], EventKind::JobCompleted { error: Some(_), .. }));
    }

    #[test]
    fn test_stop_policy_pauses_and_resumes_where_it_stopped() {
        let fx = Fixture::new();
        fx.anchor();
        fx.volume.fill(0, CLUSTER, 1).unwrap();
        fx.volume.fill(256 * KIB, CLUSTER, 2).unwrap();
        fx.volume.fill(768 * KIB, CLUSTER, 3).unwrap();
        fx.faults.inject(
            "drive0",
            FaultRule::once(IoOperation::Read, Extent::new(256 * KIB, 1)),
        );

        let handle = fx.start(
            BackupRequest::incremental("drive0", "inc0", "bitmap0")
                .with_on_source_error(OnSourceError::Stop),
            false,
        );
        let paused = handle
            .wait_until(Duration::from_secs(5), |s| s == JobStatus::Paused)
            .expect("job should pause");
        assert_eq!(paused.bytes_copied, CLUSTER);
        assert!(fx.bitmap.is_busy());
        assert_eq!(fx.bitmap.dirty_count(), 3 * CLUSTER);

        handle.resume().unwrap();
        assert!(matches!(
            handle.resume(),
            Err(EngineError::JobNotPaused { .. })
        ));
        let info = handle.wait();

        assert_eq!(info.status, JobStatus::Completed);
        assert_eq!(info.bytes_copied, 3 * CLUSTER);
        assert_eq!(fx.bitmap.dirty_count(), 0);
        assert!(!fx.bitmap.is_busy());
        assert!(fx.validate());
    }

    #[test]
    fn test_cancel_while_paused_keeps_bits_and_discards_target() {
        let fx = Fixture::new();
        fx.anchor();
        fx.volume.fill(0, CLUSTER, 1).unwrap();
        fx.faults.inject("inc0", FaultRule::always(IoOperation::Write));

        let handle = fx.start(
            BackupRequest::incremental("drive0", "inc0", "bitmap0")
                .with_on_source_error(OnSourceError::Stop)
                .with_job_id("paused"),
            false,
        );
        handle
            .wait_until(Duration::from_secs(5), |s| s == JobStatus::Paused)
            .expect("job should pause");

        assert!(handle.cancel());
        let info = handle.wait();
        assert_eq!(info.status, JobStatus::Cancelled);
        assert!(!fx.bitmap.is_busy());
        assert_eq!(fx.bitmap.dirty_count(), CLUSTER);
        assert!(fx.targets.get("inc0").is_none());
        assert_eq!(fx.chain.lock().tip(), Some("full"));

        let events = fx.sink.events();
        assert!(events.iter().any(|e| matches!(
            e,
            EventKind::JobError { action: OnSourceError::Stop, operation: IoOperation::Write, .. }
        )));
        assert!(events
            .iter()
            .any(|e| matches!(e, EventKind::JobCancelled { job_id, .. } if job_id.as_str() == "paused")));
    }

    #[test]
    fn test_cancel_after_completion_is_noop() {
        let fx = Fixture::new();
        fx.anchor();
        let handle = fx.start(BackupRequest::incremental("drive0", "inc0", "bitmap0"), false);
        handle.wait();

        assert!(!handle.cancel());
        assert_eq!(handle.status(), JobStatus::Completed);
        assert!(matches!(
            handle.resume(),
            Err(EngineError::JobNotPaused { .. })
        ));
    }

    #[test]
    fn test_write_during_backup_stays_dirty() {
        let fx = Fixture::new();
        fx.anchor();
        fx.volume.fill(0, CLUSTER, 1).unwrap();
        fx.faults.inject(
            "drive0",
            FaultRule::once(IoOperation::Read, Extent::new(0, 1)),
        );

        let handle = fx.start(
            BackupRequest::incremental("drive0", "inc0", "bitmap0")
                .with_on_source_error(OnSourceError::Stop),
            false,
        );
        handle
            .wait_until(Duration::from_secs(5), |s| s == JobStatus::Paused)
            .expect("job should pause");

        // Lands after the snapshot, before the clear
        fx.volume.fill(100, 10, 9).unwrap();
        handle.resume().unwrap();
        assert_eq!(handle.wait().status, JobStatus::Completed);

        assert_eq!(fx.bitmap.dirty_extents(), vec![Extent::new(0, CLUSTER)]);
    }

    #[test]
    fn test_fault_at_end_of_address_space_does_not_stall_job() {
        let fx = Fixture::new();
        fx.anchor();
        fx.volume.fill(0, CLUSTER, 1).unwrap();
        fx.faults.inject(
            "drive0",
            FaultRule::once(IoOperation::Read, Extent::new(u64::MAX - 1, 10)),
        );

        let handle = fx.start(BackupRequest::incremental("drive0", "inc0", "bitmap0"), false);
        let info = handle
            .wait_until(Duration::from_secs(5), |s| s.is_terminal())
            .expect("job should finish");

        assert_eq!(info.status, JobStatus::Completed);
        assert_eq!(info.bytes_copied, CLUSTER);
        assert!(!fx.bitmap.is_busy());
        assert!(fx.validate());
    }

    #[test]
    fn test_worker_panic_fails_job_and_releases_bitmap() {
        let fx = Fixture::new();
        fx.anchor();
        fx.volume.fill(0, CLUSTER, 1).unwrap();
        fx.faults.inject(
            "drive0",
            FaultRule::once(IoOperation::Read, Extent::new(0, 1)),
        );
        let sink = Arc::new(PanickingSink {
            armed: AtomicBool::new(true),
            inner: RecordingSink::default(),
        });

        let handle = fx.start_with(
            BackupRequest::incremental("drive0", "inc0", "bitmap0")
                .with_on_source_error(OnSourceError::Stop)
                .with_job_id("crashed"),
            false,
            sink.clone(),
        );
        let info = handle
            .wait_until(Duration::from_secs(5), |s| s.is_terminal())
            .expect("job should finish");

        assert_eq!(info.status, JobStatus::Failed);
        assert!(info.failure.is_some());
        assert!(!fx.bitmap.is_busy());
        assert_eq!(fx.bitmap.dirty_count(), CLUSTER);
        assert!(fx.targets.get("inc0").is_none());
        assert_eq!(fx.chain.lock().tip(), Some("full"));
        assert!(sink.inner.events().iter().any(|e| matches!(
            e,
            EventKind::JobCompleted { job_id, error: Some(_), .. } if job_id.as_str() == "crashed"
        )));
    }
}
