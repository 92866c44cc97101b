//! The backup engine: volumes, bitmaps, chains, targets and jobs.
//!
//! [`BackupEngine`] owns every registry and exposes the command surface.
//! Requests that create jobs or change a bitmap's lifecycle are admitted one
//! at a time, so validation and bitmap acquisition cannot interleave. Volume
//! writes and job progress never wait for admission.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::bitmap::{BitmapStatus, DirtyBitmap};
use crate::chain::{ChainReport, TargetChain};
use crate::checksums::ChecksumAlgorithm;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::events::{EventChannel, Subscription};
use crate::fault::{FaultRegistry, FaultRule};
use crate::image::TargetRegistry;
use crate::job::{BackupJob, BackupRequest, JobHandle, JobInfo, JobObserver, JobSetup};
use crate::model::{Extent, JobId, JobStatus, SyncMode};
use crate::transaction::{self, CompletionMode, GroupCoordinator, PlannedBackup, TransactionAction};
use crate::volume::Volume;

type ChainKey = (String, String);

/// A backup whose names are resolved and whose bitmap is held.
struct Prepared {
    id: JobId,
    planned: PlannedBackup,
    volume: Arc<Volume>,
    bitmap: Option<Arc<DirtyBitmap>>,
    snapshot: Vec<Extent>,
    chain: Option<Arc<Mutex<TargetChain>>>,
}

pub struct BackupEngine {
    config: EngineConfig,
    volumes: RwLock<HashMap<String, Arc<Volume>>>,
    chains: Mutex<HashMap<ChainKey, Arc<Mutex<TargetChain>>>>,
    targets: Arc<TargetRegistry>,
    jobs: RwLock<HashMap<JobId, JobHandle>>,
    faults: Arc<FaultRegistry>,
    events: Arc<EventChannel>,
    admission: Mutex<()>,
}

impl BackupEngine {
    /// Create an engine with a validated configuration.
    ///
    /// # Errors
    /// `InvalidConfig` if `config` does not validate.
    pub fn new(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        info!(
            cluster_size = config.cluster_size,
            default_granularity = config.default_granularity,
            max_jobs = ?config.max_jobs,
            "backup engine created"
        );
        Ok(BackupEngine {
            config,
            volumes: RwLock::new(HashMap::new()),
            chains: Mutex::new(HashMap::new()),
            targets: Arc::new(TargetRegistry::new()),
            jobs: RwLock::new(HashMap::new()),
            faults: Arc::new(FaultRegistry::new()),
            events: Arc::new(EventChannel::new()),
            admission: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Receive every event emitted from now on.
    pub fn subscribe(&self) -> Subscription {
        self.events.subscribe()
    }

    // Volumes

    /// Register a zero-filled volume.
    ///
    /// # Errors
    /// `VolumeExists` for a taken id, `InvalidRequest` for an empty id or a
    /// size that cannot be allocated.
    pub fn add_volume(&self, id: &str, size: u64) -> Result<()> {
        if id.is_empty() {
            return Err(EngineError::invalid("volume id must not be empty"));
        }
        let mut volumes = self.volumes.write();
        if volumes.contains_key(id) {
            return Err(EngineError::VolumeExists {
                volume: id.to_string(),
            });
        }
        let volume = Volume::new(id, size, Arc::clone(&self.faults))?;
        volumes.insert(id.to_string(), Arc::new(volume));
        info!(volume = id, size, "volume added");
        Ok(())
    }

    /// Remove a volume together with its bitmaps and their chains.
    ///
    /// # Errors
    /// `InvalidRequest` while a job on the volume is not terminal.
    pub fn remove_volume(&self, id: &str) -> Result<()> {
        let _admission = self.admission.lock();
        self.volume(id)?;
        if self.active_jobs().iter().any(|info| info.volume == id) {
            return Err(EngineError::invalid(format!(
                "volume '{}' has running backup jobs",
                id
            )));
        }
        self.volumes.write().remove(id);
        self.chains.lock().retain(|(volume, _), _| volume != id);
        self.faults.clear(id);
        info!(volume = id, "volume removed");
        Ok(())
    }

    pub fn write_volume(&self, id: &str, offset: u64, data: &[u8]) -> Result<()> {
        self.volume(id)?.write_at(offset, data)
    }

    pub fn fill_volume(&self, id: &str, offset: u64, len: u64, pattern: u8) -> Result<()> {
        self.volume(id)?.fill(offset, len, pattern)
    }

    pub fn read_volume(&self, id: &str, offset: u64, len: u64) -> Result<Vec<u8>> {
        let volume = self.volume(id)?;
        let size = volume.size();
        if offset.checked_add(len).map_or(true, |end| end > size) {
            return Err(EngineError::OutOfRange {
                volume: id.to_string(),
                offset,
                len,
                size,
            });
        }
        let mut buf = vec![0u8; len as usize];
        volume.read_at(offset, &mut buf)?;
        Ok(buf)
    }

    fn volume(&self, id: &str) -> Result<Arc<Volume>> {
        self.volumes
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::VolumeNotFound {
                volume: id.to_string(),
            })
    }

    // Bitmaps

    /// Create a clear, recording bitmap on `volume`.
    ///
    /// # Arguments
    /// * `granularity` - Bytes per bit; the configured default when `None`
    /// * `persistent` - Metadata flag reported by queries
    ///
    /// # Errors
    /// `InvalidGranularity` unless the granularity is a power of two,
    /// `BitmapExists` if the name is taken on the volume.
    pub fn create_bitmap(
        &self,
        volume: &str,
        name: &str,
        granularity: Option<u64>,
        persistent: bool,
    ) -> Result<()> {
        let _admission = self.admission.lock();
        let vol = self.volume(volume)?;
        let granularity = granularity.unwrap_or(self.config.default_granularity);
        let bitmap = DirtyBitmap::create(volume, vol.size(), name, granularity, persistent)?;
        vol.attach_bitmap(Arc::new(bitmap))?;
        self.chains.lock().insert(
            (volume.to_string(), name.to_string()),
            Arc::new(Mutex::new(TargetChain::new(volume, name))),
        );
        info!(volume, bitmap = name, granularity, persistent, "bitmap created");
        Ok(())
    }

    /// Delete a bitmap and forget its chain.
    ///
    /// # Errors
    /// `BitmapBusy` while a job holds it.
    pub fn remove_bitmap(&self, volume: &str, name: &str) -> Result<()> {
        let _admission = self.admission.lock();
        let vol = self.volume(volume)?;
        let bitmap = vol.bitmap(name)?;
        if bitmap.is_busy() {
            return Err(EngineError::BitmapBusy {
                volume: volume.to_string(),
                name: name.to_string(),
            });
        }
        vol.detach_bitmap(name);
        self.chains
            .lock()
            .remove(&(volume.to_string(), name.to_string()));
        info!(volume, bitmap = name, "bitmap removed");
        Ok(())
    }

    /// Clear every bit. The bitmap's chain no longer describes the volume, so
    /// it is dropped; the next incremental needs a new anchor.
    ///
    /// # Errors
    /// `BitmapBusy` while a job holds it.
    pub fn clear_bitmap(&self, volume: &str, name: &str) -> Result<()> {
        let _admission = self.admission.lock();
        self.clear_bitmap_locked(volume, name)
    }

    fn clear_bitmap_locked(&self, volume: &str, name: &str) -> Result<()> {
        let bitmap = self.volume(volume)?.bitmap(name)?;
        bitmap.reset()?;
        self.chain(volume, name).lock().clear();
        info!(volume, bitmap = name, "bitmap cleared");
        Ok(())
    }

    pub fn enable_bitmap(&self, volume: &str, name: &str) -> Result<()> {
        self.set_recording(volume, name, true)
    }

    /// Stop recording writes. Writes made while disabled are never backed
    /// up by an incremental.
    pub fn disable_bitmap(&self, volume: &str, name: &str) -> Result<()> {
        self.set_recording(volume, name, false)
    }

    fn set_recording(&self, volume: &str, name: &str, recording: bool) -> Result<()> {
        let _admission = self.admission.lock();
        self.volume(volume)?.bitmap(name)?.set_recording(recording)?;
        info!(volume, bitmap = name, recording, "bitmap recording changed");
        Ok(())
    }

    pub fn query_bitmap(&self, volume: &str, name: &str) -> Result<BitmapStatus> {
        Ok(self.volume(volume)?.bitmap(name)?.status())
    }

    pub fn query_bitmaps(&self, volume: &str) -> Result<Vec<BitmapStatus>> {
        Ok(self
            .volume(volume)?
            .bitmaps()
            .iter()
            .map(|b| b.status())
            .collect())
    }

    fn chain(&self, volume: &str, name: &str) -> Arc<Mutex<TargetChain>> {
        let mut chains = self.chains.lock();
        let chain = chains
            .entry((volume.to_string(), name.to_string()))
            .or_insert_with(|| Arc::new(Mutex::new(TargetChain::new(volume, name))));
        Arc::clone(chain)
    }

    // Jobs

    /// Start one backup job.
    ///
    /// Everything is checked before the job exists: an error here means no
    /// job was created, no target allocated and no bitmap held.
    ///
    /// # Errors
    /// `BitmapNotFound` / `BitmapBusy` for the incremental's bitmap,
    /// `GenericError` classes for unknown volumes, taken names, a chain
    /// without an anchor, or a full backup naming a bitmap.
    pub fn start_backup(&self, request: BackupRequest) -> Result<JobId> {
        transaction::check_request(&request)?;
        let _admission = self.admission.lock();
        self.check_capacity(1)?;

        let planned = PlannedBackup {
            bitmap: request.bitmap.clone(),
            request,
            anchor: false,
        };
        let prepared = self.prepare(planned, &mut Vec::new())?;
        let mut created = self.create_jobs(vec![prepared])?;
        let (job, handle) = created.remove(0);
        let id = handle.id().clone();
        self.jobs.write().insert(id.clone(), handle);
        job.spawn();
        Ok(id)
    }

    /// Start a transaction's backups together, all or nothing.
    ///
    /// # Errors
    /// Any error that `start_backup` would raise for a member, plus
    /// `BitmapBusy` when two actions reference the same bitmap. On error
    /// nothing was cleared and no job was created.
    pub fn start_transaction(
        &self,
        actions: &[TransactionAction],
        completion_mode: CompletionMode,
    ) -> Result<Vec<JobId>> {
        let plan = transaction::plan(actions)?;
        let _admission = self.admission.lock();
        self.check_capacity(plan.backups.len())?;

        // Standalone clears must not fail once jobs exist
        for (volume, name) in &plan.clears {
            let bitmap = self.volume(volume)?.bitmap(name)?;
            if bitmap.is_busy() {
                return Err(EngineError::BitmapBusy {
                    volume: volume.clone(),
                    name: name.clone(),
                });
            }
        }

        let mut acquired: Vec<Arc<DirtyBitmap>> = Vec::new();
        let mut prepared = Vec::with_capacity(plan.backups.len());
        for planned in plan.backups {
            match self.prepare(planned, &mut acquired) {
                Ok(p) => prepared.push(p),
                Err(e) => {
                    acquired.iter().for_each(|b| b.release());
                    return Err(e);
                }
            }
        }
        let created = self.create_jobs(prepared)?;

        for (volume, name) in &plan.clears {
            if let Err(e) = self.clear_bitmap_locked(volume, name) {
                warn!(volume = %volume, bitmap = %name, error = %e, "transaction clear failed");
            }
        }

        let handles: Vec<JobHandle> = created.iter().map(|(_, h)| h.clone()).collect();
        let ids: Vec<JobId> = handles.iter().map(|h| h.id().clone()).collect();
        let coordinator = GroupCoordinator::new(completion_mode, handles.clone());
        {
            let mut jobs = self.jobs.write();
            for handle in handles {
                jobs.insert(handle.id().clone(), handle);
            }
        }
        info!(jobs = ids.len(), mode = ?completion_mode, "transaction started");
        for (mut job, _) in created {
            job.add_observer(Arc::clone(&coordinator) as Arc<dyn JobObserver>);
            job.spawn();
        }
        Ok(ids)
    }

    /// Resolve one backup and take its bitmap. Bitmaps taken are pushed onto
    /// `acquired` so a failing caller can give them back.
    fn prepare(
        &self,
        planned: PlannedBackup,
        acquired: &mut Vec<Arc<DirtyBitmap>>,
    ) -> Result<Prepared> {
        let request = &planned.request;
        let id = request.job_id.clone().unwrap_or_else(JobId::generate);
        if self.jobs.read().contains_key(&id) {
            return Err(EngineError::JobExists { job_id: id });
        }
        if self.targets.get(&request.target).is_some() {
            return Err(EngineError::TargetExists {
                target: request.target.clone(),
            });
        }
        let volume = self.volume(&request.volume)?;

        let Some(name) = planned.bitmap.as_deref() else {
            return Ok(Prepared {
                id,
                volume,
                bitmap: None,
                snapshot: Vec::new(),
                chain: None,
                planned,
            });
        };

        let bitmap = volume.bitmap(name)?;
        let chain = self.chain(&request.volume, name);
        if request.sync_mode == SyncMode::Incremental && chain.lock().is_empty() {
            return Err(EngineError::invalid(format!(
                "bitmap '{}' on '{}' has no full backup to build on",
                name, request.volume
            )));
        }
        let snapshot = bitmap.acquire_for_job()?;
        acquired.push(Arc::clone(&bitmap));
        debug!(job_id = %id, bitmap = name, extents = snapshot.len(), "bitmap snapshot taken");

        Ok(Prepared {
            id,
            volume,
            bitmap: Some(bitmap),
            snapshot,
            chain: Some(chain),
            planned,
        })
    }

    /// Allocate targets and build (unstarted) jobs. On error every target
    /// created here is discarded and every bitmap released.
    fn create_jobs(&self, prepared: Vec<Prepared>) -> Result<Vec<(BackupJob, JobHandle)>> {
        let mut targets = Vec::with_capacity(prepared.len());
        for p in &prepared {
            let result = self.targets.create(
                &p.planned.request.target,
                p.volume.size(),
                Arc::clone(&self.faults),
            );
            match result {
                Ok(target) => targets.push(target),
                Err(e) => {
                    for target in &targets {
                        self.targets.discard(target.name());
                    }
                    for p in &prepared {
                        if let Some(bitmap) = &p.bitmap {
                            bitmap.release();
                        }
                    }
                    return Err(e);
                }
            }
        }

        Ok(prepared
            .into_iter()
            .zip(targets)
            .map(|(p, target)| {
                BackupJob::new(JobSetup {
                    id: p.id,
                    request: p.planned.request,
                    volume: p.volume,
                    target,
                    bitmap: p.bitmap,
                    snapshot: p.snapshot,
                    chain: p.chain,
                    anchor: p.planned.anchor,
                    cluster_size: self.config.cluster_size,
                    events: self.events.clone(),
                    targets: Arc::clone(&self.targets),
                })
            })
            .collect())
    }

    fn check_capacity(&self, new_jobs: usize) -> Result<()> {
        let Some(max) = self.config.max_jobs else {
            return Ok(());
        };
        let active = self.active_jobs().len();
        if active + new_jobs > max {
            warn!(active, new_jobs, max, "job limit reached");
            return Err(EngineError::invalid(format!(
                "{} active jobs, limit is {}",
                active, max
            )));
        }
        Ok(())
    }

    fn active_jobs(&self) -> Vec<JobInfo> {
        self.jobs
            .read()
            .values()
            .map(|h| h.info())
            .filter(|info| !info.status.is_terminal())
            .collect()
    }

    fn handle(&self, id: &JobId) -> Result<JobHandle> {
        self.jobs
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::JobNotFound { job_id: id.clone() })
    }

    /// Resume a job paused on an I/O error.
    ///
    /// # Errors
    /// `JobNotFound`, or `JobNotPaused` unless the job is paused.
    pub fn resume_job(&self, id: &JobId) -> Result<()> {
        self.handle(id)?.resume()
    }

    /// Cancel a job. Returns false, changing nothing, if it already finished.
    pub fn cancel_job(&self, id: &JobId) -> Result<bool> {
        Ok(self.handle(id)?.cancel())
    }

    pub fn query_job(&self, id: &JobId) -> Result<JobInfo> {
        Ok(self.handle(id)?.info())
    }

    /// Every known job, oldest first.
    pub fn query_jobs(&self) -> Vec<JobInfo> {
        let mut jobs: Vec<JobInfo> = self.jobs.read().values().map(|h| h.info()).collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        jobs
    }

    /// Block until the job is terminal.
    pub fn wait_job(&self, id: &JobId) -> Result<JobInfo> {
        Ok(self.handle(id)?.wait())
    }

    /// Block until the job reaches `status`; `None` on timeout.
    pub fn wait_job_status(
        &self,
        id: &JobId,
        status: JobStatus,
        timeout: Duration,
    ) -> Result<Option<JobInfo>> {
        Ok(self.handle(id)?.wait_until(timeout, |s| s == status))
    }

    /// Forget a finished job and free its id. Returns its final state.
    ///
    /// # Errors
    /// `JobNotFound`, or `InvalidRequest` while the job is not terminal.
    pub fn dismiss_job(&self, id: &JobId) -> Result<JobInfo> {
        let _admission = self.admission.lock();
        let mut jobs = self.jobs.write();
        let info = jobs
            .get(id)
            .map(|h| h.info())
            .ok_or_else(|| EngineError::JobNotFound { job_id: id.clone() })?;
        if !info.status.is_terminal() {
            return Err(EngineError::invalid(format!(
                "job '{}' is still {}",
                id, info.status
            )));
        }
        jobs.remove(id);
        debug!(job_id = %id, status = %info.status, "job dismissed");
        Ok(info)
    }

    // Targets, chains and faults

    /// Names of live targets.
    pub fn targets(&self) -> Vec<String> {
        self.targets.names()
    }

    /// Delete a target that is not part of any chain and not being written.
    pub fn remove_target(&self, name: &str) -> Result<()> {
        let _admission = self.admission.lock();
        if self.targets.get(name).is_none() {
            return Err(EngineError::TargetNotFound {
                target: name.to_string(),
            });
        }
        if self.active_jobs().iter().any(|info| info.target == name) {
            return Err(EngineError::invalid(format!(
                "target '{}' is being written by a job",
                name
            )));
        }
        let chains: Vec<_> = self.chains.lock().values().cloned().collect();
        if chains.iter().any(|c| c.lock().contains(name)) {
            return Err(EngineError::invalid(format!(
                "target '{}' is part of a backup chain",
                name
            )));
        }
        self.targets.discard(name);
        info!(target_name = name, "target removed");
        Ok(())
    }

    /// Replay the bitmap's chain and compare it with the live volume.
    pub fn validate_chain(
        &self,
        volume: &str,
        bitmap: &str,
        algorithm: ChecksumAlgorithm,
    ) -> Result<ChainReport> {
        let vol = self.volume(volume)?;
        vol.bitmap(bitmap)?;
        let chain = self.chain(volume, bitmap);
        let report = chain.lock().validate(&vol, algorithm)?;
        Ok(report)
    }

    pub fn inject_fault(&self, device: &str, rule: FaultRule) {
        self.faults.inject(device, rule);
    }

    pub fn clear_faults(&self, device: &str) {
        self.faults.clear(device);
    }
}
