//! Backup target chains.
//!
//! Each bitmap owns a [`TargetChain`]: an anchor (a full backup with no
//! backing parent) followed by incrementals, each backing onto the previous
//! entry. Replaying the chain from anchor to tip must reproduce the volume as
//! it was when the tip's job finished.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::checksums::{compute_checksum, ChecksumAlgorithm, ChecksumValue};
use crate::error::{EngineError, Result};
use crate::image::TargetImage;
use crate::model::{JobId, SyncMode};
use crate::volume::Volume;

/// One backup in a chain.
#[derive(Debug, Clone)]
pub struct ChainEntry {
    pub target: Arc<TargetImage>,
    /// Name of the entry this one backs onto; `None` for the anchor
    pub backing: Option<String>,
    pub sync_mode: SyncMode,
    pub job_id: JobId,
    pub created_at: DateTime<Utc>,
}

/// Serializable view of a chain entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainLink {
    pub target: String,
    pub backing: Option<String>,
    pub sync_mode: SyncMode,
    pub job_id: JobId,
    pub allocated_bytes: u64,
}

/// Outcome of replaying a chain against its live volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainReport {
    pub volume: String,
    pub bitmap: String,
    pub links: Vec<ChainLink>,
    pub reconstructed: ChecksumValue,
    pub live: ChecksumValue,
    pub matches: bool,
    /// First byte offset where the replay differs from the volume
    pub first_mismatch: Option<u64>,
}

#[derive(Debug)]
pub struct TargetChain {
    volume: String,
    bitmap: String,
    entries: Vec<ChainEntry>,
}

impl TargetChain {
    pub fn new(volume: &str, bitmap: &str) -> Self {
        TargetChain {
            volume: volume.to_string(),
            bitmap: bitmap.to_string(),
            entries: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[ChainEntry] {
        &self.entries
    }

    /// Name of the newest entry.
    pub fn tip(&self) -> Option<&str> {
        self.entries.last().map(|e| e.target.name())
    }

    pub fn contains(&self, target: &str) -> bool {
        self.entries.iter().any(|e| e.target.name() == target)
    }

    /// Add a completed backup.
    ///
    /// With `backing = None` the entry becomes a new anchor and any previous
    /// lineage is dropped. Otherwise `backing` must name the current tip.
    pub fn append(&mut self, entry: ChainEntry) -> Result<()> {
        match entry.backing.as_deref() {
            None => {
                if !self.entries.is_empty() {
                    info!(
                        bitmap = %self.bitmap,
                        dropped = self.entries.len(),
                        "chain re-anchored"
                    );
                }
                self.entries.clear();
            }
            Some(parent) if Some(parent) == self.tip() => {}
            Some(parent) => {
                return Err(EngineError::invalid(format!(
                    "target '{}' must back onto tip {:?} of chain '{}', not '{}'",
                    entry.target.name(),
                    self.tip(),
                    self.bitmap,
                    parent
                )));
            }
        }
        info!(
            bitmap = %self.bitmap,
            target_name = entry.target.name(),
            backing = ?entry.backing,
            "chain entry appended"
        );
        self.entries.push(entry);
        Ok(())
    }

    /// Forget the lineage, e.g. after the bitmap was cleared outside a backup.
    pub fn clear(&mut self) {
        if !self.entries.is_empty() {
            warn!(bitmap = %self.bitmap, "chain invalidated");
        }
        self.entries.clear();
    }

    pub fn links(&self) -> Vec<ChainLink> {
        self.entries
            .iter()
            .map(|e| ChainLink {
                target: e.target.name().to_string(),
                backing: e.backing.clone(),
                sync_mode: e.sync_mode,
                job_id: e.job_id.clone(),
                allocated_bytes: e.target.allocated_bytes(),
            })
            .collect()
    }

    /// Overlay anchor and every incremental, in order, onto a zeroed image.
    pub fn reconstruct(&self, size: u64) -> Vec<u8> {
        let mut image = vec![0u8; size as usize];
        for entry in &self.entries {
            entry.target.overlay_onto(&mut image);
        }
        image
    }

    /// Replay the chain and compare it byte for byte with `volume`.
    pub fn validate(&self, volume: &Volume, algorithm: ChecksumAlgorithm) -> Result<ChainReport> {
        if self.entries.is_empty() {
            return Err(EngineError::invalid(format!(
                "chain for bitmap '{}' has no anchor",
                self.bitmap
            )));
        }

        let live = volume.contents();
        let replayed = self.reconstruct(live.len() as u64);
        let first_mismatch = replayed
            .iter()
            .zip(live.iter())
            .position(|(a, b)| a != b)
            .map(|pos| pos as u64);

        let report = ChainReport {
            volume: self.volume.clone(),
            bitmap: self.bitmap.clone(),
            links: self.links(),
            reconstructed: compute_checksum(&replayed, algorithm),
            live: compute_checksum(&live, algorithm),
            matches: first_mismatch.is_none(),
            first_mismatch,
        };
        if report.matches {
            info!(
                bitmap = %self.bitmap,
                entries = self.entries.len(),
                %algorithm,
                checksum = %report.live,
                "chain validated"
            );
        } else {
            warn!(
                bitmap = %self.bitmap,
                offset = ?first_mismatch,
                %algorithm,
                reconstructed = %report.reconstructed,
                live = %report.live,
                "chain does not match volume"
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::FaultRegistry;

    fn entry(name: &str, backing: Option<&str>, faults: &Arc<FaultRegistry>) -> ChainEntry {
        ChainEntry {
            target: Arc::new(TargetImage::new(name, 8, Arc::clone(faults))),
            backing: backing.map(str::to_string),
            sync_mode: if backing.is_some() {
                SyncMode::Incremental
            } else {
                SyncMode::Full
            },
            job_id: JobId::generate(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_append_requires_tip_as_parent() {
        let faults = Arc::new(FaultRegistry::new());
        let mut chain = TargetChain::new("drive0", "bitmap0");

        chain.append(entry("full", None, &faults)).unwrap();
        chain.append(entry("inc0", Some("full"), &faults)).unwrap();
        assert_eq!(chain.tip(), Some("inc0"));

        let result = chain.append(entry("inc1", Some("full"), &faults));
        assert!(result.is_err());
        assert_eq!(chain.len(), 2);
    }

    #[test]
    fn test_new_anchor_restarts_chain() {
        let faults = Arc::new(FaultRegistry::new());
        let mut chain = TargetChain::new("drive0", "bitmap0");
        chain.append(entry("full0", None, &faults)).unwrap();
        chain.append(entry("inc0", Some("full0"), &faults)).unwrap();

        chain.append(entry("full1", None, &faults)).unwrap();
        assert_eq!(chain.len(), 1);
        assert!(!chain.contains("inc0"));
    }

    #[test]
    fn test_reconstruct_overlays_in_order() {
        let faults = Arc::new(FaultRegistry::new());
        let mut chain = TargetChain::new("drive0", "bitmap0");

        let anchor = entry("full", None, &faults);
        anchor.target.write_chunk(0, &[1; 8]).unwrap();
        let inc = entry("inc0", Some("full"), &faults);
        inc.target.write_chunk(2, &[5, 5]).unwrap();

        chain.append(anchor).unwrap();
        chain.append(inc).unwrap();
        assert_eq!(chain.reconstruct(8), vec![1, 1, 5, 5, 1, 1, 1, 1]);
    }

    #[test]
    fn test_validate_reports_mismatch() {
        let faults = Arc::new(FaultRegistry::new());
        let volume = Volume::new("drive0", 8, Arc::clone(&faults)).unwrap();
        volume.write_at(0, &[1; 8]).unwrap();

        let mut chain = TargetChain::new("drive0", "bitmap0");
        assert!(chain.validate(&volume, ChecksumAlgorithm::Sha256).is_err());

        let anchor = entry("full", None, &faults);
        anchor.target.write_chunk(0, &[1; 8]).unwrap();
        chain.append(anchor).unwrap();
        let report = chain.validate(&volume, ChecksumAlgorithm::Sha256).unwrap();
        assert!(report.matches);
        assert_eq!(report.reconstructed, report.live);

        volume.write_at(6, &[2]).unwrap();
        let report = chain.validate(&volume, ChecksumAlgorithm::Sha256).unwrap();
        assert!(!report.matches);
        assert_eq!(report.first_mismatch, Some(6));
    }
}
