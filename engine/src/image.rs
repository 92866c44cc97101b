//! Backup target images.
//!
//! A [`TargetImage`] is a sparse image: it stores only the chunks a job wrote
//! into it. Reading a chain means overlaying each image's chunks, oldest
//! first, onto a zeroed buffer.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{EngineError, IoFault, Result};
use crate::fault::{FaultRegistry, EINVAL};
use crate::model::{Extent, IoOperation};

#[derive(Debug)]
pub struct TargetImage {
    name: String,
    size: u64,
    chunks: Mutex<BTreeMap<u64, Vec<u8>>>,
    faults: Arc<FaultRegistry>,
}

impl TargetImage {
    pub fn new(name: &str, size: u64, faults: Arc<FaultRegistry>) -> Self {
        TargetImage {
            name: name.to_string(),
            size,
            chunks: Mutex::new(BTreeMap::new()),
            faults,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Store one copied chunk. Rewriting the same offset replaces it.
    ///
    /// Chunks must lie within the image's virtual size.
    pub fn write_chunk(&self, offset: u64, data: &[u8]) -> std::result::Result<(), IoFault> {
        let access = Extent::new(offset, data.len() as u64);
        self.faults.check(&self.name, IoOperation::Write, access)?;
        if access.end() > self.size {
            return Err(IoFault::new(EINVAL, IoOperation::Write, self.name.as_str()));
        }
        self.chunks.lock().insert(offset, data.to_vec());
        Ok(())
    }

    /// Bytes of data stored in this image.
    pub fn allocated_bytes(&self) -> u64 {
        self.chunks.lock().values().map(|d| d.len() as u64).sum()
    }

    /// Copy this image's chunks over `buf`, which represents the backing chain.
    pub fn overlay_onto(&self, buf: &mut [u8]) {
        for (offset, data) in self.chunks.lock().iter() {
            let start = *offset as usize;
            let end = (start + data.len()).min(buf.len());
            if start < end {
                buf[start..end].copy_from_slice(&data[..end - start]);
            }
        }
    }
}

/// Live target images by name.
///
/// Names are unique among live targets; discarding a target frees its name.
#[derive(Debug, Default)]
pub struct TargetRegistry {
    targets: Mutex<HashMap<String, Arc<TargetImage>>>,
}

impl TargetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty target.
    ///
    /// # Errors
    /// `TargetExists` if the name is taken.
    pub fn create(&self, name: &str, size: u64, faults: Arc<FaultRegistry>) -> Result<Arc<TargetImage>> {
        let mut targets = self.targets.lock();
        if targets.contains_key(name) {
            return Err(EngineError::TargetExists {
                target: name.to_string(),
            });
        }
        let image = Arc::new(TargetImage::new(name, size, faults));
        targets.insert(name.to_string(), Arc::clone(&image));
        debug!(target_name = name, size, "target created");
        Ok(image)
    }

    pub fn get(&self, name: &str) -> Option<Arc<TargetImage>> {
        self.targets.lock().get(name).cloned()
    }

    /// Drop a target; returns false if it did not exist.
    pub fn discard(&self, name: &str) -> bool {
        let removed = self.targets.lock().remove(name).is_some();
        if removed {
            debug!(target_name = name, "target discarded");
        }
        removed
    }

    /// Names of all live targets, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.targets.lock().keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::FaultRule;

    #[test]
    fn test_overlay_applies_chunks() {
        let image = TargetImage::new("inc0", 16, Arc::new(FaultRegistry::new()));
        image.write_chunk(4, &[1, 2, 3, 4]).unwrap();
        image.write_chunk(12, &[9; 4]).unwrap();

        let mut buf = vec![7u8; 16];
        image.overlay_onto(&mut buf);
        assert_eq!(buf, vec![7, 7, 7, 7, 1, 2, 3, 4, 7, 7, 7, 7, 9, 9, 9, 9]);
        assert_eq!(image.allocated_bytes(), 8);
    }

    #[test]
    fn test_rewrite_replaces_chunk() {
        let image = TargetImage::new("inc0", 8, Arc::new(FaultRegistry::new()));
        image.write_chunk(0, &[1; 4]).unwrap();
        image.write_chunk(0, &[2; 4]).unwrap();
        assert_eq!(image.allocated_bytes(), 4);
    }

    #[test]
    fn test_registry_names_are_unique_until_discarded() {
        let faults = Arc::new(FaultRegistry::new());
        let registry = TargetRegistry::new();
        registry.create("inc0", 8, Arc::clone(&faults)).unwrap();
        assert!(matches!(
            registry.create("inc0", 8, Arc::clone(&faults)),
            Err(EngineError::TargetExists { .. })
        ));

        assert!(registry.discard("inc0"));
        assert!(!registry.discard("inc0"));
        assert!(registry.create("inc0", 8, faults).is_ok());
        assert_eq!(registry.names(), vec!["inc0".to_string()]);
    }

    #[test]
    fn test_write_fault() {
        let faults = Arc::new(FaultRegistry::new());
        let image = TargetImage::new("inc0", 8, Arc::clone(&faults));
        faults.inject("inc0", FaultRule::always(IoOperation::Write));

        let err = image.write_chunk(0, &[1; 4]).unwrap_err();
        assert_eq!(err.operation, IoOperation::Write);
        assert_eq!(err.device, "inc0");
        assert_eq!(image.allocated_bytes(), 0);
    }

    #[test]
    fn test_write_past_end_rejected() {
        let image = TargetImage::new("inc0", 8, Arc::new(FaultRegistry::new()));
        let err = image.write_chunk(6, &[1; 4]).unwrap_err();
        assert_eq!(err.errno, EINVAL);
        assert_eq!(image.allocated_bytes(), 0);
    }
}
