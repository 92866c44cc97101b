//! In-memory block volumes.
//!
//! A [`Volume`] is a fixed-size byte range that owns the dirty bitmaps
//! attached to it. Every successful write marks the written range dirty in
//! each attached bitmap, after the data has landed.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::trace;

use crate::bitmap::DirtyBitmap;
use crate::error::{EngineError, IoFault, Result};
use crate::fault::{FaultRegistry, EINVAL};
use crate::model::{Extent, IoOperation};

#[derive(Debug)]
pub struct Volume {
    id: String,
    data: RwLock<Vec<u8>>,
    bitmaps: RwLock<Vec<Arc<DirtyBitmap>>>,
    faults: Arc<FaultRegistry>,
}

impl Volume {
    /// Create a zero-filled volume of `size` bytes.
    ///
    /// # Errors
    /// `InvalidRequest` if `size` bytes cannot be allocated.
    pub fn new(id: &str, size: u64, faults: Arc<FaultRegistry>) -> Result<Self> {
        let too_large = || {
            EngineError::invalid(format!("volume '{}' of {} bytes cannot be allocated", id, size))
        };
        let len = usize::try_from(size).map_err(|_| too_large())?;
        let mut data = Vec::new();
        data.try_reserve_exact(len).map_err(|_| too_large())?;
        data.resize(len, 0);

        Ok(Volume {
            id: id.to_string(),
            data: RwLock::new(data),
            bitmaps: RwLock::new(Vec::new()),
            faults,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn size(&self) -> u64 {
        self.data.read().len() as u64
    }

    fn check_range(&self, offset: u64, len: u64) -> Result<()> {
        let size = self.size();
        if offset.checked_add(len).map_or(true, |end| end > size) {
            return Err(EngineError::OutOfRange {
                volume: self.id.clone(),
                offset,
                len,
                size,
            });
        }
        Ok(())
    }

    /// Read `buf.len()` bytes at `offset`, as a backup job does.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> std::result::Result<(), IoFault> {
        let access = Extent::new(offset, buf.len() as u64);
        self.faults.check(&self.id, IoOperation::Read, access)?;

        let data = self.data.read();
        let start = offset as usize;
        let Some(src) = data.get(start..start + buf.len()) else {
            return Err(IoFault::new(EINVAL, IoOperation::Read, self.id.as_str()));
        };
        buf.copy_from_slice(src);
        Ok(())
    }

    /// Write `bytes` at `offset` and mark the range dirty in every bitmap.
    pub fn write_at(&self, offset: u64, bytes: &[u8]) -> Result<()> {
        let len = bytes.len() as u64;
        self.check_range(offset, len)?;
        self.faults
            .check(&self.id, IoOperation::Write, Extent::new(offset, len))?;

        {
            let mut data = self.data.write();
            let start = offset as usize;
            data[start..start + bytes.len()].copy_from_slice(bytes);
        }
        for bitmap in self.bitmaps.read().iter() {
            bitmap.mark_dirty(offset, len);
        }
        trace!(volume = %self.id, offset, len, "volume write");
        Ok(())
    }

    /// Write `len` copies of `pattern` at `offset`.
    pub fn fill(&self, offset: u64, len: u64, pattern: u8) -> Result<()> {
        self.check_range(offset, len)?;
        self.write_at(offset, &vec![pattern; len as usize])
    }

    /// Copy of the full contents, bypassing fault injection.
    pub fn contents(&self) -> Vec<u8> {
        self.data.read().clone()
    }

    /// Attach a bitmap; fails if one with the same name exists.
    pub fn attach_bitmap(&self, bitmap: Arc<DirtyBitmap>) -> Result<()> {
        let mut bitmaps = self.bitmaps.write();
        if bitmaps.iter().any(|b| b.name() == bitmap.name()) {
            return Err(EngineError::BitmapExists {
                volume: self.id.clone(),
                name: bitmap.name().to_string(),
            });
        }
        bitmaps.push(bitmap);
        Ok(())
    }

    pub fn detach_bitmap(&self, name: &str) -> Option<Arc<DirtyBitmap>> {
        let mut bitmaps = self.bitmaps.write();
        let index = bitmaps.iter().position(|b| b.name() == name)?;
        Some(bitmaps.remove(index))
    }

    /// Look up an attached bitmap.
    ///
    /// # Errors
    /// `BitmapNotFound` if no bitmap of that name is attached.
    pub fn bitmap(&self, name: &str) -> Result<Arc<DirtyBitmap>> {
        self.bitmaps
            .read()
            .iter()
            .find(|b| b.name() == name)
            .cloned()
            .ok_or_else(|| EngineError::BitmapNotFound {
                volume: self.id.clone(),
                name: name.to_string(),
            })
    }

    pub fn bitmaps(&self) -> Vec<Arc<DirtyBitmap>> {
        self.bitmaps.read().clone()
    }
}
