//! Dirty bitmaps.
//!
//! A [`DirtyBitmap`] tracks which fixed-size cells of a volume have been
//! written since the bitmap was last cleared. Writes mark cells at any time;
//! a backup job takes the bitmap through an acquire / clear / release cycle:
//!
//! 1. `acquire_for_job` marks the bitmap busy and snapshots its dirty extents
//! 2. the job copies those extents
//! 3. `clear` drops the bits for the extents that were copied
//! 4. `release` makes the bitmap available again, on every exit path
//!
//! While busy, every write is also recorded in a successor set. `clear` never
//! drops a cell that was written after the snapshot was taken, so data that
//! changed during an in-flight backup stays dirty for the next one.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::{EngineError, Result};
use crate::model::Extent;

const WORD_BITS: u64 = 64;

/// Externally visible state of a bitmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BitmapState {
    /// Recording writes, available to jobs
    Recording,
    /// Held by a job
    Busy,
    /// Recording disabled; writes are not tracked
    Frozen,
}

/// Result of a bitmap query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitmapStatus {
    pub name: String,
    pub volume: String,
    /// Dirty bytes: set bits times granularity
    pub dirty_count: u64,
    pub granularity: u64,
    pub busy: bool,
    pub recording: bool,
    pub persistent: bool,
    pub state: BitmapState,
}

#[derive(Debug)]
struct BitmapInner {
    bits: Vec<u64>,
    successor: Option<Vec<u64>>,
    busy: bool,
    recording: bool,
}

/// Per-volume record of written cells.
#[derive(Debug)]
pub struct DirtyBitmap {
    name: String,
    volume: String,
    volume_size: u64,
    granularity: u64,
    bit_count: u64,
    persistent: bool,
    inner: Mutex<BitmapInner>,
}

impl DirtyBitmap {
    /// Create a clear, recording bitmap covering `volume_size` bytes.
    ///
    /// # Errors
    /// `InvalidGranularity` unless `granularity` is a power of two.
    pub fn create(
        volume: &str,
        volume_size: u64,
        name: &str,
        granularity: u64,
        persistent: bool,
    ) -> Result<Self> {
        if !granularity.is_power_of_two() {
            return Err(EngineError::InvalidGranularity { granularity });
        }
        if name.is_empty() {
            return Err(EngineError::invalid("bitmap name must not be empty"));
        }

        let bit_count = volume_size.div_ceil(granularity);
        let words = bit_count.div_ceil(WORD_BITS) as usize;

        debug!(volume, bitmap = name, granularity, bit_count, "bitmap created");
        Ok(DirtyBitmap {
            name: name.to_string(),
            volume: volume.to_string(),
            volume_size,
            granularity,
            bit_count,
            persistent,
            inner: Mutex::new(BitmapInner {
                bits: vec![0; words],
                successor: None,
                busy: false,
                recording: true,
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn volume(&self) -> &str {
        &self.volume
    }

    pub fn granularity(&self) -> u64 {
        self.granularity
    }

    pub fn bit_count(&self) -> u64 {
        self.bit_count
    }

    pub fn is_busy(&self) -> bool {
        self.inner.lock().busy
    }

    /// Cell index range `[first, last]` touched by `[offset, offset + len)`,
    /// clipped to the volume.
    fn cells(&self, offset: u64, len: u64) -> Option<(u64, u64)> {
        let end = offset.saturating_add(len).min(self.volume_size);
        if len == 0 || offset >= end {
            return None;
        }
        Some((offset / self.granularity, (end - 1) / self.granularity))
    }

    /// Mark every cell intersecting `[offset, offset + len)` dirty.
    ///
    /// Never blocks on jobs; a disabled bitmap ignores the write.
    pub fn mark_dirty(&self, offset: u64, len: u64) {
        let Some((first, last)) = self.cells(offset, len) else {
            return;
        };
        let mut inner = self.inner.lock();
        if !inner.recording {
            return;
        }
        set_bits(&mut inner.bits, first, last);
        if let Some(successor) = inner.successor.as_mut() {
            set_bits(successor, first, last);
        }
        trace!(bitmap = %self.name, offset, len, "marked dirty");
    }

    /// Take the bitmap for a job and snapshot its dirty extents.
    ///
    /// # Errors
    /// `BitmapBusy` if another job already holds it.
    pub fn acquire_for_job(&self) -> Result<Vec<Extent>> {
        let mut inner = self.inner.lock();
        if inner.busy {
            return Err(self.busy_error());
        }
        inner.busy = true;
        inner.successor = Some(vec![0; inner.bits.len()]);
        let extents = self.extents_of(&inner.bits);
        debug!(bitmap = %self.name, extents = extents.len(), "bitmap acquired");
        Ok(extents)
    }

    /// Clear the cells covering `ranges`, except cells written since the
    /// bitmap was acquired.
    pub fn clear(&self, ranges: &[Extent]) {
        let mut inner = self.inner.lock();
        let BitmapInner {
            bits, successor, ..
        } = &mut *inner;
        for range in ranges {
            let Some((first, last)) = self.cells(range.offset, range.len) else {
                continue;
            };
            for bit in first..=last {
                let redirtied = successor.as_deref().is_some_and(|s| test_bit(s, bit));
                if !redirtied {
                    clear_bit(bits, bit);
                }
            }
        }
        debug!(bitmap = %self.name, ranges = ranges.len(), "bitmap ranges cleared");
    }

    /// Return the bitmap from a job. Idempotent.
    pub fn release(&self) {
        let mut inner = self.inner.lock();
        inner.busy = false;
        inner.successor = None;
        debug!(bitmap = %self.name, "bitmap released");
    }

    /// Clear every bit.
    ///
    /// # Errors
    /// `BitmapBusy` while a job holds the bitmap.
    pub fn reset(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.busy {
            return Err(self.busy_error());
        }
        inner.bits.iter_mut().for_each(|w| *w = 0);
        debug!(bitmap = %self.name, "bitmap reset");
        Ok(())
    }

    /// Enable or disable recording of writes.
    ///
    /// # Errors
    /// `BitmapBusy` while a job holds the bitmap.
    pub fn set_recording(&self, recording: bool) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.busy {
            return Err(self.busy_error());
        }
        inner.recording = recording;
        Ok(())
    }

    /// Current dirty extents, merged and clipped to the volume.
    pub fn dirty_extents(&self) -> Vec<Extent> {
        let inner = self.inner.lock();
        self.extents_of(&inner.bits)
    }

    /// Number of dirty bytes (set bits times granularity).
    pub fn dirty_count(&self) -> u64 {
        let inner = self.inner.lock();
        count_bits(&inner.bits) * self.granularity
    }

    pub fn status(&self) -> BitmapStatus {
        let inner = self.inner.lock();
        let state = if inner.busy {
            BitmapState::Busy
        } else if !inner.recording {
            BitmapState::Frozen
        } else {
            BitmapState::Recording
        };
        BitmapStatus {
            name: self.name.clone(),
            volume: self.volume.clone(),
            dirty_count: count_bits(&inner.bits) * self.granularity,
            granularity: self.granularity,
            busy: inner.busy,
            recording: inner.recording,
            persistent: self.persistent,
            state,
        }
    }

    fn extents_of(&self, bits: &[u64]) -> Vec<Extent> {
        let mut extents: Vec<Extent> = Vec::new();
        let mut run_start: Option<u64> = None;

        for bit in 0..=self.bit_count {
            let dirty = bit < self.bit_count && test_bit(bits, bit);
            match (dirty, run_start) {
                (true, None) => run_start = Some(bit),
                (false, Some(start)) => {
                    let offset = start * self.granularity;
                    let end = (bit * self.granularity).min(self.volume_size);
                    extents.push(Extent::new(offset, end - offset));
                    run_start = None;
                }
                _ => {}
            }
        }
        extents
    }

    fn busy_error(&self) -> EngineError {
        EngineError::BitmapBusy {
            volume: self.volume.clone(),
            name: self.name.clone(),
        }
    }
}

fn test_bit(words: &[u64], bit: u64) -> bool {
    words[(bit / WORD_BITS) as usize] & (1 << (bit % WORD_BITS)) != 0
}

fn clear_bit(words: &mut [u64], bit: u64) {
    words[(bit / WORD_BITS) as usize] &= !(1 << (bit % WORD_BITS));
}

fn set_bits(words: &mut [u64], first: u64, last: u64) {
    for bit in first..=last {
        words[(bit / WORD_BITS) as usize] |= 1 << (bit % WORD_BITS);
    }
}

fn count_bits(words: &[u64]) -> u64 {
    words.iter().map(|w| w.count_ones() as u64).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashSet;

    const MIB: u64 = 1024 * 1024;
    const KIB: u64 = 1024;

    fn bitmap(granularity: u64) -> DirtyBitmap {
        DirtyBitmap::create("drive0", 64 * MIB, "bitmap0", granularity, false)
            .expect("Failed to create bitmap")
    }

    #[test]
    fn test_create_rejects_non_power_of_two() {
        for granularity in [0, 3, 1000, 65535, 65537] {
            let result = DirtyBitmap::create("drive0", MIB, "bitmap0", granularity, false);
            assert!(
                matches!(result, Err(EngineError::InvalidGranularity { .. })),
                "granularity {} should be rejected",
                granularity
            );
        }
    }

    #[test]
    fn test_create_starts_clear_and_recording() {
        let bm = bitmap(64 * KIB);
        let status = bm.status();
        assert_eq!(status.dirty_count, 0);
        assert_eq!(status.granularity, 64 * KIB);
        assert!(!status.busy);
        assert!(status.recording);
        assert_eq!(status.state, BitmapState::Recording);
        assert_eq!(bm.bit_count(), 1024);
    }

    #[test]
    fn test_bit_count_rounds_up() {
        let bm = DirtyBitmap::create("drive0", 100_000, "b", 65536, false).unwrap();
        assert_eq!(bm.bit_count(), 2);
    }

    #[test]
    fn test_mark_dirty_counts_touched_cells() {
        let bm = bitmap(64 * KIB);
        bm.mark_dirty(0, 512);
        bm.mark_dirty(MIB, 256 * KIB);
        bm.mark_dirty(32 * MIB, 64 * KIB);
        // 1 + 4 + 1 cells
        assert_eq!(bm.dirty_count(), 6 * 64 * KIB);
    }

    #[test]
    fn test_mark_dirty_unaligned_spans_two_cells() {
        let bm = bitmap(64 * KIB);
        bm.mark_dirty(64 * KIB - 1, 2);
        assert_eq!(bm.dirty_count(), 128 * KIB);
        assert_eq!(bm.dirty_extents(), vec![Extent::new(0, 128 * KIB)]);
    }

    #[test]
    fn test_dirty_extents_merge_and_clip() {
        let bm = DirtyBitmap::create("drive0", 200_000, "b", 65536, false).unwrap();
        bm.mark_dirty(0, 1);
        bm.mark_dirty(199_999, 1);
        assert_eq!(
            bm.dirty_extents(),
            vec![Extent::new(0, 65536), Extent::new(196_608, 3392)]
        );

        bm.mark_dirty(70_000, 70_000);
        assert_eq!(bm.dirty_extents(), vec![Extent::new(0, 200_000)]);

        bm.mark_dirty(500_000, 10);
        assert_eq!(bm.dirty_count(), 4 * 65536);
    }

    #[test]
    fn test_acquire_twice_is_busy() {
        let bm = bitmap(64 * KIB);
        bm.acquire_for_job().expect("first acquire");
        assert!(matches!(
            bm.acquire_for_job(),
            Err(EngineError::BitmapBusy { .. })
        ));
        assert_eq!(bm.status().state, BitmapState::Busy);

        bm.release();
        assert!(bm.acquire_for_job().is_ok());
    }

    #[test]
    fn test_clear_only_named_ranges() {
        let bm = bitmap(64 * KIB);
        bm.mark_dirty(0, 64 * KIB);
        bm.mark_dirty(MIB, 64 * KIB);
        let extents = bm.acquire_for_job().unwrap();
        assert_eq!(extents.len(), 2);

        bm.clear(&extents[..1]);
        bm.release();
        assert_eq!(bm.dirty_extents(), vec![Extent::new(MIB, 64 * KIB)]);
    }

    #[test]
    fn test_write_during_job_survives_clear() {
        let bm = bitmap(64 * KIB);
        bm.mark_dirty(0, 128 * KIB);
        let extents = bm.acquire_for_job().unwrap();

        // Re-dirty the second cell after the snapshot
        bm.mark_dirty(64 * KIB, 512);
        bm.clear(&extents);
        bm.release();

        assert_eq!(bm.dirty_extents(), vec![Extent::new(64 * KIB, 64 * KIB)]);
    }

    #[test]
    fn test_mark_dirty_while_busy_is_recorded() {
        let bm = bitmap(64 * KIB);
        let extents = bm.acquire_for_job().unwrap();
        assert!(extents.is_empty());

        bm.mark_dirty(2 * MIB, 1);
        assert_eq!(bm.dirty_count(), 64 * KIB);
        bm.release();
        assert_eq!(bm.dirty_count(), 64 * KIB);
    }

    #[test]
    fn test_reset_and_recording_rejected_while_busy() {
        let bm = bitmap(64 * KIB);
        bm.mark_dirty(0, 1);
        bm.acquire_for_job().unwrap();
        assert!(matches!(bm.reset(), Err(EngineError::BitmapBusy { .. })));
        assert!(bm.set_recording(false).is_err());
        bm.release();

        bm.reset().unwrap();
        assert_eq!(bm.dirty_count(), 0);
    }

    #[test]
    fn test_disabled_bitmap_ignores_writes() {
        let bm = bitmap(64 * KIB);
        bm.set_recording(false).unwrap();
        assert_eq!(bm.status().state, BitmapState::Frozen);
        bm.mark_dirty(0, MIB);
        assert_eq!(bm.dirty_count(), 0);

        bm.set_recording(true).unwrap();
        bm.mark_dirty(0, MIB);
        assert_eq!(bm.dirty_count(), MIB);
    }

    #[test]
    fn test_writes_past_end_are_clipped() {
        let bm = DirtyBitmap::create("drive0", MIB, "b", 64 * KIB, false).unwrap();
        bm.mark_dirty(MIB - 1, 4 * KIB);
        bm.mark_dirty(2 * MIB, 4 * KIB);
        assert_eq!(bm.dirty_count(), 64 * KIB);
    }

    proptest! {
        #[test]
        fn prop_power_of_two_granularity_accepted(shift in 0u32..30) {
            let granularity = 1u64 << shift;
            prop_assert!(DirtyBitmap::create("d", MIB, "b", granularity, false).is_ok());
        }

        #[test]
        fn prop_other_granularity_rejected(g in 0u64..(1 << 24)) {
            prop_assume!(!g.is_power_of_two());
            let result = DirtyBitmap::create("d", MIB, "b", g, false);
            let rejected = matches!(result, Err(EngineError::InvalidGranularity { .. }));
            prop_assert!(rejected);
        }

        #[test]
        fn prop_dirty_count_matches_touched_cells(
            shift in 9u32..18,
            writes in prop::collection::vec((0u64..(8 * MIB), 1u64..(300 * KIB)), 0..20),
        ) {
            let granularity = 1u64 << shift;
            let size = 8 * MIB;
            let bm = DirtyBitmap::create("d", size, "b", granularity, false).unwrap();
            let mut cells = HashSet::new();
            for (offset, len) in &writes {
                bm.mark_dirty(*offset, *len);
                let end = (offset + len).min(size);
                for cell in (offset / granularity)..=((end - 1) / granularity) {
                    cells.insert(cell);
                }
            }
            prop_assert_eq!(bm.dirty_count(), cells.len() as u64 * granularity);
        }
    }
}
