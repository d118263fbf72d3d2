use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use log::trace;

use crate::config::{BM_BLOCK_SIZE, SECTOR_SHIFT};

use super::interval::BlockInterval;

// Sectors per bitmap block
const BM_SECT_PER_BIT: u64 = (BM_BLOCK_SIZE >> SECTOR_SHIFT) as u64;

// Activity-log extent size in sectors (4 MiB extents)
const AL_EXTENT_SECTORS: u64 = 8192;

fn bit_range(interval: &BlockInterval) -> (u64, u64) {
    let start = interval.sector / BM_SECT_PER_BIT;
    let end = (interval.end() - 1) / BM_SECT_PER_BIT;
    (start, end)
}

// Per-peer out-of-sync map. The engine only consumes it through these
// operations; the real bit store and its on-disk format live elsewhere.
pub trait SyncBitmap: Send + Sync + 'static {
    fn set_out_of_sync(&self, interval: &BlockInterval);

    fn set_in_sync(&self, interval: &BlockInterval);

    // Out-of-sync bits covering the range
    fn count_bits_in(&self, interval: &BlockInterval) -> u64;

    // Everything diverged: a full resync is due
    fn set_all_out_of_sync(&self);
}

// Bit store backed by process memory, for tests and diskless peers
#[derive(Debug, Default)]
pub struct MemBitmap {
    bits: Mutex<HashSet<u64>>,
    all_dirty: Mutex<bool>,
}

impl MemBitmap {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SyncBitmap for MemBitmap {
    fn set_out_of_sync(&self, interval: &BlockInterval) {
        let (start, end) = bit_range(interval);
        trace!("set out of sync: bits {}..={}", start, end);
        let mut bits = self.bits.lock().expect("bitmap lock poisoned");
        for bit in start..=end {
            bits.insert(bit);
        }
    }

    fn set_in_sync(&self, interval: &BlockInterval) {
        let (start, end) = bit_range(interval);
        let mut bits = self.bits.lock().expect("bitmap lock poisoned");
        for bit in start..=end {
            bits.remove(&bit);
        }
    }

    fn count_bits_in(&self, interval: &BlockInterval) -> u64 {
        if *self.all_dirty.lock().expect("bitmap lock poisoned") {
            return interval.sectors().div_ceil(BM_SECT_PER_BIT);
        }
        let (start, end) = bit_range(interval);
        let bits = self.bits.lock().expect("bitmap lock poisoned");
        (start..=end).filter(|bit| bits.contains(bit)).count() as u64
    }

    fn set_all_out_of_sync(&self) {
        *self.all_dirty.lock().expect("bitmap lock poisoned") = true;
    }
}

// On-disk circular log of recently written extents, bounding the
// post-crash resync area. Consumed only through these operations;
// begin_io may block on the transactional on-disk update.
#[async_trait]
pub trait ActivityLog: Send + Sync + 'static {
    async fn begin_io(&self, interval: &BlockInterval);

    fn complete_io(&self, interval: &BlockInterval);

    // Active extents, compared against the congestion threshold
    fn used(&self) -> u32;
}

// Reference-counted extent set without the on-disk transaction
#[derive(Debug, Default)]
pub struct MemActivityLog {
    extents: Mutex<HashMap<u64, u32>>,
}

impl MemActivityLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn extent_range(interval: &BlockInterval) -> (u64, u64) {
        let first = interval.sector / AL_EXTENT_SECTORS;
        let last = (interval.end() - 1) / AL_EXTENT_SECTORS;
        (first, last)
    }
}

#[async_trait]
impl ActivityLog for MemActivityLog {
    async fn begin_io(&self, interval: &BlockInterval) {
        let (first, last) = Self::extent_range(interval);
        let mut extents = self.extents.lock().expect("activity log lock poisoned");
        for extent in first..=last {
            *extents.entry(extent).or_insert(0) += 1;
        }
    }

    fn complete_io(&self, interval: &BlockInterval) {
        let (first, last) = Self::extent_range(interval);
        let mut extents = self.extents.lock().expect("activity log lock poisoned");
        for extent in first..=last {
            if let Some(count) = extents.get_mut(&extent) {
                *count -= 1;
                if *count == 0 {
                    extents.remove(&extent);
                }
            }
        }
    }

    fn used(&self) -> u32 {
        self.extents.lock().expect("activity log lock poisoned").len() as u32
    }
}
