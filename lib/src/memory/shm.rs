use std::sync::{Arc, Mutex};

use log::{debug, trace};
use thiserror::Error;

use super::{memfd_region, AllocError, BackingAllocator, BackingKind, Region, RegionStats};

/// Allocator of plain shared-memory regions, meant to be used as arenas
/// shared with the compositor in one go.
#[derive(Default)]
pub struct ShmAllocator {
    stats: Arc<RegionStats>,
}

impl ShmAllocator {
    pub fn new() -> Self {
        Default::default()
    }

    /// Number of regions allocated so far, including the ones already freed.
    pub fn allocated_regions(&self) -> usize {
        self.stats.allocated()
    }
}

impl BackingAllocator for ShmAllocator {
    fn kind(&self) -> BackingKind {
        BackingKind::Shm
    }

    fn allocate_region(&self, size: usize) -> Result<Region, AllocError> {
        debug!("Allocating shm region of {} bytes", size);
        memfd_region(c"wlsink-shm", size, &self.stats)
    }

    fn outstanding_regions(&self) -> usize {
        self.stats.outstanding()
    }
}

/// Every slice handed out by an arena starts at a multiple of this.
pub const ARENA_ALIGNMENT: usize = 64;

/// A range of bytes carved out of an `Arena`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaSlice {
    pub offset: usize,
    pub len: usize,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ArenaError {
    #[error("arena still has {0} live slices")]
    Busy(usize),
}

struct Cursor {
    used: usize,
    live: usize,
}

/// Bump allocator over a single shared region.
///
/// Slices are never reused individually: space is only recovered by a
/// `reset`, which is refused as long as any slice handed out since the last
/// reset has not been released.
pub struct Arena {
    region: Region,
    cursor: Mutex<Cursor>,
}

impl Arena {
    pub fn new(region: Region) -> Self {
        Arena {
            region,
            cursor: Mutex::new(Cursor { used: 0, live: 0 }),
        }
    }

    /// Carve `size` bytes out of the arena, or `None` if they don't fit.
    pub fn allocate(&self, size: usize) -> Option<ArenaSlice> {
        let mut cursor = self.cursor.lock().unwrap();
        let offset = crate::align_up(cursor.used, ARENA_ALIGNMENT);
        if size == 0 || offset + size > self.capacity() {
            trace!(
                "Arena cannot fit {} bytes ({} used out of {})",
                size,
                cursor.used,
                self.capacity()
            );
            return None;
        }

        cursor.used = offset + size;
        cursor.live += 1;
        Some(ArenaSlice { offset, len: size })
    }

    /// Give back a slice. Its space stays unusable until the next reset.
    pub fn release(&self, slice: ArenaSlice) {
        let mut cursor = self.cursor.lock().unwrap();
        debug_assert!(slice.offset + slice.len <= cursor.used);
        cursor.live = cursor.live.saturating_sub(1);
    }

    /// Rewind the cursor to the start of the region.
    pub fn reset(&self) -> Result<(), ArenaError> {
        let mut cursor = self.cursor.lock().unwrap();
        if cursor.live > 0 {
            return Err(ArenaError::Busy(cursor.live));
        }
        cursor.used = 0;
        Ok(())
    }

    pub fn capacity(&self) -> usize {
        self.region.len()
    }

    pub fn used(&self) -> usize {
        self.cursor.lock().unwrap().used
    }

    pub fn live_slices(&self) -> usize {
        self.cursor.lock().unwrap().live
    }

    pub fn region(&self) -> &Region {
        &self.region
    }
}
