//! Exportable buffer handles, one region per plane.
use std::sync::Arc;

use log::debug;

use super::{memfd_region, AllocError, BackingAllocator, BackingKind, Region, RegionStats};

/// Lines of exported buffers are aligned to 32 pixels of 32 bits, which is
/// what scan-out engines commonly require.
pub const DEFAULT_PITCH_ALIGNMENT: usize = 32 * 4;

/// Allocator of exportable buffer planes.
///
/// Each region is meant to back a single plane of a single frame, and its
/// file descriptor is passed as-is to the compositor.
pub struct DmaBufAllocator {
    pitch_alignment: usize,
    stats: Arc<RegionStats>,
}

impl Default for DmaBufAllocator {
    fn default() -> Self {
        Self::with_pitch_alignment(DEFAULT_PITCH_ALIGNMENT)
    }
}

impl DmaBufAllocator {
    pub fn new() -> Self {
        Default::default()
    }

    /// Number of regions allocated so far, including the ones already freed.
    pub fn allocated_regions(&self) -> usize {
        self.stats.allocated()
    }

    /// Create an allocator aligning lines to `pitch_alignment` bytes, which
    /// must be a power of two.
    pub fn with_pitch_alignment(pitch_alignment: usize) -> Self {
        DmaBufAllocator {
            pitch_alignment,
            stats: Default::default(),
        }
    }
}

impl BackingAllocator for DmaBufAllocator {
    fn kind(&self) -> BackingKind {
        BackingKind::DmaBuf
    }

    fn allocate_region(&self, size: usize) -> Result<Region, AllocError> {
        debug!("Allocating exportable plane of {} bytes", size);
        memfd_region(c"wlsink-dmabuf", size, &self.stats)
    }

    fn stride_alignment(&self) -> usize {
        self.pitch_alignment
    }

    fn outstanding_regions(&self) -> usize {
        self.stats.outstanding()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FrameLayout, PixelFormat};

    #[test]
    fn test_dmabuf_pitch() {
        let allocator = DmaBufAllocator::new();
        assert_eq!(allocator.kind(), BackingKind::DmaBuf);

        // 100 pixels wide is rounded up to 128 pixels.
        let layout =
            FrameLayout::new(PixelFormat::BGRX, 100, 10, allocator.stride_alignment()).unwrap();
        assert_eq!(layout.planes[0].stride, 512);
        assert_eq!(layout.planes[0].line_bytes, 400);
    }

    #[test]
    fn test_dmabuf_regions() {
        let allocator = DmaBufAllocator::with_pitch_alignment(64);
        assert_eq!(allocator.stride_alignment(), 64);

        let planes = (0..3)
            .map(|_| allocator.allocate_region(64 * 16))
            .collect::<Result<Vec<_>, _>>()
            .unwrap();
        assert_eq!(allocator.outstanding_regions(), 3);
        drop(planes);
        assert_eq!(allocator.outstanding_regions(), 0);
    }
}
