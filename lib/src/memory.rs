//! Abstracts the different kinds of backing memory a frame buffer can use.
//!
//! The compositor can read frames from two kinds of memory, which result in
//! two different allocation strategies:
//!
//! * Shared memory (`BackingKind::Shm`): one large region is created per pool
//!   configuration and shared with the compositor once. Frames are carved out
//!   of it by an `Arena`, and are referenced by the compositor as an offset
//!   into the shared region.
//!
//! * Exportable buffers (`BackingKind::DmaBuf`): each plane of each frame gets
//!   its own region, whose file descriptor is exported to the compositor.
//!   Lines are aligned the way scan-out hardware usually requires.
//!
//! Both strategies are served by the `BackingAllocator` trait, which hands out
//! `Region`s. A `Region` is a shareable file descriptor mapped into our address
//! space ; dropping it returns it to the allocator that produced it.
mod dmabuf;
mod mapping;
mod shm;

pub use dmabuf::*;
pub use mapping::*;
pub use shm::*;

use std::fmt::{self, Debug, Display};
use std::fs::File;
use std::io;
use std::ffi::CStr;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use log::trace;
use nix::errno::Errno;
use nix::sys::memfd::{memfd_create, MemFdCreateFlag};
use thiserror::Error;

/// All the supported kinds of backing memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackingKind {
    Shm,
    DmaBuf,
}

impl Display for BackingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackingKind::Shm => f.write_str("shm"),
            BackingKind::DmaBuf => f.write_str("dmabuf"),
        }
    }
}

#[derive(Debug, Error)]
pub enum AllocError {
    #[error("cannot allocate an empty region")]
    ZeroSize,
    #[error("error while creating memory file: {0}")]
    Create(Errno),
    #[error("error while sizing memory file: {0}")]
    Resize(io::Error),
    #[error("error while mapping memory: {0}")]
    Map(#[from] MmapError),
    #[error("arena cannot fit {requested} bytes ({available} available)")]
    ArenaFull { requested: usize, available: usize },
}

/// Trait for the providers of frame storage.
pub trait BackingAllocator: Send + Sync + 'static {
    /// The kind of memory this allocator produces.
    fn kind(&self) -> BackingKind;

    /// Allocate a new shareable region of at least `size` bytes.
    fn allocate_region(&self, size: usize) -> Result<Region, AllocError>;

    /// Alignment in bytes that every line of a frame must respect.
    fn stride_alignment(&self) -> usize {
        4
    }

    /// Number of regions produced by this allocator that are still alive.
    fn outstanding_regions(&self) -> usize;
}

/// Bookkeeping shared between an allocator and the regions it produced, so
/// the allocator knows how many of them have been returned.
#[derive(Default)]
pub struct RegionStats {
    outstanding: AtomicUsize,
    allocated: AtomicUsize,
}

impl RegionStats {
    pub fn new() -> Self {
        Default::default()
    }

    /// Regions currently alive.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Relaxed)
    }

    /// Regions allocated since creation, including the ones already freed.
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }
}

/// A shareable memory region, mapped read-write into the current process.
pub struct Region {
    fd: OwnedFd,
    mapping: PlaneMapping,
    stats: Arc<RegionStats>,
}

impl Region {
    pub fn len(&self) -> usize {
        self.mapping.len()
    }

    /// Make Clippy happy.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn mapping(&self) -> &PlaneMapping {
        &self.mapping
    }
}

impl AsFd for Region {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("fd", &self.fd)
            .field("len", &self.len())
            .finish()
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        trace!("Returning region of {} bytes", self.len());
        self.stats.outstanding.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Create a memfd named `name`, size it to `size` bytes and map it.
pub(crate) fn memfd_region(
    name: &CStr,
    size: usize,
    stats: &Arc<RegionStats>,
) -> Result<Region, AllocError> {
    if size == 0 {
        return Err(AllocError::ZeroSize);
    }

    let fd = memfd_create(name, MemFdCreateFlag::MFD_CLOEXEC).map_err(AllocError::Create)?;
    let file = File::from(fd);
    file.set_len(size as u64).map_err(AllocError::Resize)?;
    let fd = OwnedFd::from(file);

    let mapping = mapping::mmap(&fd, 0, size)?;

    stats.outstanding.fetch_add(1, Ordering::Relaxed);
    stats.allocated.fetch_add(1, Ordering::Relaxed);

    Ok(Region {
        fd,
        mapping,
        stats: Arc::clone(stats),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_stats() {
        let stats = Arc::new(RegionStats::new());

        let first = memfd_region(c"test", 4096, &stats).unwrap();
        let second = memfd_region(c"test", 100, &stats).unwrap();
        assert_eq!(first.len(), 4096);
        assert_eq!(second.len(), 100);
        assert_eq!(stats.outstanding(), 2);

        drop(first);
        assert_eq!(stats.outstanding(), 1);
        assert_eq!(stats.allocated(), 2);

        drop(second);
        assert_eq!(stats.outstanding(), 0);
    }

    #[test]
    fn test_empty_region() {
        let stats = Arc::new(RegionStats::new());
        assert!(matches!(
            memfd_region(c"test", 0, &stats),
            Err(AllocError::ZeroSize)
        ));
        assert_eq!(stats.outstanding(), 0);
    }
}
