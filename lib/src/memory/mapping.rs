use std::ffi::c_void;
use std::num::NonZeroUsize;
use std::os::fd::AsFd;
use std::ptr::NonNull;
use std::slice;

use log::error;
use nix::{errno::Errno, libc::off_t, sys::mman};
use thiserror::Error;

/// A read-write shared mapping of a memory file.
pub struct PlaneMapping {
    // A mapping remains valid until we munmap it, that is, until the
    // PlaneMapping object is deleted.
    data: NonNull<c_void>,
    len: usize,
}

// The mapping is shared memory. Exclusive access to any part of it is
// arbitrated by the state of the buffer that owns that part.
unsafe impl Send for PlaneMapping {}
unsafe impl Sync for PlaneMapping {}

impl PlaneMapping {
    pub fn len(&self) -> usize {
        self.len
    }

    /// Make Clippy happy.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Address of the first byte of the mapping.
    pub fn as_ptr(&self) -> *const u8 {
        self.data.as_ptr() as *const u8
    }

    /// Returns `len` bytes starting at `offset` for reading.
    ///
    /// # Safety
    ///
    /// Nobody may be writing into the range for the lifetime of the returned
    /// slice.
    pub(crate) unsafe fn slice(&self, offset: usize, len: usize) -> &[u8] {
        assert!(offset + len <= self.len, "range outside of mapping");
        slice::from_raw_parts((self.data.as_ptr() as *const u8).add(offset), len)
    }

    /// Returns `len` bytes starting at `offset` for writing.
    ///
    /// # Safety
    ///
    /// The caller must be the only user of the range for the lifetime of the
    /// returned slice.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn slice_mut(&self, offset: usize, len: usize) -> &mut [u8] {
        assert!(offset + len <= self.len, "range outside of mapping");
        slice::from_raw_parts_mut((self.data.as_ptr() as *mut u8).add(offset), len)
    }
}

impl Drop for PlaneMapping {
    fn drop(&mut self) {
        // Safe because the pointer and length were constructed in mmap() and
        // are always valid.
        unsafe { mman::munmap(self.data, self.len) }.unwrap_or_else(|e| {
            error!("Error while unmapping plane: {}", e);
        });
    }
}

#[derive(Debug, Error)]
pub enum MmapError {
    #[error("cannot map an empty range")]
    Empty,
    #[error("mmap error: {0}")]
    Errno(#[from] Errno),
}

/// Map `length` bytes of `fd` starting at `offset`, shared and read-write.
pub fn mmap(fd: &impl AsFd, offset: usize, length: usize) -> Result<PlaneMapping, MmapError> {
    let non_zero_length = NonZeroUsize::new(length).ok_or(MmapError::Empty)?;
    let data = unsafe {
        mman::mmap(
            None,
            non_zero_length,
            mman::ProtFlags::PROT_READ | mman::ProtFlags::PROT_WRITE,
            mman::MapFlags::MAP_SHARED,
            fd,
            offset as off_t,
        )
    }?;

    Ok(PlaneMapping { data, len: length })
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::memfd::{memfd_create, MemFdCreateFlag};
    use std::fs::File;

    #[test]
    fn test_shared_mappings() {
        let fd = memfd_create(c"mapping-test", MemFdCreateFlag::MFD_CLOEXEC).unwrap();
        let file = File::from(fd);
        file.set_len(8192).unwrap();

        let whole = mmap(&file, 0, 8192).unwrap();
        let second_page = mmap(&file, 4096, 4096).unwrap();
        assert_eq!(whole.len(), 8192);
        assert_eq!(second_page.len(), 4096);

        unsafe {
            whole.slice_mut(4096, 16).fill(0x5a);
            assert!(second_page.slice(0, 16).iter().all(|&b| b == 0x5a));
        }

        assert!(matches!(mmap(&file, 0, 0), Err(MmapError::Empty)));
        // Offsets must be page-aligned.
        assert!(matches!(
            mmap(&file, 1, 4096),
            Err(MmapError::Errno(Errno::EINVAL))
        ));
    }
}
