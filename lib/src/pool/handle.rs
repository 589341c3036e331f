use std::fmt::{self, Debug};
use std::sync::{Arc, Weak};

use log::trace;
use thiserror::Error;

use super::buffer::{BufferState, FrameBuffer, Storage};
use super::PoolShared;
use crate::{FrameLayout, PixelFormat};

/// Fuse that returns an acquired buffer to its pool if the handle holding it
/// is dropped before being presented.
struct BufferStateFuse {
    pool: Option<Weak<PoolShared>>,
}

impl BufferStateFuse {
    /// Create a new fuse that will give the buffer back to `pool` if
    /// destroyed before `disarm()` has been called.
    fn new(pool: Weak<PoolShared>) -> Self {
        BufferStateFuse { pool: Some(pool) }
    }

    /// Disarm this fuse, e.g. the buffer will be left untouched when the fuse
    /// is destroyed.
    fn disarm(&mut self) {
        self.pool = None;
    }

    /// Trigger the fuse, i.e. make the buffer return to the Free state, unless
    /// the fuse has been `disarm`ed. The fuse will be disarmed after this call.
    fn trigger(&mut self, buffer: &Arc<FrameBuffer>) {
        match self.pool.take().map(|pool| pool.upgrade()) {
            None => (),
            // The pool is gone, only the state needs fixing.
            Some(None) => {
                buffer.transition(BufferState::Acquired, BufferState::Free);
            }
            Some(Some(pool)) => pool.return_unpresented(buffer),
        }
    }
}

/// Exclusive access to an acquired buffer, given to the producer so it can
/// write a frame into it.
///
/// The handle must be given back to the pool through `BufferPool::present`.
/// Dropping it instead returns the buffer to the pool unpresented.
pub struct FrameBufferHandle {
    buffer: Arc<FrameBuffer>,
    fuse: BufferStateFuse,
}

impl FrameBufferHandle {
    pub(super) fn new(buffer: Arc<FrameBuffer>, pool: Weak<PoolShared>) -> Self {
        FrameBufferHandle {
            buffer,
            fuse: BufferStateFuse::new(pool),
        }
    }

    pub fn layout(&self) -> &FrameLayout {
        self.buffer.layout()
    }

    pub fn index(&self) -> usize {
        self.buffer.index()
    }

    pub fn generation(&self) -> u32 {
        self.buffer.generation()
    }

    pub fn num_planes(&self) -> usize {
        self.layout().planes.len()
    }

    /// Address of the first byte of the buffer's storage. Two live buffers
    /// never share it.
    pub fn storage_ptr(&self) -> *const u8 {
        match self.buffer.storage() {
            Storage::Shm { arena, slice, .. } => arena.region().mapping().as_ptr().wrapping_add(slice.offset),
            Storage::DmaBuf { planes } => planes[0].mapping().as_ptr(),
        }
    }

    /// Returns the bytes of plane `plane`, laid out as described by the
    /// buffer's layout.
    pub fn plane(&self, plane: usize) -> &[u8] {
        let layout = &self.layout().planes[plane];
        // Safe because the buffer is acquired, so nobody else can access it.
        unsafe {
            match self.buffer.storage() {
                Storage::Shm { arena, slice, .. } => arena
                    .region()
                    .mapping()
                    .slice(slice.offset + layout.offset, layout.size),
                Storage::DmaBuf { planes } => planes[plane].mapping().slice(0, layout.size),
            }
        }
    }

    /// Returns the bytes of plane `plane` for writing.
    pub fn plane_mut(&mut self, plane: usize) -> &mut [u8] {
        let layout = &self.buffer.layout().planes[plane];
        // Safe because the buffer is acquired and we have the only handle to it.
        unsafe {
            match self.buffer.storage() {
                Storage::Shm { arena, slice, .. } => arena
                    .region()
                    .mapping()
                    .slice_mut(slice.offset + layout.offset, layout.size),
                Storage::DmaBuf { planes } => planes[plane].mapping().slice_mut(0, layout.size),
            }
        }
    }

    /// Borrow the contents of this buffer as a frame that can be copied.
    pub fn as_foreign(&self) -> ForeignFrame<'_> {
        let layout = self.layout();
        ForeignFrame {
            format: layout.format,
            width: layout.width,
            height: layout.height,
            planes: (0..layout.planes.len())
                .map(|i| ForeignPlane {
                    data: self.plane(i),
                    stride: layout.planes[i].stride,
                })
                .collect(),
        }
    }

    /// Copy `frame` into this buffer, line by line.
    pub fn copy_from(&mut self, frame: &ForeignFrame) -> Result<(), CopyError> {
        let layout = self.layout().clone();
        if frame.format != layout.format
            || frame.width != layout.width
            || frame.height != layout.height
        {
            return Err(CopyError::LayoutMismatch {
                format: frame.format,
                width: frame.width,
                height: frame.height,
            });
        }
        if frame.planes.len() != layout.planes.len() {
            return Err(CopyError::PlaneCount(frame.planes.len(), layout.planes.len()));
        }

        for (i, (src, dst_layout)) in frame.planes.iter().zip(layout.planes.iter()).enumerate() {
            let line_bytes = dst_layout.line_bytes;
            let needed = (dst_layout.lines - 1)
                .checked_mul(src.stride)
                .and_then(|n| n.checked_add(line_bytes))
                .ok_or(CopyError::PlaneTooSmall(i))?;
            if src.stride < line_bytes || src.data.len() < needed {
                return Err(CopyError::PlaneTooSmall(i));
            }

            let dst = self.plane_mut(i);
            for line in 0..dst_layout.lines {
                let src_line = &src.data[line * src.stride..line * src.stride + line_bytes];
                let dst_start = line * dst_layout.stride;
                dst[dst_start..dst_start + line_bytes].copy_from_slice(src_line);
            }
        }
        trace!("Copied {}x{} frame into buffer {}", frame.width, frame.height, self.index());

        Ok(())
    }

    /// Take the buffer out of the handle, leaving its state untouched.
    pub(super) fn into_buffer(mut self) -> Arc<FrameBuffer> {
        self.fuse.disarm();
        Arc::clone(&self.buffer)
    }

    /// Returns whether this handle was acquired from the pool `pool`.
    pub(super) fn belongs_to(&self, pool: &Arc<PoolShared>) -> bool {
        self.fuse
            .pool
            .as_ref()
            .map(|p| std::ptr::eq(p.as_ptr(), Arc::as_ptr(pool)))
            .unwrap_or(false)
    }

    #[cfg(test)]
    pub(super) fn buffer(&self) -> &Arc<FrameBuffer> {
        &self.buffer
    }
}

impl Drop for FrameBufferHandle {
    fn drop(&mut self) {
        self.fuse.trigger(&self.buffer);
    }
}

impl Debug for FrameBufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameBufferHandle")
            .field("buffer", &self.buffer)
            .finish()
    }
}

/// A plane of a frame whose memory is not owned by the pool.
#[derive(Debug, Clone, Copy)]
pub struct ForeignPlane<'a> {
    pub data: &'a [u8],
    /// Bytes between the start of two consecutive lines.
    pub stride: usize,
}

/// A frame whose memory is not owned by the pool. It will be copied into a
/// pool buffer before being presented.
#[derive(Debug, Clone)]
pub struct ForeignFrame<'a> {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub planes: Vec<ForeignPlane<'a>>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CopyError {
    #[error("frame is {width}x{height} {format}, which does not match the pool")]
    LayoutMismatch {
        format: PixelFormat,
        width: u32,
        height: u32,
    },
    #[error("frame has {0} planes, expected {1}")]
    PlaneCount(usize, usize),
    #[error("plane {0} is too small for its stride and height")]
    PlaneTooSmall(usize),
}
