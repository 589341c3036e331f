//! The boundary between the sink and the display compositor.
//!
//! The compositor is a remote peer reached through a connection that can be
//! polled for incoming events. Requests are buffered on our side until
//! `flush` is called, and events are only delivered to us when the
//! connection is read (`prepare_read`, `read_events`) and the read events are
//! dispatched (`dispatch_pending`). This module only describes that contract ;
//! `loopback` provides an in-process peer implementing it.
pub mod loopback;

use std::fmt::{self, Display};
use std::io;
use std::os::fd::{AsFd, BorrowedFd};

use bitflags::bitflags;
use log::debug;
use thiserror::Error;

use crate::{memory::BackingKind, PixelFormat, Rect, ShmFormat};

macro_rules! object_id {
    ($name: ident, $prefix: literal) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub u32);

        impl Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "@{}"), self.0)
            }
        }
    };
}

object_id!(BufferId, "buffer");
object_id!(CallbackId, "callback");
object_id!(ShmPoolId, "shm_pool");
object_id!(SurfaceId, "surface");

bitflags! {
    /// Kinds of buffer memory a compositor can import.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BackingCapabilities: u32 {
        const SHM = 1 << 0;
        const DMABUF = 1 << 1;
    }
}

impl From<BackingKind> for BackingCapabilities {
    fn from(kind: BackingKind) -> Self {
        match kind {
            BackingKind::Shm => BackingCapabilities::SHM,
            BackingKind::DmaBuf => BackingCapabilities::DMABUF,
        }
    }
}

/// What the compositor advertised when we connected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Capabilities {
    pub backings: BackingCapabilities,
    pub shm_formats: Vec<PixelFormat>,
    pub dmabuf_formats: Vec<PixelFormat>,
}

impl Capabilities {
    /// Build the capabilities of a shared-memory only compositor from the
    /// wire codes it advertised. Codes we have no pixel format for are
    /// skipped.
    pub fn from_shm_codes(codes: &[u32]) -> Self {
        let shm_formats = codes
            .iter()
            .filter_map(|&code| {
                let format = ShmFormat::n(code).and_then(PixelFormat::from_shm_format);
                if format.is_none() {
                    debug!("Ignoring unknown shm format code {}", code);
                }
                format
            })
            .collect();

        Capabilities {
            backings: BackingCapabilities::SHM,
            shm_formats,
            dmabuf_formats: Vec::new(),
        }
    }

    /// Returns whether buffers of `format` backed by `kind` memory can be
    /// sent to the compositor.
    pub fn supports(&self, kind: BackingKind, format: PixelFormat) -> bool {
        if !self.backings.contains(kind.into()) {
            return false;
        }
        match kind {
            BackingKind::Shm => self.shm_formats.contains(&format),
            BackingKind::DmaBuf => self.dmabuf_formats.contains(&format),
        }
    }

    /// Pick the backing to use. Exportable buffers are preferred when they
    /// are both advertised and allowed.
    pub fn preferred_backing(&self, allow_dmabuf: bool) -> Option<BackingKind> {
        if allow_dmabuf && self.backings.contains(BackingCapabilities::DMABUF) {
            Some(BackingKind::DmaBuf)
        } else if self.backings.contains(BackingCapabilities::SHM) {
            Some(BackingKind::Shm)
        } else {
            None
        }
    }
}

/// One plane of an exported buffer.
#[derive(Debug, Clone, Copy)]
pub struct DmaBufPlane<'a> {
    pub fd: BorrowedFd<'a>,
    pub offset: u32,
    pub stride: u32,
}

/// Events the compositor can send us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompositorEvent {
    /// The compositor will not read the buffer anymore.
    Release(BufferId),
    /// A frame or sync callback fired. `time` is in milliseconds.
    Done { callback: CallbackId, time: u32 },
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connection to the compositor is closed")]
    Closed,
    #[error("I/O error on compositor connection: {0}")]
    Io(#[from] io::Error),
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// A connection to a display compositor.
///
/// The file descriptor returned by `as_fd` becomes readable when events are
/// waiting to be read with `read_events`.
pub trait Compositor: AsFd + Send + Sync + 'static {
    fn capabilities(&self) -> Capabilities;

    /// Share `size` bytes of the memory behind `fd` with the compositor.
    fn create_shm_pool(&self, fd: BorrowedFd<'_>, size: usize) -> Result<ShmPoolId, ConnectionError>;
    fn create_shm_buffer(
        &self,
        pool: ShmPoolId,
        offset: usize,
        width: u32,
        height: u32,
        stride: u32,
        format: ShmFormat,
    ) -> Result<BufferId, ConnectionError>;
    /// Buffers created from the pool remain valid.
    fn destroy_shm_pool(&self, pool: ShmPoolId) -> Result<(), ConnectionError>;
    fn create_dmabuf_buffer(
        &self,
        width: u32,
        height: u32,
        format: PixelFormat,
        planes: &[DmaBufPlane<'_>],
    ) -> Result<BufferId, ConnectionError>;
    fn destroy_buffer(&self, buffer: BufferId) -> Result<(), ConnectionError>;

    fn attach(&self, surface: SurfaceId, buffer: Option<BufferId>) -> Result<(), ConnectionError>;
    fn damage(&self, surface: SurfaceId, rect: Rect) -> Result<(), ConnectionError>;
    /// Request a callback for when it is a good time to draw the next frame.
    fn frame(&self, surface: SurfaceId) -> Result<CallbackId, ConnectionError>;
    fn commit(&self, surface: SurfaceId) -> Result<(), ConnectionError>;
    /// Request a callback that fires once all previous requests are processed.
    fn sync(&self) -> Result<CallbackId, ConnectionError>;

    /// Send all buffered requests.
    fn flush(&self) -> Result<(), ConnectionError>;

    /// Announce the intention to read the connection. Returns `false` if
    /// events are already queued, in which case they must be dispatched
    /// before trying again.
    fn prepare_read(&self) -> bool;
    /// Read the events available on the connection into the queue. Must only
    /// be called after a successful `prepare_read`.
    fn read_events(&self) -> Result<usize, ConnectionError>;
    /// Give up on a read announced by `prepare_read`.
    fn cancel_read(&self);
    /// Pass every queued event to `handler`. Returns the number of events
    /// dispatched.
    fn dispatch_pending(
        &self,
        handler: &mut dyn FnMut(CompositorEvent),
    ) -> Result<usize, ConnectionError>;
}
