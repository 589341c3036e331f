//! An in-process compositor, connected to its client through a socket pair.
//!
//! It keeps track of the objects the client creates and of what is shown on
//! each surface, but never draws anything. Requests are processed when the
//! client flushes them, and every event sent back writes one byte to the
//! connection so the client side becomes readable, like a real one would.
//!
//! Its behavior can be tuned to exercise the client: buffers can be released
//! when replaced, right after being committed, or only when asked to with
//! `release`. Sync and frame callbacks can be withheld, and the connection
//! can be cut at any time.
use std::collections::{BTreeMap, VecDeque};
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use log::{debug, trace, warn};

use super::{
    BackingCapabilities, BufferId, CallbackId, Capabilities, Compositor, CompositorEvent,
    ConnectionError, DmaBufPlane, ShmPoolId, SurfaceId,
};
use crate::memory::{mmap, PlaneMapping};
use crate::{PixelFormat, Rect, ShmFormat};

/// When the compositor gives buffers back to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleasePolicy {
    /// When another buffer is committed on the surface, like a compositor
    /// reading directly from client memory.
    OnReplace,
    /// Right after the commit, like a compositor copying the contents.
    Immediate,
    /// Only through `LoopbackCompositor::release`.
    Manual,
}

/// One commit, as seen by the compositor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SurfaceCommit {
    pub surface: SurfaceId,
    pub buffer: Option<BufferId>,
    pub damage: Vec<Rect>,
}

enum Request {
    CreateShmPool {
        id: ShmPoolId,
        fd: OwnedFd,
        size: usize,
    },
    CreateShmBuffer {
        id: BufferId,
        pool: ShmPoolId,
        offset: usize,
        width: u32,
        height: u32,
        stride: u32,
        format: ShmFormat,
    },
    DestroyShmPool(ShmPoolId),
    CreateDmaBufBuffer {
        id: BufferId,
        format: PixelFormat,
        planes: Vec<OwnedFd>,
    },
    DestroyBuffer(BufferId),
    Attach(SurfaceId, Option<BufferId>),
    Damage(SurfaceId, Rect),
    Frame(SurfaceId, CallbackId),
    Commit(SurfaceId),
    Sync(CallbackId),
}

enum BufferContents {
    Shm {
        pool: Arc<PlaneMapping>,
        offset: usize,
        len: usize,
    },
    // Keeping the descriptors open is all a compositor does until it imports
    // the buffer.
    DmaBuf {
        _planes: Vec<OwnedFd>,
    },
}

#[derive(Default)]
struct SurfaceState {
    pending_buffer: Option<Option<BufferId>>,
    pending_damage: Vec<Rect>,
    pending_frames: Vec<CallbackId>,
    front: Option<BufferId>,
}

struct State {
    server: Option<UnixStream>,
    next_id: u32,
    requests: Vec<Request>,
    // Events sent but not read by the client yet.
    wire: VecDeque<CompositorEvent>,
    // Events read by the client but not dispatched yet.
    queue: VecDeque<CompositorEvent>,

    pools: BTreeMap<ShmPoolId, Arc<PlaneMapping>>,
    buffers: BTreeMap<BufferId, BufferContents>,
    surfaces: BTreeMap<SurfaceId, SurfaceState>,
    held_frames: Vec<CallbackId>,
    held_syncs: Vec<CallbackId>,
    log: Vec<SurfaceCommit>,

    release_policy: ReleasePolicy,
    sync_replies: bool,
    frame_callbacks: bool,
}

impl State {
    fn new_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    fn send(&mut self, event: CompositorEvent) -> Result<(), ConnectionError> {
        let server = self.server.as_mut().ok_or(ConnectionError::Closed)?;
        trace!("Loopback compositor sending {:?}", event);
        self.wire.push_back(event);
        server.write_all(&[0u8])?;
        Ok(())
    }

    fn release(&mut self, buffer: BufferId) -> Result<(), ConnectionError> {
        // Destroyed objects do not receive events anymore.
        if self.buffers.contains_key(&buffer) {
            self.send(CompositorEvent::Release(buffer))?;
        }
        Ok(())
    }

    fn surface(&mut self, surface: SurfaceId) -> Result<&mut SurfaceState, String> {
        self.surfaces
            .get_mut(&surface)
            .ok_or_else(|| format!("unknown surface {}", surface))
    }

    fn process(&mut self, request: Request, now: u32) -> Result<(), ConnectionError> {
        match request {
            Request::CreateShmPool { id, fd, size } => {
                let mapping = mmap(&fd, 0, size)
                    .map_err(|e| ConnectionError::Protocol(format!("cannot map {}: {}", id, e)))?;
                self.pools.insert(id, Arc::new(mapping));
            }
            Request::CreateShmBuffer {
                id,
                pool,
                offset,
                width,
                height,
                stride,
                format,
            } => {
                let mapping = self
                    .pools
                    .get(&pool)
                    .ok_or_else(|| ConnectionError::Protocol(format!("unknown {}", pool)))?;
                let len = stride as usize * height as usize;
                if (stride as usize) < width as usize * 4 || offset + len > mapping.len() {
                    return Err(ConnectionError::Protocol(format!(
                        "{} ({}x{}, stride {}, {:?}) does not fit in {}",
                        id, width, height, stride, format, pool
                    )));
                }
                let contents = BufferContents::Shm {
                    pool: Arc::clone(mapping),
                    offset,
                    len,
                };
                self.buffers.insert(id, contents);
            }
            Request::DestroyShmPool(pool) => {
                self.pools
                    .remove(&pool)
                    .ok_or_else(|| ConnectionError::Protocol(format!("unknown {}", pool)))?;
            }
            Request::CreateDmaBufBuffer { id, format, planes } => {
                let expected = format.planes().map(|p| p.len()).unwrap_or(0);
                if planes.len() != expected {
                    return Err(ConnectionError::Protocol(format!(
                        "{} has {} planes, {} expects {}",
                        id,
                        planes.len(),
                        format,
                        expected
                    )));
                }
                self.buffers
                    .insert(id, BufferContents::DmaBuf { _planes: planes });
            }
            Request::DestroyBuffer(buffer) => {
                self.buffers
                    .remove(&buffer)
                    .ok_or_else(|| ConnectionError::Protocol(format!("unknown {}", buffer)))?;
            }
            Request::Attach(surface, buffer) => {
                if let Some(buffer) = buffer {
                    if !self.buffers.contains_key(&buffer) {
                        return Err(ConnectionError::Protocol(format!(
                            "attaching destroyed {}",
                            buffer
                        )));
                    }
                }
                self.surface(surface)
                    .map_err(ConnectionError::Protocol)?
                    .pending_buffer = Some(buffer);
            }
            Request::Damage(surface, rect) => {
                self.surface(surface)
                    .map_err(ConnectionError::Protocol)?
                    .pending_damage
                    .push(rect);
            }
            Request::Frame(surface, callback) => {
                self.surface(surface)
                    .map_err(ConnectionError::Protocol)?
                    .pending_frames
                    .push(callback);
            }
            Request::Commit(surface) => self.commit(surface, now)?,
            Request::Sync(callback) => {
                if self.sync_replies {
                    self.send(CompositorEvent::Done {
                        callback,
                        time: now,
                    })?;
                } else {
                    trace!("Holding reply to {}", callback);
                    self.held_syncs.push(callback);
                }
            }
        }

        Ok(())
    }

    fn commit(&mut self, surface: SurfaceId, now: u32) -> Result<(), ConnectionError> {
        let state = self.surface(surface).map_err(ConnectionError::Protocol)?;
        let damage = std::mem::take(&mut state.pending_damage);
        let frames = std::mem::take(&mut state.pending_frames);
        let previous = state.front;
        if let Some(buffer) = state.pending_buffer.take() {
            state.front = buffer;
        }
        let front = state.front;

        self.log.push(SurfaceCommit {
            surface,
            buffer: front,
            damage,
        });

        match self.release_policy {
            ReleasePolicy::OnReplace => {
                if let Some(previous) = previous.filter(|&p| Some(p) != front) {
                    self.release(previous)?;
                }
            }
            ReleasePolicy::Immediate => {
                if let Some(front) = front.filter(|&f| Some(f) != previous) {
                    self.release(front)?;
                }
            }
            ReleasePolicy::Manual => (),
        }

        for callback in frames {
            if self.frame_callbacks {
                self.send(CompositorEvent::Done {
                    callback,
                    time: now,
                })?;
            } else {
                self.held_frames.push(callback);
            }
        }

        Ok(())
    }
}

/// See the module documentation.
pub struct LoopbackCompositor {
    client: UnixStream,
    capabilities: Capabilities,
    start: Instant,
    state: Mutex<State>,
}

impl LoopbackCompositor {
    /// Create a compositor accepting both backings and every format this
    /// crate knows about.
    pub fn new() -> io::Result<Self> {
        Self::with_capabilities(Capabilities {
            backings: BackingCapabilities::SHM | BackingCapabilities::DMABUF,
            shm_formats: vec![PixelFormat::BGRX, PixelFormat::BGRA],
            dmabuf_formats: vec![
                PixelFormat::BGRX,
                PixelFormat::BGRA,
                PixelFormat::NV12,
                PixelFormat::I420,
            ],
        })
    }

    pub fn with_capabilities(capabilities: Capabilities) -> io::Result<Self> {
        let (client, server) = UnixStream::pair()?;
        client.set_nonblocking(true)?;

        Ok(LoopbackCompositor {
            client,
            capabilities,
            start: Instant::now(),
            state: Mutex::new(State {
                server: Some(server),
                next_id: 0,
                requests: Vec::new(),
                wire: VecDeque::new(),
                queue: VecDeque::new(),
                pools: BTreeMap::new(),
                buffers: BTreeMap::new(),
                surfaces: BTreeMap::new(),
                held_frames: Vec::new(),
                held_syncs: Vec::new(),
                log: Vec::new(),
                release_policy: ReleasePolicy::OnReplace,
                sync_replies: true,
                frame_callbacks: true,
            }),
        })
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    fn queue_request(&self, request: Request) -> Result<(), ConnectionError> {
        let mut state = self.state();
        if state.server.is_none() {
            return Err(ConnectionError::Closed);
        }
        state.requests.push(request);
        Ok(())
    }

    fn now(&self) -> u32 {
        self.start.elapsed().as_millis() as u32
    }

    /// Create a new surface to show buffers on.
    pub fn create_surface(&self) -> SurfaceId {
        let mut state = self.state();
        let id = SurfaceId(state.new_id());
        state.surfaces.insert(id, Default::default());
        id
    }

    pub fn set_release_policy(&self, policy: ReleasePolicy) {
        self.state().release_policy = policy;
    }

    /// Whether sync requests are answered. Requests received while disabled
    /// are held until `reply_held_syncs` is called.
    pub fn set_sync_replies(&self, enabled: bool) {
        self.state().sync_replies = enabled;
    }

    /// Whether frame callbacks fire on commit. Callbacks received while
    /// disabled never fire.
    pub fn set_frame_callbacks(&self, enabled: bool) {
        self.state().frame_callbacks = enabled;
    }

    /// Send a release event for `buffer`, whether it exists or not.
    pub fn release(&self, buffer: BufferId) -> Result<(), ConnectionError> {
        self.state().send(CompositorEvent::Release(buffer))
    }

    /// Answer all the sync requests held so far.
    pub fn reply_held_syncs(&self) -> Result<usize, ConnectionError> {
        let now = self.now();
        let mut state = self.state();
        let held = std::mem::take(&mut state.held_syncs);
        for &callback in &held {
            state.send(CompositorEvent::Done {
                callback,
                time: now,
            })?;
        }
        Ok(held.len())
    }

    /// Close the connection from the compositor side.
    pub fn disconnect(&self) {
        debug!("Loopback compositor disconnecting");
        self.state().server = None;
    }

    pub fn is_connected(&self) -> bool {
        self.state().server.is_some()
    }

    /// All the commits processed so far, oldest first.
    pub fn surface_log(&self) -> Vec<SurfaceCommit> {
        self.state().log.clone()
    }

    /// The buffer currently shown on `surface`.
    pub fn front_buffer(&self, surface: SurfaceId) -> Option<BufferId> {
        self.state().surfaces.get(&surface).and_then(|s| s.front)
    }

    /// Number of buffer objects that have not been destroyed.
    pub fn live_buffers(&self) -> usize {
        self.state().buffers.len()
    }

    /// Number of shared memory pools that have not been destroyed.
    pub fn live_shm_pools(&self) -> usize {
        self.state().pools.len()
    }

    pub fn held_syncs(&self) -> usize {
        self.state().held_syncs.len()
    }

    pub fn held_frame_callbacks(&self) -> usize {
        self.state().held_frames.len()
    }

    /// Read the contents of a shared memory buffer as the compositor sees
    /// them. Returns `None` for unknown and exported buffers.
    pub fn read_buffer(&self, buffer: BufferId) -> Option<Vec<u8>> {
        let state = self.state();
        match state.buffers.get(&buffer)? {
            // Safe because the client has handed this range over to us.
            BufferContents::Shm { pool, offset, len } => {
                Some(unsafe { pool.slice(*offset, *len) }.to_vec())
            }
            BufferContents::DmaBuf { .. } => None,
        }
    }
}

impl AsFd for LoopbackCompositor {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.client.as_fd()
    }
}

impl Compositor for LoopbackCompositor {
    fn capabilities(&self) -> Capabilities {
        self.capabilities.clone()
    }

    fn create_shm_pool(&self, fd: BorrowedFd<'_>, size: usize) -> Result<ShmPoolId, ConnectionError> {
        let fd = fd.try_clone_to_owned()?;
        let id = ShmPoolId(self.state().new_id());
        self.queue_request(Request::CreateShmPool { id, fd, size })?;
        Ok(id)
    }

    fn create_shm_buffer(
        &self,
        pool: ShmPoolId,
        offset: usize,
        width: u32,
        height: u32,
        stride: u32,
        format: ShmFormat,
    ) -> Result<BufferId, ConnectionError> {
        let id = BufferId(self.state().new_id());
        self.queue_request(Request::CreateShmBuffer {
            id,
            pool,
            offset,
            width,
            height,
            stride,
            format,
        })?;
        Ok(id)
    }

    fn destroy_shm_pool(&self, pool: ShmPoolId) -> Result<(), ConnectionError> {
        self.queue_request(Request::DestroyShmPool(pool))
    }

    fn create_dmabuf_buffer(
        &self,
        _width: u32,
        _height: u32,
        format: PixelFormat,
        planes: &[DmaBufPlane<'_>],
    ) -> Result<BufferId, ConnectionError> {
        let planes = planes
            .iter()
            .map(|p| p.fd.try_clone_to_owned())
            .collect::<io::Result<Vec<_>>>()?;
        let id = BufferId(self.state().new_id());
        self.queue_request(Request::CreateDmaBufBuffer { id, format, planes })?;
        Ok(id)
    }

    fn destroy_buffer(&self, buffer: BufferId) -> Result<(), ConnectionError> {
        self.queue_request(Request::DestroyBuffer(buffer))
    }

    fn attach(&self, surface: SurfaceId, buffer: Option<BufferId>) -> Result<(), ConnectionError> {
        self.queue_request(Request::Attach(surface, buffer))
    }

    fn damage(&self, surface: SurfaceId, rect: Rect) -> Result<(), ConnectionError> {
        self.queue_request(Request::Damage(surface, rect))
    }

    fn frame(&self, surface: SurfaceId) -> Result<CallbackId, ConnectionError> {
        let id = CallbackId(self.state().new_id());
        self.queue_request(Request::Frame(surface, id))?;
        Ok(id)
    }

    fn commit(&self, surface: SurfaceId) -> Result<(), ConnectionError> {
        self.queue_request(Request::Commit(surface))
    }

    fn sync(&self) -> Result<CallbackId, ConnectionError> {
        let id = CallbackId(self.state().new_id());
        self.queue_request(Request::Sync(id))?;
        Ok(id)
    }

    fn flush(&self) -> Result<(), ConnectionError> {
        let now = self.now();
        let mut state = self.state();
        if state.server.is_none() {
            return Err(ConnectionError::Closed);
        }

        let requests = std::mem::take(&mut state.requests);
        for request in requests {
            if let Err(e) = state.process(request, now) {
                // A real compositor kills misbehaving clients.
                warn!("Loopback compositor dropping client: {}", e);
                state.server = None;
                return Err(e);
            }
        }

        Ok(())
    }

    fn prepare_read(&self) -> bool {
        self.state().queue.is_empty()
    }

    fn read_events(&self) -> Result<usize, ConnectionError> {
        let mut state = self.state();
        let mut buf = [0u8; 64];
        let mut read = 0;

        loop {
            match (&self.client).read(&mut buf) {
                Ok(0) => {
                    if read > 0 {
                        break;
                    }
                    return Err(ConnectionError::Closed);
                }
                Ok(n) => {
                    for _ in 0..n {
                        match state.wire.pop_front() {
                            Some(event) => state.queue.push_back(event),
                            None => {
                                return Err(ConnectionError::Protocol(
                                    "data without event".into(),
                                ))
                            }
                        }
                    }
                    read += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Ok(read)
    }

    fn cancel_read(&self) {}

    fn dispatch_pending(
        &self,
        handler: &mut dyn FnMut(CompositorEvent),
    ) -> Result<usize, ConnectionError> {
        let mut dispatched = 0;
        // Handlers may send requests, so never call them with the lock held.
        loop {
            let event = self.state().queue.pop_front();
            match event {
                Some(event) => {
                    handler(event);
                    dispatched += 1;
                }
                None => break,
            }
        }

        Ok(dispatched)
    }
}
