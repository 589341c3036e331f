//! The pool of frame buffers shared with the compositor.
//!
//! Buffers are grouped in generations: every configuration of the pool
//! creates a new one, and at most `pool_size` buffers are ever allocated per
//! generation. The generation of the current configuration is the active one,
//! and is the only one buffers are acquired from. Older generations whose
//! buffers are still held by the compositor are kept as draining until the
//! last of them is released, at which point their storage is freed.
//!
//! A buffer goes through the following states:
//!
//! ```text
//! Free -> Acquired -> Presented -> Releasing -> Free
//!            |                                   ^
//!            +------------- (dropped) -----------+
//! ```
//!
//! Presented buffers only come back through the `ReleaseTracker`, which calls
//! `reclaim` once the compositor released them.
pub mod buffer;
mod handle;

pub use buffer::{BufferState, BufferStats, FrameBuffer};
pub use handle::*;

use std::os::fd::AsFd;
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Condvar, Mutex, MutexGuard, Weak,
};
use std::time::{Duration, Instant};

use log::{debug, error, trace, warn};
use thiserror::Error;

use crate::compositor::{
    BufferId, Capabilities, Compositor, ConnectionError, DmaBufPlane, ShmPoolId,
};
use crate::memory::{AllocError, Arena, BackingAllocator, BackingKind, ARENA_ALIGNMENT};
use crate::pacer::FramePacer;
use crate::release::{DuplicateHandle, Reclaim, ReleaseTracker};
use crate::{align_up, FrameLayout, LayoutError, PixelFormat, Rect, ShmFormat};
use buffer::Storage;

/// What the frames handed to the pool look like.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub plane_count: usize,
}

impl PoolConfig {
    /// Configuration for `format` frames with the number of planes the
    /// format uses.
    pub fn new(format: PixelFormat, width: u32, height: u32) -> Self {
        PoolConfig {
            format,
            width,
            height,
            plane_count: format.planes().map(|p| p.len()).unwrap_or(1),
        }
    }
}

/// Sizing of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    /// Maximum number of buffers per generation.
    pub pool_size: usize,
    /// Buffers allocated as soon as the pool is configured.
    pub min_buffers: usize,
    /// Number of frames the shared memory arena can hold.
    pub arena_frames: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        PoolSettings {
            pool_size: 3,
            min_buffers: 2,
            arena_frames: 15,
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("format {0} is not supported with {1} buffers")]
    UnsupportedFormat(PixelFormat, BackingKind),
    #[error("format {format} has {expected} planes, got {got}")]
    PlaneCountMismatch {
        format: PixelFormat,
        expected: usize,
        got: usize,
    },
    #[error("invalid geometry: {0}")]
    InvalidGeometry(#[from] LayoutError),
    #[error("error while allocating pool storage: {0}")]
    Alloc(#[from] AllocError),
    #[error("error while sharing pool storage: {0}")]
    Connection(#[from] ConnectionError),
    #[error("pool has been shut down")]
    ShutDown,
}

#[derive(Debug, Error)]
pub enum AcquireError {
    #[error("pool is not configured")]
    NotConfigured,
    #[error("all buffers are currently in use")]
    Exhausted,
    #[error("error while allocating buffer: {0}")]
    Alloc(#[from] AllocError),
}

#[derive(Debug, Error)]
pub enum PresentError {
    #[error("error while getting a buffer to copy into: {0}")]
    Acquire(#[from] AcquireError),
    #[error("error while copying frame: {0}")]
    Copy(#[from] CopyError),
    #[error(transparent)]
    DuplicateHandle(#[from] DuplicateHandle),
    #[error("buffer is in state {0:?} and cannot be presented")]
    InvalidState(BufferState),
    #[error("buffer of generation {0} predates the current configuration")]
    StaleBuffer(u32),
    #[error("error while presenting buffer: {0}")]
    Connection(#[from] ConnectionError),
    #[error("pool has been shut down")]
    ShutDown,
}

/// A shared memory arena, along with the compositor object it is shared
/// through.
struct SharedArena {
    arena: Arc<Arena>,
    shm_pool: ShmPoolId,
}

struct Generation {
    id: u32,
    config: PoolConfig,
    layout: Arc<FrameLayout>,
    shm_format: Option<ShmFormat>,
    arena: Mutex<Option<SharedArena>>,
    buffers: Mutex<Vec<Arc<FrameBuffer>>>,
    capacity: AtomicUsize,
    draining: AtomicBool,
}

impl Generation {
    fn buffers(&self) -> MutexGuard<'_, Vec<Arc<FrameBuffer>>> {
        self.buffers.lock().unwrap()
    }

    /// Whether no buffer of the generation is in use.
    fn is_idle(&self) -> bool {
        self.buffers()
            .iter()
            .all(|b| b.state() == BufferState::Free)
    }

    fn contains(&self, buffer: &FrameBuffer) -> bool {
        self.id == buffer.generation()
    }
}

struct PoolInner {
    active: Option<Arc<Generation>>,
    draining: Vec<Arc<Generation>>,
    next_generation: u32,
    shut_down: bool,
}

pub(crate) struct PoolShared {
    compositor: Arc<dyn Compositor>,
    allocator: Arc<dyn BackingAllocator>,
    capabilities: Capabilities,
    settings: PoolSettings,
    tracker: Arc<ReleaseTracker>,
    pacer: Arc<FramePacer>,
    stats: Arc<BufferStats>,
    inner: Mutex<PoolInner>,
    buffer_freed: Condvar,
    this: Weak<PoolShared>,
}

/// See the module documentation.
pub struct BufferPool {
    shared: Arc<PoolShared>,
}

impl BufferPool {
    pub fn new(
        compositor: Arc<dyn Compositor>,
        allocator: Arc<dyn BackingAllocator>,
        pacer: Arc<FramePacer>,
        settings: PoolSettings,
    ) -> Self {
        let capabilities = compositor.capabilities();
        let shared = Arc::new_cyclic(|this: &Weak<PoolShared>| PoolShared {
            compositor,
            allocator,
            capabilities,
            settings,
            tracker: Arc::new(ReleaseTracker::new(this.clone() as Weak<dyn Reclaim>)),
            pacer,
            stats: Arc::new(BufferStats::new()),
            inner: Mutex::new(PoolInner {
                active: None,
                draining: Vec::new(),
                next_generation: 0,
                shut_down: false,
            }),
            buffer_freed: Condvar::new(),
            this: this.clone(),
        });

        BufferPool { shared }
    }

    /// The tracker through which buffers presented by this pool are released.
    pub fn tracker(&self) -> &Arc<ReleaseTracker> {
        &self.shared.tracker
    }

    pub fn backing(&self) -> BackingKind {
        self.shared.allocator.kind()
    }

    /// Set the format and size of the frames. Buffers of a previous
    /// configuration that are still presented are left untouched until the
    /// compositor releases them.
    pub fn configure(&self, config: PoolConfig) -> Result<(), ConfigError> {
        self.shared.configure(config)
    }

    /// Get a free buffer, allocating one if needed and allowed. Never blocks.
    pub fn acquire(&self) -> Result<FrameBufferHandle, AcquireError> {
        self.shared.acquire()
    }

    /// Wait until a buffer can be acquired, or `timeout` elapsed. Returns
    /// whether a buffer can be acquired.
    pub fn wait_for_free(&self, timeout: Duration) -> bool {
        self.shared.wait_for_free(timeout)
    }

    /// Hand `handle` over to the compositor and show it with `damage`.
    ///
    /// Buffers from another pool are copied into one of ours first.
    pub fn present(&self, handle: FrameBufferHandle, damage: Rect) -> Result<BufferId, PresentError> {
        if !handle.belongs_to(&self.shared) {
            debug!("Copying buffer from another pool");
            let mut copy = self.acquire()?;
            copy.copy_from(&handle.as_foreign())?;
            drop(handle);
            return self.shared.present(copy, damage);
        }

        self.shared.present(handle, damage)
    }

    /// Copy `frame` into a buffer of the pool, and present it.
    pub fn present_foreign(&self, frame: &ForeignFrame, damage: Rect) -> Result<BufferId, PresentError> {
        let mut handle = self.acquire()?;
        handle.copy_from(frame)?;
        self.shared.present(handle, damage)
    }

    /// Free all the storage of the pool. Buffers the compositor did not
    /// release are freed anyway. Returns the number of such buffers.
    pub fn shutdown(&self) -> usize {
        self.shared.shutdown()
    }

    /// Number of buffers presented and not reclaimed yet.
    pub fn outstanding(&self) -> usize {
        self.shared.stats.num_presented()
    }

    pub fn num_free(&self) -> usize {
        self.shared.stats.num_free()
    }

    pub fn num_acquired(&self) -> usize {
        self.shared.stats.num_acquired()
    }

    pub fn num_presented(&self) -> usize {
        self.shared.stats.num_presented()
    }

    /// Number of buffers of the active generation.
    pub fn num_buffers(&self) -> usize {
        let inner = self.shared.inner();
        inner.active.as_ref().map(|g| g.buffers().len()).unwrap_or(0)
    }

    /// Maximum number of buffers of the active generation. Lower than the
    /// configured size if buffers had to be retired.
    pub fn capacity(&self) -> usize {
        let inner = self.shared.inner();
        inner
            .active
            .as_ref()
            .map(|g| g.capacity.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn num_draining_generations(&self) -> usize {
        self.shared.inner().draining.len()
    }

    /// Layout of the frames of the current configuration.
    pub fn layout(&self) -> Option<FrameLayout> {
        let inner = self.shared.inner();
        inner.active.as_ref().map(|g| (*g.layout).clone())
    }

    pub fn config(&self) -> Option<PoolConfig> {
        self.shared.inner().active.as_ref().map(|g| g.config)
    }
}

impl PoolShared {
    fn inner(&self) -> MutexGuard<'_, PoolInner> {
        self.inner.lock().unwrap()
    }

    fn configure(&self, config: PoolConfig) -> Result<(), ConfigError> {
        let kind = self.allocator.kind();
        if !self.capabilities.supports(kind, config.format) {
            return Err(ConfigError::UnsupportedFormat(config.format, kind));
        }
        let shm_format = match kind {
            BackingKind::Shm => Some(
                config
                    .format
                    .to_shm_format()
                    .ok_or(ConfigError::UnsupportedFormat(config.format, kind))?,
            ),
            BackingKind::DmaBuf => None,
        };
        let sampling = config
            .format
            .planes()
            .ok_or(ConfigError::UnsupportedFormat(config.format, kind))?;
        if sampling.len() != config.plane_count {
            return Err(ConfigError::PlaneCountMismatch {
                format: config.format,
                expected: sampling.len(),
                got: config.plane_count,
            });
        }
        let layout = FrameLayout::new(
            config.format,
            config.width,
            config.height,
            self.allocator.stride_alignment(),
        )?;

        let mut inner = self.inner();
        if inner.shut_down {
            return Err(ConfigError::ShutDown);
        }
        if let Some(active) = &inner.active {
            if active.config == config {
                debug!("Pool already configured for {:?}, reusing it", config);
                return Ok(());
            }
        }

        // The previous generation stays active until the new one is complete.
        let previous = inner.active.take();
        let idle = previous.as_deref().filter(|p| p.is_idle());
        let id = inner.next_generation;
        let generation = match self.new_generation(id, config, layout, shm_format, idle) {
            Ok(generation) => generation,
            Err(e) => {
                warn!("Cannot configure pool for {:?}: {}", config, e);
                inner.active = previous;
                return Err(e);
            }
        };
        inner.next_generation += 1;

        if let Some(previous) = previous {
            if previous.is_idle() {
                debug!("Destroying idle generation {}", previous.id);
                self.destroy_generation(&previous);
            } else {
                debug!("Generation {} still in use, draining it", previous.id);
                previous.draining.store(true, Ordering::Release);
                inner.draining.push(previous);
            }
        }

        let warmup = generation.buffers().len();
        debug!(
            "Pool configured for {:?} ({} buffers, generation {})",
            config, warmup, id
        );
        inner.active = Some(generation);
        drop(inner);

        if let Err(e) = self.compositor.flush() {
            warn!("Error while flushing pool destruction: {}", e);
        }
        self.buffer_freed.notify_all();

        Ok(())
    }

    /// Build a generation for `config` and allocate its first buffers. The
    /// storage of `idle`, a generation with no buffer in use, may be taken
    /// over. It is given back if the new generation cannot be completed.
    fn new_generation(
        &self,
        id: u32,
        config: PoolConfig,
        layout: FrameLayout,
        shm_format: Option<ShmFormat>,
        idle: Option<&Generation>,
    ) -> Result<Arc<Generation>, ConfigError> {
        let (arena, reused) = match self.allocator.kind() {
            BackingKind::Shm => {
                let (arena, reused) = self.prepare_arena(&layout, idle)?;
                (Some(arena), reused)
            }
            BackingKind::DmaBuf => (None, false),
        };

        let generation = Arc::new(Generation {
            id,
            config,
            layout: Arc::new(layout),
            shm_format,
            arena: Mutex::new(arena),
            buffers: Mutex::new(Vec::new()),
            capacity: AtomicUsize::new(self.settings.pool_size),
            draining: AtomicBool::new(false),
        });

        let warmup = self.settings.min_buffers.min(self.settings.pool_size);
        for _ in 0..warmup {
            match self.allocate_buffer(&generation) {
                Ok(buffer) => generation.buffers().push(buffer),
                Err(e) => {
                    self.release_buffers(&generation);
                    let arena = generation.arena.lock().unwrap().take();
                    match (arena, idle) {
                        (Some(shared), Some(idle)) if reused => {
                            if let Err(err) = shared.arena.reset() {
                                warn!("Cannot rewind arena: {}", err);
                            }
                            *idle.arena.lock().unwrap() = Some(shared);
                        }
                        (Some(shared), _) => self.destroy_arena(shared),
                        (None, _) => (),
                    }
                    return Err(e.into());
                }
            }
        }

        Ok(generation)
    }

    /// Get an arena large enough for the frames of `layout`. The arena of
    /// `idle` is taken over if it is large enough, in which case the returned
    /// flag is set.
    fn prepare_arena(
        &self,
        layout: &FrameLayout,
        idle: Option<&Generation>,
    ) -> Result<(SharedArena, bool), ConfigError> {
        let frames = self.settings.arena_frames.max(self.settings.pool_size);
        let size = align_up(layout.size(), ARENA_ALIGNMENT) * frames;

        if let Some(idle) = idle {
            let fits = idle
                .arena
                .lock()
                .unwrap()
                .as_ref()
                .map_or(false, |shared| shared.arena.capacity() >= size);
            if fits {
                // The arena can only be rewound once no slice is in use.
                self.release_buffers(idle);
                let mut slot = idle.arena.lock().unwrap();
                if let Some(shared) = slot.take() {
                    if shared.arena.reset().is_ok() {
                        debug!("Reusing arena of {} bytes", shared.arena.capacity());
                        return Ok((shared, true));
                    }
                    *slot = Some(shared);
                }
            }
        }

        let arena = Arc::new(Arena::new(self.allocator.allocate_region(size)?));
        let shm_pool = self
            .compositor
            .create_shm_pool(arena.region().as_fd(), arena.capacity())?;
        Ok((SharedArena { arena, shm_pool }, false))
    }

    fn destroy_arena(&self, arena: SharedArena) {
        if let Err(e) = self.compositor.destroy_shm_pool(arena.shm_pool) {
            warn!("Error while destroying {}: {}", arena.shm_pool, e);
        }
    }

    fn allocate_buffer(&self, generation: &Generation) -> Result<Arc<FrameBuffer>, AllocError> {
        let layout = &generation.layout;
        let storage = match (&*generation.arena.lock().unwrap(), generation.shm_format) {
            (Some(shared), Some(format)) => {
                let slice = shared
                    .arena
                    .allocate(layout.size())
                    .ok_or(AllocError::ArenaFull {
                        requested: layout.size(),
                        available: shared.arena.capacity() - shared.arena.used(),
                    })?;
                Storage::Shm {
                    arena: Arc::clone(&shared.arena),
                    slice,
                    shm_pool: shared.shm_pool,
                    format,
                }
            }
            _ => Storage::DmaBuf {
                planes: layout
                    .planes
                    .iter()
                    .map(|p| self.allocator.allocate_region(p.size))
                    .collect::<Result<Vec<_>, _>>()?,
            },
        };

        let index = generation.buffers().len();
        trace!("Allocated buffer {} of generation {}", index, generation.id);
        Ok(Arc::new(FrameBuffer::new(
            index,
            generation.id,
            Arc::clone(&generation.layout),
            storage,
            Arc::clone(&self.stats),
        )))
    }

    fn acquire(&self) -> Result<FrameBufferHandle, AcquireError> {
        let inner = self.inner();
        let generation = inner.active.as_ref().ok_or(AcquireError::NotConfigured)?;
        let buffers = generation.buffers();

        if let Some(buffer) = buffers
            .iter()
            .find(|b| b.transition(BufferState::Free, BufferState::Acquired))
        {
            return Ok(FrameBufferHandle::new(
                Arc::clone(buffer),
                self.this.clone(),
            ));
        }

        if buffers.len() < generation.capacity.load(Ordering::Relaxed) {
            drop(buffers);
            let buffer = self.allocate_buffer(generation)?;
            buffer.transition(BufferState::Free, BufferState::Acquired);
            generation.buffers().push(Arc::clone(&buffer));
            return Ok(FrameBufferHandle::new(buffer, self.this.clone()));
        }

        trace!(
            "No buffer available ({} presented, {} acquired)",
            self.stats.num_presented(),
            self.stats.num_acquired()
        );
        Err(AcquireError::Exhausted)
    }

    fn has_room(generation: &Generation) -> bool {
        let buffers = generation.buffers();
        buffers.len() < generation.capacity.load(Ordering::Relaxed)
            || buffers.iter().any(|b| b.state() == BufferState::Free)
    }

    fn wait_for_free(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner();
        loop {
            if inner.shut_down {
                return false;
            }
            if inner.active.as_deref().map(Self::has_room).unwrap_or(false) {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            inner = self
                .buffer_freed
                .wait_timeout(inner, deadline - now)
                .unwrap()
                .0;
        }
    }

    fn create_handle(&self, buffer: &FrameBuffer) -> Result<BufferId, ConnectionError> {
        let layout = buffer.layout();
        match buffer.storage() {
            Storage::Shm {
                slice,
                shm_pool,
                format,
                ..
            } => self.compositor.create_shm_buffer(
                *shm_pool,
                slice.offset,
                layout.width,
                layout.height,
                layout.planes[0].stride as u32,
                *format,
            ),
            Storage::DmaBuf { planes } => {
                let planes = planes
                    .iter()
                    .zip(layout.planes.iter())
                    .map(|(region, plane)| DmaBufPlane {
                        fd: region.as_fd(),
                        offset: 0,
                        stride: plane.stride as u32,
                    })
                    .collect::<Vec<_>>();
                self.compositor
                    .create_dmabuf_buffer(layout.width, layout.height, layout.format, &planes)
            }
        }
    }

    fn present(&self, handle: FrameBufferHandle, damage: Rect) -> Result<BufferId, PresentError> {
        let buffer = handle.into_buffer();
        let (shut_down, stale) = {
            let inner = self.inner();
            let stale = inner
                .active
                .as_ref()
                .map_or(true, |generation| !generation.contains(&buffer));
            (inner.shut_down, stale)
        };
        if shut_down {
            self.return_unpresented(&buffer);
            return Err(PresentError::ShutDown);
        }
        if stale {
            debug!(
                "Not presenting buffer {} of previous generation {}",
                buffer.index(),
                buffer.generation()
            );
            self.return_unpresented(&buffer);
            return Err(PresentError::StaleBuffer(buffer.generation()));
        }

        let id = match buffer.get_or_create_handle(|b| self.create_handle(b)) {
            Ok(id) => id,
            Err(e) => {
                self.return_unpresented(&buffer);
                return Err(e.into());
            }
        };

        if !buffer.transition(BufferState::Acquired, BufferState::Presented) {
            let state = buffer.state();
            error!("Presenting buffer in state {:?}", state);
            return Err(PresentError::InvalidState(state));
        }

        if let Err(e) = self.tracker.register(id, Arc::clone(&buffer)) {
            error!("Cannot present buffer: {}", e);
            self.retire(&buffer);
            return Err(e.into());
        }

        trace!("Presenting buffer {} as {}", buffer.index(), id);
        self.pacer.commit_frame(id, damage)?;

        Ok(id)
    }

    /// Remove `buffer` from its generation, which permanently loses one
    /// buffer of capacity.
    fn retire(&self, buffer: &Arc<FrameBuffer>) {
        buffer.update_state(|state| *state = BufferState::Free);
        let inner = self.inner();
        for generation in inner.active.iter().chain(inner.draining.iter()) {
            let mut buffers = generation.buffers();
            if let Some(pos) = buffers.iter().position(|b| Arc::ptr_eq(b, buffer)) {
                buffers.remove(pos);
                let capacity = generation.capacity.fetch_sub(1, Ordering::Relaxed) - 1;
                warn!(
                    "Retired buffer {} of generation {}, capacity is now {}",
                    buffer.index(),
                    generation.id,
                    capacity
                );
            }
        }
    }

    /// Return an acquired buffer that was not presented.
    pub(super) fn return_unpresented(&self, buffer: &Arc<FrameBuffer>) {
        let mut inner = self.inner();
        if !buffer.transition(BufferState::Acquired, BufferState::Free) {
            error!("Returning buffer in state {:?}", buffer.state());
        }
        self.buffer_freed_locked(&mut inner, buffer);
    }

    /// Bookkeeping after `buffer` became free, with the pool lock held.
    fn buffer_freed_locked(&self, inner: &mut PoolInner, buffer: &FrameBuffer) {
        let pos = inner
            .draining
            .iter()
            .position(|g| g.contains(buffer) && g.is_idle());
        if let Some(pos) = pos {
            let generation = inner.draining.remove(pos);
            debug!("Generation {} drained, destroying it", generation.id);
            self.destroy_generation(&generation);
            if let Err(e) = self.compositor.flush() {
                warn!("Error while flushing pool destruction: {}", e);
            }
        }

        self.buffer_freed.notify_all();
    }

    /// Destroy the compositor objects of the buffers of a generation and drop
    /// them.
    fn release_buffers(&self, generation: &Generation) {
        let buffers = std::mem::take(&mut *generation.buffers());
        for buffer in &buffers {
            if let Some(id) = buffer.take_handle() {
                if let Err(e) = self.compositor.destroy_buffer(id) {
                    warn!("Error while destroying {}: {}", id, e);
                }
            }
        }
    }

    /// Destroy a generation along with its compositor objects.
    fn destroy_generation(&self, generation: &Generation) {
        self.release_buffers(generation);
        let arena = generation.arena.lock().unwrap().take();
        if let Some(arena) = arena {
            self.destroy_arena(arena);
        }
    }

    fn shutdown(&self) -> usize {
        let forgotten = self.tracker.forget_all();
        let forced = forgotten.len();
        for buffer in forgotten {
            warn!(
                "Buffer {} of generation {} never released, freeing it anyway",
                buffer.index(),
                buffer.generation()
            );
            buffer.update_state(|state| *state = BufferState::Free);
        }

        let mut inner = self.inner();
        inner.shut_down = true;
        let generations = inner
            .active
            .take()
            .into_iter()
            .chain(inner.draining.drain(..))
            .collect::<Vec<_>>();
        for generation in generations {
            debug!("Destroying generation {}", generation.id);
            self.destroy_generation(&generation);
        }
        drop(inner);

        if let Err(e) = self.compositor.flush() {
            debug!("Error while flushing pool destruction: {}", e);
        }
        self.buffer_freed.notify_all();

        forced
    }
}

impl Reclaim for PoolShared {
    fn reclaim(&self, buffer: Arc<FrameBuffer>) {
        let mut inner = self.inner();
        let reclaimed = buffer.update_state(|state| match *state {
            BufferState::Presented | BufferState::Releasing => {
                *state = BufferState::Free;
                true
            }
            _ => false,
        });
        if !reclaimed {
            error!("Reclaiming buffer in state {:?}", buffer.state());
            return;
        }

        trace!(
            "Reclaimed buffer {} of generation {}",
            buffer.index(),
            buffer.generation()
        );
        self.buffer_freed_locked(&mut inner, &buffer);
    }
}
