use std::fmt::{self, Debug};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

use crate::compositor::{BufferId, ShmPoolId};
use crate::memory::{Arena, ArenaSlice, Region};
use crate::{FrameLayout, ShmFormat};

/// Represents the current state of a frame buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// The buffer can be obtained via `acquire()`.
    Free,
    /// The buffer has been handed to a producer and is not presented yet.
    Acquired,
    /// The buffer has been committed and the compositor may be reading it.
    Presented,
    /// The compositor released the buffer, but someone still holds a claim
    /// on it.
    Releasing,
}

/// Structure that allows a pool and its users to keep track of how many
/// buffers are in each state.
#[derive(Default)]
pub struct BufferStats {
    num_free: AtomicUsize,
    num_acquired: AtomicUsize,
    num_presented: AtomicUsize,
}

impl BufferStats {
    /// Create a new tracker for buffer stats. The stats are initially empty,
    /// buffers register themselves when they are created.
    pub fn new() -> Self {
        Default::default()
    }

    pub fn num_free(&self) -> usize {
        self.num_free.load(Ordering::Relaxed)
    }

    pub fn num_acquired(&self) -> usize {
        self.num_acquired.load(Ordering::Relaxed)
    }

    /// Buffers presented and not reclaimed yet, including the ones the
    /// compositor already released but that are still claimed.
    pub fn num_presented(&self) -> usize {
        self.num_presented.load(Ordering::Relaxed)
    }

    fn counter(&self, state: BufferState) -> &AtomicUsize {
        match state {
            BufferState::Free => &self.num_free,
            BufferState::Acquired => &self.num_acquired,
            BufferState::Presented | BufferState::Releasing => &self.num_presented,
        }
    }
}

/// Where the pixels of a buffer live.
pub(crate) enum Storage {
    /// A slice of the generation's shared arena. Planes are at their layout
    /// offset inside the slice.
    Shm {
        arena: Arc<Arena>,
        slice: ArenaSlice,
        shm_pool: ShmPoolId,
        format: ShmFormat,
    },
    /// One exported region per plane.
    DmaBuf { planes: Vec<Region> },
}

/// One frame allocation.
pub struct FrameBuffer {
    index: usize,
    generation: u32,
    layout: Arc<FrameLayout>,
    storage: Storage,
    /// Compositor-side handle, created the first time the buffer is presented.
    handle: Mutex<Option<BufferId>>,
    /// Number of parties that must let go of the buffer before it is reclaimed.
    claims: AtomicUsize,
    state: Mutex<BufferState>,
    /// Link to the pool's buffer stats, so we can update them as the buffer
    /// state changes.
    stats: Arc<BufferStats>,
}

impl Debug for FrameBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("generation", &self.generation)
            .field("index", &self.index)
            .field("handle", &*self.handle.lock().unwrap())
            .field("state", &self.state())
            .finish()
    }
}

impl Drop for FrameBuffer {
    fn drop(&mut self) {
        let state = *self.state.lock().unwrap();
        self.stats.counter(state).fetch_sub(1, Ordering::Relaxed);
        if let Storage::Shm { arena, slice, .. } = &self.storage {
            arena.release(*slice);
        }
    }
}

impl FrameBuffer {
    pub(crate) fn new(
        index: usize,
        generation: u32,
        layout: Arc<FrameLayout>,
        storage: Storage,
        stats: Arc<BufferStats>,
    ) -> Self {
        stats.num_free.fetch_add(1, Ordering::Relaxed);
        FrameBuffer {
            index,
            generation,
            layout,
            storage,
            handle: Mutex::new(None),
            claims: AtomicUsize::new(0),
            state: Mutex::new(BufferState::Free),
            stats,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Identifier of the pool configuration this buffer was created for.
    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn layout(&self) -> &FrameLayout {
        &self.layout
    }

    pub(crate) fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn state(&self) -> BufferState {
        *self.state.lock().unwrap()
    }

    pub fn compositor_handle(&self) -> Option<BufferId> {
        *self.handle.lock().unwrap()
    }

    /// Returns the compositor handle, creating it with `create` if needed.
    pub(crate) fn get_or_create_handle<E, F: FnOnce(&FrameBuffer) -> Result<BufferId, E>>(
        &self,
        create: F,
    ) -> Result<BufferId, E> {
        let mut handle = self.handle.lock().unwrap();
        match *handle {
            Some(id) => Ok(id),
            None => {
                let id = create(self)?;
                *handle = Some(id);
                Ok(id)
            }
        }
    }

    pub(crate) fn take_handle(&self) -> Option<BufferId> {
        self.handle.lock().unwrap().take()
    }

    pub(crate) fn claim(&self) -> usize {
        self.claims.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drop one claim and return the number of remaining ones.
    pub(crate) fn unclaim(&self) -> usize {
        match self
            .claims
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |c| c.checked_sub(1))
        {
            Ok(previous) => previous - 1,
            Err(_) => 0,
        }
    }

    pub(crate) fn clear_claims(&self) {
        self.claims.store(0, Ordering::Release);
    }

    pub fn claims(&self) -> usize {
        self.claims.load(Ordering::Acquire)
    }

    /// Update the buffer's state. The pool's stats will be updated to reflect
    /// the new state decided by `f`.
    pub(crate) fn update_state<R, F: FnOnce(&mut BufferState) -> R>(&self, f: F) -> R {
        let mut state = self.state.lock().unwrap();
        self.stats.counter(*state).fetch_sub(1, Ordering::Relaxed);

        // Let the provided closure decide the new state.
        let res = f(&mut state);

        self.stats.counter(*state).fetch_add(1, Ordering::Relaxed);

        res
    }

    /// Move the buffer from `from` to `to`. Returns `false` and leaves the
    /// state untouched if the buffer was not in `from`.
    pub(crate) fn transition(&self, from: BufferState, to: BufferState) -> bool {
        self.update_state(|state| {
            if *state == from {
                *state = to;
                true
            } else {
                false
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{BackingAllocator, DmaBufAllocator};
    use crate::PixelFormat;

    fn new_buffer(index: usize, stats: &Arc<BufferStats>) -> FrameBuffer {
        let layout = Arc::new(FrameLayout::new(PixelFormat::BGRA, 16, 16, 64).unwrap());
        let allocator = DmaBufAllocator::new();
        let planes = vec![allocator.allocate_region(layout.size()).unwrap()];
        FrameBuffer::new(index, 0, layout, Storage::DmaBuf { planes }, Arc::clone(stats))
    }

    #[test]
    fn test_buffer_state_update() {
        const NUM_BUFFERS: usize = 4;

        let stats = Arc::new(BufferStats::new());
        let buffers = (0..NUM_BUFFERS)
            .map(|i| {
                let buffer = new_buffer(i, &stats);
                assert_eq!(stats.num_free(), i + 1);
                buffer
            })
            .collect::<Vec<_>>();

        assert!(buffers[0].transition(BufferState::Free, BufferState::Acquired));
        assert!(buffers[1].transition(BufferState::Free, BufferState::Acquired));
        assert_eq!(stats.num_free(), NUM_BUFFERS - 2);
        assert_eq!(stats.num_acquired(), 2);

        // Wrong starting state, nothing happens.
        assert!(!buffers[2].transition(BufferState::Presented, BufferState::Free));
        assert_eq!(buffers[2].state(), BufferState::Free);

        assert!(buffers[0].transition(BufferState::Acquired, BufferState::Presented));
        assert_eq!(stats.num_acquired(), 1);
        assert_eq!(stats.num_presented(), 1);

        assert!(buffers[0].transition(BufferState::Presented, BufferState::Releasing));
        assert_eq!(stats.num_presented(), 1);

        assert!(buffers[0].transition(BufferState::Releasing, BufferState::Free));
        assert_eq!(stats.num_presented(), 0);
        assert_eq!(stats.num_free(), NUM_BUFFERS - 1);

        drop(buffers);
        assert_eq!(stats.num_free(), 0);
        assert_eq!(stats.num_acquired(), 0);
    }

    #[test]
    fn test_claims() {
        let stats = Arc::new(BufferStats::new());
        let buffer = new_buffer(0, &stats);

        assert_eq!(buffer.claim(), 1);
        assert_eq!(buffer.claim(), 2);
        assert_eq!(buffer.unclaim(), 1);
        assert_eq!(buffer.unclaim(), 0);
        // Never goes below zero.
        assert_eq!(buffer.unclaim(), 0);
        assert_eq!(buffer.claims(), 0);
    }

    #[test]
    fn test_lazy_handle() {
        let stats = Arc::new(BufferStats::new());
        let buffer = new_buffer(0, &stats);
        assert_eq!(buffer.compositor_handle(), None);

        let id = buffer
            .get_or_create_handle::<(), _>(|_| Ok(BufferId(9)))
            .unwrap();
        assert_eq!(id, BufferId(9));
        // The handle is only created once.
        let id = buffer
            .get_or_create_handle::<(), _>(|_| panic!("created twice"))
            .unwrap();
        assert_eq!(id, BufferId(9));
        assert_eq!(buffer.take_handle(), Some(BufferId(9)));
        assert_eq!(buffer.compositor_handle(), None);
    }
}
