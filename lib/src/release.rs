//! Tracking of the buffers currently owned by the compositor.
//!
//! Every buffer sent to the compositor is registered here under its
//! compositor handle. The compositor gives buffers back asynchronously with a
//! release event, which the event pump forwards to `on_release_event`. This is
//! the only way a presented buffer can become free again.
use std::collections::{hash_map::Entry, HashMap};
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex, Weak,
};

use log::{debug, error, trace, warn};
use thiserror::Error;

use crate::compositor::BufferId;
use crate::pool::buffer::{BufferState, FrameBuffer};

/// Receiver of the buffers whose last claim has been dropped.
pub(crate) trait Reclaim: Send + Sync {
    fn reclaim(&self, buffer: Arc<FrameBuffer>);
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("{0} is already tracked")]
pub struct DuplicateHandle(pub BufferId);

/// What happened to the buffer a release event was about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The buffer is free again.
    Reclaimed,
    /// The compositor let go of the buffer, but it is still claimed.
    StillClaimed,
    /// No buffer is registered under this handle. The event was ignored.
    Unknown,
}

/// Map of the buffers the compositor currently holds.
pub struct ReleaseTracker {
    handles: Mutex<HashMap<BufferId, Arc<FrameBuffer>>>,
    pool: Weak<dyn Reclaim>,
    released: AtomicUsize,
    ignored: AtomicUsize,
}

impl ReleaseTracker {
    pub(crate) fn new(pool: Weak<dyn Reclaim>) -> Self {
        ReleaseTracker {
            handles: Mutex::new(HashMap::new()),
            pool,
            released: AtomicUsize::new(0),
            ignored: AtomicUsize::new(0),
        }
    }

    /// Record that the compositor now holds `buffer` under `handle`. The
    /// compositor's claim on the buffer is taken here.
    pub fn register(&self, handle: BufferId, buffer: Arc<FrameBuffer>) -> Result<(), DuplicateHandle> {
        let mut handles = self.handles.lock().unwrap();
        match handles.entry(handle) {
            Entry::Occupied(_) => Err(DuplicateHandle(handle)),
            Entry::Vacant(entry) => {
                let claims = buffer.claim();
                trace!("Tracking {} ({} claims)", handle, claims);
                entry.insert(buffer);
                Ok(())
            }
        }
    }

    /// Handle a release event from the compositor. Releasing a handle that is
    /// not tracked (anymore) is harmless.
    pub fn on_release_event(&self, handle: BufferId) -> ReleaseOutcome {
        // The map lock must not be held while calling into the pool.
        let buffer = self.handles.lock().unwrap().remove(&handle);

        let buffer = match buffer {
            Some(buffer) => buffer,
            None => {
                debug!("Ignoring release of untracked {}", handle);
                self.ignored.fetch_add(1, Ordering::Relaxed);
                return ReleaseOutcome::Unknown;
            }
        };
        self.released.fetch_add(1, Ordering::Relaxed);

        if !buffer.transition(BufferState::Presented, BufferState::Releasing) {
            error!(
                "Released {} was in state {:?}",
                handle,
                buffer.state()
            );
        }

        match buffer.unclaim() {
            0 => {
                trace!("{} released by compositor", handle);
                match self.pool.upgrade() {
                    Some(pool) => pool.reclaim(buffer),
                    None => warn!("{} released after its pool was destroyed", handle),
                }
                ReleaseOutcome::Reclaimed
            }
            claims => {
                trace!("{} released by compositor, {} claims left", handle, claims);
                ReleaseOutcome::StillClaimed
            }
        }
    }

    /// Stop tracking every buffer and return them. Only meant for teardown,
    /// when the compositor is not expected to release them anymore.
    pub fn forget_all(&self) -> Vec<Arc<FrameBuffer>> {
        let buffers = self
            .handles
            .lock()
            .unwrap()
            .drain()
            .map(|(handle, buffer)| {
                debug!("Forgetting {}", handle);
                buffer.clear_claims();
                buffer
            })
            .collect();

        buffers
    }

    /// Number of handles currently tracked.
    pub fn len(&self) -> usize {
        self.handles.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_tracked(&self, handle: BufferId) -> bool {
        self.handles.lock().unwrap().contains_key(&handle)
    }

    /// Number of release events that matched a tracked handle.
    pub fn released_count(&self) -> usize {
        self.released.load(Ordering::Relaxed)
    }

    /// Number of release events ignored because their handle was unknown.
    pub fn ignored_count(&self) -> usize {
        self.ignored.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{BackingAllocator, DmaBufAllocator};
    use crate::pool::buffer::{BufferStats, Storage};
    use crate::{FrameLayout, PixelFormat};

    #[derive(Default)]
    struct Recorder(Mutex<Vec<usize>>);

    impl Reclaim for Recorder {
        fn reclaim(&self, buffer: Arc<FrameBuffer>) {
            buffer.transition(BufferState::Releasing, BufferState::Free);
            self.0.lock().unwrap().push(buffer.index());
        }
    }

    fn presented_buffer(index: usize) -> Arc<FrameBuffer> {
        let layout = Arc::new(FrameLayout::new(PixelFormat::BGRA, 8, 8, 64).unwrap());
        let planes = vec![DmaBufAllocator::new().allocate_region(layout.size()).unwrap()];
        let buffer = FrameBuffer::new(
            index,
            0,
            layout,
            Storage::DmaBuf { planes },
            Arc::new(BufferStats::new()),
        );
        buffer.transition(BufferState::Free, BufferState::Acquired);
        buffer.transition(BufferState::Acquired, BufferState::Presented);
        Arc::new(buffer)
    }

    fn tracker() -> (Arc<Recorder>, ReleaseTracker) {
        let recorder = Arc::new(Recorder::default());
        let weak = Arc::downgrade(&recorder) as Weak<dyn Reclaim>;
        (recorder, ReleaseTracker::new(weak))
    }

    #[test]
    fn test_release_is_idempotent() {
        let (recorder, tracker) = tracker();
        let buffer = presented_buffer(3);

        tracker.register(BufferId(1), Arc::clone(&buffer)).unwrap();
        assert!(tracker.is_tracked(BufferId(1)));
        assert_eq!(buffer.claims(), 1);

        assert_eq!(tracker.on_release_event(BufferId(1)), ReleaseOutcome::Reclaimed);
        assert_eq!(tracker.on_release_event(BufferId(1)), ReleaseOutcome::Unknown);
        assert_eq!(*recorder.0.lock().unwrap(), vec![3]);
        assert_eq!(buffer.state(), BufferState::Free);
        assert_eq!(tracker.released_count(), 1);
        assert_eq!(tracker.ignored_count(), 1);
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_unknown_handle() {
        let (recorder, tracker) = tracker();
        assert_eq!(tracker.on_release_event(BufferId(42)), ReleaseOutcome::Unknown);
        assert!(recorder.0.lock().unwrap().is_empty());
    }

    #[test]
    fn test_duplicate_handle() {
        let (_recorder, tracker) = tracker();
        let first = presented_buffer(0);
        let second = presented_buffer(1);

        tracker.register(BufferId(1), first).unwrap();
        assert_eq!(
            tracker.register(BufferId(1), Arc::clone(&second)),
            Err(DuplicateHandle(BufferId(1)))
        );
        // The rejected buffer did not get a claim.
        assert_eq!(second.claims(), 0);
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_still_claimed() {
        let (recorder, tracker) = tracker();
        let buffer = presented_buffer(0);
        buffer.claim();

        tracker.register(BufferId(1), Arc::clone(&buffer)).unwrap();
        assert_eq!(tracker.on_release_event(BufferId(1)), ReleaseOutcome::StillClaimed);
        assert_eq!(buffer.state(), BufferState::Releasing);
        assert!(recorder.0.lock().unwrap().is_empty());
    }

    #[test]
    fn test_forget_all() {
        let (recorder, tracker) = tracker();
        tracker.register(BufferId(1), presented_buffer(0)).unwrap();
        tracker.register(BufferId(2), presented_buffer(1)).unwrap();

        let forgotten = tracker.forget_all();
        assert_eq!(forgotten.len(), 2);
        assert!(forgotten.iter().all(|b| b.claims() == 0));
        assert!(tracker.is_empty());
        // Late releases are ignored.
        assert_eq!(tracker.on_release_event(BufferId(2)), ReleaseOutcome::Unknown);
        assert!(recorder.0.lock().unwrap().is_empty());
    }
}
