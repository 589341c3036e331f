//! Frame submission and synchronization with the compositor.
//!
//! `FramePacer` issues the requests that put a buffer on screen, and provides
//! `round_trip`, which blocks until the compositor has processed everything
//! we sent so far. Both rely on callbacks fired by the compositor and
//! delivered by the event pump.
use std::collections::BTreeSet;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use thiserror::Error;

use crate::compositor::{BufferId, CallbackId, Compositor, ConnectionError, SurfaceId};
use crate::Rect;

#[derive(Debug, Error)]
pub enum RoundTripError {
    #[error("compositor did not reply within {0:?}")]
    TimedOut(Duration),
    #[error("event pump stopped while waiting for the compositor")]
    Cancelled,
    #[error("connection to the compositor was lost")]
    ConnectionLost,
    #[error("error while sending sync request: {0}")]
    Connection(#[from] ConnectionError),
}

struct SyncState {
    waiting: BTreeSet<CallbackId>,
    done: BTreeSet<CallbackId>,
    cancelled: bool,
    lost: bool,
}

/// Rendez-vous between threads waiting for sync replies and the event pump
/// delivering them.
pub struct SyncPoint {
    state: Mutex<SyncState>,
    cond: Condvar,
}

impl Default for SyncPoint {
    fn default() -> Self {
        SyncPoint {
            state: Mutex::new(SyncState {
                waiting: BTreeSet::new(),
                done: BTreeSet::new(),
                cancelled: false,
                lost: false,
            }),
            cond: Condvar::new(),
        }
    }
}

impl SyncPoint {
    pub fn new() -> Self {
        Default::default()
    }

    /// Issue a sync request with `request` and start waiting for its reply.
    /// The request is sent with the lock held, so a reply cannot be
    /// delivered before we know about it.
    pub fn issue<F>(&self, request: F) -> Result<CallbackId, RoundTripError>
    where
        F: FnOnce() -> Result<CallbackId, ConnectionError>,
    {
        let mut state = self.state.lock().unwrap();
        if state.lost {
            return Err(RoundTripError::ConnectionLost);
        }
        if state.cancelled {
            return Err(RoundTripError::Cancelled);
        }

        let callback = request()?;
        state.waiting.insert(callback);
        Ok(callback)
    }

    /// Signal that the reply to `callback` arrived. Returns `false` if nobody
    /// is waiting for it, e.g. because the wait timed out.
    pub fn complete(&self, callback: CallbackId) -> bool {
        let mut state = self.state.lock().unwrap();
        if !state.waiting.remove(&callback) {
            return false;
        }
        state.done.insert(callback);
        self.cond.notify_all();
        true
    }

    /// Wait for the reply to `callback` until `deadline`.
    pub fn wait(&self, callback: CallbackId, deadline: Instant) -> Result<(), RoundTripError> {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.done.remove(&callback) {
                return Ok(());
            }

            let error = if state.lost {
                Some(RoundTripError::ConnectionLost)
            } else if state.cancelled {
                Some(RoundTripError::Cancelled)
            } else {
                None
            };
            let now = Instant::now();
            let error = match error {
                Some(error) => Some(error),
                None if now >= deadline => Some(RoundTripError::TimedOut(Duration::ZERO)),
                None => None,
            };
            if let Some(error) = error {
                // Any reply arriving from now on will be discarded.
                state.waiting.remove(&callback);
                return Err(error);
            }

            state = self.cond.wait_timeout(state, deadline - now).unwrap().0;
        }
    }

    /// Stop waiting for the reply to `callback`.
    pub fn abandon(&self, callback: CallbackId) {
        let mut state = self.state.lock().unwrap();
        state.waiting.remove(&callback);
        state.done.remove(&callback);
    }

    /// Make all current and future waits fail with `Cancelled`.
    pub fn cancel(&self) {
        self.state.lock().unwrap().cancelled = true;
        self.cond.notify_all();
    }

    /// Make all current and future waits fail with `ConnectionLost`.
    pub fn connection_lost(&self) {
        self.state.lock().unwrap().lost = true;
        self.cond.notify_all();
    }

    /// Number of replies still expected.
    pub fn pending(&self) -> usize {
        self.state.lock().unwrap().waiting.len()
    }
}

/// Where the current presentation cycle stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentationState {
    Idle,
    /// A frame has been committed.
    Committed,
    /// The compositor acknowledged the commit through a round trip.
    Synced,
}

/// The last commit, kept until its frame callback fires.
#[derive(Debug)]
pub struct PendingCommit {
    pub callback: CallbackId,
    pub buffer: BufferId,
    pub damage: Rect,
    pub committed_at: Instant,
}

struct PacerState {
    pending: Option<PendingCommit>,
    presentation: PresentationState,
    frames_committed: usize,
    frames_done: usize,
}

pub struct FramePacer {
    compositor: Arc<dyn Compositor>,
    surface: SurfaceId,
    state: Mutex<PacerState>,
    sync: SyncPoint,
}

impl FramePacer {
    pub fn new(compositor: Arc<dyn Compositor>, surface: SurfaceId) -> Self {
        FramePacer {
            compositor,
            surface,
            state: Mutex::new(PacerState {
                pending: None,
                presentation: PresentationState::Idle,
                frames_committed: 0,
                frames_done: 0,
            }),
            sync: SyncPoint::new(),
        }
    }

    pub fn surface(&self) -> SurfaceId {
        self.surface
    }

    /// Show `buffer` on the surface: attach, damage, frame callback, commit
    /// and flush.
    pub fn commit_frame(&self, buffer: BufferId, damage: Rect) -> Result<(), ConnectionError> {
        {
            // Held while sending so the callback cannot fire before the
            // pending commit is recorded.
            let mut state = self.state.lock().unwrap();
            self.compositor.attach(self.surface, Some(buffer))?;
            self.compositor.damage(self.surface, damage)?;
            let callback = self.compositor.frame(self.surface)?;
            self.compositor.commit(self.surface)?;

            if let Some(previous) = state.pending.take() {
                trace!(
                    "Commit of {} superseded before its callback fired",
                    previous.buffer
                );
            }
            state.pending = Some(PendingCommit {
                callback,
                buffer,
                damage,
                committed_at: Instant::now(),
            });
            state.presentation = PresentationState::Committed;
            state.frames_committed += 1;
        }

        trace!("Committed {} with damage {}", buffer, damage);
        self.compositor.flush()
    }

    /// Remove the buffer shown on the surface, so the compositor can release
    /// it.
    pub fn detach(&self) -> Result<(), ConnectionError> {
        {
            let mut state = self.state.lock().unwrap();
            self.compositor.attach(self.surface, None)?;
            self.compositor.commit(self.surface)?;
            state.pending = None;
            state.presentation = PresentationState::Idle;
        }

        debug!("Detached buffer from {}", self.surface);
        self.compositor.flush()
    }

    /// Handle a callback fired by the compositor. Returns `false` if the
    /// callback is neither the pending frame callback nor an awaited sync.
    pub fn handle_done(&self, callback: CallbackId, time: u32) -> bool {
        {
            let mut state = self.state.lock().unwrap();
            if state.pending.as_ref().map(|p| p.callback) == Some(callback) {
                if let Some(pending) = state.pending.take() {
                    trace!(
                        "Frame with {} done after {:?} (compositor time {})",
                        pending.buffer,
                        pending.committed_at.elapsed(),
                        time
                    );
                }
                state.frames_done += 1;
                return true;
            }
        }

        if self.sync.complete(callback) {
            return true;
        }

        debug!("Discarding late or unknown {}", callback);
        false
    }

    /// Block until the compositor processed all our requests, or `timeout`
    /// elapsed.
    pub fn round_trip(&self, timeout: Duration) -> Result<(), RoundTripError> {
        let deadline = Instant::now() + timeout;
        let callback = self.sync.issue(|| self.compositor.sync())?;
        if let Err(e) = self.compositor.flush() {
            self.sync.abandon(callback);
            return Err(e.into());
        }

        match self.sync.wait(callback, deadline) {
            Ok(()) => {
                let mut state = self.state.lock().unwrap();
                if state.presentation == PresentationState::Committed {
                    state.presentation = PresentationState::Synced;
                }
                Ok(())
            }
            Err(RoundTripError::TimedOut(_)) => {
                warn!("Round trip timed out after {:?}", timeout);
                Err(RoundTripError::TimedOut(timeout))
            }
            Err(e) => Err(e),
        }
    }

    /// Close the current presentation cycle.
    pub fn end_cycle(&self) {
        let mut state = self.state.lock().unwrap();
        if state.presentation == PresentationState::Synced {
            state.presentation = PresentationState::Idle;
        }
    }

    pub fn presentation_state(&self) -> PresentationState {
        self.state.lock().unwrap().presentation
    }

    /// The commit whose frame callback has not fired yet, if any.
    pub fn pending_buffer(&self) -> Option<BufferId> {
        self.state.lock().unwrap().pending.as_ref().map(|p| p.buffer)
    }

    pub fn frames_committed(&self) -> usize {
        self.state.lock().unwrap().frames_committed
    }

    /// Number of frame callbacks received.
    pub fn frames_done(&self) -> usize {
        self.state.lock().unwrap().frames_done
    }

    /// The event pump stopped: wake up and fail every round trip.
    pub fn cancel(&self) {
        self.sync.cancel();
    }

    /// The connection died: wake up and fail every round trip.
    pub fn connection_lost(&self) {
        self.sync.connection_lost();
    }
}
