//! The video sink, tying the pool, release tracker, event pump and frame
//! pacer together.
//!
//! A `VideoSink` is created for one surface of one compositor connection. It
//! picks the kind of buffers to use from what the compositor advertised,
//! starts the event pump, and then accepts frames through `render`. Frames
//! can either be buffers acquired from the sink's pool, which are shown
//! without copy, or foreign frames that are copied into a pool buffer first.
//!
//! `stop` tears the sink down: the surface is detached, the compositor is
//! given a bounded number of round trips to release the buffers it still
//! holds, and everything is freed, whether released or not.
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use log::{debug, error, trace, warn};
use thiserror::Error;

use crate::compositor::{BufferId, Compositor, CompositorEvent, ConnectionError, SurfaceId};
use crate::memory::{BackingAllocator, BackingKind, DmaBufAllocator, ShmAllocator};
use crate::pacer::{FramePacer, RoundTripError};
use crate::pool::{
    AcquireError, BufferPool, ConfigError, ForeignFrame, FrameBufferHandle, PoolConfig,
    PoolSettings, PresentError,
};
use crate::pump::{EventHandler, EventPump, PumpError};
use crate::release::{ReleaseOutcome, ReleaseTracker};
use crate::Rect;

/// Settings of a `VideoSink`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkConfig {
    /// Maximum number of buffers per configuration.
    pub pool_size: usize,
    /// Buffers allocated as soon as the sink is configured.
    pub min_buffers: usize,
    /// Frames the shared memory arena is sized for.
    pub arena_frames: usize,
    pub round_trip_timeout: Duration,
    /// Round trips attempted during teardown before giving up on the
    /// compositor releasing its buffers.
    pub teardown_retries: usize,
    /// Pause between two teardown round trips.
    pub drain_poll_interval: Duration,
    /// Whether the window size is imposed by the compositor.
    pub fullscreen: bool,
    /// Use exported buffers if the compositor supports them.
    pub prefer_dmabuf: bool,
    /// Wait for the compositor to process every frame before `render`
    /// returns.
    pub sync_after_present: bool,
}

impl Default for SinkConfig {
    fn default() -> Self {
        SinkConfig {
            pool_size: 3,
            min_buffers: 2,
            arena_frames: 15,
            round_trip_timeout: Duration::from_secs(2),
            teardown_retries: 5,
            drain_poll_interval: Duration::from_millis(10),
            fullscreen: false,
            prefer_dmabuf: true,
            sync_after_present: true,
        }
    }
}

impl SinkConfig {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn pool_size(mut self, pool_size: usize) -> Self {
        self.pool_size = pool_size;
        self
    }

    pub fn min_buffers(mut self, min_buffers: usize) -> Self {
        self.min_buffers = min_buffers;
        self
    }

    pub fn arena_frames(mut self, arena_frames: usize) -> Self {
        self.arena_frames = arena_frames;
        self
    }

    pub fn round_trip_timeout(mut self, timeout: Duration) -> Self {
        self.round_trip_timeout = timeout;
        self
    }

    pub fn teardown_retries(mut self, retries: usize) -> Self {
        self.teardown_retries = retries;
        self
    }

    pub fn drain_poll_interval(mut self, interval: Duration) -> Self {
        self.drain_poll_interval = interval;
        self
    }

    pub fn fullscreen(mut self, fullscreen: bool) -> Self {
        self.fullscreen = fullscreen;
        self
    }

    pub fn prefer_dmabuf(mut self, prefer: bool) -> Self {
        self.prefer_dmabuf = prefer;
        self
    }

    pub fn sync_after_present(mut self, sync: bool) -> Self {
        self.sync_after_present = sync;
        self
    }

    fn pool_settings(&self) -> PoolSettings {
        PoolSettings {
            pool_size: self.pool_size,
            min_buffers: self.min_buffers,
            arena_frames: self.arena_frames,
        }
    }
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("compositor supports none of the usable buffer backings")]
    NoBacking,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Acquire(#[from] AcquireError),
    #[error(transparent)]
    Present(#[from] PresentError),
    #[error(transparent)]
    RoundTrip(#[from] RoundTripError),
    #[error("connection to the compositor was lost: {0}")]
    ConnectionLost(String),
    #[error("error while starting event pump: {0}")]
    Pump(#[from] PumpError),
    #[error("sink is stopped")]
    Stopped,
}

impl SinkError {
    /// Whether the sink can still be used after this error.
    pub fn is_recoverable(&self) -> bool {
        match self {
            // A failed configuration leaves the previous one in place.
            SinkError::Config(e) => {
                !matches!(e, ConfigError::Connection(_) | ConfigError::ShutDown)
            }
            SinkError::Acquire(e) => matches!(e, AcquireError::Exhausted),
            SinkError::Present(e) => matches!(
                e,
                PresentError::Acquire(AcquireError::Exhausted)
                    | PresentError::Copy(_)
                    | PresentError::StaleBuffer(_)
                    | PresentError::DuplicateHandle(_)
            ),
            SinkError::RoundTrip(e) => matches!(e, RoundTripError::TimedOut(_)),
            SinkError::NoBacking
            | SinkError::ConnectionLost(_)
            | SinkError::Pump(_)
            | SinkError::Stopped => false,
        }
    }
}

/// A frame handed to `VideoSink::render`.
pub enum Frame<'a> {
    /// A buffer acquired from the sink, shown without copy.
    Pooled(FrameBufferHandle),
    /// A frame in memory the sink does not own.
    Foreign(ForeignFrame<'a>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkState {
    Running,
    /// Waiting for the compositor to release our buffers.
    Stopping,
    /// No round trip will be attempted anymore.
    Drained,
    Stopped,
}

/// What happened while tearing down.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TeardownReport {
    /// Round trips performed to collect outstanding buffers.
    pub rounds: usize,
    /// Round trips that timed out.
    pub timeouts: usize,
    /// Buffers the compositor never released and that were freed anyway.
    pub forced: usize,
}

/// The connection error reported by the pump, if any.
#[derive(Default)]
struct ConnectionStatus(Mutex<Option<String>>);

impl ConnectionStatus {
    fn set_lost(&self, error: &ConnectionError) {
        self.0.lock().unwrap().get_or_insert_with(|| error.to_string());
    }

    fn lost(&self) -> Option<String> {
        self.0.lock().unwrap().clone()
    }
}

/// Routes the events read by the pump to the tracker and the pacer.
struct SinkEventHandler {
    tracker: Arc<ReleaseTracker>,
    pacer: Arc<FramePacer>,
    status: Arc<ConnectionStatus>,
}

impl EventHandler for SinkEventHandler {
    fn handle_event(&mut self, event: CompositorEvent) {
        match event {
            CompositorEvent::Release(buffer) => match self.tracker.on_release_event(buffer) {
                ReleaseOutcome::Reclaimed => trace!("{} reclaimed", buffer),
                outcome => trace!("Release of {}: {:?}", buffer, outcome),
            },
            CompositorEvent::Done { callback, time } => {
                self.pacer.handle_done(callback, time);
            }
        }
    }

    fn connection_lost(&mut self, error: &ConnectionError) {
        self.status.set_lost(error);
        self.pacer.connection_lost();
    }

    fn pump_stopped(&mut self) {
        self.pacer.cancel();
    }
}

#[derive(Default)]
struct Geometry {
    video: Option<Rect>,
    window: Option<Rect>,
}

/// See the module documentation.
pub struct VideoSink {
    config: SinkConfig,
    pacer: Arc<FramePacer>,
    pool: BufferPool,
    pump: Mutex<EventPump>,
    status: Arc<ConnectionStatus>,
    geometry: Mutex<Geometry>,
    state: Mutex<SinkState>,
}

impl VideoSink {
    /// Create a sink showing frames on `surface`, using the best kind of
    /// buffers `compositor` supports.
    pub fn new(
        compositor: Arc<dyn Compositor>,
        surface: SurfaceId,
        config: SinkConfig,
    ) -> Result<Self, SinkError> {
        let allocator: Arc<dyn BackingAllocator> = match compositor
            .capabilities()
            .preferred_backing(config.prefer_dmabuf)
            .ok_or(SinkError::NoBacking)?
        {
            BackingKind::Shm => Arc::new(ShmAllocator::new()),
            BackingKind::DmaBuf => Arc::new(DmaBufAllocator::new()),
        };

        Self::with_allocator(compositor, surface, allocator, config)
    }

    /// Create a sink using buffers from `allocator`.
    pub fn with_allocator(
        compositor: Arc<dyn Compositor>,
        surface: SurfaceId,
        allocator: Arc<dyn BackingAllocator>,
        config: SinkConfig,
    ) -> Result<Self, SinkError> {
        let kind = allocator.kind();
        if !compositor.capabilities().backings.contains(kind.into()) {
            error!("Compositor does not support {} buffers", kind);
            return Err(SinkError::NoBacking);
        }

        let pacer = Arc::new(FramePacer::new(Arc::clone(&compositor), surface));
        let pool = BufferPool::new(
            Arc::clone(&compositor),
            allocator,
            Arc::clone(&pacer),
            config.pool_settings(),
        );
        let status = Arc::new(ConnectionStatus::default());
        let pump = EventPump::start(
            compositor,
            SinkEventHandler {
                tracker: Arc::clone(pool.tracker()),
                pacer: Arc::clone(&pacer),
                status: Arc::clone(&status),
            },
        )?;

        let sink = VideoSink {
            config,
            pacer,
            pool,
            pump: Mutex::new(pump),
            status,
            geometry: Default::default(),
            state: Mutex::new(SinkState::Running),
        };

        // Make sure the compositor is responsive before accepting frames.
        sink.round_trip()?;
        debug!("Sink started on {} with {} buffers", surface, kind);

        Ok(sink)
    }

    /// Fails if the connection has been lost or the sink stopped.
    fn check_running(&self) -> Result<(), SinkError> {
        if let Some(error) = self.status.lost() {
            return Err(SinkError::ConnectionLost(error));
        }
        match *self.state.lock().unwrap() {
            SinkState::Running => Ok(()),
            _ => Err(SinkError::Stopped),
        }
    }

    fn round_trip_error(&self, error: RoundTripError) -> SinkError {
        match (error, self.status.lost()) {
            (RoundTripError::ConnectionLost, Some(reason)) => SinkError::ConnectionLost(reason),
            (error, _) => error.into(),
        }
    }

    fn set_state(&self, state: SinkState) {
        debug!("Sink state: {:?}", state);
        *self.state.lock().unwrap() = state;
    }

    /// Set the format and size of the frames to come.
    pub fn configure(&self, config: PoolConfig) -> Result<(), SinkError> {
        self.check_running()?;
        self.pool.configure(config)?;
        self.geometry.lock().unwrap().video = Some(Rect::new(0, 0, config.width, config.height));
        Ok(())
    }

    /// Get a buffer to write a frame into. Never blocks.
    pub fn acquire(&self) -> Result<FrameBufferHandle, SinkError> {
        self.check_running()?;
        Ok(self.pool.acquire()?)
    }

    /// Wait until `acquire` can succeed, or `timeout` elapsed.
    pub fn wait_for_free(&self, timeout: Duration) -> Result<bool, SinkError> {
        self.check_running()?;
        Ok(self.pool.wait_for_free(timeout))
    }

    /// Show `frame`, and return the compositor handle of the buffer it has
    /// been shown with.
    pub fn render(&self, frame: Frame) -> Result<BufferId, SinkError> {
        self.check_running()?;
        let config = self.pool.config().ok_or(AcquireError::NotConfigured)?;
        let damage = Rect::new(0, 0, config.width, config.height);

        let buffer = match frame {
            Frame::Pooled(handle) => self.pool.present(handle, damage)?,
            Frame::Foreign(frame) => self.pool.present_foreign(&frame, damage)?,
        };

        if self.config.sync_after_present {
            match self.pacer.round_trip(self.config.round_trip_timeout) {
                Ok(()) => self.pacer.end_cycle(),
                // The frame is on its way, the next one will tell whether the
                // compositor is really stuck.
                Err(RoundTripError::TimedOut(_)) => (),
                Err(e) => return Err(self.round_trip_error(e)),
            }
        }

        Ok(buffer)
    }

    /// Block until the compositor has processed all our requests.
    pub fn round_trip(&self) -> Result<(), SinkError> {
        self.check_running()?;
        self.pacer
            .round_trip(self.config.round_trip_timeout)
            .map_err(|e| self.round_trip_error(e))
    }

    /// The compositor gave the window a new size. Only honoured in fullscreen
    /// mode, where the compositor decides the size.
    pub fn set_window_size(&self, width: u32, height: u32) {
        if !self.config.fullscreen {
            debug!("Ignoring window size {}x{} outside of fullscreen", width, height);
            return;
        }
        self.geometry.lock().unwrap().window = Some(Rect::new(0, 0, width, height));
    }

    /// Where the video is shown: centered in the window if it has a size
    /// imposed, at the origin otherwise.
    pub fn output_rect(&self) -> Option<Rect> {
        let geometry = self.geometry.lock().unwrap();
        let video = geometry.video?;
        Some(match &geometry.window {
            Some(window) => video.center_in(window),
            None => video,
        })
    }

    /// Number of buffers the compositor has not released yet.
    pub fn outstanding_buffers(&self) -> usize {
        self.pool.outstanding()
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    pub fn pacer(&self) -> &FramePacer {
        &self.pacer
    }

    pub fn backing(&self) -> BackingKind {
        self.pool.backing()
    }

    pub fn state(&self) -> SinkState {
        *self.state.lock().unwrap()
    }

    /// The reason the connection was lost, if it was.
    pub fn connection_error(&self) -> Option<String> {
        self.status.lost()
    }

    /// Tear the sink down. Calling this more than once is harmless, and
    /// returns an empty report after the first time.
    pub fn stop(&self) -> TeardownReport {
        let mut report = TeardownReport::default();
        {
            let mut state = self.state.lock().unwrap();
            if *state != SinkState::Running {
                return report;
            }
            *state = SinkState::Stopping;
        }
        debug!(
            "Stopping sink with {} outstanding buffers",
            self.outstanding_buffers()
        );

        if self.status.lost().is_none() {
            if let Err(e) = self.pacer.detach() {
                warn!("Error while detaching surface: {}", e);
            }

            while self.outstanding_buffers() > 0 && report.rounds < self.config.teardown_retries {
                report.rounds += 1;
                match self.pacer.round_trip(self.config.round_trip_timeout) {
                    Ok(()) => (),
                    Err(RoundTripError::TimedOut(_)) => report.timeouts += 1,
                    Err(e) => {
                        warn!("Giving up on outstanding buffers: {}", e);
                        break;
                    }
                }
                if self.outstanding_buffers() > 0 {
                    thread::sleep(self.config.drain_poll_interval);
                }
            }
        }
        self.set_state(SinkState::Drained);

        self.pump.lock().unwrap().stop();
        report.forced = self.pool.shutdown();
        if report.forced > 0 {
            warn!(
                "{} buffers were never released by the compositor",
                report.forced
            );
        }
        self.set_state(SinkState::Stopped);

        report
    }
}

impl Drop for VideoSink {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compositor::loopback::{LoopbackCompositor, ReleasePolicy};
    use crate::compositor::{BackingCapabilities, Capabilities};
    use crate::pool::ForeignPlane;
    use crate::PixelFormat;
    use std::time::Instant;

    fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        condition()
    }

    fn loopback() -> (Arc<LoopbackCompositor>, SurfaceId) {
        let compositor = Arc::new(LoopbackCompositor::new().unwrap());
        let surface = compositor.create_surface();
        (compositor, surface)
    }

    fn shm_sink(config: SinkConfig) -> (Arc<LoopbackCompositor>, Arc<ShmAllocator>, VideoSink) {
        let (compositor, surface) = loopback();
        let allocator = Arc::new(ShmAllocator::new());
        let sink =
            VideoSink::with_allocator(compositor.clone(), surface, allocator.clone(), config)
                .unwrap();
        (compositor, allocator, sink)
    }

    #[test]
    fn test_backing_selection() {
        let (compositor, surface) = loopback();
        let sink = VideoSink::new(compositor.clone(), surface, SinkConfig::new()).unwrap();
        assert_eq!(sink.backing(), BackingKind::DmaBuf);
        drop(sink);

        let sink = VideoSink::new(compositor, surface, SinkConfig::new().prefer_dmabuf(false)).unwrap();
        assert_eq!(sink.backing(), BackingKind::Shm);

        let shm_only = Arc::new(
            LoopbackCompositor::with_capabilities(Capabilities {
                backings: BackingCapabilities::SHM,
                shm_formats: vec![PixelFormat::BGRA],
                dmabuf_formats: vec![],
            })
            .unwrap(),
        );
        let surface = shm_only.create_surface();
        assert!(matches!(
            VideoSink::with_allocator(
                shm_only.clone(),
                surface,
                Arc::new(DmaBufAllocator::new()),
                SinkConfig::new()
            ),
            Err(SinkError::NoBacking)
        ));
        let sink = VideoSink::new(shm_only, surface, SinkConfig::new()).unwrap();
        assert_eq!(sink.backing(), BackingKind::Shm);

        let nothing = Arc::new(
            LoopbackCompositor::with_capabilities(Capabilities {
                backings: BackingCapabilities::empty(),
                shm_formats: vec![],
                dmabuf_formats: vec![],
            })
            .unwrap(),
        );
        let surface = nothing.create_surface();
        assert!(matches!(
            VideoSink::new(nothing, surface, SinkConfig::new()),
            Err(SinkError::NoBacking)
        ));
    }

    #[test]
    fn test_released_buffer_is_reused() {
        let (compositor, _, sink) = shm_sink(SinkConfig::new().pool_size(3));
        compositor.set_release_policy(ReleasePolicy::Manual);
        sink.configure(PoolConfig::new(PixelFormat::BGRA, 640, 480))
            .unwrap();

        let handles = (0..3).map(|_| sink.acquire().unwrap()).collect::<Vec<_>>();
        let storage = handles.iter().map(|h| h.storage_ptr()).collect::<Vec<_>>();
        let ids = handles
            .into_iter()
            .map(|h| sink.render(Frame::Pooled(h)).unwrap())
            .collect::<Vec<_>>();
        assert_eq!(sink.outstanding_buffers(), 3);

        let err = sink.acquire().unwrap_err();
        assert!(matches!(err, SinkError::Acquire(AcquireError::Exhausted)));
        assert!(err.is_recoverable());

        compositor.release(ids[0]).unwrap();
        assert!(wait_until(|| sink.outstanding_buffers() == 2));
        let handle = sink.acquire().unwrap();
        assert_eq!(handle.storage_ptr(), storage[0]);
    }

    #[test]
    fn test_reconfigure_frees_storage_after_release() {
        let (compositor, allocator, sink) = shm_sink(SinkConfig::new());
        compositor.set_release_policy(ReleasePolicy::Manual);
        sink.configure(PoolConfig::new(PixelFormat::BGRA, 640, 480))
            .unwrap();
        let first = sink.render(Frame::Pooled(sink.acquire().unwrap())).unwrap();
        let second = sink.render(Frame::Pooled(sink.acquire().unwrap())).unwrap();

        sink.configure(PoolConfig::new(PixelFormat::BGRA, 320, 240))
            .unwrap();
        assert_eq!(sink.pool().num_draining_generations(), 1);
        assert_eq!(allocator.outstanding_regions(), 2);

        compositor.release(first).unwrap();
        sink.round_trip().unwrap();
        assert_eq!(sink.pool().num_draining_generations(), 1);
        assert_eq!(allocator.outstanding_regions(), 2);

        compositor.release(second).unwrap();
        sink.round_trip().unwrap();
        assert_eq!(sink.pool().num_draining_generations(), 0);
        assert_eq!(allocator.outstanding_regions(), 1);
        assert_eq!(compositor.live_shm_pools(), 1);
    }

    #[test]
    fn test_render_buffer_of_previous_configuration() {
        let (compositor, allocator, sink) = shm_sink(SinkConfig::new());
        sink.configure(PoolConfig::new(PixelFormat::BGRA, 640, 480))
            .unwrap();
        let handle = sink.acquire().unwrap();

        sink.configure(PoolConfig::new(PixelFormat::BGRA, 320, 240))
            .unwrap();
        assert_eq!(sink.pool().num_draining_generations(), 1);

        let err = sink.render(Frame::Pooled(handle)).unwrap_err();
        assert!(matches!(
            err,
            SinkError::Present(PresentError::StaleBuffer(0))
        ));
        assert!(err.is_recoverable());
        assert!(compositor.surface_log().is_empty());
        // The buffer went back to its generation, which could then be freed.
        assert_eq!(sink.pool().num_draining_generations(), 0);
        assert_eq!(allocator.outstanding_regions(), 1);

        sink.render(Frame::Pooled(sink.acquire().unwrap())).unwrap();
    }

    #[test]
    fn test_unknown_and_duplicate_releases() {
        let (compositor, _, sink) = shm_sink(SinkConfig::new());
        sink.configure(PoolConfig::new(PixelFormat::BGRX, 64, 48))
            .unwrap();
        let first = sink.render(Frame::Pooled(sink.acquire().unwrap())).unwrap();
        sink.render(Frame::Pooled(sink.acquire().unwrap())).unwrap();
        // Replacing the first buffer released it.
        let tracker = sink.pool().tracker();
        assert_eq!(tracker.released_count(), 1);

        compositor.release(first).unwrap();
        compositor.release(BufferId(999)).unwrap();
        sink.round_trip().unwrap();
        assert_eq!(tracker.released_count(), 1);
        assert_eq!(tracker.ignored_count(), 2);
        assert_eq!(sink.outstanding_buffers(), 1);
        assert_eq!(sink.pool().num_free(), 1);
    }

    #[test]
    fn test_round_trip_times_out() {
        let timeout = Duration::from_millis(200);
        let (compositor, _, sink) = shm_sink(SinkConfig::new().round_trip_timeout(timeout));
        compositor.set_sync_replies(false);

        let start = Instant::now();
        let err = sink.round_trip().unwrap_err();
        let elapsed = start.elapsed();
        assert!(matches!(err, SinkError::RoundTrip(RoundTripError::TimedOut(t)) if t == timeout));
        assert!(err.is_recoverable());
        assert!(elapsed >= timeout);
        assert!(elapsed < timeout + Duration::from_secs(1));

        // The late reply is discarded.
        assert_eq!(compositor.reply_held_syncs().unwrap(), 1);
        compositor.set_sync_replies(true);
        sink.round_trip().unwrap();
    }

    #[test]
    fn test_stopping_pump_wakes_round_trip() {
        let (compositor, surface) = loopback();
        let pacer = Arc::new(FramePacer::new(compositor.clone(), surface));
        let pool = BufferPool::new(
            compositor.clone(),
            Arc::new(ShmAllocator::new()),
            pacer.clone(),
            Default::default(),
        );
        let mut pump = EventPump::start(
            compositor.clone(),
            SinkEventHandler {
                tracker: Arc::clone(pool.tracker()),
                pacer: pacer.clone(),
                status: Default::default(),
            },
        )
        .unwrap();
        compositor.set_sync_replies(false);

        let waiter = {
            let pacer = pacer.clone();
            thread::spawn(move || {
                let start = Instant::now();
                (pacer.round_trip(Duration::from_secs(30)), start.elapsed())
            })
        };
        assert!(wait_until(|| compositor.held_syncs() == 1));

        pump.stop();
        let (result, elapsed) = waiter.join().unwrap();
        assert!(matches!(result, Err(RoundTripError::Cancelled)));
        assert!(elapsed < Duration::from_secs(10));
    }

    #[test]
    fn test_render_foreign_frame() {
        let (compositor, _, sink) = shm_sink(SinkConfig::new());
        sink.configure(PoolConfig::new(PixelFormat::BGRA, 2, 2))
            .unwrap();

        let data = [1u8; 16];
        let id = sink
            .render(Frame::Foreign(ForeignFrame {
                format: PixelFormat::BGRA,
                width: 2,
                height: 2,
                planes: vec![ForeignPlane {
                    data: &data,
                    stride: 8,
                }],
            }))
            .unwrap();
        assert_eq!(compositor.read_buffer(id).unwrap(), vec![1u8; 16]);
        let commit = compositor.surface_log().pop().unwrap();
        assert_eq!(commit.buffer, Some(id));
        assert_eq!(commit.damage, vec![Rect::new(0, 0, 2, 2)]);
    }

    #[test]
    fn test_output_rect() {
        let (_, _, sink) = shm_sink(SinkConfig::new());
        assert_eq!(sink.output_rect(), None);
        sink.configure(PoolConfig::new(PixelFormat::BGRA, 640, 480))
            .unwrap();
        // Not fullscreen: the window follows the video.
        sink.set_window_size(800, 600);
        assert_eq!(sink.output_rect(), Some(Rect::new(0, 0, 640, 480)));

        let (_, _, sink) = shm_sink(SinkConfig::new().fullscreen(true));
        sink.configure(PoolConfig::new(PixelFormat::BGRA, 640, 480))
            .unwrap();
        sink.set_window_size(800, 600);
        assert_eq!(sink.output_rect(), Some(Rect::new(80, 60, 640, 480)));
    }

    #[test]
    fn test_render_requires_configuration() {
        let (_, _, sink) = shm_sink(SinkConfig::new());
        let data = [0u8; 16];
        let frame = ForeignFrame {
            format: PixelFormat::BGRA,
            width: 2,
            height: 2,
            planes: vec![ForeignPlane {
                data: &data,
                stride: 8,
            }],
        };
        assert!(matches!(
            sink.render(Frame::Foreign(frame)),
            Err(SinkError::Acquire(AcquireError::NotConfigured))
        ));

        let err = sink
            .configure(PoolConfig::new(PixelFormat::from(b"YUYV"), 2, 2))
            .unwrap_err();
        assert!(matches!(err, SinkError::Config(ConfigError::UnsupportedFormat(..))));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_teardown_collects_released_buffers() {
        let (compositor, allocator, sink) = shm_sink(SinkConfig::new());
        sink.configure(PoolConfig::new(PixelFormat::BGRA, 64, 48))
            .unwrap();
        for _ in 0..3 {
            sink.render(Frame::Pooled(sink.acquire().unwrap())).unwrap();
        }
        assert_eq!(sink.outstanding_buffers(), 1);

        let report = sink.stop();
        assert!(report.rounds <= 1);
        assert_eq!(report.timeouts, 0);
        assert_eq!(report.forced, 0);
        assert_eq!(sink.state(), SinkState::Stopped);
        assert_eq!(sink.outstanding_buffers(), 0);
        assert_eq!(allocator.outstanding_regions(), 0);
        assert_eq!(compositor.live_buffers(), 0);
        assert_eq!(compositor.live_shm_pools(), 0);

        // Stopping again does nothing.
        assert_eq!(sink.stop(), TeardownReport::default());
        assert!(matches!(sink.acquire(), Err(SinkError::Stopped)));
    }

    #[test]
    fn test_teardown_frees_unreleased_buffers() {
        let (compositor, allocator, sink) = shm_sink(
            SinkConfig::new()
                .teardown_retries(3)
                .drain_poll_interval(Duration::from_millis(1)),
        );
        compositor.set_release_policy(ReleasePolicy::Manual);
        sink.configure(PoolConfig::new(PixelFormat::BGRA, 64, 48))
            .unwrap();
        sink.render(Frame::Pooled(sink.acquire().unwrap())).unwrap();
        sink.render(Frame::Pooled(sink.acquire().unwrap())).unwrap();

        let report = sink.stop();
        assert_eq!(
            report,
            TeardownReport {
                rounds: 3,
                timeouts: 0,
                forced: 2
            }
        );
        assert_eq!(sink.outstanding_buffers(), 0);
        assert_eq!(allocator.outstanding_regions(), 0);
    }

    #[test]
    fn test_teardown_with_silent_compositor() {
        let (compositor, allocator, sink) = shm_sink(
            SinkConfig::new()
                .sync_after_present(false)
                .round_trip_timeout(Duration::from_millis(50))
                .teardown_retries(2)
                .drain_poll_interval(Duration::from_millis(1)),
        );
        compositor.set_release_policy(ReleasePolicy::Manual);
        sink.configure(PoolConfig::new(PixelFormat::BGRA, 64, 48))
            .unwrap();
        sink.render(Frame::Pooled(sink.acquire().unwrap())).unwrap();
        compositor.set_sync_replies(false);

        let start = Instant::now();
        let report = sink.stop();
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(report.rounds, 2);
        assert_eq!(report.timeouts, 2);
        assert_eq!(report.forced, 1);
        assert_eq!(allocator.outstanding_regions(), 0);
    }

    #[test]
    fn test_connection_lost() {
        let (compositor, allocator, sink) = shm_sink(SinkConfig::new());
        compositor.set_release_policy(ReleasePolicy::Manual);
        sink.configure(PoolConfig::new(PixelFormat::BGRA, 64, 48))
            .unwrap();
        sink.render(Frame::Pooled(sink.acquire().unwrap())).unwrap();

        compositor.disconnect();
        assert!(wait_until(|| sink.connection_error().is_some()));

        let err = sink.acquire().unwrap_err();
        assert!(matches!(err, SinkError::ConnectionLost(_)));
        assert!(!err.is_recoverable());
        assert!(matches!(sink.round_trip(), Err(SinkError::ConnectionLost(_))));

        let report = sink.stop();
        assert_eq!(report.rounds, 0);
        assert_eq!(report.forced, 1);
        assert_eq!(allocator.outstanding_regions(), 0);
    }
}
