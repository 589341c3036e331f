//! The thread reading and dispatching compositor events.
//!
//! Release events and callbacks only reach us if someone reads the
//! compositor connection. `EventPump` runs a dedicated thread doing just that:
//! it flushes our requests, polls the connection, reads what arrived and
//! dispatches it to an `EventHandler`. The thread runs until it is asked to
//! stop through `EventPump::stop`, or until the connection fails.
pub mod poller;

use std::io;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::{self, JoinHandle};

use log::{debug, error, trace, warn};
use thiserror::Error;

use crate::compositor::{Compositor, CompositorEvent, ConnectionError};
use poller::{ConnectionEvent, PollEvent, Poller, Waker};

/// Receives what the pump reads from the connection. All methods are called
/// from the pump thread.
pub trait EventHandler: Send + 'static {
    fn handle_event(&mut self, event: CompositorEvent);

    /// The connection failed. No other method but `pump_stopped` will be
    /// called after this.
    fn connection_lost(&mut self, error: &ConnectionError);

    /// The pump is exiting, whether it has been stopped or the connection
    /// was lost.
    fn pump_stopped(&mut self) {}
}

#[derive(Debug, Error)]
pub enum PumpError {
    #[error("error while creating poller: {0}")]
    Poller(io::Error),
    #[error("error while spawning pump thread: {0}")]
    Spawn(io::Error),
}

const STOP_WAKER_ID: u32 = 0;

/// Handle to a running event pump thread.
pub struct EventPump {
    thread: Option<JoinHandle<()>>,
    stop_waker: Arc<Waker>,
    flushing: Arc<AtomicBool>,
}

impl EventPump {
    /// Start pumping the events of `compositor` into `handler`.
    pub fn start<H: EventHandler>(
        compositor: Arc<dyn Compositor>,
        handler: H,
    ) -> Result<Self, PumpError> {
        let mut poller = Poller::new(compositor).map_err(PumpError::Poller)?;
        let stop_waker = poller
            .add_waker(STOP_WAKER_ID)
            .map_err(PumpError::Poller)?;
        let flushing = Arc::new(AtomicBool::new(false));

        let pump_thread = PumpThread {
            poller,
            handler,
            flushing: Arc::clone(&flushing),
        };
        let thread = thread::Builder::new()
            .name("compositor-pump".into())
            .spawn(move || pump_thread.run())
            .map_err(PumpError::Spawn)?;

        Ok(EventPump {
            thread: Some(thread),
            stop_waker,
            flushing,
        })
    }

    /// Returns `false` once the pump thread has exited.
    pub fn is_running(&self) -> bool {
        self.thread
            .as_ref()
            .map(|t| !t.is_finished())
            .unwrap_or(false)
    }

    /// Wake the pump thread up without asking it to stop.
    #[cfg(test)]
    fn wake(&self) {
        self.stop_waker.wake().unwrap();
    }

    /// Ask the pump thread to exit and wait until it does. Calling this more
    /// than once is harmless.
    pub fn stop(&mut self) {
        let thread = match self.thread.take() {
            Some(thread) => thread,
            None => return,
        };

        debug!("Stopping compositor event pump");
        self.flushing.store(true, Ordering::SeqCst);
        if let Err(e) = self.stop_waker.wake() {
            error!("Error while waking pump thread: {}", e);
        }
        if thread.join().is_err() {
            error!("Compositor event pump thread panicked");
        }
    }
}

impl Drop for EventPump {
    fn drop(&mut self) {
        self.stop();
    }
}

struct PumpThread<H: EventHandler> {
    poller: Poller<dyn Compositor>,
    handler: H,
    flushing: Arc<AtomicBool>,
}

impl<H: EventHandler> PumpThread<H> {
    fn run(mut self) {
        debug!("Compositor event pump started");

        if let Err(e) = self.pump() {
            error!("Lost connection to compositor: {}", e);
            self.handler.connection_lost(&e);
        }

        self.handler.pump_stopped();
        debug!("Compositor event pump exiting");
    }

    fn dispatch(&mut self, compositor: &dyn Compositor) -> Result<usize, ConnectionError> {
        let handler = &mut self.handler;
        compositor.dispatch_pending(&mut |event| {
            trace!("Dispatching {:?}", event);
            handler.handle_event(event)
        })
    }

    fn pump(&mut self) -> Result<(), ConnectionError> {
        let compositor = Arc::clone(self.poller.connection());

        loop {
            // Events already queued must be dispatched before we can read.
            while !compositor.prepare_read() {
                self.dispatch(&*compositor)?;
            }

            if let Err(e) = compositor.flush() {
                compositor.cancel_read();
                return Err(e);
            }

            let events = match self.poller.poll(None) {
                Ok(events) => events,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                    compositor.cancel_read();
                    continue;
                }
                Err(e) => {
                    compositor.cancel_read();
                    return Err(e.into());
                }
            };

            let mut connection_ready = false;
            for event in events {
                match event {
                    PollEvent::Waker(STOP_WAKER_ID) => {
                        trace!("Pump woken up by stop waker");
                    }
                    PollEvent::Waker(id) => warn!("Unexpected waker {} signaled", id),
                    PollEvent::Connection(ConnectionEvent::Readable) => connection_ready = true,
                    PollEvent::Connection(event) => {
                        debug!("Connection reported {:?}", event);
                        // Reading will tell us whether the connection is gone.
                        connection_ready = true;
                    }
                }
            }

            if self.flushing.load(Ordering::SeqCst) {
                compositor.cancel_read();
                return Ok(());
            }

            if connection_ready {
                compositor.read_events()?;
            } else {
                trace!("Spurious wakeup");
                compositor.cancel_read();
            }

            self.dispatch(&*compositor)?;
        }
    }
}
