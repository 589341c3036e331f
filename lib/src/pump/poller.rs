//! A level-triggered `Poller` for compositor connections that allows a user to
//! be notified when events are ready to be read from the connection, or when
//! the connection has been closed.
//!
//! It also provides a `Waker` companion that allows other threads to interrupt
//! an ongoing (or coming) poll. Useful to implement an event-based loop.

use std::{
    collections::{btree_map::Entry, BTreeMap},
    fs::File,
    io::{self, Read, Write},
    mem,
    os::fd::{AsFd, AsRawFd, FromRawFd},
    sync::Arc,
    time::Duration,
};

use log::warn;
use nix::libc;

macro_rules! syscall {
    ($f: ident ( $($args: expr),* $(,)* ) ) => {{
        match unsafe { libc::$f($($args, )*) } {
            err if err < 0 => Err(std::io::Error::last_os_error()),
            res => Ok(res)
        }
    }};
}

#[derive(Debug, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Data is waiting to be read.
    Readable,
    /// The peer closed the connection.
    Hangup,
    /// An error condition is pending on the connection.
    Error,
}

#[derive(Debug, PartialEq, Eq)]
pub enum PollEvent {
    Connection(ConnectionEvent),
    Waker(u32),
}

pub struct PollEvents {
    events: [libc::epoll_event; 4],
    nb_events: usize,
    cur_event: usize,
}

impl PollEvents {
    fn new() -> Self {
        PollEvents {
            // Safe because that's the rightful initial state for epoll_event.
            events: unsafe { mem::zeroed() },
            nb_events: 0,
            cur_event: 0,
        }
    }
}

impl Iterator for PollEvents {
    type Item = PollEvent;

    fn next(&mut self) -> Option<Self::Item> {
        // No more slot to process, end of iterator.
        if self.cur_event >= self.nb_events {
            return None;
        }

        let slot = &mut self.events[self.cur_event];
        match slot.u64 {
            CONNECTION_ID => {
                // Pending data is reported before the hangup, so it can be
                // read before the connection is dropped.
                if slot.events & libc::EPOLLIN as u32 != 0 {
                    slot.events &= !libc::EPOLLIN as u32;
                    Some(PollEvent::Connection(ConnectionEvent::Readable))
                } else if slot.events & libc::EPOLLERR as u32 != 0 {
                    slot.events &= !libc::EPOLLERR as u32;
                    Some(PollEvent::Connection(ConnectionEvent::Error))
                } else if slot.events & (libc::EPOLLHUP | libc::EPOLLRDHUP) as u32 != 0 {
                    slot.events &= !(libc::EPOLLHUP | libc::EPOLLRDHUP) as u32;
                    Some(PollEvent::Connection(ConnectionEvent::Hangup))
                } else {
                    // If no more events for this slot, try the next one.
                    self.cur_event += 1;
                    self.next()
                }
            }
            waker_id @ FIRST_WAKER_ID..=LAST_WAKER_ID => {
                self.cur_event += 1;
                Some(PollEvent::Waker(waker_id as u32))
            }
            _ => panic!("Unregistered token returned by epoll_wait!"),
        }
    }
}

pub struct Waker {
    fd: File,
}

impl Waker {
    fn new() -> io::Result<Self> {
        let fd = syscall!(eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK))?;

        Ok(Waker {
            fd: unsafe { File::from_raw_fd(fd) },
        })
    }

    pub fn wake(&self) -> io::Result<()> {
        let buf = 1u64.to_ne_bytes();
        // Files support concurrent access at the OS level. The implementation
        // of Write for &File lets us call the write mutable method even on a
        // non-mutable File instance.
        (&self.fd).write(&buf).map(|_| ())
    }

    /// Perform a read on this waker in order to reset its counter to 0. This
    /// means it will make subsequent calls to `poll()` block until `wake()` is
    /// called again.
    fn reset(&self) -> io::Result<()> {
        let mut buf = 0u64.to_ne_bytes();
        match (&self.fd).read(&mut buf).map(|_| ()) {
            Ok(_) => Ok(()),
            // If the counter was already zero, it is already reset so this is
            // not an error.
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Polls a connection and any number of wakers.
pub struct Poller<C: AsFd + ?Sized> {
    connection: Arc<C>,
    wakers: BTreeMap<u32, Arc<Waker>>,
    epoll: File,
}

/// Wakers IDs range.
const FIRST_WAKER_ID: u64 = 0;
const LAST_WAKER_ID: u64 = CONNECTION_ID - 1;
/// Give us a comfortable range of 4 billion ids usable for wakers.
const CONNECTION_ID: u64 = 1 << 32;

impl<C: AsFd + ?Sized> Poller<C> {
    pub fn new(connection: Arc<C>) -> io::Result<Self> {
        let epoll = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))
            .map(|fd| unsafe { File::from_raw_fd(fd) })?;

        syscall!(epoll_ctl(
            epoll.as_raw_fd(),
            libc::EPOLL_CTL_ADD,
            connection.as_fd().as_raw_fd(),
            &mut libc::epoll_event {
                events: (libc::EPOLLIN | libc::EPOLLRDHUP) as u32,
                u64: CONNECTION_ID,
            }
        ))?;

        Ok(Poller {
            connection,
            wakers: BTreeMap::new(),
            epoll,
        })
    }

    pub fn connection(&self) -> &Arc<C> {
        &self.connection
    }

    /// Create a `Waker` with identifier `id` and start polling on it. Returns
    /// the `Waker` if successful, or an error if `id` was already in use or the
    /// waker could not be polled on.
    pub fn add_waker(&mut self, id: u32) -> io::Result<Arc<Waker>> {
        match self.wakers.entry(id) {
            Entry::Vacant(entry) => {
                let waker = Waker::new()?;

                syscall!(epoll_ctl(
                    self.epoll.as_raw_fd(),
                    libc::EPOLL_CTL_ADD,
                    waker.fd.as_raw_fd(),
                    &mut libc::epoll_event {
                        events: libc::EPOLLIN as u32,
                        u64: FIRST_WAKER_ID + id as u64,
                    }
                ))?;

                let waker = Arc::new(waker);
                entry.insert(Arc::clone(&waker));
                Ok(waker)
            }
            Entry::Occupied(_) => Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("A waker with id {} is already registered", id),
            )),
        }
    }

    pub fn poll(&mut self, duration: Option<Duration>) -> io::Result<PollEvents> {
        let mut events = PollEvents::new();
        let duration: i32 = match duration {
            None => -1,
            Some(d) => d.as_millis().try_into().unwrap_or(i32::MAX),
        };

        events.nb_events = syscall!(epoll_wait(
            self.epoll.as_raw_fd(),
            events.events.as_mut_ptr(),
            events.events.len() as i32,
            duration
        ))? as usize;

        // Reset all the wakers that have been signaled.
        for event in &events.events[0..events.nb_events] {
            if event.u64 <= LAST_WAKER_ID {
                match self.wakers.get(&(event.u64 as u32)) {
                    Some(waker) => waker.reset()?,
                    None => warn!("unregistered waker has been signaled."),
                }
            }
        }

        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::{ConnectionEvent::*, PollEvent::*, PollEvents, Poller};
    use super::{CONNECTION_ID, FIRST_WAKER_ID};
    use nix::libc;
    use std::io::Write;
    use std::os::unix::net::UnixStream;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_pollevents_iterator() {
        let mut poll_events = PollEvents::new();
        assert_eq!(poll_events.next(), None);

        // Single connection events
        let mut poll_events = PollEvents::new();
        poll_events.events[0].u64 = CONNECTION_ID;
        poll_events.events[0].events = libc::EPOLLIN as u32;
        poll_events.nb_events = 1;
        assert_eq!(poll_events.next(), Some(Connection(Readable)));
        assert_eq!(poll_events.next(), None);

        let mut poll_events = PollEvents::new();
        poll_events.events[0].u64 = CONNECTION_ID;
        poll_events.events[0].events = libc::EPOLLHUP as u32;
        poll_events.nb_events = 1;
        assert_eq!(poll_events.next(), Some(Connection(Hangup)));
        assert_eq!(poll_events.next(), None);

        // Pending data comes before the hangup
        let mut poll_events = PollEvents::new();
        poll_events.events[0].u64 = CONNECTION_ID;
        poll_events.events[0].events = (libc::EPOLLHUP | libc::EPOLLIN) as u32;
        poll_events.nb_events = 1;
        assert_eq!(poll_events.next(), Some(Connection(Readable)));
        assert_eq!(poll_events.next(), Some(Connection(Hangup)));
        assert_eq!(poll_events.next(), None);

        // Single waker event
        let mut poll_events = PollEvents::new();
        poll_events.events[0].u64 = FIRST_WAKER_ID;
        poll_events.nb_events = 1;
        assert_eq!(poll_events.next(), Some(Waker(0)));
        assert_eq!(poll_events.next(), None);

        // Wakers and connection events
        let mut poll_events = PollEvents::new();
        poll_events.events[0].u64 = FIRST_WAKER_ID + 20;
        poll_events.events[1].u64 = CONNECTION_ID;
        poll_events.events[1].events = (libc::EPOLLERR | libc::EPOLLIN) as u32;
        poll_events.events[2].u64 = FIRST_WAKER_ID;
        poll_events.nb_events = 3;
        assert_eq!(poll_events.next(), Some(Waker(20)));
        assert_eq!(poll_events.next(), Some(Connection(Readable)));
        assert_eq!(poll_events.next(), Some(Connection(Error)));
        assert_eq!(poll_events.next(), Some(Waker(0)));
        assert_eq!(poll_events.next(), None);
    }

    #[test]
    fn test_poll_connection_and_waker() {
        let (client, mut server) = UnixStream::pair().unwrap();
        let mut poller = Poller::new(Arc::new(client)).unwrap();
        let waker = poller.add_waker(3).unwrap();
        assert!(poller.add_waker(3).is_err());

        // Nothing to report.
        let events = poller.poll(Some(Duration::from_millis(10))).unwrap();
        assert_eq!(events.count(), 0);

        waker.wake().unwrap();
        let events: Vec<_> = poller.poll(None).unwrap().collect();
        assert_eq!(events, vec![Waker(3)]);

        // The waker has been reset by the previous poll.
        server.write_all(&[0]).unwrap();
        let events: Vec<_> = poller.poll(None).unwrap().collect();
        assert_eq!(events, vec![Connection(Readable)]);

        // Unread data keeps the connection readable, whatever the timeout.
        let events: Vec<_> = poller.poll(Some(Duration::MAX)).unwrap().collect();
        assert_eq!(events, vec![Connection(Readable)]);
    }
}
