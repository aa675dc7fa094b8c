use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use log::error;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token, Waker};

/// Token reserved for the break waker; never collides with slab slots.
pub(crate) const WAKE_TOKEN: Token = Token(usize::MAX);

/// One readiness report, already detached from the mio event buffer so
/// the dispatcher can hand the set across threads.
#[derive(Clone, Copy, Debug)]
pub(crate) struct ReadyEvent {
    pub token: usize,
    pub readable: bool,
    pub writable: bool,
}

/// Blocking-wait half of the backend. Owned by whichever thread runs the
/// dispatch loop; registration goes through a cloned [`Registrar`].
///
/// `mio::Poll` picks the platform mechanism at build time (epoll, kqueue,
/// or the Windows fallback), so there is no dispatch on backend here.
pub(crate) struct Poller {
    poll: Poll,
    events: Events,
    ready: Vec<ReadyEvent>,
}

impl Poller {
    pub fn new() -> io::Result<Poller> {
        Ok(Poller {
            poll: Poll::new()?,
            events: Events::with_capacity(256),
            ready: Vec::new(),
        })
    }

    pub fn registrar(&self) -> io::Result<Registrar> {
        Ok(Registrar(self.poll.registry().try_clone()?))
    }

    pub fn waker(&self) -> io::Result<Waker> {
        Waker::new(self.poll.registry(), WAKE_TOKEN)
    }

    /// Block until readiness or timeout. Failures other than an
    /// interrupted syscall are logged and reported as an empty set.
    pub fn wait(&mut self, timeout: Option<Duration>) {
        self.ready.clear();
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {
                for event in self.events.iter() {
                    self.ready.push(ReadyEvent {
                        token: event.token().0,
                        readable: event.is_readable() || event.is_read_closed(),
                        writable: event.is_writable() || event.is_write_closed(),
                    });
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => error!("wait failed, treating as timeout: {}", e),
        }
    }

    pub fn ready(&self) -> &[ReadyEvent] {
        &self.ready
    }

    pub fn take_ready(&mut self) -> Vec<ReadyEvent> {
        std::mem::take(&mut self.ready)
    }
}

/// Registration half of the backend; cloneable off the poll instance and
/// safe to use from the reactor core while the wait half blocks.
pub(crate) struct Registrar(Registry);

impl Registrar {
    pub fn add(&self, fd: RawFd, token: usize, interest: Interest) -> io::Result<()> {
        self.0.register(&mut SourceFd(&fd), Token(token), interest)
    }

    pub fn remove(&self, fd: RawFd) -> io::Result<()> {
        self.0.deregister(&mut SourceFd(&fd))
    }
}
