//! Readiness multiplexer.
//!
//! Thin wrapper over `mio::Poll`. On Linux this is epoll in edge-triggered mode:
//! a readiness event reports a transition, so every consumer must drain its
//! descriptor until `WouldBlock` before waiting again.
//!
//! Descriptors are keyed by their raw value (`Token(fd)`), which lets the loops
//! dispatch on "which fd is ready" the same way for sockets, pipes and the
//! signal bridge.

use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::rc::Rc;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token};

use crate::error::{PoolError, Result};

/// One ready descriptor out of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Readiness {
    pub fd: RawFd,
    pub readable: bool,
    pub read_closed: bool,
    pub error: bool,
}

impl Readiness {
    /// Whether a read on `fd` would make progress (data, EOF or error).
    pub fn wants_read(&self) -> bool {
        self.readable || self.read_closed || self.error
    }
}

impl From<&mio::event::Event> for Readiness {
    fn from(event: &mio::event::Event) -> Self {
        Self {
            fd: event.token().0 as RawFd,
            readable: event.is_readable(),
            read_closed: event.is_read_closed(),
            error: event.is_error(),
        }
    }
}

/// Cloneable handle onto a multiplexer's registry.
///
/// Handed to connection handlers so they can deregister their own descriptor.
/// Cheap to clone; only valid inside the process that created it.
#[derive(Clone)]
pub struct LoopHandle {
    registry: Rc<Registry>,
}

impl LoopHandle {
    /// Register `fd` for read readiness. The descriptor must already be non-blocking.
    pub fn register(&self, fd: RawFd) -> io::Result<()> {
        self.registry
            .register(&mut SourceFd(&fd), Token(fd as usize), Interest::READABLE)
    }

    pub fn deregister(&self, fd: RawFd) -> io::Result<()> {
        self.registry.deregister(&mut SourceFd(&fd))
    }

    /// Deregister `source` and close it by dropping it.
    pub fn close<S: AsRawFd>(&self, source: S) {
        let fd = source.as_raw_fd();
        if let Err(e) = self.deregister(fd) {
            tracing::debug!(fd, error = %e, "Deregister before close failed");
        }
        drop(source);
        tracing::trace!(fd, "Closed descriptor");
    }
}

impl std::fmt::Debug for LoopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopHandle").finish_non_exhaustive()
    }
}

pub struct Multiplexer {
    poll: Poll,
    events: Events,
    handle: LoopHandle,
}

impl Multiplexer {
    /// `capacity` bounds how many ready descriptors one `wait` can report.
    pub fn new(capacity: usize) -> Result<Self> {
        let poll = Poll::new().map_err(PoolError::Multiplexer)?;
        let registry = poll.registry().try_clone().map_err(PoolError::Multiplexer)?;
        Ok(Self {
            poll,
            events: Events::with_capacity(capacity),
            handle: LoopHandle {
                registry: Rc::new(registry),
            },
        })
    }

    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    pub fn register(&self, fd: RawFd) -> Result<()> {
        self.handle
            .register(fd)
            .map_err(|source| PoolError::Register { fd, source })
    }

    /// Block until at least one registered descriptor is ready.
    ///
    /// A wait interrupted by a signal yields an empty batch; the signal itself
    /// shows up as bridge readiness on the next wait.
    pub fn wait(&mut self) -> Result<impl Iterator<Item = Readiness> + '_> {
        self.wait_timeout(None)
    }

    pub fn wait_timeout(
        &mut self,
        timeout: Option<Duration>,
    ) -> Result<impl Iterator<Item = Readiness> + '_> {
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                tracing::trace!("Multiplexer wait interrupted");
                self.events.clear();
            }
            Err(e) => return Err(PoolError::Wait(e)),
        }
        Ok(self.events.iter().map(Readiness::from))
    }
}
