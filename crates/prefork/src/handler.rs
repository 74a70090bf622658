//! Connection handler contract and the per-worker slot table.

use std::net::{SocketAddr, TcpStream};
use std::os::fd::RawFd;

use crate::poll::LoopHandle;

/// Per-connection protocol logic plugged into a worker.
///
/// A worker keeps one handler per connection slot. `init` is called after a
/// successful accept, with the stream already registered for read readiness;
/// `process` is called every time the stream becomes readable.
///
/// Readiness is edge-triggered, so `process` must read until `WouldBlock`.
/// The handler owns the stream: on end-of-stream or an unrecoverable error it
/// deregisters and closes it itself (see [`LoopHandle::close`]). The worker
/// never closes a connection on the handler's behalf.
pub trait ConnectionHandler: Default {
    fn init(&mut self, handle: LoopHandle, stream: TcpStream, peer: SocketAddr);

    fn process(&mut self);
}

/// Handlers indexed directly by descriptor value.
///
/// Dense storage grown on demand up to `ceiling`; a slot is created the first
/// time its descriptor is accepted and re-initialized whenever the kernel hands
/// the same descriptor number out again.
pub struct ConnectionSlots<H> {
    slots: Vec<Option<H>>,
    ceiling: usize,
}

impl<H: ConnectionHandler> ConnectionSlots<H> {
    pub fn new(ceiling: usize) -> Self {
        Self {
            slots: Vec::new(),
            ceiling,
        }
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    pub fn accepts(&self, fd: RawFd) -> bool {
        usize::try_from(fd).is_ok_and(|i| i < self.ceiling)
    }

    /// Hand a freshly accepted stream to the handler in slot `fd`.
    ///
    /// Returns the stream back if `fd` is outside the table.
    pub fn init(
        &mut self,
        fd: RawFd,
        handle: LoopHandle,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> Result<(), TcpStream> {
        if !self.accepts(fd) {
            return Err(stream);
        }
        let index = fd as usize;
        if index >= self.slots.len() {
            self.slots.resize_with(index + 1, || None);
        }
        self.slots[index]
            .get_or_insert_with(H::default)
            .init(handle, stream, peer);
        Ok(())
    }

    pub fn get_mut(&mut self, fd: RawFd) -> Option<&mut H> {
        let index = usize::try_from(fd).ok()?;
        self.slots.get_mut(index)?.as_mut()
    }

    /// Number of slots ever initialized (live or inert).
    pub fn allocated(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}
