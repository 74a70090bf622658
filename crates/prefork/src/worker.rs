//! Worker loop.
//!
//! Each worker waits on three kinds of descriptors:
//! - its channel to the master: dispatch tokens, each meaning "accept from the
//!   shared listener until it would block";
//! - its own signal bridge: SIGTERM/SIGINT stop the loop, SIGCHLD reaps any
//!   processes spawned by connection handlers;
//! - every connection it accepted: readiness goes to that slot's handler.
//!
//! Losing an accept race to a sibling is normal and only logged. The shared
//! listener is never closed here; it belongs to whoever created it.

use std::io;
use std::net::TcpListener;
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;

use nix::sys::signal::Signal;

use crate::channel;
use crate::config::PoolConfig;
use crate::error::Result;
use crate::handler::{ConnectionHandler, ConnectionSlots};
use crate::poll::{LoopHandle, Multiplexer};
use crate::reap;
use crate::signal::{self, SignalBridge};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Accept {
    /// A connection was taken (or refused after being taken).
    Taken,
    /// Nothing pending: a sibling won the race or tokens were coalesced.
    Empty,
    /// Non-fatal accept error; further attempts may still succeed.
    Failed,
}

/// Accept one connection from the shared listener into `slots`.
pub(crate) fn accept_one<H: ConnectionHandler>(
    listener: &TcpListener,
    handle: &LoopHandle,
    slots: &mut ConnectionSlots<H>,
) -> Accept {
    let (stream, peer) = match listener.accept() {
        Ok(accepted) => accepted,
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
            tracing::debug!("Nothing to accept, another worker won the race");
            return Accept::Empty;
        }
        Err(e) => {
            tracing::warn!(error = %e, "accept failed");
            return Accept::Failed;
        }
    };

    let fd = stream.as_raw_fd();
    if !slots.accepts(fd) {
        tracing::warn!(fd, %peer, ceiling = slots.ceiling(), "Connection over per-worker ceiling, closing");
        return Accept::Taken;
    }
    if let Err(e) = stream.set_nonblocking(true) {
        tracing::warn!(fd, %peer, error = %e, "Failed to make connection non-blocking, closing");
        return Accept::Taken;
    }
    if let Err(e) = handle.register(fd) {
        tracing::warn!(fd, %peer, error = %e, "Failed to register connection, closing");
        return Accept::Taken;
    }
    if let Err(stream) = slots.init(fd, handle.clone(), stream, peer) {
        handle.close(stream);
        return Accept::Taken;
    }

    tracing::debug!(fd, %peer, "Accepted connection");
    Accept::Taken
}

/// Accept until the listener is drained or an accept fails.
///
/// One listener readiness edge may cover a whole burst of queued connections,
/// and the master sends only one token for it. Returns how many were taken.
pub(crate) fn accept_pending<H: ConnectionHandler>(
    listener: &TcpListener,
    handle: &LoopHandle,
    slots: &mut ConnectionSlots<H>,
) -> usize {
    let mut taken = 0;
    while accept_one(listener, handle, slots) == Accept::Taken {
        taken += 1;
    }
    taken
}

pub(crate) fn run<H: ConnectionHandler>(
    index: usize,
    config: &PoolConfig,
    listener: &TcpListener,
    channel: UnixStream,
) -> Result<()> {
    let span = tracing::info_span!("worker", index, pid = std::process::id());
    let _entered = span.enter();

    let mut mux = Multiplexer::new(config.max_events)?;
    let handle = mux.handle();
    let bridge = SignalBridge::install(&[Signal::SIGCHLD, Signal::SIGTERM, Signal::SIGINT])?;
    signal::ignore(Signal::SIGPIPE)?;

    let channel_fd = channel.as_raw_fd();
    let bridge_fd = bridge.as_raw_fd();
    mux.register(channel_fd)?;
    mux.register(bridge_fd)?;

    let mut slots = ConnectionSlots::<H>::new(config.connections_per_worker);
    let mut stop = false;

    tracing::info!("Worker loop started");

    while !stop {
        for ready in mux.wait()? {
            if ready.fd == channel_fd {
                let drained = channel::drain_tokens(&channel);
                if drained.tokens > 0 {
                    let taken = accept_pending(listener, &handle, &mut slots);
                    tracing::trace!(tokens = drained.tokens, taken, "Dispatch handled");
                }
                if drained.closed {
                    tracing::warn!("Master channel closed, stopping");
                    stop = true;
                }
            } else if ready.fd == bridge_fd {
                for signal in bridge.drain() {
                    match signal {
                        Signal::SIGCHLD => {
                            for (pid, status) in reap::reap_exited() {
                                tracing::debug!(%pid, status = %reap::describe(&status), "Reaped handler child");
                            }
                        }
                        Signal::SIGTERM | Signal::SIGINT => {
                            tracing::info!(%signal, "Stop requested");
                            stop = true;
                        }
                        _ => {}
                    }
                }
            } else if ready.wants_read() {
                match slots.get_mut(ready.fd) {
                    Some(handler) => handler.process(),
                    None => tracing::debug!(fd = ready.fd, "Readiness for unknown descriptor"),
                }
            }
        }
    }

    // Connections first, then the master channel, then the multiplexer.
    drop(slots);
    drop(channel);
    drop(handle);
    drop(mux);
    drop(bridge);

    tracing::info!("Worker loop finished");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::{Read, Write};
    use std::net::{SocketAddr, TcpStream};
    use std::time::Duration;

    /// Echoes bytes back and closes on EOF.
    #[derive(Default)]
    struct Echo {
        handle: Option<LoopHandle>,
        stream: Option<TcpStream>,
        closes: usize,
    }

    impl ConnectionHandler for Echo {
        fn init(&mut self, handle: LoopHandle, stream: TcpStream, _peer: SocketAddr) {
            self.handle = Some(handle);
            self.stream = Some(stream);
        }

        fn process(&mut self) {
            let mut buf = [0u8; 256];
            loop {
                let Some(stream) = self.stream.as_mut() else {
                    return;
                };
                match stream.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        let _ = stream.write_all(&buf[..n]);
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                    Err(_) => break,
                }
            }
            if let (Some(handle), Some(stream)) = (self.handle.as_ref(), self.stream.take()) {
                handle.close(stream);
                self.closes += 1;
            }
        }
    }

    fn listener() -> TcpListener {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        listener
    }

    #[test]
    fn empty_listener_is_not_an_error() {
        let listener = listener();
        let mux = Multiplexer::new(8).unwrap();
        let mut slots = ConnectionSlots::<Echo>::new(1024);

        assert_eq!(
            accept_one(&listener, &mux.handle(), &mut slots),
            Accept::Empty
        );
        assert_eq!(slots.allocated(), 0);
    }

    #[test]
    fn accepted_connection_is_served_and_closed_once() {
        let listener = listener();
        let mut mux = Multiplexer::new(8).unwrap();
        let handle = mux.handle();
        let mut slots = ConnectionSlots::<Echo>::new(65536);

        let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let mut other = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        other
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();

        // Give the kernel a moment to finish both handshakes.
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(accept_one(&listener, &handle, &mut slots), Accept::Taken);
        assert_eq!(accept_one(&listener, &handle, &mut slots), Accept::Taken);
        assert_eq!(accept_one(&listener, &handle, &mut slots), Accept::Empty);

        client.write_all(b"ping").unwrap();
        let ready: Vec<_> = mux
            .wait_timeout(Some(Duration::from_secs(2)))
            .unwrap()
            .collect();
        assert_eq!(ready.len(), 1);
        slots.get_mut(ready[0].fd).unwrap().process();

        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");

        // Client hangs up: the handler closes its side exactly once.
        let closed_fd = ready[0].fd;
        drop(client);
        let ready: Vec<_> = mux
            .wait_timeout(Some(Duration::from_secs(2)))
            .unwrap()
            .collect();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].fd, closed_fd);
        slots.get_mut(closed_fd).unwrap().process();
        slots.get_mut(closed_fd).unwrap().process();
        assert_eq!(slots.get_mut(closed_fd).unwrap().closes, 1);

        // The other connection is unaffected.
        other.write_all(b"pong").unwrap();
        let ready: Vec<_> = mux
            .wait_timeout(Some(Duration::from_secs(2)))
            .unwrap()
            .collect();
        assert_eq!(ready.len(), 1);
        assert_ne!(ready[0].fd, closed_fd);
        slots.get_mut(ready[0].fd).unwrap().process();
        let mut buf = [0u8; 4];
        other.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[test]
    fn queued_burst_taken_on_one_dispatch() {
        let listener = listener();
        let mux = Multiplexer::new(8).unwrap();
        let mut slots = ConnectionSlots::<Echo>::new(65536);

        let clients: Vec<_> = (0..4)
            .map(|_| TcpStream::connect(listener.local_addr().unwrap()).unwrap())
            .collect();
        std::thread::sleep(Duration::from_millis(50));

        assert_eq!(accept_pending(&listener, &mux.handle(), &mut slots), 4);
        assert_eq!(slots.allocated(), 4);
        assert_eq!(accept_pending(&listener, &mux.handle(), &mut slots), 0);
        drop(clients);
    }

    #[test]
    fn over_ceiling_connection_refused() {
        let listener = listener();
        let mux = Multiplexer::new(8).unwrap();
        let mut slots = ConnectionSlots::<Echo>::new(1);

        let mut client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        std::thread::sleep(Duration::from_millis(50));

        assert_eq!(accept_one(&listener, &mux.handle(), &mut slots), Accept::Taken);
        assert_eq!(slots.allocated(), 0);

        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).unwrap_or(0), 0);
    }
}
