//! Signal bridge (self-pipe).
//!
//! Signal handlers cannot capture per-instance state, so the write end of the
//! bridge lives in a process-wide atomic. The handler body does exactly one
//! async-signal-safe thing: it sends the signal number as a single byte into
//! that descriptor, preserving `errno` around the call. Everything else
//! (reaping, stop flags) runs later in loop context once the read end shows up
//! as ready in the multiplexer.
//!
//! ## Lifecycle
//!
//! At most one bridge is live per process image. `SignalBridge::install`
//! claims the process-wide slot and fails with `PoolError::BridgeActive` if it
//! is taken; dropping the bridge restores default dispositions and releases
//! the slot. A forked child never inherits a live bridge from the pool: the
//! fan-out happens before any loop installs one.

use std::io::{self, Read};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicI32, Ordering};

use nix::errno::Errno;
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};

use crate::error::{PoolError, Result};

/// Write end of the live bridge, or -1.
static BRIDGE_WRITE_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn forward_signal(signo: libc::c_int) {
    let saved = Errno::last_raw();
    let fd = BRIDGE_WRITE_FD.load(Ordering::Relaxed);
    if fd >= 0 {
        let byte = signo as u8;
        // Safety: send(2) is async-signal-safe; the buffer is a live stack byte.
        // A full bridge drops the byte, which is fine: one pending byte per
        // signal kind is enough to trigger the drain.
        unsafe {
            libc::send(fd, (&byte as *const u8).cast(), 1, libc::MSG_DONTWAIT);
        }
    }
    Errno::set_raw(saved);
}

/// Ignore `signal` process-wide.
///
/// Used for SIGPIPE so that writing to a peer that hung up surfaces as an
/// ordinary `EPIPE` error.
pub fn ignore(signal: Signal) -> Result<()> {
    let action = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    // Safety: SigIgn installs no Rust code as a handler.
    unsafe { sigaction(signal, &action) }
        .map(drop)
        .map_err(|source| PoolError::Signal { signal, source })
}

pub struct SignalBridge {
    reader: UnixStream,
    // Kept open for the handler; BRIDGE_WRITE_FD aliases it.
    writer: UnixStream,
    signals: Vec<Signal>,
}

impl SignalBridge {
    /// Create the bridge and route `signals` into it.
    ///
    /// Handlers run with every signal blocked and `SA_RESTART` set.
    pub fn install(signals: &[Signal]) -> Result<Self> {
        let (reader, writer) = UnixStream::pair().map_err(PoolError::Bridge)?;
        reader.set_nonblocking(true).map_err(PoolError::Bridge)?;
        writer.set_nonblocking(true).map_err(PoolError::Bridge)?;

        BRIDGE_WRITE_FD
            .compare_exchange(-1, writer.as_raw_fd(), Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| PoolError::BridgeActive)?;

        let mut bridge = Self {
            reader,
            writer,
            signals: Vec::with_capacity(signals.len()),
        };

        let action = SigAction::new(
            SigHandler::Handler(forward_signal),
            SaFlags::SA_RESTART,
            SigSet::all(),
        );
        for &signal in signals {
            // Safety: forward_signal only touches an atomic, errno and send(2).
            // On error, `bridge` drops and restores the signals installed so far.
            unsafe { sigaction(signal, &action) }
                .map_err(|source| PoolError::Signal { signal, source })?;
            bridge.signals.push(signal);
        }

        tracing::debug!(
            fd = bridge.reader.as_raw_fd(),
            signals = ?bridge.signals,
            "Signal bridge installed"
        );
        Ok(bridge)
    }

    /// Read every pending signal byte, in delivery order.
    ///
    /// Bytes that do not name a known signal are skipped.
    pub fn drain(&self) -> Vec<Signal> {
        let mut pending = Vec::new();
        let mut buf = [0u8; 1024];
        let mut reader = &self.reader;
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => pending.extend(
                    buf[..n]
                        .iter()
                        .filter_map(|&b| Signal::try_from(i32::from(b)).ok()),
                ),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    tracing::warn!(error = %e, "Signal bridge read failed");
                    break;
                }
            }
        }
        pending
    }
}

impl AsRawFd for SignalBridge {
    fn as_raw_fd(&self) -> RawFd {
        self.reader.as_raw_fd()
    }
}

impl Drop for SignalBridge {
    fn drop(&mut self) {
        let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
        for &signal in &self.signals {
            // Safety: restoring the default disposition.
            if let Err(e) = unsafe { sigaction(signal, &default) } {
                tracing::warn!(%signal, error = %e, "Failed to restore signal disposition");
            }
        }
        let _ = BRIDGE_WRITE_FD.compare_exchange(
            self.writer.as_raw_fd(),
            -1,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        tracing::trace!("Signal bridge removed");
    }
}
