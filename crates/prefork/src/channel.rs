//! Master → worker dispatch tokens.
//!
//! Each worker is connected to the master by one `UnixStream` pair. The master
//! writes a fixed-size integer token meaning "a connection is waiting, try to
//! accept". The value is never inspected. The channel is a byte stream, so the
//! worker counts whole tokens when draining and may see several coalesced
//! behind a single readiness edge.

use std::io::{self, Read, Write};
use std::os::unix::net::UnixStream;

pub const DISPATCH_TOKEN: i32 = 1;

pub const TOKEN_LEN: usize = std::mem::size_of::<i32>();

/// Write one token. Both ends are non-blocking, so a worker that stopped
/// draining yields `WouldBlock` and a dead worker yields `BrokenPipe`.
pub fn send_token(channel: &UnixStream) -> io::Result<()> {
    let mut writer = channel;
    let bytes = DISPATCH_TOKEN.to_ne_bytes();
    loop {
        match writer.write(&bytes) {
            Ok(n) if n == TOKEN_LEN => return Ok(()),
            Ok(n) => {
                return Err(io::Error::new(
                    io::ErrorKind::WriteZero,
                    format!("short token write ({n} of {TOKEN_LEN} bytes)"),
                ));
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Result of draining a worker's channel until it would block.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TokenDrain {
    /// Accept attempts owed. A trailing partial token still counts as one.
    pub tokens: usize,
    /// The master end is gone.
    pub closed: bool,
}

pub fn drain_tokens(channel: &UnixStream) -> TokenDrain {
    let mut reader = channel;
    let mut buf = [0u8; 64 * TOKEN_LEN];
    let mut bytes = 0usize;
    let mut closed = false;
    loop {
        match reader.read(&mut buf) {
            Ok(0) => {
                closed = true;
                break;
            }
            Ok(n) => bytes += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                closed = true;
                break;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Dispatch channel read failed");
                break;
            }
        }
    }
    TokenDrain {
        tokens: bytes.div_ceil(TOKEN_LEN),
        closed,
    }
}
