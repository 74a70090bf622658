//! CGI-style connection handler.
//!
//! A request is a single line, `<program>\r\n`. The program path is resolved
//! relative to the server's working directory; if it exists it is spawned with
//! the connection as its stdout and the worker drops its own copy of the
//! connection. Spawned programs are reaped by the worker's SIGCHLD handling.

use std::io::{self, Read};
use std::net::{SocketAddr, TcpStream};
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use prefork::{ConnectionHandler, LoopHandle};

pub const BUFFER_SIZE: usize = 1024;

#[derive(Default)]
pub struct CgiConnection {
    handle: Option<LoopHandle>,
    stream: Option<TcpStream>,
    peer: Option<SocketAddr>,
    buf: Vec<u8>,
    read_idx: usize,
}

impl CgiConnection {
    pub fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Deregister and close the connection. No-op once closed.
    fn close(&mut self) {
        if let (Some(handle), Some(stream)) = (self.handle.as_ref(), self.stream.take()) {
            handle.close(stream);
        }
    }

    fn execute(&mut self, request: &str) {
        let program = program_path(request);
        if !program.exists() {
            tracing::info!(peer = ?self.peer, program = %program.display(), "Requested program not found");
            self.close();
            return;
        }

        match self.spawn(&program) {
            Ok(child) => tracing::info!(
                peer = ?self.peer,
                program = %program.display(),
                pid = child.id(),
                "Started program"
            ),
            Err(e) => tracing::warn!(
                peer = ?self.peer,
                program = %program.display(),
                error = %e,
                "Failed to start program"
            ),
        }
        self.close();
    }

    fn spawn(&self, program: &Path) -> io::Result<Child> {
        let stream = self
            .stream
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "connection closed"))?;
        let output = stream.try_clone()?;
        // The program writes with plain blocking I/O.
        output.set_nonblocking(false)?;
        Command::new(program)
            .stdin(Stdio::null())
            .stdout(Stdio::from(OwnedFd::from(output)))
            .spawn()
    }
}

impl ConnectionHandler for CgiConnection {
    fn init(&mut self, handle: LoopHandle, stream: TcpStream, peer: SocketAddr) {
        self.handle = Some(handle);
        self.stream = Some(stream);
        self.peer = Some(peer);
        self.buf.clear();
        self.buf.resize(BUFFER_SIZE, 0);
        self.read_idx = 0;
    }

    fn process(&mut self) {
        loop {
            let Some(stream) = self.stream.as_mut() else {
                return;
            };
            // One byte stays free, as a request must fit with its terminator.
            if self.read_idx >= BUFFER_SIZE - 1 {
                tracing::warn!(peer = ?self.peer, "Request line too long, closing");
                self.close();
                return;
            }

            match stream.read(&mut self.buf[self.read_idx..BUFFER_SIZE - 1]) {
                Ok(0) => {
                    tracing::debug!(peer = ?self.peer, "Peer closed connection");
                    self.close();
                    return;
                }
                Ok(n) => {
                    self.read_idx += n;
                    tracing::debug!(peer = ?self.peer, bytes = n, "Read request bytes");
                    if let Some(end) = find_line_end(&self.buf[..self.read_idx]) {
                        let request = String::from_utf8_lossy(&self.buf[..end]).into_owned();
                        self.execute(&request);
                        return;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::warn!(peer = ?self.peer, error = %e, "Read failed, closing");
                    self.close();
                    return;
                }
            }
        }
    }
}

fn find_line_end(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// Bare names resolve against the working directory, never `PATH`.
fn program_path(request: &str) -> PathBuf {
    if request.contains('/') {
        PathBuf::from(request)
    } else {
        Path::new(".").join(request)
    }
}
