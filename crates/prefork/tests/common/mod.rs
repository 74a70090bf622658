//! Shared fixtures for the forking integration tests.

#![allow(dead_code)]

use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use prefork::{ConnectionHandler, LoopHandle};

/// Replies with the serving worker's pid, closes on EOF.
#[derive(Default)]
pub struct WhoAmI {
    handle: Option<LoopHandle>,
    stream: Option<TcpStream>,
}

impl ConnectionHandler for WhoAmI {
    fn init(&mut self, handle: LoopHandle, stream: TcpStream, _peer: SocketAddr) {
        self.handle = Some(handle);
        self.stream = Some(stream);
    }

    fn process(&mut self) {
        let mut buf = [0u8; 64];
        loop {
            let Some(stream) = self.stream.as_mut() else {
                return;
            };
            match stream.read(&mut buf) {
                Ok(0) => break,
                Ok(_) => {
                    let _ = writeln!(stream, "{}", std::process::id());
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(_) => break,
            }
        }
        if let (Some(handle), Some(stream)) = (self.handle.as_ref(), self.stream.take()) {
            handle.close(stream);
        }
    }
}

/// Connect and send a request without waiting for the reply.
pub fn send_request(addr: SocketAddr) -> io::Result<TcpStream> {
    let mut stream = TcpStream::connect(addr)?;
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    stream.write_all(b"who\n")?;
    Ok(stream)
}

/// Read the serving worker's pid off a request stream.
pub fn read_reply(stream: &TcpStream) -> io::Result<u32> {
    let mut line = String::new();
    BufReader::new(stream).read_line(&mut line)?;
    line.trim()
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("{line:?}: {e}")))
}

pub fn ask(addr: SocketAddr) -> io::Result<u32> {
    read_reply(&send_request(addr)?)
}
