//! Listening socket setup.

use std::io;
use std::net::{IpAddr, SocketAddr, TcpListener};

/// Bind and listen on `ip:port`. The caller owns the socket and is the only
/// one that closes it.
pub fn bind_listener(ip: &str, port: u16) -> io::Result<TcpListener> {
    let addr: IpAddr = ip.parse().map_err(|e| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid address '{ip}': {e}"),
        )
    })?;
    let listener = TcpListener::bind(SocketAddr::new(addr, port))?;
    tracing::info!(addr = %listener.local_addr()?, "Listening");
    Ok(listener)
}
