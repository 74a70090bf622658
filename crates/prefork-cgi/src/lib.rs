//! prefork-cgi: CGI-style server on the prefork worker pool.
//!
//! Each request is one line naming a program; the serving worker runs it with
//! the connection as its stdout.

pub mod cgi;
pub mod listener;
pub mod logging;

pub use cgi::CgiConnection;
pub use listener::bind_listener;
pub use logging::init_tracing;
