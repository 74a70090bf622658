//! prefork: pre-forked worker pool engine.
//!
//! One listening socket is shared by a fixed set of worker processes forked at
//! startup. The master never accepts; it watches the listener and hands each
//! readiness edge to the next live worker (round robin) as a token over a
//! private channel, and that worker accepts the connection itself.

#[cfg(not(unix))]
compile_error!("prefork requires a Unix platform (fork, sigaction, waitpid)");

pub mod channel;
pub mod config;
pub mod error;
pub mod handler;
pub mod master;
pub mod poll;
pub mod pool;
pub mod reap;
pub mod signal;
pub mod table;
mod worker;

pub use config::{CONNECTIONS_PER_WORKER, MAX_EVENTS, MAX_WORKERS, PoolConfig};
pub use error::{PoolError, Result};
pub use handler::{ConnectionHandler, ConnectionSlots};
pub use poll::{LoopHandle, Multiplexer, Readiness};
pub use pool::{ProcessPool, Role};
pub use signal::SignalBridge;
pub use table::{RoundRobin, WorkerRecord, WorkerTable};

pub use nix::unistd::Pid;
