//! Fatal pool errors.
//!
//! Only setup-class failures are represented here. Transient conditions in the
//! steady-state loops (would-block reads, lost accept races, peers hanging up)
//! are logged and never surface as a `PoolError`.

use std::io;
use std::os::fd::RawFd;

use nix::sys::signal::Signal;

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("worker count {count} outside 1..={max}")]
    InvalidWorkerCount { count: usize, max: usize },

    #[error("invalid pool config: {message}")]
    InvalidConfig { message: String },

    #[error("failed to create channel for worker {worker}: {source}")]
    Channel {
        worker: usize,
        #[source]
        source: io::Error,
    },

    #[error("fork failed for worker {worker}: {source}")]
    Fork {
        worker: usize,
        #[source]
        source: nix::Error,
    },

    #[error("failed to create multiplexer: {0}")]
    Multiplexer(#[source] io::Error),

    #[error("multiplexer wait failed: {0}")]
    Wait(#[source] io::Error),

    #[error("failed to register fd {fd}: {source}")]
    Register {
        fd: RawFd,
        #[source]
        source: io::Error,
    },

    #[error("failed to install handler for {signal}: {source}")]
    Signal {
        signal: Signal,
        #[source]
        source: nix::Error,
    },

    #[error("signal bridge already installed in this process")]
    BridgeActive,

    #[error("failed to create signal bridge: {0}")]
    Bridge(#[source] io::Error),

    #[error("failed to prepare listener: {0}")]
    Listener(#[source] io::Error),

    #[error("pool already ran in this process")]
    AlreadyRan,
}

impl PoolError {
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, PoolError>;
