//! Process pool: fork fan-out and role dispatch.
//!
//! `ProcessPool::create` forks the fixed worker set exactly once per process.
//! When it returns, the original process holds the master-role pool and each
//! child holds a worker-role pool with its own index; every process then calls
//! the same `run`, which branches on that role.
//!
//! ## Safety contracts
//!
//! - `create` must run before the process spawns any thread. A forked child
//!   only has the forking thread, and locks held elsewhere stay locked.
//! - `config.listener` must be an open, listening TCP socket that outlives the
//!   pool. The pool borrows it and never closes it.
//!
//! ## Known limitation
//!
//! A channel or fork failure at worker `i` aborts construction, but workers
//! `0..i` are already running. They are left as orphans; each one stops on its
//! own once it sees its master channel close.

use std::mem::ManuallyDrop;
use std::net::TcpListener;
use std::os::fd::FromRawFd;
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};

use nix::unistd::{ForkResult, Pid, fork, getpid};

use crate::config::PoolConfig;
use crate::error::{PoolError, Result};
use crate::handler::ConnectionHandler;
use crate::table::{WorkerRecord, WorkerTable};
use crate::{master, worker};

/// Which side of the fan-out this process is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Worker(usize),
}

static INSTANCE: OnceLock<ProcessPool> = OnceLock::new();
static CONSTRUCTION: Mutex<()> = Mutex::new(());

pub struct ProcessPool {
    config: PoolConfig,
    role: Role,
    listener: ManuallyDrop<TcpListener>,
    workers: Mutex<WorkerTable>,
    ran: AtomicBool,
}

impl ProcessPool {
    /// Construct the pool, forking `config.worker_count` workers, or return the
    /// pool already constructed in this process.
    ///
    /// A second call never forks again; its `config` is ignored.
    pub fn create(config: PoolConfig) -> Result<&'static ProcessPool> {
        if let Some(pool) = INSTANCE.get() {
            tracing::debug!("Process pool already constructed");
            return Ok(pool);
        }

        let _guard = CONSTRUCTION
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(pool) = INSTANCE.get() {
            return Ok(pool);
        }

        let pool = Self::fork_workers(config)?;
        Ok(INSTANCE.get_or_init(|| pool))
    }

    /// The pool constructed in this process, if any.
    pub fn get() -> Option<&'static ProcessPool> {
        INSTANCE.get()
    }

    fn fork_workers(config: PoolConfig) -> Result<Self> {
        config.validate()?;

        // Safety: caller contract (see module docs). ManuallyDrop keeps the
        // descriptor open for its owner.
        let listener = ManuallyDrop::new(unsafe { TcpListener::from_raw_fd(config.listener) });
        listener.local_addr().map_err(PoolError::Listener)?;
        // Shared file status flags: a lost accept race must not block a worker.
        listener.set_nonblocking(true).map_err(PoolError::Listener)?;

        let count = config.worker_count;
        let mut table = WorkerTable::with_capacity(count);
        let mut role = Role::Master;

        for index in 0..count {
            let (master_end, worker_end) = channel_pair()
                .map_err(|source| PoolError::Channel { worker: index, source })
                .inspect_err(|_| warn_orphans(index))?;

            // Safety: no other threads exist (caller contract); the child only
            // closes descriptors before returning to ordinary code.
            match unsafe { fork() } {
                Ok(ForkResult::Parent { child }) => {
                    drop(worker_end);
                    tracing::debug!(worker = index, pid = %child, "Forked worker");
                    table.push(WorkerRecord::new(child, master_end));
                }
                Ok(ForkResult::Child) => {
                    drop(master_end);
                    // Earlier siblings' master ends were inherited; close them.
                    table.retain_only(index);
                    table.push(WorkerRecord::new(getpid(), worker_end));
                    role = Role::Worker(index);
                    break;
                }
                Err(source) => {
                    warn_orphans(index);
                    return Err(PoolError::Fork {
                        worker: index,
                        source,
                    });
                }
            }
        }

        if role == Role::Master {
            tracing::info!(workers = count, "Process pool constructed");
        }

        Ok(Self {
            config,
            role,
            listener,
            workers: Mutex::new(table),
            ran: AtomicBool::new(false),
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Configured number of workers (the table length), live or not.
    pub fn worker_count(&self) -> usize {
        self.config.worker_count
    }

    /// Per-slot pids as seen by this process. `None` marks a retired slot.
    ///
    /// In a worker only its own slot is populated. In the master, `run` holds
    /// the table until it returns, so a call from another thread blocks for the
    /// whole serving lifetime; take a snapshot before calling `run`.
    pub fn worker_pids(&self) -> Vec<Option<Pid>> {
        self.lock_workers().pids()
    }

    /// Run this process's side of the pool until it stops.
    ///
    /// The master returns once every worker has been reaped (or none is left to
    /// dispatch to); a worker returns after SIGTERM/SIGINT or when its master
    /// channel closes.
    pub fn run<H: ConnectionHandler>(&self) -> Result<()> {
        if self.ran.swap(true, Ordering::AcqRel) {
            return Err(PoolError::AlreadyRan);
        }

        let mut workers = self.lock_workers();
        match self.role {
            Role::Master => master::run(&self.config, &mut workers),
            Role::Worker(index) => {
                let channel = workers
                    .get_mut(index)
                    .and_then(WorkerRecord::take_channel)
                    .ok_or(PoolError::AlreadyRan)?;
                drop(workers);
                worker::run::<H>(index, &self.config, &self.listener, channel)
            }
        }
    }

    fn lock_workers(&self) -> MutexGuard<'_, WorkerTable> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for ProcessPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessPool")
            .field("role", &self.role)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Both ends close-on-exec and non-blocking.
fn channel_pair() -> std::io::Result<(UnixStream, UnixStream)> {
    let (master_end, worker_end) = UnixStream::pair()?;
    master_end.set_nonblocking(true)?;
    worker_end.set_nonblocking(true)?;
    Ok((master_end, worker_end))
}

fn warn_orphans(forked: usize) {
    if forked > 0 {
        tracing::warn!(orphaned = forked, "Pool construction failed with workers already running");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Forking inside the unit-test harness is unsafe (other test threads), so
    // construction is covered by tests/lifecycle.rs; here only the paths that
    // fail before any fork.

    #[test]
    fn invalid_worker_count_fails_before_fork() {
        let err = ProcessPool::fork_workers(PoolConfig::new(0).with_worker_count(0)).unwrap_err();
        assert!(matches!(err, PoolError::InvalidWorkerCount { count: 0, .. }));
    }

    #[test]
    fn role_is_copy_and_comparable() {
        let role = Role::Worker(3);
        let copy = role;
        assert_eq!(role, copy);
        assert_ne!(role, Role::Master);
    }
}
