//! Master loop: round-robin accept dispatch and worker reaping.
//!
//! The master never accepts connections itself. When the listener turns
//! readable it picks the next live worker and writes a dispatch token into that
//! worker's channel; the worker then races for `accept` on the shared listener.
//!
//! Worker exits arrive as SIGCHLD through the signal bridge. Reaped workers are
//! retired from the table permanently. Once no live worker remains, or the
//! listener fires with nobody left to serve it, the loop stops.

use std::os::fd::AsRawFd;

use nix::sys::signal::{Signal, kill};
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;

use crate::channel;
use crate::config::PoolConfig;
use crate::error::Result;
use crate::poll::Multiplexer;
use crate::reap;
use crate::signal::{self, SignalBridge};
use crate::table::{RoundRobin, WorkerTable};

/// Master-side loop state, independent of the OS event sources.
pub struct Master<'a> {
    table: &'a mut WorkerTable,
    rr: RoundRobin,
    stop: bool,
}

impl<'a> Master<'a> {
    pub fn new(table: &'a mut WorkerTable) -> Self {
        Self {
            table,
            rr: RoundRobin::new(),
            stop: false,
        }
    }

    pub fn stop_requested(&self) -> bool {
        self.stop
    }

    pub fn table(&self) -> &WorkerTable {
        &*self.table
    }

    /// Signal the next live worker that a connection is waiting.
    ///
    /// Returns the selected worker, or `None` (and requests stop) when the pool
    /// has no capacity left.
    pub fn dispatch(&mut self) -> Option<usize> {
        let Some(index) = self.rr.select(&*self.table) else {
            tracing::error!("No live workers left to dispatch to, stopping");
            self.stop = true;
            return None;
        };

        let Some(worker) = self.table.get(index).and_then(|r| r.channel()) else {
            tracing::error!(worker = index, "Live worker has no channel");
            return Some(index);
        };

        match channel::send_token(worker) {
            Ok(()) => tracing::debug!(worker = index, "Dispatched connection"),
            // Dead-but-unreaped workers and full channels both land here; the
            // SIGCHLD path cleans up the former.
            Err(e) => tracing::warn!(worker = index, error = %e, "Failed to dispatch token"),
        }
        Some(index)
    }

    /// Retire every reaped worker; request stop once the whole table is dead.
    pub fn on_children_exited<I>(&mut self, reaped: I)
    where
        I: IntoIterator<Item = (Pid, WaitStatus)>,
    {
        let mut any = false;
        for (pid, status) in reaped {
            any = true;
            match self.table.reap(pid) {
                Some(index) => tracing::info!(
                    worker = index,
                    %pid,
                    status = %reap::describe(&status),
                    "Worker exited"
                ),
                None => tracing::debug!(%pid, "Reaped unknown child"),
            }
        }

        if any && self.table.all_dead() {
            tracing::info!("All workers exited");
            self.stop = true;
        }
    }

    /// Forward SIGTERM to every live worker. The loop itself keeps running
    /// until those workers have been reaped.
    pub fn on_shutdown(&mut self, signal: Signal) {
        tracing::info!(%signal, live = self.table.live_count(), "Stopping all workers");
        for (index, pid) in self.table.live_pids() {
            if let Err(e) = kill(pid, Signal::SIGTERM) {
                tracing::warn!(worker = index, %pid, error = %e, "Failed to signal worker");
            }
        }
    }
}

pub(crate) fn run(config: &PoolConfig, table: &mut WorkerTable) -> Result<()> {
    let mut mux = Multiplexer::new(config.max_events)?;
    let bridge = SignalBridge::install(&[Signal::SIGCHLD, Signal::SIGTERM, Signal::SIGINT])?;
    signal::ignore(Signal::SIGPIPE)?;

    let bridge_fd = bridge.as_raw_fd();
    mux.register(config.listener)?;
    mux.register(bridge_fd)?;

    let mut master = Master::new(table);

    // Workers that died before SIGCHLD was routed into the bridge.
    let early = reap::reap_exited();
    if !early.is_empty() {
        master.on_children_exited(early);
    }

    tracing::info!(workers = master.table().len(), "Master loop started");

    while !master.stop_requested() {
        for ready in mux.wait()? {
            if ready.fd == config.listener {
                if master.dispatch().is_none() {
                    break;
                }
            } else if ready.fd == bridge_fd {
                for signal in bridge.drain() {
                    match signal {
                        Signal::SIGCHLD => master.on_children_exited(reap::reap_exited()),
                        Signal::SIGTERM | Signal::SIGINT => master.on_shutdown(signal),
                        _ => {}
                    }
                }
            }
        }
    }

    tracing::info!("Master loop finished");
    Ok(())
}
