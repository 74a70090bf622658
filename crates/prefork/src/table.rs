//! Worker descriptor table and round-robin selection.
//!
//! The table is sized once, before the first fork, and never changes length.
//! Only the per-slot pid moves: unassigned → running → unassigned (on reap).
//! An unassigned slot is dead for good; it is never refilled and its channel,
//! once closed, is never reused.

use std::os::unix::net::UnixStream;

use nix::unistd::Pid;

/// One pre-forked worker, as seen by the process holding the table.
///
/// In the master `channel` is the master-side end of the worker's pair; in a
/// worker the table only carries that worker's own end.
#[derive(Debug, Default)]
pub struct WorkerRecord {
    pid: Option<Pid>,
    channel: Option<UnixStream>,
}

impl WorkerRecord {
    pub fn new(pid: Pid, channel: UnixStream) -> Self {
        Self {
            pid: Some(pid),
            channel: Some(channel),
        }
    }

    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    pub fn is_live(&self) -> bool {
        self.pid.is_some()
    }

    pub fn channel(&self) -> Option<&UnixStream> {
        self.channel.as_ref()
    }

    pub(crate) fn take_channel(&mut self) -> Option<UnixStream> {
        self.channel.take()
    }

    /// Close the channel and mark the slot permanently dead.
    fn retire(&mut self) {
        self.pid = None;
        self.channel = None;
    }
}

#[derive(Debug, Default)]
pub struct WorkerTable {
    records: Vec<WorkerRecord>,
}

impl WorkerTable {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: Vec::with_capacity(capacity),
        }
    }

    /// Append the record for the next forked worker.
    pub fn push(&mut self, record: WorkerRecord) {
        self.records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&WorkerRecord> {
        self.records.get(index)
    }

    pub(crate) fn get_mut(&mut self, index: usize) -> Option<&mut WorkerRecord> {
        self.records.get_mut(index)
    }

    pub fn live_count(&self) -> usize {
        self.records.iter().filter(|r| r.is_live()).count()
    }

    pub fn all_dead(&self) -> bool {
        self.records.iter().all(|r| !r.is_live())
    }

    pub fn live_pids(&self) -> impl Iterator<Item = (usize, Pid)> + '_ {
        self.records
            .iter()
            .enumerate()
            .filter_map(|(i, r)| r.pid.map(|pid| (i, pid)))
    }

    pub fn pids(&self) -> Vec<Option<Pid>> {
        self.records.iter().map(|r| r.pid).collect()
    }

    /// Retire the worker whose pid is `pid`. Returns its index, or `None` for a
    /// pid that is not (or no longer) in the table.
    pub fn reap(&mut self, pid: Pid) -> Option<usize> {
        let index = self.records.iter().position(|r| r.pid == Some(pid))?;
        self.records[index].retire();
        Some(index)
    }

    /// Keep only `index`'s record; every other slot is retired.
    ///
    /// Run in a freshly forked worker: the channels of earlier siblings were
    /// inherited from the master and must not stay reachable.
    pub(crate) fn retain_only(&mut self, index: usize) {
        for (i, record) in self.records.iter_mut().enumerate() {
            if i != index {
                record.retire();
            }
        }
    }
}

/// Rotating cursor over the table. Dead slots are skipped; the cursor only
/// ever lands one past the last selected worker.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RoundRobin {
    cursor: usize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(cursor: usize) -> Self {
        Self { cursor }
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Pick the next live worker, scanning forward from the cursor with
    /// wraparound. `None` when the full table holds no live worker.
    pub fn select(&mut self, table: &WorkerTable) -> Option<usize> {
        let len = table.len();
        if len == 0 {
            return None;
        }
        let start = self.cursor % len;
        let index = (0..len)
            .map(|step| (start + step) % len)
            .find(|&i| table.records[i].is_live())?;
        self.cursor = (index + 1) % len;
        Some(index)
    }
}
