//! Pool configuration.

use std::os::fd::RawFd;

use crate::error::{PoolError, Result};

/// Default ceiling on the number of pre-forked workers.
pub const MAX_WORKERS: usize = 16;

/// Default per-worker connection ceiling (also the slot table bound).
pub const CONNECTIONS_PER_WORKER: usize = 65536;

/// Default capacity of one readiness batch.
pub const MAX_EVENTS: usize = 10000;

pub const DEFAULT_WORKER_COUNT: usize = 8;

/// Immutable once the pool is constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Already bound and listening. Owned by the caller; the pool never closes it.
    pub listener: RawFd,
    pub worker_count: usize,
    /// Tunable ceiling for `worker_count`.
    pub max_workers: usize,
    pub connections_per_worker: usize,
    pub max_events: usize,
}

impl PoolConfig {
    pub fn new(listener: RawFd) -> Self {
        Self {
            listener,
            worker_count: DEFAULT_WORKER_COUNT,
            max_workers: MAX_WORKERS,
            connections_per_worker: CONNECTIONS_PER_WORKER,
            max_events: MAX_EVENTS,
        }
    }

    /// Build from defaults plus `PREFORK_*` environment overrides.
    pub fn from_env(listener: RawFd) -> Result<Self> {
        Self::new(listener).apply_overrides(|key| std::env::var(key).ok())
    }

    pub fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    pub fn with_connections_per_worker(mut self, connections: usize) -> Self {
        self.connections_per_worker = connections;
        self
    }

    pub fn with_max_events(mut self, max_events: usize) -> Self {
        self.max_events = max_events;
        self
    }

    /// Apply overrides from a key lookup (normally the process environment).
    ///
    /// Recognized keys: `PREFORK_WORKERS`, `PREFORK_MAX_EVENTS`,
    /// `PREFORK_CONNECTIONS_PER_WORKER`.
    pub fn apply_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(n) = parse_override(&lookup, "PREFORK_WORKERS")? {
            self.worker_count = n;
        }
        if let Some(n) = parse_override(&lookup, "PREFORK_MAX_EVENTS")? {
            self.max_events = n;
        }
        if let Some(n) = parse_override(&lookup, "PREFORK_CONNECTIONS_PER_WORKER")? {
            self.connections_per_worker = n;
        }
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 || self.worker_count > self.max_workers {
            return Err(PoolError::InvalidWorkerCount {
                count: self.worker_count,
                max: self.max_workers,
            });
        }
        if self.connections_per_worker == 0 {
            return Err(PoolError::invalid_config(
                "connections_per_worker must be non-zero",
            ));
        }
        if self.max_events == 0 {
            return Err(PoolError::invalid_config("max_events must be non-zero"));
        }
        if self.listener < 0 {
            return Err(PoolError::invalid_config(format!(
                "listener fd {} is not a descriptor",
                self.listener
            )));
        }
        Ok(())
    }
}

fn parse_override<F>(lookup: &F, key: &str) -> Result<Option<usize>>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<usize>()
            .map(Some)
            .map_err(|e| PoolError::invalid_config(format!("{key}={raw:?}: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let config = PoolConfig::new(3);
        assert_eq!(config.worker_count, 8);
        assert_eq!(config.max_workers, 16);
        assert_eq!(config.connections_per_worker, 65536);
        assert_eq!(config.max_events, 10000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn worker_count_bounds() {
        assert!(PoolConfig::new(3).with_worker_count(1).validate().is_ok());
        assert!(PoolConfig::new(3).with_worker_count(16).validate().is_ok());

        let err = PoolConfig::new(3).with_worker_count(0).validate().unwrap_err();
        assert!(matches!(
            err,
            PoolError::InvalidWorkerCount { count: 0, max: 16 }
        ));

        let err = PoolConfig::new(3).with_worker_count(17).validate().unwrap_err();
        assert!(matches!(
            err,
            PoolError::InvalidWorkerCount { count: 17, max: 16 }
        ));
    }

    #[test]
    fn ceiling_is_tunable() {
        let config = PoolConfig::new(3).with_max_workers(32).with_worker_count(20);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_capacities_rejected() {
        assert!(
            PoolConfig::new(3)
                .with_max_events(0)
                .validate()
                .is_err()
        );
        assert!(
            PoolConfig::new(3)
                .with_connections_per_worker(0)
                .validate()
                .is_err()
        );
        assert!(PoolConfig::new(-1).validate().is_err());
    }

    #[test]
    fn overrides_applied() {
        let config = PoolConfig::new(3)
            .apply_overrides(lookup(&[
                ("PREFORK_WORKERS", "4"),
                ("PREFORK_MAX_EVENTS", " 128 "),
            ]))
            .unwrap();
        assert_eq!(config.worker_count, 4);
        assert_eq!(config.max_events, 128);
        assert_eq!(config.connections_per_worker, CONNECTIONS_PER_WORKER);
    }

    #[test]
    fn unparseable_override_is_error() {
        let err = PoolConfig::new(3)
            .apply_overrides(lookup(&[("PREFORK_WORKERS", "many")]))
            .unwrap_err();
        assert!(err.to_string().contains("PREFORK_WORKERS"));
    }
}
