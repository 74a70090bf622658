//! End-to-end: a real master and two real workers serving sequential clients.
//!
//! Forks for real, so this binary holds a single test.

mod common;

use std::net::TcpListener;
use std::os::fd::AsRawFd;

use nix::sys::signal::{Signal, kill};
use nix::unistd::getpid;
use prefork::{PoolConfig, ProcessPool, Role};

use common::{WhoAmI, ask};

#[test]
fn sequential_clients_rotate_across_workers() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let config = PoolConfig::new(listener.as_raw_fd()).with_worker_count(2);

    let pool = ProcessPool::create(config).unwrap();

    if let Role::Worker(_) = pool.role() {
        let code = match pool.run::<WhoAmI>() {
            Ok(()) => 0,
            Err(_) => 1,
        };
        // Safety: leave the forked test harness without running its teardown.
        unsafe { libc::_exit(code) };
    }

    assert_eq!(pool.config().worker_count, 2);

    // Threads only after the fan-out.
    let master = getpid();
    let clients = std::thread::spawn(move || {
        let served: Vec<_> = (0..3).map(|_| ask(addr)).collect();
        kill(master, Signal::SIGTERM).unwrap();
        served
    });

    pool.run::<WhoAmI>().unwrap();

    let served: Vec<u32> = clients
        .join()
        .unwrap()
        .into_iter()
        .map(Result::unwrap)
        .collect();
    assert_eq!(served[0], served[2]);
    assert_ne!(served[0], served[1]);
    assert!(pool.worker_pids().iter().all(Option::is_none));
}
