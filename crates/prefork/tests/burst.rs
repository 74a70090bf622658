//! Connections queued on the listener before the master first waits are all
//! served, even though they surface as a single readiness edge.
//!
//! Forks for real, so this binary holds a single test.

mod common;

use std::net::TcpListener;
use std::os::fd::AsRawFd;

use nix::sys::signal::{Signal, kill};
use nix::unistd::getpid;
use prefork::{PoolConfig, ProcessPool, Role};

use common::{WhoAmI, read_reply, send_request};

#[test]
fn queued_burst_is_fully_served() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    // Completed handshakes sit in the backlog until a worker accepts them.
    let queued: Vec<_> = (0..4).map(|_| send_request(addr).unwrap()).collect();

    let config = PoolConfig::new(listener.as_raw_fd()).with_worker_count(2);
    let pool = ProcessPool::create(config).unwrap();

    if let Role::Worker(_) = pool.role() {
        drop(queued);
        let code = match pool.run::<WhoAmI>() {
            Ok(()) => 0,
            Err(_) => 1,
        };
        // Safety: leave the forked test harness without running its teardown.
        unsafe { libc::_exit(code) };
    }

    let master = getpid();
    let clients = std::thread::spawn(move || {
        let replies: Vec<_> = queued.iter().map(read_reply).collect();
        kill(master, Signal::SIGTERM).unwrap();
        replies
    });

    pool.run::<WhoAmI>().unwrap();

    let replies = clients.join().unwrap();
    let served = replies.iter().filter(|r| r.is_ok()).count();
    assert_eq!(served, 4, "replies: {replies:?}");
}
