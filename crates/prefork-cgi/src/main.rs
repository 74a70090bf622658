use std::os::fd::AsRawFd;
use std::process;

use anyhow::Context;

use prefork::{PoolConfig, ProcessPool, Role};
use prefork_cgi::{CgiConnection, bind_listener, init_tracing};

#[derive(Debug, PartialEq, Eq)]
struct Args {
    ip: String,
    port: u16,
    workers: Option<usize>,
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    let args = match parse_args(&args) {
        Ok(v) => v,
        Err(msg) => {
            eprintln!("error: {msg}");
            eprintln!();
            eprintln!("Usage: prefork-cgi <ip> <port> [--workers <n>]");
            eprintln!();
            eprintln!("Arguments:");
            eprintln!("  <ip>             IPv4 address to listen on");
            eprintln!("  <port>           TCP port to listen on");
            eprintln!();
            eprintln!("Options:");
            eprintln!("  --workers <n>    Number of pre-forked workers [default: 8, or PREFORK_WORKERS]");
            process::exit(2);
        }
    };

    if let Err(e) = run(&args) {
        eprintln!("error: {e:#}");
        process::exit(1);
    }
}

fn parse_args(args: &[String]) -> Result<Args, String> {
    let mut positional: Vec<&str> = Vec::with_capacity(2);
    let mut workers: Option<usize> = None;

    let mut i = 1; // skip argv[0]
    while i < args.len() {
        match args[i].as_str() {
            "--workers" | "-w" => {
                i += 1;
                let value = args.get(i).ok_or("--workers requires a value")?;
                workers = Some(
                    value
                        .parse()
                        .map_err(|_| format!("invalid worker count: {value}"))?,
                );
            }
            "--help" | "-h" => return Err("".to_string()),
            arg if arg.starts_with('-') => return Err(format!("unknown flag: {arg}")),
            arg => {
                if positional.len() == 2 {
                    return Err(format!("unexpected argument: {arg}"));
                }
                positional.push(arg);
            }
        }
        i += 1;
    }

    let ip = positional.first().ok_or("missing required argument: <ip>")?;
    let port = positional.get(1).ok_or("missing required argument: <port>")?;
    let port = port
        .parse()
        .map_err(|_| format!("invalid port: {port}"))?;

    Ok(Args {
        ip: ip.to_string(),
        port,
        workers,
    })
}

fn run(args: &Args) -> anyhow::Result<()> {
    init_tracing();

    let listener = bind_listener(&args.ip, args.port)
        .with_context(|| format!("failed to listen on {}:{}", args.ip, args.port))?;

    let mut config = PoolConfig::from_env(listener.as_raw_fd())?;
    if let Some(workers) = args.workers {
        config = config.with_worker_count(workers);
    }

    let pool = ProcessPool::create(config).context("failed to start worker pool")?;
    if pool.role() == Role::Master {
        tracing::info!(
            addr = %format!("{}:{}", args.ip, args.port),
            workers = pool.worker_count(),
            "Serving"
        );
    }

    pool.run::<CgiConnection>()?;

    // The listener is shared by every process and closes with this one.
    drop(listener);
    Ok(())
}
