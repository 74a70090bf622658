//! Tracing initialization.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Initialize tracing with `PREFORK_LOG` and `LOG_FORMAT` support.
///
/// `RUST_LOG` wins when set. Otherwise `PREFORK_LOG` picks the level for the
/// pool and server crates (default info). `LOG_FORMAT=json` switches to JSON
/// lines. Output always goes to stderr; stdout belongs to spawned programs.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = level_from(std::env::var("PREFORK_LOG").ok().as_deref());
        EnvFilter::new(format!("prefork={level},prefork_cgi={level}"))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

fn level_from(value: Option<&str>) -> &'static str {
    match value {
        Some("trace") => "trace",
        Some("debug") => "debug",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    }
}
