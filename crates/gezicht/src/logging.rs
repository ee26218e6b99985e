//! Tracing setup for binaries embedding the pool.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Map a `GEZICHT_LOG` value to a level, defaulting to `info`.
fn base_level(value: Option<&str>) -> &'static str {
    match value {
        Some("debug") => "debug",
        Some("trace") => "trace",
        Some("warn") | Some("warning") => "warn",
        Some("error") => "error",
        _ => "info",
    }
}

fn filter_directive(level: &str) -> String {
    format!("gezicht={level},gezicht::bridge::codec=warn")
}

/// Initialize tracing with GEZICHT_LOG and LOG_FORMAT support.
///
/// `RUST_LOG` takes precedence over `GEZICHT_LOG`. Output goes to stderr.
/// Does nothing if a global subscriber is already installed.
pub fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = base_level(std::env::var("GEZICHT_LOG").ok().as_deref());
        EnvFilter::new(filter_directive(level))
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
