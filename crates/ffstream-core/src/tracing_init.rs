//! Shared tracing/logging initialization.
//!
//! Log output goes to stderr in every binary. The `ffstream` client writes
//! transcoded bytes to stdout, so a log line there would corrupt the media
//! it produces. The daemon uses the same sink so both binaries behave alike
//! under a process supervisor.

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// `RUST_LOG` if it is set and parses, otherwise `default_filter`
/// (e.g. `"ffstream_daemon=info"`).
fn env_filter(default_filter: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter))
}

/// Initialise the global tracing subscriber.
///
/// `log_json` switches to one JSON object per line for log aggregation.
pub fn init_tracing(default_filter: &str, log_json: bool) {
    let json = log_json.then(|| fmt::layer().json().with_writer(std::io::stderr));
    let text = (!log_json).then(|| fmt::layer().with_writer(std::io::stderr));

    tracing_subscriber::registry()
        .with(env_filter(default_filter))
        .with(json)
        .with(text)
        .init();
}
