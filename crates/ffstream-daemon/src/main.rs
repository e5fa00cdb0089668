//! `ffstream` Daemon
//!
//! Serves the `TranscodeService` gRPC API: each bidirectional stream is
//! bridged to its own ffmpeg subprocess.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use ffstream_daemon::bridge::BridgeConfig;
use ffstream_daemon::server::{GrpcServer, ServerConfig};
use ffstream_daemon::subprocess::{DEFAULT_OUTPUT_CHUNK_SIZE, RunnerConfig};

#[derive(Parser, Debug)]
#[command(name = "ffstream-daemon")]
#[command(version, about = "ffstream daemon - streams bytes through ffmpeg over gRPC")]
struct Args {
    /// Interface to bind
    #[arg(long, default_value = "0.0.0.0", env = "FFSTREAM_BIND")]
    bind: IpAddr,

    /// gRPC port
    #[arg(long, default_value_t = 50051, env = "GRPC_PORT")]
    port: u16,

    /// Path to the `ffmpeg` binary
    #[arg(long, default_value = "ffmpeg", env = "FFSTREAM_FFMPEG_BIN")]
    ffmpeg_bin: PathBuf,

    /// Seconds to wait for a cancelled ffmpeg to exit after SIGINT before SIGKILL.
    #[arg(long, default_value_t = 5, env = "FFSTREAM_TERMINATE_TIMEOUT")]
    terminate_timeout: u64,

    /// Upper bound on a whole session in seconds (unbounded when unset).
    #[arg(long, env = "FFSTREAM_SESSION_TIMEOUT")]
    session_timeout: Option<u64>,

    /// Maximum concurrent transcode sessions
    #[arg(long, default_value_t = 16, env = "FFSTREAM_MAX_SESSIONS")]
    max_sessions: usize,

    /// Size of a single ffmpeg stdout read, in bytes
    #[arg(long, default_value_t = DEFAULT_OUTPUT_CHUNK_SIZE, env = "FFSTREAM_OUTPUT_CHUNK_SIZE")]
    output_chunk_size: usize,

    /// Log level filter for the daemon (e.g. "info", "debug", "warn").
    #[arg(long, default_value = "info", env = "FFSTREAM_LOG_LEVEL")]
    log_level: String,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "FFSTREAM_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env is fine; values may come from the real environment.
    let dotenv = dotenvy::dotenv();
    let args = Args::parse();

    let log_filter = format!("ffstream_daemon={}", args.log_level);
    ffstream_core::tracing_init::init_tracing(&log_filter, args.log_json);

    if let Ok(path) = &dotenv {
        info!(path = %path.display(), "Loaded environment file");
    }

    let addr = SocketAddr::new(args.bind, args.port);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        %addr,
        ffmpeg = %args.ffmpeg_bin.display(),
        max_sessions = args.max_sessions,
        "Starting ffstream-daemon"
    );
    if args.max_sessions == 0 {
        warn!("max_sessions is 0; every stream will be rejected");
    }

    let runner = RunnerConfig::new(args.ffmpeg_bin)
        .with_terminate_timeout(Duration::from_secs(args.terminate_timeout))
        .with_output_chunk_size(args.output_chunk_size);
    let bridge = BridgeConfig::new(runner)
        .with_session_timeout(args.session_timeout.map(Duration::from_secs));
    let config = ServerConfig::tcp(addr).with_max_sessions(args.max_sessions);

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    let shutdown = async move {
        #[cfg(unix)]
        let sigterm_future = sigterm.recv();
        #[cfg(not(unix))]
        let sigterm_future = std::future::pending::<Option<()>>();

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C shutdown signal");
            }
            _ = sigterm_future => {
                info!("Received SIGTERM shutdown signal");
            }
        }
    };

    GrpcServer::new(config, bridge).serve_tcp(shutdown).await?;

    info!("Daemon stopped");
    Ok(())
}
