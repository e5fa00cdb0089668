//! ffstream CLI
//!
//! Sends a local file through the daemon's ffmpeg and writes the result to
//! stdout or a file.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::io::AsyncWrite;
use tracing::info;

use ffstream_cli::connection::{self, ConnectionConfig};
use ffstream_cli::transcode::{self, join_args};

#[derive(Parser, Debug)]
#[command(name = "ffstream")]
#[command(version, about = "Stream a file through a remote ffmpeg", long_about = None)]
struct Cli {
    /// File to send as ffmpeg's stdin
    input: PathBuf,

    /// ffmpeg arguments, e.g. `-i - -f mp3 -`
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    ffmpeg_args: Vec<String>,

    /// Daemon address (defaults to http://localhost:$GRPC_PORT)
    #[arg(long)]
    addr: Option<String>,

    /// Daemon port used when --addr is not given
    #[arg(long, default_value_t = 50051, env = "GRPC_PORT")]
    port: u16,

    /// Write output here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Give up after this many seconds
    #[arg(long, default_value_t = 120)]
    timeout: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env is fine; values may come from the real environment.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    ffstream_core::tracing_init::init_tracing("ffstream_cli=warn", false);

    let config = cli.addr.clone().map_or_else(
        || ConnectionConfig::localhost(cli.port),
        |addr| ConnectionConfig {
            addr,
            ..ConnectionConfig::default()
        },
    );

    let input = tokio::fs::File::open(&cli.input)
        .await
        .with_context(|| format!("opening {}", cli.input.display()))?;
    let mut output: Box<dyn AsyncWrite + Unpin + Send> = match &cli.output {
        Some(path) => Box::new(
            tokio::fs::File::create(path)
                .await
                .with_context(|| format!("creating {}", path.display()))?,
        ),
        None => Box::new(tokio::io::stdout()),
    };

    let args = join_args(&cli.ffmpeg_args);
    let session = async {
        let mut client = connection::connect(&config).await?;
        anyhow::Ok(transcode::run(&mut client, args, input, &mut output).await?)
    };

    let outcome = tokio::time::timeout(Duration::from_secs(cli.timeout), session)
        .await
        .with_context(|| format!("timed out after {}s", cli.timeout))??;

    info!(
        bytes_sent = outcome.bytes_sent,
        bytes_received = outcome.bytes_received,
        "Transcode finished"
    );
    Ok(())
}
