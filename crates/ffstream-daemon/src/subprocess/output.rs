//! Process stdout relay.
//!
//! The [`OutputReader`] owns the stdout pipe of one process. Reading it to the
//! end (or until cancellation) is the only thing that ever closes that pipe,
//! so the reader can never be pulled out from under an in-flight read.

use std::fmt::Display;
use std::future::Future;

use tokio::io::AsyncReadExt;
use tokio::process::ChildStdout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How a relay run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayOutcome {
    /// stdout reached end-of-stream.
    EndOfStream,
    /// The cancellation token fired.
    Cancelled,
    /// The chunk sink rejected a chunk.
    SinkFailed(String),
    /// Reading stdout failed.
    ReadFailed(String),
}

/// Result of [`OutputReader::relay`].
#[derive(Debug, Clone)]
pub struct RelayReport {
    pub outcome: RelayOutcome,
    /// Bytes accepted by the sink.
    pub bytes: u64,
    /// Chunks accepted by the sink.
    pub chunks: u64,
}

/// Exclusive reader over a process's stdout.
#[derive(Debug)]
pub struct OutputReader {
    stdout: ChildStdout,
    chunk_size: usize,
    pid: Option<u32>,
}

impl OutputReader {
    pub(crate) fn new(stdout: ChildStdout, chunk_size: usize, pid: Option<u32>) -> Self {
        Self {
            stdout,
            chunk_size: chunk_size.max(1),
            pid,
        }
    }

    /// Read stdout in bounded chunks and hand every non-empty read to
    /// `on_chunk`, in order.
    ///
    /// Stops at end-of-stream, on cancellation, when `on_chunk` fails or when
    /// a read fails. The pipe is closed when this returns.
    pub async fn relay<F, Fut, E>(mut self, cancel: &CancellationToken, mut on_chunk: F) -> RelayReport
    where
        F: FnMut(Vec<u8>) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: Display,
    {
        let pid = self.pid;
        let mut buf = vec![0u8; self.chunk_size];
        let mut bytes = 0u64;
        let mut chunks = 0u64;

        let outcome = loop {
            let read = tokio::select! {
                biased;
                () = cancel.cancelled() => break RelayOutcome::Cancelled,
                read = self.stdout.read(&mut buf) => read,
            };

            let n = match read {
                Ok(0) => break RelayOutcome::EndOfStream,
                Ok(n) => n,
                Err(e) => {
                    warn!(pid, error = %e, "Error reading subprocess stdout");
                    break RelayOutcome::ReadFailed(e.to_string());
                }
            };

            let sent = tokio::select! {
                biased;
                () = cancel.cancelled() => break RelayOutcome::Cancelled,
                sent = on_chunk(buf[..n].to_vec()) => sent,
            };
            if let Err(e) = sent {
                warn!(pid, error = %e, "Output sink rejected chunk");
                break RelayOutcome::SinkFailed(e.to_string());
            }

            bytes += n as u64;
            chunks += 1;
        };

        debug!(pid, ?outcome, bytes, chunks, "stdout relay finished");
        RelayReport {
            outcome,
            bytes,
            chunks,
        }
    }
}
