//! One transcode session from the client side.
//!
//! The request stream is fed by an uploader task: the argument message
//! first, then the input in fixed-size chunks, then `eof`. Responses are
//! written to any `AsyncWrite` until `done` arrives.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};
use tonic::Status;
use tonic::transport::Channel;
use tracing::{debug, info, warn};

use ffstream_proto::v1::transcode_service_client::TranscodeServiceClient;
use ffstream_proto::v1::{ProcessRequest, ProcessResponse};

/// Input chunk size used when uploading.
pub const INPUT_CHUNK_SIZE: usize = 32 * 1024;

/// Requests buffered ahead of the gRPC stream.
const UPLOAD_BUFFER: usize = 16;

/// How long a finished session waits for the uploader to report.
const UPLOAD_GRACE: Duration = Duration::from_secs(1);

/// Byte counts for a finished session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TranscodeOutcome {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub chunks_received: u64,
}

/// Join ffmpeg arguments into the single string the daemon tokenizes.
///
/// Arguments containing spaces are wrapped in single quotes.
pub fn join_args<S: AsRef<str>>(args: &[S]) -> String {
    args.iter()
        .map(AsRef::as_ref)
        .filter(|arg| !arg.is_empty())
        .map(|arg| {
            if arg.contains(' ') {
                format!("'{arg}'")
            } else {
                arg.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Spawn the uploader and return the request stream it feeds.
///
/// The task resolves to the number of input bytes sent. A read error ends
/// the stream without `eof`.
pub fn spawn_upload<R>(
    args: String,
    mut input: R,
    chunk_size: usize,
) -> (
    impl Stream<Item = ProcessRequest> + Send + 'static,
    JoinHandle<Result<u64, TranscodeError>>,
)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(UPLOAD_BUFFER);
    let handle = tokio::spawn(async move {
        send(
            &tx,
            ProcessRequest {
                args,
                ..Default::default()
            },
        )
        .await?;

        let mut sent = 0u64;
        let mut buf = vec![0u8; chunk_size.max(1)];
        loop {
            let n = input.read(&mut buf).await.map_err(TranscodeError::Input)?;
            if n == 0 {
                break;
            }
            send(
                &tx,
                ProcessRequest {
                    chunk: buf[..n].to_vec(),
                    ..Default::default()
                },
            )
            .await?;
            sent += n as u64;
        }

        send(
            &tx,
            ProcessRequest {
                eof: true,
                ..Default::default()
            },
        )
        .await?;
        debug!(bytes = sent, "Upload finished");
        Ok(sent)
    });
    (ReceiverStream::new(rx), handle)
}

async fn send(
    tx: &mpsc::Sender<ProcessRequest>,
    request: ProcessRequest,
) -> Result<(), TranscodeError> {
    tx.send(request)
        .await
        .map_err(|_| TranscodeError::StreamClosed)
}

/// Write response chunks to `output` until `done`.
///
/// Anything after `done` is ignored. A stream that ends without `done` is
/// an error.
pub async fn write_output<S, W>(
    mut responses: S,
    output: &mut W,
) -> Result<TranscodeOutcome, TranscodeError>
where
    S: Stream<Item = Result<ProcessResponse, Status>> + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut outcome = TranscodeOutcome::default();
    while let Some(response) = responses.next().await {
        let response = response.map_err(TranscodeError::Rpc)?;
        if !response.chunk.is_empty() {
            output
                .write_all(&response.chunk)
                .await
                .map_err(TranscodeError::Output)?;
            outcome.bytes_received += response.chunk.len() as u64;
            outcome.chunks_received += 1;
        }
        if response.done {
            output.flush().await.map_err(TranscodeError::Output)?;
            return Ok(outcome);
        }
    }
    Err(TranscodeError::Incomplete)
}

/// Run a whole session: upload `input`, write the result to `output`.
pub async fn run<R, W>(
    client: &mut TranscodeServiceClient<Channel>,
    args: String,
    input: R,
    output: &mut W,
) -> Result<TranscodeOutcome, TranscodeError>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin,
{
    info!(args = %args, "Starting transcode");
    let (requests, mut upload) = spawn_upload(args, input, INPUT_CHUNK_SIZE);

    let result = async {
        let responses = client
            .process_stream(requests)
            .await
            .map_err(TranscodeError::Rpc)?
            .into_inner();
        write_output(responses, output).await
    }
    .await;

    // The server may finish before the upload does (e.g. a failed spawn).
    let uploaded = match &result {
        Ok(_) => match tokio::time::timeout(UPLOAD_GRACE, &mut upload).await {
            Ok(joined) => joined,
            Err(_) => {
                upload.abort();
                (&mut upload).await
            }
        },
        Err(_) => {
            upload.abort();
            upload.await
        }
    };
    let mut outcome = result?;
    match uploaded {
        Ok(Ok(sent)) => outcome.bytes_sent = sent,
        Ok(Err(TranscodeError::Input(e))) => return Err(TranscodeError::Input(e)),
        Ok(Err(e)) => warn!(error = %e, "Upload did not finish"),
        Err(e) => warn!(error = %e, "Upload task failed"),
    }
    Ok(outcome)
}

/// Transcode errors.
#[derive(Debug, thiserror::Error)]
pub enum TranscodeError {
    #[error("Server error: {}: {}", .0.code(), .0.message())]
    Rpc(Status),

    #[error("Failed to read input: {0}")]
    Input(std::io::Error),

    #[error("Failed to write output: {0}")]
    Output(std::io::Error),

    #[error("Request stream closed unexpectedly")]
    StreamClosed,

    #[error("Stream ended before the server reported completion")]
    Incomplete,
}

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io::Write;

    fn response(chunk: &[u8], done: bool) -> Result<ProcessResponse, Status> {
        Ok(ProcessResponse {
            chunk: chunk.to_vec(),
            done,
        })
    }

    #[test]
    fn join_args_quotes_spaces() {
        let args = ["-i", "-", "-metadata", "title=My Song", "-f", "mp3", "-"];
        assert_eq!(
            join_args(&args),
            "-i - -metadata 'title=My Song' -f mp3 -"
        );
    }

    #[test]
    fn join_args_round_trips_through_tokenizer() {
        let args = ["-vf", "scale=640:-1", "-metadata", "comment=a b  c", "out"];
        assert_eq!(ffstream_core::tokenize(&join_args(&args)), args);
    }

    #[test]
    fn join_args_empty() {
        assert_eq!(join_args::<&str>(&[]), "");
        assert_eq!(join_args(&["", "-y"]), "-y");
    }

    #[tokio::test]
    async fn upload_sends_args_chunks_then_eof() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..10u8).cycle().take(10_000).collect();
        file.write_all(&data).unwrap();
        let input = tokio::fs::File::open(file.path()).await.unwrap();

        let (stream, handle) = spawn_upload("-f mp3".into(), input, 4096);
        let requests: Vec<ProcessRequest> = stream.collect().await;
        assert_eq!(handle.await.unwrap().unwrap(), 10_000);

        assert_eq!(requests.first().unwrap().args, "-f mp3");
        assert!(requests.first().unwrap().chunk.is_empty());
        assert!(requests.last().unwrap().eof);
        assert!(requests.last().unwrap().chunk.is_empty());

        let body: Vec<u8> = requests[1..requests.len() - 1]
            .iter()
            .flat_map(|r| r.chunk.iter().copied())
            .collect();
        assert_eq!(body, data);
        assert!(requests[1..requests.len() - 1]
            .iter()
            .all(|r| r.chunk.len() <= 4096 && !r.eof));
    }

    #[tokio::test]
    async fn upload_of_empty_input_is_args_and_eof() {
        let (stream, handle) = spawn_upload(String::new(), tokio::io::empty(), INPUT_CHUNK_SIZE);
        let requests: Vec<ProcessRequest> = stream.collect().await;
        assert_eq!(handle.await.unwrap().unwrap(), 0);
        assert_eq!(requests.len(), 2);
        assert!(requests[1].eof);
    }

    #[tokio::test]
    async fn output_stops_at_done() {
        let responses = tokio_stream::iter(vec![
            response(b"abc", false),
            response(b"def", false),
            response(b"", true),
            response(b"late", false),
        ]);
        let mut out = Vec::new();
        let outcome = write_output(responses, &mut out).await.unwrap();
        assert_eq!(out, b"abcdef");
        assert_eq!(outcome.bytes_received, 6);
        assert_eq!(outcome.chunks_received, 2);
    }

    #[tokio::test]
    async fn output_without_done_is_incomplete() {
        let responses = tokio_stream::iter(vec![response(b"abc", false)]);
        let mut out = Vec::new();
        let err = write_output(responses, &mut out).await.unwrap_err();
        assert!(matches!(err, TranscodeError::Incomplete));
        assert_eq!(out, b"abc");
    }

    #[tokio::test]
    async fn server_status_is_surfaced() {
        let responses = tokio_stream::iter(vec![
            response(b"abc", false),
            Err(Status::failed_precondition("no ffmpeg")),
        ]);
        let mut out = Vec::new();
        let err = write_output(responses, &mut out).await.unwrap_err();
        match err {
            TranscodeError::Rpc(status) => {
                assert_eq!(status.code(), tonic::Code::FailedPrecondition);
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
