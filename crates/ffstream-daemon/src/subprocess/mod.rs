//! Subprocess management for ffmpeg processes.

pub mod output;
pub mod runner;

pub use output::{OutputReader, RelayOutcome, RelayReport};
pub use runner::{
    DEFAULT_OUTPUT_CHUNK_SIZE, ExitReason, ExitResult, ProcessRunner, RunnerConfig, RunnerState,
    SubprocessError,
};
