//! ffstream Daemon Library
//!
//! Core functionality for the ffstream daemon:
//! - Subprocess management for ffmpeg processes
//! - Stream ↔ process bridging with per-session cancellation
//! - gRPC server exposing `TranscodeService`

pub mod bridge;
pub mod server;
pub mod subprocess;
