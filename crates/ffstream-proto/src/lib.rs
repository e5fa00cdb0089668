//! ffstream Protocol Buffers
//!
//! Generated protobuf code for the ffstream gRPC API.
//!
//! This crate contains:
//! - `TranscodeService` for streaming bytes through an ffmpeg process

#![allow(clippy::derive_partial_eq_without_eq)]

/// ffstream v1 API definitions.
pub mod v1 {
    tonic::include_proto!("ffstream.v1");
}

// Re-export v1 as the default API version for convenience
pub use v1::*;
