//! `ffstream` Core Library
//!
//! Shared functionality for `ffstream` components:
//! - Command-line argument tokenizing for the transcode protocol
//! - Tracing subscriber initialization for the daemon and CLI

pub mod args;
pub mod tracing_init;

pub use args::tokenize;
