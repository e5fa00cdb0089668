//! ffstream CLI Library
//!
//! Client side of the `TranscodeService`: uploads a file, collects the
//! transcoded bytes.

pub mod connection;
pub mod transcode;
