//! Shared building blocks for the `scribe` STT fabric: configuration,
//! error kinds, URI classification, audio format detection, the cell-stream
//! wire format, the multi-protocol fetcher and `/proc` telemetry readers.

pub mod audio;
pub mod cells;
pub mod config;
pub mod error;
pub mod fetch;
pub mod sysinfo;
pub mod uri;
