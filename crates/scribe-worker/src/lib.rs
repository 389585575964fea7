//! Worker daemon: drains the broker queues, runs the typed job handlers
//! against the decoding engine, keeps per-call realtime channels, and serves
//! the telemetry control plane.

pub mod control;
pub mod engine;
pub mod handlers;
pub mod postproc;
pub mod realtime;
pub mod stt;
