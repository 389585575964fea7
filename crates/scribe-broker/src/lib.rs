//! Job-queue broker layer.
//!
//! Speaks the gearman binary wire protocol: [`client::BrokerClient`] submits
//! named jobs and waits for the correlated reply, [`worker::WorkerRuntime`]
//! drains queues on the worker host and runs registered handlers. The text
//! administrative dialogue (`status`) used for worker-count discovery is in
//! [`admin`].

pub mod admin;
pub mod client;
pub mod codec;
#[cfg(any(test, feature = "stub"))]
pub mod stub;
pub mod worker;

pub use client::BrokerClient;
pub use worker::{Job, JobHandler, WorkerRuntime};

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker connection: {0}")]
    Connect(#[from] std::io::Error),
    #[error("broker protocol: {0}")]
    Protocol(String),
    #[error("job failed")]
    JobFailed,
    #[error("no reply within the deadline")]
    Timeout,
}

/// A handler failure. The runtime answers with WORK_FAIL; expected error
/// outcomes (download/decoding failures) are framed replies and therefore
/// regular completions, not this.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        HandlerError(message.into())
    }
}
