//! Worker side of the broker: a fixed pool of handler tasks per queue name.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::codec::Framed;

use crate::codec::{Packet, PacketCodec, PacketType};
use crate::{BrokerError, HandlerError};

const RECONNECT_BACKOFF: Duration = Duration::from_secs(10);
/// How long a sleeping worker waits for a NOOP before re-grabbing anyway.
const SLEEP_RECHECK: Duration = Duration::from_secs(10);

type Conn = Framed<TcpStream, PacketCodec>;

/// One assigned job.
#[derive(Debug, Clone)]
pub struct Job {
    pub handle: String,
    pub queue: String,
    pub payload: Vec<u8>,
}

pub trait JobHandler: Send + Sync + 'static {
    fn call(&self, job: Job) -> Pin<Box<dyn Future<Output = Result<Vec<u8>, HandlerError>> + Send>>;
}

impl<F, Fut> JobHandler for F
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<u8>, HandlerError>> + Send + 'static,
{
    fn call(&self, job: Job) -> Pin<Box<dyn Future<Output = Result<Vec<u8>, HandlerError>> + Send>> {
        Box::pin(self(job))
    }
}

/// Owns the handler task pool on a worker host.
pub struct WorkerRuntime {
    host: String,
    port: u16,
    stop_tx: watch::Sender<bool>,
    tasks: JoinSet<()>,
}

impl WorkerRuntime {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let (stop_tx, _) = watch::channel(false);
        WorkerRuntime {
            host: host.into(),
            port,
            stop_tx,
            tasks: JoinSet::new(),
        }
    }

    /// Register `concurrency` looping handler tasks against a queue.
    pub fn register_handler(
        &mut self,
        queue: &str,
        concurrency: usize,
        handler: Arc<dyn JobHandler>,
    ) {
        tracing::info!(queue, concurrency, "initialize handler pool");
        for _ in 0..concurrency.max(1) {
            let host = self.host.clone();
            let port = self.port;
            let queue = queue.to_string();
            let handler = handler.clone();
            let stop_rx = self.stop_tx.subscribe();
            self.tasks.spawn(async move {
                worker_loop(host, port, queue, handler, stop_rx).await;
            });
        }
    }

    /// Stop accepting new jobs; running handlers finish naturally.
    pub fn shutdown(&self) {
        let _ = self.stop_tx.send(true);
    }

    pub async fn join(mut self) {
        while let Some(res) = self.tasks.join_next().await {
            if let Err(err) = res {
                tracing::error!(%err, "worker task panicked");
            }
        }
    }
}

async fn worker_loop(
    host: String,
    port: u16,
    queue: String,
    handler: Arc<dyn JobHandler>,
    mut stop_rx: watch::Receiver<bool>,
) {
    while !*stop_rx.borrow() {
        let conn = match TcpStream::connect((host.as_str(), port)).await {
            Ok(stream) => Framed::new(stream, PacketCodec),
            Err(err) => {
                tracing::error!(%queue, %err, "broker connect failed, retrying in 10s");
                if backoff_or_stop(&mut stop_rx).await {
                    break;
                }
                continue;
            }
        };

        match drain_queue(conn, &queue, &handler, &mut stop_rx).await {
            Ok(()) => break, // stop requested
            Err(err) => {
                tracing::error!(%queue, %err, "worker connection error, retrying in 10s");
                if backoff_or_stop(&mut stop_rx).await {
                    break;
                }
            }
        }
    }
}

/// Sleep out the reconnect back-off. Returns true when stop was requested.
async fn backoff_or_stop(stop_rx: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(RECONNECT_BACKOFF) => *stop_rx.borrow(),
        _ = stop_rx.changed() => true,
    }
}

async fn next_packet(conn: &mut Conn) -> Result<Packet, BrokerError> {
    conn.next()
        .await
        .ok_or_else(|| BrokerError::Protocol("broker closed the connection".into()))?
}

async fn drain_queue(
    mut conn: Conn,
    queue: &str,
    handler: &Arc<dyn JobHandler>,
    stop_rx: &mut watch::Receiver<bool>,
) -> Result<(), BrokerError> {
    conn.send(Packet::request(PacketType::CanDo, queue.as_bytes().to_vec()))
        .await?;

    loop {
        if *stop_rx.borrow() {
            return Ok(());
        }

        conn.send(Packet::request(PacketType::GrabJob, Vec::new()))
            .await?;

        let assigned = next_packet(&mut conn).await?;
        match assigned.kind {
            PacketType::NoJob => {
                conn.send(Packet::request(PacketType::PreSleep, Vec::new()))
                    .await?;

                // Wait for a wakeup, a stop, or just re-check after a while.
                tokio::select! {
                    packet = next_packet(&mut conn) => {
                        let packet = packet?;
                        if packet.kind != PacketType::Noop {
                            tracing::debug!(kind = ?packet.kind, "unexpected packet while sleeping");
                        }
                    }
                    _ = stop_rx.changed() => return Ok(()),
                    _ = tokio::time::sleep(SLEEP_RECHECK) => {}
                }
            }
            PacketType::JobAssign => {
                let job = {
                    let args = assigned.args(3)?;
                    Job {
                        handle: String::from_utf8_lossy(args[0]).into_owned(),
                        queue: String::from_utf8_lossy(args[1]).into_owned(),
                        payload: args[2].to_vec(),
                    }
                };
                let handle = job.handle.clone();
                tracing::debug!(queue, %handle, bytes = job.payload.len(), "job assigned");

                let reply = match handler.call(job).await {
                    Ok(body) => Packet::request(
                        PacketType::WorkComplete,
                        Packet::body_from_args(&[handle.as_bytes(), &body]),
                    ),
                    Err(HandlerError(message)) => {
                        tracing::error!(queue, %handle, %message, "handler failed");
                        Packet::request(PacketType::WorkFail, handle.as_bytes().to_vec())
                    }
                };
                conn.send(reply).await?;
            }
            other => {
                return Err(BrokerError::Protocol(format!(
                    "expected JOB_ASSIGN or NO_JOB, got {other:?}"
                )));
            }
        }
    }
}
