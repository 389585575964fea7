//! Submit side of the broker.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use crate::BrokerError;
use crate::codec::{Packet, PacketCodec, PacketType};

const TRANSIENT_BACKOFF: Duration = Duration::from_secs(10);

type Conn = Framed<TcpStream, PacketCodec>;

/// Client handle for one broker endpoint.
///
/// Connections are pooled per client; a submit checks one out for its full
/// request/reply exchange, so concurrent submits never interleave on a
/// single socket and no process-wide lock is needed.
pub struct BrokerClient {
    host: String,
    port: u16,
    pool: Mutex<Vec<Conn>>,
    unique: AtomicU64,
}

impl BrokerClient {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        BrokerClient {
            host: host.into(),
            port,
            pool: Mutex::new(Vec::new()),
            unique: AtomicU64::new(1),
        }
    }

    async fn checkout(&self) -> Result<Conn, BrokerError> {
        if let Some(conn) = self.pool.lock().expect("pool lock").pop() {
            return Ok(conn);
        }
        let stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(BrokerError::Connect)?;
        Ok(Framed::new(stream, PacketCodec))
    }

    fn checkin(&self, conn: Conn) {
        self.pool.lock().expect("pool lock").push(conn);
    }

    /// Submit a job and wait for its correlated reply.
    ///
    /// Transient transport failures back off ten seconds and retry
    /// indefinitely; a WORK_FAIL reply and a missed deadline are permanent.
    pub async fn submit(
        &self,
        queue: &str,
        payload: &[u8],
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>, BrokerError> {
        loop {
            match self.submit_once(queue, payload, timeout).await {
                Ok(reply) => return Ok(reply),
                Err(BrokerError::JobFailed) => return Err(BrokerError::JobFailed),
                Err(BrokerError::Timeout) => return Err(BrokerError::Timeout),
                Err(err) => {
                    tracing::warn!(%queue, %err, "broker submit failed, retrying in 10s");
                    tokio::time::sleep(TRANSIENT_BACKOFF).await;
                }
            }
        }
    }

    async fn submit_once(
        &self,
        queue: &str,
        payload: &[u8],
        timeout: Option<Duration>,
    ) -> Result<Vec<u8>, BrokerError> {
        let mut conn = self.checkout().await?;
        let unique = format!("u{}", self.unique.fetch_add(1, Ordering::Relaxed));

        conn.send(Packet::request(
            PacketType::SubmitJob,
            Packet::body_from_args(&[queue.as_bytes(), unique.as_bytes(), payload]),
        ))
        .await?;

        let created = next_packet(&mut conn).await?;
        if created.kind != PacketType::JobCreated {
            return Err(BrokerError::Protocol(format!(
                "expected JOB_CREATED, got {:?}",
                created.kind
            )));
        }
        let handle = created.args(1)?[0].to_vec();

        let reply = match timeout {
            Some(limit) => tokio::time::timeout(limit, wait_for_reply(&mut conn, &handle))
                .await
                .map_err(|_| BrokerError::Timeout)??,
            None => wait_for_reply(&mut conn, &handle).await?,
        };

        self.checkin(conn);
        reply.ok_or(BrokerError::JobFailed)
    }
}

async fn next_packet(conn: &mut Conn) -> Result<Packet, BrokerError> {
    conn.next()
        .await
        .ok_or_else(|| BrokerError::Protocol("broker closed the connection".into()))?
}

async fn wait_for_reply(conn: &mut Conn, handle: &[u8]) -> Result<Option<Vec<u8>>, BrokerError> {
    loop {
        let packet = next_packet(conn).await?;
        match packet.kind {
            PacketType::WorkComplete => {
                let args = packet.args(2)?;
                if args[0] == handle {
                    return Ok(Some(args[1].to_vec()));
                }
            }
            PacketType::WorkFail => {
                if packet.args(1)?[0] == handle {
                    return Ok(None);
                }
            }
            // Replies for other submissions on a recycled connection have no
            // waiter left; drop them.
            other => {
                tracing::debug!(kind = ?other, "ignoring uncorrelated broker packet");
            }
        }
    }
}
