//! In-process broker used by integration tests.
//!
//! Implements just enough of the broker's contract for a client and a worker
//! runtime to meet in the middle: job submission and correlation, worker
//! capability registration, sleep/wakeup, and the text `status` dialogue.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

use crate::codec::{Packet, PacketCodec, PacketType};

#[derive(Debug)]
struct PendingJob {
    handle: String,
    payload: Vec<u8>,
    client: u64,
}

#[derive(Default)]
struct State {
    conns: HashMap<u64, mpsc::UnboundedSender<Packet>>,
    capabilities: HashMap<u64, HashSet<String>>,
    sleeping: HashSet<u64>,
    pending: HashMap<String, VecDeque<PendingJob>>,
    assignments: HashMap<String, (u64, String)>,
    next_conn: u64,
    next_handle: u64,
}

impl State {
    fn wake_workers(&mut self, queue: &str) {
        let sleepers: Vec<u64> = self
            .sleeping
            .iter()
            .copied()
            .filter(|id| {
                self.capabilities
                    .get(id)
                    .is_some_and(|caps| caps.contains(queue))
            })
            .collect();
        for id in sleepers {
            self.sleeping.remove(&id);
            if let Some(tx) = self.conns.get(&id) {
                let _ = tx.send(Packet::response(PacketType::Noop, Vec::new()));
            }
        }
    }

    fn status_lines(&self) -> String {
        let mut functions: HashSet<&String> = self.pending.keys().collect();
        for caps in self.capabilities.values() {
            functions.extend(caps.iter());
        }

        let mut out = String::new();
        for function in functions {
            let queued = self.pending.get(function).map_or(0, VecDeque::len);
            let running = self
                .assignments
                .values()
                .filter(|(_, q)| q == function)
                .count();
            let workers = self
                .capabilities
                .values()
                .filter(|caps| caps.contains(function))
                .count();
            out.push_str(&format!("{function}\t{queued}\t{running}\t{workers}\n"));
        }
        out.push_str(".\n");
        out
    }
}

pub struct StubBroker {
    addr: SocketAddr,
    accept_task: tokio::task::JoinHandle<()>,
}

impl StubBroker {
    pub async fn spawn() -> std::io::Result<StubBroker> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(Mutex::new(State::default()));

        let accept_task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let state = state.clone();
                tokio::spawn(async move {
                    let _ = serve_conn(stream, state).await;
                });
            }
        });

        Ok(StubBroker { addr, accept_task })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}

impl Drop for StubBroker {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn serve_conn(stream: TcpStream, state: Arc<Mutex<State>>) -> std::io::Result<()> {
    // Both the binary protocol and the text admin dialogue share the port;
    // the first byte tells them apart (binary magic starts with NUL).
    let mut probe = [0u8; 1];
    if stream.peek(&mut probe).await? == 0 {
        return Ok(());
    }

    if probe[0] != 0 {
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader.read_line(&mut line).await?;
        if line.trim() == "status" {
            let body = state.lock().expect("state lock").status_lines();
            reader.get_mut().write_all(body.as_bytes()).await?;
        }
        return Ok(());
    }

    let (mut sink, mut packets) = Framed::new(stream, PacketCodec).split();

    let (tx, mut rx) = mpsc::unbounded_channel::<Packet>();
    let conn_id = {
        let mut st = state.lock().expect("state lock");
        st.next_conn += 1;
        let id = st.next_conn;
        st.conns.insert(id, tx);
        id
    };

    let writer = tokio::spawn(async move {
        while let Some(packet) = rx.recv().await {
            if sink.send(packet).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(packet)) = packets.next().await {
        handle_packet(conn_id, packet, &state);
    }

    let mut st = state.lock().expect("state lock");
    st.conns.remove(&conn_id);
    st.capabilities.remove(&conn_id);
    st.sleeping.remove(&conn_id);
    drop(st);
    writer.abort();
    Ok(())
}

fn handle_packet(conn_id: u64, packet: Packet, state: &Arc<Mutex<State>>) {
    let mut st = state.lock().expect("state lock");
    let reply_to = |st: &State, id: u64, packet: Packet| {
        if let Some(tx) = st.conns.get(&id) {
            let _ = tx.send(packet);
        }
    };

    match packet.kind {
        PacketType::CanDo => {
            let queue = String::from_utf8_lossy(&packet.body).into_owned();
            st.capabilities.entry(conn_id).or_default().insert(queue);
        }
        PacketType::SubmitJob => {
            let Ok(args) = packet.args(3) else { return };
            let queue = String::from_utf8_lossy(args[0]).into_owned();
            let payload = args[2].to_vec();
            st.next_handle += 1;
            let handle = format!("H:stub:{}", st.next_handle);

            reply_to(
                &st,
                conn_id,
                Packet::response(PacketType::JobCreated, handle.as_bytes().to_vec()),
            );
            st.pending.entry(queue.clone()).or_default().push_back(PendingJob {
                handle,
                payload,
                client: conn_id,
            });
            st.wake_workers(&queue);
        }
        PacketType::GrabJob => {
            let queues: Vec<String> = st
                .capabilities
                .get(&conn_id)
                .map(|caps| caps.iter().cloned().collect())
                .unwrap_or_default();
            for queue in queues {
                let Some(job) = st.pending.get_mut(&queue).and_then(VecDeque::pop_front) else {
                    continue;
                };
                st.assignments
                    .insert(job.handle.clone(), (job.client, queue.clone()));
                let body = Packet::body_from_args(&[
                    job.handle.as_bytes(),
                    queue.as_bytes(),
                    &job.payload,
                ]);
                reply_to(&st, conn_id, Packet::response(PacketType::JobAssign, body));
                return;
            }
            reply_to(&st, conn_id, Packet::response(PacketType::NoJob, Vec::new()));
        }
        PacketType::PreSleep => {
            let has_work = st
                .capabilities
                .get(&conn_id)
                .is_some_and(|caps| {
                    caps.iter()
                        .any(|q| st.pending.get(q).is_some_and(|v| !v.is_empty()))
                });
            if has_work {
                reply_to(&st, conn_id, Packet::response(PacketType::Noop, Vec::new()));
            } else {
                st.sleeping.insert(conn_id);
            }
        }
        PacketType::WorkComplete | PacketType::WorkFail => {
            let n = if packet.kind == PacketType::WorkComplete { 2 } else { 1 };
            let Ok(args) = packet.args(n) else { return };
            let handle = String::from_utf8_lossy(args[0]).into_owned();
            if let Some((client, _)) = st.assignments.remove(&handle) {
                reply_to(&st, client, Packet::response(packet.kind, packet.body));
            }
        }
        PacketType::EchoReq => {
            reply_to(&st, conn_id, Packet::response(PacketType::EchoRes, packet.body));
        }
        other => {
            tracing::debug!(kind = ?other, "stub broker ignoring packet");
        }
    }
}
