//! The durable store-and-forward client: `NotConnected -> OpeningClient ->
//! Connected -> ClosingClient -> NotConnected`, matching the state machine in
//! `examples/original_source/src/transport_client.c`. Files are handed to
//! [`TransportClient::enqueue`] and never lost: the queue only drops a file
//! once the server has acked it, and every reconnect retransmits whatever is
//! still unacked from the front of the queue.
//!
//! The original multiplexes send and receive with nonblocking sockets and a
//! poll loop inside one thread. Here the same per-connection session
//! alternates between draining the send queue and polling for control lines
//! on a short timeout; ack-driven removal and `CLOSE` handling are identical,
//! just expressed as two async phases instead of byte-level interleaving.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use il_fifo::PermanentFifo;
use snafu::{ResultExt, Snafu};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::file::TransportFile;
use crate::proxy::{self, ProxyConfig};
use crate::wire::{self, FromServer, ProxyState};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const POLL_INTERVAL: Duration = Duration::from_millis(500);
const DEFAULT_RECONNECT_WAIT: Duration = Duration::from_secs(1);
const MAX_RECONNECT_WAIT: Duration = Duration::from_secs(300);
/// After this many consecutive failed attempts against a proxy target, give
/// up on it and fall back to the configured root server (spec §4.3 "Connect").
const MAX_CONSECUTIVE_PROXY_FAILURES: u32 = 3;
/// No-progress cutoff for a single outgoing write (spec §4.3 step 5 / §5
/// "Send watchdog"): a stalled peer must not be able to hang the session.
const SEND_WATCHDOG_TIMEOUT: Duration = Duration::from_secs(30);
/// Throttle for persisting the message FIFO's ack high-water mark while the
/// session is up (spec §4.2, the general "partially acked" case; the
/// "everything acked" fast path is persisted immediately by `PermanentFifo::ack`).
const FLUSH_MIN_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Snafu)]
pub enum ClientError {
    #[snafu(display("could not connect to {name}:{port}: {source}"))]
    Connect { name: String, port: u16, source: std::io::Error },
    #[snafu(display("transport I/O error: {source}"))]
    Io { source: std::io::Error },
    #[snafu(display("server closed the connection"))]
    ServerClosed,
    #[snafu(display("handshake did not complete within {HANDSHAKE_TIMEOUT:?}"))]
    HandshakeTimeout,
    #[snafu(display("bad protocol line from server: {line:?}"))]
    Protocol { line: String },
    #[snafu(display("transmit queue is full"))]
    Full,
    #[snafu(display("no message FIFO configured for this client"))]
    NoMessageFifo,
    #[snafu(display("message FIFO error: {source}"))]
    MessageFifo { source: il_fifo::FifoError },
    #[snafu(display("no progress sending to server for {SEND_WATCHDOG_TIMEOUT:?}"))]
    SendStalled,
}

/// Reconnect backoff: starts at `initial`, doubles on every failed attempt,
/// caps at `MAX_RECONNECT_WAIT`, and resets to `initial` as soon as a session
/// reaches `READY` (spec §4.3/§5 "exponential backoff ... reset after a
/// successful READY").
struct Backoff {
    current_ms: std::sync::atomic::AtomicU64,
    initial_ms: u64,
}

impl Backoff {
    fn new(initial: Duration) -> Self {
        let initial_ms = (initial.as_millis() as u64).max(1);
        Backoff { current_ms: std::sync::atomic::AtomicU64::new(initial_ms), initial_ms }
    }

    fn duration(&self) -> Duration {
        Duration::from_millis(self.current_ms.load(Ordering::Relaxed))
    }

    fn reset(&self) {
        self.current_ms.store(self.initial_ms, Ordering::Relaxed);
    }

    fn increase(&self) {
        let cap_ms = MAX_RECONNECT_WAIT.as_millis() as u64;
        let _ = self.current_ms.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |cur| Some(cur.saturating_mul(2).min(cap_ms)));
    }
}

#[derive(Clone)]
pub struct ClientConfig {
    pub server_name: String,
    pub server_port: u16,
    pub client_name: String,
    pub queue_capacity: usize,
    /// Whether this client accepts a `BE_PROXY` request and relays for others.
    pub can_be_proxy: bool,
    pub reconnect_wait: Duration,
    /// Durable message queue backing [`TransportClient::enqueue_message`].
    /// Messages drawn from it are sent with `majId = 1`, `minId` = the FIFO
    /// item's id, per spec §4.3 step 3.
    pub msg_fifo: Option<Arc<PermanentFifo>>,
}

impl ClientConfig {
    pub fn new(server_name: impl Into<String>, server_port: u16, client_name: impl Into<String>) -> Self {
        ClientConfig {
            server_name: server_name.into(),
            server_port,
            client_name: client_name.into(),
            queue_capacity: 1000,
            can_be_proxy: false,
            reconnect_wait: DEFAULT_RECONNECT_WAIT,
            msg_fifo: None,
        }
    }

    pub fn with_message_fifo(mut self, fifo: Arc<PermanentFifo>) -> Self {
        self.msg_fifo = Some(fifo);
        self
    }
}

struct Shared {
    client_name: String,
    queue: Mutex<VecDeque<TransportFile>>,
    capacity: usize,
    queue_changed: Notify,
    target: Mutex<(String, u16)>,
    connected: AtomicBool,
    shutdown_requested: AtomicBool,
    proxy_started: AtomicBool,
    msg_fifo: Option<Arc<PermanentFifo>>,
    /// Ids of message-FIFO items sent with `majId = 1` but not yet acked,
    /// oldest first.
    msg_inflight: Mutex<VecDeque<u64>>,
}

impl Shared {
    /// Drops acked files from the front of the queue and returns how many
    /// were removed, so the caller can keep its local "already sent" cursor
    /// in sync with what the queue still holds.
    async fn ack_up_to(&self, maj_id: u64, min_id: u64) -> usize {
        let mut queue = self.queue.lock().await;
        let mut removed = 0;
        while let Some(front) = queue.front() {
            let acked = front.id.maj_id < maj_id || (front.id.maj_id == maj_id && front.id.min_id <= min_id);
            if !acked {
                break;
            }
            queue.pop_front();
            removed += 1;
        }
        removed
    }

    /// Acks every in-flight message-FIFO item with id <= `min_id`, returning
    /// how many were drained so the caller's "already sent" accounting stays
    /// correct.
    async fn ack_messages_up_to(&self, min_id: u64) -> usize {
        let Some(fifo) = &self.msg_fifo else { return 0 };
        let mut inflight = self.msg_inflight.lock().await;
        let mut removed = 0;
        while let Some(&front) = inflight.front() {
            if front > min_id {
                break;
            }
            inflight.pop_front();
            if let Err(e) = fifo.ack(front).await {
                tracing::warn!(error = %e, id = front, "could not persist message FIFO ack");
            }
            removed += 1;
        }
        removed
    }
}

/// Handle to a running transport client session.
pub struct TransportClient {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TransportClient {
    /// Starts the client's background connection task.
    pub fn start(config: ClientConfig) -> Self {
        let shared = Arc::new(Shared {
            client_name: config.client_name.clone(),
            queue: Mutex::new(VecDeque::new()),
            capacity: config.queue_capacity,
            queue_changed: Notify::new(),
            target: Mutex::new((config.server_name.clone(), config.server_port)),
            connected: AtomicBool::new(false),
            shutdown_requested: AtomicBool::new(false),
            proxy_started: AtomicBool::new(false),
            msg_fifo: config.msg_fifo.clone(),
            msg_inflight: Mutex::new(VecDeque::new()),
        });
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(shared.clone(), config, cancel.clone()));
        TransportClient { shared, cancel, task: Mutex::new(Some(task)) }
    }

    /// Queues `file` for transmission. Fails if the queue is full (spec: the
    /// producer must fall back to its own durable storage in that case).
    pub async fn enqueue(&self, file: TransportFile) -> Result<(), ClientError> {
        let mut queue = self.shared.queue.lock().await;
        if queue.len() >= self.shared.capacity {
            return Err(ClientError::Full);
        }
        queue.push_back(file);
        drop(queue);
        self.shared.queue_changed.notify_waiters();
        Ok(())
    }

    /// Writes `payload` to the durable message FIFO configured via
    /// [`ClientConfig::with_message_fifo`]. Returns as soon as the write is
    /// durable on disk; transmission happens in the background and retries
    /// indefinitely, matching spec §4.3's `enqueueMessage`.
    pub async fn enqueue_message(&self, payload: bytes::Bytes) -> Result<u64, ClientError> {
        let fifo = self.shared.msg_fifo.as_ref().ok_or(ClientError::NoMessageFifo)?;
        let id = fifo.write(payload).await.map_err(|source| ClientError::MessageFifo { source })?;
        self.shared.queue_changed.notify_waiters();
        Ok(id)
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Relaxed)
    }

    pub async fn queue_space_left(&self) -> usize {
        let queue = self.shared.queue.lock().await;
        self.shared.capacity.saturating_sub(queue.len())
    }

    pub async fn queue_is_full(&self) -> bool {
        self.queue_space_left().await == 0
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shared.shutdown_requested.load(Ordering::Relaxed)
    }

    /// Cancels the background task and waits for it to exit.
    pub async fn stop(&self) {
        self.cancel.cancel();
        if let Some(task) = self.task.lock().await.take() {
            let _ = task.await;
        }
    }
}

async fn run(shared: Arc<Shared>, config: ClientConfig, cancel: CancellationToken) {
    let root = (config.server_name.clone(), config.server_port);
    let backoff = Backoff::new(config.reconnect_wait);
    let mut consecutive_proxy_failures = 0u32;
    loop {
        if cancel.is_cancelled() {
            return;
        }
        let target = shared.target.lock().await.clone();
        let is_proxy_target = target != root;
        match open_session(&shared, &config, &target, &cancel, &backoff).await {
            Ok(()) => {
                consecutive_proxy_failures = 0;
            }
            Err(e) => {
                tracing::warn!(error = %e, target = ?target, "transport session ended");
                backoff.increase();
                if is_proxy_target {
                    consecutive_proxy_failures += 1;
                    if consecutive_proxy_failures >= MAX_CONSECUTIVE_PROXY_FAILURES {
                        tracing::warn!(
                            failures = consecutive_proxy_failures,
                            root = ?root,
                            "proxy target failed repeatedly, falling back to root server"
                        );
                        *shared.target.lock().await = root.clone();
                        consecutive_proxy_failures = 0;
                    }
                }
            }
        }
        shared.connected.store(false, Ordering::Relaxed);
        if cancel.is_cancelled() {
            return;
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(backoff.duration()) => {}
        }
    }
}

async fn open_session(
    shared: &Arc<Shared>,
    config: &ClientConfig,
    target: &(String, u16),
    cancel: &CancellationToken,
    backoff: &Backoff,
) -> Result<(), ClientError> {
    let stream = TcpStream::connect((target.0.as_str(), target.1))
        .await
        .context(ConnectSnafu { name: target.0.clone(), port: target.1 })?;
    let (rd, mut wr) = stream.into_split();
    let mut reader = BufReader::new(rd);

    let proxy_state = if config.can_be_proxy { ProxyState::CanBeProxy } else { ProxyState::CanNotBeProxy };
    let ini = wire::ini_line(&config.client_name, proxy_state);
    wr.write_all(ini.as_bytes()).await.context(IoSnafu)?;

    let ready = tokio::time::timeout(HANDSHAKE_TIMEOUT, async {
        loop {
            let line = read_line(&mut reader).await?.ok_or(ClientError::ServerClosed)?;
            match wire::parse_from_server(&line) {
                Some(FromServer::Ready) => return Ok(true),
                Some(FromServer::NodeId(_)) => continue,
                Some(FromServer::BeProxy { name: _, port }) => {
                    maybe_start_proxy(shared, config, port);
                    continue;
                }
                Some(FromServer::UseProxy { name, port }) => {
                    *shared.target.lock().await = (name, port);
                    return Ok(false);
                }
                _ => return Err(ClientError::Protocol { line }),
            }
        }
    })
    .await
    .map_err(|_| ClientError::HandshakeTimeout)??;

    if !ready {
        // Told to use a different proxy before READY; reconnect there next time.
        return Ok(());
    }

    // A successful handshake resets the backoff immediately, regardless of how
    // long the resulting session later runs for.
    backoff.reset();
    shared.connected.store(true, Ordering::Relaxed);
    let result = steady_state(shared, &mut reader, &mut wr, cancel).await;
    shared.connected.store(false, Ordering::Relaxed);
    result
}

fn maybe_start_proxy(shared: &Arc<Shared>, config: &ClientConfig, bind_port: u16) {
    if !config.can_be_proxy {
        return;
    }
    if shared.proxy_started.swap(true, Ordering::SeqCst) {
        tracing::warn!("transport proxy already started");
        return;
    }
    let proxy_config = ProxyConfig { bind_port, upstream_name: config.server_name.clone(), upstream_port: config.server_port };
    tokio::spawn(async move {
        if let Err(e) = proxy::run(proxy_config, CancellationToken::new()).await {
            tracing::error!(error = %e, "transport proxy exited");
        }
    });
}

async fn steady_state(
    shared: &Arc<Shared>,
    reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: &mut tokio::net::tcp::OwnedWriteHalf,
    cancel: &CancellationToken,
) -> Result<(), ClientError> {
    let mut sent = 0usize;
    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }

        loop {
            let file = {
                let queue = shared.queue.lock().await;
                queue.get(sent).cloned()
            };
            let Some(file) = file else { break };
            send_file(writer, &file).await?;
            sent += 1;
        }

        if let Some(fifo) = &shared.msg_fifo {
            if let Ok(Some(item)) = fifo.read(Some(Duration::ZERO)).await {
                let file = TransportFile::new(shared.client_name.clone(), 1, item.id, item.payload);
                send_file(writer, &file).await?;
                shared.msg_inflight.lock().await.push_back(item.id);
            }
            if let Err(e) = fifo.flush(FLUSH_MIN_INTERVAL).await {
                tracing::warn!(error = %e, "could not persist message FIFO ack high-water mark");
            }
        }

        let line = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = shared.queue_changed.notified() => continue,
            res = tokio::time::timeout(POLL_INTERVAL, read_line(reader)) => res,
        };
        match line {
            Err(_elapsed) => continue,
            Ok(Err(e)) => return Err(e),
            Ok(Ok(None)) => return Err(ClientError::ServerClosed),
            Ok(Ok(Some(line))) => handle_control_line(shared, &mut sent, &line).await?,
        }
    }
}

async fn handle_control_line(shared: &Shared, sent: &mut usize, line: &str) -> Result<(), ClientError> {
    match wire::parse_from_server(line) {
        Some(FromServer::Ack { min_id, maj_id }) => {
            let removed = shared.ack_up_to(maj_id, min_id).await;
            *sent = sent.saturating_sub(removed);
            if maj_id == 1 {
                shared.ack_messages_up_to(min_id).await;
            }
            Ok(())
        }
        Some(FromServer::Close) => {
            shared.shutdown_requested.store(true, Ordering::Relaxed);
            Ok(())
        }
        Some(FromServer::Ready) | Some(FromServer::NodeId(_)) => Ok(()),
        Some(FromServer::BeProxy { .. }) | Some(FromServer::UseProxy { .. }) => Ok(()),
        None => Err(ClientError::Protocol { line: line.to_string() }),
    }
}

async fn send_file(writer: &mut tokio::net::tcp::OwnedWriteHalf, file: &TransportFile) -> Result<(), ClientError> {
    let header = wire::file_header_line(&file.id.source, file.id.min_id, file.id.maj_id, file.payload.len());
    watchdog_write_all(writer, header.as_bytes()).await?;
    watchdog_write_all(writer, &file.payload).await?;
    watchdog_write_all(writer, wire::END_LINE.as_bytes()).await?;
    Ok(())
}

/// Writes `buf` in full, failing with [`ClientError::SendStalled`] if no
/// single write call makes progress within `SEND_WATCHDOG_TIMEOUT` — no task
/// may block indefinitely on a socket (spec §5 "Send watchdog").
async fn watchdog_write_all(writer: &mut tokio::net::tcp::OwnedWriteHalf, buf: &[u8]) -> Result<(), ClientError> {
    tokio::time::timeout(SEND_WATCHDOG_TIMEOUT, writer.write_all(buf)).await.map_err(|_| ClientError::SendStalled)?.context(IoSnafu)
}

async fn read_line(reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>) -> Result<Option<String>, ClientError> {
    let mut line = String::new();
    let n = reader.read_line(&mut line).await.context(IoSnafu)?;
    if n == 0 {
        return Ok(None);
    }
    Ok(Some(line))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn handshake_then_file_then_ack_drains_queue() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let (rd, mut wr) = sock.split();
            let mut reader = BufReader::new(rd);
            let mut ini = String::new();
            reader.read_line(&mut ini).await.unwrap();
            assert!(ini.starts_with("INI client-a"));
            wr.write_all(b"READY\n").await.unwrap();

            let mut header = String::new();
            reader.read_line(&mut header).await.unwrap();
            let parsed = wire::parse_file_header(&header).unwrap();
            assert_eq!(parsed.source, "client-a");
            let mut payload = vec![0u8; parsed.size];
            reader.read_exact(&mut payload).await.unwrap();
            assert_eq!(payload, b"hello");
            let mut end = String::new();
            reader.read_line(&mut end).await.unwrap();
            assert_eq!(end, "END\n");

            wr.write_all(wire::ack_line(parsed.min_id, parsed.maj_id).as_bytes()).await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
        });

        let mut config = ClientConfig::new(addr.ip().to_string(), addr.port(), "client-a");
        config.reconnect_wait = Duration::from_millis(50);
        let client = TransportClient::start(config);

        client.enqueue(TransportFile::new("client-a", 1, 1, Bytes::from_static(b"hello"))).await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if client.queue_space_left().await == client.shared.capacity {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();

        client.stop().await;
        server.await.unwrap();
    }

    #[tokio::test]
    async fn enqueue_fails_when_queue_full() {
        let mut config = ClientConfig::new("127.0.0.1", 1, "client-b");
        config.queue_capacity = 1;
        let client = TransportClient::start(config);
        client.enqueue(TransportFile::new("client-b", 1, 1, Bytes::from_static(b"a"))).await.unwrap();
        let err = client.enqueue(TransportFile::new("client-b", 1, 2, Bytes::from_static(b"b"))).await;
        assert!(matches!(err, Err(ClientError::Full)));
        client.stop().await;
    }
}
