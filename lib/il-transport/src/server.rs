//! The transport server: accepts client connections, reassembles `File`/`END`
//! framed records, and hands completed files to a bounded queue for the
//! dispatch hub to pull from. Matches `examples/original_source/src/infoLoggerServer.cxx`
//! and `transport_server.h`'s `TR_server_get_file`/`TR_server_ack_file` pair,
//! one accept loop and one task per connection instead of one thread per
//! connection.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use snafu::{ResultExt, Snafu};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::file::TransportFile;
use crate::wire;

/// How long `stop()` waits after queuing `CLOSE` to every connected client
/// before tearing down the accept loop and connection tasks (spec §4.4
/// "enqueue CLOSE to all connections and close them after a drain grace period").
const CLOSE_DRAIN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Snafu)]
pub enum ServerError {
    #[snafu(display("could not bind 0.0.0.0:{port}: {source}"))]
    Bind { port: u16, source: std::io::Error },
}

/// Tracks every connected client's ack/control sender so `stop()` can
/// broadcast `CLOSE` before shutting the accept loop down.
#[derive(Default)]
struct Registry {
    conns: Mutex<Vec<(u64, mpsc::Sender<String>)>>,
    next_id: AtomicU64,
}

impl Registry {
    async fn register(&self, tx: mpsc::Sender<String>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.conns.lock().await.push((id, tx));
        id
    }

    async fn unregister(&self, id: u64) {
        self.conns.lock().await.retain(|(existing, _)| *existing != id);
    }

    async fn close_all(&self) {
        let conns = self.conns.lock().await;
        for (_, tx) in conns.iter() {
            let _ = tx.send(wire::CLOSE_LINE.to_string()).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_port: u16,
    /// Capacity of the shared queue handed to dispatch; a slow consumer
    /// backs up every connection's reads once this fills.
    pub queue_capacity: usize,
}

/// A client connection's ack sink, shared by every [`ReceivedFile`] it produced.
struct Connection {
    peer: SocketAddr,
    ack_tx: mpsc::Sender<String>,
}

/// One reassembled file plus a handle back to the connection it arrived on,
/// so the consumer can ack it once processed.
pub struct ReceivedFile {
    pub file: TransportFile,
    conn: Arc<Connection>,
}

impl ReceivedFile {
    pub fn peer(&self) -> SocketAddr {
        self.conn.peer
    }

    /// Acknowledges this file (and, transitively on the client, everything
    /// before it — spec requires in-order acking, matching the header doc's
    /// "IMPORTANT: files must be acknowledged in the same order read").
    pub async fn ack(&self) {
        let line = wire::ack_line(self.file.id.min_id, self.file.id.maj_id);
        let _ = self.conn.ack_tx.send(line).await;
    }
}

pub struct TransportServer {
    receiver: Mutex<mpsc::Receiver<ReceivedFile>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    registry: Arc<Registry>,
    cancel: CancellationToken,
}

impl TransportServer {
    pub async fn start(config: ServerConfig) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(("0.0.0.0", config.bind_port)).await.context(BindSnafu { port: config.bind_port })?;
        let (item_tx, item_rx) = mpsc::channel(config.queue_capacity.max(1));
        let cancel = CancellationToken::new();
        let registry = Arc::new(Registry::default());
        let accept_cancel = cancel.clone();
        let accept_task = tokio::spawn(accept_loop(listener, item_tx, accept_cancel, registry.clone()));
        Ok(TransportServer { receiver: Mutex::new(item_rx), accept_task: Mutex::new(Some(accept_task)), registry, cancel })
    }

    /// Waits up to `timeout` (or indefinitely if `None`) for the next file.
    pub async fn get(&self, timeout: Option<Duration>) -> Option<ReceivedFile> {
        let mut rx = self.receiver.lock().await;
        match timeout {
            None => rx.recv().await,
            Some(d) => tokio::time::timeout(d, rx.recv()).await.ok().flatten(),
        }
    }

    /// Enqueues `CLOSE` to every connected client, waits a drain grace
    /// period, then cancels the accept loop and all connection tasks.
    pub async fn stop(&self) {
        self.registry.close_all().await;
        tokio::time::sleep(CLOSE_DRAIN_GRACE).await;
        self.cancel.cancel();
        if let Some(task) = self.accept_task.lock().await.take() {
            let _ = task.await;
        }
    }
}

async fn accept_loop(listener: TcpListener, item_tx: mpsc::Sender<ReceivedFile>, cancel: CancellationToken, registry: Arc<Registry>) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok(a) => a,
                Err(e) => {
                    tracing::warn!(error = %e, "transport server accept failed");
                    continue;
                }
            },
        };
        let item_tx = item_tx.clone();
        let cancel = cancel.clone();
        let registry = registry.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, peer, item_tx, cancel, registry).await {
                tracing::info!(%peer, error = %e, "transport connection closed");
            }
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    item_tx: mpsc::Sender<ReceivedFile>,
    cancel: CancellationToken,
    registry: Arc<Registry>,
) -> std::io::Result<()> {
    let _ = socket2::SockRef::from(&stream).set_keepalive(true);
    let (rd, mut wr) = stream.into_split();
    let mut reader = BufReader::new(rd);

    let mut ini_line = String::new();
    reader.read_line(&mut ini_line).await?;
    let Some((client_name, _proxy_state)) = wire::parse_ini(&ini_line) else {
        tracing::warn!(%peer, line = %ini_line, "bad INI line");
        return Ok(());
    };
    wr.write_all(wire::READY_LINE.as_bytes()).await?;
    tracing::info!(%peer, client = %client_name, "transport client connected");

    let (ack_tx, mut ack_rx) = mpsc::channel::<String>(64);
    let registry_id = registry.register(ack_tx.clone()).await;
    let writer_task = tokio::spawn(async move {
        while let Some(line) = ack_rx.recv().await {
            if wr.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    let conn = Arc::new(Connection { peer, ack_tx: ack_tx.clone() });
    drop(ack_tx);

    let result = read_frames(&mut reader, &client_name, &conn, &item_tx, &cancel).await;
    drop(conn);
    registry.unregister(registry_id).await;
    let _ = writer_task.await;
    result
}

async fn read_frames(
    reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>,
    client_name: &str,
    conn: &Arc<Connection>,
    item_tx: &mpsc::Sender<ReceivedFile>,
    cancel: &CancellationToken,
) -> std::io::Result<()> {
    loop {
        let mut header_line = String::new();
        let n = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            n = reader.read_line(&mut header_line) => n?,
        };
        if n == 0 {
            return Ok(());
        }
        let Some(header) = wire::parse_file_header(&header_line) else {
            tracing::warn!(peer = %conn.peer, line = %header_line, "bad File header");
            return Ok(());
        };
        if header.source != client_name {
            tracing::debug!(peer = %conn.peer, declared = %client_name, header_source = %header.source, "source in File header differs from INI name");
        }

        let mut payload = vec![0u8; header.size];
        reader.read_exact(&mut payload).await?;
        let mut end_line = String::new();
        reader.read_line(&mut end_line).await?;
        if end_line.trim_end() != "END" {
            tracing::warn!(peer = %conn.peer, "missing END after file payload");
            return Ok(());
        }

        let file = TransportFile::new(header.source, header.maj_id, header.min_id, payload.into());
        let item = ReceivedFile { file, conn: conn.clone() };
        if item_tx.send(item).await.is_err() {
            return Ok(());
        }
    }
}
