//! Central dispatch hub (spec §4.6): pulls reassembled files off the
//! transport server, decodes them, and fans the resulting record batch out
//! to every registered consumer. A consumer whose queue is full only ever
//! loses its own copy of the batch (isolation across consumers); the DB pool
//! gets extra slack via round-robin retries before it is allowed to drop.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use il_protocol::RecordBatch;
use il_transport::TransportServer;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const POLL_INTERVAL: Duration = Duration::from_millis(500);
const DB_RETRY_SLEEP: Duration = Duration::from_millis(10);
const DB_MAX_PASSES: usize = 3;

struct ConsumerSink {
    name: String,
    tx: mpsc::Sender<Arc<RecordBatch>>,
    dropped: AtomicU64,
}

pub struct Hub {
    server: Arc<TransportServer>,
    consumers: Vec<ConsumerSink>,
    db_workers: Vec<mpsc::Sender<Arc<RecordBatch>>>,
    db_cursor: AtomicUsize,
    db_dropped: AtomicU64,
}

impl Hub {
    pub fn new(server: Arc<TransportServer>) -> Self {
        Hub { server, consumers: Vec::new(), db_workers: Vec::new(), db_cursor: AtomicUsize::new(0), db_dropped: AtomicU64::new(0) }
    }

    /// Registers a non-DB consumer (broadcaster, stats) with its own bounded
    /// queue and returns the receiving half for that consumer's task.
    pub fn add_consumer(&mut self, name: impl Into<String>, capacity: usize) -> mpsc::Receiver<Arc<RecordBatch>> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.consumers.push(ConsumerSink { name: name.into(), tx, dropped: AtomicU64::new(0) });
        rx
    }

    /// Registers one DB worker's inbound queue.
    pub fn add_db_worker(&mut self, capacity: usize) -> mpsc::Receiver<Arc<RecordBatch>> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.db_workers.push(tx);
        rx
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                return;
            }
            let Some(received) = self.server.get(Some(POLL_INTERVAL)).await else {
                continue;
            };

            let records = match il_protocol::decode(&received.file.payload) {
                Ok(records) => records,
                Err(e) => {
                    tracing::warn!(source = %received.file.id.source, error = %e, "decode failed, acking anyway");
                    received.ack().await;
                    continue;
                }
            };

            let batch = Arc::new(RecordBatch::new(received.file.id.source.clone(), received.file.id.maj_id, received.file.id.min_id, records));

            for consumer in &self.consumers {
                if consumer.tx.try_send(batch.clone()).is_err() {
                    let dropped = consumer.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    tracing::warn!(consumer = %consumer.name, dropped, "consumer queue full, dropping batch for this consumer only");
                }
            }

            self.dispatch_to_db(&batch).await;
            received.ack().await;
        }
    }

    async fn dispatch_to_db(&self, batch: &Arc<RecordBatch>) {
        if self.db_workers.is_empty() {
            return;
        }
        let n = self.db_workers.len();
        let start = self.db_cursor.fetch_add(1, Ordering::Relaxed) % n;

        for pass in 0..DB_MAX_PASSES {
            for offset in 0..n {
                let idx = (start + offset) % n;
                if self.db_workers[idx].try_send(batch.clone()).is_ok() {
                    return;
                }
            }
            if pass + 1 < DB_MAX_PASSES {
                tokio::time::sleep(DB_RETRY_SLEEP).await;
            }
        }

        let dropped = self.db_dropped.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::warn!(dropped, "db worker queues full after three passes, dropping batch");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use il_transport::{ClientConfig, ServerConfig, TransportClient, TransportServer};

    #[tokio::test]
    async fn decode_failure_is_acked_and_not_delivered() {
        let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = std_listener.local_addr().unwrap();
        drop(std_listener);

        let server = Arc::new(TransportServer::start(ServerConfig { bind_port: addr.port(), queue_capacity: 8 }).await.unwrap());

        let mut config = ClientConfig::new("127.0.0.1", addr.port(), "bad-client");
        config.reconnect_wait = Duration::from_millis(50);
        let client = TransportClient::start(config);
        client
            .enqueue(il_transport::TransportFile::new("bad-client", 1, 1, Bytes::from_static(b"not a valid record")))
            .await
            .unwrap();

        let mut hub = Hub::new(server.clone());
        let mut stats_rx = hub.add_consumer("stats", 8);
        let hub = Arc::new(hub);
        let cancel = CancellationToken::new();
        let run_cancel = cancel.clone();
        let hub_task = tokio::spawn(hub.clone().run(run_cancel));

        let result = tokio::time::timeout(Duration::from_secs(2), stats_rx.recv()).await;
        assert!(result.is_err(), "a corrupt batch must never reach a consumer");

        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if client.queue_space_left().await == 1000 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .unwrap();

        cancel.cancel();
        let _ = hub_task.await;
        client.stop().await;
    }

    #[tokio::test]
    async fn one_full_consumer_queue_does_not_block_another() {
        let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = std_listener.local_addr().unwrap();
        drop(std_listener);

        let server = Arc::new(TransportServer::start(ServerConfig { bind_port: addr.port(), queue_capacity: 8 }).await.unwrap());

        let mut config = ClientConfig::new("127.0.0.1", addr.port(), "good-client");
        config.reconnect_wait = Duration::from_millis(50);
        let client = TransportClient::start(config);

        let mut hub = Hub::new(server.clone());
        let full_rx = hub.add_consumer("full", 1);
        let mut open_rx = hub.add_consumer("open", 8);
        let hub = Arc::new(hub);
        let cancel = CancellationToken::new();
        let hub_task = tokio::spawn(hub.clone().run(cancel.clone()));

        // Never drained: the "full" consumer's queue fills after the first batch.
        std::mem::forget(full_rx);

        let payload = b"*1.4#5#6#0#host#role#1#user#sys#det#part#1##\n";
        for i in 1..=3u64 {
            client.enqueue(il_transport::TransportFile::new("good-client", 1, i, Bytes::copy_from_slice(payload))).await.unwrap();
        }

        for _ in 0..3 {
            tokio::time::timeout(Duration::from_secs(2), open_rx.recv()).await.unwrap().unwrap();
        }

        cancel.cancel();
        let _ = hub_task.await;
        client.stop().await;
    }
}
