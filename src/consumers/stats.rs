//! Windowed statistics aggregator (spec §4.7c). Shares the broadcaster's
//! slot-array/3-second-writable-readiness discipline for subscribers, but
//! pushes a full dump of all retained windows on a timer instead of pushing
//! per record.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use il_protocol::{Record, RecordBatch, Value};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const WRITE_TIMEOUT: Duration = Duration::from_secs(3);
const LIVENESS_BUF: usize = 256;

struct IndexKey {
    name: &'static str,
    fields: Vec<usize>,
}

const BUILT_IN_KEY_NAMES: &[&str] = &[
    "severity",
    "level",
    "hostname",
    "rolename",
    "hostname,pid",
    "system",
    "facility",
    "detector",
    "partition",
    "run",
    "run,detector,severity,level",
    "run,hostname,severity,level",
    "run,hostname,facility",
    "errcode",
    "errsource,errline",
    "hostname,pid,errsource,errline",
];

static BUILT_IN_KEYS: LazyLock<Vec<IndexKey>> = LazyLock::new(|| {
    BUILT_IN_KEY_NAMES
        .iter()
        .map(|&name| {
            let fields = name
                .split(',')
                .map(|field_name| il_protocol::find_field(field_name).unwrap_or_else(|| panic!("unknown stats index field {field_name:?}")))
                .collect();
            IndexKey { name, fields }
        })
        .collect()
});

struct Window {
    start: u64,
    end: u64,
    total_messages: u64,
    field_counts: HashMap<&'static str, HashMap<String, u64>>,
}

impl Window {
    fn new(start: u64, end: u64) -> Self {
        Window { start, end, total_messages: 0, field_counts: HashMap::new() }
    }

    fn record(&mut self, record: &Record) {
        self.total_messages += 1;
        for key in BUILT_IN_KEYS.iter() {
            if let Some(joined) = joined_value(record, key) {
                *self.field_counts.entry(key.name).or_default().entry(joined).or_insert(0) += 1;
            }
        }
    }

    fn dump(&self) -> String {
        let mut out = format!("{{timeBegin {} timeEnd {} totalMessages {} fieldCounts {{", self.start, self.end, self.total_messages);
        let mut first_key = true;
        for key in BUILT_IN_KEYS.iter() {
            let Some(counts) = self.field_counts.get(key.name) else { continue };
            if !first_key {
                out.push(' ');
            }
            first_key = false;
            out.push_str(key.name);
            out.push_str(" {");
            let mut first_pair = true;
            for (value, count) in counts {
                if !first_pair {
                    out.push(' ');
                }
                first_pair = false;
                out.push_str(value);
                out.push(' ');
                out.push_str(&count.to_string());
            }
            out.push('}');
        }
        out.push_str("}}");
        out
    }
}

fn joined_value(record: &Record, key: &IndexKey) -> Option<String> {
    let mut parts = Vec::with_capacity(key.fields.len());
    for &index in &key.fields {
        let value = record.values.get(index)?.as_ref()?;
        parts.push(value_to_string(value));
    }
    Some(parts.join("-"))
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::Str(s) => s.clone(),
        Value::Int(i) => i.to_string(),
        Value::Double(d) => d.to_string(),
    }
}

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

struct Slot {
    stream: TcpStream,
}

pub struct StatsAggregator {
    listener: TcpListener,
    slots: Vec<Option<Slot>>,
    rx: mpsc::Receiver<Arc<RecordBatch>>,
    windows: Vec<Window>,
    window_interval: Duration,
    publish_interval: Duration,
    history: Duration,
}

impl StatsAggregator {
    pub async fn bind(
        port: u16,
        max_clients: usize,
        rx: mpsc::Receiver<Arc<RecordBatch>>,
        window_interval: Duration,
        publish_interval: Duration,
        history: Duration,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        let mut slots = Vec::with_capacity(max_clients);
        slots.resize_with(max_clients, || None);
        Ok(StatsAggregator { listener, slots, rx, windows: Vec::new(), window_interval, publish_interval, history })
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        let mut window_tick = tokio::time::interval(self.window_interval);
        let mut publish_tick = tokio::time::interval(self.publish_interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                accepted = self.listener.accept() => self.accept_one(accepted),
                batch = self.rx.recv() => {
                    match batch {
                        Some(batch) => self.ingest(&batch),
                        None => return,
                    }
                }
                _ = window_tick.tick() => self.rotate_window(),
                _ = publish_tick.tick() => self.publish().await,
            }
        }
    }

    fn accept_one(&mut self, accepted: std::io::Result<(TcpStream, std::net::SocketAddr)>) {
        let (stream, peer) = match accepted {
            Ok(a) => a,
            Err(e) => {
                tracing::warn!(error = %e, "stats accept failed");
                return;
            }
        };
        let _ = stream.set_nodelay(true);
        let _ = socket2::SockRef::from(&stream).set_keepalive(true);
        if let Some(empty) = self.slots.iter_mut().find(|s| s.is_none()) {
            tracing::debug!(%peer, "stats subscriber connected");
            *empty = Some(Slot { stream });
        } else {
            tracing::warn!(%peer, "stats at capacity, closing new connection");
            drop(stream);
        }
    }

    fn ingest(&mut self, batch: &RecordBatch) {
        if self.windows.is_empty() {
            self.open_window();
        }
        let window = self.windows.last_mut().expect("just opened if empty");
        for record in &batch.records {
            window.record(record);
        }
    }

    fn open_window(&mut self) {
        let start = now_secs();
        self.windows.push(Window::new(start, start + self.window_interval.as_secs()));
    }

    fn rotate_window(&mut self) {
        let now = now_secs();
        if let Some(current) = self.windows.last_mut() {
            current.end = now;
        }
        self.open_window();
        let cutoff = now.saturating_sub(self.history.as_secs());
        self.windows.retain(|w| w.end >= cutoff);
    }

    async fn publish(&mut self) {
        if self.windows.is_empty() {
            return;
        }
        let mut dump = String::new();
        for window in &self.windows {
            dump.push_str(&window.dump());
        }
        dump.push('\n');
        let payload = Bytes::from(dump.into_bytes());

        let mut probe = [0u8; LIVENESS_BUF];
        for slot in &mut self.slots {
            let Some(s) = slot else { continue };
            match s.stream.try_read(&mut probe) {
                Ok(0) => {
                    *slot = None;
                    continue;
                }
                Err(e) if e.kind() != std::io::ErrorKind::WouldBlock => {
                    *slot = None;
                    continue;
                }
                _ => {}
            }
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
    use il_protocol::PROTOCOLS;

    fn record_with(pairs: &[(&str, Value)]) -> Record {
        let mut record = Record::empty();
        for (name, value) in pairs {
            let index = PROTOCOLS[0].fields.iter().position(|f| f.name == *name).unwrap();
            record.values[index] = Some(value.clone());
        }
        record
    }

    #[test]
    fn window_counts_total_messages_and_index_keys() {
        let mut window = Window::new(0, 30);
        window.record(&record_with(&[("severity", Value::Str("E".into())), ("hostname", Value::Str("h1".into())), ("pid", Value::Int(42))]));
        window.record(&record_with(&[("severity", Value::Str("E".into())), ("hostname", Value::Str("h1".into())), ("pid", Value::Int(42))]));
        assert_eq!(window.total_messages, 2);
        assert_eq!(*window.field_counts["severity"].get("E").unwrap(), 2);
        assert_eq!(*window.field_counts["hostname,pid"].get("h1-42").unwrap(), 2);
    }

    #[test]
    fn undefined_component_field_skips_only_that_key() {
        let mut window = Window::new(0, 30);
        window.record(&record_with(&[("severity", Value::Str("E".into()))]));
        assert_eq!(window.total_messages, 1);
        assert!(window.field_counts.contains_key("severity"));
        assert!(!window.field_counts.contains_key("hostname,pid"));
    }

    #[test]
    fn dump_matches_the_documented_braces_format() {
        let mut window = Window::new(10, 40);
        window.record(&record_with(&[("severity", Value::Str("E".into()))]));
        let dump = window.dump();
        assert!(dump.starts_with("{timeBegin 10 timeEnd 40 totalMessages 1 fieldCounts {"));
        assert!(dump.contains("severity {E 1}"));
        assert!(dump.ends_with("}}"));
    }
}
