//! Database inserter worker pool (spec §4.7a). Each worker owns one
//! connection and runs `Disconnected -> Connecting -> Ready -> Disconnected`
//! independently of its siblings, so one bad connection never stalls the
//! others — the hub's round-robin already isolates them at the queue level.

use std::time::{Duration, Instant};

use il_protocol::{Record, RecordBatch, Value};
use snafu::Snafu;
use sqlx::postgres::PgConnectOptions;
use sqlx::{Connection, Executor, PgConnection};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;

const MIN_RECONNECT_INTERVAL: Duration = Duration::from_secs(1);
const FORM_FEED: char = '\u{000C}';

#[derive(Debug, Snafu)]
pub enum InsertError {
    #[snafu(display("statement failed: {source}"))]
    Statement { source: sqlx::Error },
}

/// Abstraction over "a database session that accepts one record at a time",
/// so the state machine below can be driven by tests without a live Postgres
/// server.
#[async_trait::async_trait]
pub trait Inserter: Send {
    async fn insert(&mut self, record: &Record) -> Result<(), InsertError>;
}

pub struct PgInserter {
    conn: PgConnection,
}

const INSERT_SQL: &str = "INSERT INTO infologger_messages \
    (severity, level, timestamp, hostname, rolename, pid, username, system, facility, \
     detector, partition, run, errcode, errline, errsource, message) \
    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)";

#[async_trait::async_trait]
impl Inserter for PgInserter {
    async fn insert(&mut self, record: &Record) -> Result<(), InsertError> {
        let mut query = sqlx::query(INSERT_SQL);
        for value in &record.values {
            query = match value {
                None => query.bind(Option::<String>::None),
                Some(Value::Str(s)) => query.bind(s.clone()),
                Some(Value::Int(i)) => query.bind(*i),
                Some(Value::Double(d)) => query.bind(*d),
            };
        }
        self.conn.execute(query).await.map(|_| ()).map_err(|source| InsertError::Statement { source })
    }
}

enum State {
    Disconnected,
    Ready(Box<dyn Inserter>),
}

pub struct DbWorker {
    index: usize,
    connect_options: PgConnectOptions,
    rx: mpsc::Receiver<Arc<RecordBatch>>,
    insert_count: u64,
    dropped_count: u64,
}

impl DbWorker {
    pub fn new(index: usize, config: &ServerConfig, rx: mpsc::Receiver<Arc<RecordBatch>>) -> Self {
        let connect_options = PgConnectOptions::new()
            .host(&config.db_host)
            .username(&config.db_user)
            .password(&config.db_password)
            .database(&config.db_name);
        DbWorker { index, connect_options, rx, insert_count: 0, dropped_count: 0 }
    }

    pub async fn run(mut self, cancel: CancellationToken) {
        let mut state = State::Disconnected;
        let mut last_attempt = Instant::now() - MIN_RECONNECT_INTERVAL;

        loop {
            match &mut state {
                State::Disconnected => {
                    let since = last_attempt.elapsed();
                    if since < MIN_RECONNECT_INTERVAL {
                        let wait = MIN_RECONNECT_INTERVAL - since;
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            received = tokio::time::timeout(wait, self.rx.recv()) => {
                                if let Ok(Some(batch)) = received {
                                    self.dropped_count += batch.records.len() as u64;
                                }
                            }
                        }
                        continue;
                    }
                    last_attempt = Instant::now();
                    match PgConnection::connect_with(&self.connect_options).await {
                        Ok(conn) => {
                            tracing::info!(worker = self.index, "db worker connected");
                            state = State::Ready(Box::new(PgInserter { conn }));
                        }
                        Err(e) => {
                            tracing::warn!(worker = self.index, error = %e, "db connect failed, retrying in {MIN_RECONNECT_INTERVAL:?}");
                        }
                    }
                }
                State::Ready(inserter) => {
                    let batch = tokio::select! {
                        _ = cancel.cancelled() => break,
                        b = self.rx.recv() => b,
                    };
                    let Some(batch) = batch else { break };
                    if let Err(dropped) = self.insert_batch(inserter.as_mut(), &batch).await {
                        self.dropped_count += dropped;
                        state = State::Disconnected;
                    }
                }
            }
        }

        tracing::info!(worker = self.index, insert_count = self.insert_count, dropped_count = self.dropped_count, "db worker shutting down");
    }

    /// Inserts every record of `batch` (each split on embedded form-feed
    /// sentinels in its message field). Returns the count of records in the
    /// batch that were never attempted once a statement fails.
    async fn insert_batch(&mut self, inserter: &mut dyn Inserter, batch: &RecordBatch) -> Result<(), u64> {
        for (i, record) in batch.records.iter().enumerate() {
            for piece in split_message(record) {
                if let Err(e) = inserter.insert(&piece).await {
                    tracing::warn!(worker = self.index, error = %e, "insert failed, reconnecting");
                    let remaining_records = (batch.records.len() - i) as u64;
                    return Err(remaining_records);
                }
                self.insert_count += 1;
            }
        }
        Ok(())
    }
}

/// Test-only entry point into [`split_message`] for cross-crate integration
/// tests that don't have access to this module's private items.
#[doc(hidden)]
pub fn split_message_for_tests(record: &Record) -> Vec<Record> {
    split_message(record)
}

/// Splits `record`'s message field (always the last field, §3) on embedded
/// form-feed sentinels into one record per original source line, all other
/// fields shared.
fn split_message(record: &Record) -> Vec<Record> {
    let message_index = record.protocol.fields.len() - 1;
    match record.values.get(message_index).and_then(|v| v.as_ref()) {
        Some(Value::Str(s)) if s.contains(FORM_FEED) => s
            .split(FORM_FEED)
            .map(|line| {
                let mut values = record.values.clone();
                values[message_index] = Some(Value::Str(line.to_string()));
                Record { protocol: record.protocol, values }
            })
            .collect(),
        _ => vec![record.clone()],
    }
}
