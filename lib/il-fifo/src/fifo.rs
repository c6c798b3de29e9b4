//! The durable, single-producer/single-consumer FIFO itself: a small in-memory
//! "client table" backed by an append-only on-disk log (the "disk table"), so a
//! producer can keep writing even while the consumer is slow or the process has
//! just restarted after a crash.
//!
//! Every write is appended to the on-disk log before it is handed to a reader, so
//! nothing acknowledged as written can be lost. Acks only bump an in-memory
//! high-water mark; the log is compacted down to the unacked tail the next time
//! the FIFO is opened ([`crate::file::clean`]), not while it is running.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use bytes::Bytes;
use snafu::{ResultExt, Snafu};
use tokio::fs::OpenOptions;
use tokio::sync::{Mutex, Notify};

use crate::file::{self, DiskItem, FileError, MainHeader, MAIN_HEADER_LEN};

#[derive(Debug, Snafu)]
pub enum FifoError {
    #[snafu(display("{source}"))]
    File { source: FileError },
}

/// One item handed back by [`PermanentFifo::read`].
#[derive(Debug, Clone)]
pub struct FifoItem {
    pub id: u64,
    pub payload: Bytes,
}

struct State {
    file: tokio::fs::File,
    path: PathBuf,
    /// Oldest-first window of not-yet-delivered records kept in memory.
    mem: VecDeque<DiskItem>,
    mem_capacity: usize,
    /// Id of the last record handed out by `read`. The next one must be this + 1.
    last_delivered_id: u64,
    /// Byte offset in the file of the first record past `mem`'s tail.
    disk_cursor: u64,
    /// Id to assign to the next `write`.
    next_id: u64,
    /// Highest id acknowledged by the consumer so far.
    last_ack_id: u64,
    last_flush: Instant,
}

/// A durable store-and-forward queue: writes never block on the reader, and
/// survive a crash between write and ack. See module docs.
pub struct PermanentFifo {
    state: Mutex<State>,
    notify: Notify,
}

impl PermanentFifo {
    /// Opens (creating if absent) the FIFO rooted at `base`, running crash
    /// recovery first. `mem_capacity` bounds how many pending records are kept
    /// in memory; the rest live on disk until the reader catches up.
    pub async fn open(base: impl AsRef<Path>, mem_capacity: usize) -> Result<Self, FifoError> {
        let base = base.as_ref();
        file::clean(base).await.context(FileSnafu)?;

        let (current, _old, _new) = file::fifo_paths(base);
        let mut f = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&current)
            .await
            .context(FileSnafu)?;
        let header = file::read_header(&mut f, &current).await.context(FileSnafu)?;
        debug_assert_eq!(header.last_ack_id, 0, "clean() always normalizes last_ack_id to 0");

        let (loaded, disk_cursor) =
            file::read_records(&mut f, &current, MAIN_HEADER_LEN, mem_capacity.max(1)).await.context(FileSnafu)?;

        Ok(PermanentFifo {
            state: Mutex::new(State {
                file: f,
                path: current,
                mem: loaded.into(),
                mem_capacity: mem_capacity.max(1),
                last_delivered_id: 0,
                disk_cursor,
                next_id: header.current_id,
                last_ack_id: 0,
                last_flush: Instant::now(),
            }),
            notify: Notify::new(),
        })
    }

    /// Appends `payload` durably and returns its monotonically increasing id.
    pub async fn write(&self, payload: Bytes) -> Result<u64, FifoError> {
        let mut state = self.state.lock().await;
        let id = state.next_id + 1;
        let item = DiskItem { id, payload };
        file::append_record(&mut state.file, &item).await.context(FileSnafu)?;
        state.next_id = id;
        if state.mem.len() < state.mem_capacity {
            state.mem.push_back(item);
        }
        drop(state);
        self.notify.notify_waiters();
        Ok(id)
    }

    /// Returns the next undelivered record, waiting up to `timeout` (or
    /// indefinitely if `None`) for one to arrive. `Ok(None)` means the timeout
    /// elapsed with nothing to deliver.
    pub async fn read(&self, timeout: Option<Duration>) -> Result<Option<FifoItem>, FifoError> {
        let deadline = timeout.map(|d| Instant::now() + d);
        loop {
            if let Some(item) = self.try_take_next().await? {
                return Ok(Some(item));
            }
            let wait = self.notify.notified();
            match deadline {
                None => wait.await,
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Ok(None);
                    }
                    if tokio::time::timeout(remaining, wait).await.is_err() {
                        return Ok(None);
                    }
                }
            }
        }
    }

    async fn try_take_next(&self) -> Result<Option<FifoItem>, FifoError> {
        let mut state = self.state.lock().await;
        let want = state.last_delivered_id + 1;
        if want > state.next_id {
            return Ok(None);
        }
        if let Some(front) = state.mem.front() {
            if front.id == want {
                let item = state.mem.pop_front().expect("front just checked");
                state.last_delivered_id = want;
                return Ok(Some(FifoItem { id: item.id, payload: item.payload }));
            }
        }
        // Memory window has been outrun by acks/writes; fall back to disk.
        let path = state.path.clone();
        let cursor = state.disk_cursor;
        let (mut items, new_cursor) = file::read_records(&mut state.file, &path, cursor, 1).await.context(FileSnafu)?;
        let Some(item) = items.pop() else {
            return Ok(None);
        };
        state.disk_cursor = new_cursor;
        state.last_delivered_id = item.id;
        Ok(Some(FifoItem { id: item.id, payload: item.payload }))
    }

    /// Marks every record up to and including `id` as acknowledged. If that
    /// clears every record written so far, the header is updated and the
    /// file truncated back to just the header immediately — the
    /// `permFIFO_ack` fast path for "everything acked"
    /// (`examples/original_source/src/permanentFIFO.c:955-968`). Otherwise
    /// persistence is left to the next periodic [`Self::flush`].
    pub async fn ack(&self, id: u64) -> Result<(), FifoError> {
        let mut state = self.state.lock().await;
        if id > state.last_ack_id {
            state.last_ack_id = id;
        }
        if state.last_ack_id >= state.next_id {
            let header = MainHeader { last_ack_id: state.last_ack_id, current_id: state.next_id };
            file::write_header(&mut state.file, header).await.context(FileSnafu)?;
            file::truncate_to_header(&mut state.file).await.context(FileSnafu)?;
            state.disk_cursor = MAIN_HEADER_LEN;
            state.last_flush = Instant::now();
        }
        Ok(())
    }

    /// Persists the current ack high-water mark to the file header, at most
    /// once per `min_interval`. Call this periodically from the owning task.
    pub async fn flush(&self, min_interval: Duration) -> Result<(), FifoError> {
        let mut state = self.state.lock().await;
        if state.last_flush.elapsed() < min_interval {
            return Ok(());
        }
        let header = MainHeader { last_ack_id: state.last_ack_id, current_id: state.next_id };
        file::write_header(&mut state.file, header).await.context(FileSnafu)?;
        state.last_flush = Instant::now();
        Ok(())
    }

    /// Number of records written but not yet acknowledged.
    pub async fn depth(&self) -> u64 {
        let state = self.state.lock().await;
        state.next_id - state.last_ack_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fifo_monotonicity() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("queue");
        let fifo = PermanentFifo::open(&base, 4).await.unwrap();

        let id1 = fifo.write(Bytes::from_static(b"a")).await.unwrap();
        let id2 = fifo.write(Bytes::from_static(b"b")).await.unwrap();
        let id3 = fifo.write(Bytes::from_static(b"c")).await.unwrap();
        assert_eq!((id1, id2, id3), (1, 2, 3));

        let r1 = fifo.read(Some(Duration::from_millis(50))).await.unwrap().unwrap();
        let r2 = fifo.read(Some(Duration::from_millis(50))).await.unwrap().unwrap();
        let r3 = fifo.read(Some(Duration::from_millis(50))).await.unwrap().unwrap();
        assert_eq!(r1.id, 1);
        assert_eq!(r2.id, 2);
        assert_eq!(r3.id, 3);
        assert_eq!(&r1.payload[..], b"a");

        let timed_out = fifo.read(Some(Duration::from_millis(20))).await.unwrap();
        assert!(timed_out.is_none());
    }

    #[tokio::test]
    async fn fifo_spills_past_memory_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("queue");
        let fifo = PermanentFifo::open(&base, 2).await.unwrap();

        for n in 0..5u8 {
            fifo.write(Bytes::from(vec![n])).await.unwrap();
        }
        for expected in 1..=5u64 {
            let item = fifo.read(Some(Duration::from_millis(50))).await.unwrap().unwrap();
            assert_eq!(item.id, expected);
        }
    }

    #[tokio::test]
    async fn fifo_durability_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("queue");

        {
            let fifo = PermanentFifo::open(&base, 8).await.unwrap();
            fifo.write(Bytes::from_static(b"keep-1")).await.unwrap();
            fifo.write(Bytes::from_static(b"dropped")).await.unwrap();
            fifo.write(Bytes::from_static(b"keep-2")).await.unwrap();
            // Ack only the middle record; 1 and 3 must survive a restart.
            fifo.ack(1).await.unwrap();
            fifo.flush(Duration::ZERO).await.unwrap();
        }
        // Simulate the unacked id-3 never having been re-acked after the crash:
        // last_ack_id on disk reflects only the flushed ack above (id 1).

        let fifo = PermanentFifo::open(&base, 8).await.unwrap();
        let first = fifo.read(Some(Duration::from_millis(50))).await.unwrap().unwrap();
        let second = fifo.read(Some(Duration::from_millis(50))).await.unwrap().unwrap();
        assert_eq!(&first.payload[..], b"dropped");
        assert_eq!(&second.payload[..], b"keep-2");
        assert!(fifo.read(Some(Duration::from_millis(20))).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fully_acked_fifo_is_not_redelivered_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("queue");

        {
            let fifo = PermanentFifo::open(&base, 8).await.unwrap();
            fifo.write(Bytes::from_static(b"a")).await.unwrap();
            fifo.write(Bytes::from_static(b"b")).await.unwrap();
            fifo.read(Some(Duration::from_millis(50))).await.unwrap().unwrap();
            fifo.read(Some(Duration::from_millis(50))).await.unwrap().unwrap();
            // Acking the last id written truncates the file back to the
            // header immediately, without waiting on flush()'s throttle.
            fifo.ack(2).await.unwrap();
        }

        let fifo = PermanentFifo::open(&base, 8).await.unwrap();
        assert!(fifo.read(Some(Duration::from_millis(20))).await.unwrap().is_none());
    }
}
