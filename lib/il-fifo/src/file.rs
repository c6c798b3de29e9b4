//! On-disk layout of a FIFO file, matching
//! `examples/original_source/src/permanentFIFO.c` field-for-field:
//!
//! ```text
//! main header: { magic: u32, last_ack_id: u64, current_id: u64 }
//! record:      { magic: u32, size: u32, id: u64, payload: [u8; size] }
//! ```
//!
//! Records follow the header, append-only, until a compaction ("clean") pass
//! rewrites the file.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use bytes::Bytes;
use snafu::{ensure, ResultExt, Snafu};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

pub const FIFO_MAGIC: u32 = 0x494C_4647; // "ILFG"
pub const MAIN_HEADER_LEN: u64 = 4 + 8 + 8;
pub const RECORD_HEADER_LEN: u64 = 4 + 4 + 8;

#[derive(Debug, Snafu)]
pub enum FileError {
    #[snafu(display("I/O error on FIFO file {}: {source}", path.display()))]
    Io { path: PathBuf, source: std::io::Error },
    #[snafu(display("FIFO file {} has a bad magic tag", path.display()))]
    BadMagic { path: PathBuf },
    #[snafu(display("FIFO file {} ended mid-record", path.display()))]
    Truncated { path: PathBuf },
}

#[derive(Debug, Clone, Copy)]
pub struct MainHeader {
    pub last_ack_id: u64,
    pub current_id: u64,
}

impl MainHeader {
    pub fn zero() -> Self {
        MainHeader { last_ack_id: 0, current_id: 0 }
    }

    fn to_bytes(self) -> [u8; MAIN_HEADER_LEN as usize] {
        let mut buf = [0u8; MAIN_HEADER_LEN as usize];
        buf[0..4].copy_from_slice(&FIFO_MAGIC.to_le_bytes());
        buf[4..12].copy_from_slice(&self.last_ack_id.to_le_bytes());
        buf[12..20].copy_from_slice(&self.current_id.to_le_bytes());
        buf
    }

    fn from_bytes(buf: &[u8], path: &Path) -> Result<Self, FileError> {
        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        ensure!(magic == FIFO_MAGIC, BadMagicSnafu { path: path.to_path_buf() });
        Ok(MainHeader {
            last_ack_id: u64::from_le_bytes(buf[4..12].try_into().unwrap()),
            current_id: u64::from_le_bytes(buf[12..20].try_into().unwrap()),
        })
    }
}

#[derive(Debug, Clone)]
pub struct DiskItem {
    pub id: u64,
    pub payload: Bytes,
}

/// Derive `<path>.fifo`, `<path>.fifo.old`, `<path>.fifo.new` from a base path, matching
/// `permFIFO_getFileName`.
pub fn fifo_paths(base: &Path) -> (PathBuf, PathBuf, PathBuf) {
    let mut current = base.as_os_str().to_owned();
    current.push(".fifo");
    let mut old = base.as_os_str().to_owned();
    old.push(".fifo.old");
    let mut new = base.as_os_str().to_owned();
    new.push(".fifo.new");
    (PathBuf::from(current), PathBuf::from(old), PathBuf::from(new))
}

pub async fn write_header(file: &mut File, header: MainHeader) -> Result<(), FileError> {
    file.seek(SeekFrom::Start(0)).await.context(IoSnafu { path: PathBuf::new() })?;
    file.write_all(&header.to_bytes()).await.context(IoSnafu { path: PathBuf::new() })?;
    file.flush().await.context(IoSnafu { path: PathBuf::new() })?;
    Ok(())
}

pub async fn read_header(file: &mut File, path: &Path) -> Result<MainHeader, FileError> {
    file.seek(SeekFrom::Start(0)).await.context(IoSnafu { path: path.to_path_buf() })?;
    let mut buf = [0u8; MAIN_HEADER_LEN as usize];
    file.read_exact(&mut buf).await.context(IoSnafu { path: path.to_path_buf() })?;
    MainHeader::from_bytes(&buf, path)
}

pub async fn append_record(file: &mut File, item: &DiskItem) -> Result<(), FileError> {
    let mut buf = Vec::with_capacity(RECORD_HEADER_LEN as usize + item.payload.len());
    buf.extend_from_slice(&FIFO_MAGIC.to_le_bytes());
    buf.extend_from_slice(&(item.payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&item.id.to_le_bytes());
    buf.extend_from_slice(&item.payload);
    file.seek(SeekFrom::End(0)).await.context(IoSnafu { path: PathBuf::new() })?;
    file.write_all(&buf).await.context(IoSnafu { path: PathBuf::new() })?;
    Ok(())
}

/// Read as many whole records as are available starting at the current file position,
/// stopping once `max_items` have been read or EOF is reached. Returns the items read
/// and the file offset immediately after the last one consumed.
pub async fn read_records(
    file: &mut File,
    path: &Path,
    start_offset: u64,
    max_items: usize,
) -> Result<(Vec<DiskItem>, u64), FileError> {
    file.seek(SeekFrom::Start(start_offset)).await.context(IoSnafu { path: path.to_path_buf() })?;
    let mut items = Vec::new();
    let mut offset = start_offset;
    while items.len() < max_items {
        let mut header = [0u8; RECORD_HEADER_LEN as usize];
        match file.read_exact(&mut header).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(e).context(IoSnafu { path: path.to_path_buf() }),
        }
        let magic = u32::from_le_bytes(header[0..4].try_into().unwrap());
        ensure!(magic == FIFO_MAGIC, BadMagicSnafu { path: path.to_path_buf() });
        let size = u32::from_le_bytes(header[4..8].try_into().unwrap()) as usize;
        let id = u64::from_le_bytes(header[8..16].try_into().unwrap());
        let mut payload = vec![0u8; size];
        file.read_exact(&mut payload)
            .await
            .map_err(|_| FileError::Truncated { path: path.to_path_buf() })?;
        offset += RECORD_HEADER_LEN + size as u64;
        items.push(DiskItem { id, payload: Bytes::from(payload) });
    }
    Ok((items, offset))
}

/// Crash-recovery compaction: drop records with `id <= last_ack_id`, renumber the
/// survivors starting from 1, and leave `current_id` equal to the survivor count.
/// Mirrors `permFIFO_file_clean`. Must run before the FIFO is otherwise opened.
pub async fn clean(base: &Path) -> Result<(), FileError> {
    let (current, old, new) = fifo_paths(base);

    if !current.exists() {
        if old.exists() {
            fs::rename(&old, &current).await.context(IoSnafu { path: current.clone() })?;
        } else {
            let mut file = File::create(&current).await.context(IoSnafu { path: current.clone() })?;
            write_header(&mut file, MainHeader::zero()).await?;
            return Ok(());
        }
    }

    let mut src = OpenOptions::new()
        .read(true)
        .write(true)
        .open(&current)
        .await
        .context(IoSnafu { path: current.clone() })?;
    let _ = fs::remove_file(&old).await;
    let _ = fs::remove_file(&new).await;

    let header = read_header(&mut src, &current).await?;

    if header.last_ack_id == 0 {
        // Nothing acknowledged: just make sure `current_id` matches the true tail.
        let (items, _) = read_records(&mut src, &current, MAIN_HEADER_LEN, usize::MAX).await?;
        if let Some(last) = items.last() {
            let mut src = OpenOptions::new().write(true).open(&current).await.context(IoSnafu { path: current.clone() })?;
            write_header(&mut src, MainHeader { last_ack_id: 0, current_id: last.id }).await?;
        }
        return Ok(());
    }

    let (items, _) = read_records(&mut src, &current, MAIN_HEADER_LEN, usize::MAX).await?;
    let mut dst = File::create(&new).await.context(IoSnafu { path: new.clone() })?;
    write_header(&mut dst, MainHeader::zero()).await?;

    let mut next_id = 0u64;
    for item in items.into_iter().filter(|i| i.id > header.last_ack_id) {
        next_id += 1;
        append_record(&mut dst, &DiskItem { id: next_id, payload: item.payload }).await?;
    }
    write_header(&mut dst, MainHeader { last_ack_id: 0, current_id: next_id }).await?;
    drop(dst);

    fs::rename(&current, &old).await.context(IoSnafu { path: current.clone() })?;
    fs::rename(&new, &current).await.context(IoSnafu { path: current.clone() })?;
    let _ = fs::remove_file(&old).await;

    Ok(())
}

/// Truncate the file back to just the header (fast path when everything is acked).
pub async fn truncate_to_header(file: &mut File) -> Result<(), FileError> {
    file.set_len(MAIN_HEADER_LEN).await.context(IoSnafu { path: PathBuf::new() })?;
    Ok(())
}
