//! The unit of transmission: a `(source, major, minor)`-identified blob of
//! bytes, matching `examples/original_source/src/transport_files.h`'s `TR_file`.

use bytes::Bytes;

/// Identifies a file within a source's transmission stream. Ordered first by
/// `maj_id` then `min_id`, matching `TR_file_id_compare`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileId {
    pub source: String,
    pub maj_id: u64,
    pub min_id: u64,
}

/// A file queued for transmission: one id plus its payload. The wire protocol
/// only ever sends a single contiguous blob per file (the original's blob
/// list is collapsed to one `Bytes` here; nothing currently sends more than
/// one blob per file).
#[derive(Debug, Clone)]
pub struct TransportFile {
    pub id: FileId,
    pub payload: Bytes,
}

impl TransportFile {
    pub fn new(source: impl Into<String>, maj_id: u64, min_id: u64, payload: Bytes) -> Self {
        TransportFile { id: FileId { source: source.into(), maj_id, min_id }, payload }
    }
}
