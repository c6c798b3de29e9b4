//! The InfoLogger wire protocol: field catalog, versioned protocol table, and the
//! record codec used to turn typed records into `*<version>#f0#f1#...\n`-framed bytes
//! and back.
//!
//! This crate has no I/O of its own. The persistent FIFO, the transport client/server,
//! and the collector daemon all depend on it purely for encode/decode, so that framing
//! logic lives in exactly one place.

#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod catalog;
pub mod codec;
pub mod record;

pub use catalog::{find_field, Protocol, PROTOCOLS};
pub use codec::{decode, encode, DecodeError, EncodeError, EncodeOutcome};
pub use record::{Record, RecordBatch, Value};
