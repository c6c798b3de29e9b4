//! In-memory record representation.

use crate::catalog::{Protocol, PROTOCOLS};

/// A field value. `None` at a given index (in [`Record::values`]) means "undefined",
/// which is distinct from an empty string or a zero — spec §3.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Str(String),
    Int(i64),
    Double(f64),
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }
}

/// One log record: a protocol reference plus, for every field in that protocol,
/// either a value or undefined.
#[derive(Debug, Clone)]
pub struct Record {
    pub protocol: &'static Protocol,
    pub values: Vec<Option<Value>>,
}

impl Record {
    /// A record with every field undefined, for the default protocol.
    pub fn empty() -> Self {
        let protocol = &PROTOCOLS[0];
        Record { protocol, values: vec![None; protocol.fields.len()] }
    }

    /// Re-maps this record's fields into the default protocol's layout using its
    /// conversion table. A no-op if already on the default protocol.
    pub fn convert_to_default(&mut self) {
        if self.protocol.is_default() {
            return;
        }
        let default_len = PROTOCOLS[0].fields.len();
        let mut converted: Vec<Option<Value>> = vec![None; default_len];
        for (src_ix, dst_ix) in self.protocol.convert_index.iter().enumerate() {
            if let Some(dst_ix) = dst_ix {
                converted[*dst_ix] = self.values[src_ix].take();
            }
        }
        self.protocol = &PROTOCOLS[0];
        self.values = converted;
    }

    /// Look up a value by default-protocol field name. Only meaningful once the
    /// record has been converted to the default protocol (true for every record
    /// that passed through [`crate::decode`]).
    pub fn field(&self, name: &str) -> Option<&Value> {
        let ix = crate::catalog::find_field(name)?;
        self.values.get(ix).and_then(|v| v.as_ref())
    }
}

/// A transport unit: a sequence of records sharing one `(source, major, minor)` id.
/// Owned by the decoder that assembled it; shared by reference among dispatch
/// consumers (spec §3 "Record batch").
#[derive(Debug, Clone)]
pub struct RecordBatch {
    pub source: String,
    pub major: u64,
    pub minor: u64,
    pub records: Vec<Record>,
}

impl RecordBatch {
    pub fn new(source: impl Into<String>, major: u64, minor: u64, records: Vec<Record>) -> Self {
        RecordBatch { source: source.into(), major, minor, records }
    }
}
