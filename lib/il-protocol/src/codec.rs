//! Encoding and decoding of the `*<version>#<f0>#<f1>#...#<fN>\n` wire form.
//!
//! Grounded on `examples/original_source/src/infoLoggerMessage.c` (`infoLog_msg_encode`)
//! and `examples/original_source/src/infoLoggerMessageDecode.c` (`infoLog_decode`).

use snafu::Snafu;

use crate::catalog::{find_protocol, FieldType};
use crate::record::{Record, Value};

const TRUNCATE_MARKER: &[u8] = b" [...]\n";

/// Result of a successful `encode` call: either the full record(s) fit, or the
/// output was truncated at a record boundary and carries the truncation marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeOutcome {
    Complete,
    Truncated,
}

#[derive(Debug, Snafu)]
pub enum EncodeError {
    #[snafu(display("destination buffer too small to hold even the truncation marker"))]
    BufferTooSmall,
    #[snafu(display("splitIndex {index} is out of range for a {count}-field protocol"))]
    SplitIndexOutOfRange { index: usize, count: usize },
    #[snafu(display("splitIndex {index} does not refer to a string field"))]
    SplitIndexNotString { index: usize },
}

#[derive(Debug, Snafu)]
pub enum DecodeError {
    #[snafu(display("record does not start with the '*' framing marker"))]
    MissingMarker,
    #[snafu(display("record ends before a version terminator ('#') was found"))]
    TruncatedVersion,
    #[snafu(display("unknown protocol version {version:?}"))]
    UnknownVersion { version: String },
    #[snafu(display("record ends before all fields of protocol {version} were read"))]
    TruncatedFields { version: String },
    #[snafu(display("record bytes are not valid UTF-8, decoding best-effort lossily"))]
    InvalidUtf8,
}

fn escape_field(raw: &str, out: &mut Vec<u8>) {
    for b in raw.bytes() {
        match b {
            b'*' | b'#' | b'\n' => out.push(b'?'),
            other => out.push(other),
        }
    }
}

/// Render one record (with the field at `split_index`, if any, overridden to `line`)
/// into its complete `*version#...#...\n` form.
fn encode_one(record: &Record, split_index: Option<usize>, line_override: Option<&str>) -> Vec<u8> {
    let mut out = Vec::with_capacity(128);
    out.push(b'*');
    out.extend_from_slice(record.protocol.version.as_bytes());
    for (i, field) in record.protocol.fields.iter().enumerate() {
        out.push(b'#');
        let value = if Some(i) == split_index {
            line_override.map(|l| Value::Str(l.to_string()))
        } else {
            record.values.get(i).cloned().flatten()
        };
        if let Some(value) = value {
            match (field.ty, &value) {
                (FieldType::String, Value::Str(s)) => escape_field(s, &mut out),
                (FieldType::Int, Value::Int(v)) => out.extend_from_slice(v.to_string().as_bytes()),
                (FieldType::Double, Value::Double(v)) => {
                    out.extend_from_slice(format!("{v:.6}").as_bytes())
                }
                _ => {} // type mismatch: treat as undefined, matching legacy laxness
            }
        }
    }
    out.push(b'\n');
    out
}

/// Encode a record into `buffer_size` or fewer bytes.
///
/// If `split_index` names a string field whose value contains embedded newlines, one
/// complete record is emitted per source line, all other fields held constant (spec
/// §4.1, "Multi-line split"). If the output would exceed `buffer_size`, the encoder
/// truncates at the last complete record boundary and appends the literal marker
/// `" [...]\n"`; if that marker itself does not fit, encoding fails.
pub fn encode(
    record: &Record,
    buffer_size: usize,
    split_index: Option<usize>,
) -> Result<(Vec<u8>, EncodeOutcome), EncodeError> {
    if let Some(ix) = split_index {
        let field = record
            .protocol
            .fields
            .get(ix)
            .ok_or(EncodeError::SplitIndexOutOfRange { index: ix, count: record.protocol.fields.len() })?;
        if field.ty != FieldType::String {
            return Err(EncodeError::SplitIndexNotString { index: ix });
        }
    }

    let lines: Vec<Option<String>> = match split_index.and_then(|ix| record.values.get(ix)).and_then(|v| v.as_ref()) {
        Some(Value::Str(s)) if s.contains('\n') => {
            s.split('\n').map(|l| Some(l.to_string())).collect()
        }
        _ => vec![None],
    };

    let mut out = Vec::new();
    for line in &lines {
        let rendered = encode_one(record, split_index, line.as_deref());
        if out.len() + rendered.len() > buffer_size {
            return truncate(out, rendered, buffer_size);
        }
        out.extend_from_slice(&rendered);
    }
    Ok((out, EncodeOutcome::Complete))
}

fn truncate(
    good_so_far: Vec<u8>,
    overflowing: Vec<u8>,
    buffer_size: usize,
) -> Result<(Vec<u8>, EncodeOutcome), EncodeError> {
    if buffer_size < TRUNCATE_MARKER.len() {
        return Err(EncodeError::BufferTooSmall);
    }
    // Prefer truncating at the boundary of the last fully-written record.
    if !good_so_far.is_empty() && good_so_far.len() + TRUNCATE_MARKER.len() <= buffer_size {
        let mut out = good_so_far;
        out.extend_from_slice(TRUNCATE_MARKER);
        return Ok((out, EncodeOutcome::Truncated));
    }
    // No prior complete record: cut the overflowing one at the available space.
    let cut = buffer_size - TRUNCATE_MARKER.len();
    if cut == 0 && good_so_far.is_empty() {
        return Err(EncodeError::BufferTooSmall);
    }
    let mut out = good_so_far;
    out.extend_from_slice(&overflowing[..cut.min(overflowing.len())]);
    out.extend_from_slice(TRUNCATE_MARKER);
    Ok((out, EncodeOutcome::Truncated))
}

/// Decode one or more newline-terminated records out of `bytes`.
///
/// Every non-default-protocol record is re-mapped through its conversion table into
/// the default-protocol layout before being returned, so callers only ever see one
/// field ordering (spec §4.1). Numeric fields whose text decodes to `<= 0` are
/// treated as undefined — the legacy sentinel policy documented in spec §9.
pub fn decode(bytes: &[u8]) -> Result<Vec<Record>, DecodeError> {
    let mut records = Vec::new();
    for line in bytes.split(|&b| b == b'\n') {
        if line.is_empty() {
            continue;
        }
        records.push(decode_one(line)?);
    }
    Ok(records)
}

fn decode_one(line: &[u8]) -> Result<Record, DecodeError> {
    if line.first() != Some(&b'*') {
        return Err(DecodeError::MissingMarker);
    }
    let rest = &line[1..];
    let version_end = rest.iter().position(|&b| b == b'#').ok_or(DecodeError::TruncatedVersion)?;
    let version = String::from_utf8_lossy(&rest[..version_end]).into_owned();
    let protocol = find_protocol(&version).ok_or(DecodeError::UnknownVersion { version: version.clone() })?;

    let mut cursor = &rest[version_end + 1..];
    let mut values: Vec<Option<Value>> = Vec::with_capacity(protocol.fields.len());

    for (i, field) in protocol.fields.iter().enumerate() {
        let is_last = i + 1 == protocol.fields.len();
        let raw: &[u8] = if is_last {
            cursor
        } else {
            let end = cursor.iter().position(|&b| b == b'#').ok_or_else(|| DecodeError::TruncatedFields {
                version: version.clone(),
            })?;
            let raw = &cursor[..end];
            cursor = &cursor[end + 1..];
            raw
        };

        let text = String::from_utf8_lossy(raw);
        values.push(decode_field(field.ty, &text));
    }

    let mut record = Record { protocol, values };
    record.convert_to_default();
    Ok(record)
}

fn decode_field(ty: FieldType, text: &str) -> Option<Value> {
    match ty {
        FieldType::String => {
            if text.is_empty() {
                None
            } else {
                Some(Value::Str(text.to_string()))
            }
        }
        FieldType::Int => text
            .parse::<i64>()
            .ok()
            .filter(|v| *v > 0)
            .map(Value::Int),
        FieldType::Double => text
            .parse::<f64>()
            .ok()
            .filter(|v| *v > 0.0)
            .map(Value::Double),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::PROTOCOLS;

    fn sample_record() -> Record {
        let protocol = &PROTOCOLS[0];
        let mut values = vec![None; protocol.fields.len()];
        values[0] = Some(Value::Str("I".into()));
        values[1] = Some(Value::Int(1));
        values[2] = Some(Value::Double(1_700_000_000.0));
        values[3] = Some(Value::Str("h1".into()));
        values[4] = Some(Value::Str("r1".into()));
        values[5] = Some(Value::Int(42));
        values[6] = Some(Value::Str("u".into()));
        values[7] = Some(Value::Str("S".into()));
        values[8] = Some(Value::Str("F".into()));
        values[9] = Some(Value::Str("D".into()));
        values[10] = Some(Value::Str("P".into()));
        values[11] = Some(Value::Int(7));
        values[15] = Some(Value::Str("hello".into()));
        Record { protocol, values }
    }

    #[test]
    fn round_trip_preserves_fields() {
        let record = sample_record();
        let (bytes, outcome) = encode(&record, 4096, None).unwrap();
        assert_eq!(outcome, EncodeOutcome::Complete);
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].field("hostname").unwrap().as_str(), Some("h1"));
        assert_eq!(decoded[0].field("message").unwrap().as_str(), Some("hello"));
        assert_eq!(decoded[0].values[5], Some(Value::Int(42)));
    }

    #[test]
    fn special_characters_become_question_marks() {
        let mut record = sample_record();
        record.values[15] = Some(Value::Str("a*b#c\nd".into()));
        let (bytes, _) = encode(&record, 4096, None).unwrap();
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded[0].field("message").unwrap().as_str(), Some("a?b?c"));
    }

    #[test]
    fn s1_scenario_decodes_sixteen_fields() {
        let line = b"*1.4#I#1#1700000000.0#h1#r1#42#u#S#F#D#P#7#0#0#x#hello\n";
        let decoded = decode(line).unwrap();
        assert_eq!(decoded.len(), 1);
        let r = &decoded[0];
        assert_eq!(r.field("hostname").unwrap().as_str(), Some("h1"));
        // errcode and errline are both 0 -> undefined per legacy sentinel policy
        assert!(r.field("errcode").is_none());
        assert!(r.field("errline").is_none());
        assert_eq!(r.field("message").unwrap().as_str(), Some("hello"));
    }

    #[test]
    fn zero_and_negative_numeric_fields_decode_as_undefined() {
        let line = b"*1.4#I#0#1700000000.0#h#r#-1#u#S#F#D#P#0#0#0#x#m\n";
        let decoded = decode(line).unwrap();
        assert!(decoded[0].field("level").is_none());
        assert!(decoded[0].field("pid").is_none());
    }

    #[test]
    fn unknown_version_is_rejected() {
        let line = b"*9.9#a#b\n";
        assert!(matches!(decode(line), Err(DecodeError::UnknownVersion { .. })));
    }

    #[test]
    fn legacy_1_3_drops_dest_on_convert() {
        let line = b"*1.3#I#1#1700000000.0#h#r#1#u#S#F#D#P#mydest#7#0#0#x#m\n";
        let decoded = decode(line).unwrap();
        assert_eq!(decoded[0].protocol.version, "1.4");
        assert_eq!(decoded[0].field("hostname").unwrap().as_str(), Some("h"));
    }

    #[test]
    fn multi_line_split_yields_one_record_per_line() {
        let mut record = sample_record();
        let split_ix = crate::catalog::find_field("message").unwrap();
        record.values[split_ix] = Some(Value::Str("a\nb\nc".into()));
        let (bytes, outcome) = encode(&record, 4096, Some(split_ix)).unwrap();
        assert_eq!(outcome, EncodeOutcome::Complete);
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded.len(), 3);
        assert_eq!(decoded[0].field("message").unwrap().as_str(), Some("a"));
        assert_eq!(decoded[1].field("message").unwrap().as_str(), Some("b"));
        assert_eq!(decoded[2].field("message").unwrap().as_str(), Some("c"));
        for d in &decoded {
            assert_eq!(d.field("hostname").unwrap().as_str(), Some("h1"));
        }
    }

    #[test]
    fn truncation_appends_marker() {
        let mut record = sample_record();
        record.values[15] = Some(Value::Str("x".repeat(200)));
        let (bytes, outcome) = encode(&record, 64, None).unwrap();
        assert_eq!(outcome, EncodeOutcome::Truncated);
        assert!(bytes.ends_with(b" [...]\n"));
    }

    #[test]
    fn truncation_fails_when_marker_does_not_fit() {
        let record = sample_record();
        let err = encode(&record, 3, None).unwrap_err();
        assert!(matches!(err, EncodeError::BufferTooSmall));
    }
}
