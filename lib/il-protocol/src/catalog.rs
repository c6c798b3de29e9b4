//! Static field catalog and protocol table.
//!
//! Grounded on `examples/original_source/src/infoLoggerMessage.c`: the array of
//! protocols is a static table built once and never mutated afterward (spec §9,
//! "Static mutable catalogs → initialized-once tables"). The conversion-index table
//! (`Protocol::convert_index`) is computed the first time [`PROTOCOLS`] is forced.

use std::sync::LazyLock;

/// The semantic type of a field value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    Int,
    Double,
}

/// One field definition within a protocol.
#[derive(Debug, Clone, Copy)]
pub struct FieldDef {
    pub name: &'static str,
    pub ty: FieldType,
}

const fn f(name: &'static str, ty: FieldType) -> FieldDef {
    FieldDef { name, ty }
}

/// A versioned, ordered field list, plus (once initialized) the table converting
/// each field index into the default protocol's index, or `None` if the default
/// protocol has no field of the same name and type.
#[derive(Debug)]
pub struct Protocol {
    pub version: &'static str,
    pub fields: &'static [FieldDef],
    pub convert_index: Vec<Option<usize>>,
}

impl Protocol {
    pub fn is_default(&self) -> bool {
        self.version == PROTOCOLS[0].version
    }
}

/// Field order for the default protocol, `1.4`. `message` MUST be last and MUST be
/// string, per spec §3 — enforced by [`validate`] below.
const V1_4: &[FieldDef] = &[
    f("severity", FieldType::String),
    f("level", FieldType::Int),
    f("timestamp", FieldType::Double),
    f("hostname", FieldType::String),
    f("rolename", FieldType::String),
    f("pid", FieldType::Int),
    f("username", FieldType::String),
    f("system", FieldType::String),
    f("facility", FieldType::String),
    f("detector", FieldType::String),
    f("partition", FieldType::String),
    f("run", FieldType::Int),
    f("errcode", FieldType::Int),
    f("errline", FieldType::Int),
    f("errsource", FieldType::String),
    f("message", FieldType::String),
];

/// Legacy protocol `1.3` (17 fields) — carries a `dest` field with no `1.4` counterpart.
const V1_3: &[FieldDef] = &[
    f("severity", FieldType::String),
    f("level", FieldType::Int),
    f("timestamp", FieldType::Double),
    f("hostname", FieldType::String),
    f("rolename", FieldType::String),
    f("pid", FieldType::Int),
    f("username", FieldType::String),
    f("system", FieldType::String),
    f("facility", FieldType::String),
    f("detector", FieldType::String),
    f("partition", FieldType::String),
    f("dest", FieldType::String),
    f("run", FieldType::Int),
    f("errcode", FieldType::Int),
    f("errline", FieldType::Int),
    f("errsource", FieldType::String),
    f("message", FieldType::String),
];

/// Legacy protocol `1.2` (11 fields).
const V1_2: &[FieldDef] = &[
    f("severity", FieldType::String),
    f("timestamp", FieldType::Double),
    f("hostname", FieldType::String),
    f("rolename", FieldType::String),
    f("pid", FieldType::Int),
    f("username", FieldType::String),
    f("system", FieldType::String),
    f("facility", FieldType::String),
    f("dest", FieldType::String),
    f("run", FieldType::Int),
    f("message", FieldType::String),
];

fn build_protocols() -> Vec<Protocol> {
    let mut protocols: Vec<Protocol> = vec![
        Protocol { version: "1.4", fields: V1_4, convert_index: Vec::new() },
        Protocol { version: "1.3", fields: V1_3, convert_index: Vec::new() },
        Protocol { version: "1.2", fields: V1_2, convert_index: Vec::new() },
    ];

    for p in &protocols {
        validate(p);
    }

    let default_fields = protocols[0].fields;
    for p in &mut protocols {
        p.convert_index = p
            .fields
            .iter()
            .map(|field| {
                default_fields
                    .iter()
                    .position(|d| d.name == field.name && d.ty == field.ty)
            })
            .collect();
    }

    protocols
}

fn validate(p: &Protocol) {
    assert!(!p.fields.is_empty(), "protocol {} has no fields", p.version);
    let last = p.fields.last().expect("checked non-empty above");
    assert_eq!(last.name, "message", "protocol {} message field must be last", p.version);
    assert_eq!(last.ty, FieldType::String, "protocol {} message field must be string", p.version);
}

/// The installed protocols. `PROTOCOLS[0]` is the default protocol.
pub static PROTOCOLS: LazyLock<Vec<Protocol>> = LazyLock::new(build_protocols);

/// Resolve a default-protocol field name to its stable index.
pub fn find_field(name: &str) -> Option<usize> {
    PROTOCOLS[0].fields.iter().position(|field| field.name == name)
}

/// Look up an installed protocol by its version string.
pub fn find_protocol(version: &str) -> Option<&'static Protocol> {
    PROTOCOLS.iter().find(|p| p.version == version)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_protocol_is_1_4() {
        assert_eq!(PROTOCOLS[0].version, "1.4");
        assert_eq!(PROTOCOLS[0].fields.len(), 16);
    }

    #[test]
    fn legacy_protocols_are_accepted() {
        assert!(find_protocol("1.3").is_some());
        assert!(find_protocol("1.2").is_some());
        assert!(find_protocol("9.9").is_none());
    }

    #[test]
    fn dest_field_drops_on_conversion() {
        let p13 = find_protocol("1.3").unwrap();
        let dest_ix = p13.fields.iter().position(|f| f.name == "dest").unwrap();
        assert_eq!(p13.convert_index[dest_ix], None);
    }

    #[test]
    fn find_field_resolves_stable_indices() {
        assert_eq!(find_field("severity"), Some(0));
        assert_eq!(find_field("message"), Some(15));
        assert_eq!(find_field("no-such-field"), None);
    }
}
