//! Line-oriented control protocol spoken over the transport TCP connection,
//! matching `examples/original_source/src/transport_client.c`'s state machine
//! byte for byte: one command per `\n`-terminated ASCII line, file payloads
//! framed between a `File` header line and a bare `END` line.

/// Proxy capability a client advertises in its `INI` line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    CanBeProxy,
    CanNotBeProxy,
    IsProxy,
}

impl ProxyState {
    fn as_code(self) -> u8 {
        match self {
            ProxyState::CanBeProxy => 1,
            ProxyState::CanNotBeProxy => 2,
            ProxyState::IsProxy => 3,
        }
    }
}

/// `INI <client_name> <proxy_state>\n`, the first line a client sends.
pub fn ini_line(client_name: &str, proxy_state: ProxyState) -> String {
    format!("INI {} {}\n", client_name, proxy_state.as_code())
}

/// `File <source> <min_id> <maj_id> <size>\n`, opening a file transfer.
pub fn file_header_line(source: &str, min_id: u64, maj_id: u64, size: usize) -> String {
    format!("File {} {} {} {}\n", source, min_id, maj_id, size)
}

pub const END_LINE: &str = "END\n";

/// `ACK <min_id> <maj_id>\n`, argument order matches the original's
/// `sscanf(..., "%d %d", &min_id, &maj_id)`.
pub fn ack_line(min_id: u64, maj_id: u64) -> String {
    format!("ACK {} {}\n", min_id, maj_id)
}

pub const CLOSE_LINE: &str = "CLOSE\n";

/// A line received by the client from the server during the handshake or
/// steady-state phases.
#[derive(Debug, Clone, PartialEq)]
pub enum FromServer {
    Ready,
    NodeId(i64),
    BeProxy { name: String, port: u16 },
    UseProxy { name: String, port: u16 },
    Ack { min_id: u64, maj_id: u64 },
    Close,
}

pub fn parse_from_server(line: &str) -> Option<FromServer> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line == "READY" {
        return Some(FromServer::Ready);
    }
    if let Some(rest) = line.strip_prefix("NODE_ID") {
        return rest.trim().parse().ok().map(FromServer::NodeId);
    }
    if let Some(rest) = line.strip_prefix("BE_PROXY") {
        let (name, port) = parse_name_port(rest)?;
        return Some(FromServer::BeProxy { name, port });
    }
    if let Some(rest) = line.strip_prefix("USE_PROXY") {
        let (name, port) = parse_name_port(rest)?;
        return Some(FromServer::UseProxy { name, port });
    }
    if let Some(rest) = line.strip_prefix("ACK ") {
        let mut parts = rest.split_whitespace();
        let min_id = parts.next()?.parse().ok()?;
        let maj_id = parts.next()?.parse().ok()?;
        return Some(FromServer::Ack { min_id, maj_id });
    }
    if line.starts_with("CLOSE") {
        return Some(FromServer::Close);
    }
    None
}

fn parse_name_port(rest: &str) -> Option<(String, u16)> {
    let rest = rest.trim();
    let (name, port) = rest.rsplit_once(char::is_whitespace)?;
    Some((name.trim().to_string(), port.trim().parse().ok()?))
}

/// The header line a client sees at the start of a file transfer on the
/// server side.
#[derive(Debug, Clone, PartialEq)]
pub struct FileHeader {
    pub source: String,
    pub min_id: u64,
    pub maj_id: u64,
    pub size: usize,
}

/// `INI <client_name> <proxy_state>\n`, parsed on the server side.
pub fn parse_ini(line: &str) -> Option<(String, u8)> {
    let rest = line.trim_end_matches(['\r', '\n']).strip_prefix("INI ")?;
    let (name, state) = rest.rsplit_once(char::is_whitespace)?;
    Some((name.trim().to_string(), state.trim().parse().ok()?))
}

pub const READY_LINE: &str = "READY\n";

pub fn node_id_line(id: i64) -> String {
    format!("NODE_ID {}\n", id)
}

pub fn parse_file_header(line: &str) -> Option<FileHeader> {
    let rest = line.trim_end_matches(['\r', '\n']).strip_prefix("File ")?;
    let mut parts = rest.split_whitespace();
    let source = parts.next()?.to_string();
    let min_id = parts.next()?.parse().ok()?;
    let maj_id = parts.next()?.parse().ok()?;
    let size = parts.next()?.parse().ok()?;
    Some(FileHeader { source, min_id, maj_id, size })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ini_line_matches_wire_format() {
        assert_eq!(ini_line("daq01", ProxyState::CanBeProxy), "INI daq01 1\n");
    }

    #[test]
    fn ack_argument_order_is_min_then_maj() {
        assert_eq!(parse_from_server("ACK 3 1"), Some(FromServer::Ack { min_id: 3, maj_id: 1 }));
        assert_eq!(ack_line(3, 1), "ACK 3 1\n");
    }

    #[test]
    fn close_is_recognized_with_trailing_garbage() {
        assert_eq!(parse_from_server("CLOSE"), Some(FromServer::Close));
    }

    #[test]
    fn be_proxy_parses_name_and_port() {
        assert_eq!(
            parse_from_server("BE_PROXY host.example.org 8892"),
            Some(FromServer::BeProxy { name: "host.example.org".into(), port: 8892 })
        );
    }

    #[test]
    fn use_proxy_parses_name_and_port() {
        assert_eq!(
            parse_from_server("USE_PROXY proxy.example.org 8893"),
            Some(FromServer::UseProxy { name: "proxy.example.org".into(), port: 8893 })
        );
    }

    #[test]
    fn file_header_round_trips() {
        let line = file_header_line("host01", 5, 1, 128);
        assert_eq!(parse_file_header(&line), Some(FileHeader { source: "host01".into(), min_id: 5, maj_id: 1, size: 128 }));
    }

    #[test]
    fn ini_round_trips() {
        assert_eq!(parse_ini("INI daq01 2\n"), Some(("daq01".to_string(), 2)));
    }

    #[test]
    fn node_id_parses() {
        assert_eq!(parse_from_server("NODE_ID 42"), Some(FromServer::NodeId(42)));
    }

    #[test]
    fn unrecognized_line_is_none() {
        assert_eq!(parse_from_server("GARBAGE"), None);
    }
}
