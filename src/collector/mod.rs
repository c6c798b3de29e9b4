//! Per-host collector daemon (spec §4.5): accepts local clients on a stream
//! socket, accumulates newline-delimited already-encoded records per client,
//! and forwards each complete line into the transport client's durable
//! message FIFO via [`il_transport::TransportClient::enqueue_message`].
//!
//! A socket path starting with `/` binds as a normal filesystem path; any
//! other path binds in the Linux abstract namespace (leading NUL byte, never
//! visible on disk), matching `infoLoggerDefaults.h`'s bare `"infoLoggerD"`
//! default name.

use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::BytesMut;
use il_transport::TransportClient;
use snafu::{ResultExt, Snafu};
use socket2::{Domain, Socket, Type};
use tokio::io::AsyncReadExt;
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;

use crate::config::CollectorConfig;

#[derive(Debug, Snafu)]
pub enum CollectorError {
    #[snafu(display("could not create the local listen socket: {source}"))]
    CreateSocket { source: std::io::Error },
    #[snafu(display("could not bind local socket {path:?}: {source}"))]
    Bind { path: String, source: std::io::Error },
    #[snafu(display("could not listen on local socket {path:?}: {source}"))]
    Listen { path: String, source: std::io::Error },
}

/// Runs the accept loop until `cancel` fires. Each accepted connection is
/// handled on its own task; SPEC_FULL.md accepts per-client tasks over a
/// single-threaded select loop for this fan-out (local clients, not the
/// thousands the transport server sees).
pub async fn run(config: CollectorConfig, client: Arc<TransportClient>, cancel: CancellationToken) -> Result<(), CollectorError> {
    let listener = bind(&config.rx_socket_path)?;
    let active = Arc::new(AtomicUsize::new(0));
    let buffer_size = config.rx_socket_in_buffer_size;

    loop {
        let (stream, _) = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => match accepted {
                Ok(a) => a,
                Err(e) => {
                    tracing::warn!(error = %e, "collector accept failed");
                    continue;
                }
            },
        };

        if active.load(Ordering::Relaxed) >= config.rx_max_connections {
            tracing::warn!(limit = config.rx_max_connections, "collector at capacity, closing new connection");
            drop(stream);
            continue;
        }
        active.fetch_add(1, Ordering::Relaxed);

        let active = active.clone();
        let client = client.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_client(stream, buffer_size, &client).await {
                tracing::debug!(error = %e, "collector client connection ended");
            }
            active.fetch_sub(1, Ordering::Relaxed);
        });
    }
}

async fn handle_client(mut stream: UnixStream, buffer_size: usize, client: &TransportClient) -> std::io::Result<()> {
    let mut accumulator = BytesMut::with_capacity(buffer_size.max(256));
    let mut read_buf = vec![0u8; buffer_size.max(4096)];

    loop {
        let n = stream.read(&mut read_buf).await?;
        if n == 0 {
            if !accumulator.is_empty() {
                tracing::warn!(bytes = accumulator.len(), "collector dropping partial line at EOF");
            }
            return Ok(());
        }
        accumulator.extend_from_slice(&read_buf[..n]);

        while let Some(pos) = accumulator.iter().position(|&b| b == b'\n') {
            let line = accumulator.split_to(pos + 1);
            let record = line.freeze().slice(..pos);
            if let Err(e) = client.enqueue_message(record).await {
                tracing::warn!(error = %e, "could not enqueue collected record");
            }
        }
    }
}

fn bind(path: &str) -> Result<UnixListener, CollectorError> {
    if let Some(stripped) = path.strip_prefix('/') {
        let full = format!("/{stripped}");
        let _ = std::fs::remove_file(&full);
        return UnixListener::bind(&full).context(BindSnafu { path: full });
    }

    let socket = Socket::new(Domain::UNIX, Type::STREAM, None).context(CreateSocketSnafu)?;
    socket.set_nonblocking(true).context(CreateSocketSnafu)?;
    bind_abstract(&socket, path).context(BindSnafu { path: path.to_string() })?;
    socket.listen(1024).context(ListenSnafu { path: path.to_string() })?;

    let raw = socket.into_raw_fd();
    // SAFETY: `raw` was just taken from a `Socket` we own exclusively, and is
    // handed to `UnixListener` which becomes its sole owner from here on.
    let std_listener = unsafe { std::os::unix::net::UnixListener::from_raw_fd(raw) };
    std_listener.set_nonblocking(true).context(CreateSocketSnafu)?;
    UnixListener::from_std(std_listener).context(ListenSnafu { path: path.to_string() })
}

/// Binds `socket` to the abstract-namespace name `name` (no leading `/`):
/// `sun_path` starts with a NUL byte followed by the name bytes, and the
/// address length covers exactly those bytes (no NUL terminator), which is
/// what the kernel treats as "abstract" rather than "filesystem".
fn bind_abstract(socket: &Socket, name: &str) -> std::io::Result<()> {
    let name_bytes = name.as_bytes();
    let max_len = unsafe { std::mem::size_of::<libc::sockaddr_un>() } - std::mem::size_of::<libc::sa_family_t>() - 1;
    if name_bytes.len() > max_len {
        return Err(std::io::Error::new(std::io::ErrorKind::InvalidInput, "abstract socket name too long"));
    }

    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    // addr.sun_path[0] stays 0, marking this as an abstract address.
    for (i, &b) in name_bytes.iter().enumerate() {
        addr.sun_path[i + 1] = b as libc::c_char;
    }
    let len = (std::mem::size_of::<libc::sa_family_t>() + 1 + name_bytes.len()) as libc::socklen_t;

    let ret = unsafe { libc::bind(socket.as_raw_fd(), (&addr as *const libc::sockaddr_un).cast(), len) };
    if ret == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}
