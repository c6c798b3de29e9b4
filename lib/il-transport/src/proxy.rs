//! Proxy chaining: a client told `BE_PROXY` by the server becomes a transparent
//! TCP relay other clients can be redirected to via `USE_PROXY`, so a cluster
//! can fan a large client population through a handful of relays instead of
//! all connecting to the root server directly. Matches
//! `examples/original_source/src/transport_proxy.c`, simplified from a
//! protocol-aware relay to a byte-transparent one: the wire format only ever
//! needs straight-through forwarding, never inspection, at the proxy hop.

use snafu::{ResultExt, Snafu};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Snafu)]
pub enum ProxyError {
    #[snafu(display("proxy could not bind 0.0.0.0:{port}: {source}"))]
    Bind { port: u16, source: std::io::Error },
    #[snafu(display("proxy accept failed: {source}"))]
    Accept { source: std::io::Error },
}

pub struct ProxyConfig {
    /// Port this proxy listens on for relayed clients.
    pub bind_port: u16,
    /// The root server this proxy forwards connections to.
    pub upstream_name: String,
    pub upstream_port: u16,
}

/// Runs the proxy relay until `cancel` fires. Each accepted connection gets
/// its own upstream connection and a bidirectional byte copy; a failure on
/// one connection never affects the others.
pub async fn run(config: ProxyConfig, cancel: CancellationToken) -> Result<(), ProxyError> {
    let listener = TcpListener::bind(("0.0.0.0", config.bind_port)).await.context(BindSnafu { port: config.bind_port })?;
    tracing::info!(port = config.bind_port, upstream = %config.upstream_name, "transport proxy listening");

    loop {
        let (downstream, peer) = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted.context(AcceptSnafu)?,
        };
        let upstream_name = config.upstream_name.clone();
        let upstream_port = config.upstream_port;
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = relay_one(downstream, &upstream_name, upstream_port, cancel).await {
                tracing::warn!(%peer, error = %e, "transport proxy connection ended");
            }
        });
    }
}

async fn relay_one(
    mut downstream: TcpStream,
    upstream_name: &str,
    upstream_port: u16,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let mut upstream = TcpStream::connect((upstream_name, upstream_port)).await?;
    tokio::select! {
        _ = cancel.cancelled() => Ok(()),
        res = tokio::io::copy_bidirectional(&mut downstream, &mut upstream) => {
            res.map(|_| ())
        }
    }
}
