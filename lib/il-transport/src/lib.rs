//! Store-and-forward TCP transport between a collector and the central
//! server: a durable client ([`client::TransportClient`]) that never drops an
//! enqueued file until the server acks it, a framing server
//! ([`server::TransportServer`]) that reassembles files off the wire, and
//! transparent proxy chaining ([`proxy`]) for fanning a large client
//! population through relays. Modeled on
//! `examples/original_source/src/transport_client.c`,
//! `transport_server.h`/`infoLoggerServer.cxx`, and `transport_proxy.c`.

#![deny(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod client;
pub mod file;
pub mod proxy;
pub mod server;
pub mod wire;

pub use client::{ClientConfig, ClientError, TransportClient};
pub use file::{FileId, TransportFile};
pub use proxy::{ProxyConfig, ProxyError};
pub use server::{ReceivedFile, ServerConfig, ServerError, TransportServer};
