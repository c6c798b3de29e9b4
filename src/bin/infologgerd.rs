//! Per-host collector daemon entry point: accepts local emitters, durably
//! queues their records, and ships them to the central server over the
//! transport client (spec §4.3/§4.5).

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use infologger::cli::Cli;
use infologger::config::Config;
use infologger::{collector, signal};
use tokio_util::sync::CancellationToken;

const DEFAULT_FIFO_BASE: &str = "/var/lib/infoLogger/infoLoggerD";

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let cli = Cli::parse();
    tracing_subscriber::fmt().with_env_filter(cli.tracing_filter()).init();

    let config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "could not load configuration");
            return std::process::ExitCode::FAILURE;
        }
    };

    let fifo_base = config.collector.msg_queue_path.clone().unwrap_or_else(|| PathBuf::from(DEFAULT_FIFO_BASE));
    let fifo = match il_fifo::PermanentFifo::open(&fifo_base, 1024).await {
        Ok(fifo) => Arc::new(fifo),
        Err(e) => {
            tracing::error!(error = %e, base = %fifo_base.display(), "could not open persistent FIFO");
            return std::process::ExitCode::FAILURE;
        }
    };

    let mut client_config = il_transport::ClientConfig::new(config.collector.server_host.clone(), config.collector.server_port, config.collector.client_name.clone())
        .with_message_fifo(fifo.clone());
    client_config.can_be_proxy = config.proxy.enabled;
    let client = Arc::new(il_transport::TransportClient::start(client_config));

    let cancel = CancellationToken::new();
    signal::install(cancel.clone());

    tracing::info!(socket = %config.collector.rx_socket_path, server = %config.collector.server_host, port = config.collector.server_port, "infologgerd starting");

    let result = collector::run(config.collector, client.clone(), cancel).await;
    client.stop().await;

    match result {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "collector daemon exited with an error");
            std::process::ExitCode::FAILURE
        }
    }
}
