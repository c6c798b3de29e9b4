//! Central server entry point: the transport server, the dispatch hub, and
//! the three consumers (spec §4.4/§4.6/§4.7), all wired together and torn
//! down on SIGINT/SIGTERM.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use infologger::cli::Cli;
use infologger::config::Config;
use infologger::consumers::broadcast::Broadcaster;
use infologger::consumers::db::DbWorker;
use infologger::consumers::stats::StatsAggregator;
use infologger::hub::Hub;
use infologger::signal;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let cli = Cli::parse();
    tracing_subscriber::fmt().with_env_filter(cli.tracing_filter()).init();

    let mut config = match Config::load(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "could not load configuration");
            return std::process::ExitCode::FAILURE;
        }
    };
    config.server.apply_env();

    let cancel = CancellationToken::new();
    signal::install(cancel.clone());

    let transport_server = match il_transport::TransportServer::start(il_transport::ServerConfig {
        bind_port: config.server.server_port_rx,
        queue_capacity: config.server.msg_queue_length_rx,
    })
    .await
    {
        Ok(server) => Arc::new(server),
        Err(e) => {
            tracing::error!(error = %e, "could not start transport server");
            return std::process::ExitCode::FAILURE;
        }
    };

    let mut hub = Hub::new(transport_server.clone());
    let broadcast_rx = hub.add_consumer("broadcast", config.server.max_clients_tx.max(1) * 4);
    let stats_rx = hub.add_consumer("stats", 64);

    let mut tasks = Vec::new();

    if config.server.db_enabled {
        for index in 0..config.server.db_n_threads.max(1) {
            let rx = hub.add_db_worker(config.server.db_dispatch_queue_size);
            let worker = DbWorker::new(index, &config.server, rx);
            tasks.push(tokio::spawn(worker.run(cancel.clone())));
        }
    } else {
        tracing::info!("db consumer disabled (infoLoggerServer.dbEnabled = false)");
    }

    let hub = Arc::new(hub);
    tasks.push(tokio::spawn(hub.clone().run(cancel.clone())));

    match Broadcaster::bind(config.server.server_port_tx, config.server.max_clients_tx, broadcast_rx).await {
        Ok(broadcaster) => tasks.push(tokio::spawn(broadcaster.run(cancel.clone()))),
        Err(e) => tracing::error!(error = %e, port = config.server.server_port_tx, "could not bind broadcast port"),
    }

    let stats = StatsAggregator::bind(
        config.server.stats_port,
        config.server.stats_max_clients,
        stats_rx,
        Duration::from_secs(config.server.stats_reset_interval_s),
        Duration::from_secs(config.server.stats_publish_interval_s),
        Duration::from_secs(config.server.stats_history_s),
    )
    .await;
    match stats {
        Ok(stats) => tasks.push(tokio::spawn(stats.run(cancel.clone()))),
        Err(e) => tracing::error!(error = %e, port = config.server.stats_port, "could not bind stats port"),
    }

    tracing::info!(
        rx_port = config.server.server_port_rx,
        tx_port = config.server.server_port_tx,
        stats_port = config.server.stats_port,
        "infologger-server started"
    );

    cancel.cancelled().await;
    tracing::info!("shutdown requested, draining transport connections");
    transport_server.stop().await;
    tracing::info!("waiting for tasks to finish");
    for task in tasks {
        let _ = task.await;
    }

    std::process::ExitCode::SUCCESS
}
