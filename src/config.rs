//! Configuration surface for both binaries, per spec §6: a TOML file loaded
//! with `serde`, overlaid with CLI flags and `IL_`-prefixed environment
//! variables for secrets. Every field has a compiled-in default matching
//! `examples/original_source/src/infoLoggerDefaults.h`.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use snafu::{ResultExt, Snafu};

#[derive(Debug, Snafu)]
pub enum ConfigError {
    #[snafu(display("could not read config file {}: {source}", path.display()))]
    Read { path: PathBuf, source: std::io::Error },
    #[snafu(display("could not parse config file {}: {source}", path.display()))]
    Parse { path: PathBuf, source: toml::de::Error },
}

/// Top-level config file shape: both binaries share one file so a single
/// deployment can ship one `/etc/infoLogger.cfg`-equivalent, matching the
/// original's single `ConfigInfoLoggerServer`-style ini file.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    #[serde(rename = "infoLoggerServer")]
    pub server: ServerConfig,
    #[serde(rename = "infoLoggerD")]
    pub collector: CollectorConfig,
    #[serde(default)]
    pub proxy: ProxyOptInConfig,
}

impl Config {
    /// Loads and parses `path`, falling back to compiled-in defaults for
    /// anything the file omits (`#[serde(default)]` on every field below).
    pub fn load(path: &Path) -> Result<Config, ConfigError> {
        let text = std::fs::read_to_string(path).context(ReadSnafu { path: path.to_path_buf() })?;
        toml::from_str(&text).context(ParseSnafu { path: path.to_path_buf() })
    }
}

fn default_server_port_rx() -> u16 {
    6006
}
fn default_server_port_tx() -> u16 {
    6102
}
fn default_stats_port() -> u16 {
    6007
}
fn default_max_clients() -> usize {
    2000
}
fn default_queue_length() -> usize {
    5000
}
fn default_db_n_threads() -> usize {
    1
}
fn default_db_dispatch_queue_size() -> usize {
    1000
}
fn default_stats_publish_interval_s() -> u64 {
    5
}
fn default_stats_reset_interval_s() -> u64 {
    30
}
fn default_stats_history_s() -> u64 {
    600
}
fn default_local_socket() -> String {
    "infoLoggerD".to_string()
}
fn default_rx_buffer_size() -> usize {
    64 * 1024
}
fn default_server_host() -> String {
    "localhost".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ServerConfig {
    pub server_port_rx: u16,
    pub max_clients_rx: usize,
    pub msg_queue_length_rx: usize,

    pub db_enabled: bool,
    pub db_host: String,
    pub db_user: String,
    /// Overridden by the `IL_DB_PASSWORD` environment variable, never stored
    /// in the config file in a real deployment.
    pub db_password: String,
    pub db_name: String,
    pub db_n_threads: usize,
    pub db_dispatch_queue_size: usize,

    pub server_port_tx: u16,
    pub max_clients_tx: usize,

    pub stats_port: u16,
    pub stats_max_clients: usize,
    pub stats_publish_interval_s: u64,
    pub stats_reset_interval_s: u64,
    pub stats_history_s: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            server_port_rx: default_server_port_rx(),
            max_clients_rx: default_max_clients(),
            msg_queue_length_rx: default_queue_length(),
            db_enabled: false,
            db_host: default_server_host(),
            db_user: "infologger".to_string(),
            db_password: String::new(),
            db_name: "infologger".to_string(),
            db_n_threads: default_db_n_threads(),
            db_dispatch_queue_size: default_db_dispatch_queue_size(),
            server_port_tx: default_server_port_tx(),
            max_clients_tx: default_max_clients(),
            stats_port: default_stats_port(),
            stats_max_clients: default_max_clients(),
            stats_publish_interval_s: default_stats_publish_interval_s(),
            stats_reset_interval_s: default_stats_reset_interval_s(),
            stats_history_s: default_stats_history_s(),
        }
    }
}

impl ServerConfig {
    /// Applies the `IL_DB_PASSWORD` environment override, matching the
    /// secrets-via-env policy in SPEC_FULL.md §6.
    pub fn apply_env(&mut self) {
        if let Ok(password) = std::env::var("IL_DB_PASSWORD") {
            self.db_password = password;
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CollectorConfig {
    pub rx_socket_path: String,
    pub rx_socket_in_buffer_size: usize,
    pub rx_max_connections: usize,
    pub server_host: String,
    pub server_port: u16,
    pub client_name: String,
    pub queue_length: usize,
    pub msg_queue_path: Option<PathBuf>,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        CollectorConfig {
            rx_socket_path: default_local_socket(),
            rx_socket_in_buffer_size: default_rx_buffer_size(),
            rx_max_connections: default_max_clients(),
            server_host: default_server_host(),
            server_port: default_server_port_rx(),
            client_name: hostname_or_default(),
            queue_length: default_queue_length(),
            msg_queue_path: None,
        }
    }
}

fn hostname_or_default() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "infologgerd".to_string())
}

/// §9 open question: `BE_PROXY`/`USE_PROXY` are fully wired but gated behind
/// this flag until they have been integration-verified against a real proxy
/// deployment.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxyOptInConfig {
    pub enabled: bool,
}

impl Default for ProxyOptInConfig {
    fn default() -> Self {
        ProxyOptInConfig { enabled: false }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_original_ports() {
        let config = ServerConfig::default();
        assert_eq!(config.server_port_rx, 6006);
        assert_eq!(config.server_port_tx, 6102);
    }

    #[test]
    fn empty_toml_uses_all_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.server_port_rx, 6006);
        assert_eq!(config.collector.rx_socket_path, "infoLoggerD");
    }

    #[test]
    fn partial_section_keeps_other_defaults() {
        let config: Config = toml::from_str(
            r#"
            [infoLoggerServer]
            serverPortRx = 9999
            "#,
        )
        .unwrap();
        assert_eq!(config.server.server_port_rx, 9999);
        assert_eq!(config.server.stats_port, 6007);
    }
}
