//! Command-line interface definitions and parsing

use std::path::PathBuf;

use clap::Parser;

use bleproxy_core::config::ProxyConfig;

#[derive(Parser, Debug)]
#[command(name = "bleproxy", author, version, about = "Bluetooth-LE proxy daemon speaking the ESPHome native API", long_about = None)]
pub struct Cli {
    /// Host address to bind to
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    /// Control port to listen on
    #[arg(long, default_value_t = 6053)]
    pub port: u16,

    /// Device name reported to clients
    #[arg(long, default_value = "bluetooth-proxy")]
    pub name: String,

    /// Human-readable device name
    #[arg(long, default_value = "Bluetooth Proxy")]
    pub friendly_name: String,

    /// API password; omit to disable authentication
    #[arg(long)]
    pub password: Option<String>,

    /// Maximum concurrent BLE connections
    #[arg(long, default_value_t = 3)]
    pub max_connections: usize,

    /// Advertisements per outbound batch
    #[arg(long, default_value_t = 16)]
    pub advertisement_batch_size: usize,

    /// Enable active BLE connections (the default)
    #[arg(long, overrides_with = "no_active_connections")]
    pub active_connections: bool,

    /// Disable active BLE connections (passive scanning only)
    #[arg(long)]
    pub no_active_connections: bool,

    /// Directory for the service cache and bond records
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Log file path; logs to stderr when omitted
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

impl Cli {
    pub fn to_config(&self) -> ProxyConfig {
        ProxyConfig::default()
            .with_host(self.host.clone())
            .with_port(self.port)
            .with_name(self.name.clone())
            .with_password(self.password.clone())
            .with_max_connections(self.max_connections)
            .with_batch_size(self.advertisement_batch_size)
            .with_active_connections(self.active_connections || !self.no_active_connections)
            .with_cache_dir(self.cache_dir.clone())
            .with_friendly_name(self.friendly_name.clone())
    }
}
