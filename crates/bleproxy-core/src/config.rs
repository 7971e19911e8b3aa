//! Daemon configuration

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Timeouts
// ----------------------------------------------------------------------------

/// Every deadline the daemon enforces, in one place
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Timeouts {
    /// Maximum time for a peripheral connect attempt
    pub connect: Duration,
    /// Maximum time for a peripheral disconnect to confirm
    pub disconnect: Duration,
    /// Deadline for any single GATT operation
    pub gatt_op: Duration,
    /// Time allowed for a pong before a ping counts as missed
    pub ping: Duration,
    /// Maximum residence of the eldest advertisement before a batch flush
    pub flush_interval: Duration,
    /// Grace period for session outboxes to drain on shutdown
    pub shutdown_grace: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(20),
            disconnect: Duration::from_secs(5),
            gatt_op: Duration::from_secs(30),
            ping: Duration::from_secs(90),
            flush_interval: Duration::from_millis(50),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

// ----------------------------------------------------------------------------
// Proxy Configuration
// ----------------------------------------------------------------------------

/// Top-level daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Address the control server binds to
    pub host: String,
    /// Control port
    pub port: u16,
    /// Device name reported during the handshake
    pub name: String,
    /// Human-readable device name
    pub friendly_name: String,
    /// Optional API password; `None` disables authentication
    pub password: Option<String>,
    /// Maximum simultaneous BLE connections
    pub max_connections: usize,
    /// Advertisements per outbound batch
    pub batch_size: usize,
    /// Whether active GATT connections are offered to clients
    pub active_connections: bool,
    /// Directory for the service cache and bond records; `None` disables
    /// persistence
    pub cache_dir: Option<PathBuf>,
    /// Per-session outbox depth in frames
    pub outbox_capacity: usize,
    pub timeouts: Timeouts,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 6053,
            name: "bluetooth-proxy".to_string(),
            friendly_name: "Bluetooth Proxy".to_string(),
            password: None,
            max_connections: 3,
            batch_size: 16,
            active_connections: true,
            cache_dir: None,
            outbox_capacity: 64,
            timeouts: Timeouts::default(),
        }
    }
}

impl ProxyConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the bind address
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set the control port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the device name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the human-readable device name
    pub fn with_friendly_name(mut self, name: impl Into<String>) -> Self {
        self.friendly_name = name.into();
        self
    }

    /// Set the API password
    pub fn with_password(mut self, password: Option<String>) -> Self {
        self.password = password;
        self
    }

    /// Set the BLE connection cap
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set the advertisement batch size
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    /// Enable or disable active connections
    pub fn with_active_connections(mut self, enabled: bool) -> Self {
        self.active_connections = enabled;
        self
    }

    /// Set the persistence directory
    pub fn with_cache_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.cache_dir = dir;
        self
    }

    /// True when clients must authenticate before BLE operations
    pub fn requires_password(&self) -> bool {
        self.password.as_deref().is_some_and(|p| !p.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_daemon_documentation() {
        let config = ProxyConfig::default();
        assert_eq!(config.port, 6053);
        assert_eq!(config.max_connections, 3);
        assert_eq!(config.batch_size, 16);
        assert_eq!(config.timeouts.flush_interval, Duration::from_millis(50));
        assert!(!config.requires_password());
    }

    #[test]
    fn empty_password_does_not_require_auth() {
        let config = ProxyConfig::default().with_password(Some(String::new()));
        assert!(!config.requires_password());
        let config = ProxyConfig::default().with_password(Some("secret".into()));
        assert!(config.requires_password());
    }

    #[test]
    fn batch_size_floor_is_one() {
        let config = ProxyConfig::default().with_batch_size(0);
        assert_eq!(config.batch_size, 1);
    }
}
