//! Device information provider
//!
//! Builds the static DeviceInfoResponse clients use to discover what this
//! proxy offers. The feature bitfield follows the configuration: scanning
//! and state reporting are always present, the connection-oriented features
//! only when active connections are enabled.

use bleproxy_core::config::ProxyConfig;
use bleproxy_core::message::DeviceInfo;
use bleproxy_core::types::features;

/// API version this daemon speaks
pub const API_VERSION: (u32, u32) = (1, 10);

/// Upstream protocol revision the message catalogue tracks
const PROTOCOL_BASELINE: &str = "2024.12.0";

pub struct DeviceInfoProvider {
    info: DeviceInfo,
    server_info: String,
}

impl DeviceInfoProvider {
    pub fn new(config: &ProxyConfig, bluetooth_mac: String) -> Self {
        let info = DeviceInfo {
            uses_password: config.requires_password(),
            name: config.name.clone(),
            mac_address: bluetooth_mac.clone(),
            esphome_version: PROTOCOL_BASELINE.to_string(),
            compilation_time: String::new(),
            model: "bleproxy".to_string(),
            project_name: "bleproxy.bluetooth-proxy".to_string(),
            project_version: env!("CARGO_PKG_VERSION").to_string(),
            webserver_port: 0,
            manufacturer: "bleproxy".to_string(),
            friendly_name: config.friendly_name.clone(),
            bluetooth_proxy_feature_flags: features::for_config(config.active_connections),
            bluetooth_mac_address: bluetooth_mac,
        };
        let server_info = format!("bleproxy {}", env!("CARGO_PKG_VERSION"));
        Self { info, server_info }
    }

    pub fn device_info(&self) -> DeviceInfo {
        self.info.clone()
    }

    pub fn server_info(&self) -> &str {
        &self.server_info
    }

    pub fn name(&self) -> &str {
        &self.info.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_feature_set_with_active_connections() {
        let config = ProxyConfig::default().with_active_connections(true);
        let provider = DeviceInfoProvider::new(&config, "AA:BB:CC:DD:EE:FF".into());
        let info = provider.device_info();
        assert_eq!(info.bluetooth_proxy_feature_flags, 0x7f);
        assert_eq!(info.bluetooth_mac_address, "AA:BB:CC:DD:EE:FF");
        assert!(!info.uses_password);
    }

    #[test]
    fn passive_only_without_active_connections() {
        let config = ProxyConfig::default().with_active_connections(false);
        let provider = DeviceInfoProvider::new(&config, "AA:BB:CC:DD:EE:FF".into());
        let flags = provider.device_info().bluetooth_proxy_feature_flags;
        assert_eq!(flags & features::ACTIVE_CONNECTIONS, 0);
        assert_ne!(flags & features::PASSIVE_SCAN, 0);
        assert_ne!(flags & features::RAW_ADVERTISEMENTS, 0);
    }

    #[test]
    fn uses_password_mirrors_configuration() {
        let config = ProxyConfig::default().with_password(Some("secret".into()));
        let provider = DeviceInfoProvider::new(&config, String::new());
        assert!(provider.device_info().uses_password);
    }
}
