//! Shared data model: addresses, advertisements, the GATT tree

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DecodeError;

/// Upper bound on raw advertisement payload (31 adv + 31 scan response)
pub const MAX_ADV_DATA_LEN: usize = 62;

// ----------------------------------------------------------------------------
// Peripheral Addresses
// ----------------------------------------------------------------------------

/// BLE address type flag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddressType {
    Public,
    Random,
}

impl AddressType {
    pub fn from_wire(value: u64) -> Self {
        if value == 0 {
            AddressType::Public
        } else {
            AddressType::Random
        }
    }

    pub fn to_wire(self) -> u64 {
        match self {
            AddressType::Public => 0,
            AddressType::Random => 1,
        }
    }
}

/// A peripheral identity: 48-bit address plus address-type flag.
///
/// The 48-bit value alone keys the connection pool; the pair is the full
/// identity carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceAddress {
    address: u64,
    address_type: AddressType,
}

impl DeviceAddress {
    pub fn new(address: u64, address_type: AddressType) -> Self {
        // Upper 16 bits are zero on the wire by construction.
        Self {
            address: address & 0x0000_ffff_ffff_ffff,
            address_type,
        }
    }

    /// Pool key: the bare 48-bit value
    pub fn key(&self) -> u64 {
        self.address
    }

    pub fn address_type(&self) -> AddressType {
        self.address_type
    }

    /// Lower-case hex without separators, used for cache file names
    pub fn hex_key(&self) -> String {
        format!("{:012x}", self.address)
    }

    /// Parse `AA:BB:CC:DD:EE:FF` into the 48-bit value
    pub fn parse_mac(mac: &str) -> Option<u64> {
        let mut value: u64 = 0;
        let mut octets = 0;
        for part in mac.split(':') {
            value = (value << 8) | u64::from(u8::from_str_radix(part, 16).ok()?);
            octets += 1;
        }
        (octets == 6).then_some(value)
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let a = self.address;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            (a >> 40) & 0xff,
            (a >> 32) & 0xff,
            (a >> 24) & 0xff,
            (a >> 16) & 0xff,
            (a >> 8) & 0xff,
            a & 0xff,
        )
    }
}

// ----------------------------------------------------------------------------
// Advertisements
// ----------------------------------------------------------------------------

/// One raw advertisement as delivered by the radio.
///
/// Immutable once produced by the scanner; duplicates are forwarded as-is so
/// consumers can reason about advertising intervals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub address: u64,
    pub address_type: AddressType,
    pub rssi: i8,
    pub data: Vec<u8>,
}

impl Advertisement {
    pub fn new(address: u64, address_type: AddressType, rssi: i8, mut data: Vec<u8>) -> Self {
        data.truncate(MAX_ADV_DATA_LEN);
        Self {
            address: address & 0x0000_ffff_ffff_ffff,
            address_type,
            rssi,
            data,
        }
    }
}

// ----------------------------------------------------------------------------
// GATT Tree
// ----------------------------------------------------------------------------

/// Characteristic property bits as carried in the services response
pub mod chr_props {
    pub const READ: u8 = 0x02;
    pub const WRITE_WITHOUT_RESPONSE: u8 = 0x04;
    pub const WRITE: u8 = 0x08;
    pub const NOTIFY: u8 = 0x10;
    pub const INDICATE: u8 = 0x20;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GattDescriptor {
    pub uuid: Uuid,
    pub handle: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GattCharacteristic {
    pub uuid: Uuid,
    pub handle: u16,
    pub properties: u8,
    pub descriptors: Vec<GattDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GattService {
    pub uuid: Uuid,
    pub handle: u16,
    pub characteristics: Vec<GattCharacteristic>,
}

// ----------------------------------------------------------------------------
// Scanner State
// ----------------------------------------------------------------------------

/// Reported scanner lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScannerState {
    Idle,
    Running,
    Failed,
}

impl ScannerState {
    pub fn to_wire(self) -> u64 {
        match self {
            ScannerState::Idle => 0,
            ScannerState::Running => 1,
            ScannerState::Failed => 2,
        }
    }
}

/// Scan mode; active scanning issues scan requests for scan-response data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScannerMode {
    Passive,
    Active,
}

impl ScannerMode {
    pub fn is_active(self) -> bool {
        matches!(self, ScannerMode::Active)
    }

    pub fn to_wire(self) -> u64 {
        match self {
            ScannerMode::Passive => 0,
            ScannerMode::Active => 1,
        }
    }

    pub fn from_wire(value: u64) -> Result<Self, DecodeError> {
        match value {
            0 => Ok(ScannerMode::Passive),
            1 => Ok(ScannerMode::Active),
            other => Err(DecodeError::InvalidEnumValue {
                field: "scanner mode",
                value: other,
            }),
        }
    }
}

// ----------------------------------------------------------------------------
// Sessions
// ----------------------------------------------------------------------------

/// Stable identifier for one control session, valid for the socket lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

// ----------------------------------------------------------------------------
// Feature Flags
// ----------------------------------------------------------------------------

/// Bluetooth proxy feature bits advertised in DeviceInfoResponse
pub mod features {
    pub const PASSIVE_SCAN: u32 = 1 << 0;
    pub const ACTIVE_CONNECTIONS: u32 = 1 << 1;
    pub const REMOTE_CACHING: u32 = 1 << 2;
    pub const PAIRING: u32 = 1 << 3;
    pub const CACHE_CLEARING: u32 = 1 << 4;
    pub const RAW_ADVERTISEMENTS: u32 = 1 << 5;
    pub const STATE_AND_MODE: u32 = 1 << 6;

    /// Flags for the current configuration. Scanning and state reporting
    /// are always available; the connection-oriented features follow the
    /// active-connections toggle.
    pub fn for_config(active_connections: bool) -> u32 {
        let mut flags = PASSIVE_SCAN | RAW_ADVERTISEMENTS | STATE_AND_MODE;
        if active_connections {
            flags |= ACTIVE_CONNECTIONS | REMOTE_CACHING | PAIRING | CACHE_CLEARING;
        }
        flags
    }
}

// ----------------------------------------------------------------------------
// GATT Error Codes
// ----------------------------------------------------------------------------

/// Error codes carried in the `error` field of BLE responses
pub mod error_code {
    pub const OK: u16 = 0;
    pub const FAILED: u16 = 1;
    pub const POOL_FULL: u16 = 2;
    pub const NOT_CONNECTED: u16 = 3;
    pub const TIMEOUT: u16 = 4;
    pub const DISCONNECTED: u16 = 5;
    pub const HANDLE_NOT_FOUND: u16 = 6;
    pub const ADAPTER_UNAVAILABLE: u16 = 7;
    pub const PAIRING_FAILED: u16 = 8;
    pub const CACHE_CLEAR_FAILED: u16 = 9;
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_masks_upper_bits() {
        let addr = DeviceAddress::new(0xffff_aabb_ccdd_eeff, AddressType::Public);
        assert_eq!(addr.key(), 0x0000_aabb_ccdd_eeff);
    }

    #[test]
    fn address_display_matches_mac_format() {
        let addr = DeviceAddress::new(0x00aa_bbcc_ddee_ff00 >> 8, AddressType::Random);
        assert_eq!(addr.to_string(), "AA:BB:CC:DD:EE:FF");
    }

    #[test]
    fn mac_parse_round_trip() {
        let value = DeviceAddress::parse_mac("AA:BB:CC:DD:EE:FF").unwrap();
        let addr = DeviceAddress::new(value, AddressType::Public);
        assert_eq!(addr.to_string(), "AA:BB:CC:DD:EE:FF");
        assert!(DeviceAddress::parse_mac("AA:BB:CC").is_none());
        assert!(DeviceAddress::parse_mac("zz:BB:CC:DD:EE:FF").is_none());
    }

    #[test]
    fn hex_key_is_zero_padded() {
        let addr = DeviceAddress::new(0xff, AddressType::Public);
        assert_eq!(addr.hex_key(), "0000000000ff");
    }

    #[test]
    fn advertisement_data_is_capped() {
        let adv = Advertisement::new(1, AddressType::Public, -40, vec![0u8; 100]);
        assert_eq!(adv.data.len(), MAX_ADV_DATA_LEN);
    }

    #[test]
    fn feature_flags_follow_configuration() {
        assert_eq!(features::for_config(true), 0x7f);
        assert_eq!(
            features::for_config(false),
            features::PASSIVE_SCAN | features::RAW_ADVERTISEMENTS | features::STATE_AND_MODE
        );
    }
}
