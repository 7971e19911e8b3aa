//! The adapter capability set
//!
//! Everything the daemon demands of a host BLE stack, expressed as one
//! async trait so test doubles and the btleplug backend are interchangeable.
//! Radio-initiated traffic (advertisements, notifications, link loss) flows
//! out-of-band on a single event stream taken once at startup.

use async_trait::async_trait;
use tokio::sync::mpsc;

use bleproxy_core::types::{Advertisement, DeviceAddress, GattService};

use crate::error::BleError;

/// Opaque identifier for one established peripheral connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionHandle(pub u64);

/// Radio-initiated events delivered on the adapter event stream
#[derive(Debug, Clone)]
pub enum AdapterEvent {
    /// One raw advertisement, duplicates included
    Advertisement(Advertisement),
    /// A notification or indication from a subscribed characteristic
    Notification {
        address: u64,
        handle: u16,
        data: Vec<u8>,
    },
    /// The peripheral dropped the link on its own
    PeripheralDisconnected { address: u64 },
    /// The scan stopped without being asked to
    ScanFailed { reason: String },
}

/// Capability contract between the daemon and the host BLE stack
#[async_trait]
pub trait BleAdapter: Send + Sync + 'static {
    /// Take the radio event stream. Yields `Some` exactly once.
    fn take_event_stream(&self) -> Option<mpsc::Receiver<AdapterEvent>>;

    /// Begin a continuous scan with duplicate filtering disabled
    async fn start_scan(&self, active: bool) -> Result<(), BleError>;

    async fn stop_scan(&self) -> Result<(), BleError>;

    /// Establish a GATT connection; resolves once the link is up
    async fn connect(&self, address: DeviceAddress) -> Result<ConnectionHandle, BleError>;

    async fn disconnect(&self, handle: ConnectionHandle) -> Result<(), BleError>;

    /// Negotiated MTU for an established connection
    async fn mtu(&self, handle: ConnectionHandle) -> Result<u16, BleError>;

    async fn discover_services(
        &self,
        handle: ConnectionHandle,
    ) -> Result<Vec<GattService>, BleError>;

    async fn read_chr(
        &self,
        handle: ConnectionHandle,
        chr_handle: u16,
    ) -> Result<Vec<u8>, BleError>;

    async fn write_chr(
        &self,
        handle: ConnectionHandle,
        chr_handle: u16,
        data: &[u8],
        with_response: bool,
    ) -> Result<(), BleError>;

    async fn read_desc(
        &self,
        handle: ConnectionHandle,
        desc_handle: u16,
    ) -> Result<Vec<u8>, BleError>;

    async fn write_desc(
        &self,
        handle: ConnectionHandle,
        desc_handle: u16,
        data: &[u8],
    ) -> Result<(), BleError>;

    /// Enable notifications; data arrives as [`AdapterEvent::Notification`]
    async fn subscribe_notify(
        &self,
        handle: ConnectionHandle,
        chr_handle: u16,
    ) -> Result<(), BleError>;

    async fn unsubscribe_notify(
        &self,
        handle: ConnectionHandle,
        chr_handle: u16,
    ) -> Result<(), BleError>;

    async fn pair(&self, handle: ConnectionHandle) -> Result<(), BleError>;

    async fn unpair(&self, address: DeviceAddress) -> Result<(), BleError>;

    /// Drop any stack-held attribute cache for the peripheral
    async fn clear_gatt_cache(&self, address: DeviceAddress) -> Result<(), BleError>;

    /// MAC address of the local radio, `AA:BB:CC:DD:EE:FF`
    async fn adapter_mac(&self) -> Result<String, BleError>;
}
