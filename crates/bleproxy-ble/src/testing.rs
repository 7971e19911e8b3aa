//! Mock adapter for deterministic tests
//!
//! Implements the complete capability set against scripted peripherals so
//! the daemon can be exercised end-to-end without a radio.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use bleproxy_core::types::{Advertisement, DeviceAddress, GattService};

use crate::adapter::{AdapterEvent, BleAdapter, ConnectionHandle};
use crate::error::BleError;

/// A scripted peripheral the mock radio can see
#[derive(Debug, Clone, Default)]
pub struct MockPeripheral {
    pub address: u64,
    pub services: Vec<GattService>,
    /// Values returned for characteristic and descriptor reads by handle
    pub values: HashMap<u16, Vec<u8>>,
    /// Artificial latency applied to connect and every GATT operation
    pub latency: Duration,
    pub fail_connect: bool,
    pub fail_pair: bool,
}

#[derive(Debug, Default)]
struct MockState {
    peripherals: HashMap<u64, MockPeripheral>,
    connected: HashMap<u64, u64>,
    next_handle: u64,
    writes: Vec<(u64, u16, Vec<u8>, bool)>,
    subscriptions: HashSet<(u64, u16)>,
    scan_active: Option<bool>,
    scan_starts: usize,
    fail_scan_starts: usize,
    cache_clears: Vec<u64>,
    unpairs: Vec<u64>,
}

/// Scriptable in-memory adapter
pub struct MockAdapter {
    state: Mutex<MockState>,
    event_tx: mpsc::Sender<AdapterEvent>,
    event_rx: Mutex<Option<mpsc::Receiver<AdapterEvent>>>,
}

impl MockAdapter {
    pub fn new() -> Arc<Self> {
        let (event_tx, event_rx) = mpsc::channel(256);
        Arc::new(Self {
            state: Mutex::new(MockState {
                next_handle: 1,
                ..MockState::default()
            }),
            event_tx,
            event_rx: Mutex::new(Some(event_rx)),
        })
    }

    pub fn add_peripheral(&self, peripheral: MockPeripheral) {
        let mut state = self.state.lock().unwrap();
        state.peripherals.insert(peripheral.address, peripheral);
    }

    /// Push one advertisement into the event stream
    pub async fn emit_advertisement(&self, adv: Advertisement) {
        let _ = self.event_tx.send(AdapterEvent::Advertisement(adv)).await;
    }

    /// Push a notification as if a subscribed characteristic fired
    pub async fn emit_notification(&self, address: u64, handle: u16, data: Vec<u8>) {
        let _ = self
            .event_tx
            .send(AdapterEvent::Notification {
                address,
                handle,
                data,
            })
            .await;
    }

    /// Simulate the peripheral dropping the link
    pub async fn emit_peripheral_disconnect(&self, address: u64) {
        let mut dropped = false;
        {
            let mut state = self.state.lock().unwrap();
            let handles: Vec<u64> = state
                .connected
                .iter()
                .filter(|(_, a)| **a == address)
                .map(|(h, _)| *h)
                .collect();
            for h in handles {
                state.connected.remove(&h);
                dropped = true;
            }
        }
        if dropped {
            let _ = self
                .event_tx
                .send(AdapterEvent::PeripheralDisconnected { address })
                .await;
        }
    }

    /// Simulate the scan dying underneath the daemon
    pub async fn emit_scan_failure(&self, reason: &str) {
        self.state.lock().unwrap().scan_active = None;
        let _ = self
            .event_tx
            .send(AdapterEvent::ScanFailed {
                reason: reason.to_string(),
            })
            .await;
    }

    pub fn fail_next_scan_start(&self) {
        self.state.lock().unwrap().fail_scan_starts += 1;
    }

    pub fn scan_active(&self) -> Option<bool> {
        self.state.lock().unwrap().scan_active
    }

    pub fn scan_starts(&self) -> usize {
        self.state.lock().unwrap().scan_starts
    }

    pub fn writes(&self) -> Vec<(u64, u16, Vec<u8>, bool)> {
        self.state.lock().unwrap().writes.clone()
    }

    pub fn is_subscribed(&self, address: u64, handle: u16) -> bool {
        self.state.lock().unwrap().subscriptions.contains(&(address, handle))
    }

    pub fn is_connected(&self, address: u64) -> bool {
        self.state
            .lock()
            .unwrap()
            .connected
            .values()
            .any(|a| *a == address)
    }

    pub fn cache_clears(&self) -> Vec<u64> {
        self.state.lock().unwrap().cache_clears.clone()
    }

    pub fn unpairs(&self) -> Vec<u64> {
        self.state.lock().unwrap().unpairs.clone()
    }

    fn latency_of(&self, address: u64) -> Duration {
        self.state
            .lock()
            .unwrap()
            .peripherals
            .get(&address)
            .map(|p| p.latency)
            .unwrap_or_default()
    }

    fn address_of(&self, handle: ConnectionHandle) -> Result<u64, BleError> {
        self.state
            .lock()
            .unwrap()
            .connected
            .get(&handle.0)
            .copied()
            .ok_or(BleError::NotConnected)
    }
}

#[async_trait]
impl BleAdapter for MockAdapter {
    fn take_event_stream(&self) -> Option<mpsc::Receiver<AdapterEvent>> {
        self.event_rx.lock().unwrap().take()
    }

    async fn start_scan(&self, active: bool) -> Result<(), BleError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_scan_starts > 0 {
            state.fail_scan_starts -= 1;
            return Err(BleError::AdapterUnavailable("scripted failure".into()));
        }
        state.scan_active = Some(active);
        state.scan_starts += 1;
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), BleError> {
        self.state.lock().unwrap().scan_active = None;
        Ok(())
    }

    async fn connect(&self, address: DeviceAddress) -> Result<ConnectionHandle, BleError> {
        let (latency, fail) = {
            let state = self.state.lock().unwrap();
            let peripheral = state
                .peripherals
                .get(&address.key())
                .ok_or(BleError::NotDiscovered)?;
            (peripheral.latency, peripheral.fail_connect)
        };
        tokio::time::sleep(latency).await;
        if fail {
            return Err(BleError::ConnectFailed("scripted failure".into()));
        }
        let mut state = self.state.lock().unwrap();
        let handle = state.next_handle;
        state.next_handle += 1;
        state.connected.insert(handle, address.key());
        Ok(ConnectionHandle(handle))
    }

    async fn disconnect(&self, handle: ConnectionHandle) -> Result<(), BleError> {
        self.state.lock().unwrap().connected.remove(&handle.0);
        Ok(())
    }

    async fn mtu(&self, handle: ConnectionHandle) -> Result<u16, BleError> {
        self.address_of(handle)?;
        Ok(247)
    }

    async fn discover_services(
        &self,
        handle: ConnectionHandle,
    ) -> Result<Vec<GattService>, BleError> {
        let address = self.address_of(handle)?;
        tokio::time::sleep(self.latency_of(address)).await;
        let state = self.state.lock().unwrap();
        Ok(state
            .peripherals
            .get(&address)
            .map(|p| p.services.clone())
            .unwrap_or_default())
    }

    async fn read_chr(
        &self,
        handle: ConnectionHandle,
        chr_handle: u16,
    ) -> Result<Vec<u8>, BleError> {
        let address = self.address_of(handle)?;
        tokio::time::sleep(self.latency_of(address)).await;
        let state = self.state.lock().unwrap();
        state
            .peripherals
            .get(&address)
            .and_then(|p| p.values.get(&chr_handle).cloned())
            .ok_or(BleError::HandleNotFound(chr_handle))
    }

    async fn write_chr(
        &self,
        handle: ConnectionHandle,
        chr_handle: u16,
        data: &[u8],
        with_response: bool,
    ) -> Result<(), BleError> {
        let address = self.address_of(handle)?;
        tokio::time::sleep(self.latency_of(address)).await;
        self.state
            .lock()
            .unwrap()
            .writes
            .push((address, chr_handle, data.to_vec(), with_response));
        Ok(())
    }

    async fn read_desc(
        &self,
        handle: ConnectionHandle,
        desc_handle: u16,
    ) -> Result<Vec<u8>, BleError> {
        self.read_chr(handle, desc_handle).await
    }

    async fn write_desc(
        &self,
        handle: ConnectionHandle,
        desc_handle: u16,
        data: &[u8],
    ) -> Result<(), BleError> {
        self.write_chr(handle, desc_handle, data, true).await
    }

    async fn subscribe_notify(
        &self,
        handle: ConnectionHandle,
        chr_handle: u16,
    ) -> Result<(), BleError> {
        let address = self.address_of(handle)?;
        self.state
            .lock()
            .unwrap()
            .subscriptions
            .insert((address, chr_handle));
        Ok(())
    }

    async fn unsubscribe_notify(
        &self,
        handle: ConnectionHandle,
        chr_handle: u16,
    ) -> Result<(), BleError> {
        let address = self.address_of(handle)?;
        self.state
            .lock()
            .unwrap()
            .subscriptions
            .remove(&(address, chr_handle));
        Ok(())
    }

    async fn pair(&self, handle: ConnectionHandle) -> Result<(), BleError> {
        let address = self.address_of(handle)?;
        let fail = self
            .state
            .lock()
            .unwrap()
            .peripherals
            .get(&address)
            .is_some_and(|p| p.fail_pair);
        if fail {
            Err(BleError::PairingFailed("scripted failure".into()))
        } else {
            Ok(())
        }
    }

    async fn unpair(&self, address: DeviceAddress) -> Result<(), BleError> {
        self.state.lock().unwrap().unpairs.push(address.key());
        Ok(())
    }

    async fn clear_gatt_cache(&self, address: DeviceAddress) -> Result<(), BleError> {
        self.state.lock().unwrap().cache_clears.push(address.key());
        Ok(())
    }

    async fn adapter_mac(&self) -> Result<String, BleError> {
        Ok("AA:BB:CC:DD:EE:FF".to_string())
    }
}
