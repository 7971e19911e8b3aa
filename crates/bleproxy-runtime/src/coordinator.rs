//! Proxy coordinator
//!
//! One task owns the pool, the broker, the subscription registry, and the
//! scanner. Sessions reach it through [`ProxyHandle`]; the BLE side reaches
//! it through the adapter event pump and per-connection event channels.
//! Every shared structure lives on this task, so there is no cross-task
//! mutable state anywhere in the daemon.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tracing::{debug, info, warn};

use bleproxy_ble::adapter::{AdapterEvent, BleAdapter};
use bleproxy_ble::cache::{BondStore, ServiceCache};
use bleproxy_ble::connection::{ConnEvent, ConnectionTask, GattOp, GattOpKind, GattOutcome, OpOutput};
use bleproxy_ble::pool::{ConnectionPool, PoolError, SlotState};
use bleproxy_ble::scanner::Scanner;
use bleproxy_core::config::ProxyConfig;
use bleproxy_core::message::{DeviceRequestKind, ServerMessage};
use bleproxy_core::types::{
    error_code, AddressType, Advertisement, DeviceAddress, ScannerMode, ScannerState, SessionId,
};

use crate::batcher::Batcher;
use crate::broker::{OpBroker, PendingOp};
use crate::outbox::{CloseReason, OutboxSender, StreamSend};
use crate::subscriptions::SubscriptionRegistry;

/// Cadence of the deadline sweep
const SWEEP_INTERVAL: Duration = Duration::from_millis(250);

/// Command channel depth between sessions and the coordinator
const COMMAND_CHANNEL_DEPTH: usize = 128;

// ----------------------------------------------------------------------------
// Commands and Events
// ----------------------------------------------------------------------------

/// Everything a control session can ask of the proxy
#[derive(Debug)]
pub enum ProxyCommand {
    Register {
        session: SessionId,
        outbox: OutboxSender,
    },
    Deregister {
        session: SessionId,
    },
    SubscribeAdvertisements {
        session: SessionId,
        flags: u32,
    },
    UnsubscribeAdvertisements {
        session: SessionId,
    },
    SubscribeScannerState {
        session: SessionId,
    },
    SubscribeConnectionsFree {
        session: SessionId,
    },
    ScannerSetMode {
        session: SessionId,
        mode: ScannerMode,
    },
    Device {
        session: SessionId,
        address: u64,
        address_type: Option<AddressType>,
        kind: DeviceRequestKind,
    },
    GetServices {
        session: SessionId,
        address: u64,
    },
    GattRead {
        session: SessionId,
        address: u64,
        handle: u16,
    },
    GattWrite {
        session: SessionId,
        address: u64,
        handle: u16,
        data: Vec<u8>,
        response: bool,
    },
    GattReadDescriptor {
        session: SessionId,
        address: u64,
        handle: u16,
    },
    GattWriteDescriptor {
        session: SessionId,
        address: u64,
        handle: u16,
        data: Vec<u8>,
    },
    GattNotify {
        session: SessionId,
        address: u64,
        handle: u16,
        enable: bool,
    },
    Shutdown,
}

/// Events from the adapter event pump
#[derive(Debug)]
enum PumpEvent {
    Batch(Vec<Advertisement>),
    Notification {
        address: u64,
        handle: u16,
        data: Vec<u8>,
    },
    PeripheralDisconnected {
        address: u64,
    },
    ScanFailed {
        reason: String,
    },
}

/// Cloneable entry point sessions use to reach the coordinator
#[derive(Clone)]
pub struct ProxyHandle {
    tx: mpsc::Sender<ProxyCommand>,
}

impl ProxyHandle {
    pub async fn send(&self, cmd: ProxyCommand) {
        if self.tx.send(cmd).await.is_err() {
            debug!("proxy coordinator is gone, dropping command");
        }
    }
}

// ----------------------------------------------------------------------------
// Coordinator
// ----------------------------------------------------------------------------

pub struct Coordinator {
    config: Arc<ProxyConfig>,
    adapter: Arc<dyn BleAdapter>,
    cmd_rx: mpsc::Receiver<ProxyCommand>,
    pump_rx: mpsc::Receiver<PumpEvent>,
    conn_tx: mpsc::Sender<ConnEvent>,
    conn_rx: mpsc::Receiver<ConnEvent>,
    scanner: Scanner,
    pool: ConnectionPool,
    broker: OpBroker,
    registry: SubscriptionRegistry,
    cache: Option<ServiceCache>,
    bonds: Option<BondStore>,
    last_state: Option<(ScannerState, ScannerMode)>,
    pump_closed: bool,
    shutting_down: bool,
}

impl Coordinator {
    /// Spawn the coordinator and its adapter event pump
    pub fn spawn(config: Arc<ProxyConfig>, adapter: Arc<dyn BleAdapter>) -> ProxyHandle {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_DEPTH);
        let (pump_tx, pump_rx) = mpsc::channel(COMMAND_CHANNEL_DEPTH);
        let (conn_tx, conn_rx) = mpsc::channel(COMMAND_CHANNEL_DEPTH);

        if let Some(events) = adapter.take_event_stream() {
            let batcher = Batcher::new(config.batch_size, config.timeouts.flush_interval);
            tokio::spawn(run_event_pump(events, pump_tx, batcher));
        } else {
            warn!("adapter event stream already taken, radio events will not flow");
        }

        let (cache, bonds) = match &config.cache_dir {
            Some(dir) => {
                let cache = ServiceCache::open(dir.join("services"))
                    .map_err(|e| warn!(error = %e, "service cache disabled"))
                    .ok();
                let bonds = BondStore::open(dir.join("bonds"))
                    .map_err(|e| warn!(error = %e, "bond store disabled"))
                    .ok();
                (cache, bonds)
            }
            None => (None, None),
        };

        let coordinator = Self {
            scanner: Scanner::new(adapter.clone()),
            pool: ConnectionPool::new(config.max_connections),
            broker: OpBroker::new(config.timeouts.gatt_op),
            registry: SubscriptionRegistry::new(),
            cache,
            bonds,
            last_state: None,
            pump_closed: false,
            shutting_down: false,
            config,
            adapter,
            cmd_rx,
            pump_rx,
            conn_tx,
            conn_rx,
        };
        tokio::spawn(coordinator.run());
        ProxyHandle { tx: cmd_tx }
    }

    async fn run(mut self) {
        let mut sweep = time::interval(SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },
                event = self.pump_rx.recv(), if !self.pump_closed => match event {
                    Some(event) => self.handle_pump_event(event).await,
                    None => self.pump_closed = true,
                },
                Some(event) = self.conn_rx.recv() => self.handle_conn_event(event).await,
                _ = sweep.tick() => self.sweep().await,
            }
            if self.shutting_down && self.pool.occupancy() == 0 {
                break;
            }
        }
        info!("proxy coordinator stopped");
    }

    // ------------------------------------------------------------------
    // Session commands
    // ------------------------------------------------------------------

    async fn handle_command(&mut self, cmd: ProxyCommand) {
        match cmd {
            ProxyCommand::Register { session, outbox } => {
                self.registry.register(session, outbox);
            }
            ProxyCommand::Deregister { session } => {
                self.registry.remove(session);
                self.sync_scanner().await;
            }
            ProxyCommand::SubscribeAdvertisements { session, flags } => {
                self.registry.subscribe_ads(session, flags);
                self.sync_scanner().await;
            }
            ProxyCommand::UnsubscribeAdvertisements { session } => {
                self.registry.unsubscribe_ads(session);
                self.sync_scanner().await;
            }
            ProxyCommand::SubscribeScannerState { session } => {
                self.registry.subscribe_scanner_state(session);
                // Initial state goes out immediately on subscription.
                if let Some(outbox) = self.registry.outbox(session) {
                    outbox.send_reply(self.scanner_state_message());
                }
            }
            ProxyCommand::SubscribeConnectionsFree { session } => {
                self.registry.subscribe_connections_free(session);
                if let Some(outbox) = self.registry.outbox(session) {
                    outbox.send_reply(self.connections_free_message());
                }
            }
            ProxyCommand::ScannerSetMode { session, mode } => {
                self.registry.set_mode_pref(session, mode);
                self.sync_scanner().await;
            }
            ProxyCommand::Device {
                session,
                address,
                address_type,
                kind,
            } => self.handle_device(session, address, address_type, kind).await,
            ProxyCommand::GetServices { session, address } => {
                self.handle_get_services(session, address)
            }
            ProxyCommand::GattRead {
                session,
                address,
                handle,
            } => self.submit_op(session, address, handle, GattOpKind::ReadChr, Vec::new()),
            ProxyCommand::GattWrite {
                session,
                address,
                handle,
                data,
                response,
            } => self.submit_op(
                session,
                address,
                handle,
                GattOpKind::WriteChr {
                    with_response: response,
                },
                data,
            ),
            ProxyCommand::GattReadDescriptor {
                session,
                address,
                handle,
            } => self.submit_op(session, address, handle, GattOpKind::ReadDesc, Vec::new()),
            ProxyCommand::GattWriteDescriptor {
                session,
                address,
                handle,
                data,
            } => self.submit_op(session, address, handle, GattOpKind::WriteDesc, data),
            ProxyCommand::GattNotify {
                session,
                address,
                handle,
                enable,
            } => self.submit_op(
                session,
                address,
                handle,
                GattOpKind::NotifySet { enable },
                Vec::new(),
            ),
            ProxyCommand::Shutdown => self.begin_shutdown().await,
        }
    }

    async fn handle_device(
        &mut self,
        session: SessionId,
        address: u64,
        address_type: Option<AddressType>,
        kind: DeviceRequestKind,
    ) {
        self.registry.watch_address(session, address);
        let device = DeviceAddress::new(address, address_type.unwrap_or(AddressType::Public));

        match kind {
            DeviceRequestKind::Connect => self.connect_device(session, device).await,
            DeviceRequestKind::Disconnect => self.disconnect_device(session, address).await,
            DeviceRequestKind::Pair => {
                if self.is_connected(address) {
                    let op_id = self.broker.begin(address, 0, GattOpKind::Pair, session);
                    if let Some(slot) = self.pool.get(address) {
                        push_op(
                            slot,
                            GattOp {
                                op_id,
                                kind: GattOpKind::Pair,
                                handle: 0,
                                data: Vec::new(),
                            },
                        );
                    }
                } else {
                    self.reply(
                        session,
                        ServerMessage::DevicePairing {
                            address,
                            paired: false,
                            error: error_code::NOT_CONNECTED,
                        },
                    );
                }
            }
            DeviceRequestKind::Unpair => {
                let result = self.adapter.unpair(device).await;
                let removed = self
                    .bonds
                    .as_ref()
                    .map(|bonds| bonds.remove(&device).unwrap_or(false))
                    .unwrap_or(false);
                let (success, error) = match result {
                    Ok(()) => (true, error_code::OK),
                    Err(e) if removed => {
                        debug!(error = %e, "adapter unpair failed but bond record removed");
                        (true, error_code::OK)
                    }
                    Err(e) => (false, e.error_code()),
                };
                self.reply(
                    session,
                    ServerMessage::DeviceUnpairing {
                        address,
                        success,
                        error,
                    },
                );
            }
            DeviceRequestKind::ClearCache => {
                let cleared = self
                    .cache
                    .as_ref()
                    .map(|cache| cache.clear(&device))
                    .transpose();
                let adapter_result = self.adapter.clear_gatt_cache(device).await;
                let (success, error) = match (cleared, adapter_result) {
                    (Ok(_), Ok(())) => (true, error_code::OK),
                    (Err(e), _) => (false, e.error_code()),
                    (_, Err(e)) => (false, e.error_code()),
                };
                self.reply(
                    session,
                    ServerMessage::DeviceClearCache {
                        address,
                        success,
                        error,
                    },
                );
            }
        }
    }

    async fn connect_device(&mut self, session: SessionId, device: DeviceAddress) {
        if !self.config.active_connections {
            self.reply(
                session,
                ServerMessage::DeviceConnection {
                    address: device.key(),
                    connected: false,
                    mtu: 0,
                    error: error_code::FAILED,
                },
            );
            return;
        }

        if let Some(slot) = self.pool.get(device.key()) {
            // Existing record: report its state, never allocate a second one.
            if let SlotState::Connected { mtu } = slot.state {
                self.reply(
                    session,
                    ServerMessage::DeviceConnection {
                        address: device.key(),
                        connected: true,
                        mtu,
                        error: error_code::OK,
                    },
                );
            }
            return;
        }

        if self.pool.free() == 0 {
            warn!(address = %device, "connection pool exhausted");
            self.reply(
                session,
                ServerMessage::DeviceConnection {
                    address: device.key(),
                    connected: false,
                    mtu: 0,
                    error: error_code::POOL_FULL,
                },
            );
            return;
        }

        // Capacity and uniqueness are checked, so the task is safe to spawn.
        let channels = ConnectionTask::spawn(
            device,
            self.adapter.clone(),
            self.config.timeouts.clone(),
            self.conn_tx.clone(),
        );
        match self.pool.insert(device, channels) {
            Ok(()) => {
                info!(address = %device, "connecting");
                self.broadcast_connections_free();
            }
            Err(e @ (PoolError::Exhausted | PoolError::Occupied)) => {
                warn!(address = %device, error = %e, "pool rejected a vetted insert");
            }
        }
    }

    async fn disconnect_device(&mut self, session: SessionId, address: u64) {
        // Disconnect pre-empts queued work: everything pending resolves as
        // disconnected before the connection state response goes out.
        let drained = self.broker.drain_address(address);
        for op in drained {
            self.resolve_with_error(op, error_code::DISCONNECTED);
        }

        match self.pool.get_mut(address) {
            Some(slot) => {
                slot.state = SlotState::Disconnecting;
                let _ = slot.channels.disconnect_tx.try_send(());
            }
            None => {
                self.reply(
                    session,
                    ServerMessage::DeviceConnection {
                        address,
                        connected: false,
                        mtu: 0,
                        error: error_code::OK,
                    },
                );
            }
        }
    }

    fn handle_get_services(&mut self, session: SessionId, address: u64) {
        let device = match self.pool.get(address) {
            Some(slot) if matches!(slot.state, SlotState::Connected { .. }) => slot.address,
            _ => {
                self.reply(
                    session,
                    ServerMessage::GattError {
                        address,
                        handle: 0,
                        error: error_code::NOT_CONNECTED,
                    },
                );
                return;
            }
        };

        // A fresh cached tree answers without touching the radio.
        if let Some(services) = self.cache.as_ref().and_then(|c| c.load(&device)) {
            debug!(address = %device, "serving services from cache");
            self.reply(session, ServerMessage::GattServices { address, services });
            self.reply(session, ServerMessage::GattServicesDone { address });
            return;
        }

        let op_id = self
            .broker
            .begin(address, 0, GattOpKind::DiscoverServices, session);
        if let Some(slot) = self.pool.get(address) {
            push_op(
                slot,
                GattOp {
                    op_id,
                    kind: GattOpKind::DiscoverServices,
                    handle: 0,
                    data: Vec::new(),
                },
            );
        }
    }

    /// Queue one GATT request on the target connection's FIFO
    fn submit_op(
        &mut self,
        session: SessionId,
        address: u64,
        handle: u16,
        kind: GattOpKind,
        data: Vec<u8>,
    ) {
        if !self.is_connected(address) {
            self.reply(
                session,
                ServerMessage::GattError {
                    address,
                    handle,
                    error: error_code::NOT_CONNECTED,
                },
            );
            return;
        }
        let op_id = self.broker.begin(address, handle, kind.clone(), session);
        if let Some(slot) = self.pool.get(address) {
            push_op(
                slot,
                GattOp {
                    op_id,
                    kind,
                    handle,
                    data,
                },
            );
        }
    }

    // ------------------------------------------------------------------
    // BLE-side events
    // ------------------------------------------------------------------

    async fn handle_pump_event(&mut self, event: PumpEvent) {
        match event {
            PumpEvent::Batch(batch) => self.fan_out_batch(batch).await,
            PumpEvent::Notification {
                address,
                handle,
                data,
            } => {
                let mut lapsed = Vec::new();
                for id in self.registry.notify_targets(address, handle) {
                    if let Some(outbox) = self.registry.outbox(id) {
                        let msg = ServerMessage::GattNotifyData {
                            address,
                            handle,
                            data: data.clone(),
                        };
                        if outbox.send_stream(msg) == StreamSend::Full {
                            lapsed.push(id);
                        }
                    }
                }
                for id in lapsed {
                    self.lapse_streams(id).await;
                }
            }
            PumpEvent::PeripheralDisconnected { address } => {
                if self.pool.get(address).is_some() {
                    info!(address, "peripheral dropped the link");
                    let drained = self.broker.drain_address(address);
                    for op in drained {
                        self.resolve_with_error(op, error_code::DISCONNECTED);
                    }
                    if let Some(slot) = self.pool.get_mut(address) {
                        slot.state = SlotState::Disconnecting;
                        let _ = slot.channels.disconnect_tx.try_send(());
                    }
                }
            }
            PumpEvent::ScanFailed { reason } => {
                warn!(%reason, "scan failed, entering back-off");
                self.scanner.note_failure();
                self.broadcast_scanner_state();
            }
        }
    }

    async fn fan_out_batch(&mut self, batch: Vec<Advertisement>) {
        let subscribers: Vec<SessionId> =
            self.registry.ad_subscribers().map(|(id, _)| id).collect();
        let mut lapsed = Vec::new();
        for id in subscribers {
            if let Some(outbox) = self.registry.outbox(id) {
                let msg = ServerMessage::RawAdvertisements(batch.clone());
                if outbox.send_stream(msg) == StreamSend::Full {
                    lapsed.push(id);
                }
            }
        }
        for id in lapsed {
            self.lapse_streams(id).await;
        }
    }

    /// Outbox overflow: the droppable streams lapse and the session learns
    /// about it through a scanner-state message
    async fn lapse_streams(&mut self, id: SessionId) {
        warn!(session = %id, "outbox full, dropping subscription streams");
        if self.registry.drop_streams(id) {
            if let Some(outbox) = self.registry.outbox(id) {
                outbox.send_reply(self.scanner_state_message());
            }
        }
        self.sync_scanner().await;
    }

    async fn handle_conn_event(&mut self, event: ConnEvent) {
        match event {
            ConnEvent::Connected { address, mtu } => {
                if let Some(slot) = self.pool.get_mut(address) {
                    slot.state = SlotState::Connected { mtu };
                }
                self.send_connection_state(address, true, mtu, error_code::OK);
            }
            ConnEvent::ConnectFailed { address, error } => {
                self.pool.remove(address);
                self.send_connection_state(address, false, 0, error);
                self.broadcast_connections_free();
            }
            ConnEvent::Disconnected { address } => {
                self.pool.remove(address);
                self.registry.clear_address_notifies(address);
                self.send_connection_state(address, false, 0, error_code::OK);
                self.broadcast_connections_free();
            }
            ConnEvent::OpResolved(outcome) => self.handle_op_resolved(outcome),
        }
    }

    fn handle_op_resolved(&mut self, outcome: GattOutcome) {
        // Unknown ids are late results after a timeout or disconnect; the
        // op was already resolved once, so the data is dropped.
        let Some(pending) = self.broker.resolve(outcome.op_id) else {
            debug!(op_id = outcome.op_id, "discarding late result");
            return;
        };
        let GattOutcome {
            address,
            handle,
            result,
            ..
        } = outcome;
        let origin = pending.origin;
        let kind = pending.kind.clone();

        match (kind, result) {
            (GattOpKind::DiscoverServices, Ok(OpOutput::Services(services))) => {
                if let (Some(cache), Some(slot)) = (&self.cache, self.pool.get(address)) {
                    if let Err(e) = cache.store(&slot.address, &services) {
                        warn!(error = %e, "failed to persist service cache entry");
                    }
                }
                self.reply(origin, ServerMessage::GattServices { address, services });
                self.reply(origin, ServerMessage::GattServicesDone { address });
            }
            (GattOpKind::ReadChr | GattOpKind::ReadDesc, Ok(OpOutput::Data(data))) => {
                self.reply(
                    origin,
                    ServerMessage::GattRead {
                        address,
                        handle,
                        data,
                    },
                );
            }
            (GattOpKind::WriteChr { with_response }, Ok(_)) => {
                if with_response {
                    self.reply(origin, ServerMessage::GattWrite { address, handle });
                }
            }
            (GattOpKind::WriteDesc, Ok(_)) => {
                self.reply(origin, ServerMessage::GattWrite { address, handle });
            }
            (GattOpKind::NotifySet { enable }, Ok(_)) => {
                if enable {
                    self.registry.add_notify(origin, address, handle);
                } else {
                    self.registry.remove_notify(origin, address, handle);
                }
                self.reply(origin, ServerMessage::GattNotifyConfirm { address, handle });
            }
            (GattOpKind::Pair, Ok(_)) => {
                if let (Some(bonds), Some(slot)) = (&self.bonds, self.pool.get(address)) {
                    if let Err(e) = bonds.record(&slot.address) {
                        warn!(error = %e, "failed to persist bond record");
                    }
                }
                self.reply(
                    origin,
                    ServerMessage::DevicePairing {
                        address,
                        paired: true,
                        error: error_code::OK,
                    },
                );
            }
            (_, Ok(_)) => {
                warn!(op_id = pending.op_id, "operation resolved with mismatched output");
                self.resolve_with_error(pending, error_code::FAILED);
            }
            (_, Err(error)) => self.resolve_with_error(pending, error),
        }
    }

    /// Emit the error-shaped response appropriate for the operation kind
    fn resolve_with_error(&mut self, op: PendingOp, error: u16) {
        let msg = match op.kind {
            GattOpKind::Pair => ServerMessage::DevicePairing {
                address: op.address,
                paired: false,
                error,
            },
            _ => ServerMessage::GattError {
                address: op.address,
                handle: op.handle,
                error,
            },
        };
        self.reply(op.origin, msg);
    }

    // ------------------------------------------------------------------
    // Housekeeping
    // ------------------------------------------------------------------

    async fn sweep(&mut self) {
        let expired = self.broker.expire(Instant::now());
        for op in expired {
            debug!(op_id = op.op_id, address = op.address, "operation deadline passed");
            self.resolve_with_error(op, error_code::TIMEOUT);
        }
        if self.scanner.poll_retry().await.is_some() {
            self.broadcast_scanner_state();
        }
    }

    /// Drive the scanner toward what the current subscriber set wants
    async fn sync_scanner(&mut self) {
        if self.shutting_down {
            return;
        }
        if self.registry.any_ad_subscribers() {
            self.scanner.start(self.registry.union_mode()).await;
        } else {
            self.scanner.stop().await;
        }
        self.broadcast_scanner_state();
    }

    fn scanner_state_message(&self) -> ServerMessage {
        ServerMessage::ScannerState {
            state: self.scanner.state(),
            mode: self.scanner.mode(),
        }
    }

    fn connections_free_message(&self) -> ServerMessage {
        ServerMessage::ConnectionsFree {
            free: self.pool.free() as u32,
            limit: self.pool.limit() as u32,
        }
    }

    /// Report scanner state to subscribed sessions, once per change
    fn broadcast_scanner_state(&mut self) {
        let current = (self.scanner.state(), self.scanner.mode());
        if self.last_state == Some(current) {
            return;
        }
        self.last_state = Some(current);
        let msg = self.scanner_state_message();
        for outbox in self.registry.scanner_state_subscribers() {
            outbox.send_reply(msg.clone());
        }
    }

    fn broadcast_connections_free(&self) {
        let msg = self.connections_free_message();
        for outbox in self.registry.connections_free_subscribers() {
            outbox.send_reply(msg.clone());
        }
    }

    fn send_connection_state(&self, address: u64, connected: bool, mtu: u16, error: u16) {
        let msg = ServerMessage::DeviceConnection {
            address,
            connected,
            mtu,
            error,
        };
        for id in self.registry.conn_event_targets(address) {
            if let Some(outbox) = self.registry.outbox(id) {
                outbox.send_reply(msg.clone());
            }
        }
    }

    fn reply(&self, session: SessionId, msg: ServerMessage) {
        if let Some(outbox) = self.registry.outbox(session) {
            outbox.send_reply(msg);
        }
    }

    async fn begin_shutdown(&mut self) {
        if self.shutting_down {
            return;
        }
        info!("shutting down: disconnecting peripherals and closing sessions");
        self.shutting_down = true;
        self.scanner.stop().await;

        let addresses: Vec<u64> = self.pool.addresses().collect();
        for address in addresses {
            let drained = self.broker.drain_address(address);
            for op in drained {
                self.resolve_with_error(op, error_code::DISCONNECTED);
            }
            if let Some(slot) = self.pool.get_mut(address) {
                slot.state = SlotState::Disconnecting;
                let _ = slot.channels.disconnect_tx.try_send(());
            }
        }

        // Every session gets a disconnect frame, then drains and closes.
        for id in self.registry.session_ids() {
            if let Some(outbox) = self.registry.outbox(id) {
                outbox.send_reply(ServerMessage::DisconnectRequest);
                outbox.request_close(CloseReason::Shutdown);
            }
        }
    }

    fn is_connected(&self, address: u64) -> bool {
        self.pool
            .get(address)
            .is_some_and(|slot| matches!(slot.state, SlotState::Connected { .. }))
    }
}

/// Insert an op into a connection FIFO
fn push_op(slot: &bleproxy_ble::pool::ConnectionSlot, op: GattOp) {
    let op_id = op.op_id;
    if slot.channels.ops_tx.try_send(op).is_err() {
        // FIFO full: the op never reaches the radio. The broker entry stays
        // in place and the deadline sweep resolves it as a timeout.
        warn!(op_id, address = %slot.address, "connection FIFO full");
    }
}

// ----------------------------------------------------------------------------
// Adapter Event Pump
// ----------------------------------------------------------------------------

/// Owns the batcher on the radio side of the daemon; advertisements batch
/// here, everything else is forwarded as-is
async fn run_event_pump(
    mut events: mpsc::Receiver<AdapterEvent>,
    tx: mpsc::Sender<PumpEvent>,
    mut batcher: Batcher,
) {
    loop {
        let deadline = batcher.next_deadline();
        let timer = async {
            match deadline {
                Some(at) => time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            event = events.recv() => match event {
                Some(AdapterEvent::Advertisement(adv)) => {
                    if let Some(batch) = batcher.add(adv) {
                        if tx.send(PumpEvent::Batch(batch)).await.is_err() {
                            return;
                        }
                    }
                }
                Some(AdapterEvent::Notification { address, handle, data }) => {
                    if tx.send(PumpEvent::Notification { address, handle, data }).await.is_err() {
                        return;
                    }
                }
                Some(AdapterEvent::PeripheralDisconnected { address }) => {
                    if tx.send(PumpEvent::PeripheralDisconnected { address }).await.is_err() {
                        return;
                    }
                }
                Some(AdapterEvent::ScanFailed { reason }) => {
                    if tx.send(PumpEvent::ScanFailed { reason }).await.is_err() {
                        return;
                    }
                }
                None => {
                    if let Some(batch) = batcher.force_flush() {
                        let _ = tx.send(PumpEvent::Batch(batch)).await;
                    }
                    return;
                }
            },
            _ = timer => {
                if let Some(batch) = batcher.flush_if_due() {
                    if tx.send(PumpEvent::Batch(batch)).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}
