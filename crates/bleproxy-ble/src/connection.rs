//! Per-peripheral connection task
//!
//! One task owns each adapter connection and serializes GATT traffic on a
//! FIFO: the BLE stack cannot safely interleave requests to a single
//! peripheral. An explicit disconnect pre-empts queued work; queued requests
//! are resolved as disconnected without touching the radio.

use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use bleproxy_core::config::Timeouts;
use bleproxy_core::types::{error_code, DeviceAddress, GattService};

use crate::adapter::BleAdapter;
use crate::error::BleError;

use std::sync::Arc;

/// Depth of the per-connection request FIFO
pub const FIFO_DEPTH: usize = 64;

// ----------------------------------------------------------------------------
// Requests and Outcomes
// ----------------------------------------------------------------------------

/// The operation a queued GATT request performs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattOpKind {
    DiscoverServices,
    ReadChr,
    WriteChr { with_response: bool },
    ReadDesc,
    WriteDesc,
    NotifySet { enable: bool },
    Pair,
}

/// One serialized request against a connected peripheral
#[derive(Debug, Clone)]
pub struct GattOp {
    pub op_id: u64,
    pub kind: GattOpKind,
    pub handle: u16,
    pub data: Vec<u8>,
}

/// Successful result payload of a resolved operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpOutput {
    Done,
    Data(Vec<u8>),
    Services(Vec<GattService>),
}

/// Resolution of one operation; the error side carries the wire code
#[derive(Debug, Clone)]
pub struct GattOutcome {
    pub op_id: u64,
    pub address: u64,
    pub handle: u16,
    pub result: Result<OpOutput, u16>,
}

/// Events a connection task reports to its owner
#[derive(Debug, Clone)]
pub enum ConnEvent {
    Connected { address: u64, mtu: u16 },
    ConnectFailed { address: u64, error: u16 },
    Disconnected { address: u64 },
    OpResolved(GattOutcome),
}

// ----------------------------------------------------------------------------
// Connection Task
// ----------------------------------------------------------------------------

/// Channel pair handed to the pool slot for one spawned connection
pub struct ConnectionChannels {
    pub ops_tx: mpsc::Sender<GattOp>,
    pub disconnect_tx: mpsc::Sender<()>,
}

/// Owns a single adapter connection for its whole lifecycle
pub struct ConnectionTask {
    address: DeviceAddress,
    adapter: Arc<dyn BleAdapter>,
    timeouts: Timeouts,
    ops_rx: mpsc::Receiver<GattOp>,
    disconnect_rx: mpsc::Receiver<()>,
    events: mpsc::Sender<ConnEvent>,
}

impl ConnectionTask {
    /// Spawn the task; requests flow in on the returned channels
    pub fn spawn(
        address: DeviceAddress,
        adapter: Arc<dyn BleAdapter>,
        timeouts: Timeouts,
        events: mpsc::Sender<ConnEvent>,
    ) -> ConnectionChannels {
        let (ops_tx, ops_rx) = mpsc::channel(FIFO_DEPTH);
        let (disconnect_tx, disconnect_rx) = mpsc::channel(1);
        let task = Self {
            address,
            adapter,
            timeouts,
            ops_rx,
            disconnect_rx,
            events,
        };
        tokio::spawn(task.run());
        ConnectionChannels {
            ops_tx,
            disconnect_tx,
        }
    }

    async fn run(mut self) {
        let address = self.address.key();

        let handle = match timeout(self.timeouts.connect, self.adapter.connect(self.address)).await
        {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => {
                warn!(address = %self.address, error = %e, "connect failed");
                self.fail_queued(error_code::NOT_CONNECTED).await;
                let _ = self
                    .events
                    .send(ConnEvent::ConnectFailed {
                        address,
                        error: e.error_code(),
                    })
                    .await;
                return;
            }
            Err(_) => {
                warn!(address = %self.address, "connect timed out");
                self.fail_queued(error_code::NOT_CONNECTED).await;
                let _ = self
                    .events
                    .send(ConnEvent::ConnectFailed {
                        address,
                        error: error_code::TIMEOUT,
                    })
                    .await;
                return;
            }
        };

        let mtu = self.adapter.mtu(handle).await.unwrap_or(23);
        info!(address = %self.address, mtu, "peripheral connected");
        if self
            .events
            .send(ConnEvent::Connected { address, mtu })
            .await
            .is_err()
        {
            let _ = self.adapter.disconnect(handle).await;
            return;
        }

        loop {
            tokio::select! {
                biased;
                _ = self.disconnect_rx.recv() => break,
                op = self.ops_rx.recv() => match op {
                    Some(op) => {
                        let outcome = self.execute(handle, op).await;
                        if self.events.send(ConnEvent::OpResolved(outcome)).await.is_err() {
                            break;
                        }
                    }
                    // Owner dropped the slot; treat as a disconnect request.
                    None => break,
                },
            }
        }

        // Queued requests never reach the radio once disconnect is underway.
        self.fail_queued(error_code::DISCONNECTED).await;

        if let Err(e) = timeout(self.timeouts.disconnect, self.adapter.disconnect(handle)).await {
            debug!(address = %self.address, error = %e, "disconnect confirmation timed out");
        }
        info!(address = %self.address, "peripheral disconnected");
        let _ = self.events.send(ConnEvent::Disconnected { address }).await;
    }

    /// Resolve every queued request with `error` without executing it
    async fn fail_queued(&mut self, error: u16) {
        self.ops_rx.close();
        while let Ok(op) = self.ops_rx.try_recv() {
            let _ = self
                .events
                .send(ConnEvent::OpResolved(GattOutcome {
                    op_id: op.op_id,
                    address: self.address.key(),
                    handle: op.handle,
                    result: Err(error),
                }))
                .await;
        }
    }

    async fn execute(&self, handle: crate::adapter::ConnectionHandle, op: GattOp) -> GattOutcome {
        let address = self.address.key();
        let work = async {
            match &op.kind {
                GattOpKind::DiscoverServices => self
                    .adapter
                    .discover_services(handle)
                    .await
                    .map(OpOutput::Services),
                GattOpKind::ReadChr => self
                    .adapter
                    .read_chr(handle, op.handle)
                    .await
                    .map(OpOutput::Data),
                GattOpKind::WriteChr { with_response } => self
                    .adapter
                    .write_chr(handle, op.handle, &op.data, *with_response)
                    .await
                    .map(|_| OpOutput::Done),
                GattOpKind::ReadDesc => self
                    .adapter
                    .read_desc(handle, op.handle)
                    .await
                    .map(OpOutput::Data),
                GattOpKind::WriteDesc => self
                    .adapter
                    .write_desc(handle, op.handle, &op.data)
                    .await
                    .map(|_| OpOutput::Done),
                GattOpKind::NotifySet { enable } => {
                    let result = if *enable {
                        self.adapter.subscribe_notify(handle, op.handle).await
                    } else {
                        self.adapter.unsubscribe_notify(handle, op.handle).await
                    };
                    result.map(|_| OpOutput::Done)
                }
                GattOpKind::Pair => self.adapter.pair(handle).await.map(|_| OpOutput::Done),
            }
        };

        let result = match timeout(self.timeouts.gatt_op, work).await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => {
                debug!(address = %self.address, op_id = op.op_id, error = %e, "operation failed");
                Err(e.error_code())
            }
            Err(_) => Err(BleError::OperationTimeout.error_code()),
        };

        GattOutcome {
            op_id: op.op_id,
            address,
            handle: op.handle,
            result,
        }
    }
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockAdapter, MockPeripheral};
    use bleproxy_core::types::AddressType;
    use std::collections::HashMap;
    use std::time::Duration;

    fn addr(n: u64) -> DeviceAddress {
        DeviceAddress::new(n, AddressType::Public)
    }

    async fn recv(events: &mut mpsc::Receiver<ConnEvent>) -> ConnEvent {
        tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("timed out waiting for a connection event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn connect_failure_is_reported_and_task_ends() {
        let adapter = MockAdapter::new();
        adapter.add_peripheral(MockPeripheral {
            address: 0xaa,
            fail_connect: true,
            ..MockPeripheral::default()
        });
        let (events_tx, mut events) = mpsc::channel(8);

        let _channels =
            ConnectionTask::spawn(addr(0xaa), adapter, Timeouts::default(), events_tx);

        match recv(&mut events).await {
            ConnEvent::ConnectFailed { address, error } => {
                assert_eq!(address, 0xaa);
                assert_ne!(error, 0);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn ops_execute_in_fifo_order() {
        let adapter = MockAdapter::new();
        adapter.add_peripheral(MockPeripheral {
            address: 0xaa,
            values: HashMap::from([(2, vec![0x11]), (5, vec![0x22])]),
            ..MockPeripheral::default()
        });
        let (events_tx, mut events) = mpsc::channel(8);

        let channels =
            ConnectionTask::spawn(addr(0xaa), adapter, Timeouts::default(), events_tx);

        assert!(matches!(
            recv(&mut events).await,
            ConnEvent::Connected { address: 0xaa, .. }
        ));

        for (op_id, handle) in [(1, 2u16), (2, 5u16)] {
            channels
                .ops_tx
                .send(GattOp {
                    op_id,
                    kind: GattOpKind::ReadChr,
                    handle,
                    data: Vec::new(),
                })
                .await
                .unwrap();
        }

        for (op_id, expected) in [(1u64, vec![0x11u8]), (2, vec![0x22])] {
            match recv(&mut events).await {
                ConnEvent::OpResolved(outcome) => {
                    assert_eq!(outcome.op_id, op_id);
                    assert_eq!(outcome.result, Ok(OpOutput::Data(expected)));
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn disconnect_preempts_queued_ops() {
        let adapter = MockAdapter::new();
        adapter.add_peripheral(MockPeripheral {
            address: 0xaa,
            values: HashMap::from([(2, vec![0x11])]),
            latency: Duration::from_millis(20),
            ..MockPeripheral::default()
        });
        let (events_tx, mut events) = mpsc::channel(8);

        let channels = ConnectionTask::spawn(
            addr(0xaa),
            adapter.clone(),
            Timeouts::default(),
            events_tx,
        );
        assert!(matches!(
            recv(&mut events).await,
            ConnEvent::Connected { .. }
        ));

        // One op goes in flight, a second stays queued behind it.
        for op_id in [1, 2] {
            channels
                .ops_tx
                .send(GattOp {
                    op_id,
                    kind: GattOpKind::ReadChr,
                    handle: 2,
                    data: Vec::new(),
                })
                .await
                .unwrap();
        }
        channels.disconnect_tx.send(()).await.unwrap();

        let mut resolved = Vec::new();
        loop {
            match recv(&mut events).await {
                ConnEvent::OpResolved(outcome) => resolved.push(outcome),
                ConnEvent::Disconnected { address } => {
                    assert_eq!(address, 0xaa);
                    break;
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
        assert!(!adapter.is_connected(0xaa));
        // Every submitted op resolved before the disconnect confirmation,
        // and anything still queued resolved as disconnected.
        assert_eq!(resolved.len(), 2);
        assert!(resolved
            .iter()
            .any(|o| o.result == Err(bleproxy_core::types::error_code::DISCONNECTED)));
    }
}
