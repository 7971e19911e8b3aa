//! End-to-end daemon tests
//!
//! Each test starts a full daemon against the mock adapter and speaks the
//! framed protocol over a real TCP socket, exactly as a home-automation hub
//! would.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use uuid::Uuid;

use bleproxy_ble::testing::{MockAdapter, MockPeripheral};
use bleproxy_core::config::ProxyConfig;
use bleproxy_core::frame::{encode_frame, FrameDecoder};
use bleproxy_core::message::MessageType;
use bleproxy_core::proto::{FieldValue, ProtoReader, ProtoWriter};
use bleproxy_core::types::{error_code, AddressType, Advertisement, GattCharacteristic, GattService};
use bleproxy_runtime::Daemon;

const RECV_TIMEOUT: Duration = Duration::from_secs(2);

// ----------------------------------------------------------------------------
// Test Client
// ----------------------------------------------------------------------------

/// Decoded fields of one received message
#[derive(Debug, Clone)]
enum Field {
    Varint(u64),
    Bytes(Vec<u8>),
}

impl Field {
    fn as_u64(&self) -> u64 {
        match self {
            Field::Varint(v) => *v,
            Field::Bytes(_) => panic!("expected varint field"),
        }
    }

    fn as_bytes(&self) -> &[u8] {
        match self {
            Field::Bytes(b) => b,
            Field::Varint(_) => panic!("expected bytes field"),
        }
    }

    fn as_str(&self) -> &str {
        std::str::from_utf8(self.as_bytes()).unwrap()
    }
}

fn parse_fields(payload: &[u8]) -> HashMap<u32, Vec<Field>> {
    let mut out: HashMap<u32, Vec<Field>> = HashMap::new();
    let mut reader = ProtoReader::new(payload);
    while let Some((field, value)) = reader.next_field().unwrap() {
        let parsed = match value {
            FieldValue::Varint(v) => Field::Varint(v),
            FieldValue::Bytes(b) => Field::Bytes(b.to_vec()),
        };
        out.entry(field).or_default().push(parsed);
    }
    out
}

fn first(fields: &HashMap<u32, Vec<Field>>, field: u32) -> Option<&Field> {
    fields.get(&field).and_then(|v| v.first())
}

struct TestClient {
    stream: TcpStream,
    decoder: FrameDecoder,
}

impl TestClient {
    async fn connect(addr: std::net::SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.unwrap();
        Self {
            stream,
            decoder: FrameDecoder::new(),
        }
    }

    async fn send(&mut self, msg_type: MessageType, build: impl FnOnce(&mut ProtoWriter)) {
        let mut w = ProtoWriter::new();
        build(&mut w);
        let frame = encode_frame(msg_type as u64, &w.into_bytes());
        self.stream.write_all(&frame).await.unwrap();
    }

    async fn send_empty(&mut self, msg_type: MessageType) {
        self.send(msg_type, |_| {}).await;
    }

    /// Receive the next frame, or `None` on a clean close
    async fn recv(&mut self) -> Option<(u64, Vec<u8>)> {
        let mut buf = [0u8; 4096];
        loop {
            if let Some(frame) = self.decoder.next_frame().unwrap() {
                return Some((frame.msg_type, frame.payload));
            }
            let n = timeout(RECV_TIMEOUT, self.stream.read(&mut buf))
                .await
                .expect("timed out waiting for a frame")
                .unwrap();
            if n == 0 {
                return None;
            }
            self.decoder.extend(&buf[..n]);
        }
    }

    async fn recv_expect(&mut self, expected: MessageType) -> HashMap<u32, Vec<Field>> {
        let (msg_type, payload) = self.recv().await.expect("peer closed unexpectedly");
        assert_eq!(
            msg_type, expected as u64,
            "expected {expected:?}, got message type {msg_type}"
        );
        parse_fields(&payload)
    }

    /// Expect the socket to close without further frames
    async fn expect_close(&mut self) {
        assert!(self.recv().await.is_none(), "expected the socket to close");
    }

    async fn hello(&mut self) {
        self.send(MessageType::HelloRequest, |w| {
            w.string(1, "test-client");
        })
        .await;
        let fields = self.recv_expect(MessageType::HelloResponse).await;
        assert_eq!(first(&fields, 1).unwrap().as_u64(), 1);
        assert_eq!(first(&fields, 2).unwrap().as_u64(), 10);
    }

    async fn authenticate(&mut self, password: &str) {
        self.send(MessageType::ConnectRequest, |w| {
            w.string(1, password);
        })
        .await;
        let fields = self.recv_expect(MessageType::ConnectResponse).await;
        assert!(first(&fields, 1).is_none(), "password should be accepted");
    }

    async fn handshake(&mut self) {
        self.hello().await;
        self.authenticate("").await;
    }

    /// Subscribe to scanner state and wait for the initial report. Because
    /// commands flow to the coordinator in order, this also guarantees any
    /// earlier subscription has been processed.
    async fn sync_with_coordinator(&mut self) {
        self.send_empty(MessageType::SubscribeStatesRequest).await;
        self.recv_expect(MessageType::ScannerStateResponse).await;
    }

    async fn connect_device(&mut self, address: u64) -> HashMap<u32, Vec<Field>> {
        self.send(MessageType::BleDeviceRequest, |w| {
            w.varint(1, address);
            w.varint(2, 0);
        })
        .await;
        self.recv_expect(MessageType::BleDeviceConnectionResponse)
            .await
    }
}

// ----------------------------------------------------------------------------
// Fixtures
// ----------------------------------------------------------------------------

fn test_config() -> ProxyConfig {
    ProxyConfig::default()
        .with_host("127.0.0.1")
        .with_port(0)
}

async fn start_daemon(config: ProxyConfig) -> (Daemon, Arc<MockAdapter>) {
    let adapter = MockAdapter::new();
    let daemon = Daemon::start(config, adapter.clone()).await.unwrap();
    (daemon, adapter)
}

fn battery_peripheral(address: u64) -> MockPeripheral {
    let service_uuid = Uuid::from_u128(0x0000180f_0000_1000_8000_00805f9b34fb);
    let chr_uuid = Uuid::from_u128(0x00002a19_0000_1000_8000_00805f9b34fb);
    MockPeripheral {
        address,
        services: vec![GattService {
            uuid: service_uuid,
            handle: 1,
            characteristics: vec![GattCharacteristic {
                uuid: chr_uuid,
                handle: 2,
                properties: 0x12,
                descriptors: vec![],
            }],
        }],
        values: HashMap::from([(2, vec![0x64]), (4, vec![0x01, 0x00])]),
        ..MockPeripheral::default()
    }
}

// ----------------------------------------------------------------------------
// Handshake
// ----------------------------------------------------------------------------

#[tokio::test]
async fn handshake_happy_path() {
    let (daemon, _adapter) = start_daemon(test_config()).await;
    let mut client = TestClient::connect(daemon.local_addr()).await;

    client.send(MessageType::HelloRequest, |w| {
        w.string(1, "probe");
    })
    .await;
    let fields = client.recv_expect(MessageType::HelloResponse).await;
    assert_eq!(first(&fields, 1).unwrap().as_u64(), 1);
    assert_eq!(first(&fields, 2).unwrap().as_u64(), 10);
    assert_eq!(first(&fields, 4).unwrap().as_str(), "bluetooth-proxy");

    client.authenticate("").await;

    client.send_empty(MessageType::DeviceInfoRequest).await;
    let fields = client.recv_expect(MessageType::DeviceInfoResponse).await;
    assert_eq!(first(&fields, 15).unwrap().as_u64(), 0x7f);
    assert_eq!(first(&fields, 18).unwrap().as_str(), "AA:BB:CC:DD:EE:FF");

    client.send_empty(MessageType::ListEntitiesRequest).await;
    client
        .recv_expect(MessageType::ListEntitiesDoneResponse)
        .await;

    daemon.shutdown().await;
}

#[tokio::test]
async fn wrong_password_closes_the_session() {
    let config = test_config().with_password(Some("good".into()));
    let (daemon, _adapter) = start_daemon(config).await;
    let mut client = TestClient::connect(daemon.local_addr()).await;

    client.hello().await;
    client
        .send(MessageType::ConnectRequest, |w| {
            w.string(1, "bad");
        })
        .await;
    let fields = client.recv_expect(MessageType::ConnectResponse).await;
    assert_eq!(first(&fields, 1).unwrap().as_u64(), 1);
    client.expect_close().await;

    daemon.shutdown().await;
}

#[tokio::test]
async fn device_info_probe_without_connect_when_unprotected() {
    let (daemon, _adapter) = start_daemon(test_config()).await;
    let mut client = TestClient::connect(daemon.local_addr()).await;

    client.hello().await;
    client.send_empty(MessageType::DeviceInfoRequest).await;
    let fields = client.recv_expect(MessageType::DeviceInfoResponse).await;
    assert!(first(&fields, 15).is_some());

    daemon.shutdown().await;
}

#[tokio::test]
async fn device_info_probe_refused_when_password_protected() {
    let config = test_config().with_password(Some("secret".into()));
    let (daemon, _adapter) = start_daemon(config).await;
    let mut client = TestClient::connect(daemon.local_addr()).await;

    client.hello().await;
    client.send_empty(MessageType::DeviceInfoRequest).await;
    client.expect_close().await;

    daemon.shutdown().await;
}

#[tokio::test]
async fn ping_is_answered_with_pong() {
    let (daemon, _adapter) = start_daemon(test_config()).await;
    let mut client = TestClient::connect(daemon.local_addr()).await;

    client.handshake().await;
    client.send_empty(MessageType::PingRequest).await;
    client.recv_expect(MessageType::PingResponse).await;

    daemon.shutdown().await;
}

// ----------------------------------------------------------------------------
// Advertisements
// ----------------------------------------------------------------------------

#[tokio::test]
async fn seventeen_advertisements_arrive_as_sixteen_plus_one() {
    let (daemon, adapter) = start_daemon(test_config()).await;
    let mut client = TestClient::connect(daemon.local_addr()).await;

    client.handshake().await;
    client
        .send(MessageType::SubscribeBleAdvertisementsRequest, |w| {
            w.varint(1, 0);
        })
        .await;
    client.sync_with_coordinator().await;
    assert_eq!(adapter.scan_active(), Some(false));

    for n in 0..17u64 {
        adapter
            .emit_advertisement(Advertisement::new(
                0x1000 + n,
                AddressType::Public,
                -40,
                vec![n as u8],
            ))
            .await;
    }

    let fields = client
        .recv_expect(MessageType::BleRawAdvertisementsResponse)
        .await;
    assert_eq!(fields.get(&1).map(|ads| ads.len()), Some(16));

    // Addresses inside the batch preserve radio-delivery order.
    let batch_addresses: Vec<u64> = fields[&1]
        .iter()
        .map(|ad| {
            let nested = parse_fields(ad.as_bytes());
            first(&nested, 1).unwrap().as_u64()
        })
        .collect();
    let expected: Vec<u64> = (0..16).map(|n| 0x1000 + n).collect();
    assert_eq!(batch_addresses, expected);

    // The straggler follows within the flush interval.
    let fields = client
        .recv_expect(MessageType::BleRawAdvertisementsResponse)
        .await;
    assert_eq!(fields.get(&1).map(|ads| ads.len()), Some(1));

    daemon.shutdown().await;
}

#[tokio::test]
async fn scanner_stops_when_last_subscriber_leaves() {
    let (daemon, adapter) = start_daemon(test_config()).await;
    let mut client = TestClient::connect(daemon.local_addr()).await;

    client.handshake().await;
    client
        .send(MessageType::SubscribeBleAdvertisementsRequest, |w| {
            w.varint(1, 0);
        })
        .await;
    client.sync_with_coordinator().await;
    assert!(adapter.scan_active().is_some());

    client
        .send_empty(MessageType::UnsubscribeBleAdvertisementsRequest)
        .await;
    // The state change report confirms the unsubscribe was processed.
    client.recv_expect(MessageType::ScannerStateResponse).await;
    assert_eq!(adapter.scan_active(), None);

    daemon.shutdown().await;
}

// ----------------------------------------------------------------------------
// Connections
// ----------------------------------------------------------------------------

#[tokio::test]
async fn connect_reports_mtu_and_disconnect_frees_the_slot() {
    let (daemon, adapter) = start_daemon(test_config()).await;
    adapter.add_peripheral(battery_peripheral(0xaa));
    let mut client = TestClient::connect(daemon.local_addr()).await;

    client.handshake().await;
    let fields = client.connect_device(0xaa).await;
    assert_eq!(first(&fields, 1).unwrap().as_u64(), 0xaa);
    assert_eq!(first(&fields, 2).unwrap().as_u64(), 1);
    assert_eq!(first(&fields, 3).unwrap().as_u64(), 247);
    assert!(adapter.is_connected(0xaa));

    client
        .send(MessageType::BleDeviceRequest, |w| {
            w.varint(1, 0xaa);
            w.varint(2, 1);
        })
        .await;
    let fields = client
        .recv_expect(MessageType::BleDeviceConnectionResponse)
        .await;
    assert!(first(&fields, 2).is_none(), "connected must be false");
    assert!(!adapter.is_connected(0xaa));

    daemon.shutdown().await;
}

#[tokio::test]
async fn fourth_connection_fails_with_pool_full() {
    let config = test_config().with_max_connections(3);
    let (daemon, adapter) = start_daemon(config).await;
    for address in [0xa1, 0xa2, 0xa3, 0xa4] {
        adapter.add_peripheral(battery_peripheral(address));
    }
    let mut client = TestClient::connect(daemon.local_addr()).await;

    client.handshake().await;
    for address in [0xa1u64, 0xa2, 0xa3] {
        let fields = client.connect_device(address).await;
        assert_eq!(first(&fields, 2).unwrap().as_u64(), 1);
    }

    let fields = client.connect_device(0xa4).await;
    assert!(first(&fields, 2).is_none(), "connected must be false");
    assert_eq!(
        first(&fields, 4).unwrap().as_u64(),
        u64::from(error_code::POOL_FULL)
    );
    assert!(!adapter.is_connected(0xa4));

    daemon.shutdown().await;
}

#[tokio::test]
async fn connect_failure_surfaces_the_error_and_frees_the_slot() {
    let (daemon, adapter) = start_daemon(test_config()).await;
    adapter.add_peripheral(MockPeripheral {
        address: 0xee,
        fail_connect: true,
        ..MockPeripheral::default()
    });
    let mut client = TestClient::connect(daemon.local_addr()).await;

    client.handshake().await;
    let fields = client.connect_device(0xee).await;
    assert!(first(&fields, 2).is_none(), "connected must be false");
    assert_ne!(first(&fields, 4).unwrap().as_u64(), 0);

    // The failed attempt released its slot.
    adapter.add_peripheral(battery_peripheral(0xaa));
    let fields = client.connect_device(0xaa).await;
    assert_eq!(first(&fields, 2).unwrap().as_u64(), 1);

    daemon.shutdown().await;
}

// ----------------------------------------------------------------------------
// GATT
// ----------------------------------------------------------------------------

#[tokio::test]
async fn gatt_responses_preserve_submission_order() {
    let (daemon, adapter) = start_daemon(test_config()).await;
    let mut peripheral = battery_peripheral(0xaa);
    peripheral.values.insert(2, vec![0x2a]);
    peripheral.values.insert(4, vec![0x01, 0x00]);
    peripheral.latency = Duration::from_millis(5);
    adapter.add_peripheral(peripheral);
    let mut client = TestClient::connect(daemon.local_addr()).await;

    client.handshake().await;
    client.connect_device(0xaa).await;

    client
        .send(MessageType::GattReadRequest, |w| {
            w.varint(1, 0xaa);
            w.varint(2, 2);
        })
        .await;
    client
        .send(MessageType::GattWriteRequest, |w| {
            w.varint(1, 0xaa);
            w.varint(2, 3);
            w.bool(3, true);
            w.bytes(4, &[0x01]);
        })
        .await;
    client
        .send(MessageType::GattReadRequest, |w| {
            w.varint(1, 0xaa);
            w.varint(2, 2);
        })
        .await;
    client
        .send(MessageType::GattReadDescriptorRequest, |w| {
            w.varint(1, 0xaa);
            w.varint(2, 4);
        })
        .await;

    let fields = client.recv_expect(MessageType::GattReadResponse).await;
    assert_eq!(first(&fields, 2).unwrap().as_u64(), 2);
    assert_eq!(first(&fields, 3).unwrap().as_bytes(), &[0x2a]);

    let fields = client.recv_expect(MessageType::GattWriteResponse).await;
    assert_eq!(first(&fields, 2).unwrap().as_u64(), 3);

    let fields = client.recv_expect(MessageType::GattReadResponse).await;
    assert_eq!(first(&fields, 2).unwrap().as_u64(), 2);

    let fields = client.recv_expect(MessageType::GattReadResponse).await;
    assert_eq!(first(&fields, 2).unwrap().as_u64(), 4);
    assert_eq!(first(&fields, 3).unwrap().as_bytes(), &[0x01, 0x00]);

    assert_eq!(adapter.writes(), vec![(0xaa, 3, vec![0x01], true)]);

    daemon.shutdown().await;
}

#[tokio::test]
async fn disconnect_drains_pending_reads_before_confirming() {
    let (daemon, adapter) = start_daemon(test_config()).await;
    let mut peripheral = battery_peripheral(0xaa);
    peripheral.latency = Duration::from_millis(50);
    adapter.add_peripheral(peripheral);
    let mut client = TestClient::connect(daemon.local_addr()).await;

    client.handshake().await;
    client.connect_device(0xaa).await;

    client
        .send(MessageType::GattReadRequest, |w| {
            w.varint(1, 0xaa);
            w.varint(2, 2);
        })
        .await;
    client
        .send(MessageType::BleDeviceRequest, |w| {
            w.varint(1, 0xaa);
            w.varint(2, 1);
        })
        .await;

    // The read resolves as disconnected before the disconnect confirmation.
    let fields = client.recv_expect(MessageType::GattErrorResponse).await;
    assert_eq!(first(&fields, 2).unwrap().as_u64(), 2);
    assert_eq!(
        first(&fields, 3).unwrap().as_u64(),
        u64::from(error_code::DISCONNECTED)
    );

    let fields = client
        .recv_expect(MessageType::BleDeviceConnectionResponse)
        .await;
    assert!(first(&fields, 2).is_none(), "connected must be false");

    daemon.shutdown().await;
}

#[tokio::test]
async fn gatt_request_against_unconnected_peripheral_errors() {
    let (daemon, _adapter) = start_daemon(test_config()).await;
    let mut client = TestClient::connect(daemon.local_addr()).await;

    client.handshake().await;
    client
        .send(MessageType::GattReadRequest, |w| {
            w.varint(1, 0xdead);
            w.varint(2, 2);
        })
        .await;
    let fields = client.recv_expect(MessageType::GattErrorResponse).await;
    assert_eq!(
        first(&fields, 3).unwrap().as_u64(),
        u64::from(error_code::NOT_CONNECTED)
    );

    daemon.shutdown().await;
}

// ----------------------------------------------------------------------------
// Notifications
// ----------------------------------------------------------------------------

#[tokio::test]
async fn notifications_reach_only_subscribed_sessions() {
    let (daemon, adapter) = start_daemon(test_config()).await;
    adapter.add_peripheral(battery_peripheral(0xaa));

    let mut subscriber = TestClient::connect(daemon.local_addr()).await;
    subscriber.handshake().await;
    subscriber.connect_device(0xaa).await;

    subscriber
        .send(MessageType::GattNotifyRequest, |w| {
            w.varint(1, 0xaa);
            w.varint(2, 2);
            w.bool(3, true);
        })
        .await;
    let fields = subscriber.recv_expect(MessageType::GattNotifyResponse).await;
    assert_eq!(first(&fields, 2).unwrap().as_u64(), 2);
    assert!(adapter.is_subscribed(0xaa, 2));

    adapter.emit_notification(0xaa, 2, vec![0x5a]).await;
    let fields = subscriber
        .recv_expect(MessageType::GattNotifyDataResponse)
        .await;
    assert_eq!(first(&fields, 1).unwrap().as_u64(), 0xaa);
    assert_eq!(first(&fields, 3).unwrap().as_bytes(), &[0x5a]);

    // A notification from a handle nobody subscribed to goes nowhere; the
    // next frame the subscriber sees is its own pong.
    adapter.emit_notification(0xaa, 9, vec![0xff]).await;
    subscriber.send_empty(MessageType::PingRequest).await;
    subscriber.recv_expect(MessageType::PingResponse).await;

    daemon.shutdown().await;
}

// ----------------------------------------------------------------------------
// Pairing and Cache Management
// ----------------------------------------------------------------------------

#[tokio::test]
async fn pair_unpair_and_clear_cache_round_trip() {
    let cache_dir = tempfile::tempdir().unwrap();
    let config = test_config().with_cache_dir(Some(cache_dir.path().to_path_buf()));
    let (daemon, adapter) = start_daemon(config).await;
    adapter.add_peripheral(battery_peripheral(0xaa));
    let mut client = TestClient::connect(daemon.local_addr()).await;

    client.handshake().await;
    client.connect_device(0xaa).await;

    client
        .send(MessageType::BleDeviceRequest, |w| {
            w.varint(1, 0xaa);
            w.varint(2, 2);
        })
        .await;
    let fields = client
        .recv_expect(MessageType::BleDevicePairingResponse)
        .await;
    assert_eq!(first(&fields, 2).unwrap().as_u64(), 1);

    client
        .send(MessageType::BleDeviceRequest, |w| {
            w.varint(1, 0xaa);
            w.varint(2, 3);
        })
        .await;
    let fields = client
        .recv_expect(MessageType::BleDeviceUnpairingResponse)
        .await;
    assert_eq!(first(&fields, 2).unwrap().as_u64(), 1);
    assert_eq!(adapter.unpairs(), vec![0xaa]);

    client
        .send(MessageType::BleDeviceRequest, |w| {
            w.varint(1, 0xaa);
            w.varint(2, 6);
        })
        .await;
    let fields = client
        .recv_expect(MessageType::BleDeviceClearCacheResponse)
        .await;
    assert_eq!(first(&fields, 2).unwrap().as_u64(), 1);
    assert_eq!(adapter.cache_clears(), vec![0xaa]);

    daemon.shutdown().await;
}

#[tokio::test]
async fn pairing_an_unconnected_peripheral_fails_cleanly() {
    let (daemon, _adapter) = start_daemon(test_config()).await;
    let mut client = TestClient::connect(daemon.local_addr()).await;

    client.handshake().await;
    client
        .send(MessageType::BleDeviceRequest, |w| {
            w.varint(1, 0xbb);
            w.varint(2, 2);
        })
        .await;
    let fields = client
        .recv_expect(MessageType::BleDevicePairingResponse)
        .await;
    assert!(first(&fields, 2).is_none(), "paired must be false");
    assert_eq!(
        first(&fields, 3).unwrap().as_u64(),
        u64::from(error_code::NOT_CONNECTED)
    );

    daemon.shutdown().await;
}

// ----------------------------------------------------------------------------
// Service Discovery and Cache Replay
// ----------------------------------------------------------------------------

async fn get_services_payloads(client: &mut TestClient, address: u64) -> Vec<u8> {
    client
        .send(MessageType::GattGetServicesRequest, |w| {
            w.varint(1, address);
        })
        .await;
    let (msg_type, payload) = client.recv().await.unwrap();
    assert_eq!(msg_type, MessageType::GattGetServicesResponse as u64);
    client
        .recv_expect(MessageType::GattGetServicesDoneResponse)
        .await;
    payload
}

#[tokio::test]
async fn cached_service_replay_matches_live_discovery() {
    let cache_dir = tempfile::tempdir().unwrap();
    let config = test_config().with_cache_dir(Some(cache_dir.path().to_path_buf()));
    let (daemon, adapter) = start_daemon(config).await;
    adapter.add_peripheral(battery_peripheral(0xaa));
    let mut client = TestClient::connect(daemon.local_addr()).await;

    client.handshake().await;
    client.connect_device(0xaa).await;

    let live = get_services_payloads(&mut client, 0xaa).await;
    let fields = parse_fields(&live);
    assert_eq!(fields.get(&2).map(|s| s.len()), Some(1));

    // Mutating the peripheral proves the second answer came from the cache.
    let mut changed = battery_peripheral(0xaa);
    changed.services[0].characteristics[0].handle = 99;
    adapter.add_peripheral(changed);

    let replayed = get_services_payloads(&mut client, 0xaa).await;
    assert_eq!(live, replayed);

    daemon.shutdown().await;
}

#[tokio::test]
async fn discovery_without_cache_hits_the_radio_each_time() {
    let (daemon, adapter) = start_daemon(test_config()).await;
    adapter.add_peripheral(battery_peripheral(0xaa));
    let mut client = TestClient::connect(daemon.local_addr()).await;

    client.handshake().await;
    client.connect_device(0xaa).await;

    let before = get_services_payloads(&mut client, 0xaa).await;

    let mut changed = battery_peripheral(0xaa);
    changed.services[0].characteristics[0].handle = 99;
    adapter.add_peripheral(changed);

    let after = get_services_payloads(&mut client, 0xaa).await;
    assert_ne!(before, after);

    daemon.shutdown().await;
}

// ----------------------------------------------------------------------------
// Connections-Free Reporting and Shutdown
// ----------------------------------------------------------------------------

#[tokio::test]
async fn connections_free_reports_initial_and_updated_counts() {
    let (daemon, adapter) = start_daemon(test_config()).await;
    adapter.add_peripheral(battery_peripheral(0xaa));
    let mut client = TestClient::connect(daemon.local_addr()).await;

    client.handshake().await;
    client
        .send_empty(MessageType::SubscribeConnectionsFreeRequest)
        .await;
    let fields = client
        .recv_expect(MessageType::ConnectionsFreeResponse)
        .await;
    assert_eq!(first(&fields, 1).unwrap().as_u64(), 3);
    assert_eq!(first(&fields, 2).unwrap().as_u64(), 3);

    client
        .send(MessageType::BleDeviceRequest, |w| {
            w.varint(1, 0xaa);
            w.varint(2, 0);
        })
        .await;
    // Occupancy change first, then the connection response.
    let fields = client
        .recv_expect(MessageType::ConnectionsFreeResponse)
        .await;
    assert_eq!(first(&fields, 1).unwrap().as_u64(), 2);
    client
        .recv_expect(MessageType::BleDeviceConnectionResponse)
        .await;

    daemon.shutdown().await;
}

#[tokio::test]
async fn shutdown_sends_disconnect_and_closes() {
    let (daemon, _adapter) = start_daemon(test_config()).await;
    let mut client = TestClient::connect(daemon.local_addr()).await;
    client.handshake().await;

    let shutdown = tokio::spawn(daemon.shutdown());
    let (msg_type, _) = client.recv().await.expect("disconnect frame expected");
    assert_eq!(msg_type, MessageType::DisconnectRequest as u64);
    client.expect_close().await;
    shutdown.await.unwrap();
}
