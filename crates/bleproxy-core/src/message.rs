//! ESPHome native-API message catalogue
//!
//! Inbound messages decode into [`ClientMessage`]; everything the daemon can
//! emit encodes from [`ServerMessage`]. Message-type numbering follows the
//! native API so stock home-automation clients interoperate unmodified.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DecodeError;
use crate::proto::{ProtoReader, ProtoWriter};
use crate::types::{
    AddressType, Advertisement, GattCharacteristic, GattDescriptor, GattService, ScannerMode,
    ScannerState,
};

// ----------------------------------------------------------------------------
// Message Types
// ----------------------------------------------------------------------------

/// Wire identifiers for every message this daemon understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u64)]
pub enum MessageType {
    HelloRequest = 1,
    HelloResponse = 2,
    ConnectRequest = 3,
    ConnectResponse = 4,
    DisconnectRequest = 5,
    DisconnectResponse = 6,
    PingRequest = 7,
    PingResponse = 8,
    DeviceInfoRequest = 9,
    DeviceInfoResponse = 10,
    ListEntitiesRequest = 11,
    ListEntitiesDoneResponse = 19,
    SubscribeStatesRequest = 20,
    SubscribeBleAdvertisementsRequest = 66,
    BleDeviceRequest = 68,
    BleDeviceConnectionResponse = 69,
    GattGetServicesRequest = 70,
    GattGetServicesResponse = 71,
    GattGetServicesDoneResponse = 72,
    GattReadRequest = 73,
    GattReadResponse = 74,
    GattWriteRequest = 75,
    GattReadDescriptorRequest = 76,
    GattWriteDescriptorRequest = 77,
    GattNotifyRequest = 78,
    GattNotifyDataResponse = 79,
    SubscribeConnectionsFreeRequest = 80,
    ConnectionsFreeResponse = 81,
    GattErrorResponse = 82,
    GattWriteResponse = 83,
    GattNotifyResponse = 84,
    BleDevicePairingResponse = 85,
    BleDeviceUnpairingResponse = 86,
    UnsubscribeBleAdvertisementsRequest = 87,
    BleDeviceClearCacheResponse = 88,
    BleRawAdvertisementsResponse = 93,
    ScannerStateResponse = 126,
    ScannerSetModeRequest = 127,
}

impl MessageType {
    pub fn from_wire(value: u64) -> Result<Self, DecodeError> {
        use MessageType::*;
        Ok(match value {
            1 => HelloRequest,
            2 => HelloResponse,
            3 => ConnectRequest,
            4 => ConnectResponse,
            5 => DisconnectRequest,
            6 => DisconnectResponse,
            7 => PingRequest,
            8 => PingResponse,
            9 => DeviceInfoRequest,
            10 => DeviceInfoResponse,
            11 => ListEntitiesRequest,
            19 => ListEntitiesDoneResponse,
            20 => SubscribeStatesRequest,
            66 => SubscribeBleAdvertisementsRequest,
            68 => BleDeviceRequest,
            69 => BleDeviceConnectionResponse,
            70 => GattGetServicesRequest,
            71 => GattGetServicesResponse,
            72 => GattGetServicesDoneResponse,
            73 => GattReadRequest,
            74 => GattReadResponse,
            75 => GattWriteRequest,
            76 => GattReadDescriptorRequest,
            77 => GattWriteDescriptorRequest,
            78 => GattNotifyRequest,
            79 => GattNotifyDataResponse,
            80 => SubscribeConnectionsFreeRequest,
            81 => ConnectionsFreeResponse,
            82 => GattErrorResponse,
            83 => GattWriteResponse,
            84 => GattNotifyResponse,
            85 => BleDevicePairingResponse,
            86 => BleDeviceUnpairingResponse,
            87 => UnsubscribeBleAdvertisementsRequest,
            88 => BleDeviceClearCacheResponse,
            93 => BleRawAdvertisementsResponse,
            126 => ScannerStateResponse,
            127 => ScannerSetModeRequest,
            other => return Err(DecodeError::UnknownMessageType(other)),
        })
    }
}

/// Operation selector inside a `BleDeviceRequest`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceRequestKind {
    Connect,
    Disconnect,
    Pair,
    Unpair,
    ClearCache,
}

impl DeviceRequestKind {
    pub fn from_wire(value: u64) -> Result<Self, DecodeError> {
        Ok(match value {
            0 => DeviceRequestKind::Connect,
            1 => DeviceRequestKind::Disconnect,
            2 => DeviceRequestKind::Pair,
            3 => DeviceRequestKind::Unpair,
            6 => DeviceRequestKind::ClearCache,
            other => {
                return Err(DecodeError::InvalidEnumValue {
                    field: "device request type",
                    value: other,
                })
            }
        })
    }
}

// ----------------------------------------------------------------------------
// Inbound Messages
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloRequest {
    pub client_info: String,
    pub api_version_major: u32,
    pub api_version_minor: u32,
}

impl Default for HelloRequest {
    fn default() -> Self {
        Self {
            client_info: String::new(),
            api_version_major: 1,
            api_version_minor: 10,
        }
    }
}

/// Every message a control client can send
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    Hello(HelloRequest),
    Connect { password: String },
    Disconnect,
    DisconnectAck,
    Ping,
    Pong,
    DeviceInfo,
    ListEntities,
    SubscribeStates,
    SubscribeAdvertisements { flags: u32 },
    UnsubscribeAdvertisements,
    DeviceRequest {
        address: u64,
        kind: DeviceRequestKind,
        address_type: Option<AddressType>,
    },
    GetServices { address: u64 },
    GattRead { address: u64, handle: u16 },
    GattWrite {
        address: u64,
        handle: u16,
        response: bool,
        data: Vec<u8>,
    },
    GattReadDescriptor { address: u64, handle: u16 },
    GattWriteDescriptor {
        address: u64,
        handle: u16,
        data: Vec<u8>,
    },
    GattNotify {
        address: u64,
        handle: u16,
        enable: bool,
    },
    SubscribeConnectionsFree,
    ScannerSetMode { mode: ScannerMode },
}

impl ClientMessage {
    /// Decode one inbound frame payload
    pub fn decode(msg_type: MessageType, payload: &[u8]) -> Result<Self, DecodeError> {
        match msg_type {
            MessageType::HelloRequest => decode_hello(payload),
            MessageType::ConnectRequest => decode_connect(payload),
            MessageType::DisconnectRequest => Ok(ClientMessage::Disconnect),
            MessageType::DisconnectResponse => Ok(ClientMessage::DisconnectAck),
            MessageType::PingRequest => Ok(ClientMessage::Ping),
            MessageType::PingResponse => Ok(ClientMessage::Pong),
            MessageType::DeviceInfoRequest => Ok(ClientMessage::DeviceInfo),
            MessageType::ListEntitiesRequest => Ok(ClientMessage::ListEntities),
            MessageType::SubscribeStatesRequest => Ok(ClientMessage::SubscribeStates),
            MessageType::SubscribeBleAdvertisementsRequest => {
                let mut flags = 0u32;
                for_each_field(payload, |field, value| {
                    if field == 1 {
                        flags = value.as_u32()?;
                    }
                    Ok(())
                })?;
                Ok(ClientMessage::SubscribeAdvertisements { flags })
            }
            MessageType::UnsubscribeBleAdvertisementsRequest => {
                Ok(ClientMessage::UnsubscribeAdvertisements)
            }
            MessageType::BleDeviceRequest => decode_device_request(payload),
            MessageType::GattGetServicesRequest => {
                let mut address = 0;
                for_each_field(payload, |field, value| {
                    if field == 1 {
                        address = value.as_u64()?;
                    }
                    Ok(())
                })?;
                Ok(ClientMessage::GetServices { address })
            }
            MessageType::GattReadRequest => {
                let (address, handle) = decode_address_handle(payload)?;
                Ok(ClientMessage::GattRead { address, handle })
            }
            MessageType::GattWriteRequest => decode_gatt_write(payload),
            MessageType::GattReadDescriptorRequest => {
                let (address, handle) = decode_address_handle(payload)?;
                Ok(ClientMessage::GattReadDescriptor { address, handle })
            }
            MessageType::GattWriteDescriptorRequest => {
                let mut address = 0;
                let mut handle = 0;
                let mut data = Vec::new();
                for_each_field(payload, |field, value| {
                    match field {
                        1 => address = value.as_u64()?,
                        2 => handle = value.as_u16()?,
                        3 => data = value.as_bytes()?.to_vec(),
                        _ => {}
                    }
                    Ok(())
                })?;
                Ok(ClientMessage::GattWriteDescriptor {
                    address,
                    handle,
                    data,
                })
            }
            MessageType::GattNotifyRequest => {
                let mut address = 0;
                let mut handle = 0;
                let mut enable = false;
                for_each_field(payload, |field, value| {
                    match field {
                        1 => address = value.as_u64()?,
                        2 => handle = value.as_u16()?,
                        3 => enable = value.as_bool()?,
                        _ => {}
                    }
                    Ok(())
                })?;
                Ok(ClientMessage::GattNotify {
                    address,
                    handle,
                    enable,
                })
            }
            MessageType::SubscribeConnectionsFreeRequest => {
                Ok(ClientMessage::SubscribeConnectionsFree)
            }
            MessageType::ScannerSetModeRequest => {
                let mut mode = ScannerMode::Passive;
                for_each_field(payload, |field, value| {
                    if field == 1 {
                        mode = ScannerMode::from_wire(value.as_u64()?)?;
                    }
                    Ok(())
                })?;
                Ok(ClientMessage::ScannerSetMode { mode })
            }
            other => Err(DecodeError::UnknownMessageType(other as u64)),
        }
    }
}

fn for_each_field<F>(payload: &[u8], mut f: F) -> Result<(), DecodeError>
where
    F: FnMut(u32, crate::proto::FieldValue<'_>) -> Result<(), DecodeError>,
{
    let mut reader = ProtoReader::new(payload);
    while let Some((field, value)) = reader.next_field()? {
        f(field, value)?;
    }
    Ok(())
}

fn decode_hello(payload: &[u8]) -> Result<ClientMessage, DecodeError> {
    let mut msg = HelloRequest::default();
    for_each_field(payload, |field, value| {
        match field {
            1 => msg.client_info = value.as_str()?.to_string(),
            2 => msg.api_version_major = value.as_u32()?,
            3 => msg.api_version_minor = value.as_u32()?,
            _ => {}
        }
        Ok(())
    })?;
    Ok(ClientMessage::Hello(msg))
}

fn decode_connect(payload: &[u8]) -> Result<ClientMessage, DecodeError> {
    let mut password = String::new();
    for_each_field(payload, |field, value| {
        if field == 1 {
            password = value.as_str()?.to_string();
        }
        Ok(())
    })?;
    Ok(ClientMessage::Connect { password })
}

fn decode_device_request(payload: &[u8]) -> Result<ClientMessage, DecodeError> {
    let mut address = 0;
    let mut kind = DeviceRequestKind::Connect;
    let mut has_address_type = false;
    let mut address_type = AddressType::Public;
    for_each_field(payload, |field, value| {
        match field {
            1 => address = value.as_u64()?,
            2 => kind = DeviceRequestKind::from_wire(value.as_u64()?)?,
            3 => has_address_type = value.as_bool()?,
            4 => address_type = AddressType::from_wire(value.as_u64()?),
            _ => {}
        }
        Ok(())
    })?;
    Ok(ClientMessage::DeviceRequest {
        address,
        kind,
        address_type: has_address_type.then_some(address_type),
    })
}

fn decode_address_handle(payload: &[u8]) -> Result<(u64, u16), DecodeError> {
    let mut address = 0;
    let mut handle = 0;
    for_each_field(payload, |field, value| {
        match field {
            1 => address = value.as_u64()?,
            2 => handle = value.as_u16()?,
            _ => {}
        }
        Ok(())
    })?;
    Ok((address, handle))
}

fn decode_gatt_write(payload: &[u8]) -> Result<ClientMessage, DecodeError> {
    let mut address = 0;
    let mut handle = 0;
    let mut response = false;
    let mut data = Vec::new();
    for_each_field(payload, |field, value| {
        match field {
            1 => address = value.as_u64()?,
            2 => handle = value.as_u16()?,
            3 => response = value.as_bool()?,
            4 => data = value.as_bytes()?.to_vec(),
            _ => {}
        }
        Ok(())
    })?;
    Ok(ClientMessage::GattWrite {
        address,
        handle,
        response,
        data,
    })
}

// ----------------------------------------------------------------------------
// Outbound Messages
// ----------------------------------------------------------------------------

/// Static device description returned for DeviceInfoRequest
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub uses_password: bool,
    pub name: String,
    pub mac_address: String,
    pub esphome_version: String,
    pub compilation_time: String,
    pub model: String,
    pub project_name: String,
    pub project_version: String,
    pub webserver_port: u32,
    pub manufacturer: String,
    pub friendly_name: String,
    pub bluetooth_proxy_feature_flags: u32,
    pub bluetooth_mac_address: String,
}

/// Every message the daemon can emit
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    Hello {
        api_version_major: u32,
        api_version_minor: u32,
        server_info: String,
        name: String,
    },
    ConnectResponse { invalid_password: bool },
    DisconnectRequest,
    DisconnectResponse,
    Ping,
    Pong,
    DeviceInfo(DeviceInfo),
    ListEntitiesDone,
    RawAdvertisements(Vec<Advertisement>),
    ScannerState {
        state: ScannerState,
        mode: ScannerMode,
    },
    DeviceConnection {
        address: u64,
        connected: bool,
        mtu: u16,
        error: u16,
    },
    GattServices {
        address: u64,
        services: Vec<GattService>,
    },
    GattServicesDone { address: u64 },
    GattRead {
        address: u64,
        handle: u16,
        data: Vec<u8>,
    },
    GattWrite { address: u64, handle: u16 },
    GattNotifyConfirm { address: u64, handle: u16 },
    GattNotifyData {
        address: u64,
        handle: u16,
        data: Vec<u8>,
    },
    GattError {
        address: u64,
        handle: u16,
        error: u16,
    },
    ConnectionsFree { free: u32, limit: u32 },
    DevicePairing {
        address: u64,
        paired: bool,
        error: u16,
    },
    DeviceUnpairing {
        address: u64,
        success: bool,
        error: u16,
    },
    DeviceClearCache {
        address: u64,
        success: bool,
        error: u16,
    },
}

impl ServerMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            ServerMessage::Hello { .. } => MessageType::HelloResponse,
            ServerMessage::ConnectResponse { .. } => MessageType::ConnectResponse,
            ServerMessage::DisconnectRequest => MessageType::DisconnectRequest,
            ServerMessage::DisconnectResponse => MessageType::DisconnectResponse,
            ServerMessage::Ping => MessageType::PingRequest,
            ServerMessage::Pong => MessageType::PingResponse,
            ServerMessage::DeviceInfo(_) => MessageType::DeviceInfoResponse,
            ServerMessage::ListEntitiesDone => MessageType::ListEntitiesDoneResponse,
            ServerMessage::RawAdvertisements(_) => MessageType::BleRawAdvertisementsResponse,
            ServerMessage::ScannerState { .. } => MessageType::ScannerStateResponse,
            ServerMessage::DeviceConnection { .. } => MessageType::BleDeviceConnectionResponse,
            ServerMessage::GattServices { .. } => MessageType::GattGetServicesResponse,
            ServerMessage::GattServicesDone { .. } => MessageType::GattGetServicesDoneResponse,
            ServerMessage::GattRead { .. } => MessageType::GattReadResponse,
            ServerMessage::GattWrite { .. } => MessageType::GattWriteResponse,
            ServerMessage::GattNotifyConfirm { .. } => MessageType::GattNotifyResponse,
            ServerMessage::GattNotifyData { .. } => MessageType::GattNotifyDataResponse,
            ServerMessage::GattError { .. } => MessageType::GattErrorResponse,
            ServerMessage::ConnectionsFree { .. } => MessageType::ConnectionsFreeResponse,
            ServerMessage::DevicePairing { .. } => MessageType::BleDevicePairingResponse,
            ServerMessage::DeviceUnpairing { .. } => MessageType::BleDeviceUnpairingResponse,
            ServerMessage::DeviceClearCache { .. } => MessageType::BleDeviceClearCacheResponse,
        }
    }

    /// Encode the message payload (framing is applied by the writer task)
    pub fn encode(&self) -> Vec<u8> {
        let mut w = ProtoWriter::new();
        match self {
            ServerMessage::Hello {
                api_version_major,
                api_version_minor,
                server_info,
                name,
            } => {
                w.varint(1, u64::from(*api_version_major));
                w.varint(2, u64::from(*api_version_minor));
                w.string(3, server_info);
                w.string(4, name);
            }
            ServerMessage::ConnectResponse { invalid_password } => {
                w.bool(1, *invalid_password);
            }
            ServerMessage::DisconnectRequest
            | ServerMessage::DisconnectResponse
            | ServerMessage::Ping
            | ServerMessage::Pong
            | ServerMessage::ListEntitiesDone => {}
            ServerMessage::DeviceInfo(info) => {
                w.bool(1, info.uses_password);
                w.string(2, &info.name);
                w.string(3, &info.mac_address);
                w.string(4, &info.esphome_version);
                w.string(5, &info.compilation_time);
                w.string(6, &info.model);
                w.string(8, &info.project_name);
                w.string(9, &info.project_version);
                w.varint(10, u64::from(info.webserver_port));
                w.string(12, &info.manufacturer);
                w.string(13, &info.friendly_name);
                w.varint(15, u64::from(info.bluetooth_proxy_feature_flags));
                w.string(18, &info.bluetooth_mac_address);
            }
            ServerMessage::RawAdvertisements(ads) => {
                for ad in ads {
                    let mut nested = ProtoWriter::new();
                    nested.varint(1, ad.address);
                    nested.sint32(2, i32::from(ad.rssi));
                    nested.varint(3, ad.address_type.to_wire());
                    nested.bytes(4, &ad.data);
                    w.message(1, &nested.into_bytes());
                }
            }
            ServerMessage::ScannerState { state, mode } => {
                w.varint(1, state.to_wire());
                w.varint(2, mode.to_wire());
            }
            ServerMessage::DeviceConnection {
                address,
                connected,
                mtu,
                error,
            } => {
                w.varint(1, *address);
                w.bool(2, *connected);
                w.varint(3, u64::from(*mtu));
                w.varint(4, u64::from(*error));
            }
            ServerMessage::GattServices { address, services } => {
                w.varint(1, *address);
                for service in services {
                    w.message(2, &encode_service(service));
                }
            }
            ServerMessage::GattServicesDone { address } => {
                w.varint(1, *address);
            }
            ServerMessage::GattRead {
                address,
                handle,
                data,
            }
            | ServerMessage::GattNotifyData {
                address,
                handle,
                data,
            } => {
                w.varint(1, *address);
                w.varint(2, u64::from(*handle));
                w.bytes(3, data);
            }
            ServerMessage::GattWrite { address, handle }
            | ServerMessage::GattNotifyConfirm { address, handle } => {
                w.varint(1, *address);
                w.varint(2, u64::from(*handle));
            }
            ServerMessage::GattError {
                address,
                handle,
                error,
            } => {
                w.varint(1, *address);
                w.varint(2, u64::from(*handle));
                w.varint(3, u64::from(*error));
            }
            ServerMessage::ConnectionsFree { free, limit } => {
                w.varint(1, u64::from(*free));
                w.varint(2, u64::from(*limit));
            }
            ServerMessage::DevicePairing {
                address,
                paired,
                error,
            } => {
                w.varint(1, *address);
                w.bool(2, *paired);
                w.varint(3, u64::from(*error));
            }
            ServerMessage::DeviceUnpairing {
                address,
                success,
                error,
            }
            | ServerMessage::DeviceClearCache {
                address,
                success,
                error,
            } => {
                w.varint(1, *address);
                w.bool(2, *success);
                w.varint(3, u64::from(*error));
            }
        }
        w.into_bytes()
    }
}

fn encode_uuid(w: &mut ProtoWriter, field: u32, uuid: &Uuid) {
    let value = uuid.as_u128();
    w.varint(field, (value >> 64) as u64);
    w.varint(field, value as u64);
}

fn encode_service(service: &GattService) -> Vec<u8> {
    let mut w = ProtoWriter::new();
    encode_uuid(&mut w, 1, &service.uuid);
    w.varint(2, u64::from(service.handle));
    for chr in &service.characteristics {
        w.message(3, &encode_characteristic(chr));
    }
    w.into_bytes()
}

fn encode_characteristic(chr: &GattCharacteristic) -> Vec<u8> {
    let mut w = ProtoWriter::new();
    encode_uuid(&mut w, 1, &chr.uuid);
    w.varint(2, u64::from(chr.handle));
    w.varint(3, u64::from(chr.properties));
    for desc in &chr.descriptors {
        w.message(4, &encode_descriptor(desc));
    }
    w.into_bytes()
}

fn encode_descriptor(desc: &GattDescriptor) -> Vec<u8> {
    let mut w = ProtoWriter::new();
    encode_uuid(&mut w, 1, &desc.uuid);
    w.varint(2, u64::from(desc.handle));
    w.into_bytes()
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::FieldValue;

    fn encode_client(build: impl FnOnce(&mut ProtoWriter)) -> Vec<u8> {
        let mut w = ProtoWriter::new();
        build(&mut w);
        w.into_bytes()
    }

    #[test]
    fn hello_request_decodes_fields() {
        let payload = encode_client(|w| {
            w.string(1, "probe");
            w.varint(2, 1);
            w.varint(3, 9);
        });
        let msg = ClientMessage::decode(MessageType::HelloRequest, &payload).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Hello(HelloRequest {
                client_info: "probe".into(),
                api_version_major: 1,
                api_version_minor: 9,
            })
        );
    }

    #[test]
    fn hello_request_empty_payload_uses_defaults() {
        let msg = ClientMessage::decode(MessageType::HelloRequest, &[]).unwrap();
        assert_eq!(msg, ClientMessage::Hello(HelloRequest::default()));
    }

    #[test]
    fn connect_request_decodes_password() {
        let payload = encode_client(|w| w.string(1, "hunter2"));
        let msg = ClientMessage::decode(MessageType::ConnectRequest, &payload).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Connect {
                password: "hunter2".into()
            }
        );
    }

    #[test]
    fn device_request_with_address_type() {
        let payload = encode_client(|w| {
            w.varint(1, 0xaabbccddeeff);
            w.varint(2, 0);
            w.bool(3, true);
            w.varint(4, 1);
        });
        let msg = ClientMessage::decode(MessageType::BleDeviceRequest, &payload).unwrap();
        assert_eq!(
            msg,
            ClientMessage::DeviceRequest {
                address: 0xaabbccddeeff,
                kind: DeviceRequestKind::Connect,
                address_type: Some(AddressType::Random),
            }
        );
    }

    #[test]
    fn device_request_unknown_kind_rejected() {
        let payload = encode_client(|w| {
            w.varint(1, 1);
            w.varint(2, 9);
        });
        assert!(ClientMessage::decode(MessageType::BleDeviceRequest, &payload).is_err());
    }

    #[test]
    fn gatt_write_decodes_all_fields() {
        let payload = encode_client(|w| {
            w.varint(1, 42);
            w.varint(2, 3);
            w.bool(3, true);
            w.bytes(4, &[0x01, 0x02]);
        });
        let msg = ClientMessage::decode(MessageType::GattWriteRequest, &payload).unwrap();
        assert_eq!(
            msg,
            ClientMessage::GattWrite {
                address: 42,
                handle: 3,
                response: true,
                data: vec![0x01, 0x02],
            }
        );
    }

    #[test]
    fn unknown_fields_are_skipped() {
        let payload = encode_client(|w| {
            w.string(1, "client");
            w.varint(99, 7);
            w.bytes(98, &[1, 2, 3]);
        });
        let msg = ClientMessage::decode(MessageType::HelloRequest, &payload).unwrap();
        match msg {
            ClientMessage::Hello(hello) => assert_eq!(hello.client_info, "client"),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn unknown_message_type_rejected() {
        assert_eq!(
            MessageType::from_wire(999),
            Err(DecodeError::UnknownMessageType(999))
        );
    }

    #[test]
    fn hello_response_encodes_expected_fields() {
        let msg = ServerMessage::Hello {
            api_version_major: 1,
            api_version_minor: 10,
            server_info: "bleproxy 0.1.0".into(),
            name: "bluetooth-proxy".into(),
        };
        assert_eq!(msg.message_type(), MessageType::HelloResponse);

        let bytes = msg.encode();
        let mut fields = Vec::new();
        let mut r = ProtoReader::new(&bytes);
        while let Some((f, v)) = r.next_field().unwrap() {
            fields.push((f, v));
        }
        assert_eq!(fields[0], (1, FieldValue::Varint(1)));
        assert_eq!(fields[1], (2, FieldValue::Varint(10)));
        assert_eq!(fields[2].1.as_str().unwrap(), "bleproxy 0.1.0");
        assert_eq!(fields[3].1.as_str().unwrap(), "bluetooth-proxy");
    }

    #[test]
    fn connect_response_omits_valid_password() {
        let ok = ServerMessage::ConnectResponse {
            invalid_password: false,
        };
        assert!(ok.encode().is_empty());

        let bad = ServerMessage::ConnectResponse {
            invalid_password: true,
        };
        assert_eq!(bad.encode(), vec![0x08, 0x01]);
    }

    #[test]
    fn raw_advertisements_encode_one_element_per_ad() {
        let ads = vec![
            Advertisement::new(1, AddressType::Public, -40, vec![0xaa]),
            Advertisement::new(2, AddressType::Random, -90, vec![0xbb, 0xcc]),
        ];
        let bytes = ServerMessage::RawAdvertisements(ads).encode();
        let mut r = ProtoReader::new(&bytes);
        let mut count = 0;
        while let Some((field, value)) = r.next_field().unwrap() {
            assert_eq!(field, 1);
            let nested = value.as_bytes().unwrap();
            let mut inner = ProtoReader::new(nested);
            let (_, addr) = inner.next_field().unwrap().unwrap();
            assert_eq!(addr.as_u64().unwrap(), count + 1);
            let (_, rssi) = inner.next_field().unwrap().unwrap();
            assert!(rssi.as_sint32().unwrap() < 0);
            count += 1;
        }
        assert_eq!(count, 2);
    }

    #[test]
    fn service_tree_encodes_uuid_as_two_words() {
        let uuid = Uuid::from_u128(0x0000180f_0000_1000_8000_00805f9b34fb);
        let service = GattService {
            uuid,
            handle: 1,
            characteristics: vec![GattCharacteristic {
                uuid,
                handle: 2,
                properties: crate::types::chr_props::READ,
                descriptors: vec![GattDescriptor { uuid, handle: 3 }],
            }],
        };
        let bytes = ServerMessage::GattServices {
            address: 7,
            services: vec![service],
        }
        .encode();

        let mut r = ProtoReader::new(&bytes);
        let (field, value) = r.next_field().unwrap().unwrap();
        assert_eq!((field, value.as_u64().unwrap()), (1, 7));
        let (field, value) = r.next_field().unwrap().unwrap();
        assert_eq!(field, 2);

        let mut inner = ProtoReader::new(value.as_bytes().unwrap());
        let (f, hi) = inner.next_field().unwrap().unwrap();
        let (f2, lo) = inner.next_field().unwrap().unwrap();
        assert_eq!((f, f2), (1, 1));
        let rebuilt = (u128::from(hi.as_u64().unwrap()) << 64) | u128::from(lo.as_u64().unwrap());
        assert_eq!(Uuid::from_u128(rebuilt), uuid);
    }

    #[test]
    fn empty_bodied_responses_encode_empty() {
        for msg in [
            ServerMessage::DisconnectRequest,
            ServerMessage::DisconnectResponse,
            ServerMessage::Ping,
            ServerMessage::Pong,
            ServerMessage::ListEntitiesDone,
        ] {
            assert!(msg.encode().is_empty(), "{msg:?} should have empty body");
        }
    }
}
