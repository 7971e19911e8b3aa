//! Control session
//!
//! One reader task and one writer task per accepted socket. The reader owns
//! the handshake state machine and forwards BLE work to the coordinator; the
//! writer drains the bounded outbox. Framing or protocol violations close
//! only this session.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant};
use tracing::{debug, info, warn};

use bleproxy_core::config::ProxyConfig;
use bleproxy_core::error::ProxyError;
use bleproxy_core::frame::{encode_frame, FrameDecoder};
use bleproxy_core::message::{ClientMessage, MessageType, ServerMessage};
use bleproxy_core::types::SessionId;

use crate::coordinator::{ProxyCommand, ProxyHandle};
use crate::device_info::{DeviceInfoProvider, API_VERSION};
use crate::outbox::{outbox, CloseReason, OutboxReceiver, OutboxSender};

/// Read buffer size per socket read
const READ_BUF: usize = 4096;

/// Missed pongs that force the session closed
const MAX_MISSED_PONGS: u32 = 3;

// ----------------------------------------------------------------------------
// Session State
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    HelloSent,
    Connected,
    Authenticated,
    Closing,
}

impl Phase {
    fn name(self) -> &'static str {
        match self {
            Phase::HelloSent => "HelloSent",
            Phase::Connected => "Connected",
            Phase::Authenticated => "Authenticated",
            Phase::Closing => "Closing",
        }
    }
}

/// Everything a session needs from the daemon
pub struct SessionContext {
    pub id: SessionId,
    pub config: Arc<ProxyConfig>,
    pub device_info: Arc<DeviceInfoProvider>,
    pub proxy: ProxyHandle,
}

/// Drive one accepted control connection to completion
pub async fn run_session(ctx: SessionContext, stream: TcpStream) {
    let peer = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    info!(session = %ctx.id, %peer, "client connected");

    let (read_half, write_half) = stream.into_split();
    let (outbox_tx, outbox_rx) = outbox(ctx.config.outbox_capacity);
    ctx.proxy
        .send(ProxyCommand::Register {
            session: ctx.id,
            outbox: outbox_tx.clone(),
        })
        .await;

    let (writer_done_tx, writer_done_rx) = watch::channel(false);
    let writer = tokio::spawn(async move {
        if let Err(e) = run_writer(write_half, outbox_rx).await {
            debug!(error = %e, "writer ended with error");
        }
        let _ = writer_done_tx.send(true);
    });

    let mut reader = Reader {
        id: ctx.id,
        peer: peer.clone(),
        config: ctx.config,
        device_info: ctx.device_info,
        proxy: ctx.proxy.clone(),
        outbox: outbox_tx.clone(),
        phase: Phase::HelloSent,
        client_info: String::new(),
        outstanding_pings: 0,
    };
    match reader.run(read_half, writer_done_rx).await {
        Ok(()) => info!(session = %ctx.id, %peer, "client disconnected"),
        Err(e) => warn!(session = %ctx.id, %peer, error = %e, "session closed"),
    }

    ctx.proxy
        .send(ProxyCommand::Deregister { session: ctx.id })
        .await;
    drop(outbox_tx);
    drop(reader);
    let _ = writer.await;
}

// ----------------------------------------------------------------------------
// Writer Task
// ----------------------------------------------------------------------------

async fn run_writer(
    mut socket: OwnedWriteHalf,
    mut outbox: OutboxReceiver,
) -> std::io::Result<()> {
    loop {
        tokio::select! {
            msg = outbox.rx.recv() => match msg {
                Some(msg) => write_message(&mut socket, &msg).await?,
                None => break,
            },
            reason = outbox.kill_rx.recv() => {
                if reason == Some(CloseReason::Backpressure) {
                    warn!("outbox overflowed on a non-droppable message, closing session");
                }
                // Drain what was already queued, then close the socket.
                while let Ok(msg) = outbox.rx.try_recv() {
                    write_message(&mut socket, &msg).await?;
                }
                break;
            }
        }
    }
    socket.shutdown().await
}

async fn write_message(socket: &mut OwnedWriteHalf, msg: &ServerMessage) -> std::io::Result<()> {
    let payload = msg.encode();
    let frame = encode_frame(msg.message_type() as u64, &payload);
    socket.write_all(&frame).await
}

// ----------------------------------------------------------------------------
// Reader Task
// ----------------------------------------------------------------------------

enum Action {
    Continue,
    Close,
}

struct Reader {
    id: SessionId,
    peer: String,
    config: Arc<ProxyConfig>,
    device_info: Arc<DeviceInfoProvider>,
    proxy: ProxyHandle,
    outbox: OutboxSender,
    phase: Phase,
    client_info: String,
    outstanding_pings: u32,
}

impl Reader {
    async fn run(
        &mut self,
        mut socket: OwnedReadHalf,
        mut writer_done: watch::Receiver<bool>,
    ) -> Result<(), ProxyError> {
        let mut decoder = FrameDecoder::new();
        let mut buf = vec![0u8; READ_BUF];
        let ping = self.config.timeouts.ping;
        let mut ping_timer = interval_at(Instant::now() + ping, ping);

        loop {
            tokio::select! {
                read = socket.read(&mut buf) => {
                    let n = read?;
                    if n == 0 {
                        if decoder.has_partial() {
                            return Err(bleproxy_core::FrameError::ShortRead.into());
                        }
                        return Ok(());
                    }
                    decoder.extend(&buf[..n]);
                    while let Some(frame) = decoder.next_frame()? {
                        match self.handle_frame(frame.msg_type, &frame.payload).await? {
                            Action::Continue => {}
                            Action::Close => {
                                self.phase = Phase::Closing;
                                return Ok(());
                            }
                        }
                    }
                }
                _ = ping_timer.tick() => {
                    if self.phase == Phase::HelloSent {
                        continue;
                    }
                    if self.outstanding_pings >= MAX_MISSED_PONGS {
                        warn!(session = %self.id, "peer missed {MAX_MISSED_PONGS} pongs");
                        return Ok(());
                    }
                    self.outstanding_pings += 1;
                    self.outbox.send_reply(ServerMessage::Ping);
                }
                _ = writer_done.changed() => {
                    debug!(session = %self.id, "writer gone, stopping reader");
                    return Ok(());
                }
            }
        }
    }

    async fn handle_frame(&mut self, msg_type: u64, payload: &[u8]) -> Result<Action, ProxyError> {
        let msg_type = match MessageType::from_wire(msg_type) {
            Ok(t) => t,
            Err(_) => {
                // Unknown message ids from newer clients are skipped, the
                // way the reference clients expect.
                debug!(session = %self.id, msg_type, "ignoring unknown message type");
                return Ok(Action::Continue);
            }
        };
        let msg = ClientMessage::decode(msg_type, payload)?;

        // Liveness applies from Connected onward, in either direction.
        if let ClientMessage::Pong = msg {
            self.outstanding_pings = 0;
            return Ok(Action::Continue);
        }
        if let ClientMessage::Ping = msg {
            self.outbox.send_reply(ServerMessage::Pong);
            return Ok(Action::Continue);
        }

        match self.phase {
            Phase::HelloSent => self.handle_hello_sent(msg_type, msg),
            Phase::Connected => self.handle_connected(msg_type, msg).await,
            Phase::Authenticated => self.handle_authenticated(msg).await,
            Phase::Closing => Ok(Action::Close),
        }
    }

    fn handle_hello_sent(
        &mut self,
        msg_type: MessageType,
        msg: ClientMessage,
    ) -> Result<Action, ProxyError> {
        match msg {
            ClientMessage::Hello(hello) => {
                info!(
                    session = %self.id,
                    client = %hello.client_info,
                    api = format_args!("{}.{}", hello.api_version_major, hello.api_version_minor),
                    "hello received"
                );
                self.client_info = hello.client_info;
                self.outbox.send_reply(self.hello_response());
                self.phase = Phase::Connected;
                Ok(Action::Continue)
            }
            _ => Err(self.violation(msg_type)),
        }
    }

    async fn handle_connected(
        &mut self,
        msg_type: MessageType,
        msg: ClientMessage,
    ) -> Result<Action, ProxyError> {
        match msg {
            ClientMessage::Connect { password } => {
                let valid = match self.config.password.as_deref() {
                    Some(expected) if !expected.is_empty() => password == expected,
                    _ => true,
                };
                self.outbox.send_reply(ServerMessage::ConnectResponse {
                    invalid_password: !valid,
                });
                if valid {
                    info!(session = %self.id, peer = %self.peer, "client authenticated");
                    self.phase = Phase::Authenticated;
                    Ok(Action::Continue)
                } else {
                    warn!(session = %self.id, peer = %self.peer, "invalid password");
                    Ok(Action::Close)
                }
            }
            // Capability probes may ask for device info before Connect, but
            // only when the daemon is not password protected.
            ClientMessage::DeviceInfo if !self.config.requires_password() => {
                self.outbox
                    .send_reply(ServerMessage::DeviceInfo(self.device_info.device_info()));
                Ok(Action::Continue)
            }
            ClientMessage::Disconnect => {
                self.outbox.send_reply(ServerMessage::DisconnectResponse);
                Ok(Action::Close)
            }
            ClientMessage::DisconnectAck => Ok(Action::Close),
            _ => Err(self.violation(msg_type)),
        }
    }

    async fn handle_authenticated(&mut self, msg: ClientMessage) -> Result<Action, ProxyError> {
        let session = self.id;
        match msg {
            ClientMessage::Hello(_) => {
                self.outbox.send_reply(self.hello_response());
            }
            // A duplicate Connect after authentication is ignored.
            ClientMessage::Connect { .. } => {
                debug!(session = %self.id, "ignoring duplicate connect request");
            }
            ClientMessage::Disconnect => {
                self.outbox.send_reply(ServerMessage::DisconnectResponse);
                return Ok(Action::Close);
            }
            ClientMessage::DisconnectAck => return Ok(Action::Close),
            ClientMessage::DeviceInfo => {
                self.outbox
                    .send_reply(ServerMessage::DeviceInfo(self.device_info.device_info()));
            }
            ClientMessage::ListEntities => {
                self.outbox.send_reply(ServerMessage::ListEntitiesDone);
            }
            ClientMessage::SubscribeStates => {
                self.proxy
                    .send(ProxyCommand::SubscribeScannerState { session })
                    .await;
            }
            ClientMessage::SubscribeAdvertisements { flags } => {
                self.proxy
                    .send(ProxyCommand::SubscribeAdvertisements { session, flags })
                    .await;
            }
            ClientMessage::UnsubscribeAdvertisements => {
                self.proxy
                    .send(ProxyCommand::UnsubscribeAdvertisements { session })
                    .await;
            }
            ClientMessage::SubscribeConnectionsFree => {
                self.proxy
                    .send(ProxyCommand::SubscribeConnectionsFree { session })
                    .await;
            }
            ClientMessage::ScannerSetMode { mode } => {
                self.proxy
                    .send(ProxyCommand::ScannerSetMode { session, mode })
                    .await;
            }
            ClientMessage::DeviceRequest {
                address,
                kind,
                address_type,
            } => {
                self.proxy
                    .send(ProxyCommand::Device {
                        session,
                        address,
                        address_type,
                        kind,
                    })
                    .await;
            }
            ClientMessage::GetServices { address } => {
                self.proxy
                    .send(ProxyCommand::GetServices { session, address })
                    .await;
            }
            ClientMessage::GattRead { address, handle } => {
                self.proxy
                    .send(ProxyCommand::GattRead {
                        session,
                        address,
                        handle,
                    })
                    .await;
            }
            ClientMessage::GattWrite {
                address,
                handle,
                response,
                data,
            } => {
                self.proxy
                    .send(ProxyCommand::GattWrite {
                        session,
                        address,
                        handle,
                        data,
                        response,
                    })
                    .await;
            }
            ClientMessage::GattReadDescriptor { address, handle } => {
                self.proxy
                    .send(ProxyCommand::GattReadDescriptor {
                        session,
                        address,
                        handle,
                    })
                    .await;
            }
            ClientMessage::GattWriteDescriptor {
                address,
                handle,
                data,
            } => {
                self.proxy
                    .send(ProxyCommand::GattWriteDescriptor {
                        session,
                        address,
                        handle,
                        data,
                    })
                    .await;
            }
            ClientMessage::GattNotify {
                address,
                handle,
                enable,
            } => {
                self.proxy
                    .send(ProxyCommand::GattNotify {
                        session,
                        address,
                        handle,
                        enable,
                    })
                    .await;
            }
            // Liveness messages are answered before phase dispatch.
            ClientMessage::Ping | ClientMessage::Pong => {}
        }
        Ok(Action::Continue)
    }

    fn hello_response(&self) -> ServerMessage {
        ServerMessage::Hello {
            api_version_major: API_VERSION.0,
            api_version_minor: API_VERSION.1,
            server_info: self.device_info.server_info().to_string(),
            name: self.device_info.name().to_string(),
        }
    }

    fn violation(&self, msg_type: MessageType) -> ProxyError {
        ProxyError::ProtocolViolation {
            message_type: msg_type,
            state: self.phase.name(),
        }
    }
}
