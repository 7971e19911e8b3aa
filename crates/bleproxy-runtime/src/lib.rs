//! Runtime for the bleproxy daemon
//!
//! Wires the control server, per-session tasks, and the proxy coordinator
//! into one daemon. Everything communicates over bounded channels; shared
//! state lives on the coordinator task.
//!
//! - [`server`] - Accept loop and graceful shutdown
//! - [`session`] - Per-client handshake and streaming state machine
//! - [`coordinator`] - Owner of the pool, broker, registry, and scanner
//! - [`batcher`] - Advertisement coalescing
//! - [`broker`] - Pending GATT operation table
//! - [`subscriptions`] - Stream fan-out bookkeeping
//! - [`outbox`] - Bounded per-session outbound queue
//! - [`device_info`] - Static device description

pub mod batcher;
pub mod broker;
pub mod coordinator;
pub mod device_info;
pub mod outbox;
pub mod server;
pub mod session;
pub mod subscriptions;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use bleproxy_ble::adapter::BleAdapter;
use bleproxy_core::config::ProxyConfig;
use bleproxy_core::error::ProxyError;

use coordinator::Coordinator;
use device_info::DeviceInfoProvider;
use server::ControlServer;

/// A started daemon: the bound address plus the handles to stop it
pub struct Daemon {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    server_task: JoinHandle<()>,
}

impl Daemon {
    /// Start the coordinator and control server against the given adapter
    pub async fn start(
        config: ProxyConfig,
        adapter: Arc<dyn BleAdapter>,
    ) -> Result<Self, ProxyError> {
        let config = Arc::new(config);

        let bluetooth_mac = adapter
            .adapter_mac()
            .await
            .map_err(|e| ProxyError::internal(format!("adapter MAC unavailable: {e}")))?;
        let device_info = Arc::new(DeviceInfoProvider::new(&config, bluetooth_mac));

        let proxy = Coordinator::spawn(config.clone(), adapter);
        let server = ControlServer::bind(config.clone(), device_info, proxy).await?;
        let local_addr = server.local_addr();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server_task = tokio::spawn(server.run(shutdown_rx));

        info!(%local_addr, "daemon started");
        Ok(Self {
            local_addr,
            shutdown_tx,
            server_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Graceful stop: disconnect clients, drain outboxes, join the server
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.server_task.await;
        info!("daemon stopped");
    }

    /// Run until the future resolves (typically a signal), then stop
    pub async fn run_until(self, signal: impl std::future::Future<Output = ()>) {
        signal.await;
        self.shutdown().await;
    }
}
