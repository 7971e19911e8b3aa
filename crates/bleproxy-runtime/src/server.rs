//! Control server
//!
//! Binds the control port, spawns one session per accepted socket, and
//! coordinates graceful shutdown: stop accepting, ask the coordinator to
//! send every client a disconnect, then give outboxes the grace period to
//! drain before hard-closing.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use bleproxy_core::config::ProxyConfig;
use bleproxy_core::error::ProxyError;
use bleproxy_core::types::SessionId;

use crate::coordinator::{ProxyCommand, ProxyHandle};
use crate::device_info::DeviceInfoProvider;
use crate::session::{run_session, SessionContext};

pub struct ControlServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    config: Arc<ProxyConfig>,
    device_info: Arc<DeviceInfoProvider>,
    proxy: ProxyHandle,
}

impl ControlServer {
    /// Bind the configured host and port
    pub async fn bind(
        config: Arc<ProxyConfig>,
        device_info: Arc<DeviceInfoProvider>,
        proxy: ProxyHandle,
    ) -> Result<Self, ProxyError> {
        let listener = TcpListener::bind((config.host.as_str(), config.port)).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, name = %config.name, "control server listening");
        Ok(Self {
            listener,
            local_addr,
            config,
            device_info,
            proxy,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept until the shutdown signal flips, then drain
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut sessions = JoinSet::new();
        let mut next_id: u64 = 1;

        loop {
            tokio::select! {
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let id = SessionId(next_id);
                        next_id += 1;
                        debug!(session = %id, %peer, "accepted");
                        let ctx = SessionContext {
                            id,
                            config: self.config.clone(),
                            device_info: self.device_info.clone(),
                            proxy: self.proxy.clone(),
                        };
                        sessions.spawn(run_session(ctx, stream));
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                    }
                },
                _ = shutdown.changed() => break,
                // Reap finished sessions so the set stays small.
                Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
            }
        }

        info!("stopping: no longer accepting clients");
        self.proxy.send(ProxyCommand::Shutdown).await;

        let grace = self.config.timeouts.shutdown_grace;
        if timeout(grace, async {
            while sessions.join_next().await.is_some() {}
        })
        .await
        .is_err()
        {
            warn!("grace period elapsed, aborting remaining sessions");
            sessions.abort_all();
        }
    }
}
