//! Client listener
//!
//! Accepts TCP connections from game clients and hands each one to the
//! gateway on its own task.
//!
//! ```text
//!            game clients
//!                 │
//!         ┌───────▼────────┐
//!         │  TCP :9000     │  SO_REUSEPORT, TCP_NODELAY
//!         │  accept loop   │
//!         └───────┬────────┘
//!                 │ one task per connection
//!         ┌───────▼────────┐
//!         │ Gateway::accept│  admission, framing, dispatch
//!         └────────────────┘
//! ```

use anyhow::{Context, Result};
use gamegate_core::error::GatewayError;
use gamegate_pool::session::SessionStore;
use gamegate_pool::Gateway;
use gamegate_router::ServiceDiscovery;
use gamegate_rpc::ChannelConnector;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Pending connections the kernel may queue before `accept`
const LISTEN_BACKLOG: u32 = 1024;

/// Listener statistics
#[derive(Debug, Clone, Serialize)]
pub struct ListenerStats {
    pub total_accepted: u64,
    /// Connections refused by admission control
    pub total_rejected: u64,
    pub active_connections: u64,
}

#[derive(Debug, Default)]
struct ListenerState {
    accepted: AtomicU64,
    rejected: AtomicU64,
    active: AtomicU64,
}

impl ListenerState {
    fn stats(&self) -> ListenerStats {
        ListenerStats {
            total_accepted: self.accepted.load(Ordering::Relaxed),
            total_rejected: self.rejected.load(Ordering::Relaxed),
            active_connections: self.active.load(Ordering::Relaxed),
        }
    }
}

/// TCP listener feeding a [`Gateway`].
pub struct GatewayListener<D, S, C>
where
    D: ServiceDiscovery,
    S: SessionStore,
    C: ChannelConnector,
{
    listener: TcpListener,
    gateway: Arc<Gateway<D, S, C>>,
    state: Arc<ListenerState>,
}

impl<D, S, C> GatewayListener<D, S, C>
where
    D: ServiceDiscovery,
    S: SessionStore,
    C: ChannelConnector,
{
    /// Binds `bind_addr`.
    pub async fn bind(bind_addr: &str, gateway: Arc<Gateway<D, S, C>>) -> Result<Self> {
        let addr: SocketAddr = bind_addr.parse().context("Invalid bind address")?;
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        // lets several gateway processes share one port
        #[cfg(unix)]
        socket.set_reuseport(true)?;
        socket
            .bind(addr)
            .with_context(|| format!("Failed to bind {addr}"))?;
        let listener = socket.listen(LISTEN_BACKLOG)?;

        info!(bind_addr = %listener.local_addr()?, "Client listener bound");
        Ok(Self {
            listener,
            gateway,
            state: Arc::new(ListenerState::default()),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn stats(&self) -> ListenerStats {
        self.state.stats()
    }

    /// Accepts connections until `cancel` fires.
    pub async fn run(self, cancel: CancellationToken) -> ListenerStats {
        info!("Accept loop started");
        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            let (stream, peer) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(error = %e, "Accept failed");
                    continue;
                }
            };
            if let Err(e) = stream.set_nodelay(true) {
                debug!(peer = %peer, error = %e, "Could not set TCP_NODELAY");
            }

            let gateway = Arc::clone(&self.gateway);
            let state = Arc::clone(&self.state);
            tokio::spawn(async move {
                state.active.fetch_add(1, Ordering::Relaxed);
                match gateway.accept(stream, peer.to_string()).await {
                    Ok(reason) => {
                        state.accepted.fetch_add(1, Ordering::Relaxed);
                        debug!(peer = %peer, reason = %reason, "Client connection finished");
                    }
                    Err(GatewayError::Resource(e)) => {
                        state.rejected.fetch_add(1, Ordering::Relaxed);
                        warn!(peer = %peer, error = %e, "Connection rejected");
                    }
                    Err(e) => error!(peer = %peer, error = %e, "Connection failed"),
                }
                state.active.fetch_sub(1, Ordering::Relaxed);
            });
        }

        let stats = self.state.stats();
        info!(
            accepted = stats.total_accepted,
            rejected = stats.total_rejected,
            "Accept loop stopped"
        );
        stats
    }
}
