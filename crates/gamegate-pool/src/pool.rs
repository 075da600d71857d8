//! Ingress Connection Pool
//!
//! Owns every live [`Connection`], enforces the concurrency limit, recycles
//! read buffers and keeps the session → connection index that replies are
//! routed through.

use crate::connection::{Connection, ConnectionInfo, ConnectionState};
use crate::dispatcher::ReplySink;
use crate::metrics::ConnectionMetrics;
use bytes::BytesMut;
use dashmap::DashMap;
use gamegate_core::config::{ConnectionConfig, PoolConfig};
use gamegate_core::error::{ResourceError, Result, TransportError};
use gamegate_core::types::{ConnectionId, Envelope, SessionId};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Initial capacity of a fresh read buffer
const READ_BUFFER_BYTES: usize = 8 * 1024;

struct Slot {
    connection: Arc<Connection>,
    _permit: OwnedSemaphorePermit,
}

/// Pool statistics
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub active: usize,
    pub peak: usize,
    pub max_concurrent: usize,
    pub available: usize,
    pub free_buffers: usize,
    pub bound_sessions: usize,
    pub accepted: u64,
    pub rejected: u64,
    pub closed: u64,
    pub pool_hits: u64,
    pub pool_misses: u64,
    pub idle_reclaimed: u64,
    pub heartbeat_timeouts: u64,
}

/// Ingress connection pool.
pub struct ConnectionPool {
    connections: DashMap<ConnectionId, Slot>,
    by_session: DashMap<SessionId, ConnectionId>,
    limit: Arc<Semaphore>,
    free_buffers: Mutex<Vec<BytesMut>>,
    config: PoolConfig,
    connection_config: ConnectionConfig,
    metrics: Arc<ConnectionMetrics>,
    shutdown: AtomicBool,
}

impl ConnectionPool {
    /// Creates the pool and preallocates `config.preallocate` read buffers.
    pub fn new(config: PoolConfig, connection_config: ConnectionConfig) -> Self {
        let free_buffers = (0..config.preallocate)
            .map(|_| BytesMut::with_capacity(READ_BUFFER_BYTES))
            .collect();
        info!(
            max_concurrent = config.max_concurrent,
            preallocated = config.preallocate,
            "Connection pool created"
        );
        Self {
            connections: DashMap::new(),
            by_session: DashMap::new(),
            limit: Arc::new(Semaphore::new(config.max_concurrent)),
            free_buffers: Mutex::new(free_buffers),
            config,
            connection_config,
            metrics: Arc::new(ConnectionMetrics::new()),
            shutdown: AtomicBool::new(false),
        }
    }

    pub fn metrics(&self) -> &Arc<ConnectionMetrics> {
        &self.metrics
    }

    pub fn connection_config(&self) -> &ConnectionConfig {
        &self.connection_config
    }

    /// Get connection count
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Admits a new connection from `peer`.
    ///
    /// # Errors
    ///
    /// `ConnectionLimit` when every slot is taken, `ShuttingDown` after
    /// [`shutdown`](Self::shutdown). Existing connections are unaffected.
    pub fn acquire(&self, peer: impl Into<String>) -> Result<Arc<Connection>> {
        if self.shutdown.load(Ordering::Acquire) {
            return Err(ResourceError::ShuttingDown.into());
        }
        let permit = match Arc::clone(&self.limit).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                self.metrics.record_rejected();
                warn!(limit = self.config.max_concurrent, "Connection limit reached");
                return Err(ResourceError::ConnectionLimit {
                    limit: self.config.max_concurrent,
                }
                .into());
            }
        };

        let recycled = self.free_buffers.lock().pop();
        self.metrics.record_buffer(recycled.is_some());
        let buffer = recycled.unwrap_or_else(|| BytesMut::with_capacity(READ_BUFFER_BYTES));

        let connection = Arc::new(Connection::new(peer, &self.connection_config, buffer));
        self.connections.insert(
            connection.id(),
            Slot {
                connection: Arc::clone(&connection),
                _permit: permit,
            },
        );
        self.metrics.record_accepted(self.connections.len());
        debug!(connection = %connection.id(), peer = %connection.peer(), "Connection admitted");
        Ok(connection)
    }

    /// Removes a finished connection, freeing its slot and session binding.
    ///
    /// The read buffer goes back to the free list only if the connection saw
    /// no errors.
    pub fn release(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        let (_, slot) = self.connections.remove(&id)?;
        let connection = slot.connection;
        connection.close();

        if let Some(session_id) = connection.unbind_session() {
            self.by_session.remove_if(&session_id, |_, owner| *owner == id);
        }

        if connection.error_count() == 0 {
            if let Some(buffer) = connection.reclaim_buffer() {
                let mut free = self.free_buffers.lock();
                if free.len() < self.config.recycle_limit {
                    free.push(buffer);
                }
            }
        }

        self.metrics.record_closed(self.connections.len());
        debug!(connection = %id, "Connection released");
        Some(connection)
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<Connection>> {
        self.connections
            .get(&id)
            .map(|slot| Arc::clone(&slot.connection))
    }

    pub fn get_connection_by_session(&self, session_id: &SessionId) -> Option<Arc<Connection>> {
        let id = *self.by_session.get(session_id)?;
        self.get(id)
    }

    /// Binds `session_id` to connection `id`, keeping the mapping one-to-one.
    ///
    /// Returns the connection the session was taken from, if another live
    /// connection held it.
    pub fn bind_session(&self, id: ConnectionId, session_id: SessionId) -> Result<Option<Arc<Connection>>> {
        let connection = self
            .get(id)
            .ok_or_else(|| TransportError::closed("connection is not in the pool"))?;

        if let Some(previous) = connection.bind_session(session_id.clone()) {
            if previous != session_id {
                self.by_session.remove_if(&previous, |_, owner| *owner == id);
            }
        }

        let displaced = self
            .by_session
            .insert(session_id.clone(), id)
            .filter(|other| *other != id)
            .and_then(|other| self.get(other));
        if let Some(other) = &displaced {
            other.unbind_session_if(&session_id);
            info!(session = %session_id, from = %other.id(), to = %id, "Session moved to new connection");
        }
        Ok(displaced)
    }

    /// Clears whatever session connection `id` holds.
    pub fn unbind_session(&self, id: ConnectionId) -> Option<SessionId> {
        let session_id = self.get(id)?.unbind_session()?;
        self.by_session.remove_if(&session_id, |_, owner| *owner == id);
        Some(session_id)
    }

    /// Sends `envelope` to every active connection; returns how many accepted it.
    pub fn broadcast(&self, envelope: &Envelope) -> usize {
        self.connections
            .iter()
            .filter(|slot| slot.connection.state() == ConnectionState::Active)
            .filter(|slot| slot.connection.send(envelope.clone()).is_ok())
            .count()
    }

    /// Closes connections idle longer than `max_idle_secs`. Their drivers
    /// finish and release them.
    pub fn cleanup_idle(&self) -> usize {
        let max_idle = self.config.max_idle();
        let idle: Vec<Arc<Connection>> = self
            .connections
            .iter()
            .filter(|slot| !slot.connection.is_closing() && slot.connection.idle_for() >= max_idle)
            .map(|slot| Arc::clone(&slot.connection))
            .collect();

        for connection in &idle {
            debug!(connection = %connection.id(), idle_ms = connection.idle_for().as_millis() as u64, "Reclaiming idle connection");
            connection.close();
        }
        self.metrics.record_idle_reclaimed(idle.len());
        idle.len()
    }

    pub fn spawn_cleanup(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(pool.config.cleanup_interval());
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let reclaimed = pool.cleanup_idle();
                        if reclaimed > 0 {
                            info!(reclaimed, "Idle connections reclaimed");
                        }
                    }
                }
            }
        })
    }

    /// Connection details, for operators.
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.connections
            .iter()
            .map(|slot| slot.connection.info())
            .collect()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            active: self.connections.len(),
            peak: self.metrics.peak(),
            max_concurrent: self.config.max_concurrent,
            available: self.limit.available_permits(),
            free_buffers: self.free_buffers.lock().len(),
            bound_sessions: self.by_session.len(),
            accepted: self.metrics.accepted(),
            rejected: self.metrics.rejected(),
            closed: self.metrics.closed(),
            pool_hits: self.metrics.buffer_hits(),
            pool_misses: self.metrics.buffer_misses(),
            idle_reclaimed: self.metrics.idle_reclaimed(),
            heartbeat_timeouts: self.metrics.heartbeat_timeouts(),
        }
    }

    /// Stops admissions and closes every connection.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        for slot in self.connections.iter() {
            slot.connection.close();
        }
        info!(connections = self.connections.len(), "Connection pool shutting down");
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

impl ReplySink for ConnectionPool {
    fn deliver(
        &self,
        session_id: Option<&SessionId>,
        connection_id: ConnectionId,
        envelope: Envelope,
    ) -> bool {
        // the session may have moved to a newer connection since enqueue
        let target = session_id
            .and_then(|sid| self.get_connection_by_session(sid))
            .or_else(|| self.get(connection_id));
        match target {
            Some(connection) => match connection.send(envelope) {
                Ok(()) => true,
                Err(e) => {
                    debug!(connection = %connection.id(), error = %e, "Reply not delivered");
                    false
                }
            },
            None => false,
        }
    }
}
