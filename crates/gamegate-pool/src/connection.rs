//! Ingress connections
//!
//! A [`Connection`] owns bounded inbound and outbound buffers, a heartbeat and
//! a small lifecycle state machine:
//!
//! ```text
//! Connecting ──▶ Active ──▶ Draining ──▶ Closed
//! ```
//!
//! [`drive`] runs one connection to completion: a read loop feeding the
//! inbound buffer, a processing loop handing frames to the [`MessageHandler`]
//! in arrival order, and a writer draining the outbound buffer.

use crate::handler::MessageHandler;
use crate::metrics::ConnectionMetrics;
use crate::transport;
use bytes::{Bytes, BytesMut};
use futures::{Sink, SinkExt, StreamExt};
use gamegate_core::config::ConnectionConfig;
use gamegate_core::error::{GatewayError, QueueError, Result, TransportError};
use gamegate_core::types::{message_ids, ConnectionId, Envelope, SessionId};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ConnectionState {
    Connecting,
    Active,
    /// No new frames are read; buffered work is being flushed
    Draining,
    Closed,
}

/// Why a connection ended.
#[derive(Debug)]
pub enum CloseReason {
    PeerClosed,
    HeartbeatTimeout,
    /// Closed from the gateway side (logout, idle reclaim, shutdown)
    Local,
    Transport(GatewayError),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::PeerClosed => write!(f, "peer closed"),
            CloseReason::HeartbeatTimeout => write!(f, "heartbeat timeout"),
            CloseReason::Local => write!(f, "closed locally"),
            CloseReason::Transport(e) => write!(f, "transport error: {}", e),
        }
    }
}

/// One client connection.
pub struct Connection {
    id: ConnectionId,
    peer: String,
    state: Mutex<ConnectionState>,
    outbound_tx: flume::Sender<Envelope>,
    outbound_rx: flume::Receiver<Envelope>,
    outbound_capacity: usize,
    inbound_capacity: usize,
    session: RwLock<Option<SessionId>>,
    created_at: Instant,
    last_activity: Mutex<Instant>,
    frames_in: AtomicU64,
    frames_out: AtomicU64,
    errors: AtomicU64,
    cancel: CancellationToken,
    buffer: Mutex<Option<BytesMut>>,
}

impl Connection {
    pub fn new(peer: impl Into<String>, config: &ConnectionConfig, buffer: BytesMut) -> Self {
        let (outbound_tx, outbound_rx) = flume::bounded(config.outbound_capacity);
        let now = Instant::now();
        Self {
            id: ConnectionId::new(),
            peer: peer.into(),
            state: Mutex::new(ConnectionState::Connecting),
            outbound_tx,
            outbound_rx,
            outbound_capacity: config.outbound_capacity,
            inbound_capacity: config.inbound_capacity,
            session: RwLock::new(None),
            created_at: now,
            last_activity: Mutex::new(now),
            frames_in: AtomicU64::new(0),
            frames_out: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            cancel: CancellationToken::new(),
            buffer: Mutex::new(Some(buffer)),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn is_active(&self) -> bool {
        self.state() == ConnectionState::Active
    }

    fn activate(&self) {
        let mut state = self.state.lock();
        if *state == ConnectionState::Connecting {
            *state = ConnectionState::Active;
        }
    }

    /// Non-blocking enqueue onto the outbound buffer.
    ///
    /// # Errors
    ///
    /// `QueueFull` when the outbound buffer is saturated, `ConnectionClosed`
    /// once the connection is draining or closed.
    pub fn send(&self, envelope: Envelope) -> Result<()> {
        if matches!(self.state(), ConnectionState::Draining | ConnectionState::Closed) {
            return Err(TransportError::closed("connection is closing").into());
        }
        self.outbound_tx.try_send(envelope).map_err(|e| match e {
            flume::TrySendError::Full(_) => {
                QueueError::full(format!("outbound:{}", self.id), self.outbound_capacity).into()
            }
            flume::TrySendError::Disconnected(_) => {
                TransportError::closed("outbound buffer closed").into()
            }
        })
    }

    /// Pending outbound frames.
    pub fn outbound_len(&self) -> usize {
        self.outbound_rx.len()
    }

    #[cfg(test)]
    pub(crate) fn outbound_rx_for_test(&self) -> &flume::Receiver<Envelope> {
        &self.outbound_rx
    }

    pub fn session(&self) -> Option<SessionId> {
        self.session.read().clone()
    }

    /// Binds a session, returning the one previously bound.
    pub fn bind_session(&self, session_id: SessionId) -> Option<SessionId> {
        self.session.write().replace(session_id)
    }

    pub fn unbind_session(&self) -> Option<SessionId> {
        self.session.write().take()
    }

    /// Unbinds only if `session_id` is the bound session.
    pub fn unbind_session_if(&self, session_id: &SessionId) -> bool {
        let mut session = self.session.write();
        if session.as_ref() == Some(session_id) {
            *session = None;
            true
        } else {
            false
        }
    }

    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().elapsed()
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn error_count(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Starts draining the connection; idempotent.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            if matches!(*state, ConnectionState::Connecting | ConnectionState::Active) {
                *state = ConnectionState::Draining;
            }
        }
        self.cancel.cancel();
    }

    fn mark_closed(&self) {
        *self.state.lock() = ConnectionState::Closed;
    }

    pub fn is_closing(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the connection starts closing.
    pub async fn closed(&self) {
        self.cancel.cancelled().await
    }

    fn take_buffer(&self) -> BytesMut {
        self.buffer.lock().take().unwrap_or_default()
    }

    fn return_buffer(&self, mut buffer: BytesMut) {
        buffer.clear();
        *self.buffer.lock() = Some(buffer);
    }

    /// Hands back the read buffer once the connection is finished with it.
    pub fn reclaim_buffer(&self) -> Option<BytesMut> {
        self.buffer.lock().take()
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            connection_id: self.id.to_string(),
            peer: self.peer.clone(),
            state: self.state(),
            session_id: self.session().map(|s| s.to_string()),
            frames_in: self.frames_in.load(Ordering::Relaxed),
            frames_out: self.frames_out.load(Ordering::Relaxed),
            errors: self.error_count(),
            outbound_pending: self.outbound_len(),
            idle_ms: self.idle_for().as_millis() as u64,
            age_ms: self.created_at.elapsed().as_millis() as u64,
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("state", &self.state())
            .finish()
    }
}

/// Connection details served to clients and operators.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub connection_id: String,
    pub peer: String,
    pub state: ConnectionState,
    pub session_id: Option<String>,
    pub frames_in: u64,
    pub frames_out: u64,
    pub errors: u64,
    pub outbound_pending: usize,
    pub idle_ms: u64,
    pub age_ms: u64,
}

/// Runs `conn` over `io` until the peer leaves, the heartbeat lapses or the
/// connection is closed locally. Buffered inbound frames are still handled and
/// queued outbound frames flushed before this returns.
pub async fn drive<T, H>(
    conn: Arc<Connection>,
    io: T,
    handler: Arc<H>,
    config: ConnectionConfig,
    max_frame_bytes: usize,
    metrics: Arc<ConnectionMetrics>,
) -> CloseReason
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    H: MessageHandler,
{
    let (sink, mut stream) = transport::framed(io, max_frame_bytes, conn.take_buffer()).split();
    let (inbound_tx, inbound_rx) = flume::bounded::<Envelope>(conn.inbound_capacity);
    conn.activate();
    debug!(connection = %conn.id, peer = %conn.peer, "Connection active");

    let writer = tokio::spawn(write_loop(Arc::clone(&conn), sink, Arc::clone(&metrics)));

    let processor = {
        let conn = Arc::clone(&conn);
        tokio::spawn(async move {
            while let Ok(envelope) = inbound_rx.recv_async().await {
                if let Err(e) = handler.handle(&conn, envelope).await {
                    conn.record_error();
                    if e.is_fatal_for_connection() {
                        warn!(connection = %conn.id, error = %e, "Closing connection after handler error");
                        conn.close();
                        break;
                    }
                    debug!(connection = %conn.id, error = %e, "Handler error");
                }
            }
        })
    };

    let mut heartbeat = tokio::time::interval(config.heartbeat_interval());
    heartbeat.tick().await;
    let timeout = config.heartbeat_timeout();

    let reason = loop {
        tokio::select! {
            _ = conn.cancel.cancelled() => break CloseReason::Local,
            _ = heartbeat.tick() => {
                if conn.idle_for() >= timeout {
                    metrics.record_heartbeat_timeout();
                    break CloseReason::HeartbeatTimeout;
                }
                if let Err(e) = conn.send(Envelope::new(message_ids::HEARTBEAT, Bytes::new())) {
                    debug!(connection = %conn.id(), error = %e, "Heartbeat not queued");
                }
            }
            frame = stream.next() => match frame {
                None => break CloseReason::PeerClosed,
                Some(Err(e)) => {
                    conn.record_error();
                    break CloseReason::Transport(e);
                }
                Some(Ok(envelope)) => {
                    conn.touch();
                    conn.frames_in.fetch_add(1, Ordering::Relaxed);
                    metrics.record_frame_in();
                    // a full inbound buffer stops reading, which pushes back on the peer
                    if inbound_tx.send_async(envelope).await.is_err() {
                        break CloseReason::Local;
                    }
                }
            },
        }
    };

    // drain inbound, then stop the writer
    drop(inbound_tx);
    if let Err(e) = processor.await {
        debug!(connection = %conn.id(), error = %e, "Inbound processor ended abnormally");
    }
    conn.close();

    if let Ok(sink) = writer.await {
        if let Ok(framed) = stream.reunite(sink) {
            conn.return_buffer(framed.into_parts().read_buf);
        }
    }
    conn.mark_closed();

    match &reason {
        CloseReason::Transport(e) => warn!(connection = %conn.id, error = %e, "Connection closed"),
        other => info!(connection = %conn.id, reason = %other, "Connection closed"),
    }
    reason
}

async fn write_loop<S>(conn: Arc<Connection>, mut sink: S, metrics: Arc<ConnectionMetrics>) -> S
where
    S: Sink<Envelope, Error = GatewayError> + Unpin,
{
    loop {
        let envelope = tokio::select! {
            biased;
            envelope = conn.outbound_rx.recv_async() => match envelope {
                Ok(envelope) => envelope,
                Err(_) => break,
            },
            _ = conn.cancel.cancelled() => break,
        };
        if let Err(e) = sink.send(envelope).await {
            debug!(connection = %conn.id, error = %e, "Write failed");
            conn.record_error();
            conn.close();
            return sink;
        }
        conn.frames_out.fetch_add(1, Ordering::Relaxed);
        metrics.record_frame_out();
    }

    while let Ok(envelope) = conn.outbound_rx.try_recv() {
        if sink.feed(envelope).await.is_err() {
            break;
        }
        conn.frames_out.fetch_add(1, Ordering::Relaxed);
        metrics.record_frame_out();
    }
    if let Err(e) = sink.flush().await {
        debug!(connection = %conn.id(), error = %e, "Final flush failed");
    }
    sink
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use gamegate_core::types::message_ids::RESPONSE_FLAG;

    /// Echoes every frame as a response.
    struct Echo;

    #[async_trait]
    impl MessageHandler for Echo {
        async fn handle(&self, conn: &Arc<Connection>, envelope: Envelope) -> Result<()> {
            conn.send(envelope.response(envelope.payload.clone()))
        }
    }

    fn config() -> ConnectionConfig {
        ConnectionConfig {
            inbound_capacity: 8,
            outbound_capacity: 2,
            heartbeat_interval_ms: 1_000,
            heartbeat_timeout_ms: 3_000,
        }
    }

    #[test]
    fn test_send_reports_full_outbound_buffer() {
        let conn = Connection::new("test", &config(), BytesMut::new());
        conn.send(Envelope::new(1001, Bytes::new())).unwrap();
        conn.send(Envelope::new(1002, Bytes::new())).unwrap();

        let err = conn.send(Envelope::new(1003, Bytes::new())).unwrap_err();
        assert!(matches!(err, GatewayError::Queue(QueueError::Full { capacity: 2, .. })));

        conn.close();
        let err = conn.send(Envelope::new(1004, Bytes::new())).unwrap_err();
        assert!(err.is_fatal_for_connection());
    }

    #[test]
    fn test_session_binding() {
        let conn = Connection::new("test", &config(), BytesMut::new());
        let a = SessionId::from("a");
        let b = SessionId::from("b");
        assert_eq!(conn.bind_session(a.clone()), None);
        assert!(!conn.unbind_session_if(&b));
        assert_eq!(conn.bind_session(b.clone()), Some(a));
        assert!(conn.unbind_session_if(&b));
        assert_eq!(conn.session(), None);
    }

    #[tokio::test]
    async fn test_drive_echoes_in_order_until_peer_closes() {
        let (client, server) = tokio::io::duplex(4096);
        let conn = Arc::new(Connection::new("duplex", &config(), BytesMut::new()));
        let metrics = Arc::new(ConnectionMetrics::new());
        let task = tokio::spawn(drive(
            Arc::clone(&conn),
            server,
            Arc::new(Echo),
            config(),
            1024,
            Arc::clone(&metrics),
        ));

        let mut client = transport::framed(client, 1024, BytesMut::new());
        for id in [1001u32, 2001, 3001] {
            client.send(Envelope::new(id, Bytes::from(id.to_string()))).await.unwrap();
        }
        for id in [1001u32, 2001, 3001] {
            let reply = client.next().await.unwrap().unwrap();
            assert_eq!(reply.message_id, id | RESPONSE_FLAG);
            assert_eq!(reply.payload, Bytes::from(id.to_string()));
        }

        drop(client);
        let reason = task.await.unwrap();
        assert!(matches!(reason, CloseReason::PeerClosed));
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert_eq!(metrics.frames_in(), 3);
        assert!(conn.reclaim_buffer().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_timeout_closes_connection() {
        let (client, server) = tokio::io::duplex(4096);
        let conn = Arc::new(Connection::new("idle", &config(), BytesMut::new()));
        let metrics = Arc::new(ConnectionMetrics::new());
        let task = tokio::spawn(drive(
            Arc::clone(&conn),
            server,
            Arc::new(Echo),
            config(),
            1024,
            Arc::clone(&metrics),
        ));

        let mut client = transport::framed(client, 1024, BytesMut::new());
        // server pings while waiting
        let ping = client.next().await.unwrap().unwrap();
        assert_eq!(ping.message_id, message_ids::HEARTBEAT);

        let reason = task.await.unwrap();
        assert!(matches!(reason, CloseReason::HeartbeatTimeout));
        assert_eq!(metrics.heartbeat_timeouts(), 1);
    }

    #[tokio::test]
    async fn test_local_close_stops_driver() {
        let (_client, server) = tokio::io::duplex(4096);
        let conn = Arc::new(Connection::new("local", &config(), BytesMut::new()));
        let task = tokio::spawn(drive(
            Arc::clone(&conn),
            server,
            Arc::new(Echo),
            config(),
            1024,
            Arc::new(ConnectionMetrics::new()),
        ));

        tokio::task::yield_now().await;
        conn.close();
        let reason = task.await.unwrap();
        assert!(matches!(reason, CloseReason::Local));
    }
}
