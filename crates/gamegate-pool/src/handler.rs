//! Unified message handler
//!
//! Entry point for every inbound frame. Messages are classified by id:
//!
//! - system messages (heartbeat, auth, logout, resume) are answered in place;
//! - gateway self-queries are answered from local statistics;
//! - business messages are routed, prioritised and queued for batch dispatch.
//!   CRITICAL traffic jumps the queue order but still passes dedup and the
//!   capacity bound, evicting lower tiers when full.
//!
//! Non-fatal errors are answered with a structured error envelope and the
//! connection stays open.

use crate::connection::Connection;
use crate::dispatcher::{BatchDispatcher, DispatcherStats, ReplySink};
use crate::pool::{ConnectionPool, PoolStats};
use crate::queue::{dedup_key, PriorityQueue, QueueStats, QueuedMessage};
use crate::session::{Claims, Session, SessionManager, SessionStats, SessionStore};
use crate::transport::{priority_for, BusinessPayload};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use gamegate_core::error::{AuthError, GatewayError, QueueError, Result, RoutingError};
use gamegate_core::types::{message_ids, Envelope, SessionId};
use gamegate_router::{MessageClass, MessageRouter, RouterStats};
use gamegate_rpc::{BreakerSnapshot, RpcCaller};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Processes inbound frames for a connection, in arrival order.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Handles one frame. An error that is fatal for the connection closes it.
    async fn handle(&self, connection: &Arc<Connection>, envelope: Envelope) -> Result<()>;
}

/// Body of an auth request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthRequest {
    pub user_id: String,
    pub token: String,
    /// Session to resume instead of creating a new one
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub claims: Claims,
}

/// Body of a resume request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResumeRequest {
    pub session_id: String,
}

/// Reply to auth and resume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionGrant {
    pub session_id: String,
    pub user_id: String,
    pub expires_at: DateTime<Utc>,
    pub resumed: bool,
}

#[derive(Debug, Serialize)]
struct GatewayStatus {
    status: &'static str,
    version: &'static str,
    uptime_secs: u64,
    connections: usize,
    queue_usage: f64,
    open_breakers: usize,
}

#[derive(Debug, Serialize)]
struct GatewayStats {
    pool: PoolStats,
    queue: QueueStats,
    router: RouterStats,
    dispatcher: DispatcherStats,
    sessions: SessionStats,
    breakers: Vec<BreakerSnapshot>,
}

fn to_json<T: Serialize>(value: &T) -> Result<Bytes> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(|e| GatewayError::internal(format!("failed to encode reply: {}", e)))
}

fn from_json<'a, T: Deserialize<'a>>(payload: &'a [u8]) -> Result<T> {
    serde_json::from_slice(payload)
        .map_err(|e| AuthError::invalid(format!("malformed request body: {}", e)).into())
}

/// The gateway's [`MessageHandler`].
pub struct UnifiedHandler<R: RpcCaller, S: SessionStore> {
    router: Arc<MessageRouter>,
    queue: Arc<PriorityQueue>,
    dispatcher: Arc<BatchDispatcher<R, ConnectionPool>>,
    sessions: Arc<SessionManager<S>>,
    pool: Arc<ConnectionPool>,
    started_at: Instant,
}

impl<R: RpcCaller, S: SessionStore> UnifiedHandler<R, S> {
    pub fn new(
        router: Arc<MessageRouter>,
        queue: Arc<PriorityQueue>,
        dispatcher: Arc<BatchDispatcher<R, ConnectionPool>>,
        sessions: Arc<SessionManager<S>>,
        pool: Arc<ConnectionPool>,
    ) -> Self {
        Self {
            router,
            queue,
            dispatcher,
            sessions,
            pool,
            started_at: Instant::now(),
        }
    }

    async fn process(&self, conn: &Arc<Connection>, envelope: &Envelope) -> Result<()> {
        let class = self.router.classify(envelope.message_id)?;
        counter!("gateway_messages_total", "class" => class.to_string()).increment(1);
        match class {
            MessageClass::System => self.handle_system(conn, envelope).await,
            MessageClass::Gateway => self.handle_gateway(conn, envelope).await,
            MessageClass::Business { service } => self.handle_business(conn, envelope, service).await,
        }
    }

    async fn handle_system(&self, conn: &Arc<Connection>, envelope: &Envelope) -> Result<()> {
        match envelope.message_id {
            message_ids::HEARTBEAT => conn.send(envelope.response(envelope.payload.clone())),
            message_ids::AUTH => {
                let request: AuthRequest = from_json(&envelope.payload)?;
                let grant = self.authenticate(conn, request).await?;
                conn.send(envelope.response(to_json(&grant)?))
            }
            message_ids::LOGOUT => {
                let session_id = conn.session().ok_or(AuthError::NotAuthenticated)?;
                self.pool.unbind_session(conn.id());
                self.sessions.destroy(&session_id).await?;
                info!(connection = %conn.id(), session = %session_id, "Logged out");
                conn.send(envelope.response(to_json(&serde_json::json!({ "logged_out": true }))?))
            }
            message_ids::RESUME => {
                let request: ResumeRequest = from_json(&envelope.payload)?;
                let session = self.sessions.get(&SessionId::from(request.session_id)).await?;
                let grant = self.bind(conn, session, true).await?;
                conn.send(envelope.response(to_json(&grant)?))
            }
            message_id => Err(RoutingError::UnknownMessageId { message_id }.into()),
        }
    }

    async fn authenticate(&self, conn: &Arc<Connection>, request: AuthRequest) -> Result<SessionGrant> {
        if request.user_id.trim().is_empty() {
            return Err(AuthError::invalid("user id is required").into());
        }
        let min_len = self.sessions.config().min_token_len;
        if request.token.len() < min_len {
            return Err(AuthError::invalid(format!("token shorter than {} characters", min_len)).into());
        }

        if let Some(session_id) = request.session_id {
            match self.sessions.get(&SessionId::from(session_id)).await {
                Ok(session) if session.user_id == request.user_id => {
                    return self.bind(conn, session, true).await;
                }
                Ok(_) => return Err(AuthError::invalid("session belongs to another user").into()),
                // stale id: fall through and issue a fresh session
                Err(GatewayError::Auth(_)) => {}
                Err(e) => return Err(e),
            }
        }

        let session = self.sessions.create(&request.user_id, request.claims).await?;
        self.bind(conn, session, false).await
    }

    /// Binds `session` to `conn` in both the pool and the session manager.
    async fn bind(&self, conn: &Arc<Connection>, session: Session, resumed: bool) -> Result<SessionGrant> {
        if let Some(previous) = conn.session().filter(|p| *p != session.session_id) {
            if let Err(e) = self.sessions.unbind(&previous, conn.id()).await {
                debug!(connection = %conn.id(), session = %previous, error = %e, "Previous session not unbound");
            }
        }
        let displaced = self.pool.bind_session(conn.id(), session.session_id.clone())?;
        let (session, _) = self.sessions.bind(&session.session_id, conn.id()).await?;
        if let Some(other) = displaced {
            warn!(session = %session.session_id, connection = %other.id(), "Closing connection that lost its session");
            other.close();
        }
        debug!(connection = %conn.id(), session = %session.session_id, resumed, "Session bound");
        Ok(SessionGrant {
            session_id: session.session_id.to_string(),
            user_id: session.user_id,
            expires_at: session.expires_at,
            resumed,
        })
    }

    async fn handle_gateway(&self, conn: &Arc<Connection>, envelope: &Envelope) -> Result<()> {
        let body = match envelope.message_id {
            message_ids::GATEWAY_STATUS => to_json(&GatewayStatus {
                status: if self.queue.is_throttling() { "throttling" } else { "ok" },
                version: env!("CARGO_PKG_VERSION"),
                uptime_secs: self.started_at.elapsed().as_secs(),
                connections: self.pool.connection_count(),
                queue_usage: self.queue.usage_ratio(),
                open_breakers: self.dispatcher.breakers().open_count(),
            })?,
            message_ids::GATEWAY_STATS => to_json(&GatewayStats {
                pool: self.pool.stats(),
                queue: self.queue.stats(),
                router: self.router.stats(),
                dispatcher: self.dispatcher.stats(),
                sessions: self.sessions.stats(),
                breakers: self.dispatcher.breakers().snapshots(),
            })?,
            message_ids::GATEWAY_CONNECTION_INFO => to_json(&conn.info())?,
            message_ids::GATEWAY_SESSION_INFO => {
                let session_id = conn.session().ok_or(AuthError::NotAuthenticated)?;
                to_json(&self.sessions.get(&session_id).await?)?
            }
            message_id => return Err(RoutingError::UnknownMessageId { message_id }.into()),
        };
        conn.send(envelope.response(body))
    }

    async fn handle_business(&self, conn: &Arc<Connection>, envelope: &Envelope, service: Arc<str>) -> Result<()> {
        let payload = BusinessPayload::parse(&envelope.payload)?;
        let session_id = conn.session();
        let owner = match &session_id {
            Some(sid) => self.sessions.get(sid).await?.user_id,
            None => conn.id().to_string(),
        };
        let routing_key = if payload.routing_key.is_empty() {
            owner.clone()
        } else {
            payload.routing_key.clone()
        };

        let priority = priority_for(envelope.message_id, payload.flags);
        if self.queue.should_shed(priority) {
            counter!("gateway_messages_shed_total").increment(1);
            return Err(QueueError::full("dispatch", self.queue.capacity()).into());
        }

        let resolved = self.router.resolve(&service, &routing_key)?;
        let mut message = QueuedMessage::new(
            priority,
            envelope.message_id,
            resolved.service,
            resolved.instance,
            routing_key,
            payload.body.clone(),
            conn.id(),
        )
        .with_session(session_id);
        if let Some(key) = dedup_key(envelope.message_id, payload.sequence, &owner) {
            message = message.with_dedup_key(key);
        }

        if let Some(evicted) = self.queue.enqueue(message)? {
            let err: GatewayError = QueueError::full("dispatch", self.queue.capacity()).into();
            self.pool.deliver(
                evicted.session_id.as_ref(),
                evicted.connection_id,
                Envelope::error(evicted.message_id, err.error_code(), err.client_message()),
            );
        }

        if payload.wants_ack() {
            conn.send(envelope.response(Bytes::new()))?;
        }
        Ok(())
    }
}

#[async_trait]
impl<R: RpcCaller, S: SessionStore> MessageHandler for UnifiedHandler<R, S> {
    async fn handle(&self, connection: &Arc<Connection>, envelope: Envelope) -> Result<()> {
        match self.process(connection, &envelope).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_fatal_for_connection() => Err(e),
            Err(e) => {
                debug!(
                    connection = %connection.id(),
                    message_id = envelope.message_id,
                    error = %e,
                    "Message rejected"
                );
                let reply = Envelope::error(envelope.message_id, e.error_code(), e.client_message());
                if let Err(send_err) = connection.send(reply) {
                    debug!(connection = %connection.id(), error = %send_err, "Error reply dropped");
                }
                Ok(())
            }
        }
    }
}
