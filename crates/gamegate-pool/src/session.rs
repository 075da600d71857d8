//! Sessions
//!
//! A [`Session`] is an authenticated identity that outlives any single
//! connection. [`SessionManager`] keeps a bounded LRU of recently used
//! sessions in front of a durable [`SessionStore`]; every mutation is written
//! through as an idempotent upsert, so a second gateway process can resolve
//! and renew the same session without coordination (last writer wins).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use gamegate_core::config::SessionConfig;
use gamegate_core::error::{AuthError, Result};
use gamegate_core::types::{ConnectionId, SessionId};
use lru::LruCache;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Authorization claims attached at login.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub permissions: Vec<String>,
    #[serde(default)]
    pub extra: HashMap<String, String>,
}

impl Claims {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions.iter().any(|p| p == permission)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub session_id: SessionId,
    pub user_id: String,
    pub claims: Claims,
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    #[serde(default)]
    pub access_count: u32,
    /// Current connection, by id only
    #[serde(default)]
    pub connection_id: Option<ConnectionId>,
}

impl Session {
    fn new(user_id: String, claims: Claims, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            session_id: SessionId::new(),
            user_id,
            claims,
            attributes: HashMap::new(),
            created_at: now,
            expires_at: expires_after(now, ttl),
            last_accessed: now,
            access_count: 0,
            connection_id: None,
        }
    }

    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }

    /// Time left before expiry; zero once expired.
    pub fn remaining(&self) -> Duration {
        (self.expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO)
    }
}

/// `now + ttl`, saturating at the latest representable instant.
fn expires_after(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Durable, cross-process session storage.
#[async_trait]
pub trait SessionStore: Send + Sync + 'static {
    async fn get(&self, session_id: &SessionId) -> Result<Option<Session>>;

    /// Insert or replace; the store drops the record after `ttl`.
    async fn upsert(&self, session: &Session, ttl: Duration) -> Result<()>;

    async fn delete(&self, session_id: &SessionId) -> Result<bool>;

    async fn sessions_for_user(&self, user_id: &str) -> Result<Vec<SessionId>>;
}

/// In-process [`SessionStore`] for single-node deployments and tests.
#[derive(Default)]
pub struct MemorySessionStore {
    records: DashMap<SessionId, (Session, DateTime<Utc>)>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get(&self, session_id: &SessionId) -> Result<Option<Session>> {
        let live = match self.records.get(session_id) {
            Some(record) if Utc::now() < record.1 => return Ok(Some(record.0.clone())),
            Some(_) => false,
            None => return Ok(None),
        };
        if !live {
            self.records.remove(session_id);
        }
        Ok(None)
    }

    async fn upsert(&self, session: &Session, ttl: Duration) -> Result<()> {
        let drop_at = expires_after(Utc::now(), ttl);
        self.records
            .insert(session.session_id.clone(), (session.clone(), drop_at));
        Ok(())
    }

    async fn delete(&self, session_id: &SessionId) -> Result<bool> {
        Ok(self.records.remove(session_id).is_some())
    }

    async fn sessions_for_user(&self, user_id: &str) -> Result<Vec<SessionId>> {
        let now = Utc::now();
        let mut ids: Vec<_> = self
            .records
            .iter()
            .filter(|r| r.0.user_id == user_id && now < r.1)
            .map(|r| r.key().clone())
            .collect();
        ids.sort();
        Ok(ids)
    }
}

/// Session manager statistics
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    pub cached: usize,
    pub created: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub renewals: u64,
    pub auto_renewals: u64,
    pub expired: u64,
    pub destroyed: u64,
}

#[derive(Default)]
struct SessionCounters {
    created: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    renewals: AtomicU64,
    auto_renewals: AtomicU64,
    expired: AtomicU64,
    destroyed: AtomicU64,
}

/// Two-tier session manager.
pub struct SessionManager<S: SessionStore> {
    store: Arc<S>,
    cache: Mutex<LruCache<SessionId, Session>>,
    config: SessionConfig,
    counters: SessionCounters,
}

impl<S: SessionStore> SessionManager<S> {
    pub fn new(store: Arc<S>, config: SessionConfig) -> Self {
        Self {
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(config.local_cache_size).unwrap_or(NonZeroUsize::MIN),
            )),
            store,
            config,
            counters: SessionCounters::default(),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    fn store_ttl(&self, session: &Session) -> Duration {
        session
            .remaining()
            .max(Duration::from_secs(self.config.min_store_ttl_secs))
    }

    async fn write_through(&self, session: Session) -> Result<Session> {
        self.store.upsert(&session, self.store_ttl(&session)).await?;
        self.cache.lock().put(session.session_id.clone(), session.clone());
        Ok(session)
    }

    /// Creates a session for an authenticated user.
    ///
    /// # Errors
    ///
    /// `InvalidCredentials` if `user_id` is empty.
    pub async fn create(&self, user_id: &str, claims: Claims) -> Result<Session> {
        if user_id.trim().is_empty() {
            return Err(AuthError::invalid("empty user id").into());
        }
        let session = Session::new(user_id.to_string(), claims, self.config.ttl());
        let session = self.write_through(session).await?;
        self.counters.created.fetch_add(1, Ordering::Relaxed);
        info!(session = %session.session_id, user = %session.user_id, "Session created");
        Ok(session)
    }

    /// The store is authoritative for expiry: a local copy that looks expired
    /// may have been renewed by another gateway, so it is only evicted here.
    async fn load(&self, session_id: &SessionId) -> Result<Session> {
        let cached = self.cache.lock().get(session_id).cloned();
        if let Some(session) = cached {
            if !session.is_expired() {
                self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
                return Ok(session);
            }
            self.cache.lock().pop(session_id);
        }

        self.counters.cache_misses.fetch_add(1, Ordering::Relaxed);
        let session = match self.store.get(session_id).await? {
            Some(session) => session,
            None => return Err(AuthError::not_found(session_id.as_str()).into()),
        };

        if session.is_expired() {
            if let Err(e) = self.store.delete(session_id).await {
                warn!(session = %session_id, error = %e, "Failed to delete expired session");
            }
            self.counters.expired.fetch_add(1, Ordering::Relaxed);
            return Err(AuthError::SessionExpired {
                session_id: session_id.to_string(),
            }
            .into());
        }

        self.cache.lock().put(session_id.clone(), session.clone());
        Ok(session)
    }

    /// Resolves a session: local cache first, then the durable store.
    ///
    /// Records the access; a hot session close to expiry is renewed on the spot.
    ///
    /// # Errors
    ///
    /// `SessionNotFound` or `SessionExpired`.
    pub async fn get(&self, session_id: &SessionId) -> Result<Session> {
        let mut session = self.load(session_id).await?;
        session.access_count = session.access_count.saturating_add(1);
        session.last_accessed = Utc::now();

        let hot = session.access_count >= self.config.hot_threshold;
        if hot && session.remaining() <= self.config.renewal_threshold() {
            session.expires_at = expires_after(Utc::now(), self.config.ttl());
            self.counters.auto_renewals.fetch_add(1, Ordering::Relaxed);
            debug!(session = %session.session_id, "Hot session renewed");
            return self.write_through(session).await;
        }

        // access bookkeeping stays local until the next write-through
        self.cache.lock().put(session.session_id.clone(), session.clone());
        Ok(session)
    }

    /// Extends expiry by a full TTL in both tiers.
    pub async fn renew(&self, session_id: &SessionId) -> Result<Session> {
        let mut session = self.load(session_id).await?;
        let now = Utc::now();
        session.expires_at = expires_after(now, self.config.ttl());
        session.last_accessed = now;
        self.counters.renewals.fetch_add(1, Ordering::Relaxed);
        self.write_through(session).await
    }

    /// Points the session at `connection_id`, returning the session and the
    /// connection it was bound to before, if any.
    pub async fn bind(
        &self,
        session_id: &SessionId,
        connection_id: ConnectionId,
    ) -> Result<(Session, Option<ConnectionId>)> {
        let mut session = self.load(session_id).await?;
        let previous = session.connection_id.replace(connection_id);
        session.last_accessed = Utc::now();
        let session = self.write_through(session).await?;
        if let Some(prev) = previous.filter(|p| *p != connection_id) {
            info!(session = %session_id, from = %prev, to = %connection_id, "Session rebound");
        }
        Ok((session, previous))
    }

    /// Clears the binding if the session is still bound to `connection_id`.
    /// The session itself stays resolvable until its TTL.
    pub async fn unbind(&self, session_id: &SessionId, connection_id: ConnectionId) -> Result<bool> {
        let mut session = match self.load(session_id).await {
            Ok(session) => session,
            Err(_) => return Ok(false),
        };
        if session.connection_id != Some(connection_id) {
            return Ok(false);
        }
        session.connection_id = None;
        self.write_through(session).await?;
        debug!(session = %session_id, connection = %connection_id, "Session unbound");
        Ok(true)
    }

    pub async fn set_attribute(
        &self,
        session_id: &SessionId,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Result<Session> {
        let mut session = self.load(session_id).await?;
        session.attributes.insert(key.into(), value.into());
        self.write_through(session).await
    }

    /// Removes the session from both tiers.
    pub async fn destroy(&self, session_id: &SessionId) -> Result<bool> {
        let cached = self.cache.lock().pop(session_id).is_some();
        let stored = self.store.delete(session_id).await?;
        if cached || stored {
            self.counters.destroyed.fetch_add(1, Ordering::Relaxed);
            info!(session = %session_id, "Session destroyed");
        }
        Ok(cached || stored)
    }

    /// Live sessions belonging to `user_id`.
    pub async fn get_user_sessions(&self, user_id: &str) -> Result<Vec<Session>> {
        let ids = self.store.sessions_for_user(user_id).await?;
        let mut sessions = Vec::with_capacity(ids.len());
        for id in ids {
            if let Ok(session) = self.load(&id).await {
                sessions.push(session);
            }
        }
        Ok(sessions)
    }

    /// Destroys every session of `user_id`, returning them so callers can
    /// release their connections.
    pub async fn logout_user(&self, user_id: &str) -> Result<Vec<Session>> {
        let sessions = self.get_user_sessions(user_id).await?;
        for session in &sessions {
            self.destroy(&session.session_id).await?;
        }
        Ok(sessions)
    }

    /// Drops expired sessions from the local cache.
    pub fn cleanup_expired(&self) -> usize {
        let mut cache = self.cache.lock();
        let expired: Vec<SessionId> = cache
            .iter()
            .filter(|(_, session)| session.is_expired())
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            cache.pop(id);
        }
        self.counters
            .expired
            .fetch_add(expired.len() as u64, Ordering::Relaxed);
        expired.len()
    }

    pub fn spawn_cleanup(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.config.cleanup_interval());
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let removed = manager.cleanup_expired();
                        if removed > 0 {
                            debug!(removed, "Expired sessions evicted from cache");
                        }
                    }
                }
            }
        })
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            cached: self.cache.lock().len(),
            created: self.counters.created.load(Ordering::Relaxed),
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.counters.cache_misses.load(Ordering::Relaxed),
            renewals: self.counters.renewals.load(Ordering::Relaxed),
            auto_renewals: self.counters.auto_renewals.load(Ordering::Relaxed),
            expired: self.counters.expired.load(Ordering::Relaxed),
            destroyed: self.counters.destroyed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gamegate_core::error::GatewayError;

    fn config() -> SessionConfig {
        SessionConfig {
            local_cache_size: 2,
            ttl_secs: 1800,
            renewal_threshold_secs: 300,
            hot_threshold: 3,
            ..SessionConfig::default()
        }
    }

    fn manager() -> SessionManager<MemorySessionStore> {
        SessionManager::new(Arc::new(MemorySessionStore::new()), config())
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let sessions = manager();
        let created = sessions
            .create(
                "player-1",
                Claims {
                    roles: vec!["player".into()],
                    ..Claims::default()
                },
            )
            .await
            .unwrap();

        let fetched = sessions.get(&created.session_id).await.unwrap();
        assert_eq!(fetched.user_id, "player-1");
        assert!(fetched.claims.has_role("player"));
        assert_eq!(sessions.stats().cache_hits, 1);
    }

    #[tokio::test]
    async fn test_empty_user_is_rejected() {
        let err = manager().create("  ", Claims::default()).await.unwrap_err();
        assert!(matches!(err, GatewayError::Auth(AuthError::InvalidCredentials { .. })));
    }

    #[tokio::test]
    async fn test_cache_miss_falls_back_to_store() {
        let sessions = manager();
        let a = sessions.create("a", Claims::default()).await.unwrap();
        sessions.create("b", Claims::default()).await.unwrap();
        sessions.create("c", Claims::default()).await.unwrap();

        // capacity 2: "a" was evicted locally but the store still has it
        let fetched = sessions.get(&a.session_id).await.unwrap();
        assert_eq!(fetched.user_id, "a");
        assert_eq!(sessions.stats().cache_misses, 1);
        assert_eq!(sessions.stats().cached, 2);
    }

    #[tokio::test]
    async fn test_other_process_resolves_same_session() {
        let store = Arc::new(MemorySessionStore::new());
        let gateway_a = SessionManager::new(Arc::clone(&store), config());
        let gateway_b = SessionManager::new(Arc::clone(&store), config());

        let session = gateway_a.create("p", Claims::default()).await.unwrap();
        let renewed = gateway_b.renew(&session.session_id).await.unwrap();
        assert!(renewed.expires_at >= session.expires_at);
        assert_eq!(gateway_b.get(&session.session_id).await.unwrap().user_id, "p");
    }

    #[tokio::test]
    async fn test_rebind_keeps_session_identity() {
        let sessions = manager();
        let session = sessions.create("p", Claims::default()).await.unwrap();
        let conn_a = ConnectionId::new();
        let conn_b = ConnectionId::new();

        let (_, prev) = sessions.bind(&session.session_id, conn_a).await.unwrap();
        assert_eq!(prev, None);

        // A drops: unbinding leaves the session resolvable
        assert!(sessions.unbind(&session.session_id, conn_a).await.unwrap());
        let after_drop = sessions.get(&session.session_id).await.unwrap();
        assert_eq!(after_drop.connection_id, None);

        let (rebound, prev) = sessions.bind(&session.session_id, conn_b).await.unwrap();
        assert_eq!(prev, None);
        assert_eq!(rebound.session_id, session.session_id);
        assert_eq!(rebound.connection_id, Some(conn_b));

        // a stale unbind from A must not detach B
        assert!(!sessions.unbind(&session.session_id, conn_a).await.unwrap());
        assert_eq!(sessions.stats().created, 1);
    }

    #[tokio::test]
    async fn test_expired_session_is_rejected() {
        let store = Arc::new(MemorySessionStore::new());
        let sessions = SessionManager::new(Arc::clone(&store), config());
        let mut session = sessions.create("p", Claims::default()).await.unwrap();
        session.expires_at = Utc::now() - chrono::Duration::seconds(1);
        store.upsert(&session, Duration::from_secs(60)).await.unwrap();
        sessions.cache.lock().put(session.session_id.clone(), session.clone());

        let err = sessions.get(&session.session_id).await.unwrap_err();
        assert!(matches!(err, GatewayError::Auth(AuthError::SessionExpired { .. })));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_stale_local_copy_defers_to_renewed_store_record() {
        let store = Arc::new(MemorySessionStore::new());
        let gateway_a = SessionManager::new(Arc::clone(&store), config());
        let gateway_b = SessionManager::new(Arc::clone(&store), config());

        let session = gateway_a.create("p", Claims::default()).await.unwrap();
        let renewed = gateway_b.renew(&session.session_id).await.unwrap();

        // A still caches the pre-renewal copy, which has since run out
        let mut stale = session.clone();
        stale.expires_at = Utc::now() - chrono::Duration::milliseconds(300);
        gateway_a.cache.lock().put(stale.session_id.clone(), stale);

        let resolved = gateway_a.get(&session.session_id).await.unwrap();
        assert_eq!(resolved.expires_at, renewed.expires_at);
        assert_eq!(store.len(), 1);
        assert_eq!(gateway_a.stats().expired, 0);

        let gateway_c = SessionManager::new(Arc::clone(&store), config());
        assert_eq!(gateway_c.get(&session.session_id).await.unwrap().user_id, "p");
    }

    #[tokio::test]
    async fn test_unbounded_ttl_saturates_expiry() {
        let sessions = SessionManager::new(
            Arc::new(MemorySessionStore::new()),
            SessionConfig {
                ttl_secs: u64::MAX,
                ..config()
            },
        );
        let session = sessions.create("p", Claims::default()).await.unwrap();
        assert_eq!(session.expires_at, DateTime::<Utc>::MAX_UTC);
        assert!(!session.is_expired());
        sessions.renew(&session.session_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_hot_session_auto_renews_near_expiry() {
        let sessions = manager();
        let mut session = sessions.create("p", Claims::default()).await.unwrap();
        session.expires_at = Utc::now() + chrono::Duration::seconds(60);
        sessions.cache.lock().put(session.session_id.clone(), session.clone());

        sessions.get(&session.session_id).await.unwrap();
        sessions.get(&session.session_id).await.unwrap();
        assert_eq!(sessions.stats().auto_renewals, 0);
        let renewed = sessions.get(&session.session_id).await.unwrap();
        assert_eq!(sessions.stats().auto_renewals, 1);
        assert!(renewed.remaining() > Duration::from_secs(1700));
    }

    #[tokio::test]
    async fn test_logout_user_destroys_all_sessions() {
        let sessions = manager();
        sessions.create("p", Claims::default()).await.unwrap();
        sessions.create("p", Claims::default()).await.unwrap();
        sessions.create("q", Claims::default()).await.unwrap();

        assert_eq!(sessions.get_user_sessions("p").await.unwrap().len(), 2);
        let removed = sessions.logout_user("p").await.unwrap();
        assert_eq!(removed.len(), 2);
        assert!(sessions.get_user_sessions("p").await.unwrap().is_empty());
        assert_eq!(sessions.get_user_sessions("q").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_cleanup_expired_drops_cached_sessions() {
        let sessions = manager();
        let mut session = sessions.create("p", Claims::default()).await.unwrap();
        session.expires_at = Utc::now() - chrono::Duration::seconds(1);
        sessions.cache.lock().put(session.session_id.clone(), session);

        assert_eq!(sessions.cleanup_expired(), 1);
        assert_eq!(sessions.stats().cached, 0);
    }
}
