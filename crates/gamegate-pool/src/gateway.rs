//! Gateway assembly
//!
//! Wires the pipeline together once at startup and owns its lifecycle:
//! [`Gateway::new`] builds every component, [`Gateway::start`] launches the
//! background tasks, [`Gateway::accept`] runs one client connection and
//! [`Gateway::shutdown`] drains and stops everything.

use crate::connection::{drive, CloseReason};
use crate::dispatcher::BatchDispatcher;
use crate::handler::UnifiedHandler;
use crate::pool::ConnectionPool;
use crate::queue::PriorityQueue;
use crate::session::{SessionManager, SessionStore};
use gamegate_core::config::GatewayConfig;
use gamegate_core::error::Result;
use gamegate_core::types::ServiceInstance;
use gamegate_router::{DiscoveryEvent, MessageRouter, ServiceDiscovery};
use gamegate_rpc::{BreakerRegistry, ChannelConnector, RpcPool};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long shutdown waits for the dispatcher to drain the queue
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Tracks which backend addresses are in use, so RPC channels are opened for
/// new instances and closed once no instance uses an address any more.
#[derive(Debug, Default)]
pub struct AddressBook {
    instances: HashMap<(String, String), String>,
}

impl AddressBook {
    /// Records `instance`. Returns the address to open channels to, if it is new.
    pub fn register(&mut self, instance: &ServiceInstance) -> Option<String> {
        let key = (instance.service_name.clone(), instance.instance_id.clone());
        let in_use = self
            .instances
            .iter()
            .any(|(k, a)| *k != key && *a == instance.address);
        let previous = self.instances.insert(key, instance.address.clone());
        let unchanged = previous.as_deref() == Some(instance.address.as_str());
        (!in_use && !unchanged).then(|| instance.address.clone())
    }

    /// Forgets an instance. Returns its address if nothing else uses it.
    pub fn deregister(&mut self, service_name: &str, instance_id: &str) -> Option<String> {
        let address = self
            .instances
            .remove(&(service_name.to_string(), instance_id.to_string()))?;
        let still_used = self.instances.values().any(|a| *a == address);
        (!still_used).then_some(address)
    }

    pub fn addresses(&self) -> Vec<String> {
        let mut out: Vec<String> = self.instances.values().cloned().collect();
        out.sort();
        out.dedup();
        out
    }
}

/// A fully wired gateway.
pub struct Gateway<D, S, C>
where
    D: ServiceDiscovery,
    S: SessionStore,
    C: ChannelConnector,
{
    config: GatewayConfig,
    discovery: Arc<D>,
    router: Arc<MessageRouter>,
    rpc: Arc<RpcPool<C>>,
    breakers: Arc<BreakerRegistry>,
    queue: Arc<PriorityQueue>,
    pool: Arc<ConnectionPool>,
    sessions: Arc<SessionManager<S>>,
    dispatcher: Arc<BatchDispatcher<RpcPool<C>, ConnectionPool>>,
    handler: Arc<UnifiedHandler<RpcPool<C>, S>>,
    addresses: Arc<tokio::sync::Mutex<AddressBook>>,
    cancel: CancellationToken,
    dispatcher_task: Mutex<Option<JoinHandle<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<D, S, C> Gateway<D, S, C>
where
    D: ServiceDiscovery,
    S: SessionStore,
    C: ChannelConnector,
{
    /// Builds every component from `config`.
    ///
    /// # Errors
    ///
    /// Configuration errors from validation or the routing table.
    pub fn new(config: GatewayConfig, discovery: Arc<D>, store: Arc<S>, connector: C) -> Result<Self> {
        config.validate()?;

        let router = Arc::new(MessageRouter::new(config.routing.clone())?);
        let rpc = Arc::new(RpcPool::new(connector, config.rpc_pool.clone()));
        let breakers = Arc::new(BreakerRegistry::new(config.breaker.clone()));
        let queue = Arc::new(PriorityQueue::new(config.queue.clone()));
        let pool = Arc::new(ConnectionPool::new(config.pool.clone(), config.connection.clone()));
        let sessions = Arc::new(SessionManager::new(store, config.session.clone()));
        let dispatcher = Arc::new(BatchDispatcher::new(
            Arc::clone(&queue),
            Arc::clone(&router),
            Arc::clone(&rpc),
            Arc::clone(&pool),
            Arc::clone(&breakers),
            config.dispatcher.clone(),
        ));
        let handler = Arc::new(UnifiedHandler::new(
            Arc::clone(&router),
            Arc::clone(&queue),
            Arc::clone(&dispatcher),
            Arc::clone(&sessions),
            Arc::clone(&pool),
        ));

        Ok(Self {
            config,
            discovery,
            router,
            rpc,
            breakers,
            queue,
            pool,
            sessions,
            dispatcher,
            handler,
            addresses: Arc::new(tokio::sync::Mutex::new(AddressBook::default())),
            cancel: CancellationToken::new(),
            dispatcher_task: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Loads current membership and starts the background tasks.
    pub async fn start(&self) -> Result<()> {
        let events = self.discovery.subscribe();
        self.router.sync_from(self.discovery.as_ref()).await?;
        self.sync_addresses().await?;

        let dispatcher = tokio::spawn(Arc::clone(&self.dispatcher).run(self.cancel.child_token()));
        *self.dispatcher_task.lock() = Some(dispatcher);

        let mut tasks = self.tasks.lock();
        tasks.push(self.rpc.spawn_maintenance(self.cancel.child_token()));
        tasks.push(self.pool.spawn_cleanup(self.cancel.child_token()));
        tasks.push(self.sessions.spawn_cleanup(self.cancel.child_token()));
        tasks.push(
            self.router
                .spawn_watcher(Arc::clone(&self.discovery), self.cancel.child_token()),
        );
        tasks.push(self.spawn_address_sync(events));

        info!(
            services = self.router.table().services().len(),
            backends = self.rpc.addresses().len(),
            "Gateway started"
        );
        Ok(())
    }

    async fn sync_addresses(&self) -> Result<()> {
        for service in self.router.table().services() {
            for instance in self.discovery.list(&service).await? {
                let added = self.addresses.lock().await.register(&instance);
                if let Some(address) = added {
                    self.rpc.add_address(&address).await;
                }
            }
        }
        Ok(())
    }

    /// Keeps RPC channels in step with discovery.
    fn spawn_address_sync(&self, mut events: broadcast::Receiver<DiscoveryEvent>) -> JoinHandle<()> {
        let discovery = Arc::clone(&self.discovery);
        let router = Arc::clone(&self.router);
        let rpc = Arc::clone(&self.rpc);
        let breakers = Arc::clone(&self.breakers);
        let book = Arc::clone(&self.addresses);
        let cancel = self.cancel.child_token();

        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => event,
                };
                match event {
                    Ok(DiscoveryEvent::Registered(instance)) => {
                        let added = book.lock().await.register(&instance);
                        if let Some(address) = added {
                            let opened = rpc.add_address(&address).await;
                            debug!(backend = %address, opened, "Backend address added");
                        }
                    }
                    Ok(DiscoveryEvent::Deregistered {
                        service_name,
                        instance_id,
                    }) => {
                        let removed = book.lock().await.deregister(&service_name, &instance_id);
                        if let Some(address) = removed {
                            rpc.remove_address(&address);
                            breakers.remove(&address);
                            debug!(backend = %address, "Backend address removed");
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Address sync lagged, reloading membership");
                        for service in router.table().services() {
                            let Ok(listed) = discovery.list(&service).await else {
                                continue;
                            };
                            let mut guard = book.lock().await;
                            for instance in listed {
                                if let Some(address) = guard.register(&instance) {
                                    rpc.add_address(&address).await;
                                }
                            }
                        }
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    /// Runs one client connection to completion and releases it.
    ///
    /// # Errors
    ///
    /// `ConnectionLimit` or `ShuttingDown` if the connection is not admitted.
    pub async fn accept<T>(&self, io: T, peer: impl Into<String>) -> Result<CloseReason>
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let conn = self.pool.acquire(peer)?;
        let reason = drive(
            Arc::clone(&conn),
            io,
            Arc::clone(&self.handler),
            self.config.connection.clone(),
            self.config.listener.max_frame_bytes,
            Arc::clone(self.pool.metrics()),
        )
        .await;

        // the session outlives the connection; only the binding goes
        if let Some(session_id) = conn.session() {
            let _ = self.sessions.unbind(&session_id, conn.id()).await;
        }
        self.pool.release(conn.id());
        Ok(reason)
    }

    /// Stops accepting, drains the queue and stops every background task.
    pub async fn shutdown(&self) {
        info!("Gateway shutting down");
        self.pool.shutdown();
        self.queue.close();

        let dispatcher = self.dispatcher_task.lock().take();
        if let Some(mut dispatcher) = dispatcher {
            if tokio::time::timeout(DRAIN_TIMEOUT, &mut dispatcher).await.is_err() {
                warn!(pending = self.queue.len(), "Queue not drained in time");
                self.cancel.cancel();
                let _ = dispatcher.await;
            }
        }

        self.cancel.cancel();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        self.rpc.shutdown();
        info!("Gateway stopped");
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    pub fn rpc(&self) -> &Arc<RpcPool<C>> {
        &self.rpc
    }

    pub fn queue(&self) -> &Arc<PriorityQueue> {
        &self.queue
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn sessions(&self) -> &Arc<SessionManager<S>> {
        &self.sessions
    }

    pub fn dispatcher(&self) -> &Arc<BatchDispatcher<RpcPool<C>, ConnectionPool>> {
        &self.dispatcher
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_book_tracks_shared_addresses() {
        let mut book = AddressBook::default();
        let a = ServiceInstance::new("logic", "logic-1", "10.0.0.1:7001");
        let b = ServiceInstance::new("chat", "chat-1", "10.0.0.1:7001");
        let c = ServiceInstance::new("logic", "logic-2", "10.0.0.2:7001");

        assert_eq!(book.register(&a).as_deref(), Some("10.0.0.1:7001"));
        // same address behind another service
        assert_eq!(book.register(&b), None);
        assert_eq!(book.register(&c).as_deref(), Some("10.0.0.2:7001"));
        // re-registering (health change) is not a new address
        assert_eq!(book.register(&a), None);
        assert_eq!(book.addresses().len(), 2);

        assert_eq!(book.deregister("logic", "logic-1"), None);
        assert_eq!(book.deregister("chat", "chat-1").as_deref(), Some("10.0.0.1:7001"));
        assert_eq!(book.deregister("chat", "chat-1"), None);
        assert_eq!(book.addresses(), vec!["10.0.0.2:7001".to_string()]);
    }

    #[test]
    fn test_address_change_opens_new_address() {
        let mut book = AddressBook::default();
        book.register(&ServiceInstance::new("logic", "logic-1", "10.0.0.1:7001"));
        let moved = ServiceInstance::new("logic", "logic-1", "10.0.0.9:7001");
        assert_eq!(book.register(&moved).as_deref(), Some("10.0.0.9:7001"));
        assert_eq!(book.addresses(), vec!["10.0.0.9:7001".to_string()]);
    }
}
