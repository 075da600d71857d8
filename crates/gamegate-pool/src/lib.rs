//! GameGate ingress pipeline
//!
//! Everything between a client socket and the backend RPC pool: framed client
//! connections, sessions, the priority queue and the batch dispatcher, wired
//! together by [`gateway::Gateway`].
//!
//! # Architecture
//!
//! ```text
//!   clients ──► ┌──────────────────────┐      ┌──────────────────────┐
//!               │   Connection Pool    │      │   Session Manager    │
//!               │  (pool.rs)           │◄────►│  (session.rs)        │
//!               │  - Admission limit   │      │  - LRU cache + store │
//!               │  - Buffer recycling  │      │  - Resume / renew    │
//!               │  - Session index     │      │  - Expiry sweep      │
//!               └──────────┬───────────┘      └──────────────────────┘
//!                          │ frames (transport.rs, connection.rs)
//!               ┌──────────▼───────────┐
//!               │   Unified Handler    │──── system / gateway replies
//!               │  (handler.rs)        │
//!               └──────────┬───────────┘
//!                          │ business messages
//!          CRITICAL ┌──────▼───────────┐
//!         ┌─────────┤  Priority Queue  │
//!         │         │  (queue.rs)      │
//!         │         │  - Dedup window  │
//!         │         │  - Backpressure  │
//!         │         └──────┬───────────┘
//!         │                │ batches
//!         │         ┌──────▼───────────┐      ┌──────────────────────┐
//!         └────────►│ Batch Dispatcher │─────►│  gamegate-rpc pool   │
//!                   │  (dispatcher.rs) │      │  + circuit breakers  │
//!                   └──────────────────┘      └──────────────────────┘
//! ```
//!
//! Replies travel back through [`dispatcher::ReplySink`], which the connection
//! pool implements by looking up the session's current connection.

pub mod connection;
pub mod dispatcher;
pub mod gateway;
pub mod handler;
pub mod metrics;
pub mod pool;
pub mod queue;
pub mod session;
pub mod transport;

pub use connection::{drive, CloseReason, Connection, ConnectionInfo, ConnectionState};
pub use dispatcher::{
    BatchDispatcher, BatchItem, BatchReply, BatchRequest, DispatchResult, DispatcherStats,
    ReplySink,
};
pub use gateway::{AddressBook, Gateway};
pub use handler::{AuthRequest, MessageHandler, ResumeRequest, SessionGrant, UnifiedHandler};
pub use metrics::{ConnectionMetrics, DispatcherMetrics, MetricsExporter, QueueMetrics};
pub use pool::{ConnectionPool, PoolStats};
pub use queue::{PriorityQueue, QueueStats, QueuedMessage};
pub use session::{Claims, MemorySessionStore, Session, SessionManager, SessionStats, SessionStore};
pub use transport::{BusinessPayload, EnvelopeCodec};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::gateway::Gateway;
    pub use crate::handler::MessageHandler;
    pub use crate::pool::ConnectionPool;
    pub use crate::queue::PriorityQueue;
    pub use crate::session::{MemorySessionStore, SessionManager, SessionStore};
}

#[cfg(test)]
mod integration_tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::BytesMut;
    use futures::{SinkExt, StreamExt};
    use gamegate_core::config::GatewayConfig;
    use gamegate_core::error::Result;
    use gamegate_core::types::{message_ids, Envelope, RpcRequest, RpcResponse, ServiceInstance};
    use gamegate_router::StaticDiscovery;
    use gamegate_rpc::{serve_connection, ChannelConnector, FramedChannel, RpcService};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    /// Backend that answers each batch item with its own body.
    #[derive(Default)]
    struct EchoBatch {
        batches: AtomicUsize,
    }

    #[async_trait]
    impl RpcService for EchoBatch {
        async fn call(&self, request: RpcRequest) -> RpcResponse {
            let Ok(batch) = serde_json::from_slice::<BatchRequest>(&request.payload) else {
                return RpcResponse::ok(bytes::Bytes::new());
            };
            self.batches.fetch_add(1, Ordering::Relaxed);
            let reply = BatchReply {
                results: batch.items.iter().map(|i| RpcResponse::ok(i.body.clone())).collect(),
            };
            RpcResponse::ok(serde_json::to_vec(&reply).unwrap())
        }
    }

    /// Connects channels to an in-process backend over duplex pipes.
    struct InProcess {
        service: Arc<EchoBatch>,
    }

    #[async_trait]
    impl ChannelConnector for InProcess {
        type Channel = FramedChannel;

        async fn connect(&self, address: &str) -> Result<FramedChannel> {
            let (client, server) = tokio::io::duplex(64 * 1024);
            tokio::spawn(serve_connection(server, Arc::clone(&self.service), CancellationToken::new()));
            Ok(FramedChannel::from_io(address, client))
        }
    }

    #[tokio::test]
    async fn test_gateway_round_trip() {
        let service = Arc::new(EchoBatch::default());
        let discovery = Arc::new(StaticDiscovery::with_instances([ServiceInstance::new(
            "logic", "logic-1", "mem:logic-1",
        )]));
        let gateway = Arc::new(
            Gateway::new(
                GatewayConfig::default(),
                discovery,
                Arc::new(MemorySessionStore::new()),
                InProcess {
                    service: Arc::clone(&service),
                },
            )
            .unwrap(),
        );
        gateway.start().await.unwrap();
        assert_eq!(gateway.rpc().addresses(), vec!["mem:logic-1".to_string()]);

        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let session = {
            let gateway = Arc::clone(&gateway);
            tokio::spawn(async move { gateway.accept(server_io, "test-client").await })
        };
        let mut client = transport::framed(client_io, 64 * 1024, BytesMut::new());

        let auth = serde_json::json!({ "user_id": "player-1", "token": "secret-token" });
        client
            .send(Envelope::new(message_ids::AUTH, serde_json::to_vec(&auth).unwrap()))
            .await
            .unwrap();
        let granted = client.next().await.unwrap().unwrap();
        assert_eq!(granted.message_id, message_ids::AUTH | message_ids::RESPONSE_FLAG);
        let grant: SessionGrant = serde_json::from_slice(&granted.payload).unwrap();
        assert_eq!(grant.user_id, "player-1");
        assert!(!grant.resumed);

        let body = BusinessPayload::new("player-1", "move north")
            .with_sequence(1)
            .encode()
            .unwrap();
        client.send(Envelope::new(1001, body)).await.unwrap();

        let reply = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("reply within timeout")
            .unwrap()
            .unwrap();
        assert_eq!(reply.message_id, 1001 | message_ids::RESPONSE_FLAG);
        assert_eq!(&reply.payload[..], b"move north");
        assert_eq!(service.batches.load(Ordering::Relaxed), 1);

        drop(client);
        session.await.unwrap().unwrap();
        assert_eq!(gateway.pool().connection_count(), 0);
        // the session survives the disconnect so the player can resume
        let stats = gateway.sessions().stats();
        assert_eq!((stats.created, stats.destroyed), (1, 0));

        gateway.shutdown().await;
        assert!(gateway.queue().is_closed());
    }
}
