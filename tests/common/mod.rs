//! Common test utilities for the end-to-end pipeline tests
//!
//! Gateways here run against in-process backends reached over
//! `tokio::io::duplex` pipes, and clients talk to them the same way.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use gamegate_core::config::GatewayConfig;
use gamegate_core::error::{Result, RpcError};
use gamegate_core::types::{message_ids, Envelope, ErrorPayload, RpcRequest, RpcResponse, ServiceInstance};
use gamegate_pool::connection::CloseReason;
use gamegate_pool::{transport, BatchReply, BatchRequest, EnvelopeCodec, Gateway, MemorySessionStore, SessionGrant};
use gamegate_router::StaticDiscovery;
use gamegate_rpc::{serve_connection, ChannelConnector, FramedChannel, RpcService};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::DuplexStream;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

pub const REPLY_TIMEOUT: Duration = Duration::from_secs(5);

pub type TestGateway = Gateway<StaticDiscovery, MemorySessionStore, InProcessConnector>;

/// Backend instance that echoes batch items prefixed with its own name.
pub struct Backend {
    pub name: String,
    pub failing: AtomicBool,
    pub batches: AtomicUsize,
    pub items: AtomicUsize,
}

impl Backend {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            failing: AtomicBool::new(false),
            batches: AtomicUsize::new(0),
            items: AtomicUsize::new(0),
        })
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl RpcService for Backend {
    async fn call(&self, request: RpcRequest) -> RpcResponse {
        if self.failing.load(Ordering::SeqCst) {
            return RpcResponse::error(503, "backend overloaded");
        }
        let batch: BatchRequest = match serde_json::from_slice(&request.payload) {
            Ok(batch) => batch,
            Err(e) => return RpcResponse::error(400, e.to_string()),
        };
        self.batches.fetch_add(1, Ordering::SeqCst);
        self.items.fetch_add(batch.items.len(), Ordering::SeqCst);

        let reply = BatchReply {
            results: batch
                .items
                .iter()
                .map(|item| {
                    let mut body = format!("{}:", self.name).into_bytes();
                    body.extend_from_slice(&item.body);
                    RpcResponse::ok(body)
                })
                .collect(),
        };
        RpcResponse::ok(serde_json::to_vec(&reply).unwrap())
    }
}

/// Connects RPC channels to [`Backend`]s by address.
#[derive(Default)]
pub struct InProcessConnector {
    backends: HashMap<String, Arc<Backend>>,
}

impl InProcessConnector {
    pub fn with_backend(mut self, address: &str, backend: Arc<Backend>) -> Self {
        self.backends.insert(address.to_string(), backend);
        self
    }
}

#[async_trait]
impl ChannelConnector for InProcessConnector {
    type Channel = FramedChannel;

    async fn connect(&self, address: &str) -> Result<FramedChannel> {
        let backend = self
            .backends
            .get(address)
            .ok_or_else(|| RpcError::connect_failed(address, "no such backend"))?;
        let (client, server) = tokio::io::duplex(256 * 1024);
        tokio::spawn(serve_connection(server, Arc::clone(backend), CancellationToken::new()));
        Ok(FramedChannel::from_io(address, client))
    }
}

/// Config tuned for fast tests: short batching and retry delays.
pub fn test_config() -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.metrics.enabled = false;
    config.dispatcher.batch_timeout_ms = 5;
    config.dispatcher.retry_delay_ms = 1;
    config.dispatcher.max_retry_delay_ms = 5;
    config
}

/// Starts a gateway with one backend per `(service, instance_id)` pair.
pub async fn start_gateway(
    config: GatewayConfig,
    instances: &[(&str, &str)],
) -> (Arc<TestGateway>, Arc<StaticDiscovery>, HashMap<String, Arc<Backend>>) {
    let mut connector = InProcessConnector::default();
    let mut backends = HashMap::new();
    let mut members = Vec::new();
    for (service, instance_id) in instances {
        let address = format!("mem:{instance_id}");
        let backend = Backend::new(instance_id);
        connector = connector.with_backend(&address, Arc::clone(&backend));
        backends.insert(instance_id.to_string(), backend);
        members.push(ServiceInstance::new(*service, *instance_id, address));
    }

    let discovery = Arc::new(StaticDiscovery::with_instances(members));
    let gateway = Gateway::new(
        config,
        Arc::clone(&discovery),
        Arc::new(MemorySessionStore::new()),
        connector,
    )
    .expect("valid test config");
    gateway.start().await.expect("gateway starts");
    (Arc::new(gateway), discovery, backends)
}

/// A game client connected to the gateway over an in-memory pipe.
pub struct Client {
    framed: Framed<DuplexStream, EnvelopeCodec>,
    session: JoinHandle<Result<CloseReason>>,
}

impl Client {
    pub fn connect(gateway: &Arc<TestGateway>, peer: &str) -> Self {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let gateway = Arc::clone(gateway);
        let peer = peer.to_string();
        let session = tokio::spawn(async move { gateway.accept(server_io, peer).await });
        Self {
            framed: transport::framed(client_io, 64 * 1024, BytesMut::new()),
            session,
        }
    }

    pub async fn send(&mut self, envelope: Envelope) {
        self.framed.send(envelope).await.expect("gateway accepts frame");
    }

    pub async fn recv(&mut self) -> Envelope {
        tokio::time::timeout(REPLY_TIMEOUT, self.framed.next())
            .await
            .expect("reply within timeout")
            .expect("connection open")
            .expect("well-formed frame")
    }

    pub async fn auth(&mut self, user_id: &str, session_id: Option<&str>) -> SessionGrant {
        let body = serde_json::json!({
            "user_id": user_id,
            "token": "test-token-0001",
            "session_id": session_id,
        });
        self.send(Envelope::new(message_ids::AUTH, serde_json::to_vec(&body).unwrap()))
            .await;
        let reply = self.recv().await;
        assert_eq!(reply.message_id, message_ids::AUTH | message_ids::RESPONSE_FLAG);
        serde_json::from_slice(&reply.payload).expect("session grant")
    }

    pub async fn send_business(&mut self, message_id: u32, key: &str, sequence: u32, body: &'static str) {
        let payload = transport::BusinessPayload::new(key, Bytes::from_static(body.as_bytes()))
            .with_sequence(sequence)
            .encode()
            .unwrap();
        self.send(Envelope::new(message_id, payload)).await;
    }

    /// Closes the client side and waits for the gateway to release the connection.
    pub async fn close(self) -> CloseReason {
        drop(self.framed);
        self.session
            .await
            .expect("session task")
            .expect("connection admitted")
    }
}

/// Decodes a structured error envelope.
pub fn error_payload(envelope: &Envelope) -> ErrorPayload {
    assert_eq!(envelope.message_id, message_ids::ERROR, "expected an error envelope");
    serde_json::from_slice(&envelope.payload).expect("error payload")
}

/// Polls `check` until it holds or a second passes.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}
