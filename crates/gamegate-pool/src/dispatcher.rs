//! Batch dispatcher
//!
//! Drains the [`PriorityQueue`] in size- and time-bounded batches, groups each
//! batch by destination instance and forwards every group as one RPC call
//! through that destination's circuit breaker.
//!
//! Failures are handled in two layers. A failed call is retried in place with
//! jittered exponential backoff. If it still fails with a retryable error, each
//! message is re-resolved and requeued, so a later batch can fail over to
//! another instance. Once both layers are exhausted the originating client
//! receives a structured error envelope; nothing is dropped silently.

use crate::metrics::DispatcherMetrics;
use crate::queue::{PriorityQueue, QueuedMessage};
use bytes::Bytes;
use gamegate_core::config::DispatcherConfig;
use gamegate_core::error::{GatewayError, QueueError, Result, RpcError};
use gamegate_core::types::{message_ids, ConnectionId, Envelope, RpcRequest, RpcResponse, SessionId};
use gamegate_router::MessageRouter;
use gamegate_rpc::{retry_with_backoff, BackoffConfig, BreakerRegistry, RpcCaller};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Delivers replies and errors back to the originating client.
pub trait ReplySink: Send + Sync + 'static {
    /// Sends `envelope` to the client, preferring the connection currently
    /// bound to `session_id`. Returns false if the client is gone.
    fn deliver(
        &self,
        session_id: Option<&SessionId>,
        connection_id: ConnectionId,
        envelope: Envelope,
    ) -> bool;
}

/// One forwarded message inside a batch call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchItem {
    pub message_id: u32,
    pub routing_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub connection_id: String,
    pub body: Bytes,
}

impl From<&QueuedMessage> for BatchItem {
    fn from(message: &QueuedMessage) -> Self {
        Self {
            message_id: message.message_id,
            routing_key: message.routing_key.clone(),
            session_id: message.session_id.as_ref().map(|s| s.to_string()),
            connection_id: message.connection_id.to_string(),
            body: message.body.clone(),
        }
    }
}

/// Payload of a batch call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRequest {
    pub items: Vec<BatchItem>,
}

/// Payload of a batch reply; `results[i]` answers `items[i]`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchReply {
    pub results: Vec<RpcResponse>,
}

/// Outcome of dispatching one message.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchResult {
    pub success: bool,
    pub message_id: u32,
    pub service_name: String,
    pub instance: String,
    pub error: Option<String>,
    pub latency: Duration,
    pub retry_count: u32,
    /// Handed back to the queue for another attempt
    pub requeued: bool,
}

/// Dispatcher statistics
#[derive(Debug, Clone, Serialize)]
pub struct DispatcherStats {
    pub total: u64,
    pub success: u64,
    pub failed: u64,
    pub batches: u64,
    pub average_latency_ms: f64,
    pub success_rate: f64,
    pub inflight_batches: usize,
    pub open_breakers: usize,
}

type Destination = (Arc<str>, String);

/// Splits a batch by destination, keeping arrival order inside each group.
fn group_by_destination(batch: Vec<QueuedMessage>) -> Vec<(Destination, Vec<QueuedMessage>)> {
    let mut index: HashMap<Destination, usize> = HashMap::new();
    let mut groups: Vec<(Destination, Vec<QueuedMessage>)> = Vec::new();
    for message in batch {
        let key = (Arc::clone(&message.service), message.instance.address.clone());
        match index.get(&key) {
            Some(&i) => groups[i].1.push(message),
            None => {
                index.insert(key.clone(), groups.len());
                groups.push((key, vec![message]));
            }
        }
    }
    groups
}

/// Drains the queue and forwards batches to backends.
pub struct BatchDispatcher<R: RpcCaller, S: ReplySink> {
    queue: Arc<PriorityQueue>,
    router: Arc<MessageRouter>,
    rpc: Arc<R>,
    replies: Arc<S>,
    breakers: Arc<BreakerRegistry>,
    inflight: Arc<Semaphore>,
    config: DispatcherConfig,
    backoff: BackoffConfig,
    metrics: Arc<DispatcherMetrics>,
}

impl<R: RpcCaller, S: ReplySink> BatchDispatcher<R, S> {
    pub fn new(
        queue: Arc<PriorityQueue>,
        router: Arc<MessageRouter>,
        rpc: Arc<R>,
        replies: Arc<S>,
        breakers: Arc<BreakerRegistry>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            inflight: Arc::new(Semaphore::new(config.max_inflight_batches)),
            backoff: BackoffConfig::from(&config),
            queue,
            router,
            rpc,
            replies,
            breakers,
            config,
            metrics: Arc::new(DispatcherMetrics::new()),
        }
    }

    pub fn metrics(&self) -> &Arc<DispatcherMetrics> {
        &self.metrics
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    /// Dispatch loop. Runs until `cancel` fires or the queue is closed and
    /// drained, then waits for in-flight batches.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        info!(
            batch_size = self.config.batch_size,
            batch_timeout_ms = self.config.batch_timeout_ms,
            "Dispatcher started"
        );
        let mut inflight = JoinSet::new();

        loop {
            let batch = tokio::select! {
                _ = cancel.cancelled() => break,
                batch = self.queue.dequeue_batch(self.config.batch_size, self.config.batch_timeout()) => batch,
            };
            if batch.is_empty() {
                break;
            }

            for (_, group) in group_by_destination(batch) {
                let permit = match Arc::clone(&self.inflight).acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                let dispatcher = Arc::clone(&self);
                inflight.spawn(async move {
                    let _permit = permit;
                    dispatcher.dispatch_group(group).await;
                });
            }
            while inflight.try_join_next().is_some() {}
        }

        while inflight.join_next().await.is_some() {}
        info!("Dispatcher stopped");
    }

    /// Forwards a single message without queuing. Used for CRITICAL traffic.
    pub async fn dispatch_immediate(&self, message: QueuedMessage) -> DispatchResult {
        let mut results = self.dispatch_group(vec![message]).await;
        results.remove(0)
    }

    /// Forwards one destination group and settles every message in it.
    pub async fn dispatch_group(&self, group: Vec<QueuedMessage>) -> Vec<DispatchResult> {
        let Some(first) = group.first() else {
            return Vec::new();
        };
        let service = Arc::clone(&first.service);
        let address = first.instance.address.clone();
        self.metrics.record_batch(&service, group.len());

        let started = Instant::now();
        let (outcome, retries) = match self.encode(&service, &group) {
            Ok(request) => self.call_with_retry(&address, request).await,
            Err(e) => (Err(e), 0),
        };
        let latency = started.elapsed();

        match outcome.and_then(|response| decode_reply(&response, group.len())) {
            Ok(results) => group
                .into_iter()
                .zip(results)
                .map(|(message, response)| self.settle_reply(message, response, &address, latency, retries))
                .collect(),
            Err(e) => {
                debug!(service = %service, backend = %address, error = %e, size = group.len(), "Batch failed");
                group
                    .into_iter()
                    .map(|message| self.settle_failure(message, &e, latency, retries))
                    .collect()
            }
        }
    }

    fn encode(&self, service: &str, group: &[QueuedMessage]) -> Result<RpcRequest> {
        let body = BatchRequest {
            items: group.iter().map(BatchItem::from).collect(),
        };
        let payload = serde_json::to_vec(&body)
            .map_err(|e| RpcError::protocol(format!("batch encode failed: {}", e)))?;
        Ok(RpcRequest::new(service, self.config.batch_method.as_str(), payload)
            .with_metadata("batch_size", group.len().to_string()))
    }

    async fn call_with_retry(&self, address: &str, request: RpcRequest) -> (Result<RpcResponse>, u32) {
        let breaker = self.breakers.get(address);
        let breaker = &breaker;
        let rpc = &self.rpc;
        let request = &request;

        retry_with_backoff(
            |_attempt| async move {
                breaker
                    .call(|| async move {
                        let response = rpc.call(address, request.clone()).await?;
                        if response.is_ok() {
                            Ok(response)
                        } else {
                            Err(GatewayError::from(RpcError::Backend {
                                target: address.to_string(),
                                code: response.code,
                                message: response.message,
                            }))
                        }
                    })
                    .await
            },
            self.config.max_retries + 1,
            &self.backoff,
            GatewayError::is_retryable,
        )
        .await
    }

    fn settle_reply(
        &self,
        message: QueuedMessage,
        response: RpcResponse,
        address: &str,
        latency: Duration,
        retries: u32,
    ) -> DispatchResult {
        if !response.is_ok() {
            // per-item rejection is an application answer, not a transport fault
            let err: GatewayError = RpcError::Backend {
                target: address.to_string(),
                code: response.code,
                message: response.message,
            }
            .into();
            self.report(&message, &err);
            return self.result(&message, Some(&err), latency, retries, false);
        }

        if !response.payload.is_empty() {
            let reply = Envelope::new(message.message_id | message_ids::RESPONSE_FLAG, response.payload);
            if !self.replies.deliver(message.session_id.as_ref(), message.connection_id, reply) {
                debug!(message_id = message.message_id, "Client gone before reply");
            }
        }
        self.result(&message, None, latency, retries, false)
    }

    fn settle_failure(
        &self,
        message: QueuedMessage,
        err: &GatewayError,
        latency: Duration,
        retries: u32,
    ) -> DispatchResult {
        if err.is_retryable() && message.retry_count < self.queue.max_retries() {
            match self.requeue(message.clone()) {
                Ok(()) => return self.result(&message, Some(err), latency, retries, true),
                Err(requeue_err) => {
                    debug!(message_id = message.message_id, error = %requeue_err, "Requeue refused");
                }
            }
        }
        warn!(
            message_id = message.message_id,
            service = %message.service,
            error = %err,
            retry_count = message.retry_count,
            "Dispatch failed permanently"
        );
        self.report(&message, err);
        self.result(&message, Some(err), latency, retries, false)
    }

    /// Re-resolves the destination and hands the message back to the queue.
    fn requeue(&self, mut message: QueuedMessage) -> Result<()> {
        let resolved = self.router.resolve(&message.service, &message.routing_key)?;
        message.instance = resolved.instance;
        if let Some(evicted) = self.queue.requeue(message)? {
            let err: GatewayError = QueueError::full("dispatch", self.queue.capacity()).into();
            self.report(&evicted, &err);
        }
        Ok(())
    }

    fn report(&self, message: &QueuedMessage, err: &GatewayError) {
        let envelope = Envelope::error(message.message_id, err.error_code(), err.client_message());
        if !self
            .replies
            .deliver(message.session_id.as_ref(), message.connection_id, envelope)
        {
            debug!(message_id = message.message_id, "Client gone before error report");
        }
    }

    fn result(
        &self,
        message: &QueuedMessage,
        err: Option<&GatewayError>,
        latency: Duration,
        retries: u32,
        requeued: bool,
    ) -> DispatchResult {
        let success = err.is_none();
        if !requeued {
            self.metrics.record_result(&message.service, success, latency);
        }
        DispatchResult {
            success,
            message_id: message.message_id,
            service_name: message.service.to_string(),
            instance: message.instance.instance_id.clone(),
            error: err.map(|e| e.to_string()),
            latency,
            retry_count: message.retry_count + retries,
            requeued,
        }
    }

    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            total: self.metrics.total(),
            success: self.metrics.success(),
            failed: self.metrics.failed(),
            batches: self.metrics.batches(),
            average_latency_ms: self.metrics.average_latency().as_secs_f64() * 1000.0,
            success_rate: self.metrics.success_rate(),
            inflight_batches: self.config.max_inflight_batches - self.inflight.available_permits(),
            open_breakers: self.breakers.open_count(),
        }
    }
}

fn decode_reply(response: &RpcResponse, expected: usize) -> Result<Vec<RpcResponse>> {
    let reply: BatchReply = serde_json::from_slice(&response.payload)
        .map_err(|e| RpcError::protocol(format!("batch reply decode failed: {}", e)))?;
    if reply.results.len() != expected {
        return Err(RpcError::protocol(format!(
            "batch reply has {} results for {} items",
            reply.results.len(),
            expected
        ))
        .into());
    }
    Ok(reply.results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use gamegate_core::config::{BreakerConfig, QueueConfig, RoutingConfig};
    use gamegate_core::types::{Priority, ServiceInstance};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Backend stub: echoes every item, or fails every call.
    struct FakeBackend {
        calls: AtomicU32,
        fail_with: Option<RpcError>,
        requests: Mutex<Vec<(String, BatchRequest)>>,
    }

    impl FakeBackend {
        fn echo() -> Self {
            Self {
                calls: AtomicU32::new(0),
                fail_with: None,
                requests: Mutex::new(Vec::new()),
            }
        }

        fn failing(err: RpcError) -> Self {
            Self {
                fail_with: Some(err),
                ..Self::echo()
            }
        }
    }

    #[async_trait]
    impl RpcCaller for FakeBackend {
        async fn call(&self, address: &str, request: RpcRequest) -> Result<RpcResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = &self.fail_with {
                return Err(err.clone().into());
            }
            let batch: BatchRequest = serde_json::from_slice(&request.payload).unwrap();
            let reply = BatchReply {
                results: batch
                    .items
                    .iter()
                    .map(|item| RpcResponse::ok(item.body.clone()))
                    .collect(),
            };
            self.requests.lock().push((address.to_string(), batch));
            Ok(RpcResponse::ok(serde_json::to_vec(&reply).unwrap()))
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        delivered: Mutex<Vec<(ConnectionId, Envelope)>>,
    }

    impl ReplySink for RecordingSink {
        fn deliver(&self, _session: Option<&SessionId>, connection_id: ConnectionId, envelope: Envelope) -> bool {
            self.delivered.lock().push((connection_id, envelope));
            true
        }
    }

    fn router() -> Arc<MessageRouter> {
        let router = MessageRouter::new(RoutingConfig::default()).unwrap();
        router.register_instance(ServiceInstance::new("logic", "logic-1", "10.0.0.1:7001"));
        router.register_instance(ServiceInstance::new("logic", "logic-2", "10.0.0.2:7001"));
        Arc::new(router)
    }

    fn dispatcher(
        backend: FakeBackend,
        queue_retries: u32,
    ) -> (
        Arc<BatchDispatcher<FakeBackend, RecordingSink>>,
        Arc<FakeBackend>,
        Arc<RecordingSink>,
        Arc<PriorityQueue>,
    ) {
        let backend = Arc::new(backend);
        let sink = Arc::new(RecordingSink::default());
        let queue = Arc::new(PriorityQueue::new(QueueConfig {
            max_retries: queue_retries,
            ..QueueConfig::default()
        }));
        let breakers = Arc::new(BreakerRegistry::new(BreakerConfig {
            failure_threshold: 3,
            ..BreakerConfig::default()
        }));
        let config = DispatcherConfig {
            batch_size: 10,
            batch_timeout_ms: 5,
            max_retries: 2,
            retry_delay_ms: 1,
            max_retry_delay_ms: 2,
            ..DispatcherConfig::default()
        };
        let dispatcher = Arc::new(BatchDispatcher::new(
            Arc::clone(&queue),
            router(),
            Arc::clone(&backend),
            Arc::clone(&sink),
            breakers,
            config,
        ));
        (dispatcher, backend, sink, queue)
    }

    fn message(router: &MessageRouter, id: u32, key: &str) -> QueuedMessage {
        let resolved = router.resolve("logic", key).unwrap();
        QueuedMessage::new(
            Priority::Normal,
            id,
            resolved.service,
            resolved.instance,
            key,
            Bytes::from(format!("body-{}", id)),
            ConnectionId::new(),
        )
    }

    #[test]
    fn test_grouping_keeps_arrival_order() {
        let router = router();
        let mut batch = Vec::new();
        for (i, key) in ["a", "b", "c", "d", "e", "f", "g", "h"].iter().enumerate() {
            batch.push(message(&router, 1000 + i as u32, key));
        }
        let groups = group_by_destination(batch);
        let total: usize = groups.iter().map(|(_, g)| g.len()).sum();
        assert_eq!(total, 8);
        for (dest, group) in &groups {
            assert!(group.iter().all(|m| m.instance.address == dest.1));
            assert!(group.windows(2).all(|w| w[0].message_id < w[1].message_id));
        }
    }

    #[tokio::test]
    async fn test_group_is_one_call_and_replies_are_delivered() {
        let (dispatcher, backend, sink, _) = dispatcher(FakeBackend::echo(), 0);
        let router = router();
        let first = message(&router, 1001, "room-1");
        let mut second = message(&router, 1002, "room-1");
        second.connection_id = first.connection_id;

        let results = dispatcher.dispatch_group(vec![first.clone(), second]).await;
        assert!(results.iter().all(|r| r.success));
        assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
        assert_eq!(backend.requests.lock()[0].1.items.len(), 2);

        let delivered = sink.delivered.lock();
        assert_eq!(delivered.len(), 2);
        assert_eq!(delivered[0].1.message_id, 1001 | message_ids::RESPONSE_FLAG);
        assert_eq!(delivered[1].1.payload, Bytes::from("body-1002"));
        assert_eq!(dispatcher.stats().success, 2);
    }

    #[tokio::test]
    async fn test_persistent_failure_reports_structured_error() {
        let (dispatcher, backend, sink, _) =
            dispatcher(FakeBackend::failing(RpcError::unavailable("10.0.0.1:7001")), 0);
        let router = router();

        let result = dispatcher
            .dispatch_immediate(message(&router, 1001, "room-1"))
            .await;
        assert!(!result.success);
        assert!(!result.requeued);
        assert_eq!(result.retry_count, 2);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);

        let delivered = sink.delivered.lock();
        assert_eq!(delivered.len(), 1);
        let envelope = &delivered[0].1;
        assert_eq!(envelope.message_id, message_ids::ERROR);
        let body: gamegate_core::types::ErrorPayload = serde_json::from_slice(&envelope.payload).unwrap();
        assert_eq!(body.error_code, 5004);
        assert_eq!(body.message_id, 1001);
        assert_eq!(dispatcher.stats().failed, 1);
    }

    #[tokio::test]
    async fn test_open_circuit_is_not_retried() {
        let (dispatcher, backend, sink, _) =
            dispatcher(FakeBackend::failing(RpcError::unavailable("10.0.0.1:7001")), 3);
        let router = router();
        let msg = message(&router, 1001, "room-1");

        // three failed attempts open the breaker for this address
        let first = dispatcher.dispatch_immediate(msg.clone()).await;
        assert!(first.requeued);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);

        let second = dispatcher.dispatch_immediate(msg).await;
        assert!(!second.success);
        assert!(!second.requeued);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 3);

        let delivered = sink.delivered.lock();
        let body: gamegate_core::types::ErrorPayload =
            serde_json::from_slice(&delivered.last().unwrap().1.payload).unwrap();
        assert_eq!(body.error_code, 5001);
    }

    #[tokio::test]
    async fn test_retryable_failure_is_requeued_once_inline_retries_run_out() {
        let (dispatcher, _, sink, queue) =
            dispatcher(FakeBackend::failing(RpcError::timeout("x", Duration::from_millis(5))), 1);
        let router = router();

        let result = dispatcher
            .dispatch_immediate(message(&router, 1001, "room-1"))
            .await;
        assert!(result.requeued);
        assert!(sink.delivered.lock().is_empty());
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.stats().retried, 1);
    }

    #[tokio::test]
    async fn test_run_drains_queue_until_closed() {
        let (dispatcher, backend, sink, queue) = dispatcher(FakeBackend::echo(), 0);
        let router = router();
        for i in 0..5 {
            queue
                .enqueue(message(&router, 1000 + i, &format!("key-{}", i)))
                .unwrap();
        }
        queue.close();

        Arc::clone(&dispatcher).run(CancellationToken::new()).await;
        assert!(queue.is_empty());
        assert_eq!(sink.delivered.lock().len(), 5);
        assert!(backend.calls.load(Ordering::SeqCst) <= 2);
        assert_eq!(dispatcher.stats().total, 5);
    }
}
