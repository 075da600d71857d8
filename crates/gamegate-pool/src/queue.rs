//! Priority message queue
//!
//! Bounded buffer between the handler and the dispatcher. Messages leave in
//! `(priority, sequence)` order: every CRITICAL message before any HIGH one,
//! and FIFO within a tier. A full queue makes room for an urgent message by
//! evicting the newest message of the least urgent tier.
//!
//! Usage crossing `high_watermark` turns the throttling signal on; it stays on
//! until usage falls back to `low_watermark`. The signal is advisory: producers
//! consult [`PriorityQueue::should_shed`] and decide.

use crate::metrics::QueueMetrics;
use bytes::Bytes;
use gamegate_core::config::QueueConfig;
use gamegate_core::error::{GatewayError, QueueError, Result};
use gamegate_core::types::{ConnectionId, Priority, ServiceInstance, SessionId};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// A routed business message waiting for dispatch.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub priority: Priority,
    pub message_id: u32,
    pub service: Arc<str>,
    /// Instance resolved at enqueue time
    pub instance: Arc<ServiceInstance>,
    pub routing_key: String,
    pub body: Bytes,
    pub connection_id: ConnectionId,
    pub session_id: Option<SessionId>,
    pub dedup_key: Option<String>,
    pub enqueued_at: Instant,
    pub retry_count: u32,
    /// Set by the queue on admission
    pub sequence: u64,
}

impl QueuedMessage {
    pub fn new(
        priority: Priority,
        message_id: u32,
        service: Arc<str>,
        instance: Arc<ServiceInstance>,
        routing_key: impl Into<String>,
        body: Bytes,
        connection_id: ConnectionId,
    ) -> Self {
        Self {
            priority,
            message_id,
            service,
            instance,
            routing_key: routing_key.into(),
            body,
            connection_id,
            session_id: None,
            dedup_key: None,
            enqueued_at: Instant::now(),
            retry_count: 0,
            sequence: 0,
        }
    }

    pub fn with_session(mut self, session_id: Option<SessionId>) -> Self {
        self.session_id = session_id;
        self
    }

    pub fn with_dedup_key(mut self, dedup_key: impl Into<String>) -> Self {
        self.dedup_key = Some(dedup_key.into());
        self
    }

    /// Time spent waiting since admission.
    pub fn age(&self) -> Duration {
        self.enqueued_at.elapsed()
    }
}

/// Dedup key for a client message. Sequence 0 means the client opted out.
pub fn dedup_key(message_id: u32, sequence: u32, owner: &str) -> Option<String> {
    (sequence != 0).then(|| format!("{}:{}:{}", message_id, sequence, owner))
}

/// Queue statistics
#[derive(Debug, Clone, Serialize)]
pub struct QueueStats {
    pub size: usize,
    pub capacity: usize,
    pub usage_ratio: f64,
    pub throttling: bool,
    pub depth_critical: usize,
    pub depth_high: usize,
    pub depth_normal: usize,
    pub depth_low: usize,
    pub enqueued: u64,
    pub dequeued: u64,
    pub duplicates: u64,
    pub rejected: u64,
    pub evicted: u64,
    pub retried: u64,
}

struct DedupWindow {
    seen: HashMap<String, Instant>,
    order: VecDeque<(String, Instant)>,
    max_entries: usize,
    ttl: Duration,
}

impl DedupWindow {
    fn new(max_entries: usize, ttl: Duration) -> Self {
        Self {
            seen: HashMap::new(),
            order: VecDeque::new(),
            max_entries,
            ttl,
        }
    }

    fn prune(&mut self, now: Instant) {
        while let Some((key, at)) = self.order.front() {
            let stale = now.duration_since(*at) >= self.ttl || self.order.len() > self.max_entries;
            if !stale {
                break;
            }
            // only forget the key if this is its latest sighting
            if self.seen.get(key) == Some(at) {
                self.seen.remove(key);
            }
            self.order.pop_front();
        }
    }

    fn contains(&mut self, key: &str, now: Instant) -> bool {
        self.prune(now);
        self.seen.contains_key(key)
    }

    fn forget(&mut self, key: &str) {
        self.seen.remove(key);
    }

    fn insert(&mut self, key: String, now: Instant) {
        self.seen.insert(key.clone(), now);
        self.order.push_back((key, now));
        self.prune(now);
    }

    fn len(&self) -> usize {
        self.seen.len()
    }
}

struct QueueInner {
    entries: BTreeMap<(Priority, u64), QueuedMessage>,
    depths: [usize; 4],
    dedup: DedupWindow,
    next_sequence: u64,
    closed: bool,
}

impl QueueInner {
    fn admit(&mut self, mut message: QueuedMessage) {
        self.next_sequence += 1;
        message.sequence = self.next_sequence;
        self.depths[message.priority.rank() as usize] += 1;
        self.entries.insert((message.priority, message.sequence), message);
    }

    fn pop_first(&mut self) -> Option<QueuedMessage> {
        let (_, message) = self.entries.pop_first()?;
        self.depths[message.priority.rank() as usize] -= 1;
        Some(message)
    }

    /// Least urgent, most recently admitted entry.
    fn pop_last(&mut self) -> Option<QueuedMessage> {
        let (_, message) = self.entries.pop_last()?;
        self.depths[message.priority.rank() as usize] -= 1;
        Some(message)
    }

    fn lowest_priority(&self) -> Option<Priority> {
        self.entries.last_key_value().map(|((p, _), _)| *p)
    }
}

/// Bounded, priority-ordered, deduplicating message queue.
pub struct PriorityQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    throttling: AtomicBool,
    config: QueueConfig,
    metrics: Arc<QueueMetrics>,
}

impl PriorityQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                entries: BTreeMap::new(),
                depths: [0; 4],
                dedup: DedupWindow::new(config.dedup_window_size, config.dedup_ttl()),
                next_sequence: 0,
                closed: false,
            }),
            notify: Notify::new(),
            throttling: AtomicBool::new(false),
            config,
            metrics: Arc::new(QueueMetrics::new()),
        }
    }

    pub fn metrics(&self) -> &Arc<QueueMetrics> {
        &self.metrics
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    pub fn max_retries(&self) -> u32 {
        self.config.max_retries
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn usage_ratio(&self) -> f64 {
        self.len() as f64 / self.config.capacity as f64
    }

    /// True between crossing the high watermark and falling back to the low one.
    pub fn is_throttling(&self) -> bool {
        self.throttling.load(Ordering::Relaxed)
    }

    /// True if a producer should drop a message of `priority` instead of
    /// enqueueing it. Past `drop_threshold` only CRITICAL gets in.
    pub fn should_shed(&self, priority: Priority) -> bool {
        priority != Priority::Critical && self.usage_ratio() >= self.config.drop_threshold
    }

    /// Admits `message`.
    ///
    /// Returns the message evicted to make room, if any.
    ///
    /// # Errors
    ///
    /// `Duplicate` if the dedup key was seen within the window, `Full` if the
    /// queue is at capacity and nothing less urgent is pending, `Closed` after
    /// [`close`](Self::close).
    pub fn enqueue(&self, message: QueuedMessage) -> Result<Option<QueuedMessage>> {
        let priority = message.priority;
        let evicted = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(QueueError::Closed.into());
            }

            let now = Instant::now();
            if let Some(key) = &message.dedup_key {
                if inner.dedup.contains(key, now) {
                    self.metrics.record_duplicate();
                    return Err(QueueError::duplicate(key.as_str()).into());
                }
            }

            let evicted = if inner.entries.len() >= self.config.capacity {
                match inner.lowest_priority() {
                    Some(lowest) if priority.outranks(lowest) => inner.pop_last(),
                    _ => {
                        self.metrics.record_rejected();
                        return Err(QueueError::full("dispatch", self.config.capacity).into());
                    }
                }
            } else {
                None
            };
            // an evicted message was never delivered, so a resend is not a duplicate
            if let Some(key) = evicted.as_ref().and_then(|v| v.dedup_key.as_deref()) {
                inner.dedup.forget(key);
            }

            if let Some(key) = &message.dedup_key {
                inner.dedup.insert(key.clone(), now);
            }
            inner.admit(message);
            self.publish_depth(&inner);
            evicted
        };

        self.metrics.record_enqueued(priority);
        if let Some(victim) = &evicted {
            self.metrics.record_evicted(victim.priority);
            debug!(
                evicted = %victim.priority,
                admitted = %priority,
                message_id = victim.message_id,
                "Evicted queued message"
            );
        }
        self.notify.notify_one();
        Ok(evicted)
    }

    /// Re-admits a message after a failed dispatch, bypassing dedup.
    ///
    /// # Errors
    ///
    /// `RetriesExhausted` once `retry_count` reaches `max_retries`, plus the
    /// capacity and closed errors of [`enqueue`](Self::enqueue).
    pub fn requeue(&self, mut message: QueuedMessage) -> Result<Option<QueuedMessage>> {
        if message.retry_count >= self.config.max_retries {
            return Err(QueueError::RetriesExhausted {
                retries: message.retry_count,
            }
            .into());
        }
        message.retry_count += 1;
        message.dedup_key = None;
        let retry_count = message.retry_count;
        let evicted = self.enqueue(message)?;
        self.metrics.record_retried();
        debug!(retry_count, "Message requeued");
        Ok(evicted)
    }

    /// Takes up to `max` messages, most urgent first.
    ///
    /// Waits for the first message, then keeps collecting until `max` are
    /// gathered or `max_wait` has passed since the first one arrived. Returns an
    /// empty batch only once the queue is closed and drained.
    pub async fn dequeue_batch(&self, max: usize, max_wait: Duration) -> Vec<QueuedMessage> {
        let max = max.max(1);
        let mut batch = Vec::with_capacity(max);
        let mut deadline: Option<Instant> = None;

        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let closed = {
                let mut inner = self.inner.lock();
                while batch.len() < max {
                    match inner.pop_first() {
                        Some(message) => batch.push(message),
                        None => break,
                    }
                }
                if !batch.is_empty() {
                    self.publish_depth(&inner);
                }
                inner.closed
            };

            if batch.len() >= max || closed {
                break;
            }
            if !batch.is_empty() && deadline.is_none() {
                deadline = Some(Instant::now() + max_wait);
            }

            match deadline {
                None => notified.await,
                Some(at) => {
                    if tokio::time::timeout_at(at, notified).await.is_err() {
                        break;
                    }
                }
            }
        }

        if batch.len() < max && !self.is_empty() {
            // hand leftover wakeups to another consumer
            self.notify.notify_one();
        }
        if !batch.is_empty() {
            self.metrics.record_dequeued(batch.len());
        }
        batch
    }

    /// Stops admissions and wakes every waiting consumer. Pending messages can
    /// still be drained.
    pub fn close(&self) {
        let pending = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            inner.entries.len()
        };
        self.notify.notify_waiters();
        info!(pending, "Queue closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Removes and returns everything still queued.
    pub fn drain(&self) -> Vec<QueuedMessage> {
        let mut inner = self.inner.lock();
        let mut drained = Vec::with_capacity(inner.entries.len());
        while let Some(message) = inner.pop_first() {
            drained.push(message);
        }
        self.publish_depth(&inner);
        drained
    }

    fn publish_depth(&self, inner: &QueueInner) {
        let usage = inner.entries.len() as f64 / self.config.capacity as f64;
        let was = self.throttling.load(Ordering::Relaxed);
        let now = if usage >= self.config.high_watermark {
            true
        } else if usage <= self.config.low_watermark {
            false
        } else {
            was
        };
        if now != was {
            self.throttling.store(now, Ordering::Relaxed);
            if now {
                warn!(usage, "Queue above high watermark, throttling");
            } else {
                info!(usage, "Queue back under low watermark");
            }
        }
        self.metrics.record_depth(&inner.depths, usage, now);
    }

    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock();
        let size = inner.entries.len();
        QueueStats {
            size,
            capacity: self.config.capacity,
            usage_ratio: size as f64 / self.config.capacity as f64,
            throttling: self.is_throttling(),
            depth_critical: inner.depths[0],
            depth_high: inner.depths[1],
            depth_normal: inner.depths[2],
            depth_low: inner.depths[3],
            enqueued: self.metrics.enqueued(),
            dequeued: self.metrics.dequeued(),
            duplicates: self.metrics.duplicates(),
            rejected: self.metrics.rejected(),
            evicted: self.metrics.evicted(),
            retried: self.metrics.retried(),
        }
    }

    /// Number of keys currently remembered for deduplication.
    pub fn dedup_window_len(&self) -> usize {
        self.inner.lock().dedup.len()
    }
}

/// True for queue errors the producer should report back but not treat as fatal.
pub fn is_backpressure(err: &GatewayError) -> bool {
    matches!(
        err,
        GatewayError::Queue(QueueError::Full { .. } | QueueError::Duplicate { .. })
    )
}
