//! Outbound channel pool
//!
//! Keeps between `min_channels` and `max_channels` multiplexed channels per
//! backend address. A maintenance loop probes every channel, demotes channels
//! that keep failing, reconnects them with jittered backoff and finally
//! removes channels that will not come back, refilling toward the minimum.

use crate::backoff::{jittered_backoff, BackoffConfig};
use crate::channel::{ChannelConnector, RpcChannel, RpcStream};
use crate::metrics::{RpcPoolCounters, RpcPoolMetrics};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use gamegate_core::config::RpcPoolConfig;
use gamegate_core::error::{Result, RpcError};
use gamegate_core::types::{RpcRequest, RpcResponse};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Anything that can carry a request to a backend address.
#[async_trait]
pub trait RpcCaller: Send + Sync + 'static {
    async fn call(&self, address: &str, request: RpcRequest) -> Result<RpcResponse>;
}

/// Channel lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChannelState {
    Idle,
    Connecting,
    Ready,
    /// Probes or connects are failing; skipped by `acquire`
    Failing,
    Shutdown,
}

/// Health bookkeeping for one pooled channel.
#[derive(Debug, Clone)]
pub struct ChannelInfo {
    pub id: u64,
    pub state: ChannelState,
    pub last_probe: Option<Instant>,
    pub consecutive_failures: u32,
    pub reconnect_attempts: u32,
    next_reconnect_at: Option<Instant>,
}

struct Slot<Ch> {
    channel: RwLock<Option<Arc<Ch>>>,
    info: Mutex<ChannelInfo>,
}

impl<Ch: RpcChannel> Slot<Ch> {
    fn ready(&self) -> Option<Arc<Ch>> {
        if self.info.lock().state != ChannelState::Ready {
            return None;
        }
        self.channel
            .read()
            .as_ref()
            .filter(|c| !c.is_closed())
            .cloned()
    }

    fn state(&self) -> ChannelState {
        self.info.lock().state
    }

    fn shutdown(&self) {
        self.info.lock().state = ChannelState::Shutdown;
        if let Some(channel) = self.channel.write().take() {
            channel.close();
        }
    }
}

struct AddressPool<Ch> {
    address: String,
    slots: RwLock<Vec<Arc<Slot<Ch>>>>,
    cursor: AtomicUsize,
}

/// Pool statistics
#[derive(Debug, Clone, Serialize)]
pub struct RpcPoolStats {
    pub addresses: usize,
    pub total_channels: usize,
    pub ready_channels: usize,
    pub failing_channels: usize,
    #[serde(flatten)]
    pub counters: RpcPoolCounters,
}

/// Per-address pool of backend channels.
pub struct RpcPool<C: ChannelConnector> {
    connector: Arc<C>,
    config: RpcPoolConfig,
    backoff: BackoffConfig,
    addresses: DashMap<String, Arc<AddressPool<C::Channel>>>,
    next_slot_id: AtomicU64,
    metrics: Arc<RpcPoolMetrics>,
}

impl<C: ChannelConnector> RpcPool<C> {
    pub fn new(connector: C, config: RpcPoolConfig) -> Self {
        let backoff = BackoffConfig::from(&config);
        Self {
            connector: Arc::new(connector),
            config,
            backoff,
            addresses: DashMap::new(),
            next_slot_id: AtomicU64::new(1),
            metrics: Arc::new(RpcPoolMetrics::new()),
        }
    }

    pub fn config(&self) -> &RpcPoolConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<RpcPoolMetrics> {
        &self.metrics
    }

    fn address_pool(&self, address: &str) -> Arc<AddressPool<C::Channel>> {
        if let Some(pool) = self.addresses.get(address) {
            return Arc::clone(pool.value());
        }
        let entry = self
            .addresses
            .entry(address.to_string())
            .or_insert_with(|| {
                Arc::new(AddressPool {
                    address: address.to_string(),
                    slots: RwLock::new(Vec::new()),
                    cursor: AtomicUsize::new(0),
                })
            });
        Arc::clone(entry.value())
    }

    /// Opens one channel into a new slot. A failed connect still leaves a
    /// Failing slot behind for the maintenance loop to retry.
    async fn open_slot(&self, pool: &AddressPool<C::Channel>) -> Option<Arc<C::Channel>> {
        let id = self.next_slot_id.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::new(Slot {
            channel: RwLock::new(None),
            info: Mutex::new(ChannelInfo {
                id,
                state: ChannelState::Connecting,
                last_probe: None,
                consecutive_failures: 0,
                reconnect_attempts: 0,
                next_reconnect_at: None,
            }),
        });
        pool.slots.write().push(Arc::clone(&slot));

        match self.connector.connect(&pool.address).await {
            Ok(channel) => {
                let channel = Arc::new(channel);
                *slot.channel.write() = Some(Arc::clone(&channel));
                slot.info.lock().state = ChannelState::Ready;
                self.metrics.record_channel_created();
                Some(channel)
            }
            Err(e) => {
                warn!(address = %pool.address, error = %e, "Backend connect failed");
                let mut info = slot.info.lock();
                info.state = ChannelState::Failing;
                info.reconnect_attempts = 1;
                info.next_reconnect_at = Some(Instant::now() + jittered_backoff(0, &self.backoff));
                None
            }
        }
    }

    /// Starts tracking `address` and opens `min_channels` channels to it.
    /// Returns the number that came up Ready.
    pub async fn add_address(&self, address: &str) -> usize {
        let pool = self.address_pool(address);
        let missing = self
            .config
            .min_channels
            .saturating_sub(pool.slots.read().len());
        let opened = join_all((0..missing).map(|_| self.open_slot(&pool))).await;
        let ready = opened.iter().filter(|c| c.is_some()).count();
        info!(address = %address, ready, requested = missing, "Backend address added");
        self.publish_ready(&pool);
        ready
    }

    /// Closes and forgets every channel to `address`.
    pub fn remove_address(&self, address: &str) -> bool {
        match self.addresses.remove(address) {
            Some((_, pool)) => {
                for slot in pool.slots.write().drain(..) {
                    slot.shutdown();
                }
                self.metrics.record_ready_channels(address, 0);
                info!(address = %address, "Backend address removed");
                true
            }
            None => false,
        }
    }

    pub fn addresses(&self) -> Vec<String> {
        let mut out: Vec<_> = self.addresses.iter().map(|e| e.key().clone()).collect();
        out.sort();
        out
    }

    /// Returns a Ready channel to `address`, round-robin, skipping Failing
    /// channels. Opens a channel on demand while the address is below
    /// `max_channels`.
    ///
    /// # Errors
    ///
    /// `ChannelUnavailable` if `address` is not tracked (see
    /// [`add_address`](Self::add_address)), or no channel is Ready and none
    /// could be opened.
    pub async fn acquire(&self, address: &str) -> Result<Arc<C::Channel>> {
        let Some(pool) = self.addresses.get(address).map(|p| Arc::clone(p.value())) else {
            self.metrics.record_acquire_miss();
            debug!(address = %address, "Acquire for untracked address");
            return Err(RpcError::unavailable(address).into());
        };
        {
            let slots = pool.slots.read();
            let n = slots.len();
            if n > 0 {
                let start = pool.cursor.fetch_add(1, Ordering::Relaxed);
                for i in 0..n {
                    if let Some(channel) = slots[(start + i) % n].ready() {
                        return Ok(channel);
                    }
                }
            }
        }

        self.metrics.record_acquire_miss();
        if pool.slots.read().len() < self.config.max_channels {
            if let Some(channel) = self.open_slot(&pool).await {
                self.publish_ready(&pool);
                return Ok(channel);
            }
        }
        Err(RpcError::unavailable(address).into())
    }

    /// Unary call on a pooled channel. A non-OK response code is returned as
    /// `RpcError::Backend`.
    pub async fn call(&self, address: &str, request: RpcRequest) -> Result<RpcResponse> {
        let started = std::time::Instant::now();
        let result = match self.acquire(address).await {
            Ok(channel) => channel.call(request).await.and_then(|response| {
                if response.is_ok() {
                    Ok(response)
                } else {
                    Err(RpcError::Backend {
                        target: address.to_string(),
                        code: response.code,
                        message: response.message,
                    }
                    .into())
                }
            }),
            Err(e) => Err(e),
        };
        self.metrics.record_call(started.elapsed(), result.is_ok());
        result
    }

    /// Opens a bidirectional stream on a pooled channel.
    pub async fn call_stream(
        &self,
        address: &str,
        first: RpcRequest,
        requests: flume::Receiver<RpcRequest>,
    ) -> Result<RpcStream> {
        let channel = self.acquire(address).await?;
        channel.call_stream(first, requests).await
    }

    /// One maintenance pass over every address: probe, reconnect, remove and refill.
    pub async fn maintain(&self) {
        let pools: Vec<_> = self.addresses.iter().map(|e| Arc::clone(e.value())).collect();
        for pool in pools {
            self.maintain_address(&pool).await;
        }
    }

    async fn maintain_address(&self, pool: &AddressPool<C::Channel>) {
        let slots: Vec<_> = pool.slots.read().clone();
        join_all(slots.iter().map(|slot| self.check_slot(&pool.address, slot))).await;

        // drop slots that gave up, then refill toward the minimum
        let removed = {
            let mut slots = pool.slots.write();
            let before = slots.len();
            slots.retain(|s| s.state() != ChannelState::Shutdown);
            before - slots.len()
        };
        for _ in 0..removed {
            self.metrics.record_channel_removed();
        }
        if removed > 0 {
            warn!(address = %pool.address, removed, "Removed unrecoverable backend channels");
        }

        let missing = self
            .config
            .min_channels
            .saturating_sub(pool.slots.read().len());
        if missing > 0 {
            join_all((0..missing).map(|_| self.open_slot(pool))).await;
        }
        self.publish_ready(pool);
    }

    async fn check_slot(&self, address: &str, slot: &Slot<C::Channel>) {
        let (state, due) = {
            let info = slot.info.lock();
            let due = info
                .next_reconnect_at
                .map(|t| Instant::now() >= t)
                .unwrap_or(true);
            (info.state, due)
        };

        let channel = slot.channel.read().clone();
        match (state, channel) {
            (ChannelState::Ready, Some(channel)) if !channel.is_closed() => {
                let probe = tokio::time::timeout(self.config.connect_timeout(), channel.probe()).await;
                let ok = matches!(probe, Ok(Ok(())));
                self.metrics.record_health_check(ok);

                let mut info = slot.info.lock();
                info.last_probe = Some(Instant::now());
                if ok {
                    info.consecutive_failures = 0;
                    return;
                }
                info.consecutive_failures += 1;
                debug!(
                    address = %address,
                    channel = info.id,
                    failures = info.consecutive_failures,
                    "Channel probe failed"
                );
                if info.consecutive_failures >= self.config.max_probe_failures {
                    warn!(address = %address, channel = info.id, "Channel failing, scheduling reconnect");
                    info.state = ChannelState::Failing;
                    info.next_reconnect_at = None;
                }
            }
            (ChannelState::Ready, _) => {
                // transport died between probes
                let mut info = slot.info.lock();
                info.state = ChannelState::Failing;
                info.next_reconnect_at = None;
            }
            (ChannelState::Failing, _) if due => self.reconnect(address, slot).await,
            _ => {}
        }
    }

    async fn reconnect(&self, address: &str, slot: &Slot<C::Channel>) {
        {
            let mut info = slot.info.lock();
            if info.reconnect_attempts >= self.config.max_reconnect_attempts {
                info.state = ChannelState::Shutdown;
                drop(info);
                slot.shutdown();
                return;
            }
            info.state = ChannelState::Connecting;
            info.reconnect_attempts += 1;
        }
        if let Some(old) = slot.channel.write().take() {
            old.close();
        }
        self.metrics.record_reconnect();

        match self.connector.connect(address).await {
            Ok(channel) => {
                *slot.channel.write() = Some(Arc::new(channel));
                let mut info = slot.info.lock();
                info!(address = %address, channel = info.id, attempts = info.reconnect_attempts, "Channel reconnected");
                info.state = ChannelState::Ready;
                info.consecutive_failures = 0;
                info.reconnect_attempts = 0;
                info.next_reconnect_at = None;
            }
            Err(e) => {
                let mut info = slot.info.lock();
                let delay = jittered_backoff(info.reconnect_attempts.saturating_sub(1), &self.backoff);
                debug!(
                    address = %address,
                    channel = info.id,
                    attempt = info.reconnect_attempts,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %e,
                    "Reconnect failed"
                );
                info.state = ChannelState::Failing;
                info.next_reconnect_at = Some(Instant::now() + delay);
            }
        }
    }

    fn publish_ready(&self, pool: &AddressPool<C::Channel>) {
        let ready = pool
            .slots
            .read()
            .iter()
            .filter(|s| s.state() == ChannelState::Ready)
            .count();
        self.metrics.record_ready_channels(&pool.address, ready);
    }

    /// Runs [`maintain`](Self::maintain) every `probe_interval` until cancelled.
    pub fn spawn_maintenance(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(pool.config.probe_interval());
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => pool.maintain().await,
                }
            }
            debug!("RPC pool maintenance stopped");
        })
    }

    /// Health snapshot of every channel to `address`.
    pub fn channel_states(&self, address: &str) -> Vec<ChannelInfo> {
        self.addresses
            .get(address)
            .map(|pool| pool.slots.read().iter().map(|s| s.info.lock().clone()).collect())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> RpcPoolStats {
        let mut total = 0;
        let mut ready = 0;
        let mut failing = 0;
        for pool in self.addresses.iter() {
            for slot in pool.slots.read().iter() {
                total += 1;
                match slot.state() {
                    ChannelState::Ready => ready += 1,
                    ChannelState::Failing => failing += 1,
                    _ => {}
                }
            }
        }
        RpcPoolStats {
            addresses: self.addresses.len(),
            total_channels: total,
            ready_channels: ready,
            failing_channels: failing,
            counters: self.metrics.snapshot(),
        }
    }

    /// Closes every channel.
    pub fn shutdown(&self) {
        let addresses = self.addresses();
        for address in addresses {
            self.remove_address(&address);
        }
        info!("RPC pool shut down");
    }
}

#[async_trait]
impl<C: ChannelConnector> RpcCaller for RpcPool<C> {
    async fn call(&self, address: &str, request: RpcRequest) -> Result<RpcResponse> {
        RpcPool::call(self, address, request).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use gamegate_core::error::GatewayError;
    use std::sync::atomic::AtomicBool;

    /// In-process channel whose health is flipped by the test.
    #[derive(Debug)]
    struct FakeChannel {
        address: String,
        healthy: Arc<AtomicBool>,
        closed: AtomicBool,
    }

    #[async_trait]
    impl RpcChannel for FakeChannel {
        fn address(&self) -> &str {
            &self.address
        }

        async fn call(&self, request: RpcRequest) -> Result<RpcResponse> {
            if request.method_name == "Fail" {
                return Ok(RpcResponse::error(13, "boom"));
            }
            Ok(RpcResponse::ok(request.payload))
        }

        async fn call_stream(
            &self,
            _first: RpcRequest,
            _requests: flume::Receiver<RpcRequest>,
        ) -> Result<RpcStream> {
            let (_tx, rx) = flume::bounded(1);
            Ok(RpcStream::new(rx))
        }

        async fn probe(&self) -> Result<()> {
            if self.healthy.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(RpcError::unavailable(self.address.clone()).into())
            }
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    struct FakeConnector {
        healthy: Arc<AtomicBool>,
        accepting: Arc<AtomicBool>,
        connects: AtomicUsize,
    }

    impl FakeConnector {
        fn new() -> Self {
            Self {
                healthy: Arc::new(AtomicBool::new(true)),
                accepting: Arc::new(AtomicBool::new(true)),
                connects: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl ChannelConnector for FakeConnector {
        type Channel = FakeChannel;

        async fn connect(&self, address: &str) -> Result<FakeChannel> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if !self.accepting.load(Ordering::SeqCst) {
                return Err(RpcError::connect_failed(address, "refused").into());
            }
            Ok(FakeChannel {
                address: address.to_string(),
                healthy: Arc::clone(&self.healthy),
                closed: AtomicBool::new(false),
            })
        }
    }

    fn config() -> RpcPoolConfig {
        RpcPoolConfig {
            min_channels: 2,
            max_channels: 3,
            max_probe_failures: 2,
            max_reconnect_attempts: 2,
            reconnect_initial_backoff_ms: 10,
            reconnect_max_backoff_ms: 10,
            jitter: 0.0,
            ..RpcPoolConfig::default()
        }
    }

    #[tokio::test]
    async fn test_add_address_opens_min_channels() {
        let pool = RpcPool::new(FakeConnector::new(), config());
        assert_eq!(pool.add_address("logic-1:7000").await, 2);

        let stats = pool.stats();
        assert_eq!(stats.total_channels, 2);
        assert_eq!(stats.ready_channels, 2);
        assert_eq!(stats.counters.channels_created, 2);
    }

    #[tokio::test]
    async fn test_acquire_round_robins() {
        let pool = RpcPool::new(FakeConnector::new(), config());
        pool.add_address("logic-1:7000").await;

        let a = pool.acquire("logic-1:7000").await.unwrap();
        let b = pool.acquire("logic-1:7000").await.unwrap();
        let c = pool.acquire("logic-1:7000").await.unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&a, &c));
    }

    #[tokio::test]
    async fn test_backend_error_code_becomes_rpc_error() {
        let pool = RpcPool::new(FakeConnector::new(), config());
        pool.add_address("logic-1:7000").await;

        let ok = pool
            .call("logic-1:7000", RpcRequest::new("logic", "Echo", Bytes::from_static(b"x")))
            .await
            .unwrap();
        assert_eq!(ok.payload, Bytes::from_static(b"x"));

        let err = pool
            .call("logic-1:7000", RpcRequest::new("logic", "Fail", Bytes::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Rpc(RpcError::Backend { code: 13, .. })));
        assert_eq!(pool.stats().counters.call_errors, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_probes_demote_then_reconnect() {
        let connector = FakeConnector::new();
        let healthy = Arc::clone(&connector.healthy);
        let pool = RpcPool::new(connector, config());
        pool.add_address("logic-1:7000").await;

        healthy.store(false, Ordering::SeqCst);
        pool.maintain().await;
        assert_eq!(pool.stats().failing_channels, 0);
        pool.maintain().await;
        assert_eq!(pool.stats().failing_channels, 2);

        // failing channels are skipped; acquire opens a third on demand
        let extra = pool.acquire("logic-1:7000").await;
        assert!(extra.is_ok());
        assert_eq!(pool.stats().total_channels, 3);

        healthy.store(true, Ordering::SeqCst);
        pool.maintain().await;
        let stats = pool.stats();
        assert_eq!(stats.ready_channels, 3);
        assert_eq!(stats.counters.reconnections, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrecoverable_channels_are_removed_and_refilled() {
        let connector = FakeConnector::new();
        let healthy = Arc::clone(&connector.healthy);
        let accepting = Arc::clone(&connector.accepting);
        let pool = RpcPool::new(connector, config());
        pool.add_address("logic-1:7000").await;

        healthy.store(false, Ordering::SeqCst);
        accepting.store(false, Ordering::SeqCst);
        pool.maintain().await;
        pool.maintain().await; // demoted to Failing

        for _ in 0..4 {
            tokio::time::advance(std::time::Duration::from_millis(20)).await;
            pool.maintain().await;
        }
        assert!(pool.stats().counters.channels_removed >= 2);

        // backend recovers: refilled slots reconnect
        healthy.store(true, Ordering::SeqCst);
        accepting.store(true, Ordering::SeqCst);
        for _ in 0..3 {
            tokio::time::advance(std::time::Duration::from_millis(20)).await;
            pool.maintain().await;
        }
        let stats = pool.stats();
        assert_eq!(stats.ready_channels, 2);
        assert_eq!(stats.total_channels, 2);
    }

    #[tokio::test]
    async fn test_unreachable_address_is_unavailable() {
        let connector = FakeConnector::new();
        connector.accepting.store(false, Ordering::SeqCst);
        let pool = RpcPool::new(connector, config());
        assert_eq!(pool.add_address("down:7000").await, 0);

        let err = pool.acquire("down:7000").await.unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Rpc(RpcError::ChannelUnavailable { .. })
        ));
        assert_eq!(pool.stats().counters.acquire_misses, 1);
    }

    #[tokio::test]
    async fn test_removed_address_stays_removed() {
        let pool = RpcPool::new(FakeConnector::new(), config());
        pool.add_address("logic-1:7000").await;
        assert!(pool.remove_address("logic-1:7000"));

        // a late dispatch to the deregistered backend must not bring it back
        let err = pool.acquire("logic-1:7000").await.unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Rpc(RpcError::ChannelUnavailable { .. })
        ));
        pool.maintain().await;
        assert!(pool.addresses().is_empty());
        assert_eq!(pool.stats().total_channels, 0);
    }

    #[tokio::test]
    async fn test_remove_address_closes_channels() {
        let pool = RpcPool::new(FakeConnector::new(), config());
        pool.add_address("logic-1:7000").await;
        let channel = pool.acquire("logic-1:7000").await.unwrap();

        assert!(pool.remove_address("logic-1:7000"));
        assert!(channel.is_closed());
        assert!(pool.addresses().is_empty());
    }
}
