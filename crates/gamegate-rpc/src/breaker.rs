//! Circuit Breaker
//!
//! Per-target failure tracker wrapping backend calls.
//!
//! ```text
//!            failures >= threshold
//!   Closed ─────────────────────────▶ Open
//!     ▲                                 │ recovery_timeout elapsed
//!     │ successes >= success_threshold  ▼
//!     └────────────────────────────── HalfOpen ──(any failure)──▶ Open
//! ```
//!
//! Closed-state outcomes are kept in a sliding window of the last
//! `window_size` calls. HalfOpen admits exactly one trial call at a time.

use crate::metrics::BreakerMetrics;
use dashmap::DashMap;
use gamegate_core::config::BreakerConfig;
use gamegate_core::error::{GatewayError, Result, RpcError};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CircuitState {
    /// Circuit is closed, normal operation
    Closed,
    /// Circuit is open, failing fast
    Open,
    /// Circuit is half-open, testing recovery
    HalfOpen,
}

impl CircuitState {
    /// Gauge encoding: 0 closed, 1 open, 2 half-open.
    pub fn as_gauge(self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::Open => 1.0,
            CircuitState::HalfOpen => 2.0,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    /// Most recent Closed-state outcomes, true = failure
    window: VecDeque<bool>,
    window_failures: usize,
    opened_at: Option<Instant>,
    half_open_successes: u32,
    trial_in_flight: bool,
}

/// Admission granted by [`CircuitBreaker::try_acquire`].
///
/// Dropping a permit without reporting an outcome counts as a failure, so a
/// cancelled call can never leave a HalfOpen trial slot occupied.
#[must_use = "report the call outcome with success() or failure()"]
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    done: bool,
}

impl Permit<'_> {
    /// True if this permit is the single HalfOpen trial call.
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.done = true;
        self.breaker.record_success(self.trial);
    }

    pub fn failure(mut self) {
        self.done = true;
        self.breaker.record_failure(self.trial);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.breaker.record_failure(self.trial);
        }
    }
}

/// Circuit breaker for one backend target.
#[derive(Debug)]
pub struct CircuitBreaker {
    target: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
    metrics: Arc<BreakerMetrics>,
}

impl CircuitBreaker {
    pub fn new(target: impl Into<String>, config: BreakerConfig) -> Self {
        Self::with_metrics(target, config, Arc::new(BreakerMetrics::new()))
    }

    pub fn with_metrics(
        target: impl Into<String>,
        config: BreakerConfig,
        metrics: Arc<BreakerMetrics>,
    ) -> Self {
        let target = target.into();
        metrics.record_state(&target, CircuitState::Closed);
        Self {
            target,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                window: VecDeque::with_capacity(config.window_size),
                window_failures: 0,
                opened_at: None,
                half_open_successes: 0,
                trial_in_flight: false,
            }),
            config,
            metrics,
        }
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Current state. An Open breaker whose recovery timeout has elapsed still
    /// reports Open until the next call attempts the HalfOpen trial.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Failures currently counted in the sliding window.
    pub fn window_failures(&self) -> usize {
        self.inner.lock().window_failures
    }

    /// Asks permission to make one call.
    ///
    /// # Errors
    ///
    /// Returns `CircuitOpen` without touching the network if the breaker is
    /// open and the recovery timeout has not elapsed, or a HalfOpen trial is
    /// already in flight.
    pub fn try_acquire(&self) -> Result<Permit<'_>> {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => Ok(Permit {
                breaker: self,
                trial: false,
                done: false,
            }),
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| t.elapsed() >= self.config.recovery_timeout())
                    .unwrap_or(true);
                if !elapsed {
                    drop(inner);
                    return Err(self.reject());
                }
                info!(backend = %self.target, "Circuit breaker half-open, admitting trial call");
                inner.state = CircuitState::HalfOpen;
                inner.half_open_successes = 0;
                inner.trial_in_flight = true;
                drop(inner);
                self.metrics.record_state(&self.target, CircuitState::HalfOpen);
                Ok(Permit {
                    breaker: self,
                    trial: true,
                    done: false,
                })
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    drop(inner);
                    return Err(self.reject());
                }
                inner.trial_in_flight = true;
                Ok(Permit {
                    breaker: self,
                    trial: true,
                    done: false,
                })
            }
        }
    }

    fn reject(&self) -> GatewayError {
        self.metrics.record_short_circuit(&self.target);
        debug!(backend = %self.target, "Circuit open, short-circuiting call");
        RpcError::CircuitOpen {
            target: self.target.clone(),
        }
        .into()
    }

    /// Runs `f` through the breaker under the configured call timeout.
    ///
    /// A timeout cancels the call and counts as a failure.
    pub async fn call<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let permit = self.try_acquire()?;
        let timeout = self.config.call_timeout();

        match tokio::time::timeout(timeout, f()).await {
            Ok(Ok(value)) => {
                permit.success();
                Ok(value)
            }
            Ok(Err(e)) => {
                permit.failure();
                Err(e)
            }
            Err(_) => {
                permit.failure();
                Err(RpcError::timeout(self.target.clone(), timeout).into())
            }
        }
    }

    /// `trial` is set for the HalfOpen trial permit; other outcomes arriving
    /// while HalfOpen or Open belong to calls admitted before the breaker
    /// opened and are ignored.
    fn record_success(&self, trial: bool) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                self.push_outcome(&mut inner, false);
            }
            CircuitState::HalfOpen if !trial => {}
            CircuitState::HalfOpen => {
                inner.trial_in_flight = false;
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.success_threshold {
                    info!(backend = %self.target, "Circuit breaker closing after successful recovery");
                    inner.state = CircuitState::Closed;
                    inner.window.clear();
                    inner.window_failures = 0;
                    inner.opened_at = None;
                    inner.half_open_successes = 0;
                    drop(inner);
                    self.metrics.record_state(&self.target, CircuitState::Closed);
                }
            }
            CircuitState::Open => {}
        }
    }

    fn record_failure(&self, trial: bool) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                self.push_outcome(&mut inner, true);
                if inner.window_failures >= self.config.failure_threshold as usize {
                    warn!(
                        backend = %self.target,
                        failures = inner.window_failures,
                        window = inner.window.len(),
                        "Circuit breaker opening due to failures"
                    );
                    self.open(&mut inner);
                    drop(inner);
                    self.metrics.record_state(&self.target, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen if !trial => {}
            CircuitState::HalfOpen => {
                warn!(backend = %self.target, "Circuit breaker re-opening, trial call failed");
                self.open(&mut inner);
                drop(inner);
                self.metrics.record_state(&self.target, CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    fn push_outcome(&self, inner: &mut BreakerInner, failed: bool) {
        inner.window.push_back(failed);
        if failed {
            inner.window_failures += 1;
        }
        while inner.window.len() > self.config.window_size.max(1) {
            if inner.window.pop_front() == Some(true) {
                inner.window_failures -= 1;
            }
        }
    }

    fn open(&self, inner: &mut BreakerInner) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.half_open_successes = 0;
        inner.trial_in_flight = false;
        inner.window.clear();
        inner.window_failures = 0;
        self.metrics.record_open(&self.target);
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            target: self.target.clone(),
            state: inner.state,
            window_failures: inner.window_failures,
            window_len: inner.window.len(),
            half_open_successes: inner.half_open_successes,
        }
    }
}

/// Point-in-time view of one breaker.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub target: String,
    pub state: CircuitState,
    pub window_failures: usize,
    pub window_len: usize,
    pub half_open_successes: u32,
}

/// Lazily created breakers keyed by target.
pub struct BreakerRegistry {
    breakers: DashMap<String, Arc<CircuitBreaker>>,
    config: BreakerConfig,
    metrics: Arc<BreakerMetrics>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            breakers: DashMap::new(),
            config,
            metrics: Arc::new(BreakerMetrics::new()),
        }
    }

    /// Returns the breaker for `target`, creating a closed one on first use.
    pub fn get(&self, target: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(target) {
            return Arc::clone(existing.value());
        }
        let entry = self.breakers.entry(target.to_string()).or_insert_with(|| {
            Arc::new(CircuitBreaker::with_metrics(
                target,
                self.config.clone(),
                Arc::clone(&self.metrics),
            ))
        });
        Arc::clone(entry.value())
    }

    pub fn remove(&self, target: &str) -> bool {
        self.breakers.remove(target).is_some()
    }

    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        let mut out: Vec<_> = self.breakers.iter().map(|b| b.snapshot()).collect();
        out.sort_by(|a, b| a.target.cmp(&b.target));
        out
    }

    pub fn open_count(&self) -> usize {
        self.breakers
            .iter()
            .filter(|b| b.state() != CircuitState::Closed)
            .count()
    }

    pub fn metrics(&self) -> &Arc<BreakerMetrics> {
        &self.metrics
    }
}
