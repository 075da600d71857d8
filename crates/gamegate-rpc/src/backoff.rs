//! Exponential backoff with jitter

use gamegate_core::config::{DispatcherConfig, RpcPoolConfig};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Backoff schedule.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first retry
    pub initial_backoff: Duration,
    /// Upper bound on any single delay
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    /// Fraction of each delay that is randomised (0.0 = none, 1.0 = full jitter)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl From<&RpcPoolConfig> for BackoffConfig {
    fn from(config: &RpcPoolConfig) -> Self {
        Self {
            initial_backoff: Duration::from_millis(config.reconnect_initial_backoff_ms),
            max_backoff: Duration::from_millis(config.reconnect_max_backoff_ms),
            backoff_multiplier: 2.0,
            jitter: config.jitter,
        }
    }
}

impl From<&DispatcherConfig> for BackoffConfig {
    fn from(config: &DispatcherConfig) -> Self {
        Self {
            initial_backoff: config.retry_delay(),
            max_backoff: config.max_retry_delay(),
            backoff_multiplier: 2.0,
            jitter: 0.1,
        }
    }
}

/// Deterministic exponential delay for `attempt` (0-based), capped at `max_backoff`.
pub fn calculate_backoff(attempt: u32, config: &BackoffConfig) -> Duration {
    let backoff_secs =
        config.initial_backoff.as_secs_f64() * config.backoff_multiplier.powi(attempt as i32);
    let capped_secs = backoff_secs.min(config.max_backoff.as_secs_f64());
    Duration::from_secs_f64(capped_secs.max(0.0))
}

/// [`calculate_backoff`] with up to `jitter * delay` removed at random, so
/// reconnecting channels do not stampede a recovering backend in lockstep.
pub fn jittered_backoff(attempt: u32, config: &BackoffConfig) -> Duration {
    let base = calculate_backoff(attempt, config);
    let jitter = config.jitter.clamp(0.0, 1.0);
    if jitter == 0.0 || base.is_zero() {
        return base;
    }
    let factor = 1.0 - rand::thread_rng().gen_range(0.0..=jitter);
    base.mul_f64(factor)
}

/// Runs `op` up to `max_attempts` times, sleeping a jittered backoff between
/// attempts while `should_retry` accepts the error.
pub async fn retry_with_backoff<T, E, F, Fut, R>(
    mut op: F,
    max_attempts: u32,
    config: &BackoffConfig,
    should_retry: R,
) -> (std::result::Result<T, E>, u32)
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    R: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let max_attempts = max_attempts.max(1);
    let mut attempt = 0u32;

    loop {
        match op(attempt).await {
            Ok(value) => return (Ok(value), attempt),
            Err(e) => {
                attempt += 1;
                if attempt >= max_attempts || !should_retry(&e) {
                    if attempt >= max_attempts {
                        warn!(attempts = attempt, error = %e, "Giving up after retries");
                    }
                    return (Err(e), attempt - 1);
                }
                let delay = jittered_backoff(attempt - 1, config);
                debug!(attempt, delay_ms = delay.as_millis() as u64, error = %e, "Retrying");
                tokio::time::sleep(delay).await;
            }
        }
    }
}
