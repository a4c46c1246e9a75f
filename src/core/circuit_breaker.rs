//! Per-dependency circuit breaker.
//!
//! States: closed -> open after `failure_threshold` consecutive failures;
//! open -> half-open once `recovery_timeout` has elapsed; half-open closes
//! on any success and re-opens on any failure. Concurrency in half-open is
//! capped by a semaphore so a burst of probes cannot all hit a still-sick
//! dependency before the first probe reports back.

use crate::error::AppError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub half_open_max_concurrent: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            half_open_max_concurrent: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BreakerStats {
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub rejected_calls: u64,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
}

struct BreakerInner {
    state: BreakerState,
    opened_at: Option<Instant>,
    stats: BreakerStats,
    half_open_sem: Arc<Semaphore>,
}

pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                opened_at: None,
                stats: BreakerStats::default(),
                half_open_sem: Arc::new(Semaphore::new(config.half_open_max_concurrent)),
            }),
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    pub fn stats(&self) -> BreakerStats {
        self.inner.lock().stats
    }

    /// Execute `f` through the breaker. Rejections surface as
    /// `AppError::CircuitOpen` without invoking `f`.
    pub async fn call<F, Fut, T>(&self, f: F) -> Result<T, AppError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AppError>>,
    {
        // Resolve state and, in half-open, reserve a probe slot before
        // releasing the mutex. Holding a permit across the await is what
        // caps concurrent probes.
        let permit = {
            let mut inner = self.inner.lock();

            if inner.state == BreakerState::Open {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.config.recovery_timeout {
                    info!(breaker = %self.name, "transitioning open -> half_open");
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_sem =
                        Arc::new(Semaphore::new(self.config.half_open_max_concurrent));
                } else {
                    inner.stats.total_calls += 1;
                    inner.stats.rejected_calls += 1;
                    return Err(AppError::CircuitOpen(self.name.clone()));
                }
            }

            if inner.state == BreakerState::HalfOpen {
                let sem = inner.half_open_sem.clone();
                match sem.try_acquire_owned() {
                    Ok(permit) => Some(permit),
                    Err(_) => {
                        inner.stats.total_calls += 1;
                        inner.stats.rejected_calls += 1;
                        return Err(AppError::CircuitOpen(self.name.clone()));
                    }
                }
            } else {
                None
            }
        };

        let result = f().await;
        let _probe = permit;

        let mut inner = self.inner.lock();
        inner.stats.total_calls += 1;
        match &result {
            Ok(_) => {
                inner.stats.successful_calls += 1;
                inner.stats.consecutive_successes += 1;
                inner.stats.consecutive_failures = 0;
                if inner.state == BreakerState::HalfOpen {
                    info!(breaker = %self.name, "recovered, half_open -> closed");
                    inner.state = BreakerState::Closed;
                    inner.opened_at = None;
                }
            }
            Err(e) => {
                inner.stats.failed_calls += 1;
                inner.stats.consecutive_failures += 1;
                inner.stats.consecutive_successes = 0;
                warn!(
                    breaker = %self.name,
                    failures = inner.stats.consecutive_failures,
                    threshold = self.config.failure_threshold,
                    error = %e,
                    "recorded failure"
                );
                match inner.state {
                    BreakerState::Closed
                        if inner.stats.consecutive_failures >= self.config.failure_threshold =>
                    {
                        error!(breaker = %self.name, "opening after consecutive failures");
                        inner.state = BreakerState::Open;
                        inner.opened_at = Some(Instant::now());
                    }
                    BreakerState::HalfOpen => {
                        warn!(breaker = %self.name, "probe failed, half_open -> open");
                        inner.state = BreakerState::Open;
                        inner.opened_at = Some(Instant::now());
                    }
                    _ => {}
                }
            }
        }

        result
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = BreakerState::Closed;
        inner.opened_at = None;
        inner.stats = BreakerStats::default();
        inner.half_open_sem = Arc::new(Semaphore::new(self.config.half_open_max_concurrent));
    }
}

/// Named breaker registry. Config is applied on first creation only.
#[derive(Default)]
pub struct CircuitBreakerRegistry {
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, name: &str, config: BreakerConfig) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock();
        breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, config)))
            .clone()
    }

    pub fn statuses(&self) -> Vec<(String, &'static str, BreakerStats)> {
        self.breakers
            .lock()
            .values()
            .map(|b| (b.name.clone(), b.state().as_str(), b.stats()))
            .collect()
    }
}
