//! Circuit breaker guarding store calls.
//!
//! Outcomes are kept in a count-based rolling window. The breaker opens once the
//! failures inside the window reach the threshold, rejects calls for the
//! cool-down, then admits a limited number of trial calls. A successful trial
//! closes it again; a failed trial reopens it with a fresh cool-down.

use crate::error::BreakerError;
use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Number of most recent outcomes considered while closed.
    pub window: usize,
    /// Failures inside the window that open the circuit.
    pub failure_threshold: usize,
    pub cooldown: Duration,
    /// Concurrent trial calls admitted while half-open.
    pub half_open_calls: usize,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            window: 10,
            failure_threshold: 5,
            cooldown: Duration::from_secs(10),
            half_open_calls: 1,
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    outcomes: VecDeque<bool>,
    opened_at: Option<Instant>,
    trials_in_flight: usize,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: &'static str,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
    open_count: AtomicU64,
    rejected_count: AtomicU64,
}

/// Admission ticket for one guarded call. A trial slot that is never
/// settled (the call future was dropped) is handed back on drop.
struct Admission<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl Admission<'_> {
    fn settle(mut self, success: bool) {
        self.settled = true;
        self.breaker.record(success, self.trial);
    }
}

impl Drop for Admission<'_> {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            let mut inner = self.breaker.lock();
            inner.trials_in_flight = inner.trials_in_flight.saturating_sub(1);
        }
    }
}

impl CircuitBreaker {
    pub fn new(name: &'static str, config: BreakerConfig) -> Self {
        let window = config.window.max(1);
        Self {
            name,
            config: BreakerConfig {
                window,
                failure_threshold: config.failure_threshold.clamp(1, window),
                half_open_calls: config.half_open_calls.max(1),
                ..config
            },
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                outcomes: VecDeque::with_capacity(window),
                opened_at: None,
                trials_in_flight: 0,
            }),
            open_count: AtomicU64::new(0),
            rejected_count: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Current state; an open circuit whose cool-down elapsed reads as half-open.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        inner.state
    }

    pub fn open_count(&self) -> u64 {
        self.open_count.load(Ordering::Relaxed)
    }

    pub fn rejected_count(&self) -> u64 {
        self.rejected_count.load(Ordering::Relaxed)
    }

    /// Runs `call` if the circuit admits it and records the outcome.
    pub async fn call<T, E, F>(&self, call: F) -> Result<T, BreakerError<E>>
    where
        F: Future<Output = Result<T, E>>,
    {
        let Some(admission) = self.admit() else {
            self.rejected_count.fetch_add(1, Ordering::Relaxed);
            return Err(BreakerError::Open);
        };
        match call.await {
            Ok(value) => {
                admission.settle(true);
                Ok(value)
            }
            Err(err) => {
                admission.settle(false);
                Err(BreakerError::Inner(err))
            }
        }
    }

    fn refresh(&self, inner: &mut BreakerInner) {
        if inner.state != CircuitState::Open {
            return;
        }
        let elapsed = inner
            .opened_at
            .map(|opened| opened.elapsed() >= self.config.cooldown)
            .unwrap_or(true);
        if elapsed {
            inner.state = CircuitState::HalfOpen;
            inner.trials_in_flight = 0;
            tracing::info!(breaker = self.name, "circuit breaker half-open; admitting trial calls");
        }
    }

    fn admit(&self) -> Option<Admission<'_>> {
        let mut inner = self.lock();
        self.refresh(&mut inner);
        match inner.state {
            CircuitState::Closed => Some(Admission {
                breaker: self,
                trial: false,
                settled: false,
            }),
            CircuitState::Open => None,
            CircuitState::HalfOpen => {
                if inner.trials_in_flight >= self.config.half_open_calls {
                    return None;
                }
                inner.trials_in_flight += 1;
                Some(Admission {
                    breaker: self,
                    trial: true,
                    settled: false,
                })
            }
        }
    }

    fn record(&self, success: bool, trial: bool) {
        let mut inner = self.lock();
        if trial {
            inner.trials_in_flight = inner.trials_in_flight.saturating_sub(1);
        }
        match inner.state {
            CircuitState::Closed => {
                if inner.outcomes.len() == self.config.window {
                    inner.outcomes.pop_front();
                }
                inner.outcomes.push_back(success);
                let failures = inner.outcomes.iter().filter(|ok| !**ok).count();
                if failures >= self.config.failure_threshold {
                    self.trip(&mut inner);
                    tracing::warn!(
                        breaker = self.name,
                        failures,
                        window = self.config.window,
                        "circuit breaker opened; too many store failures"
                    );
                }
            }
            CircuitState::HalfOpen if trial => {
                if success {
                    inner.state = CircuitState::Closed;
                    inner.outcomes.clear();
                    inner.opened_at = None;
                    tracing::info!(breaker = self.name, "circuit breaker closed; store recovered");
                } else {
                    self.trip(&mut inner);
                    tracing::warn!(breaker = self.name, "circuit breaker re-opened; trial call failed");
                }
            }
            // Late outcome of a call admitted before the circuit changed state.
            _ => {}
        }
    }

    fn trip(&self, inner: &mut BreakerInner) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.outcomes.clear();
        inner.trials_in_flight = 0;
        self.open_count.fetch_add(1, Ordering::Relaxed);
    }
}
