//! Circuit breaker for upstream protection.
//!
//! Three states: Closed counts consecutive failures and opens at the
//! configured threshold; Open rejects immediately until the open timeout
//! elapses; HalfOpen admits a bounded number of probes, closing on enough
//! successes and reopening on any failure. Tenant isolation hands out an
//! independent state machine per resolved tenant key.

use crate::models::policy::CircuitBreakerPolicy;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CircuitState {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

/// Permit handed out when a request is admitted. The dispatcher reports
/// the attempt outcome through it; dropping without reporting releases a
/// half-open probe slot without changing state (cancelled request).
#[derive(Debug)]
pub struct BreakerPermit {
    breaker: Arc<CircuitBreaker>,
    /// Set when this permit occupies a half-open probe slot.
    probe: bool,
    reported: bool,
}

impl BreakerPermit {
    pub fn record_success(mut self) {
        self.reported = true;
        self.breaker.on_success(self.probe);
    }

    pub fn record_failure(mut self) {
        self.reported = true;
        self.breaker.on_failure(self.probe);
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if !self.reported && self.probe {
            // A cancelled probe releases its slot so the next request can
            // probe instead.
            self.breaker.half_open_probes.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

/// Per-upstream (or per-tenant) circuit breaker.
///
/// Atomics carry the hot-path state; the mutex guards only the opened-at
/// timestamp used for the open -> half-open transition.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    policy: CircuitBreakerPolicy,
    state: AtomicU8,
    consecutive_failures: AtomicU64,
    half_open_successes: AtomicU64,
    half_open_probes: AtomicU64,
    opened_at: Mutex<Option<Instant>>,
}

impl CircuitBreaker {
    pub fn new(name: String, policy: CircuitBreakerPolicy) -> Arc<Self> {
        Arc::new(Self {
            name,
            policy,
            state: AtomicU8::new(CircuitState::Closed as u8),
            consecutive_failures: AtomicU64::new(0),
            half_open_successes: AtomicU64::new(0),
            half_open_probes: AtomicU64::new(0),
            opened_at: Mutex::new(None),
        })
    }

    /// Asks for admission. `None` means the circuit is open and the
    /// request must be rejected with a synthetic 503.
    pub fn try_acquire(self: &Arc<Self>) -> Option<BreakerPermit> {
        match self.state() {
            CircuitState::Closed => Some(BreakerPermit {
                breaker: self.clone(),
                probe: false,
                reported: false,
            }),
            CircuitState::Open => {
                let elapsed = self
                    .opened_at
                    .lock()
                    .expect("breaker lock poisoned")
                    .map(|at| at.elapsed())
                    .unwrap_or_default();
                if elapsed >= self.policy.timeout() {
                    self.transition_to_half_open();
                    self.try_acquire_probe()
                } else {
                    debug!("Circuit breaker {} is open, failing fast", self.name);
                    None
                }
            }
            CircuitState::HalfOpen => self.try_acquire_probe(),
        }
    }

    fn try_acquire_probe(self: &Arc<Self>) -> Option<BreakerPermit> {
        let admitted = self
            .half_open_probes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |probes| {
                (probes < self.policy.max_half_open_probes).then_some(probes + 1)
            })
            .is_ok();
        if admitted {
            Some(BreakerPermit {
                breaker: self.clone(),
                probe: true,
                reported: false,
            })
        } else {
            None
        }
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::Acquire))
    }

    pub fn consecutive_failures(&self) -> u64 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    fn on_success(&self, probe: bool) {
        match self.state() {
            CircuitState::Closed => {
                self.consecutive_failures.store(0, Ordering::Relaxed);
            }
            CircuitState::HalfOpen => {
                if probe {
                    self.half_open_probes.fetch_sub(1, Ordering::AcqRel);
                }
                let successes = self.half_open_successes.fetch_add(1, Ordering::AcqRel) + 1;
                if successes >= self.policy.success_threshold {
                    self.transition_to_closed();
                }
            }
            CircuitState::Open => {
                debug!("Unexpected success reported while {} is open", self.name);
            }
        }
    }

    fn on_failure(&self, probe: bool) {
        match self.state() {
            CircuitState::Closed => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.policy.failure_threshold {
                    self.transition_to_open();
                }
            }
            CircuitState::HalfOpen => {
                if probe {
                    self.half_open_probes.fetch_sub(1, Ordering::AcqRel);
                }
                // Any half-open failure reopens with a fresh timer.
                self.transition_to_open();
            }
            CircuitState::Open => {}
        }
    }

    fn transition_to_open(&self) {
        self.state.store(CircuitState::Open as u8, Ordering::Release);
        *self.opened_at.lock().expect("breaker lock poisoned") = Some(Instant::now());
        self.half_open_successes.store(0, Ordering::Relaxed);
        warn!("Circuit breaker {} opened due to failures", self.name);
    }

    fn transition_to_half_open(&self) {
        self.state
            .store(CircuitState::HalfOpen as u8, Ordering::Release);
        self.half_open_successes.store(0, Ordering::Relaxed);
        self.half_open_probes.store(0, Ordering::Relaxed);
        info!("Circuit breaker {} transitioned to half-open", self.name);
    }

    fn transition_to_closed(&self) {
        self.state
            .store(CircuitState::Closed as u8, Ordering::Release);
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.half_open_successes.store(0, Ordering::Relaxed);
        info!("Circuit breaker {} closed - service recovered", self.name);
    }
}

/// Process-wide registry of breakers keyed by upstream name, or by
/// `upstream:tenant` when tenant isolation is configured.
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(
        &self,
        upstream: &str,
        tenant: Option<&str>,
        policy: &CircuitBreakerPolicy,
    ) -> Arc<CircuitBreaker> {
        let key = match tenant {
            Some(tenant) => format!("{}:{}", upstream, tenant),
            None => upstream.to_string(),
        };
        if let Some(breaker) = self.breakers.read().expect("registry lock poisoned").get(&key) {
            return breaker.clone();
        }
        let mut map = self.breakers.write().expect("registry lock poisoned");
        map.entry(key.clone())
            .or_insert_with(|| CircuitBreaker::new(key, policy.clone()))
            .clone()
    }
}
