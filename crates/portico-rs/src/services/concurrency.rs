//! Adaptive concurrency limiting, bounded queueing and load shedding.
//!
//! The adaptive limiter maintains an estimated optimal in-flight limit
//! derived from observed latency: every adjustment interval the target is
//! recomputed as `min_latency * (1 + tolerance)` and the limit moves up or
//! down by the smoothing step, clamped to `[min, max]`. Requests beyond
//! the limit wait in a bounded FIFO queue and answer 503 on queue
//! overflow or wait timeout.
//!
//! The load shedder samples CPU, memory and in-flight counts; once any
//! indicator breaches its threshold, shedding stays on until all of them
//! remain below threshold for the cooldown.

use crate::models::error::GatewayError;
use crate::models::policy::{AdaptiveConcurrencyPolicy, LoadShedPolicy};
use log::{info, warn};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use sysinfo::System;
use tokio::sync::oneshot;

/// Releases one concurrency slot on drop and wakes the next queued waiter.
#[derive(Debug)]
pub struct ConcurrencyPermit {
    limiter: Arc<AdaptiveLimiter>,
}

impl Drop for ConcurrencyPermit {
    fn drop(&mut self) {
        self.limiter.release();
    }
}

#[derive(Debug)]
struct LatencyWindow {
    samples: Vec<Duration>,
    min_observed: Option<Duration>,
    last_adjust: Instant,
}

/// Adaptive concurrency limiter with a bounded FIFO admission queue.
#[derive(Debug)]
pub struct AdaptiveLimiter {
    policy: AdaptiveConcurrencyPolicy,
    limit: AtomicUsize,
    in_flight: AtomicUsize,
    waiters: Mutex<VecDeque<oneshot::Sender<()>>>,
    window: Mutex<LatencyWindow>,
}

impl AdaptiveLimiter {
    pub fn new(policy: AdaptiveConcurrencyPolicy) -> Arc<Self> {
        let initial = policy.min_limit.max(1);
        Arc::new(Self {
            policy,
            limit: AtomicUsize::new(initial),
            in_flight: AtomicUsize::new(0),
            waiters: Mutex::new(VecDeque::new()),
            window: Mutex::new(LatencyWindow {
                samples: Vec::new(),
                min_observed: None,
                last_adjust: Instant::now(),
            }),
        })
    }

    pub fn current_limit(&self) -> usize {
        self.limit.load(Ordering::Relaxed)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Admits the request, queueing when the limit is reached. Fails with
    /// `QueueTimeout` on queue overflow or wait expiry; honors the
    /// request's cancellation through the caller dropping the future.
    pub async fn acquire(self: &Arc<Self>) -> Result<ConcurrencyPermit, GatewayError> {
        let deadline = Instant::now() + Duration::from_millis(self.policy.queue.max_wait_ms);
        loop {
            if self.try_increment() {
                return Ok(ConcurrencyPermit {
                    limiter: self.clone(),
                });
            }

            let rx = {
                let mut waiters = self.waiters.lock().expect("queue lock poisoned");
                if waiters.len() >= self.policy.queue.max_depth {
                    return Err(GatewayError::QueueTimeout {
                        retry_after_secs: (self.policy.queue.max_wait_ms / 1_000).max(1),
                    });
                }
                let (tx, rx) = oneshot::channel();
                waiters.push_back(tx);
                rx
            };

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(GatewayError::QueueTimeout {
                    retry_after_secs: (self.policy.queue.max_wait_ms / 1_000).max(1),
                });
            }
            match tokio::time::timeout(remaining, rx).await {
                Ok(Ok(())) => continue, // slot may be free; retry the increment
                Ok(Err(_)) | Err(_) => {
                    return Err(GatewayError::QueueTimeout {
                        retry_after_secs: (self.policy.queue.max_wait_ms / 1_000).max(1),
                    });
                }
            }
        }
    }

    fn try_increment(&self) -> bool {
        let limit = self.limit.load(Ordering::Relaxed);
        self.in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < limit).then_some(current + 1)
            })
            .is_ok()
    }

    fn release(&self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        // Wake one waiter; closed receivers (timed out or cancelled) are
        // skipped so their slot reaches a live waiter.
        let mut waiters = self.waiters.lock().expect("queue lock poisoned");
        while let Some(tx) = waiters.pop_front() {
            if tx.send(()).is_ok() {
                break;
            }
        }
    }

    /// Feeds one request latency into the controller and adjusts the limit
    /// when the interval has elapsed.
    pub fn record_latency(&self, latency: Duration) {
        let mut window = self.window.lock().expect("window lock poisoned");
        window.samples.push(latency);
        window.min_observed = Some(match window.min_observed {
            Some(min) => min.min(latency),
            None => latency,
        });

        let interval = Duration::from_millis(self.policy.adjustment_interval_ms);
        if window.last_adjust.elapsed() < interval || window.samples.is_empty() {
            return;
        }

        let avg: Duration = {
            let total: Duration = window.samples.iter().sum();
            total / window.samples.len() as u32
        };
        let min = window.min_observed.unwrap_or(avg);
        let target = min.mul_f64(1.0 + self.policy.latency_tolerance);

        let current = self.limit.load(Ordering::Relaxed);
        let step = ((current as f64) * self.policy.smoothing).max(1.0) as usize;
        let next = if avg <= target {
            (current + step).min(self.policy.max_limit)
        } else {
            current.saturating_sub(step).max(self.policy.min_limit)
        };
        if next != current {
            info!(
                "Adaptive concurrency limit {} -> {} (avg={:?}, target={:?})",
                current, next, avg, target
            );
            self.limit.store(next, Ordering::Relaxed);
        }

        window.samples.clear();
        window.last_adjust = Instant::now();
    }
}

#[derive(Debug)]
struct ShedState {
    sys: System,
    last_sample: Option<Instant>,
    shedding: bool,
    below_since: Option<Instant>,
}

/// CPU/memory/in-flight load shedder.
pub struct LoadShedder {
    policy: LoadShedPolicy,
    state: Mutex<ShedState>,
}

impl LoadShedder {
    pub fn new(policy: LoadShedPolicy) -> Self {
        Self {
            policy,
            state: Mutex::new(ShedState {
                sys: System::new(),
                last_sample: None,
                shedding: false,
                below_since: None,
            }),
        }
    }

    pub fn retry_after_secs(&self) -> u64 {
        self.policy.retry_after_secs
    }

    /// Whether the system is currently shedding. Samples at most once per
    /// configured interval; between samples the last decision holds.
    pub fn is_shedding(&self, in_flight: usize) -> bool {
        let mut state = self.state.lock().expect("shed lock poisoned");
        let interval = Duration::from_millis(self.policy.sample_interval_ms);
        if let Some(last) = state.last_sample {
            if last.elapsed() < interval {
                return state.shedding;
            }
        }
        state.last_sample = Some(Instant::now());

        state.sys.refresh_cpu_usage();
        state.sys.refresh_memory();
        let cpu = (state.sys.global_cpu_usage() as f64) / 100.0;
        let total_mem = state.sys.total_memory();
        let memory = if total_mem == 0 {
            0.0
        } else {
            state.sys.used_memory() as f64 / total_mem as f64
        };

        let over = cpu > self.policy.cpu_threshold
            || memory > self.policy.memory_threshold
            || (self.policy.inflight_threshold > 0 && in_flight > self.policy.inflight_threshold);

        if over {
            if !state.shedding {
                warn!(
                    "Entering load shedding (cpu={:.2}, mem={:.2}, in_flight={})",
                    cpu, memory, in_flight
                );
            }
            state.shedding = true;
            state.below_since = None;
        } else if state.shedding {
            let cooldown = Duration::from_millis(self.policy.cooldown_ms);
            match state.below_since {
                Some(since) if since.elapsed() >= cooldown => {
                    info!("Leaving load shedding after cooldown");
                    state.shedding = false;
                    state.below_since = None;
                }
                Some(_) => {}
                None => state.below_since = Some(Instant::now()),
            }
        }

        state.shedding
    }
}
