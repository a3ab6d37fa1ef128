//! Upstream pools and backend runtime state.
//!
//! A pool's backend *set* is replaced atomically (discovery emissions swap
//! the whole vector); per-backend signals (health bit, EWMA latency, active
//! count, ejection deadline) are atomics updated in place so every
//! concurrent request observes the same instance, keyed by backend URL.

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Load balancing policy for a pool.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingStrategy {
    /// Monotonic counter over the healthy set (default).
    RoundRobin,
    /// Scan over cumulative weights.
    Weighted,
    /// Fewest active requests.
    LeastConnections,
    /// Lowest EWMA latency, ties broken by active count.
    LeastResponseTime,
    /// Ring of virtual nodes; the hash key comes from the route's
    /// consistent-hash source.
    ConsistentHash,
}

impl Default for LoadBalancingStrategy {
    fn default() -> Self {
        Self::RoundRobin
    }
}

/// Where the consistent-hash key is taken from.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "source", content = "name")]
pub enum HashKeySource {
    Header(String),
    Cookie(String),
    Path,
    ClientIp,
}

/// Backend entry as configured.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BackendConfig {
    /// Full base URL including scheme, e.g. `http://users-1:8080`.
    pub url: String,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_weight() -> u32 {
    1
}

impl BackendConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !self.url.starts_with("http://") && !self.url.starts_with("https://") {
            return Err(format!(
                "Backend url must start with http:// or https://: {}",
                self.url
            ));
        }
        if self.weight == 0 {
            return Err("Backend weight must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Upstream pool as configured.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct UpstreamConfig {
    pub name: String,
    pub backends: Vec<BackendConfig>,
    #[serde(default)]
    pub strategy: LoadBalancingStrategy,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash_key: Option<HashKeySource>,
    /// Virtual nodes per backend on the consistent-hash ring.
    #[serde(default = "default_ring_replicas")]
    pub ring_replicas: u32,
}

fn default_ring_replicas() -> u32 {
    64
}

impl UpstreamConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.name.is_empty() {
            return Err("Upstream name must not be empty".to_string());
        }
        if self.backends.is_empty() {
            return Err(format!("Upstream {}: at least one backend required", self.name));
        }
        for (i, backend) in self.backends.iter().enumerate() {
            backend
                .validate()
                .map_err(|e| format!("Upstream {} backend {}: {}", self.name, i, e))?;
        }
        if self.strategy == LoadBalancingStrategy::ConsistentHash && self.hash_key.is_none() {
            return Err(format!(
                "Upstream {}: consistent_hash requires a hash_key",
                self.name
            ));
        }
        if self.ring_replicas == 0 {
            return Err(format!("Upstream {}: ring_replicas must be > 0", self.name));
        }
        Ok(())
    }
}

/// Runtime state for one backend. Shared across requests via `Arc`; the
/// URL doubles as the stable identity.
#[derive(Debug)]
pub struct Backend {
    pub url: String,
    pub weight: u32,
    healthy: AtomicBool,
    /// In-flight request count, maintained by the dispatcher.
    active: AtomicU32,
    /// EWMA latency in microseconds, stored as bits for atomic access.
    ewma_us: AtomicU64,
    /// Ejection deadline in milliseconds since the pool's epoch; zero when
    /// not ejected.
    ejected_until_ms: AtomicU64,
    /// Consecutive ejection count, drives ejection duration growth.
    consecutive_ejections: AtomicU32,
}

const EWMA_ALPHA: f64 = 0.3;

impl Backend {
    pub fn new(config: &BackendConfig) -> Arc<Self> {
        Arc::new(Self {
            url: config.url.clone(),
            weight: config.weight,
            healthy: AtomicBool::new(true),
            active: AtomicU32::new(0),
            ewma_us: AtomicU64::new(0),
            ejected_until_ms: AtomicU64::new(0),
            consecutive_ejections: AtomicU32::new(0),
        })
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Relaxed);
    }

    pub fn active_requests(&self) -> u32 {
        self.active.load(Ordering::Relaxed)
    }

    pub fn begin_request(&self) {
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn end_request(&self) {
        // Saturating: a cancelled bookkeeping path must not wrap.
        let _ = self
            .active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    /// Records an observed latency into the EWMA.
    pub fn record_latency(&self, latency: Duration) {
        let sample = latency.as_micros() as u64;
        let prev = self.ewma_us.load(Ordering::Relaxed);
        let next = if prev == 0 {
            sample
        } else {
            ((prev as f64) * (1.0 - EWMA_ALPHA) + (sample as f64) * EWMA_ALPHA) as u64
        };
        self.ewma_us.store(next, Ordering::Relaxed);
    }

    pub fn ewma_latency(&self) -> Duration {
        Duration::from_micros(self.ewma_us.load(Ordering::Relaxed))
    }

    /// Ejects the backend until `now + duration` on the pool clock.
    pub fn eject(&self, epoch: Instant, duration: Duration) {
        let until = epoch.elapsed() + duration;
        self.ejected_until_ms
            .store(until.as_millis() as u64, Ordering::Relaxed);
        self.consecutive_ejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn clear_ejection(&self) {
        self.ejected_until_ms.store(0, Ordering::Relaxed);
        self.consecutive_ejections.store(0, Ordering::Relaxed);
    }

    pub fn consecutive_ejections(&self) -> u32 {
        self.consecutive_ejections.load(Ordering::Relaxed)
    }

    pub fn is_ejected(&self, epoch: Instant) -> bool {
        let until = self.ejected_until_ms.load(Ordering::Relaxed);
        until != 0 && (epoch.elapsed().as_millis() as u64) < until
    }

    /// Visible to load balancing: healthy and not ejected.
    pub fn is_selectable(&self, epoch: Instant) -> bool {
        self.is_healthy() && !self.is_ejected(epoch)
    }
}

/// A named set of backends with a selection strategy.
///
/// The backend vector is swapped wholesale by discovery updates; requests
/// that already hold an `Arc<Backend>` keep using it (the retry engine
/// reselects between attempts, never mid-attempt).
#[derive(Debug)]
pub struct UpstreamPool {
    pub name: String,
    pub strategy: LoadBalancingStrategy,
    pub hash_key: Option<HashKeySource>,
    pub ring_replicas: u32,
    backends: ArcSwap<Vec<Arc<Backend>>>,
    /// Monotonic clock origin for ejection deadlines.
    epoch: Instant,
}

impl UpstreamPool {
    pub fn new(config: &UpstreamConfig) -> Arc<Self> {
        let backends: Vec<Arc<Backend>> = config.backends.iter().map(Backend::new).collect();
        Arc::new(Self {
            name: config.name.clone(),
            strategy: config.strategy.clone(),
            hash_key: config.hash_key.clone(),
            ring_replicas: config.ring_replicas,
            backends: ArcSwap::from_pointee(backends),
            epoch: Instant::now(),
        })
    }

    pub fn epoch(&self) -> Instant {
        self.epoch
    }

    pub fn backends(&self) -> Arc<Vec<Arc<Backend>>> {
        self.backends.load_full()
    }

    /// Backends visible to selection: healthy, not ejected.
    pub fn selectable(&self) -> Vec<Arc<Backend>> {
        self.backends()
            .iter()
            .filter(|b| b.is_selectable(self.epoch))
            .cloned()
            .collect()
    }

    /// Replaces the backend set atomically, carrying over runtime state
    /// for backends whose URL survives the update.
    pub fn replace_backends(&self, configs: &[BackendConfig]) {
        let current = self.backends();
        let next: Vec<Arc<Backend>> = configs
            .iter()
            .map(|cfg| {
                current
                    .iter()
                    .find(|b| b.url == cfg.url && b.weight == cfg.weight)
                    .cloned()
                    .unwrap_or_else(|| Backend::new(cfg))
            })
            .collect();
        self.backends.store(Arc::new(next));
    }

    /// Flips the health bit of the backend with the given URL identity.
    /// Returns false when no such backend exists.
    pub fn set_health(&self, backend_url: &str, healthy: bool) -> bool {
        match self.backends().iter().find(|b| b.url == backend_url) {
            Some(backend) => {
                backend.set_healthy(healthy);
                true
            }
            None => false,
        }
    }
}
