//! Load balancing policies for backend selection.
//!
//! Policies are stateless except for atomic counters and select from the
//! pool's currently selectable backends (healthy, not ejected). The
//! dispatcher passes the previously used backend as an exclusion so
//! retries land elsewhere when the pool allows it.

use crate::models::upstream::{Backend, HashKeySource, LoadBalancingStrategy, UpstreamPool};
use crate::models::http::GatewayRequest;
use crate::pipeline::context::RequestContext;
use std::collections::BTreeMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Load balancer trait for selecting backends.
pub trait LoadBalancer: Send + Sync {
    /// Selects a backend from the candidate set.
    ///
    /// `exclude` removes one backend (by URL identity) from consideration
    /// when the set has alternatives; `hash_key` feeds consistent hashing.
    fn select(
        &self,
        backends: &[Arc<Backend>],
        exclude: Option<&str>,
        hash_key: Option<&str>,
    ) -> Option<Arc<Backend>>;
}

/// Narrows the candidate set by the exclusion, keeping the excluded
/// backend only when it is the sole candidate.
fn apply_exclusion<'a>(backends: &'a [Arc<Backend>], exclude: Option<&str>) -> Vec<&'a Arc<Backend>> {
    let filtered: Vec<&Arc<Backend>> = backends
        .iter()
        .filter(|b| Some(b.url.as_str()) != exclude)
        .collect();
    if filtered.is_empty() {
        backends.iter().collect()
    } else {
        filtered
    }
}

/// Round-robin: monotonic counter modulo the candidate count.
#[derive(Debug, Default)]
pub struct RoundRobinBalancer {
    counter: AtomicUsize,
}

impl LoadBalancer for RoundRobinBalancer {
    fn select(
        &self,
        backends: &[Arc<Backend>],
        exclude: Option<&str>,
        _hash_key: Option<&str>,
    ) -> Option<Arc<Backend>> {
        let candidates = apply_exclusion(backends, exclude);
        if candidates.is_empty() {
            return None;
        }
        let index = self.counter.fetch_add(1, Ordering::Relaxed) % candidates.len();
        Some(candidates[index].clone())
    }
}

/// Weighted: scan over cumulative weights with a monotonic counter.
#[derive(Debug, Default)]
pub struct WeightedBalancer {
    counter: AtomicUsize,
}

impl LoadBalancer for WeightedBalancer {
    fn select(
        &self,
        backends: &[Arc<Backend>],
        exclude: Option<&str>,
        _hash_key: Option<&str>,
    ) -> Option<Arc<Backend>> {
        let candidates = apply_exclusion(backends, exclude);
        let total: usize = candidates.iter().map(|b| b.weight as usize).sum();
        if total == 0 {
            return None;
        }
        let mut point = self.counter.fetch_add(1, Ordering::Relaxed) % total;
        for backend in candidates {
            let weight = backend.weight as usize;
            if point < weight {
                return Some(backend.clone());
            }
            point -= weight;
        }
        None
    }
}

/// Least-connections: minimum active-request counter.
#[derive(Debug, Default)]
pub struct LeastConnectionsBalancer;

impl LoadBalancer for LeastConnectionsBalancer {
    fn select(
        &self,
        backends: &[Arc<Backend>],
        exclude: Option<&str>,
        _hash_key: Option<&str>,
    ) -> Option<Arc<Backend>> {
        apply_exclusion(backends, exclude)
            .into_iter()
            .min_by_key(|b| b.active_requests())
            .cloned()
    }
}

/// Least-response-time: minimum EWMA latency, ties broken by active count.
/// Backends without samples yet sort first so they get traffic.
#[derive(Debug, Default)]
pub struct LeastResponseTimeBalancer;

impl LoadBalancer for LeastResponseTimeBalancer {
    fn select(
        &self,
        backends: &[Arc<Backend>],
        exclude: Option<&str>,
        _hash_key: Option<&str>,
    ) -> Option<Arc<Backend>> {
        apply_exclusion(backends, exclude)
            .into_iter()
            .min_by_key(|b| (b.ewma_latency(), b.active_requests()))
            .cloned()
    }
}

/// Consistent-hash: ring of virtual nodes per backend. The ring is
/// rebuilt from the candidate set on each call; sets are small and change
/// rarely, and rebuilding keeps the balancer free of stale state after
/// discovery swaps.
#[derive(Debug)]
pub struct ConsistentHashBalancer {
    replicas: u32,
}

impl ConsistentHashBalancer {
    pub fn new(replicas: u32) -> Self {
        Self {
            replicas: replicas.max(1),
        }
    }

    fn hash(value: &str) -> u64 {
        let mut hasher = DefaultHasher::new();
        value.hash(&mut hasher);
        hasher.finish()
    }
}

impl LoadBalancer for ConsistentHashBalancer {
    fn select(
        &self,
        backends: &[Arc<Backend>],
        exclude: Option<&str>,
        hash_key: Option<&str>,
    ) -> Option<Arc<Backend>> {
        let candidates = apply_exclusion(backends, exclude);
        if candidates.is_empty() {
            return None;
        }
        let Some(key) = hash_key else {
            // No key available: fall back to the first candidate so the
            // route still dispatches.
            return Some(candidates[0].clone());
        };

        let mut ring: BTreeMap<u64, &Arc<Backend>> = BTreeMap::new();
        for backend in &candidates {
            for replica in 0..self.replicas {
                ring.insert(Self::hash(&format!("{}#{}", backend.url, replica)), backend);
            }
        }

        let point = Self::hash(key);
        let chosen = ring
            .range(point..)
            .next()
            .or_else(|| ring.iter().next())
            .map(|(_, b)| (*b).clone());
        chosen
    }
}

/// Creates a balancer for the given strategy.
pub struct LoadBalancerFactory;

impl LoadBalancerFactory {
    pub fn create(strategy: &LoadBalancingStrategy, ring_replicas: u32) -> Arc<dyn LoadBalancer> {
        match strategy {
            LoadBalancingStrategy::RoundRobin => Arc::new(RoundRobinBalancer::default()),
            LoadBalancingStrategy::Weighted => Arc::new(WeightedBalancer::default()),
            LoadBalancingStrategy::LeastConnections => Arc::new(LeastConnectionsBalancer),
            LoadBalancingStrategy::LeastResponseTime => Arc::new(LeastResponseTimeBalancer),
            LoadBalancingStrategy::ConsistentHash => {
                Arc::new(ConsistentHashBalancer::new(ring_replicas))
            }
        }
    }
}

/// Extracts the consistent-hash key configured for a pool from a request.
pub fn extract_hash_key(
    pool: &UpstreamPool,
    req: &GatewayRequest,
    ctx: &RequestContext,
) -> Option<String> {
    match pool.hash_key.as_ref()? {
        HashKeySource::Header(name) => req.header(name).map(|v| v.to_string()),
        HashKeySource::Cookie(name) => req.cookie(name),
        HashKeySource::Path => Some(req.path.clone()),
        HashKeySource::ClientIp => ctx.client_ip.map(|ip| ip.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::upstream::BackendConfig;

    fn backends(specs: &[(&str, u32)]) -> Vec<Arc<Backend>> {
        specs
            .iter()
            .map(|(url, weight)| {
                Backend::new(&BackendConfig {
                    url: url.to_string(),
                    weight: *weight,
                })
            })
            .collect()
    }

    #[test]
    fn round_robin_cycles_evenly() {
        let lb = RoundRobinBalancer::default();
        let set = backends(&[("http://a", 1), ("http://b", 1)]);
        let picks: Vec<String> = (0..4).map(|_| lb.select(&set, None, None).unwrap().url.clone()).collect();
        assert_eq!(picks, vec!["http://a", "http://b", "http://a", "http://b"]);
    }

    #[test]
    fn exclusion_skips_previous_backend() {
        let lb = RoundRobinBalancer::default();
        let set = backends(&[("http://a", 1), ("http://b", 1)]);
        for _ in 0..4 {
            let pick = lb.select(&set, Some("http://a"), None).unwrap();
            assert_eq!(pick.url, "http://b");
        }
        // Sole candidate stays selectable even when excluded.
        let solo = backends(&[("http://a", 1)]);
        assert_eq!(lb.select(&solo, Some("http://a"), None).unwrap().url, "http://a");
    }

    #[test]
    fn weighted_distribution_follows_weights() {
        let lb = WeightedBalancer::default();
        let set = backends(&[("http://a", 3), ("http://b", 1)]);
        let mut counts = std::collections::HashMap::new();
        for _ in 0..8 {
            let url = lb.select(&set, None, None).unwrap().url.clone();
            *counts.entry(url).or_insert(0) += 1;
        }
        assert_eq!(counts["http://a"], 6);
        assert_eq!(counts["http://b"], 2);
    }

    #[test]
    fn least_connections_prefers_idle_backend() {
        let lb = LeastConnectionsBalancer;
        let set = backends(&[("http://a", 1), ("http://b", 1)]);
        set[0].begin_request();
        set[0].begin_request();
        set[1].begin_request();
        assert_eq!(lb.select(&set, None, None).unwrap().url, "http://b");
    }

    #[test]
    fn least_response_time_prefers_fast_backend() {
        let lb = LeastResponseTimeBalancer;
        let set = backends(&[("http://slow", 1), ("http://fast", 1)]);
        set[0].record_latency(std::time::Duration::from_millis(200));
        set[1].record_latency(std::time::Duration::from_millis(5));
        assert_eq!(lb.select(&set, None, None).unwrap().url, "http://fast");
    }

    #[test]
    fn consistent_hash_is_sticky_per_key() {
        let lb = ConsistentHashBalancer::new(64);
        let set = backends(&[("http://a", 1), ("http://b", 1), ("http://c", 1)]);

        let first = lb.select(&set, None, Some("client-42")).unwrap().url.clone();
        for _ in 0..10 {
            assert_eq!(lb.select(&set, None, Some("client-42")).unwrap().url, first);
        }

        // Different keys spread across the ring.
        let mut seen = std::collections::HashSet::new();
        for i in 0..50 {
            seen.insert(lb.select(&set, None, Some(&format!("key-{}", i))).unwrap().url.clone());
        }
        assert!(seen.len() > 1);
    }

    #[test]
    fn empty_set_yields_none() {
        let lb = RoundRobinBalancer::default();
        assert!(lb.select(&[], None, None).is_none());
    }
}
