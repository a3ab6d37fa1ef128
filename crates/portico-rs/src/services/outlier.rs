//! Passive outlier detection with growing ejection times.
//!
//! Each backend accumulates attempt outcomes in a rolling window. On each
//! sweep interval the detector computes per-backend error rates and p99
//! latencies, ejects backends breaching the absolute or median-relative
//! thresholds, and un-ejects backends whose deadline has passed. The
//! ejected fraction of a pool never exceeds `max_ejection_percent`.

use crate::models::policy::OutlierPolicy;
use crate::models::upstream::UpstreamPool;
use log::{info, warn};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    ok: bool,
    latency: Duration,
}

#[derive(Debug, Default)]
struct BackendWindow {
    samples: VecDeque<Sample>,
}

#[derive(Debug, Clone, Copy)]
struct BackendStats {
    error_rate: f64,
    p99: Duration,
}

/// Outlier detector for one upstream pool.
#[derive(Debug)]
pub struct OutlierDetector {
    policy: OutlierPolicy,
    inner: Mutex<DetectorInner>,
}

#[derive(Debug)]
struct DetectorInner {
    windows: HashMap<String, BackendWindow>,
    last_sweep: Instant,
}

impl OutlierDetector {
    pub fn new(policy: OutlierPolicy) -> Self {
        Self {
            policy,
            inner: Mutex::new(DetectorInner {
                windows: HashMap::new(),
                last_sweep: Instant::now(),
            }),
        }
    }

    /// Records one attempt outcome and sweeps the pool when the interval
    /// has elapsed. Called by the dispatcher after every attempt.
    pub fn record(&self, pool: &UpstreamPool, backend_url: &str, ok: bool, latency: Duration) {
        let mut inner = self.inner.lock().expect("outlier lock poisoned");
        let now = Instant::now();
        let window = Duration::from_millis(self.policy.window_ms);

        let entry = inner.windows.entry(backend_url.to_string()).or_default();
        entry.samples.push_back(Sample {
            at: now,
            ok,
            latency,
        });
        while let Some(front) = entry.samples.front() {
            if now.duration_since(front.at) > window {
                entry.samples.pop_front();
            } else {
                break;
            }
        }

        if now.duration_since(inner.last_sweep) >= Duration::from_millis(self.policy.interval_ms) {
            inner.last_sweep = now;
            self.sweep(pool, &mut inner.windows, now, window);
        }
    }

    fn sweep(
        &self,
        pool: &UpstreamPool,
        windows: &mut HashMap<String, BackendWindow>,
        now: Instant,
        window: Duration,
    ) {
        let backends = pool.backends();

        let mut stats: HashMap<&str, BackendStats> = HashMap::new();
        for backend in backends.iter() {
            let Some(win) = windows.get_mut(&backend.url) else {
                continue;
            };
            while let Some(front) = win.samples.front() {
                if now.duration_since(front.at) > window {
                    win.samples.pop_front();
                } else {
                    break;
                }
            }
            if win.samples.is_empty() {
                continue;
            }
            let total = win.samples.len();
            let errors = win.samples.iter().filter(|s| !s.ok).count();
            let mut latencies: Vec<Duration> = win.samples.iter().map(|s| s.latency).collect();
            latencies.sort();
            let p99_index = ((total as f64) * 0.99).ceil() as usize;
            let p99 = latencies[p99_index.saturating_sub(1).min(total - 1)];
            stats.insert(
                backend.url.as_str(),
                BackendStats {
                    error_rate: errors as f64 / total as f64,
                    p99,
                },
            );
        }

        if stats.is_empty() {
            return;
        }

        let median_error = median(stats.values().map(|s| s.error_rate).collect());
        let median_p99 = median_duration(stats.values().map(|s| s.p99).collect());

        let already_ejected = backends
            .iter()
            .filter(|b| b.is_ejected(pool.epoch()))
            .count();
        let max_ejected =
            ((backends.len() as f64) * self.policy.max_ejection_percent).floor() as usize;
        let mut budget = max_ejected.saturating_sub(already_ejected);

        for backend in backends.iter() {
            if budget == 0 {
                break;
            }
            if backend.is_ejected(pool.epoch()) {
                continue;
            }
            let Some(stat) = stats.get(backend.url.as_str()) else {
                continue;
            };

            let error_breach = stat.error_rate > self.policy.error_rate_threshold
                || (median_error > 0.0
                    && stat.error_rate > self.policy.error_rate_multiplier * median_error);
            let latency_breach = median_p99 > Duration::ZERO
                && stat.p99.as_secs_f64()
                    > self.policy.latency_multiplier * median_p99.as_secs_f64();

            if error_breach || latency_breach {
                let consecutive = backend.consecutive_ejections() as u64 + 1;
                let duration = Duration::from_millis(
                    (self.policy.base_ejection_ms * consecutive).min(self.policy.max_ejection_ms),
                );
                backend.eject(pool.epoch(), duration);
                budget -= 1;
                warn!(
                    "Ejected backend {} from pool {} for {:?} (error_rate={:.2}, p99={:?})",
                    backend.url, pool.name, duration, stat.error_rate, stat.p99
                );
            }
        }

        // Backends past their deadline reset their streak once they stay
        // clean for a full window.
        for backend in backends.iter() {
            if backend.consecutive_ejections() > 0 && !backend.is_ejected(pool.epoch()) {
                if let Some(stat) = stats.get(backend.url.as_str()) {
                    if stat.error_rate <= self.policy.error_rate_threshold {
                        backend.clear_ejection();
                        info!("Backend {} recovered in pool {}", backend.url, pool.name);
                    }
                }
            }
        }
    }
}

fn median(mut values: Vec<f64>) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    values[values.len() / 2]
}

fn median_duration(mut values: Vec<Duration>) -> Duration {
    if values.is_empty() {
        return Duration::ZERO;
    }
    values.sort();
    values[values.len() / 2]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::upstream::{BackendConfig, LoadBalancingStrategy, UpstreamConfig};

    fn pool(urls: &[&str]) -> std::sync::Arc<UpstreamPool> {
        UpstreamPool::new(&UpstreamConfig {
            name: "test".to_string(),
            backends: urls
                .iter()
                .map(|u| BackendConfig {
                    url: u.to_string(),
                    weight: 1,
                })
                .collect(),
            strategy: LoadBalancingStrategy::RoundRobin,
            hash_key: None,
            ring_replicas: 64,
        })
    }

    fn policy() -> OutlierPolicy {
        OutlierPolicy {
            interval_ms: 0, // sweep on every record in tests
            window_ms: 60_000,
            error_rate_threshold: 0.5,
            error_rate_multiplier: 3.0,
            latency_multiplier: 10.0,
            base_ejection_ms: 60_000,
            max_ejection_ms: 300_000,
            max_ejection_percent: 0.5,
        }
    }

    #[test]
    fn ejects_backend_over_error_threshold() {
        let pool = pool(&["http://bad", "http://good"]);
        let detector = OutlierDetector::new(policy());

        for _ in 0..10 {
            detector.record(&pool, "http://bad", false, Duration::from_millis(10));
            detector.record(&pool, "http://good", true, Duration::from_millis(10));
        }

        let backends = pool.backends();
        assert!(backends[0].is_ejected(pool.epoch()));
        assert!(!backends[1].is_ejected(pool.epoch()));
    }

    #[test]
    fn ejection_fraction_is_capped() {
        let pool = pool(&["http://a", "http://b"]);
        let detector = OutlierDetector::new(policy());

        // Both backends fail constantly; max_ejection_percent=0.5 permits
        // ejecting only one of the two.
        for _ in 0..10 {
            detector.record(&pool, "http://a", false, Duration::from_millis(10));
            detector.record(&pool, "http://b", false, Duration::from_millis(10));
        }

        let ejected = pool
            .backends()
            .iter()
            .filter(|b| b.is_ejected(pool.epoch()))
            .count();
        assert_eq!(ejected, 1);
    }

    #[test]
    fn healthy_pool_stays_intact() {
        let pool = pool(&["http://a", "http://b"]);
        let detector = OutlierDetector::new(policy());
        for _ in 0..20 {
            detector.record(&pool, "http://a", true, Duration::from_millis(10));
            detector.record(&pool, "http://b", true, Duration::from_millis(12));
        }
        assert_eq!(pool.selectable().len(), 2);
    }
}
