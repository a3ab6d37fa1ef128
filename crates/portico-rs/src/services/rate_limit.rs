//! Rate limiting, spike arrest and their key extraction.
//!
//! Two algorithms: token bucket (burst up to capacity, refill at
//! rate/period) and sliding window (timestamp count within the window).
//! State is local (in-process maps) or distributed (KV counters with
//! TTL); distributed failures admit the request when the policy says
//! `fail_open`.

use crate::models::http::GatewayRequest;
use crate::models::policy::{
    LimiterMode, RateLimitAlgorithm, RateLimitKey, RateLimitPolicy, RateLimitTier,
    SpikeArrestPolicy,
};
use crate::pipeline::context::RequestContext;
use crate::services::kv::KvStore;
use log::warn;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

/// Outcome of a limiter check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LimitDecision {
    Allowed,
    /// Rejected; advertise this Retry-After.
    Limited { retry_after_secs: u64 },
}

impl LimitDecision {
    pub fn allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// Derives the limiter key for a request. `None` means the extractor's
/// source is absent (for example no JWT claim); such requests share the
/// `"anonymous"` bucket rather than bypassing the limiter.
pub fn extract_key(
    key: &RateLimitKey,
    req: &GatewayRequest,
    ctx: &RequestContext,
) -> String {
    let extracted = match key {
        RateLimitKey::Ip => ctx.client_ip.map(|ip| ip.to_string()),
        RateLimitKey::ClientId => ctx.identity.as_ref().map(|id| id.client_id.clone()),
        RateLimitKey::Header(name) => req.header(name).map(|v| v.to_string()),
        RateLimitKey::Cookie(name) => req.cookie(name),
        RateLimitKey::JwtClaim(name) => ctx
            .identity
            .as_ref()
            .and_then(|id| id.claims.get(name))
            .map(|v| match v {
                serde_json::Value::String(s) => s.clone(),
                other => other.to_string(),
            }),
    };
    extracted.unwrap_or_else(|| "anonymous".to_string())
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

#[derive(Debug)]
struct WindowState {
    hits: VecDeque<Instant>,
}

/// Local limiter state shared across routes naming the same policy scope.
/// Keys combine the route scope with the extracted client key.
#[derive(Default)]
pub struct RateLimiter {
    buckets: RwLock<HashMap<String, Mutex<BucketState>>>,
    windows: RwLock<HashMap<String, Mutex<WindowState>>>,
    kv: Option<Arc<dyn KvStore>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// A limiter with a KV backend for distributed policies.
    pub fn with_kv(kv: Arc<dyn KvStore>) -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
            windows: RwLock::new(HashMap::new()),
            kv: Some(kv),
        }
    }

    /// Checks one request against the policy, consuming capacity when
    /// admitted.
    pub async fn check(
        &self,
        scope: &str,
        client_key: &str,
        policy: &RateLimitPolicy,
        tier_name: Option<&str>,
    ) -> LimitDecision {
        let tier = policy.tier_for(tier_name);
        let full_key = format!("{}:{}", scope, client_key);

        match policy.mode {
            LimiterMode::Local => match policy.algorithm {
                RateLimitAlgorithm::TokenBucket => self.check_token_bucket(&full_key, &tier),
                RateLimitAlgorithm::SlidingWindow => self.check_sliding_window(&full_key, &tier),
            },
            LimiterMode::Distributed => self.check_distributed(&full_key, &tier, policy).await,
        }
    }

    fn check_token_bucket(&self, key: &str, tier: &RateLimitTier) -> LimitDecision {
        let capacity = tier.capacity() as f64;
        let refill_per_sec = tier.rate as f64 / tier.period().as_secs_f64();

        {
            let buckets = self.buckets.read().expect("limiter lock poisoned");
            if let Some(bucket) = buckets.get(key) {
                return Self::take_token(bucket, capacity, refill_per_sec);
            }
        }

        let mut buckets = self.buckets.write().expect("limiter lock poisoned");
        let bucket = buckets.entry(key.to_string()).or_insert_with(|| {
            Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            })
        });
        Self::take_token(bucket, capacity, refill_per_sec)
    }

    fn take_token(
        bucket: &Mutex<BucketState>,
        capacity: f64,
        refill_per_sec: f64,
    ) -> LimitDecision {
        let mut state = bucket.lock().expect("bucket lock poisoned");
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * refill_per_sec).min(capacity);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            LimitDecision::Allowed
        } else {
            let wait = (1.0 - state.tokens) / refill_per_sec;
            LimitDecision::Limited {
                retry_after_secs: wait.ceil().max(1.0) as u64,
            }
        }
    }

    fn check_sliding_window(&self, key: &str, tier: &RateLimitTier) -> LimitDecision {
        let window = tier.period();
        let limit = tier.capacity() as usize;

        {
            let windows = self.windows.read().expect("limiter lock poisoned");
            if let Some(state) = windows.get(key) {
                return Self::slide(state, window, limit);
            }
        }

        let mut windows = self.windows.write().expect("limiter lock poisoned");
        let state = windows.entry(key.to_string()).or_insert_with(|| {
            Mutex::new(WindowState {
                hits: VecDeque::new(),
            })
        });
        Self::slide(state, window, limit)
    }

    fn slide(state: &Mutex<WindowState>, window: Duration, limit: usize) -> LimitDecision {
        let mut state = state.lock().expect("window lock poisoned");
        let now = Instant::now();
        while let Some(front) = state.hits.front() {
            if now.duration_since(*front) > window {
                state.hits.pop_front();
            } else {
                break;
            }
        }

        if state.hits.len() < limit {
            state.hits.push_back(now);
            LimitDecision::Allowed
        } else {
            let oldest = state.hits.front().copied().unwrap_or(now);
            let retry = window.saturating_sub(now.duration_since(oldest));
            LimitDecision::Limited {
                retry_after_secs: retry.as_secs().max(1),
            }
        }
    }

    /// Fixed-window counter over the shared KV. The window granularity is
    /// the tier period; KV errors fail open unless configured otherwise.
    async fn check_distributed(
        &self,
        key: &str,
        tier: &RateLimitTier,
        policy: &RateLimitPolicy,
    ) -> LimitDecision {
        let Some(kv) = &self.kv else {
            warn!("Distributed rate limit for {} without a KV backend", key);
            return if policy.fail_open {
                LimitDecision::Allowed
            } else {
                LimitDecision::Limited {
                    retry_after_secs: 1,
                }
            };
        };

        match kv.incr_with_ttl(key, tier.period()).await {
            Ok(count) if count <= tier.capacity() => LimitDecision::Allowed,
            Ok(_) => LimitDecision::Limited {
                retry_after_secs: tier.period().as_secs().max(1),
            },
            Err(e) => {
                warn!("Rate limit KV error for {}: {}; fail_open={}", key, e, policy.fail_open);
                if policy.fail_open {
                    LimitDecision::Allowed
                } else {
                    LimitDecision::Limited {
                        retry_after_secs: 1,
                    }
                }
            }
        }
    }
}

/// Spike arrest: strict even spacing with no queueing and no burst
/// smoothing. At most one admitted request per `period/rate` per key.
#[derive(Default)]
pub struct SpikeArrester {
    last_admit: RwLock<HashMap<String, Mutex<Instant>>>,
}

impl SpikeArrester {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(&self, scope: &str, client_key: &str, policy: &SpikeArrestPolicy) -> LimitDecision {
        let key = format!("{}:{}", scope, client_key);
        let gap = policy.min_gap();

        {
            let map = self.last_admit.read().expect("spike lock poisoned");
            if let Some(last) = map.get(&key) {
                return Self::try_admit(last, gap);
            }
        }

        let mut map = self.last_admit.write().expect("spike lock poisoned");
        if let Some(last) = map.get(&key) {
            return Self::try_admit(last, gap);
        }
        map.insert(key, Mutex::new(Instant::now()));
        LimitDecision::Allowed
    }

    fn try_admit(last: &Mutex<Instant>, gap: Duration) -> LimitDecision {
        let mut last = last.lock().expect("spike lock poisoned");
        let now = Instant::now();
        if now.duration_since(*last) >= gap {
            *last = now;
            LimitDecision::Allowed
        } else {
            let retry = gap.saturating_sub(now.duration_since(*last));
            LimitDecision::Limited {
                retry_after_secs: retry.as_secs().max(1),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::kv::MemoryKv;

    fn policy(algorithm: RateLimitAlgorithm, rate: u64, burst: Option<u64>) -> RateLimitPolicy {
        RateLimitPolicy {
            algorithm,
            key: RateLimitKey::Ip,
            rate,
            period_ms: 1_000,
            burst,
            tiers: HashMap::new(),
            mode: LimiterMode::Local,
            fail_open: true,
        }
    }

    #[tokio::test]
    async fn token_bucket_allows_burst_then_limits() {
        let limiter = RateLimiter::new();
        let policy = policy(RateLimitAlgorithm::TokenBucket, 2, Some(2));

        assert!(limiter.check("r", "10.0.0.1", &policy, None).await.allowed());
        assert!(limiter.check("r", "10.0.0.1", &policy, None).await.allowed());

        match limiter.check("r", "10.0.0.1", &policy, None).await {
            LimitDecision::Limited { retry_after_secs } => assert_eq!(retry_after_secs, 1),
            other => panic!("expected limit, got {:?}", other),
        }

        // Another key is unaffected.
        assert!(limiter.check("r", "10.0.0.2", &policy, None).await.allowed());
    }

    #[tokio::test]
    async fn token_bucket_refills_over_time() {
        let limiter = RateLimiter::new();
        let mut p = policy(RateLimitAlgorithm::TokenBucket, 10, Some(1));
        p.period_ms = 100; // 1 token per 10ms
        assert!(limiter.check("r", "k", &p, None).await.allowed());
        assert!(!limiter.check("r", "k", &p, None).await.allowed());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(limiter.check("r", "k", &p, None).await.allowed());
    }

    #[tokio::test]
    async fn sliding_window_counts_hits() {
        let limiter = RateLimiter::new();
        let mut p = policy(RateLimitAlgorithm::SlidingWindow, 3, None);
        p.period_ms = 120;

        for _ in 0..3 {
            assert!(limiter.check("r", "k", &p, None).await.allowed());
        }
        assert!(!limiter.check("r", "k", &p, None).await.allowed());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(limiter.check("r", "k", &p, None).await.allowed());
    }

    #[tokio::test]
    async fn tiers_override_base_rate() {
        let limiter = RateLimiter::new();
        let mut p = policy(RateLimitAlgorithm::TokenBucket, 1, Some(1));
        p.tiers.insert(
            "gold".to_string(),
            RateLimitTier {
                rate: 100,
                period_ms: 1_000,
                burst: Some(100),
            },
        );

        for _ in 0..10 {
            assert!(limiter.check("r", "k", &p, Some("gold")).await.allowed());
        }
    }

    #[tokio::test]
    async fn distributed_mode_uses_kv_counters() {
        let kv = Arc::new(MemoryKv::new());
        let limiter = RateLimiter::with_kv(kv);
        let mut p = policy(RateLimitAlgorithm::TokenBucket, 2, Some(2));
        p.mode = LimiterMode::Distributed;

        assert!(limiter.check("r", "k", &p, None).await.allowed());
        assert!(limiter.check("r", "k", &p, None).await.allowed());
        assert!(!limiter.check("r", "k", &p, None).await.allowed());
    }

    #[tokio::test]
    async fn distributed_without_backend_fails_open() {
        let limiter = RateLimiter::new();
        let mut p = policy(RateLimitAlgorithm::TokenBucket, 1, Some(1));
        p.mode = LimiterMode::Distributed;
        assert!(limiter.check("r", "k", &p, None).await.allowed());

        p.fail_open = false;
        assert!(!limiter.check("r", "k", &p, None).await.allowed());
    }

    #[test]
    fn spike_arrest_enforces_even_spacing() {
        let arrester = SpikeArrester::new();
        let policy = SpikeArrestPolicy {
            rate: 10,
            period_ms: 1_000,
            key: RateLimitKey::Ip,
        };

        assert!(arrester.check("r", "k", &policy).allowed());
        // Immediately after: inside the 100ms gap.
        assert!(!arrester.check("r", "k", &policy).allowed());
        // Other keys are independent.
        assert!(arrester.check("r", "other", &policy).allowed());
    }
}
