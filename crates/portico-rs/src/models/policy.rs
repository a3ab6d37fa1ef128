//! Policy configuration models.
//!
//! Policies exist at two levels: global defaults on the snapshot and
//! per-route overlays. The merge rule is uniform per field family: a route
//! field wrapped in `Option` overrides the global value only when `Some`,
//! so `false` remains an expressible override for boolean families.
//!
//! All durations are configured in milliseconds unless the field name says
//! otherwise, mirroring the retry configuration of the route model.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Rate limiting algorithm selection.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitAlgorithm {
    /// Token bucket: burst up to capacity, refill at rate/period.
    TokenBucket,
    /// Sliding window: count of request timestamps within the window.
    SlidingWindow,
}

impl Default for RateLimitAlgorithm {
    fn default() -> Self {
        Self::TokenBucket
    }
}

/// Where limiter state lives.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LimiterMode {
    /// In-process atomics and maps.
    Local,
    /// Shared KV with compare-and-set semantics.
    Distributed,
}

impl Default for LimiterMode {
    fn default() -> Self {
        Self::Local
    }
}

/// How the rate-limit key is derived from a request.
///
/// Parsed from strings of the form `ip`, `client_id`, `header:NAME`,
/// `cookie:NAME` or `jwt_claim:NAME`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(try_from = "String", into = "String")]
pub enum RateLimitKey {
    Ip,
    ClientId,
    Header(String),
    Cookie(String),
    JwtClaim(String),
}

impl Default for RateLimitKey {
    fn default() -> Self {
        Self::Ip
    }
}

impl TryFrom<String> for RateLimitKey {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "ip" => Ok(Self::Ip),
            "client_id" => Ok(Self::ClientId),
            other => match other.split_once(':') {
                Some(("header", name)) if !name.is_empty() => Ok(Self::Header(name.to_string())),
                Some(("cookie", name)) if !name.is_empty() => Ok(Self::Cookie(name.to_string())),
                Some(("jwt_claim", name)) if !name.is_empty() => {
                    Ok(Self::JwtClaim(name.to_string()))
                }
                _ => Err(format!("Invalid rate limit key extractor: {}", value)),
            },
        }
    }
}

impl From<RateLimitKey> for String {
    fn from(key: RateLimitKey) -> Self {
        match key {
            RateLimitKey::Ip => "ip".to_string(),
            RateLimitKey::ClientId => "client_id".to_string(),
            RateLimitKey::Header(name) => format!("header:{}", name),
            RateLimitKey::Cookie(name) => format!("cookie:{}", name),
            RateLimitKey::JwtClaim(name) => format!("jwt_claim:{}", name),
        }
    }
}

/// One rate-limit tier: requests per period with a burst allowance.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RateLimitTier {
    pub rate: u64,
    pub period_ms: u64,
    #[serde(default)]
    pub burst: Option<u64>,
}

impl RateLimitTier {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }

    /// Bucket capacity: explicit burst, or the rate itself.
    pub fn capacity(&self) -> u64 {
        self.burst.unwrap_or(self.rate).max(1)
    }
}

/// Per-route rate limiting policy.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RateLimitPolicy {
    #[serde(default)]
    pub algorithm: RateLimitAlgorithm,
    #[serde(default)]
    pub key: RateLimitKey,
    pub rate: u64,
    #[serde(default = "default_period_ms")]
    pub period_ms: u64,
    #[serde(default)]
    pub burst: Option<u64>,
    /// Named tiers selected by the identity's tier attribute. A request whose
    /// identity resolves to a named tier uses that tier's triple instead of
    /// the base rate.
    #[serde(default)]
    pub tiers: HashMap<String, RateLimitTier>,
    #[serde(default)]
    pub mode: LimiterMode,
    /// On distributed KV errors, admit the request instead of rejecting.
    #[serde(default = "default_true")]
    pub fail_open: bool,
}

impl RateLimitPolicy {
    pub fn base_tier(&self) -> RateLimitTier {
        RateLimitTier {
            rate: self.rate,
            period_ms: self.period_ms,
            burst: self.burst,
        }
    }

    pub fn tier_for(&self, tier_name: Option<&str>) -> RateLimitTier {
        tier_name
            .and_then(|name| self.tiers.get(name).cloned())
            .unwrap_or_else(|| self.base_tier())
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.rate == 0 {
            return Err("Rate limit rate must be greater than 0".to_string());
        }
        if self.period_ms == 0 {
            return Err("Rate limit period must be greater than 0".to_string());
        }
        for (name, tier) in &self.tiers {
            if tier.rate == 0 || tier.period_ms == 0 {
                return Err(format!("Rate limit tier '{}' has a zero rate or period", name));
            }
        }
        Ok(())
    }
}

/// Spike arrest policy: even-spacing rejector with no burst smoothing.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SpikeArrestPolicy {
    pub rate: u64,
    #[serde(default = "default_period_ms")]
    pub period_ms: u64,
    #[serde(default)]
    pub key: RateLimitKey,
}

impl SpikeArrestPolicy {
    /// Minimum gap between admitted requests.
    pub fn min_gap(&self) -> Duration {
        if self.rate == 0 {
            return Duration::from_millis(self.period_ms);
        }
        Duration::from_millis(self.period_ms / self.rate.max(1))
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.rate == 0 {
            return Err("Spike arrest rate must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Adaptive concurrency limit configuration.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AdaptiveConcurrencyPolicy {
    #[serde(default = "default_min_concurrency")]
    pub min_limit: usize,
    #[serde(default = "default_max_concurrency")]
    pub max_limit: usize,
    /// Fraction above the observed minimum latency tolerated before the
    /// limit is lowered.
    #[serde(default = "default_latency_tolerance")]
    pub latency_tolerance: f64,
    #[serde(default = "default_adjust_interval_ms")]
    pub adjustment_interval_ms: u64,
    /// Exponential smoothing applied when moving the limit.
    #[serde(default = "default_smoothing")]
    pub smoothing: f64,
    /// Bounded FIFO queue consulted when the limit is reached.
    #[serde(default)]
    pub queue: QueuePolicy,
}

impl AdaptiveConcurrencyPolicy {
    pub fn validate(&self) -> Result<(), String> {
        if self.min_limit == 0 {
            return Err("Adaptive concurrency min_limit must be at least 1".to_string());
        }
        if self.max_limit < self.min_limit {
            return Err("Adaptive concurrency max_limit must be >= min_limit".to_string());
        }
        if !(0.0..=10.0).contains(&self.latency_tolerance) {
            return Err("latency_tolerance must be between 0 and 10".to_string());
        }
        Ok(())
    }
}

/// Bounded request queue in front of the concurrency limit.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct QueuePolicy {
    #[serde(default = "default_queue_depth")]
    pub max_depth: usize,
    #[serde(default = "default_queue_wait_ms")]
    pub max_wait_ms: u64,
}

impl Default for QueuePolicy {
    fn default() -> Self {
        Self {
            max_depth: default_queue_depth(),
            max_wait_ms: default_queue_wait_ms(),
        }
    }
}

/// Load shedding thresholds and cadence.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct LoadShedPolicy {
    /// CPU usage fraction (0.0 - 1.0) above which shedding starts.
    #[serde(default = "default_cpu_threshold")]
    pub cpu_threshold: f64,
    /// Memory usage fraction (0.0 - 1.0) above which shedding starts.
    #[serde(default = "default_memory_threshold")]
    pub memory_threshold: f64,
    /// In-flight request count above which shedding starts. Zero disables
    /// the indicator.
    #[serde(default)]
    pub inflight_threshold: usize,
    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,
    /// All indicators must stay below threshold this long before shedding
    /// ends.
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    #[serde(default = "default_shed_retry_after")]
    pub retry_after_secs: u64,
}

impl Default for LoadShedPolicy {
    fn default() -> Self {
        Self {
            cpu_threshold: default_cpu_threshold(),
            memory_threshold: default_memory_threshold(),
            inflight_threshold: 0,
            sample_interval_ms: default_sample_interval_ms(),
            cooldown_ms: default_cooldown_ms(),
            retry_after_secs: default_shed_retry_after(),
        }
    }
}

/// Response cache policy.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CachePolicy {
    /// Methods eligible for caching.
    #[serde(default = "default_cache_methods")]
    pub methods: Vec<String>,
    #[serde(default = "default_cache_ttl_ms")]
    pub ttl_ms: u64,
    /// Serve-stale window after expiry while a background refresh runs.
    #[serde(default)]
    pub stale_while_revalidate_ms: u64,
    /// Serve-stale window consulted when the upstream answers 5xx.
    #[serde(default)]
    pub stale_if_error_ms: u64,
    /// Headers folded into the fingerprint, sorted and lowercased.
    #[serde(default)]
    pub key_headers: Vec<String>,
    /// Cookies folded into the fingerprint.
    #[serde(default)]
    pub key_cookies: Vec<String>,
    /// Fold a hash of the request body into the fingerprint.
    #[serde(default)]
    pub key_body: bool,
    /// Cache requests carrying `Authorization` (off unless the route opts in).
    #[serde(default)]
    pub allow_authorization: bool,
    /// Static invalidation tags attached to every entry stored by the route.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Response headers whose comma/space-split values become entry tags.
    #[serde(default)]
    pub tag_headers: Vec<String>,
    /// Generate an ETag for cached responses that lack one.
    #[serde(default = "default_true")]
    pub generate_etag: bool,
    #[serde(default)]
    pub mode: LimiterMode,
    #[serde(default = "default_cache_entries")]
    pub max_entries: usize,
    #[serde(default = "default_cache_bytes")]
    pub max_bytes: usize,
}

impl CachePolicy {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.methods.is_empty() {
            return Err("Cache policy must allow at least one method".to_string());
        }
        if self.ttl_ms == 0 {
            return Err("Cache TTL must be greater than 0".to_string());
        }
        if self.max_entries == 0 {
            return Err("Cache max_entries must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Retry budget shared by name across routes.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RetryBudgetPolicy {
    /// Pool name; routes naming the same pool share its state.
    #[serde(default = "default_budget_name")]
    pub name: String,
    /// Maximum retries as a fraction of recent requests.
    #[serde(default = "default_budget_ratio")]
    pub ratio: f64,
    #[serde(default = "default_budget_window_ms")]
    pub window_ms: u64,
    /// Retries per second always admitted regardless of ratio.
    #[serde(default = "default_budget_min_per_sec")]
    pub min_retries_per_sec: u64,
}

impl Default for RetryBudgetPolicy {
    fn default() -> Self {
        Self {
            name: default_budget_name(),
            ratio: default_budget_ratio(),
            window_ms: default_budget_window_ms(),
            min_retries_per_sec: default_budget_min_per_sec(),
        }
    }
}

/// Retry policy for transient upstream failures.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RetryPolicy {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retryable_methods")]
    pub retryable_methods: Vec<String>,
    #[serde(default = "default_retryable_statuses")]
    pub retryable_statuses: Vec<u16>,
    #[serde(default = "default_true")]
    pub retry_on_connection_error: bool,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default)]
    pub budget: Option<RetryBudgetPolicy>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retryable_methods: default_retryable_methods(),
            retryable_statuses: default_retryable_statuses(),
            retry_on_connection_error: true,
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            backoff_multiplier: default_backoff_multiplier(),
            budget: None,
        }
    }
}

impl RetryPolicy {
    /// Backoff before the given attempt (0-based), clamped, without jitter.
    /// The dispatcher applies full jitter on top.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let backoff =
            (self.initial_backoff_ms as f64) * self.backoff_multiplier.powi(attempt as i32);
        Duration::from_millis(backoff.min(self.max_backoff_ms as f64) as u64)
    }

    pub fn method_retryable(&self, method: &str) -> bool {
        self.retryable_methods.iter().any(|m| m == method)
    }

    pub fn status_retryable(&self, status: u16) -> bool {
        self.retryable_statuses.contains(&status)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_retries > 10 {
            return Err("max_retries should not exceed 10 to prevent excessive delays".to_string());
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err("initial_backoff_ms cannot be greater than max_backoff_ms".to_string());
        }
        if self.backoff_multiplier < 1.0 {
            return Err("backoff_multiplier must be >= 1.0".to_string());
        }
        if let Some(budget) = &self.budget {
            if !(0.0..=1.0).contains(&budget.ratio) {
                return Err("Retry budget ratio must be between 0.0 and 1.0".to_string());
            }
            if budget.window_ms == 0 {
                return Err("Retry budget window must be greater than 0".to_string());
            }
        }
        Ok(())
    }
}

/// Hedged requests: overlapping attempts to cut tail latency. Mutually
/// exclusive with the retry policy on the same route.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct HedgePolicy {
    #[serde(default = "default_hedge_requests")]
    pub max_requests: u32,
    /// Stagger between successive hedged attempts.
    #[serde(default = "default_hedge_delay_ms")]
    pub delay_ms: u64,
}

impl HedgePolicy {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.max_requests < 2 {
            return Err("Hedging requires max_requests >= 2".to_string());
        }
        if self.max_requests > 5 {
            return Err("max_requests should not exceed 5 to bound amplification".to_string());
        }
        Ok(())
    }
}

/// Circuit breaker configuration.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CircuitBreakerPolicy {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u64,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u64,
    /// How long the breaker stays open before admitting probes.
    #[serde(default = "default_breaker_timeout_ms")]
    pub timeout_ms: u64,
    /// Concurrent probes admitted while half-open.
    #[serde(default = "default_half_open_probes")]
    pub max_half_open_probes: u64,
    /// Derive an independent breaker per tenant from this rate-limit style
    /// key. `None` keeps one breaker per upstream.
    #[serde(default)]
    pub tenant_key: Option<RateLimitKey>,
}

impl Default for CircuitBreakerPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            timeout_ms: default_breaker_timeout_ms(),
            max_half_open_probes: default_half_open_probes(),
            tenant_key: None,
        }
    }
}

impl CircuitBreakerPolicy {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Outlier detection configuration for passive backend ejection.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct OutlierPolicy {
    #[serde(default = "default_outlier_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_outlier_window_ms")]
    pub window_ms: u64,
    /// Absolute error-rate above which a backend is ejected.
    #[serde(default = "default_error_rate_threshold")]
    pub error_rate_threshold: f64,
    /// Eject when a backend's error rate exceeds this multiple of the pool
    /// median.
    #[serde(default = "default_error_rate_multiplier")]
    pub error_rate_multiplier: f64,
    /// Eject when a backend's p99 latency exceeds this multiple of the pool
    /// median p99.
    #[serde(default = "default_latency_multiplier")]
    pub latency_multiplier: f64,
    #[serde(default = "default_base_ejection_ms")]
    pub base_ejection_ms: u64,
    #[serde(default = "default_max_ejection_ms")]
    pub max_ejection_ms: u64,
    /// Upper bound on the ejected fraction of a pool (0.0 - 1.0).
    #[serde(default = "default_max_ejection_percent")]
    pub max_ejection_percent: f64,
}

impl Default for OutlierPolicy {
    fn default() -> Self {
        Self {
            interval_ms: default_outlier_interval_ms(),
            window_ms: default_outlier_window_ms(),
            error_rate_threshold: default_error_rate_threshold(),
            error_rate_multiplier: default_error_rate_multiplier(),
            latency_multiplier: default_latency_multiplier(),
            base_ejection_ms: default_base_ejection_ms(),
            max_ejection_ms: default_max_ejection_ms(),
            max_ejection_percent: default_max_ejection_percent(),
        }
    }
}

/// How much upstream error detail responses disclose.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorDetailMode {
    /// Generic message per class, gateway-chosen status.
    Default,
    /// Pass the upstream status through, generic message.
    PassStatus,
    /// Include upstream status and message.
    Detailed,
    /// Only the error message, no type or status detail.
    Message,
}

impl Default for ErrorDetailMode {
    fn default() -> Self {
        Self::Default
    }
}

/// Error pages keyed by exact status code, class (`4xx`/`5xx`) or `default`.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ErrorPagePolicy {
    /// Body templates; the key is `"404"`, `"4xx"`, `"5xx"` or `"default"`.
    /// The placeholder `{status}` and `{message}` are substituted at render
    /// time.
    #[serde(default)]
    pub pages: HashMap<String, String>,
    #[serde(default)]
    pub detail_mode: ErrorDetailMode,
}

impl ErrorPagePolicy {
    /// Most specific template for a status: exact code, then class, then
    /// `default`.
    pub fn template_for(&self, status: u16) -> Option<&String> {
        if let Some(t) = self.pages.get(&status.to_string()) {
            return Some(t);
        }
        let class = format!("{}xx", status / 100);
        if let Some(t) = self.pages.get(&class) {
            return Some(t);
        }
        self.pages.get("default")
    }
}

/// Maintenance gate configuration.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct MaintenancePolicy {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_shed_retry_after")]
    pub retry_after_secs: u64,
    /// Paths still served while in maintenance (health probes, typically).
    #[serde(default)]
    pub exempt_paths: Vec<String>,
}

/// Global policy: process-wide defaults overlaid by per-route policies.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct GlobalPolicy {
    /// CIDR blocks of proxies trusted to set `X-Forwarded-For`.
    #[serde(default)]
    pub trusted_proxies: Vec<String>,
    /// Host allow-list applied before routing. Empty allows all hosts.
    #[serde(default)]
    pub allowed_hosts: Vec<String>,
    /// Client addresses rejected at admission.
    #[serde(default)]
    pub blocked_ips: Vec<String>,
    /// Redirect plaintext requests to HTTPS.
    #[serde(default)]
    pub https_redirect: bool,
    /// Ingress body cap in bytes.
    #[serde(default = "default_body_limit")]
    pub max_body_bytes: usize,
    /// Body bytes inspected by route body predicates.
    #[serde(default = "default_match_body_limit")]
    pub max_match_body_size: usize,
    #[serde(default)]
    pub maintenance: MaintenancePolicy,
    #[serde(default)]
    pub rate_limit: Option<RateLimitPolicy>,
    /// Long-window quota defaults; quotas share the rate-limit shape.
    #[serde(default)]
    pub quota: Option<RateLimitPolicy>,
    /// Upstream responses larger than this are rejected at the egress
    /// boundary. `None` disables the check.
    #[serde(default)]
    pub max_response_bytes: Option<usize>,
    #[serde(default)]
    pub cache: Option<CachePolicy>,
    #[serde(default)]
    pub retry: Option<RetryPolicy>,
    #[serde(default)]
    pub load_shed: Option<LoadShedPolicy>,
    #[serde(default)]
    pub adaptive_concurrency: Option<AdaptiveConcurrencyPolicy>,
    #[serde(default)]
    pub error_pages: ErrorPagePolicy,
}

impl GlobalPolicy {
    pub fn validate(&self) -> Result<(), String> {
        for cidr in &self.trusted_proxies {
            crate::utils::net::parse_cidr(cidr)
                .map_err(|e| format!("Invalid trusted proxy CIDR '{}': {}", cidr, e))?;
        }
        for ip in &self.blocked_ips {
            crate::utils::net::parse_cidr(ip)
                .map_err(|e| format!("Invalid blocked IP '{}': {}", ip, e))?;
        }
        if let Some(rl) = &self.rate_limit {
            rl.validate()?;
        }
        if let Some(quota) = &self.quota {
            quota.validate()?;
        }
        if let Some(cache) = &self.cache {
            cache.validate()?;
        }
        if let Some(retry) = &self.retry {
            retry.validate()?;
        }
        if let Some(ac) = &self.adaptive_concurrency {
            ac.validate()?;
        }
        Ok(())
    }
}

fn default_true() -> bool {
    true
}

fn default_period_ms() -> u64 {
    1_000
}

fn default_min_concurrency() -> usize {
    4
}

fn default_max_concurrency() -> usize {
    1_024
}

fn default_latency_tolerance() -> f64 {
    0.5
}

fn default_adjust_interval_ms() -> u64 {
    1_000
}

fn default_smoothing() -> f64 {
    0.2
}

fn default_queue_depth() -> usize {
    128
}

fn default_queue_wait_ms() -> u64 {
    1_000
}

fn default_cpu_threshold() -> f64 {
    0.9
}

fn default_memory_threshold() -> f64 {
    0.9
}

fn default_sample_interval_ms() -> u64 {
    1_000
}

fn default_cooldown_ms() -> u64 {
    5_000
}

fn default_shed_retry_after() -> u64 {
    30
}

fn default_cache_methods() -> Vec<String> {
    vec!["GET".to_string(), "HEAD".to_string()]
}

fn default_cache_ttl_ms() -> u64 {
    60_000
}

fn default_cache_entries() -> usize {
    10_000
}

fn default_cache_bytes() -> usize {
    64 * 1024 * 1024
}

fn default_budget_name() -> String {
    "default".to_string()
}

fn default_budget_ratio() -> f64 {
    0.2
}

fn default_budget_window_ms() -> u64 {
    10_000
}

fn default_budget_min_per_sec() -> u64 {
    1
}

fn default_max_retries() -> u32 {
    3
}

fn default_retryable_methods() -> Vec<String> {
    vec!["GET".to_string(), "HEAD".to_string(), "OPTIONS".to_string()]
}

fn default_retryable_statuses() -> Vec<u16> {
    vec![502, 503, 504]
}

fn default_initial_backoff() -> u64 {
    100
}

fn default_max_backoff() -> u64 {
    5_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_hedge_requests() -> u32 {
    2
}

fn default_hedge_delay_ms() -> u64 {
    20
}

fn default_failure_threshold() -> u64 {
    5
}

fn default_success_threshold() -> u64 {
    3
}

fn default_breaker_timeout_ms() -> u64 {
    30_000
}

fn default_half_open_probes() -> u64 {
    1
}

fn default_outlier_interval_ms() -> u64 {
    5_000
}

fn default_outlier_window_ms() -> u64 {
    30_000
}

fn default_error_rate_threshold() -> f64 {
    0.5
}

fn default_error_rate_multiplier() -> f64 {
    3.0
}

fn default_latency_multiplier() -> f64 {
    3.0
}

fn default_base_ejection_ms() -> u64 {
    10_000
}

fn default_max_ejection_ms() -> u64 {
    300_000
}

fn default_max_ejection_percent() -> f64 {
    0.5
}

fn default_body_limit() -> usize {
    1024 * 1024
}

fn default_match_body_limit() -> usize {
    64 * 1024
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_key_parses_extractor_syntax() {
        let key: RateLimitKey = "header:X-Api-Key".to_string().try_into().unwrap();
        assert_eq!(key, RateLimitKey::Header("X-Api-Key".to_string()));

        let key: RateLimitKey = "jwt_claim:sub".to_string().try_into().unwrap();
        assert_eq!(key, RateLimitKey::JwtClaim("sub".to_string()));

        assert!(RateLimitKey::try_from("header:".to_string()).is_err());
        assert!(RateLimitKey::try_from("bogus".to_string()).is_err());
    }

    #[test]
    fn tier_lookup_falls_back_to_base() {
        let mut tiers = HashMap::new();
        tiers.insert(
            "gold".to_string(),
            RateLimitTier {
                rate: 100,
                period_ms: 1_000,
                burst: Some(200),
            },
        );
        let policy = RateLimitPolicy {
            algorithm: RateLimitAlgorithm::TokenBucket,
            key: RateLimitKey::Ip,
            rate: 10,
            period_ms: 1_000,
            burst: None,
            tiers,
            mode: LimiterMode::Local,
            fail_open: true,
        };

        assert_eq!(policy.tier_for(Some("gold")).rate, 100);
        assert_eq!(policy.tier_for(Some("unknown")).rate, 10);
        assert_eq!(policy.tier_for(None).rate, 10);
    }

    #[test]
    fn backoff_is_clamped() {
        let policy = RetryPolicy {
            initial_backoff_ms: 100,
            max_backoff_ms: 500,
            backoff_multiplier: 2.0,
            ..Default::default()
        };
        assert_eq!(policy.backoff_for(0), Duration::from_millis(100));
        assert_eq!(policy.backoff_for(1), Duration::from_millis(200));
        assert_eq!(policy.backoff_for(4), Duration::from_millis(500));
    }

    #[test]
    fn error_page_specificity() {
        let mut pages = HashMap::new();
        pages.insert("404".to_string(), "gone".to_string());
        pages.insert("4xx".to_string(), "client".to_string());
        pages.insert("default".to_string(), "oops".to_string());
        let policy = ErrorPagePolicy {
            pages,
            detail_mode: ErrorDetailMode::Default,
        };

        assert_eq!(policy.template_for(404).unwrap(), "gone");
        assert_eq!(policy.template_for(400).unwrap(), "client");
        assert_eq!(policy.template_for(502).unwrap(), "oops");
    }

    #[test]
    fn spike_arrest_gap() {
        let policy = SpikeArrestPolicy {
            rate: 10,
            period_ms: 1_000,
            key: RateLimitKey::Ip,
        };
        assert_eq!(policy.min_gap(), Duration::from_millis(100));
    }
}
