//! Route configuration: match criteria, terminal action and per-route
//! policy overlays.
//!
//! A route is matched in two tiers: the path pattern keys tier-1 dispatch,
//! and the predicate set (host, headers, query, cookies, body fields) is
//! evaluated in tier 2 against all candidates sharing a path key. The
//! specificity score orders candidates so the most selective route wins.

use crate::models::policy::{
    CachePolicy, CircuitBreakerPolicy, HedgePolicy, OutlierPolicy, RateLimitPolicy, RetryPolicy,
    SpikeArrestPolicy,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Match criterion applied to one named value (header, query parameter,
/// cookie or body field).
///
/// Exactly one of the three forms is used:
/// - `value`: exact comparison
/// - `present`: `true` requires the key to exist with any value, `false`
///   requires absence
/// - `pattern`: anchored regex, compiled at snapshot build
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ValueMatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub present: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

impl ValueMatch {
    pub fn validate(&self) -> Result<(), String> {
        let forms =
            self.value.is_some() as u8 + self.present.is_some() as u8 + self.pattern.is_some() as u8;
        if forms != 1 {
            return Err(
                "Predicate must use exactly one of value, present or pattern".to_string(),
            );
        }
        if let Some(pattern) = &self.pattern {
            regex::Regex::new(pattern)
                .map_err(|e| format!("Invalid predicate regex '{}': {}", pattern, e))?;
        }
        Ok(())
    }
}

/// Predicate over a named request component.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct KeyPredicate {
    pub name: String,
    #[serde(flatten)]
    pub matcher: ValueMatch,
}

/// Predicate over a request-body field addressed by a dotted JSON path
/// (`user.id`, `items.0.sku`).
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BodyPredicate {
    pub path: String,
    #[serde(flatten)]
    pub matcher: ValueMatch,
}

/// One step of a sequential chain action.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ChainStep {
    /// Named upstream the step dispatches to.
    pub upstream: String,
    /// Path sent to the upstream; `{param}` placeholders and the previous
    /// step's response are available to the rewrite.
    pub path: String,
}

/// One branch of a parallel aggregate action.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct AggregateBranch {
    /// Key under which the branch's response body lands in the merged
    /// object.
    pub name: String,
    pub upstream: String,
    pub path: String,
}

/// What the route does once matched and admitted.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RouteAction {
    /// Forward to a named upstream pool.
    Proxy { upstream: String },
    /// Serve a canned response.
    Mock {
        status: u16,
        #[serde(default)]
        headers: HashMap<String, String>,
        #[serde(default)]
        body: String,
    },
    /// Reflect the request back as JSON (method, path, headers, body).
    Echo,
    /// Serve files under a root directory.
    Static {
        root: String,
        #[serde(default = "default_index")]
        index: String,
    },
    /// Call upstreams one after another; the last response is returned.
    Sequence { steps: Vec<ChainStep> },
    /// Call upstreams concurrently and merge the JSON bodies into one
    /// object keyed by branch name.
    Aggregate { branches: Vec<AggregateBranch> },
}

fn default_index() -> String {
    "index.html".to_string()
}

/// Traffic split group: a fraction of requests diverted to an alternate
/// upstream, keyed for stickiness.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TrafficSplit {
    /// Name recorded in the request context for downstream stages.
    pub group: String,
    /// Alternate upstream receiving the split.
    pub upstream: String,
    /// Fraction of requests in [0.0, 1.0] diverted to the group.
    pub fraction: f64,
}

/// Bypass directive emitted by route rules: skip one stage, optionally
/// asserting that skipping a safety stage is intended.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct BypassDirective {
    /// Directive name, e.g. `skip_cache_store` or `skip_auth`.
    pub directive: String,
    /// Must be set for unsafe directives (`skip_auth`, `skip_body_limit`,
    /// `skip_validation`); ignored otherwise.
    #[serde(default, rename = "unsafe")]
    pub allow_unsafe: bool,
}

/// Authentication requirement for a route.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct RouteAuth {
    /// Provider method names tried in order (`api_key`, `jwt`, ...).
    pub methods: Vec<String>,
    /// Admit the request on provider errors (not on rejected credentials).
    #[serde(default)]
    pub fail_open: bool,
}

/// Header/body transform rules applied by the transform stages.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct TransformRules {
    /// Headers set on the proxied request (response for the response
    /// phase). A `null`-like empty value removes the header.
    #[serde(default)]
    pub set_headers: HashMap<String, String>,
    #[serde(default)]
    pub remove_headers: Vec<String>,
}

/// Configuration for HTTP route dispatch in the portico gateway.
///
/// A route defines how matching requests are admitted, transformed and
/// dispatched, including the predicate set consulted by the matcher and
/// the per-route policy overlays consulted by the stage pipeline.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Route {
    /// Stable identifier, unique within a snapshot.
    pub id: String,

    /// Path pattern: literal (`/api/users`), parameterized
    /// (`/api/users/{id}`) or a prefix when `prefix` is set.
    pub path: String,

    /// Treat `path` as a prefix; `/api` then matches `/api` and `/api/...`.
    #[serde(default)]
    pub prefix: bool,

    /// Allowed methods. Empty means all methods.
    #[serde(default)]
    pub methods: Vec<String>,

    /// Host predicates; multiple hosts combine by OR. Exact
    /// (`api.example.com`) or wildcard (`*.example.com`).
    #[serde(default)]
    pub hosts: Vec<String>,

    /// Header predicates, combined by AND.
    #[serde(default)]
    pub headers: Vec<KeyPredicate>,

    /// Query parameter predicates, combined by AND.
    #[serde(default)]
    pub query: Vec<KeyPredicate>,

    /// Cookie predicates, combined by AND.
    #[serde(default)]
    pub cookies: Vec<KeyPredicate>,

    /// Body field predicates, combined by AND. Only evaluated for bodies
    /// within the match-body-size guard.
    #[serde(default)]
    pub body: Vec<BodyPredicate>,

    /// Terminal action once the request phase completes.
    pub action: RouteAction,

    /// Rewrite template for the upstream path; `{param}` placeholders from
    /// the path pattern are substituted. `None` forwards the request path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rewrite: Option<String>,

    /// Authentication requirement. `None` leaves the route public.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<RouteAuth>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitPolicy>,

    /// Long-window quota; same shape as a rate limit, enforced after the
    /// rest of the admission group.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota: Option<RateLimitPolicy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spike_arrest: Option<SpikeArrestPolicy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<CachePolicy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hedge: Option<HedgePolicy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_breaker: Option<CircuitBreakerPolicy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outlier: Option<OutlierPolicy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub traffic_split: Option<TrafficSplit>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_transform: Option<TransformRules>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_transform: Option<TransformRules>,

    /// Stage bypass directives for this route.
    #[serde(default)]
    pub bypass: Vec<BypassDirective>,

    /// Per-try upstream timeout in milliseconds.
    #[serde(default = "default_upstream_timeout_ms")]
    pub upstream_timeout_ms: u64,

    /// Overall request deadline in milliseconds.
    #[serde(default = "default_deadline_ms")]
    pub deadline_ms: u64,
}

fn default_upstream_timeout_ms() -> u64 {
    30_000
}

fn default_deadline_ms() -> u64 {
    60_000
}

const VALID_METHODS: &[&str] = &[
    "GET", "POST", "PUT", "DELETE", "HEAD", "OPTIONS", "PATCH", "TRACE",
];

impl Route {
    /// Specificity score ordering candidates within a path key.
    ///
    /// Exact host +150, wildcard host +100 (the best host rule counts once),
    /// +10 per header/query/cookie/body predicate, +5 for a non-empty
    /// method set.
    pub fn specificity(&self) -> i32 {
        let mut score = 0;
        if self.hosts.iter().any(|h| !h.starts_with("*.")) {
            score += 150;
        } else if !self.hosts.is_empty() {
            score += 100;
        }
        score += 10 * self.headers.len() as i32;
        score += 10 * self.query.len() as i32;
        score += 10 * self.cookies.len() as i32;
        score += 10 * self.body.len() as i32;
        if !self.methods.is_empty() {
            score += 5;
        }
        score
    }

    /// Whether the method passes the route's method set.
    pub fn allows_method(&self, method: &str) -> bool {
        self.methods.is_empty() || self.methods.iter().any(|m| m == method)
    }

    /// Whether retries are compatible with this route's configuration.
    /// Hedging and retries are mutually exclusive.
    pub fn retries_enabled(&self) -> bool {
        self.retry.is_some() && self.hedge.is_none()
    }

    /// Validates the route configuration for correctness.
    ///
    /// Path shape, method names, predicate forms, regexes, policy ranges
    /// and the retry/hedge exclusion are all checked here so the matcher
    /// never sees an invalid pattern at request time.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.is_empty() {
            return Err("Route id must not be empty".to_string());
        }
        if !self.path.starts_with('/') {
            return Err(format!("Route {}: path must start with '/'", self.id));
        }
        if self.prefix && self.path.contains('{') {
            return Err(format!(
                "Route {}: prefix routes cannot carry {{param}} placeholders",
                self.id
            ));
        }
        validate_placeholders(&self.id, &self.path)?;

        for method in &self.methods {
            if !VALID_METHODS.contains(&method.as_str()) {
                return Err(format!("Route {}: invalid HTTP method: {}", self.id, method));
            }
        }

        for host in &self.hosts {
            let bare = host.strip_prefix("*.").unwrap_or(host);
            if bare.is_empty() || bare.contains('*') || bare.contains('/') {
                return Err(format!("Route {}: invalid host pattern '{}'", self.id, host));
            }
        }

        for pred in self.headers.iter().chain(&self.query).chain(&self.cookies) {
            if pred.name.is_empty() {
                return Err(format!("Route {}: predicate name must not be empty", self.id));
            }
            pred.matcher
                .validate()
                .map_err(|e| format!("Route {}: {}", self.id, e))?;
        }
        for pred in &self.body {
            if pred.path.is_empty() {
                return Err(format!("Route {}: body predicate path must not be empty", self.id));
            }
            pred.matcher
                .validate()
                .map_err(|e| format!("Route {}: {}", self.id, e))?;
        }

        match &self.action {
            RouteAction::Proxy { upstream } if upstream.is_empty() => {
                return Err(format!("Route {}: proxy upstream must be named", self.id));
            }
            RouteAction::Mock { status, .. } => {
                if !(100..=599).contains(status) {
                    return Err(format!("Route {}: invalid mock status {}", self.id, status));
                }
            }
            RouteAction::Static { root, .. } if root.is_empty() => {
                return Err(format!("Route {}: static root must not be empty", self.id));
            }
            RouteAction::Sequence { steps } if steps.is_empty() => {
                return Err(format!("Route {}: sequence needs at least one step", self.id));
            }
            RouteAction::Aggregate { branches } if branches.is_empty() => {
                return Err(format!("Route {}: aggregate needs at least one branch", self.id));
            }
            _ => {}
        }

        if self.retry.is_some() && self.hedge.is_some() {
            return Err(format!(
                "Route {}: retry and hedging are mutually exclusive",
                self.id
            ));
        }
        if let Some(retry) = &self.retry {
            retry.validate().map_err(|e| format!("Route {}: {}", self.id, e))?;
        }
        if let Some(hedge) = &self.hedge {
            hedge.validate().map_err(|e| format!("Route {}: {}", self.id, e))?;
        }
        if let Some(rl) = &self.rate_limit {
            rl.validate().map_err(|e| format!("Route {}: {}", self.id, e))?;
        }
        if let Some(quota) = &self.quota {
            quota.validate().map_err(|e| format!("Route {}: {}", self.id, e))?;
        }
        if let Some(sa) = &self.spike_arrest {
            sa.validate().map_err(|e| format!("Route {}: {}", self.id, e))?;
        }
        if let Some(cache) = &self.cache {
            cache.validate().map_err(|e| format!("Route {}: {}", self.id, e))?;
        }
        if let Some(split) = &self.traffic_split {
            if !(0.0..=1.0).contains(&split.fraction) {
                return Err(format!(
                    "Route {}: traffic split fraction must be in [0, 1]",
                    self.id
                ));
            }
        }

        Ok(())
    }
}

/// Rejects unbalanced or empty `{param}` placeholders.
fn validate_placeholders(id: &str, path: &str) -> Result<(), String> {
    let mut chars = path.chars();
    while let Some(ch) = chars.next() {
        if ch == '}' {
            return Err(format!("Route {}: unbalanced '}}' in path '{}'", id, path));
        }
        if ch == '{' {
            let mut name = String::new();
            let mut closed = false;
            for inner in chars.by_ref() {
                if inner == '}' {
                    closed = true;
                    break;
                }
                if inner.is_alphanumeric() || inner == '_' {
                    name.push(inner);
                } else {
                    return Err(format!(
                        "Route {}: invalid character in placeholder in '{}'",
                        id, path
                    ));
                }
            }
            if !closed || name.is_empty() {
                return Err(format!("Route {}: invalid placeholder in '{}'", id, path));
            }
        }
    }
    Ok(())
}
