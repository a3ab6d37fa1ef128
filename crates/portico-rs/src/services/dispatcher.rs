//! Upstream dispatch: terminal actions, retries, hedging and breaker
//! admission.
//!
//! One dispatch executes the matched route's terminal action. For proxy
//! actions it selects a backend via the pool's load-balancer policy,
//! issues attempts with per-try deadlines, consults the retry budget and
//! backoff between attempts (excluding the backend just used), or races
//! staggered hedged attempts when the route prefers hedging. Attempt
//! outcomes feed the backend EWMA, the outlier detector and the circuit
//! breaker.
//!
//! The HTTP client sits behind [`UpstreamClient`] so the whole engine is
//! exercisable in tests without sockets.

use crate::models::error::GatewayError;
use crate::models::http::{GatewayRequest, GatewayResponse};
use crate::models::policy::{RateLimitKey, RetryPolicy};
use crate::models::route::{AggregateBranch, ChainStep, Route, RouteAction};
use crate::models::upstream::{Backend, UpstreamPool};
use crate::pipeline::context::RequestContext;
use crate::pipeline::effective_retry;
use crate::services::circuit_breaker::BreakerRegistry;
use crate::services::load_balancer::{extract_hash_key, LoadBalancer, LoadBalancerFactory};
use crate::services::outlier::OutlierDetector;
use crate::services::rate_limit::extract_key;
use crate::services::retry::BudgetRegistry;
use crate::utils::path::{apply_rewrite, join_target_url};
use actix_web::http::header::{HeaderMap, HeaderName, HeaderValue};
use actix_web::http::{Method, StatusCode};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::FuturesUnordered;
use futures_util::StreamExt;
use log::{debug, warn};
use rand::Rng;
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use thiserror::Error;

/// One upstream attempt as handed to the client.
#[derive(Debug, Clone)]
pub struct AttemptRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub timeout: Duration,
}

/// Connection-class attempt failures, distinguished from HTTP statuses.
#[derive(Error, Debug)]
pub enum AttemptError {
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("attempt timed out")]
    Timeout,
}

/// Transport abstraction for upstream calls.
#[async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn send(&self, attempt: AttemptRequest) -> Result<GatewayResponse, AttemptError>;
}

/// Production client over a pooled reqwest instance.
pub struct HttpUpstreamClient {
    client: reqwest::Client,
}

impl HttpUpstreamClient {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(32)
            .build()
            .expect("Failed to create HTTP client");
        Self { client }
    }
}

impl Default for HttpUpstreamClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UpstreamClient for HttpUpstreamClient {
    async fn send(&self, attempt: AttemptRequest) -> Result<GatewayResponse, AttemptError> {
        let method = reqwest::Method::from_bytes(attempt.method.as_str().as_bytes())
            .map_err(|e| AttemptError::Connection(e.to_string()))?;

        let mut headers = reqwest::header::HeaderMap::with_capacity(attempt.headers.len());
        for (name, value) in attempt.headers.iter() {
            if let (Ok(name), Ok(value)) = (
                reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes()),
                reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
            ) {
                headers.append(name, value);
            }
        }

        let response = self
            .client
            .request(method, &attempt.url)
            .headers(headers)
            .body(attempt.body.to_vec())
            .timeout(attempt.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    AttemptError::Timeout
                } else {
                    AttemptError::Connection(e.to_string())
                }
            })?;

        let status = StatusCode::from_u16(response.status().as_u16())
            .unwrap_or(StatusCode::BAD_GATEWAY);
        let mut out_headers = HeaderMap::new();
        for (name, value) in response.headers() {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_str().as_bytes()),
                HeaderValue::from_bytes(value.as_bytes()),
            ) {
                out_headers.append(name, value);
            }
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| AttemptError::Connection(e.to_string()))?;

        Ok(GatewayResponse {
            status,
            headers: out_headers,
            body,
        })
    }
}

/// Decrements a backend's active counter on drop so cancelled and hedged
/// attempts release their slot.
struct ActiveGuard(Arc<Backend>);

impl ActiveGuard {
    fn new(backend: Arc<Backend>) -> Self {
        backend.begin_request();
        Self(backend)
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.end_request();
    }
}

/// Outcome of one proxy attempt, before retry classification.
enum AttemptOutcome {
    Response(GatewayResponse),
    Failed(GatewayError),
}

/// The upstream dispatcher. Holds the process-lifetime collaborators
/// (budget pools, breaker registry, per-pool balancers and outlier
/// detectors) and the transport client.
pub struct Dispatcher {
    client: Arc<dyn UpstreamClient>,
    budgets: Arc<BudgetRegistry>,
    breakers: Arc<BreakerRegistry>,
    balancers: RwLock<HashMap<String, Arc<dyn LoadBalancer>>>,
    outliers: RwLock<HashMap<String, Arc<OutlierDetector>>>,
}

impl Dispatcher {
    pub fn new(
        client: Arc<dyn UpstreamClient>,
        budgets: Arc<BudgetRegistry>,
        breakers: Arc<BreakerRegistry>,
    ) -> Self {
        Self {
            client,
            budgets,
            breakers,
            balancers: RwLock::new(HashMap::new()),
            outliers: RwLock::new(HashMap::new()),
        }
    }

    /// Executes the route's terminal action.
    pub async fn dispatch(
        &self,
        ctx: &mut RequestContext,
        req: &GatewayRequest,
    ) -> Result<GatewayResponse, GatewayError> {
        if ctx.is_cancelled() {
            return Err(GatewayError::Cancelled);
        }
        let route = ctx.route.clone();
        match &route.action {
            RouteAction::Proxy { upstream } => {
                let name = ctx
                    .upstream_override
                    .clone()
                    .unwrap_or_else(|| upstream.clone());
                self.dispatch_proxy(ctx, req, &route, &name).await
            }
            RouteAction::Mock {
                status,
                headers,
                body,
            } => Ok(mock_response(*status, headers, body)),
            RouteAction::Echo => Ok(echo_response(ctx, req)),
            RouteAction::Static { root, index } => {
                serve_static(&route, req, root, index).await
            }
            RouteAction::Sequence { steps } => self.dispatch_sequence(ctx, req, &route, steps).await,
            RouteAction::Aggregate { branches } => {
                self.dispatch_aggregate(ctx, req, &route, branches).await
            }
        }
    }

    /// Proxy dispatch with breaker admission and retry or hedging.
    async fn dispatch_proxy(
        &self,
        ctx: &mut RequestContext,
        req: &GatewayRequest,
        route: &Route,
        upstream_name: &str,
    ) -> Result<GatewayResponse, GatewayError> {
        let pool = ctx.snapshot.upstream(upstream_name).ok_or_else(|| {
            GatewayError::Config {
                message: format!("upstream '{}' not in bound snapshot", upstream_name),
                route: route.id.clone(),
            }
        })?;

        // Circuit breaker admission, per upstream or per resolved tenant.
        let permit = match &route.circuit_breaker {
            Some(policy) => {
                let tenant = policy
                    .tenant_key
                    .as_ref()
                    .map(|key: &RateLimitKey| extract_key(key, req, ctx));
                let breaker = self
                    .breakers
                    .get(upstream_name, tenant.as_deref(), policy);
                match breaker.try_acquire() {
                    Some(permit) => Some(permit),
                    None => {
                        return Err(GatewayError::CircuitOpen {
                            upstream: upstream_name.to_string(),
                        })
                    }
                }
            }
            None => None,
        };

        let result = if let Some(hedge) = &route.hedge {
            self.run_hedged(ctx, req, route, &pool, hedge.max_requests, hedge.delay())
                .await
        } else {
            self.run_with_retries(ctx, req, route, &pool).await
        };

        if let Some(permit) = permit {
            match &result {
                Ok(resp) if resp.status.is_server_error() => permit.record_failure(),
                Ok(_) => permit.record_success(),
                Err(GatewayError::Cancelled) => drop(permit),
                Err(_) => permit.record_failure(),
            }
        }

        result
    }

    /// Classic attempt loop: one initial attempt plus budgeted retries
    /// with full-jitter backoff, reselecting a different backend when the
    /// pool allows it.
    async fn run_with_retries(
        &self,
        ctx: &RequestContext,
        req: &GatewayRequest,
        route: &Route,
        pool: &Arc<UpstreamPool>,
    ) -> Result<GatewayResponse, GatewayError> {
        let retry = effective_retry(route, ctx.snapshot.global_policy());
        let budget = retry
            .and_then(|r| r.budget.as_ref())
            .map(|b| self.budgets.get(b));
        if let Some(budget) = &budget {
            budget.record_request();
        }

        let max_retries = retry.map(|r| r.max_retries).unwrap_or(0);
        let mut last_backend: Option<String> = None;
        let mut last_error: Option<GatewayError> = None;
        let mut last_response: Option<GatewayResponse> = None;

        for attempt in 0..=max_retries {
            if attempt > 0 {
                let retry = retry.expect("retries imply a policy");
                if !self.retry_permitted(ctx, req, retry, &budget, attempt) {
                    break;
                }
                let backoff = full_jitter(retry.backoff_for(attempt - 1));
                if backoff >= ctx.remaining() {
                    debug!("Deadline leaves no room for backoff; giving up retries");
                    break;
                }
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = ctx.cancel.cancelled() => return Err(GatewayError::Cancelled),
                }
            }

            let backend = match self.select_backend(ctx, req, pool, last_backend.as_deref()) {
                Some(backend) => backend,
                None => {
                    return Err(GatewayError::NoHealthyBackend {
                        upstream: pool.name.clone(),
                    })
                }
            };
            last_backend = Some(backend.url.clone());

            match self.attempt_on(ctx, req, route, pool, backend).await {
                Ok(resp) => {
                    let retryable_status = retry
                        .map(|r| r.status_retryable(resp.status.as_u16()))
                        .unwrap_or(false);
                    if retryable_status && attempt < max_retries {
                        // Keep the response: exhausted retries pass the
                        // upstream's last answer through unchanged.
                        last_response = Some(resp);
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err @ GatewayError::Cancelled) => return Err(err),
                Err(err) => {
                    let conn_retryable = retry
                        .map(|r| r.retry_on_connection_error && err.is_retryable_connection_error())
                        .unwrap_or(false);
                    if conn_retryable && attempt < max_retries {
                        last_error = Some(err);
                        continue;
                    }
                    return Err(err);
                }
            }
        }

        if let Some(resp) = last_response {
            return Ok(resp);
        }
        Err(last_error.unwrap_or_else(|| GatewayError::NoHealthyBackend {
            upstream: pool.name.clone(),
        }))
    }

    /// Gate for one more retry: retryable method, replayable body, budget
    /// headroom and deadline room.
    fn retry_permitted(
        &self,
        ctx: &RequestContext,
        req: &GatewayRequest,
        retry: &RetryPolicy,
        budget: &Option<Arc<crate::services::retry::RetryBudget>>,
        attempt: u32,
    ) -> bool {
        if !retry.method_retryable(req.method.as_str()) {
            debug!("Method {} not retryable", req.method);
            return false;
        }
        // Bodies are buffered at ingress, so replayability reduces to the
        // buffer being intact (it always is) -- nothing to check beyond
        // existence.
        if ctx.remaining().is_zero() {
            return false;
        }
        if let Some(budget) = budget {
            if !budget.try_acquire_retry() {
                debug!("Retry budget exhausted at attempt {}", attempt);
                return false;
            }
        }
        true
    }

    /// Hedged dispatch: staggered attempts racing for the first decisive
    /// outcome. Losing siblings are dropped (their futures abort and
    /// release backend slots) before the winner is returned.
    async fn run_hedged(
        &self,
        ctx: &RequestContext,
        req: &GatewayRequest,
        route: &Route,
        pool: &Arc<UpstreamPool>,
        max_requests: u32,
        delay: Duration,
    ) -> Result<GatewayResponse, GatewayError> {
        let mut inflight = FuturesUnordered::new();
        let mut launched: u32 = 0;
        let mut used: Vec<String> = Vec::new();
        let mut last_error: Option<GatewayError> = None;

        // First attempt launches immediately.
        match self.start_attempt(ctx, req, route, pool, &used) {
            Some((future, backend_url)) => {
                used.push(backend_url);
                inflight.push(future);
                launched += 1;
            }
            None => {
                return Err(GatewayError::NoHealthyBackend {
                    upstream: pool.name.clone(),
                })
            }
        }

        loop {
            let hedge_timer = tokio::time::sleep(delay);
            tokio::pin!(hedge_timer);

            tokio::select! {
                _ = ctx.cancel.cancelled() => return Err(GatewayError::Cancelled),
                outcome = inflight.next() => match outcome {
                    // Hedging is mutually exclusive with retries, so no
                    // retryable-status list is in scope here: "first
                    // non-retryable outcome wins" means any completed HTTP
                    // response wins the race, and only connection-class
                    // failures (the Failed arm) count as retryable losses.
                    Some(AttemptOutcome::Response(resp)) => return Ok(resp),
                    Some(AttemptOutcome::Failed(err)) => {
                        last_error = Some(err);
                        if inflight.is_empty() && launched >= max_requests {
                            return Err(last_error.take().expect("error recorded"));
                        }
                        // A failed sibling frees room for an immediate hedge.
                        if launched < max_requests {
                            if let Some((future, backend_url)) =
                                self.start_attempt(ctx, req, route, pool, &used)
                            {
                                used.push(backend_url);
                                inflight.push(future);
                                launched += 1;
                            }
                        }
                    }
                    None => {
                        return Err(last_error.take().unwrap_or_else(|| {
                            GatewayError::NoHealthyBackend {
                                upstream: pool.name.clone(),
                            }
                        }))
                    }
                },
                _ = &mut hedge_timer, if launched < max_requests => {
                    if let Some((future, backend_url)) =
                        self.start_attempt(ctx, req, route, pool, &used)
                    {
                        used.push(backend_url);
                        inflight.push(future);
                        launched += 1;
                    }
                }
            }
        }
    }

    /// Builds one attempt future for hedging. Selection happens eagerly so
    /// each sibling pins a distinct backend where possible.
    fn start_attempt<'a>(
        &'a self,
        ctx: &'a RequestContext,
        req: &'a GatewayRequest,
        route: &'a Route,
        pool: &Arc<UpstreamPool>,
        used: &[String],
    ) -> Option<(
        std::pin::Pin<Box<dyn std::future::Future<Output = AttemptOutcome> + Send + 'a>>,
        String,
    )> {
        let exclude = used.last().map(|s| s.as_str());
        let backend = self.select_backend(ctx, req, pool, exclude)?;
        let backend_url = backend.url.clone();
        let pool = pool.clone();
        let future = Box::pin(async move {
            match self.attempt_on(ctx, req, route, &pool, backend).await {
                Ok(resp) => AttemptOutcome::Response(resp),
                Err(err) => AttemptOutcome::Failed(err),
            }
        });
        Some((future, backend_url))
    }

    fn select_backend(
        &self,
        ctx: &RequestContext,
        req: &GatewayRequest,
        pool: &Arc<UpstreamPool>,
        exclude: Option<&str>,
    ) -> Option<Arc<Backend>> {
        let candidates = pool.selectable();
        let hash_key = extract_hash_key(pool, req, ctx);
        self.balancer_for(pool)
            .select(&candidates, exclude, hash_key.as_deref())
    }

    /// Issues the HTTP attempt with the per-try deadline, recording
    /// latency, EWMA and outlier samples.
    async fn attempt_on(
        &self,
        ctx: &RequestContext,
        req: &GatewayRequest,
        route: &Route,
        pool: &Arc<UpstreamPool>,
        backend: Arc<Backend>,
    ) -> Result<GatewayResponse, GatewayError> {
        let _active = ActiveGuard::new(backend.clone());

        let path = route
            .rewrite
            .as_deref()
            .map(|template| apply_rewrite(template, &ctx.path_params))
            .unwrap_or_else(|| req.path.clone());
        let url = join_target_url(&backend.url, &path, &req.raw_query);

        let per_try = Duration::from_millis(route.upstream_timeout_ms).min(ctx.remaining());
        if per_try.is_zero() {
            return Err(GatewayError::Timeout {
                timeout_ms: route.upstream_timeout_ms,
            });
        }

        let attempt = AttemptRequest {
            method: req.method.clone(),
            url: url.clone(),
            headers: forward_headers(ctx, req),
            body: req.body.clone(),
            timeout: per_try,
        };

        debug!("Forwarding request to: {}", url);
        let started = Instant::now();
        let outcome = tokio::select! {
            outcome = self.client.send(attempt) => outcome,
            _ = ctx.cancel.cancelled() => return Err(GatewayError::Cancelled),
        };
        let elapsed = started.elapsed();

        backend.record_latency(elapsed);
        let ok = matches!(&outcome, Ok(resp) if !resp.status.is_server_error());
        if let Some(outlier) = self.outlier_for(route, pool) {
            outlier.record(pool, &backend.url, ok, elapsed);
        }

        match outcome {
            Ok(resp) => Ok(resp),
            Err(AttemptError::Timeout) => Err(GatewayError::Timeout {
                timeout_ms: per_try.as_millis() as u64,
            }),
            Err(AttemptError::Connection(message)) => {
                warn!("Attempt to {} failed: {}", url, message);
                Err(GatewayError::Upstream {
                    message,
                    url,
                    status: None,
                })
            }
        }
    }

    /// Sequential chain: steps run in order; the final response is the
    /// route's response. Step bodies forward the original request body.
    async fn dispatch_sequence(
        &self,
        ctx: &mut RequestContext,
        req: &GatewayRequest,
        route: &Route,
        steps: &[ChainStep],
    ) -> Result<GatewayResponse, GatewayError> {
        let mut last = None;
        for step in steps {
            if ctx.is_cancelled() {
                return Err(GatewayError::Cancelled);
            }
            let pool = ctx.snapshot.upstream(&step.upstream).ok_or_else(|| {
                GatewayError::Config {
                    message: format!("upstream '{}' not in bound snapshot", step.upstream),
                    route: route.id.clone(),
                }
            })?;
            let backend =
                self.select_backend(ctx, req, &pool, None)
                    .ok_or_else(|| GatewayError::NoHealthyBackend {
                        upstream: pool.name.clone(),
                    })?;
            let _active = ActiveGuard::new(backend.clone());

            let path = apply_rewrite(&step.path, &ctx.path_params);
            let url = join_target_url(&backend.url, &path, "");
            let per_try = Duration::from_millis(route.upstream_timeout_ms).min(ctx.remaining());
            let attempt = AttemptRequest {
                method: req.method.clone(),
                url: url.clone(),
                headers: forward_headers(ctx, req),
                body: req.body.clone(),
                timeout: per_try,
            };

            let started = Instant::now();
            let resp = tokio::select! {
                outcome = self.client.send(attempt) => outcome,
                _ = ctx.cancel.cancelled() => return Err(GatewayError::Cancelled),
            }
            .map_err(|e| match e {
                AttemptError::Timeout => GatewayError::Timeout {
                    timeout_ms: per_try.as_millis() as u64,
                },
                AttemptError::Connection(message) => GatewayError::Upstream {
                    message,
                    url,
                    status: None,
                },
            })?;
            backend.record_latency(started.elapsed());
            last = Some(resp);
        }
        last.ok_or_else(|| GatewayError::Config {
            message: "sequence action with no steps".to_string(),
            route: route.id.clone(),
        })
    }

    /// Parallel aggregate: all branches dispatch concurrently inside the
    /// request's scope; bodies merge into one JSON object keyed by branch
    /// name. A failed branch fails the request after siblings finish.
    async fn dispatch_aggregate(
        &self,
        ctx: &mut RequestContext,
        req: &GatewayRequest,
        route: &Route,
        branches: &[AggregateBranch],
    ) -> Result<GatewayResponse, GatewayError> {
        let mut tasks = Vec::new();
        for branch in branches {
            let pool = ctx.snapshot.upstream(&branch.upstream).ok_or_else(|| {
                GatewayError::Config {
                    message: format!("upstream '{}' not in bound snapshot", branch.upstream),
                    route: route.id.clone(),
                }
            })?;
            let backend =
                self.select_backend(ctx, req, &pool, None)
                    .ok_or_else(|| GatewayError::NoHealthyBackend {
                        upstream: pool.name.clone(),
                    })?;
            let path = apply_rewrite(&branch.path, &ctx.path_params);
            let url = join_target_url(&backend.url, &path, "");
            let per_try = Duration::from_millis(route.upstream_timeout_ms).min(ctx.remaining());
            let attempt = AttemptRequest {
                method: Method::GET,
                url: url.clone(),
                headers: forward_headers(ctx, req),
                body: Bytes::new(),
                timeout: per_try,
            };
            let name = branch.name.clone();
            let client = self.client.clone();
            tasks.push(async move {
                let _active = ActiveGuard::new(backend);
                let outcome = client.send(attempt).await;
                (name, url, outcome)
            });
        }

        let joined = tokio::select! {
            joined = futures::future::join_all(tasks) => joined,
            _ = ctx.cancel.cancelled() => return Err(GatewayError::Cancelled),
        };

        let mut merged = serde_json::Map::new();
        for (name, url, outcome) in joined {
            let resp = outcome.map_err(|e| GatewayError::Upstream {
                message: e.to_string(),
                url,
                status: None,
            })?;
            let value = serde_json::from_slice(&resp.body).unwrap_or_else(|_| {
                serde_json::Value::String(String::from_utf8_lossy(&resp.body).into_owned())
            });
            merged.insert(name, value);
        }

        Ok(GatewayResponse::json(
            StatusCode::OK,
            &serde_json::Value::Object(merged),
        ))
    }

    /// Per-pool balancer, created on first use so counters persist across
    /// requests for the pool's lifetime.
    fn balancer_for(&self, pool: &UpstreamPool) -> Arc<dyn LoadBalancer> {
        if let Some(balancer) = self
            .balancers
            .read()
            .expect("balancer lock poisoned")
            .get(&pool.name)
        {
            return balancer.clone();
        }
        let mut map = self.balancers.write().expect("balancer lock poisoned");
        map.entry(pool.name.clone())
            .or_insert_with(|| LoadBalancerFactory::create(&pool.strategy, pool.ring_replicas))
            .clone()
    }

    fn outlier_for(&self, route: &Route, pool: &UpstreamPool) -> Option<Arc<OutlierDetector>> {
        let policy = route.outlier.as_ref()?;
        if let Some(detector) = self
            .outliers
            .read()
            .expect("outlier lock poisoned")
            .get(&pool.name)
        {
            return Some(detector.clone());
        }
        let mut map = self.outliers.write().expect("outlier lock poisoned");
        Some(
            map.entry(pool.name.clone())
                .or_insert_with(|| Arc::new(OutlierDetector::new(policy.clone())))
                .clone(),
        )
    }
}

/// Full jitter: uniform in [0, backoff].
fn full_jitter(backoff: Duration) -> Duration {
    if backoff.is_zero() {
        return backoff;
    }
    let millis = backoff.as_millis() as u64;
    Duration::from_millis(rand::thread_rng().gen_range(0..=millis))
}

/// Headers forwarded upstream: hop-by-hop and host headers dropped,
/// forwarding headers appended.
fn forward_headers(ctx: &RequestContext, req: &GatewayRequest) -> HeaderMap {
    const SKIP: &[&str] = &[
        "host",
        "connection",
        "keep-alive",
        "upgrade",
        "proxy-connection",
        "transfer-encoding",
        "te",
        "trailer",
    ];

    let mut headers = HeaderMap::with_capacity(req.headers.len() + 2);
    for (name, value) in req.headers.iter() {
        if SKIP.contains(&name.as_str()) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    if let Some(ip) = ctx.client_ip {
        if let Ok(value) = HeaderValue::from_str(&ip.to_string()) {
            headers.insert(HeaderName::from_static("x-forwarded-for"), value);
        }
    }
    if let Ok(value) = HeaderValue::from_str(&ctx.request_id.to_string()) {
        headers.insert(HeaderName::from_static("x-request-id"), value);
    }
    if !headers.contains_key(actix_web::http::header::USER_AGENT) {
        headers.insert(
            actix_web::http::header::USER_AGENT,
            HeaderValue::from_static(concat!("portico-rs/", env!("CARGO_PKG_VERSION"))),
        );
    }
    headers
}

fn mock_response(
    status: u16,
    headers: &HashMap<String, String>,
    body: &str,
) -> GatewayResponse {
    let mut resp = GatewayResponse::with_body(
        StatusCode::from_u16(status).unwrap_or(StatusCode::OK),
        body.to_string(),
    );
    for (name, value) in headers {
        resp.set_header(name, value);
    }
    resp
}

fn echo_response(ctx: &RequestContext, req: &GatewayRequest) -> GatewayResponse {
    let headers: serde_json::Map<String, serde_json::Value> = req
        .headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), json!(v)))
        })
        .collect();
    GatewayResponse::json(
        StatusCode::OK,
        &json!({
            "method": req.method.as_str(),
            "path": req.path,
            "query": req.raw_query,
            "params": ctx.path_params,
            "headers": headers,
            "body": String::from_utf8_lossy(&req.body),
        }),
    )
}

/// Serves a file beneath the static root. The request path relative to
/// the route's prefix selects the file; directory requests get the index.
async fn serve_static(
    route: &Route,
    req: &GatewayRequest,
    root: &str,
    index: &str,
) -> Result<GatewayResponse, GatewayError> {
    let base = route.path.trim_end_matches('/');
    let rel = req
        .path
        .strip_prefix(base)
        .unwrap_or("")
        .trim_start_matches('/');
    let rel = if rel.is_empty() { index } else { rel };

    // Reject traversal before touching the filesystem.
    if rel.split('/').any(|seg| seg == "..") {
        return Err(GatewayError::InvalidRequest {
            message: "path traversal rejected".to_string(),
        });
    }

    let full = std::path::Path::new(root).join(rel);
    match tokio::fs::read(&full).await {
        Ok(contents) => {
            let mut resp = GatewayResponse::with_body(StatusCode::OK, contents);
            resp.set_header("content-type", content_type_for_path(&full));
            Ok(resp)
        }
        Err(_) => Err(GatewayError::RouteNotFound {
            path: req.path.clone(),
        }),
    }
}

fn content_type_for_path(path: &std::path::Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") => "text/html; charset=utf-8",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("svg") => "image/svg+xml",
        Some("txt") => "text/plain; charset=utf-8",
        _ => "application/octet-stream",
    }
}
