//! Stage implementations behind the closed [`StageKind`] dispatch.
//!
//! Each kind has a request-phase handler and a response-phase handler;
//! kinds without work in a phase fall through to `Continue`. Handlers get
//! the shared gateway components, the mutable request context and the
//! request (mutable in the request phase so transforms can rewrite it).

use crate::models::error::GatewayError;
use crate::models::http::{GatewayRequest, GatewayResponse};
use crate::pipeline::context::RequestContext;
use crate::pipeline::{
    effective_cache, effective_quota, effective_rate_limit, ResponseOutcome, StageKind,
    StageOutcome,
};
use crate::services::cache::{
    fingerprint, is_cacheable, FlightError, FlightRole, Fingerprint, Freshness, SingleFlight,
};
use crate::services::http::Gateway;
use crate::services::rate_limit::extract_key;
use crate::utils::net::{any_contains, resolve_client_ip};
use crate::utils::path::apply_rewrite;
use actix_web::http::StatusCode;
use log::{debug, info, warn};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Runs one stage's request-phase handler.
pub async fn on_request(
    kind: StageKind,
    gw: &Gateway,
    ctx: &mut RequestContext,
    req: &mut GatewayRequest,
) -> StageOutcome {
    match kind {
        StageKind::AccessLog => StageOutcome::Continue,
        StageKind::TrustedProxy => trusted_proxy(ctx, req),
        StageKind::AllowedHosts => allowed_hosts(ctx, req),
        StageKind::HttpsRedirect => https_redirect(req),
        StageKind::IpBlocklist => ip_blocklist(ctx),
        StageKind::BodyLimit => body_limit(ctx, req),
        StageKind::Maintenance => maintenance(ctx, req),
        StageKind::LoadShed => load_shed(gw),
        StageKind::SpikeArrest => spike_arrest(gw, ctx, req),
        StageKind::RateLimit => rate_limit(gw, ctx, req).await,
        StageKind::AdaptiveConcurrency => adaptive_concurrency(gw, ctx).await,
        StageKind::Quota => quota(gw, ctx, req).await,
        StageKind::Auth => auth(gw, ctx, req).await,
        StageKind::Idempotency => idempotency_lookup(gw, ctx, req).await,
        StageKind::Cache => cache_lookup(gw, ctx, req).await,
        StageKind::RequestValidation => request_validation(req),
        StageKind::Transform => {
            transform_request(ctx, req);
            StageOutcome::Continue
        }
        StageKind::TrafficSplit => traffic_split(ctx, req),
        StageKind::ResponseHeaders => StageOutcome::Continue,
        StageKind::ResponseSizeLimit => StageOutcome::Continue,
    }
}

/// Runs one stage's response-phase handler.
pub async fn on_response(
    kind: StageKind,
    gw: &Gateway,
    ctx: &mut RequestContext,
    req: &GatewayRequest,
    resp: &mut GatewayResponse,
) -> ResponseOutcome {
    match kind {
        StageKind::AccessLog => access_log(ctx, req, resp),
        StageKind::AdaptiveConcurrency => {
            if let Some(adaptive) = gw.adaptive() {
                adaptive.record_latency(ctx.started.elapsed());
            }
            ResponseOutcome::Continue
        }
        StageKind::Idempotency => idempotency_store(gw, ctx, resp).await,
        StageKind::Cache => cache_store(gw, ctx, req, resp).await,
        StageKind::Transform => {
            transform_response(ctx, resp);
            ResponseOutcome::Continue
        }
        StageKind::ResponseHeaders => response_headers(ctx, req, resp),
        StageKind::ResponseSizeLimit => response_size_limit(ctx, resp),
        _ => ResponseOutcome::Continue,
    }
}

fn trusted_proxy(ctx: &mut RequestContext, req: &GatewayRequest) -> StageOutcome {
    ctx.client_ip = resolve_client_ip(
        ctx.client_ip,
        req.header("x-forwarded-for"),
        ctx.snapshot.trusted_cidrs(),
    );
    StageOutcome::Continue
}

fn allowed_hosts(ctx: &RequestContext, req: &GatewayRequest) -> StageOutcome {
    let host = req.host_without_port();
    let allowed = ctx.snapshot.global_policy().allowed_hosts.iter().any(|h| {
        let h = h.to_ascii_lowercase();
        match h.strip_prefix("*.") {
            Some(suffix) => host.ends_with(&format!(".{}", suffix)),
            None => host == h,
        }
    });
    if allowed {
        StageOutcome::Continue
    } else {
        StageOutcome::Fail(GatewayError::HostNotAllowed { host: req.host.clone() })
    }
}

fn https_redirect(req: &GatewayRequest) -> StageOutcome {
    if req.tls || req.scheme == "https" {
        return StageOutcome::Continue;
    }
    let mut location = format!("https://{}{}", req.host, req.path);
    if !req.raw_query.is_empty() {
        location.push('?');
        location.push_str(&req.raw_query);
    }
    let mut resp = GatewayResponse::new(StatusCode::MOVED_PERMANENTLY);
    resp.set_header("location", &location);
    StageOutcome::ShortCircuit(resp)
}

fn ip_blocklist(ctx: &RequestContext) -> StageOutcome {
    match ctx.client_ip {
        Some(ip) if any_contains(ctx.snapshot.blocked_cidrs(), &ip) => {
            StageOutcome::Fail(GatewayError::IpBlocked)
        }
        _ => StageOutcome::Continue,
    }
}

fn body_limit(ctx: &RequestContext, req: &GatewayRequest) -> StageOutcome {
    let limit = ctx.snapshot.global_policy().max_body_bytes;
    if req.body.len() > limit {
        StageOutcome::Fail(GatewayError::BodyTooLarge { limit })
    } else {
        StageOutcome::Continue
    }
}

fn maintenance(ctx: &RequestContext, req: &GatewayRequest) -> StageOutcome {
    let policy = &ctx.snapshot.global_policy().maintenance;
    if policy.exempt_paths.iter().any(|p| p == &req.path) {
        return StageOutcome::Continue;
    }
    StageOutcome::Fail(GatewayError::Maintenance {
        retry_after_secs: policy.retry_after_secs,
    })
}

fn load_shed(gw: &Gateway) -> StageOutcome {
    let Some(shedder) = gw.shedder() else {
        return StageOutcome::Continue;
    };
    let in_flight = gw.adaptive().map(|a| a.in_flight()).unwrap_or(0);
    if shedder.is_shedding(in_flight) {
        StageOutcome::Fail(GatewayError::LoadShed {
            retry_after_secs: shedder.retry_after_secs(),
        })
    } else {
        StageOutcome::Continue
    }
}

fn spike_arrest(gw: &Gateway, ctx: &RequestContext, req: &GatewayRequest) -> StageOutcome {
    let Some(policy) = ctx.route.spike_arrest.as_ref() else {
        return StageOutcome::Continue;
    };
    let key = extract_key(&policy.key, req, ctx);
    let decision = gw.arrester().check(&ctx.route.id, &key, policy);
    match decision {
        crate::services::rate_limit::LimitDecision::Allowed => StageOutcome::Continue,
        crate::services::rate_limit::LimitDecision::Limited { retry_after_secs } => {
            StageOutcome::Fail(GatewayError::SpikeArrested { retry_after_secs })
        }
    }
}

async fn rate_limit(gw: &Gateway, ctx: &RequestContext, req: &GatewayRequest) -> StageOutcome {
    let Some(policy) = effective_rate_limit(&ctx.route, ctx.snapshot.global_policy()) else {
        return StageOutcome::Continue;
    };
    let key = extract_key(&policy.key, req, ctx);
    let tier = ctx.rate_tier();
    let decision = gw
        .limiter()
        .check(&ctx.route.id, &key, policy, tier.as_deref())
        .await;
    match decision {
        crate::services::rate_limit::LimitDecision::Allowed => StageOutcome::Continue,
        crate::services::rate_limit::LimitDecision::Limited { retry_after_secs } => {
            debug!("Rate limit exceeded for {} on route {}", key, ctx.route.id);
            StageOutcome::Fail(GatewayError::RateLimited { retry_after_secs })
        }
    }
}

/// Long-window quota check, after the rest of the admission group.
async fn quota(gw: &Gateway, ctx: &RequestContext, req: &GatewayRequest) -> StageOutcome {
    let Some(policy) = effective_quota(&ctx.route, ctx.snapshot.global_policy()) else {
        return StageOutcome::Continue;
    };
    let key = extract_key(&policy.key, req, ctx);
    let scope = format!("quota:{}", ctx.route.id);
    let decision = gw
        .limiter()
        .check(&scope, &key, policy, ctx.rate_tier().as_deref())
        .await;
    match decision {
        crate::services::rate_limit::LimitDecision::Allowed => StageOutcome::Continue,
        crate::services::rate_limit::LimitDecision::Limited { retry_after_secs } => {
            debug!("Quota exhausted for {} on route {}", key, ctx.route.id);
            StageOutcome::Fail(GatewayError::QuotaExceeded { retry_after_secs })
        }
    }
}

async fn adaptive_concurrency(gw: &Gateway, ctx: &mut RequestContext) -> StageOutcome {
    let Some(adaptive) = gw.adaptive() else {
        return StageOutcome::Continue;
    };
    let acquire = adaptive.acquire();
    tokio::pin!(acquire);
    let permit = tokio::select! {
        permit = &mut acquire => permit,
        _ = ctx.cancel.cancelled() => return StageOutcome::Fail(GatewayError::Cancelled),
    };
    match permit {
        Ok(permit) => {
            ctx.concurrency_permit = Some(permit);
            StageOutcome::Continue
        }
        Err(err) => StageOutcome::Fail(err),
    }
}

async fn auth(gw: &Gateway, ctx: &mut RequestContext, req: &GatewayRequest) -> StageOutcome {
    let Some(auth) = ctx.route.auth.as_ref() else {
        return StageOutcome::Continue;
    };
    match gw.auth().authenticate(&auth.methods, req).await {
        Ok(identity) => {
            if let Some(claim) = gw.jwt_tier_claim() {
                if let Some(tier) = identity.tier(claim) {
                    ctx.scratch.insert("rate_tier".to_string(), tier);
                }
            }
            ctx.scratch
                .insert("client_id".to_string(), identity.client_id.clone());
            ctx.identity = Some(identity);
            StageOutcome::Continue
        }
        Err(err) => {
            // fail_open only forgives provider failures, never rejected
            // credentials.
            let provider_failure = matches!(err, GatewayError::Config { .. });
            if auth.fail_open && provider_failure {
                warn!(
                    "Auth provider failure on route {}; fail_open admits the request: {}",
                    ctx.route.id, err
                );
                StageOutcome::Continue
            } else {
                StageOutcome::Fail(err)
            }
        }
    }
}

const IDEMPOTENCY_HEADER: &str = "idempotency-key";

fn idempotency_fingerprint(route_id: &str, key: &str) -> Fingerprint {
    Fingerprint(format!("idem:{}:{}", route_id, key))
}

/// Replays a stored response for repeated idempotency keys on mutating
/// methods.
async fn idempotency_lookup(
    gw: &Gateway,
    ctx: &mut RequestContext,
    req: &GatewayRequest,
) -> StageOutcome {
    if !matches!(req.method.as_str(), "POST" | "PUT" | "PATCH" | "DELETE") {
        return StageOutcome::Continue;
    }
    let Some(key) = req.header(IDEMPOTENCY_HEADER) else {
        return StageOutcome::Continue;
    };
    let Some(policy) = effective_cache(&ctx.route, ctx.snapshot.global_policy()).cloned() else {
        return StageOutcome::Continue;
    };
    let fp = idempotency_fingerprint(&ctx.route.id, key);
    if let Some(entry) = gw.cache().lookup(&fp).await {
        if entry.freshness(&policy) == Freshness::Fresh {
            debug!("Idempotent replay for key {} on route {}", key, ctx.route.id);
            let mut resp = entry.to_response();
            resp.set_header("x-idempotent-replay", "true");
            ctx.served_from_cache = true;
            return StageOutcome::ShortCircuit(resp);
        }
    }
    ctx.scratch
        .insert("idempotency_key".to_string(), key.to_string());
    StageOutcome::Continue
}

async fn idempotency_store(
    gw: &Gateway,
    ctx: &mut RequestContext,
    resp: &GatewayResponse,
) -> ResponseOutcome {
    let Some(key) = ctx.scratch.get("idempotency_key").cloned() else {
        return ResponseOutcome::Continue;
    };
    let Some(policy) = effective_cache(&ctx.route, ctx.snapshot.global_policy()) else {
        return ResponseOutcome::Continue;
    };
    let fp = idempotency_fingerprint(&ctx.route.id, &key);
    gw.cache().store_response(&fp, resp, policy).await;
    ResponseOutcome::Continue
}

/// Cache lookup: fresh hits and 304s short-circuit, stale entries within
/// the revalidation window are served while a background refresh runs,
/// and misses join the fingerprint's single-flight.
async fn cache_lookup(
    gw: &Gateway,
    ctx: &mut RequestContext,
    req: &GatewayRequest,
) -> StageOutcome {
    let Some(policy) = effective_cache(&ctx.route, ctx.snapshot.global_policy()).cloned() else {
        return StageOutcome::Continue;
    };
    if !is_cacheable(req, &policy) {
        return StageOutcome::Continue;
    }

    let final_path = ctx
        .route
        .rewrite
        .as_deref()
        .map(|t| apply_rewrite(t, &ctx.path_params))
        .unwrap_or_else(|| req.path.clone());
    let fp = fingerprint(req, &final_path, &policy);
    ctx.cache_key = Some(fp.clone());

    if let Some(entry) = gw.cache().lookup(&fp).await {
        match entry.freshness(&policy) {
            Freshness::Fresh => {
                if let Some(not_modified) = entry.conditional_response(req) {
                    ctx.served_from_cache = true;
                    return StageOutcome::ShortCircuit(not_modified);
                }
                let mut resp = entry.to_response();
                resp.set_header("x-cache", "hit");
                resp.set_header("age", &(entry.age_ms() / 1_000).to_string());
                ctx.served_from_cache = true;
                return StageOutcome::ShortCircuit(resp);
            }
            Freshness::StaleRevalidatable => {
                gw.spawn_cache_refresh(ctx, req.clone(), fp.clone(), policy.clone());
                let mut resp = entry.to_response();
                resp.set_header("x-cache", "stale");
                resp.set_header("age", &(entry.age_ms() / 1_000).to_string());
                ctx.served_from_cache = true;
                return StageOutcome::ShortCircuit(resp);
            }
            Freshness::StaleOnError | Freshness::Expired => {}
        }
    }

    // Miss: coalesce concurrent peers onto one upstream call.
    loop {
        match gw.cache().join_flight(&fp) {
            FlightRole::Leader(guard) => {
                ctx.flight = Some(guard);
                return StageOutcome::Continue;
            }
            FlightRole::Follower(rx) => {
                let waited = tokio::select! {
                    result = SingleFlight::await_result(rx) => result,
                    _ = ctx.cancel.cancelled() => return StageOutcome::Fail(GatewayError::Cancelled),
                };
                match waited {
                    Ok(shared) => {
                        let mut resp = (*shared).clone();
                        resp.set_header("x-cache", "coalesced");
                        ctx.served_from_cache = true;
                        return StageOutcome::ShortCircuit(resp);
                    }
                    Err(FlightError::Upstream(message)) => {
                        return StageOutcome::Fail(GatewayError::Upstream {
                            message,
                            url: String::new(),
                            status: None,
                        });
                    }
                    // Leader cancelled before resolving: take over.
                    Err(FlightError::Cancelled) => continue,
                }
            }
        }
    }
}

/// Cache store: publishes the single-flight result, applies
/// stale-if-error fallback for upstream 5xx, and stores success
/// responses.
async fn cache_store(
    gw: &Gateway,
    ctx: &mut RequestContext,
    req: &GatewayRequest,
    resp: &mut GatewayResponse,
) -> ResponseOutcome {
    let Some(policy) = effective_cache(&ctx.route, ctx.snapshot.global_policy()).cloned() else {
        return ResponseOutcome::Continue;
    };
    let Some(fp) = ctx.cache_key.clone() else {
        return ResponseOutcome::Continue;
    };

    // Resolve followers before anything else so they are not held across
    // the store.
    if let Some(guard) = ctx.flight.take() {
        if resp.status.is_server_error() {
            guard.publish(Err(FlightError::Upstream(format!(
                "upstream answered {}",
                resp.status
            ))));
        } else {
            guard.publish(Ok(Arc::new(resp.clone())));
        }
    }

    if ctx.served_from_cache {
        return ResponseOutcome::Continue;
    }

    // stale-if-error: a 5xx with a usable stale entry serves the entry.
    if resp.status.is_server_error() && policy.stale_if_error_ms > 0 {
        if let Some(entry) = gw.cache().lookup(&fp).await {
            if entry.usable_on_error(&policy) {
                info!(
                    "Serving stale cache entry for {} after upstream {}",
                    fp, resp.status
                );
                let mut stale = entry.to_response();
                stale.set_header("x-cache", "stale-if-error");
                return ResponseOutcome::Replace(stale);
            }
        }
        return ResponseOutcome::Continue;
    }

    if ctx.skipped("skip_cache_store") {
        return ResponseOutcome::Continue;
    }
    if !is_cacheable(req, &policy) {
        return ResponseOutcome::Continue;
    }

    gw.cache().store_response(&fp, resp, &policy).await;

    // Surface the validators we just stored, plus downstream-CDN cache
    // headers when the origin set none.
    if resp.status.is_success() {
        if policy.generate_etag && resp.header("etag").is_none() {
            let entry = crate::services::cache::entry_from_response(resp, &policy);
            if let Some(etag) = entry.etag {
                resp.set_header("etag", &etag);
            }
        }
        if resp.header("cache-control").is_none() {
            resp.set_header(
                "cache-control",
                &format!("public, max-age={}", policy.ttl_ms / 1_000),
            );
        }
        resp.set_header("x-cache", "miss");
    }
    ResponseOutcome::Continue
}

fn request_validation(req: &GatewayRequest) -> StageOutcome {
    let is_json = req
        .header("content-type")
        .map(|ct| ct.to_ascii_lowercase().contains("application/json"))
        .unwrap_or(false);
    if is_json && !req.body.is_empty() {
        if let Err(e) = serde_json::from_slice::<serde_json::Value>(&req.body) {
            return StageOutcome::Fail(GatewayError::ValidationFailed {
                message: format!("request body is not valid JSON: {}", e),
            });
        }
    }
    StageOutcome::Continue
}

fn transform_request(ctx: &RequestContext, req: &mut GatewayRequest) {
    let Some(rules) = ctx.route.request_transform.as_ref() else {
        return;
    };
    for name in &rules.remove_headers {
        if let Ok(name) = actix_web::http::header::HeaderName::from_bytes(name.as_bytes()) {
            req.headers.remove(name);
        }
    }
    for (name, value) in &rules.set_headers {
        if let (Ok(name), Ok(value)) = (
            actix_web::http::header::HeaderName::from_bytes(name.as_bytes()),
            actix_web::http::header::HeaderValue::from_str(value),
        ) {
            req.headers.insert(name, value);
        }
    }
}

fn transform_response(ctx: &RequestContext, resp: &mut GatewayResponse) {
    let Some(rules) = ctx.route.response_transform.as_ref() else {
        return;
    };
    for name in &rules.remove_headers {
        if let Ok(name) = actix_web::http::header::HeaderName::from_bytes(name.as_bytes()) {
            resp.headers.remove(name);
        }
    }
    for (name, value) in &rules.set_headers {
        resp.set_header(name, value);
    }
}

/// Sticky traffic split: the client IP (or a random draw for anonymous
/// clients) hashes into [0, 1); draws under the fraction divert to the
/// split upstream.
fn traffic_split(ctx: &mut RequestContext, _req: &GatewayRequest) -> StageOutcome {
    let Some(split) = ctx.route.traffic_split.as_ref() else {
        return StageOutcome::Continue;
    };
    let draw = match ctx.client_ip {
        Some(ip) => {
            let mut hasher = DefaultHasher::new();
            ip.hash(&mut hasher);
            ctx.route.id.hash(&mut hasher);
            (hasher.finish() % 10_000) as f64 / 10_000.0
        }
        None => rand::random::<f64>(),
    };
    if draw < split.fraction {
        ctx.scratch
            .insert("traffic_group".to_string(), split.group.clone());
        ctx.upstream_override = Some(split.upstream.clone());
    }
    StageOutcome::Continue
}

/// Rejects upstream responses larger than the configured cap. Entered
/// last in the request phase, so this runs first on the way out.
fn response_size_limit(ctx: &RequestContext, resp: &GatewayResponse) -> ResponseOutcome {
    let Some(limit) = ctx.snapshot.global_policy().max_response_bytes else {
        return ResponseOutcome::Continue;
    };
    if resp.body.len() > limit {
        warn!(
            "Upstream response of {} bytes exceeds the {} byte cap on route {}",
            resp.body.len(),
            limit,
            ctx.route.id
        );
        return ResponseOutcome::Fail(GatewayError::Upstream {
            message: format!("upstream response exceeded {} bytes", limit),
            url: String::new(),
            status: None,
        });
    }
    ResponseOutcome::Continue
}

fn response_headers(
    ctx: &RequestContext,
    req: &GatewayRequest,
    resp: &mut GatewayResponse,
) -> ResponseOutcome {
    resp.set_header("x-request-id", &ctx.request_id.to_string());
    resp.set_header("x-content-type-options", "nosniff");
    resp.set_header("x-frame-options", "DENY");
    resp.set_header("referrer-policy", "strict-origin-when-cross-origin");
    if req.tls {
        resp.set_header(
            "strict-transport-security",
            "max-age=31536000; includeSubDomains",
        );
    }
    ResponseOutcome::Continue
}

fn access_log(
    ctx: &RequestContext,
    req: &GatewayRequest,
    resp: &GatewayResponse,
) -> ResponseOutcome {
    info!(
        "{} {} {} -> {} ({}ms) client={} route={} id={}",
        req.method,
        req.path,
        if req.raw_query.is_empty() { "-" } else { &req.raw_query },
        resp.status.as_u16(),
        ctx.started.elapsed().as_millis(),
        ctx.client_ip
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| "-".to_string()),
        ctx.route.id,
        ctx.request_id,
    );
    // Audit trail for authenticated actions, on its own log target so it
    // can be routed separately.
    if let Some(identity) = &ctx.identity {
        info!(
            target: "portico::audit",
            "client={} method={} route={} path={} status={} id={}",
            identity.client_id,
            req.method,
            ctx.route.id,
            req.path,
            resp.status.as_u16(),
            ctx.request_id,
        );
    }
    ResponseOutcome::Continue
}
