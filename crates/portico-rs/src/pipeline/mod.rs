//! Stage pipeline: kinds, canonical ordering and per-route compilation.
//!
//! Stage kinds form a closed sum type; the canonical request-phase order
//! is a compile-time table, not a user-orderable list. A route's compiled
//! stage list is the subsequence of the canonical order whose stages are
//! activated by the route's and the global policy's configuration.
//!
//! Execution semantics: request-phase stages run in table order, any may
//! short-circuit with a synthetic response or fail with a typed error;
//! response-phase handlers run in reverse order over the stages that had
//! already entered the pipeline.

pub mod context;
pub mod stages;

use crate::models::error::{ErrorClass, GatewayError};
use crate::models::http::GatewayResponse;
use crate::models::policy::{
    AdaptiveConcurrencyPolicy, CachePolicy, ErrorDetailMode, ErrorPagePolicy, GlobalPolicy,
    LoadShedPolicy, RateLimitPolicy, RetryPolicy,
};
use crate::models::route::Route;
use actix_web::http::StatusCode;
use serde_json::json;

/// Closed set of stage kinds, one variant per concern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    AccessLog,
    TrustedProxy,
    AllowedHosts,
    HttpsRedirect,
    IpBlocklist,
    BodyLimit,
    Maintenance,
    RateLimit,
    SpikeArrest,
    LoadShed,
    AdaptiveConcurrency,
    Quota,
    Auth,
    Idempotency,
    Cache,
    RequestValidation,
    Transform,
    TrafficSplit,
    ResponseHeaders,
    ResponseSizeLimit,
}

/// Canonical request-phase execution order. Stages absent from a route's
/// configuration are simply not compiled in; the relative order of the
/// rest never changes.
pub const REQUEST_ORDER: &[StageKind] = &[
    // Always-on response shaping enters first so its response-phase
    // handlers run for every outcome, including early short-circuits.
    StageKind::AccessLog,
    StageKind::ResponseHeaders,
    StageKind::TrustedProxy,
    StageKind::AllowedHosts,
    StageKind::HttpsRedirect,
    StageKind::IpBlocklist,
    StageKind::BodyLimit,
    StageKind::Maintenance,
    // Admission sub-order is fixed: rate-limit, spike-arrest, load-shed,
    // adaptive-concurrency, quota.
    StageKind::RateLimit,
    StageKind::SpikeArrest,
    StageKind::LoadShed,
    StageKind::AdaptiveConcurrency,
    StageKind::Quota,
    StageKind::Auth,
    StageKind::Idempotency,
    StageKind::Cache,
    StageKind::RequestValidation,
    StageKind::Transform,
    StageKind::TrafficSplit,
    // Entered last so its response-phase check runs first on the way out.
    StageKind::ResponseSizeLimit,
];

impl StageKind {
    /// The `skip_<stage>` directive controlling this stage.
    pub fn directive(&self) -> &'static str {
        match self {
            Self::AccessLog => "skip_access_log",
            Self::TrustedProxy => "skip_trusted_proxy",
            Self::AllowedHosts => "skip_allowed_hosts",
            Self::HttpsRedirect => "skip_https_redirect",
            Self::IpBlocklist => "skip_ip_blocklist",
            Self::BodyLimit => "skip_body_limit",
            Self::Maintenance => "skip_maintenance",
            Self::LoadShed => "skip_load_shed",
            Self::SpikeArrest => "skip_spike_arrest",
            Self::RateLimit => "skip_rate_limit",
            Self::AdaptiveConcurrency => "skip_adaptive_concurrency",
            Self::Quota => "skip_quota",
            Self::Auth => "skip_auth",
            Self::Idempotency => "skip_idempotency",
            Self::Cache => "skip_cache",
            Self::RequestValidation => "skip_validation",
            Self::Transform => "skip_transform",
            Self::TrafficSplit => "skip_traffic_split",
            Self::ResponseHeaders => "skip_response_headers",
            Self::ResponseSizeLimit => "skip_response_size_limit",
        }
    }
}

/// Outcome of a request-phase stage.
pub enum StageOutcome {
    Continue,
    /// Synthesize a response and switch to the response phase.
    ShortCircuit(GatewayResponse),
    Fail(GatewayError),
}

/// Outcome of a response-phase handler.
pub enum ResponseOutcome {
    Continue,
    Replace(GatewayResponse),
    Fail(GatewayError),
}

/// Effective cache policy: route overlay, then global default.
pub fn effective_cache<'a>(route: &'a Route, global: &'a GlobalPolicy) -> Option<&'a CachePolicy> {
    route.cache.as_ref().or(global.cache.as_ref())
}

/// Effective rate-limit policy: route overlay, then global default.
pub fn effective_rate_limit<'a>(
    route: &'a Route,
    global: &'a GlobalPolicy,
) -> Option<&'a RateLimitPolicy> {
    route.rate_limit.as_ref().or(global.rate_limit.as_ref())
}

/// Effective quota policy. Quotas are rate limits over long windows and
/// share the policy shape.
pub fn effective_quota<'a>(
    route: &'a Route,
    global: &'a GlobalPolicy,
) -> Option<&'a RateLimitPolicy> {
    route.quota.as_ref().or(global.quota.as_ref())
}

/// Effective retry policy. Hedging disables retries entirely.
pub fn effective_retry<'a>(route: &'a Route, global: &'a GlobalPolicy) -> Option<&'a RetryPolicy> {
    if route.hedge.is_some() {
        return None;
    }
    route.retry.as_ref().or(global.retry.as_ref())
}

pub fn effective_load_shed(global: &GlobalPolicy) -> Option<&LoadShedPolicy> {
    global.load_shed.as_ref()
}

pub fn effective_adaptive(global: &GlobalPolicy) -> Option<&AdaptiveConcurrencyPolicy> {
    global.adaptive_concurrency.as_ref()
}

/// Compiles the stage list for one route against the global policy.
///
/// The result is immutable post-compilation and stored on the snapshot.
pub fn compile_stages(route: &Route, global: &GlobalPolicy) -> Vec<StageKind> {
    REQUEST_ORDER
        .iter()
        .copied()
        .filter(|kind| match kind {
            StageKind::AccessLog => true,
            StageKind::TrustedProxy => !global.trusted_proxies.is_empty(),
            StageKind::AllowedHosts => !global.allowed_hosts.is_empty(),
            StageKind::HttpsRedirect => global.https_redirect,
            StageKind::IpBlocklist => !global.blocked_ips.is_empty(),
            StageKind::BodyLimit => true,
            StageKind::Maintenance => global.maintenance.enabled,
            StageKind::LoadShed => global.load_shed.is_some(),
            StageKind::SpikeArrest => route.spike_arrest.is_some(),
            StageKind::RateLimit => effective_rate_limit(route, global).is_some(),
            StageKind::AdaptiveConcurrency => global.adaptive_concurrency.is_some(),
            StageKind::Quota => effective_quota(route, global).is_some(),
            StageKind::Auth => route.auth.is_some(),
            StageKind::Idempotency => effective_cache(route, global).is_some(),
            StageKind::Cache => effective_cache(route, global).is_some(),
            StageKind::RequestValidation => true,
            StageKind::Transform => {
                route.request_transform.is_some() || route.response_transform.is_some()
            }
            StageKind::TrafficSplit => route.traffic_split.is_some(),
            StageKind::ResponseHeaders => true,
            StageKind::ResponseSizeLimit => global.max_response_bytes.is_some(),
        })
        .collect()
}

/// Renders a gateway error into the user-visible response, honoring the
/// error-page templates, the detail mode and the `Accept` header.
pub fn render_error(
    err: &GatewayError,
    accept: Option<&str>,
    policy: &ErrorPagePolicy,
) -> GatewayResponse {
    let status = match (policy.detail_mode, err) {
        (ErrorDetailMode::PassStatus | ErrorDetailMode::Detailed, GatewayError::Upstream {
            status: Some(code),
            ..
        }) => StatusCode::from_u16(*code).unwrap_or_else(|_| err.status()),
        _ => err.status(),
    };

    let message = match policy.detail_mode {
        ErrorDetailMode::Detailed | ErrorDetailMode::Message => err.to_string(),
        _ => generic_message(err.class()),
    };

    let mut resp = if let Some(template) = policy.template_for(status.as_u16()) {
        let body = template
            .replace("{status}", &status.as_u16().to_string())
            .replace("{message}", &message);
        let mut resp = GatewayResponse::with_body(status, body);
        resp.set_header("content-type", content_type_for(accept));
        resp
    } else {
        match negotiated_format(accept) {
            ErrorFormat::Html => {
                let body = format!(
                    "<!DOCTYPE html><html><head><title>{status}</title></head>\
                     <body><h1>{status}</h1><p>{message}</p></body></html>",
                    status = status.as_u16(),
                    message = message,
                );
                let mut resp = GatewayResponse::with_body(status, body);
                resp.set_header("content-type", "text/html; charset=utf-8");
                resp
            }
            ErrorFormat::Xml => {
                let body = format!(
                    "<?xml version=\"1.0\"?><error><status>{}</status><message>{}</message></error>",
                    status.as_u16(),
                    message,
                );
                let mut resp = GatewayResponse::with_body(status, body);
                resp.set_header("content-type", "application/xml");
                resp
            }
            ErrorFormat::Json => {
                let mut body = json!({
                    "error": message,
                    "type": err.kind(),
                });
                if policy.detail_mode == ErrorDetailMode::Message {
                    body = json!({ "error": message });
                }
                GatewayResponse::json(status, &body)
            }
        }
    };

    if let Some(secs) = err.retry_after() {
        resp.set_header("retry-after", &secs.to_string());
    }
    resp
}

fn generic_message(class: ErrorClass) -> String {
    match class {
        ErrorClass::Client => "Invalid request".to_string(),
        ErrorClass::Auth => "Authentication failed".to_string(),
        ErrorClass::Policy => "Request rejected by gateway policy".to_string(),
        ErrorClass::Upstream => "Upstream service unavailable".to_string(),
        ErrorClass::Cache | ErrorClass::Config => "Internal gateway error".to_string(),
        ErrorClass::Cancelled => "Request cancelled".to_string(),
    }
}

enum ErrorFormat {
    Json,
    Html,
    Xml,
}

fn negotiated_format(accept: Option<&str>) -> ErrorFormat {
    let Some(accept) = accept else {
        return ErrorFormat::Json;
    };
    let accept = accept.to_ascii_lowercase();
    if accept.contains("text/html") {
        ErrorFormat::Html
    } else if accept.contains("application/xml") || accept.contains("text/xml") {
        ErrorFormat::Xml
    } else {
        ErrorFormat::Json
    }
}

fn content_type_for(accept: Option<&str>) -> &'static str {
    match negotiated_format(accept) {
        ErrorFormat::Html => "text/html; charset=utf-8",
        ErrorFormat::Xml => "application/xml",
        ErrorFormat::Json => "application/json",
    }
}
