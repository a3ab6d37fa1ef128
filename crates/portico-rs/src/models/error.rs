//! Gateway error taxonomy with HTTP response mapping.
//!
//! Every fallible path in the dispatch core reports one of these variants.
//! The variant decides the response status; rendering (content negotiation,
//! error pages, detail disclosure) is handled by the pipeline when the error
//! reaches the egress boundary.

use actix_web::http::StatusCode;
use actix_web::HttpResponse;
use serde_json::json;

/// Coarse error classes used by error-page selection and `fail_open` policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Malformed or oversized client input.
    Client,
    /// Missing, invalid or expired credentials.
    Auth,
    /// A configured policy rejected the request (rate limit, maintenance, ...).
    Policy,
    /// The upstream failed or timed out.
    Upstream,
    /// Cache storage failure. Suppressed by the cache layer; only surfaces
    /// when explicitly propagated.
    Cache,
    /// Route configuration broken post-load. Should be unreachable if
    /// snapshot validation held.
    Config,
    /// Client went away; no response is emitted.
    Cancelled,
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Invalid request: {message}")]
    InvalidRequest { message: String },

    #[error("Request body exceeds limit of {limit} bytes")]
    BodyTooLarge { limit: usize },

    #[error("Request validation failed: {message}")]
    ValidationFailed { message: String },

    #[error("Method {method} not allowed for {path}")]
    MethodNotAllowed { method: String, path: String },

    #[error("No route matches path: {path}")]
    RouteNotFound { path: String },

    #[error("Authentication required")]
    MissingCredentials,

    #[error("Invalid credentials: {reason}")]
    InvalidCredentials { reason: String },

    #[error("Access denied: {reason}")]
    Forbidden { reason: String },

    #[error("Rate limit exceeded")]
    RateLimited { retry_after_secs: u64 },

    #[error("Quota exhausted")]
    QuotaExceeded { retry_after_secs: u64 },

    #[error("Request rate exceeds spike arrest threshold")]
    SpikeArrested { retry_after_secs: u64 },

    #[error("Server is shedding load")]
    LoadShed { retry_after_secs: u64 },

    #[error("Concurrency queue wait exceeded")]
    QueueTimeout { retry_after_secs: u64 },

    #[error("Service is in maintenance mode")]
    Maintenance { retry_after_secs: u64 },

    #[error("Host not allowed: {host}")]
    HostNotAllowed { host: String },

    #[error("Client address is blocked")]
    IpBlocked,

    #[error("Circuit breaker is open for upstream {upstream}")]
    CircuitOpen { upstream: String },

    #[error("No healthy backend available in upstream {upstream}")]
    NoHealthyBackend { upstream: String },

    #[error("Upstream service error: {message}")]
    Upstream {
        message: String,
        url: String,
        status: Option<u16>,
    },

    #[error("Upstream request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Cache storage error: {message}")]
    Cache { message: String },

    #[error("Route misconfigured: {message}")]
    Config { message: String, route: String },

    #[error("Request cancelled by client")]
    Cancelled,
}

impl GatewayError {
    /// The taxonomy class this variant belongs to.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::InvalidRequest { .. }
            | Self::BodyTooLarge { .. }
            | Self::ValidationFailed { .. }
            | Self::MethodNotAllowed { .. }
            | Self::RouteNotFound { .. } => ErrorClass::Client,
            Self::MissingCredentials
            | Self::InvalidCredentials { .. }
            | Self::Forbidden { .. } => ErrorClass::Auth,
            Self::RateLimited { .. }
            | Self::QuotaExceeded { .. }
            | Self::SpikeArrested { .. }
            | Self::LoadShed { .. }
            | Self::QueueTimeout { .. }
            | Self::Maintenance { .. }
            | Self::HostNotAllowed { .. }
            | Self::IpBlocked
            | Self::CircuitOpen { .. } => ErrorClass::Policy,
            Self::NoHealthyBackend { .. } | Self::Upstream { .. } | Self::Timeout { .. } => {
                ErrorClass::Upstream
            }
            Self::Cache { .. } => ErrorClass::Cache,
            Self::Config { .. } => ErrorClass::Config,
            Self::Cancelled => ErrorClass::Cancelled,
        }
    }

    /// HTTP status this error maps to at the egress boundary.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
            Self::BodyTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::ValidationFailed { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
            Self::RouteNotFound { .. } => StatusCode::NOT_FOUND,
            Self::MissingCredentials | Self::InvalidCredentials { .. } => StatusCode::UNAUTHORIZED,
            Self::Forbidden { .. } | Self::IpBlocked => StatusCode::FORBIDDEN,
            Self::RateLimited { .. } | Self::QuotaExceeded { .. } | Self::SpikeArrested { .. } => {
                StatusCode::TOO_MANY_REQUESTS
            }
            Self::LoadShed { .. }
            | Self::QueueTimeout { .. }
            | Self::Maintenance { .. }
            | Self::CircuitOpen { .. }
            | Self::NoHealthyBackend { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::HostNotAllowed { .. } => StatusCode::MISDIRECTED_REQUEST,
            Self::Upstream { .. } => StatusCode::BAD_GATEWAY,
            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::Cache { .. } | Self::Config { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            // Cancelled requests never reach response rendering; the status
            // here only exists so the mapping is total.
            Self::Cancelled => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Retry-After seconds to advertise, when the variant carries one.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Self::RateLimited { retry_after_secs }
            | Self::QuotaExceeded { retry_after_secs }
            | Self::SpikeArrested { retry_after_secs }
            | Self::LoadShed { retry_after_secs }
            | Self::QueueTimeout { retry_after_secs }
            | Self::Maintenance { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        }
    }

    /// Whether the dispatcher may recover this error by retrying another
    /// backend. Only connection-class upstream failures qualify; policy and
    /// client errors never do.
    pub fn is_retryable_connection_error(&self) -> bool {
        matches!(self, Self::Upstream { status: None, .. } | Self::Timeout { .. })
    }

    /// Short machine-readable tag included in structured error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidRequest { .. } => "invalid_request",
            Self::BodyTooLarge { .. } => "body_too_large",
            Self::ValidationFailed { .. } => "validation_failed",
            Self::MethodNotAllowed { .. } => "method_not_allowed",
            Self::RouteNotFound { .. } => "route_not_found",
            Self::MissingCredentials => "missing_credentials",
            Self::InvalidCredentials { .. } => "invalid_credentials",
            Self::Forbidden { .. } => "forbidden",
            Self::RateLimited { .. } => "rate_limited",
            Self::QuotaExceeded { .. } => "quota_exceeded",
            Self::SpikeArrested { .. } => "spike_arrested",
            Self::LoadShed { .. } => "load_shed",
            Self::QueueTimeout { .. } => "queue_timeout",
            Self::Maintenance { .. } => "maintenance",
            Self::HostNotAllowed { .. } => "host_not_allowed",
            Self::IpBlocked => "ip_blocked",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::NoHealthyBackend { .. } => "no_healthy_backend",
            Self::Upstream { .. } => "upstream_error",
            Self::Timeout { .. } => "upstream_timeout",
            Self::Cache { .. } => "cache_error",
            Self::Config { .. } => "config_error",
            Self::Cancelled => "cancelled",
        }
    }
}

impl actix_web::error::ResponseError for GatewayError {
    fn status_code(&self) -> StatusCode {
        self.status()
    }

    fn error_response(&self) -> HttpResponse {
        let mut builder = HttpResponse::build(self.status());
        if let Some(secs) = self.retry_after() {
            builder.insert_header(("Retry-After", secs.to_string()));
        }
        builder.json(json!({
            "error": self.to_string(),
            "type": self.kind(),
        }))
    }
}
