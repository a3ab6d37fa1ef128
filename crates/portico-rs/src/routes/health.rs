//! Health check endpoints for monitoring and orchestrator probes.

use actix_web::{web, HttpResponse, Result};
use serde_json::json;

/// General health check with service metadata.
///
/// Returns `200 OK` with status, version, timestamp and the currently
/// published configuration version.
pub async fn health_check(
    gateway: web::Data<std::sync::Arc<crate::services::http::Gateway>>,
) -> Result<HttpResponse> {
    Ok(HttpResponse::Ok().json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "config_version": gateway.publisher().current().version(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    })))
}

/// Kubernetes readiness probe. Ready once a snapshot is published, which
/// is guaranteed after construction, so this is a constant 200.
pub async fn readiness_check() -> Result<HttpResponse> {
    Ok(HttpResponse::Ok().json(json!({
        "status": "ready",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    })))
}

/// Kubernetes liveness probe.
pub async fn liveness_check() -> Result<HttpResponse> {
    Ok(HttpResponse::Ok().json(json!({
        "status": "alive",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    })))
}

/// Mounts the health endpoints.
pub fn configure_health(cfg: &mut web::ServiceConfig) {
    cfg.route("/health", web::get().to(health_check))
        .route("/health/ready", web::get().to(readiness_check))
        .route("/health/live", web::get().to(liveness_check));
}
