//! HTTP ingress: the catch-all proxy route.
//!
//! Converts each actix request into the core's request representation,
//! hands it to the gateway, and writes the resulting response back. A
//! client disconnect drops the handler future, which fires the request's
//! cancellation token so in-flight upstream attempts, hedged siblings and
//! queued waiters abort.

use crate::models::http::{GatewayRequest, GatewayResponse};
use crate::services::http::Gateway;
use actix_web::{web, HttpRequest, HttpResponse};
use log::debug;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Catch-all handler: every path not claimed by the health endpoints
/// lands here.
pub async fn proxy_entry(
    req: HttpRequest,
    body: web::Bytes,
    gateway: web::Data<Arc<Gateway>>,
) -> HttpResponse {
    let gateway_request = to_gateway_request(&req, body);

    let cancel = CancellationToken::new();
    // Dropped without disarm (client went away mid-flight) => cancel
    // propagates to everything the request spawned.
    let guard = cancel.clone().drop_guard();

    match gateway.handle(gateway_request, cancel).await {
        Some(response) => {
            guard.disarm();
            to_http_response(response)
        }
        None => {
            debug!("Request cancelled; no response emitted");
            // The client is gone; actix drops this without writing.
            HttpResponse::RequestTimeout().finish()
        }
    }
}

fn to_gateway_request(req: &HttpRequest, body: web::Bytes) -> GatewayRequest {
    let conn = req.connection_info().clone();
    GatewayRequest {
        method: req.method().clone(),
        scheme: conn.scheme().to_string(),
        host: conn.host().to_string(),
        path: req.path().to_string(),
        raw_query: req.query_string().to_string(),
        headers: req.headers().clone(),
        body,
        peer_addr: req.peer_addr().map(|addr| addr.ip()),
        tls: conn.scheme() == "https",
    }
}

fn to_http_response(resp: GatewayResponse) -> HttpResponse {
    let mut builder = HttpResponse::build(resp.status);
    for (name, value) in resp.headers.iter() {
        // Hop-by-hop headers never cross the egress boundary.
        if name.as_str().starts_with("connection") {
            continue;
        }
        builder.append_header((name.clone(), value.clone()));
    }
    builder.body(resp.body)
}

/// Mounts the catch-all proxy route.
pub fn configure_proxy(cfg: &mut web::ServiceConfig, gateway: Arc<Gateway>) {
    cfg.app_data(web::Data::new(gateway))
        .default_service(web::route().to(proxy_entry));
}
