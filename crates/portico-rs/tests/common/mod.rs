//! Shared test fixtures: a programmable fake upstream and builders for
//! settings and requests.

use actix_web::http::header::HeaderMap;
use actix_web::http::{Method, StatusCode};
use async_trait::async_trait;
use bytes::Bytes;
use portico_rs::models::http::{GatewayRequest, GatewayResponse};
use portico_rs::models::route::{Route, RouteAction};
use portico_rs::models::settings::Settings;
use portico_rs::models::upstream::{BackendConfig, LoadBalancingStrategy, UpstreamConfig};
use portico_rs::services::dispatcher::{AttemptError, AttemptRequest, UpstreamClient};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// What a fake backend does when called. Matched by URL prefix
/// (the backend base URL).
#[derive(Debug, Clone)]
pub struct Behavior {
    pub status: u16,
    pub body: String,
    pub delay: Duration,
    /// Simulate a connection-class failure instead of answering.
    pub connection_error: bool,
}

impl Behavior {
    pub fn ok(body: &str) -> Self {
        Self {
            status: 200,
            body: body.to_string(),
            delay: Duration::ZERO,
            connection_error: false,
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            body: String::new(),
            delay: Duration::ZERO,
            connection_error: false,
        }
    }

    pub fn delayed(body: &str, delay: Duration) -> Self {
        Self {
            status: 200,
            body: body.to_string(),
            delay,
            connection_error: false,
        }
    }
}

/// Records every attempt and answers from a per-backend behavior table.
#[derive(Default)]
pub struct FakeUpstream {
    behaviors: Mutex<HashMap<String, Behavior>>,
    calls: Mutex<Vec<String>>,
    total: AtomicUsize,
}

impl FakeUpstream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_behavior(&self, base_url: &str, behavior: Behavior) {
        self.behaviors
            .lock()
            .unwrap()
            .insert(base_url.to_string(), behavior);
    }

    pub fn call_count(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, base_url: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|url| url.starts_with(base_url))
            .count()
    }
}

#[async_trait]
impl UpstreamClient for FakeUpstream {
    async fn send(&self, attempt: AttemptRequest) -> Result<GatewayResponse, AttemptError> {
        self.total.fetch_add(1, Ordering::SeqCst);
        self.calls.lock().unwrap().push(attempt.url.clone());

        let behavior = {
            let behaviors = self.behaviors.lock().unwrap();
            behaviors
                .iter()
                .find(|(base, _)| attempt.url.starts_with(base.as_str()))
                .map(|(_, b)| b.clone())
        }
        .unwrap_or_else(|| Behavior::ok("default"));

        if !behavior.delay.is_zero() {
            tokio::time::sleep(behavior.delay).await;
        }
        if behavior.connection_error {
            return Err(AttemptError::Connection("refused".to_string()));
        }

        Ok(GatewayResponse::with_body(
            StatusCode::from_u16(behavior.status).unwrap(),
            behavior.body,
        ))
    }
}

/// A minimal proxy route; tests overlay policies on the result.
pub fn proxy_route(id: &str, path: &str, upstream: &str) -> Route {
    Route {
        id: id.to_string(),
        path: path.to_string(),
        prefix: false,
        methods: vec![],
        hosts: vec![],
        headers: vec![],
        query: vec![],
        cookies: vec![],
        body: vec![],
        action: RouteAction::Proxy {
            upstream: upstream.to_string(),
        },
        rewrite: None,
        auth: None,
        rate_limit: None,
        quota: None,
        spike_arrest: None,
        cache: None,
        retry: None,
        hedge: None,
        circuit_breaker: None,
        outlier: None,
        traffic_split: None,
        request_transform: None,
        response_transform: None,
        bypass: vec![],
        upstream_timeout_ms: 5_000,
        deadline_ms: 10_000,
    }
}

pub fn upstream(name: &str, backend_urls: &[&str]) -> UpstreamConfig {
    UpstreamConfig {
        name: name.to_string(),
        backends: backend_urls
            .iter()
            .map(|url| BackendConfig {
                url: url.to_string(),
                weight: 1,
            })
            .collect(),
        strategy: LoadBalancingStrategy::RoundRobin,
        hash_key: None,
        ring_replicas: 64,
    }
}

pub fn settings(routes: Vec<Route>, upstreams: Vec<UpstreamConfig>) -> Settings {
    Settings {
        version: 1,
        routes,
        upstreams,
        global: Default::default(),
        jwt: None,
        api_keys: None,
    }
}

pub fn get(host: &str, path: &str) -> GatewayRequest {
    request(Method::GET, host, path, "")
}

pub fn request(method: Method, host: &str, path: &str, query: &str) -> GatewayRequest {
    GatewayRequest {
        method,
        scheme: "http".to_string(),
        host: host.to_string(),
        path: path.to_string(),
        raw_query: query.to_string(),
        headers: HeaderMap::new(),
        body: Bytes::new(),
        peer_addr: Some("10.0.0.1".parse::<IpAddr>().unwrap()),
        tls: false,
    }
}
