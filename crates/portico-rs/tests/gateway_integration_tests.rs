//! End-to-end dispatch scenarios through the full pipeline.

mod common;

use common::*;
use portico_rs::models::policy::{RateLimitAlgorithm, RateLimitKey, RateLimitPolicy};
use portico_rs::models::route::RouteAction;
use portico_rs::services::http::Gateway;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn gateway_with(
    routes: Vec<portico_rs::models::route::Route>,
    upstreams: Vec<portico_rs::models::upstream::UpstreamConfig>,
) -> (Arc<Gateway>, Arc<FakeUpstream>) {
    let fake = Arc::new(FakeUpstream::new());
    let gateway = Gateway::with_parts(settings(routes, upstreams), fake.clone(), None).unwrap();
    (gateway, fake)
}

#[tokio::test]
async fn exact_host_routes_to_b1_wildcard_to_b2() {
    let mut r1 = proxy_route("exact", "/ping", "pool-b1");
    r1.hosts = vec!["api.example.com".to_string()];
    let mut r2 = proxy_route("wild", "/ping", "pool-b2");
    r2.hosts = vec!["*.example.com".to_string()];

    let (gateway, fake) = gateway_with(
        vec![r2, r1], // declaration order must not matter; specificity wins
        vec![
            upstream("pool-b1", &["http://b1:8080"]),
            upstream("pool-b2", &["http://b2:8080"]),
        ],
    );
    fake.set_behavior("http://b1:8080", Behavior::ok("from-b1"));
    fake.set_behavior("http://b2:8080", Behavior::ok("from-b2"));

    let resp = gateway
        .handle(get("api.example.com", "/ping"), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(resp.status.as_u16(), 200);
    assert_eq!(resp.body.as_ref(), b"from-b1");

    let resp = gateway
        .handle(get("web.example.com", "/ping"), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(resp.body.as_ref(), b"from-b2");

    assert_eq!(fake.calls_to("http://b1:8080"), 1);
    assert_eq!(fake.calls_to("http://b2:8080"), 1);
}

#[tokio::test]
async fn unmatched_path_renders_404_without_upstream_call() {
    let (gateway, fake) = gateway_with(
        vec![proxy_route("only", "/known", "pool")],
        vec![upstream("pool", &["http://b:1"])],
    );

    let resp = gateway
        .handle(get("x", "/unknown"), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(resp.status.as_u16(), 404);
    assert_eq!(fake.call_count(), 0);
}

#[tokio::test]
async fn method_mismatch_renders_405() {
    let mut route = proxy_route("r", "/thing", "pool");
    route.methods = vec!["GET".to_string()];
    let (gateway, _fake) = gateway_with(vec![route], vec![upstream("pool", &["http://b:1"])]);

    let req = request(actix_web::http::Method::POST, "x", "/thing", "");
    let resp = gateway.handle(req, CancellationToken::new()).await.unwrap();
    assert_eq!(resp.status.as_u16(), 405);
}

#[tokio::test]
async fn token_bucket_limits_third_request_from_same_ip() {
    let mut route = proxy_route("limited", "/api", "pool");
    route.rate_limit = Some(RateLimitPolicy {
        algorithm: RateLimitAlgorithm::TokenBucket,
        key: RateLimitKey::Ip,
        rate: 2,
        period_ms: 1_000,
        burst: Some(2),
        tiers: Default::default(),
        mode: Default::default(),
        fail_open: true,
    });
    let (gateway, fake) = gateway_with(vec![route], vec![upstream("pool", &["http://b:1"])]);
    fake.set_behavior("http://b:1", Behavior::ok("ok"));

    for _ in 0..2 {
        let resp = gateway
            .handle(get("x", "/api"), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(resp.status.as_u16(), 200);
    }

    let resp = gateway
        .handle(get("x", "/api"), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(resp.status.as_u16(), 429);
    assert_eq!(resp.header("retry-after"), Some("1"));
    // The limited request never reached the upstream.
    assert_eq!(fake.call_count(), 2);

    // A different client IP has its own bucket.
    let mut other = get("x", "/api");
    other.peer_addr = Some("10.0.0.2".parse().unwrap());
    let resp = gateway.handle(other, CancellationToken::new()).await.unwrap();
    assert_eq!(resp.status.as_u16(), 200);
}

#[tokio::test]
async fn mock_and_echo_actions_synthesize_responses() {
    let mut mock = proxy_route("mock", "/mock", "pool");
    mock.action = RouteAction::Mock {
        status: 418,
        headers: [("x-flavor".to_string(), "earl-grey".to_string())]
            .into_iter()
            .collect(),
        body: "teapot".to_string(),
    };
    let mut echo = proxy_route("echo", "/echo/{word}", "pool");
    echo.action = RouteAction::Echo;

    let (gateway, fake) = gateway_with(vec![mock, echo], vec![upstream("pool", &["http://b:1"])]);

    let resp = gateway
        .handle(get("x", "/mock"), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(resp.status.as_u16(), 418);
    assert_eq!(resp.header("x-flavor"), Some("earl-grey"));
    assert_eq!(resp.body.as_ref(), b"teapot");

    let resp = gateway
        .handle(get("x", "/echo/hello"), CancellationToken::new())
        .await
        .unwrap();
    let parsed: serde_json::Value = serde_json::from_slice(&resp.body).unwrap();
    assert_eq!(parsed["params"]["word"], "hello");
    assert_eq!(parsed["method"], "GET");

    assert_eq!(fake.call_count(), 0);
}

#[tokio::test]
async fn rewrite_template_shapes_upstream_path() {
    let mut route = proxy_route("users", "/api/users/{id}", "pool");
    route.rewrite = Some("/v1/user/{id}".to_string());
    let (gateway, fake) = gateway_with(vec![route], vec![upstream("pool", &["http://b:1"])]);

    gateway
        .handle(get("x", "/api/users/42"), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(fake.calls(), vec!["http://b:1/v1/user/42"]);
}

#[tokio::test]
async fn responses_carry_security_headers_and_request_id() {
    let (gateway, fake) = gateway_with(
        vec![proxy_route("r", "/x", "pool")],
        vec![upstream("pool", &["http://b:1"])],
    );
    fake.set_behavior("http://b:1", Behavior::ok("ok"));

    let resp = gateway
        .handle(get("x", "/x"), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(resp.header("x-content-type-options"), Some("nosniff"));
    assert!(resp.header("x-request-id").is_some());
}

#[tokio::test]
async fn cancelled_request_emits_no_response() {
    let (gateway, fake) = gateway_with(
        vec![proxy_route("slow", "/slow", "pool")],
        vec![upstream("pool", &["http://b:1"])],
    );
    fake.set_behavior(
        "http://b:1",
        Behavior::delayed("late", std::time::Duration::from_millis(500)),
    );

    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        canceller.cancel();
    });

    let outcome = gateway.handle(get("x", "/slow"), cancel).await;
    assert!(outcome.is_none());
}
