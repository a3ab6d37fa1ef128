//! Circuit breaker behavior through the full dispatch path.

mod common;

use common::*;
use portico_rs::models::policy::CircuitBreakerPolicy;
use portico_rs::services::http::Gateway;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn breaker_gateway(timeout_ms: u64) -> (Arc<Gateway>, Arc<FakeUpstream>) {
    let mut route = proxy_route("r", "/api", "pool");
    route.circuit_breaker = Some(CircuitBreakerPolicy {
        failure_threshold: 5,
        success_threshold: 1,
        timeout_ms,
        max_half_open_probes: 1,
        tenant_key: None,
    });
    let fake = Arc::new(FakeUpstream::new());
    let gateway = Gateway::with_parts(
        settings(vec![route], vec![upstream("pool", &["http://b:1"])]),
        fake.clone(),
        None,
    )
    .unwrap();
    (gateway, fake)
}

#[tokio::test]
async fn five_failures_open_the_breaker_and_reject_without_upstream_call() {
    let (gateway, fake) = breaker_gateway(60_000);
    fake.set_behavior("http://b:1", Behavior::status(502));

    for _ in 0..5 {
        let resp = gateway
            .handle(get("x", "/api"), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(resp.status.as_u16(), 502);
    }
    assert_eq!(fake.call_count(), 5);

    // Sixth request: rejected immediately, no upstream attempt.
    let resp = gateway
        .handle(get("x", "/api"), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(resp.status.as_u16(), 503);
    assert_eq!(fake.call_count(), 5);
}

#[tokio::test]
async fn probe_after_timeout_closes_on_success_and_reopens_on_failure() {
    let (gateway, fake) = breaker_gateway(200);
    fake.set_behavior("http://b:1", Behavior::status(502));

    for _ in 0..5 {
        gateway
            .handle(get("x", "/api"), CancellationToken::new())
            .await
            .unwrap();
    }
    assert_eq!(fake.call_count(), 5);

    // After the open timeout, one probe is admitted; a success closes.
    tokio::time::sleep(Duration::from_millis(250)).await;
    fake.set_behavior("http://b:1", Behavior::ok("back"));
    let resp = gateway
        .handle(get("x", "/api"), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(resp.status.as_u16(), 200);
    assert_eq!(fake.call_count(), 6);

    // Closed again: requests flow.
    let resp = gateway
        .handle(get("x", "/api"), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(resp.status.as_u16(), 200);

    // Five fresh failures reopen; the probe failing keeps it open.
    fake.set_behavior("http://b:1", Behavior::status(502));
    for _ in 0..5 {
        gateway
            .handle(get("x", "/api"), CancellationToken::new())
            .await
            .unwrap();
    }
    let before = fake.call_count();
    let resp = gateway
        .handle(get("x", "/api"), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(resp.status.as_u16(), 503);
    assert_eq!(fake.call_count(), before);

    tokio::time::sleep(Duration::from_millis(250)).await;
    let resp = gateway
        .handle(get("x", "/api"), CancellationToken::new())
        .await
        .unwrap();
    // Probe ran and failed with the upstream's 502; breaker reopens.
    assert_eq!(resp.status.as_u16(), 502);
    let resp = gateway
        .handle(get("x", "/api"), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(resp.status.as_u16(), 503);
}
