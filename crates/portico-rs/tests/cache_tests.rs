//! Cache behavior through the full pipeline: single-flight coalescing,
//! hits, conditional requests, tag purges and stale-if-error.

mod common;

use common::*;
use portico_rs::models::policy::CachePolicy;
use portico_rs::services::http::Gateway;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn cache_policy(ttl_ms: u64) -> CachePolicy {
    CachePolicy {
        methods: vec!["GET".to_string()],
        ttl_ms,
        stale_while_revalidate_ms: 0,
        stale_if_error_ms: 0,
        key_headers: vec![],
        key_cookies: vec![],
        key_body: false,
        allow_authorization: false,
        tags: vec![],
        tag_headers: vec![],
        generate_etag: true,
        mode: Default::default(),
        max_entries: 128,
        max_bytes: 1024 * 1024,
    }
}

fn cached_gateway(policy: CachePolicy) -> (Arc<Gateway>, Arc<FakeUpstream>) {
    let mut route = proxy_route("data", "/v1/data", "pool");
    route.cache = Some(policy);
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
async fn five_concurrent_requests_share_one_upstream_call() {
    let (gateway, fake) = cached_gateway(cache_policy(60_000));
    fake.set_behavior(
        "http://b:1",
        Behavior::delayed("{\"v\":1}", Duration::from_millis(100)),
    );

    let mut handles = Vec::new();
    for _ in 0..5 {
        let gateway = gateway.clone();
        handles.push(tokio::spawn(async move {
            gateway
                .handle(get("x", "/v1/data"), CancellationToken::new())
                .await
                .unwrap()
        }));
    }

    for handle in handles {
        let resp = handle.await.unwrap();
        assert_eq!(resp.status.as_u16(), 200);
        assert_eq!(resp.body.as_ref(), b"{\"v\":1}");
    }

    // Exactly one backend call despite five concurrent peers.
    assert_eq!(fake.call_count(), 1);
}

#[tokio::test]
async fn fresh_hit_serves_identical_bytes_without_upstream() {
    let (gateway, fake) = cached_gateway(cache_policy(60_000));
    fake.set_behavior("http://b:1", Behavior::ok("payload"));

    let first = gateway
        .handle(get("x", "/v1/data"), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(first.header("x-cache"), Some("miss"));

    let second = gateway
        .handle(get("x", "/v1/data"), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(second.header("x-cache"), Some("hit"));
    assert_eq!(first.body, second.body);
    assert_eq!(fake.call_count(), 1);
}

#[tokio::test]
async fn conditional_request_returns_304_from_cache() {
    let (gateway, fake) = cached_gateway(cache_policy(60_000));
    fake.set_behavior("http://b:1", Behavior::ok("payload"));

    let first = gateway
        .handle(get("x", "/v1/data"), CancellationToken::new())
        .await
        .unwrap();
    let etag = first.header("etag").expect("etag generated").to_string();

    let mut conditional = get("x", "/v1/data");
    conditional.headers.insert(
        actix_web::http::header::IF_NONE_MATCH,
        etag.parse().unwrap(),
    );
    let resp = gateway
        .handle(conditional, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(resp.status.as_u16(), 304);
    assert!(resp.body.is_empty());
    assert_eq!(fake.call_count(), 1);
}

#[tokio::test]
async fn stale_while_revalidate_serves_stale_and_refreshes_in_background() {
    let mut policy = cache_policy(50);
    policy.stale_while_revalidate_ms = 60_000;
    let (gateway, fake) = cached_gateway(policy);
    fake.set_behavior("http://b:1", Behavior::ok("v1"));

    gateway
        .handle(get("x", "/v1/data"), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(fake.call_count(), 1);

    // Let the entry expire into the SWR window, then change the origin.
    tokio::time::sleep(Duration::from_millis(80)).await;
    fake.set_behavior("http://b:1", Behavior::ok("v2"));

    let stale = gateway
        .handle(get("x", "/v1/data"), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(stale.header("x-cache"), Some("stale"));
    assert_eq!(stale.body.as_ref(), b"v1");

    // The background refresh lands the new version.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(fake.call_count(), 2);
    let refreshed = gateway
        .handle(get("x", "/v1/data"), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(refreshed.body.as_ref(), b"v2");
}

#[tokio::test]
async fn stale_if_error_masks_upstream_5xx() {
    let mut policy = cache_policy(50);
    policy.stale_if_error_ms = 60_000;
    let (gateway, fake) = cached_gateway(policy);
    fake.set_behavior("http://b:1", Behavior::ok("good"));

    gateway
        .handle(get("x", "/v1/data"), CancellationToken::new())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(80)).await;
    fake.set_behavior("http://b:1", Behavior::status(503));

    let resp = gateway
        .handle(get("x", "/v1/data"), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(resp.status.as_u16(), 200);
    assert_eq!(resp.header("x-cache"), Some("stale-if-error"));
    assert_eq!(resp.body.as_ref(), b"good");
}

#[tokio::test]
async fn tag_purge_invalidates_entries() {
    let mut policy = cache_policy(60_000);
    policy.tags = vec!["catalog".to_string()];
    let (gateway, fake) = cached_gateway(policy);
    fake.set_behavior("http://b:1", Behavior::ok("v1"));

    gateway
        .handle(get("x", "/v1/data"), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(fake.call_count(), 1);

    let purged = gateway.purge_cache_tags(&["catalog".to_string()]).await;
    assert_eq!(purged, 1);

    fake.set_behavior("http://b:1", Behavior::ok("v2"));
    let resp = gateway
        .handle(get("x", "/v1/data"), CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(resp.body.as_ref(), b"v2");
    assert_eq!(fake.call_count(), 2);
}

#[tokio::test]
async fn no_store_and_authorization_bypass_the_cache() {
    let (gateway, fake) = cached_gateway(cache_policy(60_000));
    fake.set_behavior("http://b:1", Behavior::ok("fresh"));

    let mut no_store = get("x", "/v1/data");
    no_store.headers.insert(
        actix_web::http::header::CACHE_CONTROL,
        "no-store".parse().unwrap(),
    );
    gateway
        .handle(no_store.clone(), CancellationToken::new())
        .await
        .unwrap();
    gateway
        .handle(no_store, CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(fake.call_count(), 2);

    let mut authed = get("x", "/v1/data");
    authed.headers.insert(
        actix_web::http::header::AUTHORIZATION,
        "Bearer tok".parse().unwrap(),
    );
    gateway.handle(authed, CancellationToken::new()).await.unwrap();
    assert_eq!(fake.call_count(), 3);
}

#[tokio::test]
async fn skip_cache_store_directive_prevents_store() {
    let mut route = proxy_route("data", "/v1/data", "pool");
    route.cache = Some(cache_policy(60_000));
    route.bypass = vec![portico_rs::models::route::BypassDirective {
        directive: "skip_cache_store".to_string(),
        allow_unsafe: false,
    }];
    let fake = Arc::new(FakeUpstream::new());
    let gateway = Gateway::with_parts(
        settings(vec![route], vec![upstream("pool", &["http://b:1"])]),
        fake.clone(),
        None,
    )
    .unwrap();
    fake.set_behavior("http://b:1", Behavior::ok("x"));

    gateway
        .handle(get("x", "/v1/data"), CancellationToken::new())
        .await
        .unwrap();
    gateway
        .handle(get("x", "/v1/data"), CancellationToken::new())
        .await
        .unwrap();
    // Nothing was stored, so both requests hit the upstream.
    assert_eq!(fake.call_count(), 2);
}
