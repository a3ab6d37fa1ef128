//! Fingerprinted response cache with single-flight coalescing.
//!
//! Eligible requests are reduced to a SHA-256 fingerprint over method,
//! post-rewrite path, canonical query, selected headers and, when
//! configured, cookies and a body hash. Lookups classify entries as fresh
//! or stale relative to the TTL and the stale-while-revalidate /
//! stale-if-error windows. Misses register a single-flight slot so
//! concurrent peers for the same fingerprint await one upstream call.
//!
//! Storage sits behind [`CacheStore`]: a local LRU bounded by entry count
//! and byte size, or a distributed KV backend.

use crate::models::http::{canonical_query, GatewayResponse};
use crate::models::http::GatewayRequest;
use crate::models::policy::CachePolicy;
use crate::services::kv::KvStore;
use async_trait::async_trait;
use bytes::Bytes;
use log::{debug, warn};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;

/// Canonical cache key for one equivalence class of requests.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(pub String);

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Whether a request may consult the cache at all under a policy.
pub fn is_cacheable(req: &GatewayRequest, policy: &CachePolicy) -> bool {
    if !policy.methods.iter().any(|m| m == req.method.as_str()) {
        return false;
    }
    if let Some(cc) = req.header("cache-control") {
        if cc.to_ascii_lowercase().contains("no-store") {
            return false;
        }
    }
    if req.headers.contains_key("authorization") && !policy.allow_authorization {
        return false;
    }
    true
}

/// Computes the fingerprint for a request under a policy. `final_path` is
/// the post-rewrite path so rewritten routes share entries correctly.
pub fn fingerprint(req: &GatewayRequest, final_path: &str, policy: &CachePolicy) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(req.method.as_str().as_bytes());
    hasher.update(b"\n");
    hasher.update(final_path.as_bytes());
    hasher.update(b"\n");
    hasher.update(canonical_query(&req.raw_query).as_bytes());

    let mut names: Vec<String> = policy
        .key_headers
        .iter()
        .map(|h| h.to_ascii_lowercase())
        .collect();
    names.sort();
    for name in names {
        hasher.update(b"\nh:");
        hasher.update(name.as_bytes());
        hasher.update(b"=");
        if let Some(value) = req.header(&name) {
            hasher.update(value.as_bytes());
        }
    }

    let mut cookie_names = policy.key_cookies.clone();
    cookie_names.sort();
    for name in cookie_names {
        hasher.update(b"\nc:");
        hasher.update(name.as_bytes());
        hasher.update(b"=");
        if let Some(value) = req.cookie(&name) {
            hasher.update(value.as_bytes());
        }
    }

    if policy.key_body && !req.body.is_empty() {
        hasher.update(b"\nb:");
        hasher.update(Sha256::digest(&req.body));
    }

    Fingerprint(hex::encode(hasher.finalize()))
}

/// One stored response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub status: u16,
    /// Filtered response headers (hop-by-hop headers removed at store).
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    /// Store time, unix milliseconds. Monotonic per fingerprint: a store
    /// never replaces a strictly newer entry.
    pub stored_at_ms: u64,
    pub ttl_ms: u64,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub tags: Vec<String>,
}

/// Freshness classification relative to the policy windows.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Freshness {
    Fresh,
    /// Expired but inside `stale_while_revalidate`.
    StaleRevalidatable,
    /// Expired but inside `stale_if_error`.
    StaleOnError,
    Expired,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl CacheEntry {
    pub fn age_ms(&self) -> u64 {
        now_ms().saturating_sub(self.stored_at_ms)
    }

    pub fn freshness(&self, policy: &CachePolicy) -> Freshness {
        let age = self.age_ms();
        if age <= self.ttl_ms {
            return Freshness::Fresh;
        }
        let over = age - self.ttl_ms;
        if over <= policy.stale_while_revalidate_ms {
            Freshness::StaleRevalidatable
        } else if over <= policy.stale_if_error_ms {
            Freshness::StaleOnError
        } else {
            Freshness::Expired
        }
    }

    /// Whether the entry may serve a 5xx fallback right now.
    pub fn usable_on_error(&self, policy: &CachePolicy) -> bool {
        let age = self.age_ms();
        age <= self.ttl_ms + policy.stale_if_error_ms
    }

    pub fn to_response(&self) -> GatewayResponse {
        let mut resp = GatewayResponse::with_body(
            actix_web::http::StatusCode::from_u16(self.status)
                .unwrap_or(actix_web::http::StatusCode::OK),
            Bytes::from(self.body.clone()),
        );
        for (name, value) in &self.headers {
            resp.set_header(name, value);
        }
        if let Some(etag) = &self.etag {
            resp.set_header("etag", etag);
        }
        if let Some(lm) = &self.last_modified {
            resp.set_header("last-modified", lm);
        }
        resp
    }

    /// Answers a conditional request with 304 when the validators match.
    pub fn conditional_response(&self, req: &GatewayRequest) -> Option<GatewayResponse> {
        if let (Some(etag), Some(inm)) = (&self.etag, req.header("if-none-match")) {
            let matched = inm
                .split(',')
                .map(|t| t.trim())
                .any(|t| t == etag || t == "*");
            if matched {
                let mut resp = GatewayResponse::new(actix_web::http::StatusCode::NOT_MODIFIED);
                resp.set_header("etag", etag);
                return Some(resp);
            }
        }
        if let (Some(lm), Some(ims)) = (&self.last_modified, req.header("if-modified-since")) {
            if lm == ims {
                let mut resp = GatewayResponse::new(actix_web::http::StatusCode::NOT_MODIFIED);
                resp.set_header("last-modified", lm);
                return Some(resp);
            }
        }
        None
    }
}

/// Storage backend contract. Implementations must never let a store
/// replace a strictly newer entry for the same key.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &Fingerprint) -> Option<Arc<CacheEntry>>;
    async fn put(&self, key: &Fingerprint, entry: CacheEntry);
    /// Invalidates every entry whose tag set intersects `tags`. Returns
    /// the number of entries dropped.
    async fn purge_tags(&self, tags: &[String]) -> usize;
    /// Invalidates entries whose key satisfies the predicate. Used by
    /// config reload.
    fn invalidate_matching<'a>(
        &'a self,
        predicate: &'a (dyn Fn(&str) -> bool + Sync),
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = usize> + Send + 'a>>;
}

struct LocalInner {
    entries: LruCache<String, Arc<CacheEntry>>,
    bytes: usize,
}

/// In-process LRU store bounded by entry count and total body bytes.
pub struct LocalCacheStore {
    inner: Mutex<LocalInner>,
    max_bytes: usize,
}

impl LocalCacheStore {
    pub fn new(max_entries: usize, max_bytes: usize) -> Self {
        let capacity = NonZeroUsize::new(max_entries.max(1)).expect("non-zero capacity");
        Self {
            inner: Mutex::new(LocalInner {
                entries: LruCache::new(capacity),
                bytes: 0,
            }),
            max_bytes,
        }
    }
}

#[async_trait]
impl CacheStore for LocalCacheStore {
    async fn get(&self, key: &Fingerprint) -> Option<Arc<CacheEntry>> {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        inner.entries.get(&key.0).cloned()
    }

    async fn put(&self, key: &Fingerprint, entry: CacheEntry) {
        let mut guard = self.inner.lock().expect("cache lock poisoned");
        let inner = &mut *guard;
        if let Some(existing) = inner.entries.peek(&key.0) {
            if existing.stored_at_ms > entry.stored_at_ms {
                return;
            }
            inner.bytes = inner.bytes.saturating_sub(existing.body.len());
        }

        let size = entry.body.len();
        inner.bytes += size;
        inner.entries.put(key.0.clone(), Arc::new(entry));

        // Evict LRU entries until the byte budget holds.
        while inner.bytes > self.max_bytes {
            match inner.entries.pop_lru() {
                Some((_, evicted)) => {
                    inner.bytes = inner.bytes.saturating_sub(evicted.body.len());
                }
                None => break,
            }
        }
    }

    async fn purge_tags(&self, tags: &[String]) -> usize {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        let victims: Vec<String> = inner
            .entries
            .iter()
            .filter(|(_, e)| e.tags.iter().any(|t| tags.contains(t)))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &victims {
            if let Some(entry) = inner.entries.pop(key) {
                inner.bytes = inner.bytes.saturating_sub(entry.body.len());
            }
        }
        victims.len()
    }

    fn invalidate_matching<'a>(
        &'a self,
        predicate: &'a (dyn Fn(&str) -> bool + Sync),
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = usize> + Send + 'a>> {
        let result = self.invalidate_matching_sync(predicate);
        Box::pin(async move { result })
    }
}

impl LocalCacheStore {
    fn invalidate_matching_sync(&self, predicate: &(dyn Fn(&str) -> bool + Sync)) -> usize {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        let mut victims: Vec<String> = Vec::new();
        for (k, _) in inner.entries.iter() {
            if predicate(k) {
                victims.push(k.clone());
            }
        }
        for key in &victims {
            if let Some(entry) = inner.entries.pop(key) {
                inner.bytes = inner.bytes.saturating_sub(entry.body.len());
            }
        }
        victims.len()
    }
}

/// Distributed store over the shared KV. Entries serialize as JSON; tag
/// membership is tracked per node and purges fan out over the KV
/// publish/subscribe channel so peers drop their copies too.
pub struct KvCacheStore {
    kv: Arc<dyn KvStore>,
    prefix: String,
    tag_index: RwLock<HashMap<String, HashSet<String>>>,
}

impl KvCacheStore {
    pub const PURGE_CHANNEL: &'static str = "portico:cache:purge";

    pub fn new(kv: Arc<dyn KvStore>, prefix: &str) -> Self {
        Self {
            kv,
            prefix: prefix.to_string(),
            tag_index: RwLock::new(HashMap::new()),
        }
    }

    fn storage_key(&self, key: &Fingerprint) -> String {
        format!("{}:{}", self.prefix, key.0)
    }

    async fn delete(&self, storage_key: &str) {
        // The KV interface has no delete; overwrite with an immediately
        // expiring tombstone via CAS.
        if let Ok(current) = self.kv.get(storage_key).await {
            let _ = self
                .kv
                .compare_and_set(
                    storage_key,
                    current.as_deref(),
                    b"",
                    Some(Duration::from_millis(1)),
                )
                .await;
        }
    }
}

#[async_trait]
impl CacheStore for KvCacheStore {
    async fn get(&self, key: &Fingerprint) -> Option<Arc<CacheEntry>> {
        match self.kv.get(&self.storage_key(key)).await {
            Ok(Some(raw)) if !raw.is_empty() => serde_json::from_slice(&raw)
                .map(Arc::new)
                .map_err(|e| warn!("Corrupt cache entry for {}: {}", key, e))
                .ok(),
            Ok(_) => None,
            Err(e) => {
                // Storage failures are suppressed; the caller falls back
                // to the origin.
                warn!("Cache KV get failed for {}: {}", key, e);
                None
            }
        }
    }

    async fn put(&self, key: &Fingerprint, entry: CacheEntry) {
        let storage_key = self.storage_key(key);
        let current = match self.kv.get(&storage_key).await {
            Ok(current) => current,
            Err(e) => {
                warn!("Cache KV put failed for {}: {}", key, e);
                return;
            }
        };
        if let Some(raw) = &current {
            if let Ok(existing) = serde_json::from_slice::<CacheEntry>(raw) {
                if existing.stored_at_ms > entry.stored_at_ms {
                    return;
                }
            }
        }

        let ttl = Duration::from_millis(entry.ttl_ms + entry.ttl_ms / 2);
        let payload = match serde_json::to_vec(&entry) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("Cache entry serialization failed for {}: {}", key, e);
                return;
            }
        };
        match self
            .kv
            .compare_and_set(&storage_key, current.as_deref(), &payload, Some(ttl))
            .await
        {
            Ok(_) => {
                let mut index = self.tag_index.write().expect("tag index lock poisoned");
                for tag in &entry.tags {
                    index.entry(tag.clone()).or_default().insert(storage_key.clone());
                }
            }
            Err(e) => warn!("Cache KV put failed for {}: {}", key, e),
        }
    }

    async fn purge_tags(&self, tags: &[String]) -> usize {
        let victims: Vec<String> = {
            let index = self.tag_index.read().expect("tag index lock poisoned");
            tags.iter()
                .filter_map(|t| index.get(t))
                .flat_map(|keys| keys.iter().cloned())
                .collect()
        };
        for key in &victims {
            self.delete(key).await;
        }
        {
            let mut index = self.tag_index.write().expect("tag index lock poisoned");
            for tag in tags {
                index.remove(tag);
            }
        }
        // Tell peer nodes to drop their local knowledge of these tags.
        if let Ok(payload) = serde_json::to_vec(tags) {
            let _ = self.kv.publish(Self::PURGE_CHANNEL, &payload).await;
        }
        victims.len()
    }

    fn invalidate_matching<'a>(
        &'a self,
        predicate: &'a (dyn Fn(&str) -> bool + Sync),
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = usize> + Send + 'a>> {
        let victims = self.matching_keys(predicate);
        Box::pin(async move {
            for key in &victims {
                self.delete(key).await;
            }
            victims.len()
        })
    }
}

impl KvCacheStore {
    fn matching_keys(&self, predicate: &(dyn Fn(&str) -> bool + Sync)) -> Vec<String> {
        let index = self.tag_index.read().expect("tag index lock poisoned");
        let mut v = Vec::new();
        for keys in index.values() {
            for k in keys.iter() {
                if predicate(k) {
                    v.push(k.clone());
                }
            }
        }
        v
    }
}

/// Result a single-flight leader publishes to its followers.
pub type FlightResult = Result<Arc<GatewayResponse>, FlightError>;

#[derive(Debug, Clone, PartialEq)]
pub enum FlightError {
    /// Leader's upstream call failed; followers surface the error.
    Upstream(String),
    /// Leader was cancelled before producing a result; followers re-join.
    Cancelled,
}

/// Leader's handle on a single-flight slot. Publishing resolves every
/// follower; dropping unpublished resolves them with `Cancelled` and
/// frees the slot.
pub struct FlightGuard {
    flights: Arc<Mutex<HashMap<String, watch::Receiver<Option<FlightResult>>>>>,
    key: String,
    tx: watch::Sender<Option<FlightResult>>,
    published: bool,
}

impl FlightGuard {
    pub fn publish(mut self, result: FlightResult) {
        self.published = true;
        self.release(result);
    }

    fn release(&mut self, result: FlightResult) {
        let _ = self.tx.send(Some(result));
        self.flights
            .lock()
            .expect("flight lock poisoned")
            .remove(&self.key);
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        if !self.published {
            self.release(Err(FlightError::Cancelled));
        }
    }
}

/// Role assigned when joining a fingerprint's flight.
pub enum FlightRole {
    Leader(FlightGuard),
    Follower(watch::Receiver<Option<FlightResult>>),
}

/// Coalesces concurrent misses per fingerprint: one leader performs the
/// upstream call, followers await its published result.
#[derive(Default)]
pub struct SingleFlight {
    flights: Arc<Mutex<HashMap<String, watch::Receiver<Option<FlightResult>>>>>,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&self, key: &Fingerprint) -> FlightRole {
        let mut flights = self.flights.lock().expect("flight lock poisoned");
        if let Some(rx) = flights.get(&key.0) {
            return FlightRole::Follower(rx.clone());
        }
        let (tx, rx) = watch::channel(None);
        flights.insert(key.0.clone(), rx);
        FlightRole::Leader(FlightGuard {
            flights: self.flights.clone(),
            key: key.0.clone(),
            tx,
            published: false,
        })
    }

    /// Follower side: waits for the leader's published result.
    pub async fn await_result(
        mut rx: watch::Receiver<Option<FlightResult>>,
    ) -> FlightResult {
        loop {
            if let Some(result) = rx.borrow().clone() {
                return result;
            }
            if rx.changed().await.is_err() {
                return Err(FlightError::Cancelled);
            }
        }
    }
}

/// Builds a cache entry from an upstream response. Hop-by-hop and cache
/// timing headers are filtered; tags come from the policy's static tags
/// plus the comma/space-split values of the configured tag headers.
pub fn entry_from_response(
    resp: &GatewayResponse,
    policy: &CachePolicy,
) -> CacheEntry {
    const SKIP: &[&str] = &[
        "connection",
        "keep-alive",
        "transfer-encoding",
        "upgrade",
        "proxy-authenticate",
        "proxy-authorization",
        "te",
        "trailer",
        "age",
        "set-cookie",
    ];

    let mut headers = Vec::new();
    for (name, value) in resp.headers.iter() {
        let name_str = name.as_str().to_ascii_lowercase();
        if SKIP.contains(&name_str.as_str()) {
            continue;
        }
        if let Ok(v) = value.to_str() {
            headers.push((name_str, v.to_string()));
        }
    }

    let mut tags: Vec<String> = policy.tags.clone();
    for header in &policy.tag_headers {
        if let Some(value) = resp.header(header) {
            tags.extend(
                value
                    .split(|c| c == ',' || c == ' ')
                    .filter(|t| !t.is_empty())
                    .map(|t| t.to_string()),
            );
        }
    }
    tags.sort();
    tags.dedup();

    let etag = resp.header("etag").map(|v| v.to_string()).or_else(|| {
        policy
            .generate_etag
            .then(|| format!("\"{}\"", hex::encode(&Sha256::digest(&resp.body)[..16])))
    });

    CacheEntry {
        status: resp.status.as_u16(),
        headers,
        body: resp.body.to_vec(),
        stored_at_ms: now_ms(),
        ttl_ms: policy.ttl_ms,
        etag,
        last_modified: resp.header("last-modified").map(|v| v.to_string()),
        tags,
    }
}

/// The request cache facade used by the pipeline's cache stage.
pub struct RequestCache {
    store: Arc<dyn CacheStore>,
    flights: SingleFlight,
}

impl RequestCache {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self {
            store,
            flights: SingleFlight::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn CacheStore> {
        &self.store
    }

    pub async fn lookup(&self, key: &Fingerprint) -> Option<Arc<CacheEntry>> {
        self.store.get(key).await
    }

    pub fn join_flight(&self, key: &Fingerprint) -> FlightRole {
        self.flights.join(key)
    }

    pub async fn store_response(
        &self,
        key: &Fingerprint,
        resp: &GatewayResponse,
        policy: &CachePolicy,
    ) {
        // Only success-class responses are stored.
        if !resp.status.is_success() {
            debug!("Not caching non-success status {} for {}", resp.status, key);
            return;
        }
        let entry = entry_from_response(resp, policy);
        self.store.put(key, entry).await;
    }

    /// External invalidation signal: drop everything carrying any of the
    /// given tags.
    pub async fn purge_tags(&self, tags: &[String]) -> usize {
        self.store.purge_tags(tags).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::http::Method;
    use actix_web::http::header::HeaderMap;
    use actix_web::http::StatusCode;

    fn policy() -> CachePolicy {
        CachePolicy {
            methods: vec!["GET".to_string()],
            ttl_ms: 60_000,
            stale_while_revalidate_ms: 30_000,
            stale_if_error_ms: 120_000,
            key_headers: vec!["Accept".to_string()],
            key_cookies: vec![],
            key_body: false,
            allow_authorization: false,
            tags: vec!["static".to_string()],
            tag_headers: vec!["x-cache-tags".to_string()],
            generate_etag: true,
            mode: crate::models::policy::LimiterMode::Local,
            max_entries: 16,
            max_bytes: 1024 * 1024,
        }
    }

    fn request(path: &str, query: &str) -> GatewayRequest {
        GatewayRequest {
            method: Method::GET,
            scheme: "http".to_string(),
            host: "localhost".to_string(),
            path: path.to_string(),
            raw_query: query.to_string(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
            peer_addr: None,
            tls: false,
        }
    }

    #[test]
    fn fingerprint_ignores_query_order_and_respects_key_headers() {
        let p = policy();
        let a = fingerprint(&request("/v1/data", "a=1&b=2"), "/v1/data", &p);
        let b = fingerprint(&request("/v1/data", "b=2&a=1"), "/v1/data", &p);
        assert_eq!(a, b);

        let mut with_header = request("/v1/data", "a=1&b=2");
        with_header
            .headers
            .insert(actix_web::http::header::ACCEPT, "text/xml".parse().unwrap());
        let c = fingerprint(&with_header, "/v1/data", &p);
        assert_ne!(a, c);

        // Headers outside key_headers do not split entries.
        let mut other = request("/v1/data", "a=1&b=2");
        other
            .headers
            .insert(actix_web::http::header::USER_AGENT, "x".parse().unwrap());
        assert_eq!(a, fingerprint(&other, "/v1/data", &p));
    }

    #[test]
    fn eligibility_honors_no_store_and_authorization() {
        let p = policy();
        assert!(is_cacheable(&request("/x", ""), &p));

        let mut no_store = request("/x", "");
        no_store
            .headers
            .insert(actix_web::http::header::CACHE_CONTROL, "no-store".parse().unwrap());
        assert!(!is_cacheable(&no_store, &p));

        let mut authed = request("/x", "");
        authed
            .headers
            .insert(actix_web::http::header::AUTHORIZATION, "Bearer x".parse().unwrap());
        assert!(!is_cacheable(&authed, &p));

        let mut opt_in = p.clone();
        opt_in.allow_authorization = true;
        assert!(is_cacheable(&authed, &opt_in));

        let mut post = request("/x", "");
        post.method = Method::POST;
        assert!(!is_cacheable(&post, &p));
    }

    #[tokio::test]
    async fn local_store_round_trips_and_respects_newer_entries() {
        let store = LocalCacheStore::new(16, 1024);
        let key = Fingerprint("k1".to_string());

        let mut newer = entry_from_response(
            &GatewayResponse::with_body(StatusCode::OK, "v2"),
            &policy(),
        );
        newer.stored_at_ms = now_ms() + 1_000;
        store.put(&key, newer).await;

        // An older write must not clobber the newer entry.
        let mut older = entry_from_response(
            &GatewayResponse::with_body(StatusCode::OK, "v1"),
            &policy(),
        );
        older.stored_at_ms = now_ms().saturating_sub(5_000);
        store.put(&key, older).await;

        let got = store.get(&key).await.unwrap();
        assert_eq!(got.body, b"v2".to_vec());
    }

    #[tokio::test]
    async fn byte_budget_evicts_lru() {
        let store = LocalCacheStore::new(16, 100);
        for i in 0..5 {
            let entry = CacheEntry {
                status: 200,
                headers: vec![],
                body: vec![0u8; 40],
                stored_at_ms: now_ms(),
                ttl_ms: 60_000,
                etag: None,
                last_modified: None,
                tags: vec![],
            };
            store.put(&Fingerprint(format!("k{}", i)), entry).await;
        }
        // 100 / 40 = at most 2 entries can remain.
        let live = {
            let inner = store.inner.lock().unwrap();
            inner.entries.len()
        };
        assert!(live <= 2);
    }

    #[tokio::test]
    async fn tag_purge_drops_intersecting_entries() {
        let store = LocalCacheStore::new(16, 1024 * 1024);
        let mk = |tags: Vec<&str>| CacheEntry {
            status: 200,
            headers: vec![],
            body: b"x".to_vec(),
            stored_at_ms: now_ms(),
            ttl_ms: 60_000,
            etag: None,
            last_modified: None,
            tags: tags.into_iter().map(|t| t.to_string()).collect(),
        };
        store.put(&Fingerprint("a".to_string()), mk(vec!["users", "v1"])).await;
        store.put(&Fingerprint("b".to_string()), mk(vec!["orders"])).await;

        let purged = store.purge_tags(&["users".to_string()]).await;
        assert_eq!(purged, 1);
        assert!(store.get(&Fingerprint("a".to_string())).await.is_none());
        assert!(store.get(&Fingerprint("b".to_string())).await.is_some());
    }

    #[test]
    fn freshness_windows() {
        let p = policy();
        let mut entry = entry_from_response(
            &GatewayResponse::with_body(StatusCode::OK, "x"),
            &p,
        );
        assert_eq!(entry.freshness(&p), Freshness::Fresh);

        entry.stored_at_ms = now_ms() - 70_000; // 10s past TTL
        assert_eq!(entry.freshness(&p), Freshness::StaleRevalidatable);

        entry.stored_at_ms = now_ms() - 150_000; // past SWR, inside SIE
        assert_eq!(entry.freshness(&p), Freshness::StaleOnError);

        entry.stored_at_ms = now_ms() - 500_000;
        assert_eq!(entry.freshness(&p), Freshness::Expired);
    }

    #[test]
    fn conditional_requests_answer_304() {
        let p = policy();
        let entry = entry_from_response(
            &GatewayResponse::with_body(StatusCode::OK, "payload"),
            &p,
        );
        let etag = entry.etag.clone().unwrap();

        let mut req = request("/x", "");
        req.headers.insert(
            actix_web::http::header::IF_NONE_MATCH,
            etag.parse().unwrap(),
        );
        let resp = entry.conditional_response(&req).unwrap();
        assert_eq!(resp.status, StatusCode::NOT_MODIFIED);
        assert!(resp.body.is_empty());

        let plain = request("/x", "");
        assert!(entry.conditional_response(&plain).is_none());
    }

    #[test]
    fn tags_derive_from_policy_and_headers() {
        let p = policy();
        let mut resp = GatewayResponse::with_body(StatusCode::OK, "x");
        resp.set_header("x-cache-tags", "users, orders v2");
        let entry = entry_from_response(&resp, &p);
        assert_eq!(
            entry.tags,
            vec![
                "orders".to_string(),
                "static".to_string(),
                "users".to_string(),
                "v2".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn single_flight_has_one_leader() {
        let flights = SingleFlight::new();
        let key = Fingerprint("k".to_string());

        let leader = match flights.join(&key) {
            FlightRole::Leader(guard) => guard,
            FlightRole::Follower(_) => panic!("first join must lead"),
        };
        let follower = match flights.join(&key) {
            FlightRole::Follower(rx) => rx,
            FlightRole::Leader(_) => panic!("second join must follow"),
        };

        let resp = Arc::new(GatewayResponse::with_body(StatusCode::OK, "shared"));
        leader.publish(Ok(resp.clone()));

        let got = SingleFlight::await_result(follower).await.unwrap();
        assert_eq!(got.body, resp.body);

        // Slot is free again after publish.
        assert!(matches!(flights.join(&key), FlightRole::Leader(_)));
    }

    #[tokio::test]
    async fn cancelled_leader_resolves_followers_with_cancelled() {
        let flights = SingleFlight::new();
        let key = Fingerprint("k".to_string());

        let leader = match flights.join(&key) {
            FlightRole::Leader(guard) => guard,
            _ => panic!(),
        };
        let follower = match flights.join(&key) {
            FlightRole::Follower(rx) => rx,
            _ => panic!(),
        };

        drop(leader);
        assert!(matches!(
            SingleFlight::await_result(follower).await,
            Err(FlightError::Cancelled)
        ));
    }
}
