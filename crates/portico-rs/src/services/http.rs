//! The gateway facade: snapshot binding, pipeline execution and egress.
//!
//! `Gateway` owns the process-lifetime components (snapshot publisher,
//! dispatcher, cache, limiters, auth registry) and drives one request
//! through match -> request-phase stages -> dispatch -> response-phase
//! stages. It is the only type the ingress layer talks to.

use crate::config::snapshot::SnapshotPublisher;
use crate::models::error::GatewayError;
use crate::models::http::{GatewayRequest, GatewayResponse};
use crate::models::policy::CachePolicy;
use crate::models::settings::Settings;
use crate::pipeline::context::RequestContext;
use crate::pipeline::{render_error, stages, ResponseOutcome, StageKind, StageOutcome};
use crate::services::auth::{ApiKeyProvider, AuthRegistry, JwtProvider};
use crate::services::cache::{Fingerprint, KvCacheStore, LocalCacheStore, RequestCache};
use crate::services::circuit_breaker::BreakerRegistry;
use crate::services::concurrency::{AdaptiveLimiter, LoadShedder};
use crate::services::dispatcher::{Dispatcher, HttpUpstreamClient, UpstreamClient};
use crate::services::kv::KvStore;
use crate::services::rate_limit::{RateLimiter, SpikeArrester};
use crate::services::retry::BudgetRegistry;
use crate::utils::route_matcher::MatchOutcome;
use log::{debug, error, warn};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Shared gateway state. One instance per process, wrapped in `Arc`.
///
/// The dispatcher and cache sit behind their own `Arc`s so background
/// work (stale-while-revalidate refreshes) can outlive the spawning
/// request without holding the whole gateway.
pub struct Gateway {
    publisher: SnapshotPublisher,
    dispatcher: Arc<Dispatcher>,
    cache: Arc<RequestCache>,
    limiter: RateLimiter,
    arrester: SpikeArrester,
    adaptive: Option<Arc<AdaptiveLimiter>>,
    shedder: Option<LoadShedder>,
    auth: AuthRegistry,
    jwt_tier_claim: Option<String>,
}

impl Gateway {
    /// Builds the gateway from validated, secret-resolved settings with
    /// the production HTTP client and a local cache store.
    pub fn new(settings: Settings) -> Result<Arc<Self>, String> {
        Self::with_parts(settings, Arc::new(HttpUpstreamClient::new()), None)
    }

    /// Builds the gateway with an injected upstream client and optional
    /// KV backend. Tests drive the full pipeline through this.
    pub fn with_parts(
        settings: Settings,
        client: Arc<dyn UpstreamClient>,
        kv: Option<Arc<dyn KvStore>>,
    ) -> Result<Arc<Self>, String> {
        let publisher = SnapshotPublisher::new(settings)?;
        let snapshot = publisher.current();
        let global = snapshot.global_policy();

        let cache_store: Arc<dyn crate::services::cache::CacheStore> = match (&global.cache, &kv) {
            (Some(policy), Some(kv))
                if policy.mode == crate::models::policy::LimiterMode::Distributed =>
            {
                Arc::new(KvCacheStore::new(kv.clone(), "portico:cache"))
            }
            (Some(policy), _) => {
                Arc::new(LocalCacheStore::new(policy.max_entries, policy.max_bytes))
            }
            _ => Arc::new(LocalCacheStore::new(10_000, 64 * 1024 * 1024)),
        };

        let adaptive = global
            .adaptive_concurrency
            .as_ref()
            .map(|policy| AdaptiveLimiter::new(policy.clone()));
        let shedder = global
            .load_shed
            .as_ref()
            .map(|policy| LoadShedder::new(policy.clone()));

        let limiter = match &kv {
            Some(kv) => RateLimiter::with_kv(kv.clone()),
            None => RateLimiter::new(),
        };

        let settings = publisher.settings();
        let mut auth = AuthRegistry::new();
        let mut jwt_tier_claim = None;
        if let Some(api_keys) = &settings.api_keys {
            auth.register(Arc::new(ApiKeyProvider::new(api_keys)));
        }
        if let Some(jwt) = &settings.jwt {
            let provider = JwtProvider::new(jwt.clone());
            jwt_tier_claim = provider.tier_claim().map(|c| c.to_string());
            auth.register(Arc::new(provider));
        }

        let dispatcher = Arc::new(Dispatcher::new(
            client,
            Arc::new(BudgetRegistry::new()),
            Arc::new(BreakerRegistry::new()),
        ));

        Ok(Arc::new(Self {
            publisher,
            dispatcher,
            cache: Arc::new(RequestCache::new(cache_store)),
            limiter,
            arrester: SpikeArrester::new(),
            adaptive,
            shedder,
            auth,
            jwt_tier_claim,
        }))
    }

    pub fn cache(&self) -> &RequestCache {
        &self.cache
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn arrester(&self) -> &SpikeArrester {
        &self.arrester
    }

    pub fn adaptive(&self) -> Option<&Arc<AdaptiveLimiter>> {
        self.adaptive.as_ref()
    }

    pub fn shedder(&self) -> Option<&LoadShedder> {
        self.shedder.as_ref()
    }

    pub fn auth(&self) -> &AuthRegistry {
        &self.auth
    }

    pub fn jwt_tier_claim(&self) -> Option<&str> {
        self.jwt_tier_claim.as_deref()
    }

    pub fn publisher(&self) -> &SnapshotPublisher {
        &self.publisher
    }

    /// Validates and publishes new settings, then drops cache entries so
    /// stale route shapes cannot serve.
    pub async fn reload(&self, settings: Settings) -> Result<u64, String> {
        let snapshot = self.publisher.publish(settings)?;
        let dropped = self
            .cache
            .store()
            .invalidate_matching(&|_key| true)
            .await;
        if dropped > 0 {
            debug!("Reload invalidated {} cache entries", dropped);
        }
        Ok(snapshot.version())
    }

    /// External tag-purge signal.
    pub async fn purge_cache_tags(&self, tags: &[String]) -> usize {
        self.cache.purge_tags(tags).await
    }

    /// Handles one request end to end.
    ///
    /// Returns `None` when the request was cancelled: the caller must not
    /// emit a response. Every other outcome, including errors, renders a
    /// response through the snapshot's error-page policy.
    pub async fn handle(
        &self,
        mut req: GatewayRequest,
        cancel: CancellationToken,
    ) -> Option<GatewayResponse> {
        // Bind the snapshot once; everything below uses this one.
        let snapshot = self.publisher.current();
        let error_pages = snapshot.global_policy().error_pages.clone();
        let accept = req.header("accept").map(|a| a.to_string());

        let (compiled, params) = match snapshot.routes().find_match(&req) {
            MatchOutcome::Matched { route, params } => (route, params),
            MatchOutcome::MethodMismatch => {
                let err = GatewayError::MethodNotAllowed {
                    method: req.method.to_string(),
                    path: req.path.clone(),
                };
                return Some(render_error(&err, accept.as_deref(), &error_pages));
            }
            MatchOutcome::NoMatch => {
                let err = GatewayError::RouteNotFound {
                    path: req.path.clone(),
                };
                return Some(render_error(&err, accept.as_deref(), &error_pages));
            }
        };

        let route = compiled.route.clone();
        let stage_list = snapshot.stages_for(&route.id);
        let mut ctx = RequestContext::new(snapshot, route, params, req.peer_addr);
        ctx.cancel = cancel;

        // Request phase, in canonical order.
        let mut entered: Vec<StageKind> = Vec::new();
        let mut early_response: Option<GatewayResponse> = None;
        for kind in stage_list.iter() {
            if ctx.is_cancelled() {
                return None;
            }
            if ctx.skipped(kind.directive()) {
                debug!("Stage {:?} skipped by directive on route {}", kind, ctx.route.id);
                continue;
            }
            match stages::on_request(*kind, self, &mut ctx, &mut req).await {
                StageOutcome::Continue => entered.push(*kind),
                StageOutcome::ShortCircuit(resp) => {
                    early_response = Some(resp);
                    break;
                }
                StageOutcome::Fail(GatewayError::Cancelled) => return None,
                StageOutcome::Fail(err) => {
                    if matches!(err.class(), crate::models::error::ErrorClass::Config) {
                        error!("Route {} misconfigured: {}", ctx.route.id, err);
                    }
                    early_response = Some(render_error(&err, accept.as_deref(), &error_pages));
                    break;
                }
            }
        }

        // Dispatch unless a stage short-circuited.
        let mut resp = match early_response {
            Some(resp) => resp,
            None => match self.dispatcher.dispatch(&mut ctx, &req).await {
                Ok(resp) => resp,
                Err(GatewayError::Cancelled) => return None,
                Err(err) => {
                    if matches!(err.class(), crate::models::error::ErrorClass::Cache) {
                        // Cache errors are suppressed; reaching here means a
                        // bug upstream of this point, so log and degrade.
                        warn!("Cache error escaped to dispatch: {}", err);
                    }
                    render_error(&err, accept.as_deref(), &error_pages)
                }
            },
        };

        // Response phase, reverse entry order, only over entered stages.
        for kind in entered.iter().rev() {
            match stages::on_response(*kind, self, &mut ctx, &req, &mut resp).await {
                ResponseOutcome::Continue => {}
                ResponseOutcome::Replace(replacement) => resp = replacement,
                ResponseOutcome::Fail(err) => {
                    warn!("Response stage {:?} failed: {}", kind, err);
                    resp = render_error(&err, accept.as_deref(), &error_pages);
                }
            }
        }

        if ctx.is_cancelled() {
            return None;
        }
        Some(resp)
    }

    /// Background stale-while-revalidate refresh. The task is scoped to
    /// the spawning request's cancellation: a client disconnect aborts
    /// the refresh, and a failed refresh leaves the stale entry in place.
    pub fn spawn_cache_refresh(
        &self,
        ctx: &RequestContext,
        req: GatewayRequest,
        key: Fingerprint,
        policy: CachePolicy,
    ) {
        let cache = self.cache.clone();
        let dispatcher = self.dispatcher.clone();
        let snapshot = ctx.snapshot.clone();
        let route = ctx.route.clone();
        let params = ctx.path_params.clone();
        let cancel = ctx.cancel.child_token();
        let client_ip = ctx.client_ip;

        tokio::spawn(async move {
            // Only one refresh per fingerprint; a running flight means a
            // peer is already refreshing.
            let guard = match cache.join_flight(&key) {
                crate::services::cache::FlightRole::Leader(guard) => guard,
                crate::services::cache::FlightRole::Follower(_) => return,
            };

            let mut refresh_ctx = RequestContext::new(snapshot, route, params, None);
            refresh_ctx.client_ip = client_ip;
            refresh_ctx.cancel = cancel;

            match dispatcher.dispatch(&mut refresh_ctx, &req).await {
                Ok(resp) if resp.status.is_success() => {
                    cache.store_response(&key, &resp, &policy).await;
                    guard.publish(Ok(Arc::new(resp)));
                    debug!("Background refresh completed for {}", key);
                }
                Ok(resp) => {
                    debug!(
                        "Background refresh for {} answered {}; stale entry kept",
                        key, resp.status
                    );
                    guard.publish(Ok(Arc::new(resp)));
                }
                Err(err) => {
                    debug!("Background refresh for {} failed: {}; stale entry kept", key, err);
                    drop(guard);
                }
            }
        });
    }
}
