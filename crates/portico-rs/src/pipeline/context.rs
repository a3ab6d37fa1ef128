//! Per-request context threaded through the stage pipeline.
//!
//! The context is single-owner: it is created at ingress after the match,
//! mutated by stages in order, and dropped when the response has been
//! written or the request cancelled. It pins the configuration snapshot
//! observed at matcher entry; every later lookup (upstreams, policies)
//! goes through this snapshot regardless of concurrent reloads.

use crate::config::snapshot::ConfigSnapshot;
use crate::models::route::Route;
use crate::services::auth::Identity;
use crate::services::cache::FlightGuard;
use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Directives considered unsafe: a bypass rule must carry the explicit
/// unsafe assertion to skip these stages.
const UNSAFE_DIRECTIVES: &[&str] = &["skip_auth", "skip_body_limit", "skip_validation"];

/// Per-request state shared between stages.
pub struct RequestContext {
    pub request_id: Uuid,
    /// Snapshot bound at matcher entry; authoritative for the request's
    /// whole lifetime.
    pub snapshot: Arc<ConfigSnapshot>,
    pub route: Arc<Route>,
    pub path_params: HashMap<String, String>,
    /// Real client address after trusted-proxy unwrapping; starts as the
    /// transport peer.
    pub client_ip: Option<IpAddr>,
    /// Resolved identity once the auth stage has run.
    pub identity: Option<Identity>,
    pub started: Instant,
    pub deadline: Instant,
    pub cancel: CancellationToken,
    /// Stage-to-stage scratch values (traffic-split group, rate tier, ...).
    pub scratch: HashMap<String, String>,
    /// Active bypass directives for this request.
    skips: HashSet<String>,
    /// Cache fingerprint computed by the lookup stage, consumed by the
    /// store stage.
    pub cache_key: Option<crate::services::cache::Fingerprint>,
    /// Single-flight leadership held between cache lookup and store.
    pub flight: Option<FlightGuard>,
    /// Concurrency slot held for the request's lifetime when adaptive
    /// concurrency is active; released on drop.
    pub concurrency_permit: Option<crate::services::concurrency::ConcurrencyPermit>,
    /// Upstream chosen by the traffic-split stage, overriding the route's
    /// action target.
    pub upstream_override: Option<String>,
    /// Marks responses served from cache so the store stage does not
    /// re-store them.
    pub served_from_cache: bool,
}

impl RequestContext {
    pub fn new(
        snapshot: Arc<ConfigSnapshot>,
        route: Arc<Route>,
        path_params: HashMap<String, String>,
        peer: Option<IpAddr>,
    ) -> Self {
        let now = Instant::now();
        let deadline = now + Duration::from_millis(route.deadline_ms);
        let skips = route
            .bypass
            .iter()
            .filter(|d| {
                let unsafe_directive = UNSAFE_DIRECTIVES.contains(&d.directive.as_str());
                !unsafe_directive || d.allow_unsafe
            })
            .map(|d| d.directive.clone())
            .collect();

        Self {
            request_id: Uuid::new_v4(),
            snapshot,
            route,
            path_params,
            client_ip: peer,
            identity: None,
            started: now,
            deadline,
            cancel: CancellationToken::new(),
            scratch: HashMap::new(),
            skips,
            cache_key: None,
            flight: None,
            concurrency_permit: None,
            upstream_override: None,
            served_from_cache: false,
        }
    }

    /// Whether a `skip_<stage>` directive is active for this request.
    pub fn skipped(&self, directive: &str) -> bool {
        self.skips.contains(directive)
    }

    /// Time left before the overall request deadline.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Rate-limit tier resolved from the identity, when the JWT provider
    /// is configured with a tier claim.
    pub fn rate_tier(&self) -> Option<String> {
        self.scratch.get("rate_tier").cloned()
    }
}
