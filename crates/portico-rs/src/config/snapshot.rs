//! Immutable configuration snapshots and their atomic publication.
//!
//! A snapshot is built once from validated settings and never mutated:
//! route patterns and predicate regexes are compiled, per-route stage
//! lists are frozen, upstream pools are materialized and CIDR lists
//! parsed. Publication swaps one `Arc` under an `ArcSwap`; requests load
//! the pointer once at matcher entry and use only that snapshot for their
//! lifetime, so a mid-request reload is never observable. The previous
//! snapshot drops when its last in-flight request finishes.

use crate::models::policy::GlobalPolicy;
use crate::models::settings::Settings;
use crate::models::upstream::{UpstreamConfig, UpstreamPool};
use crate::pipeline::{compile_stages, StageKind};
use crate::utils::net::{parse_cidr, Cidr};
use crate::utils::route_matcher::RouteMatcher;
use arc_swap::ArcSwap;
use log::info;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// One immutable view of all configuration.
pub struct ConfigSnapshot {
    version: u64,
    matcher: RouteMatcher,
    upstreams: HashMap<String, Arc<UpstreamPool>>,
    /// Raw upstream configs, kept so the next build can detect unchanged
    /// pools and carry their runtime state over.
    upstream_configs: HashMap<String, UpstreamConfig>,
    stage_lists: HashMap<String, Arc<Vec<StageKind>>>,
    global: GlobalPolicy,
    trusted: Vec<Cidr>,
    blocked: Vec<Cidr>,
}

impl ConfigSnapshot {
    /// Builds a snapshot from validated settings.
    ///
    /// `previous` lets upstream pools whose configuration is unchanged
    /// carry over, preserving backend health bits, EWMA latencies and
    /// ejection state across reloads.
    pub fn build(
        settings: &Settings,
        version: u64,
        previous: Option<&ConfigSnapshot>,
    ) -> Result<Self, String> {
        settings.validate()?;

        let mut upstreams = HashMap::new();
        let mut upstream_configs = HashMap::new();
        for config in &settings.upstreams {
            let unchanged = previous
                .and_then(|prev| prev.upstream_configs.get(&config.name))
                .map(|prev_cfg| {
                    serde_json::to_value(prev_cfg).ok() == serde_json::to_value(config).ok()
                })
                .unwrap_or(false);
            let pool = if unchanged {
                previous
                    .and_then(|prev| prev.upstreams.get(&config.name).cloned())
                    .unwrap_or_else(|| UpstreamPool::new(config))
            } else {
                UpstreamPool::new(config)
            };
            upstreams.insert(config.name.clone(), pool);
            upstream_configs.insert(config.name.clone(), config.clone());
        }

        let mut stage_lists = HashMap::new();
        for route in &settings.routes {
            stage_lists.insert(
                route.id.clone(),
                Arc::new(compile_stages(route, &settings.global)),
            );
        }

        let matcher = RouteMatcher::new(
            settings.routes.clone(),
            settings.global.max_match_body_size,
        )
        .map_err(|e| e.to_string())?;

        let trusted = settings
            .global
            .trusted_proxies
            .iter()
            .map(|c| parse_cidr(c))
            .collect::<Result<Vec<_>, _>>()?;
        let blocked = settings
            .global
            .blocked_ips
            .iter()
            .map(|c| parse_cidr(c))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            version,
            matcher,
            upstreams,
            upstream_configs,
            stage_lists,
            global: settings.global.clone(),
            trusted,
            blocked,
        })
    }

    /// Monotonic snapshot version.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// The compiled route table.
    pub fn routes(&self) -> &RouteMatcher {
        &self.matcher
    }

    /// Looks up a named upstream pool.
    pub fn upstream(&self, name: &str) -> Option<Arc<UpstreamPool>> {
        self.upstreams.get(name).cloned()
    }

    pub fn upstream_names(&self) -> impl Iterator<Item = &String> {
        self.upstreams.keys()
    }

    pub fn global_policy(&self) -> &GlobalPolicy {
        &self.global
    }

    /// Compiled stage list for a route. Routes always have one; the empty
    /// list only appears for ids foreign to this snapshot.
    pub fn stages_for(&self, route_id: &str) -> Arc<Vec<StageKind>> {
        self.stage_lists
            .get(route_id)
            .cloned()
            .unwrap_or_else(|| Arc::new(Vec::new()))
    }

    pub fn trusted_cidrs(&self) -> &[Cidr] {
        &self.trusted
    }

    pub fn blocked_cidrs(&self) -> &[Cidr] {
        &self.blocked
    }
}

/// Publishes snapshots under a single atomic reference.
pub struct SnapshotPublisher {
    current: ArcSwap<ConfigSnapshot>,
    version: AtomicU64,
    /// Raw settings backing the current snapshot, kept for pool reuse
    /// comparisons on the next publish.
    settings: arc_swap::ArcSwap<Settings>,
}

impl SnapshotPublisher {
    /// Builds and publishes the first snapshot.
    pub fn new(settings: Settings) -> Result<Self, String> {
        let snapshot = ConfigSnapshot::build(&settings, 1, None)?;
        info!(
            "Published configuration snapshot v1 ({} routes, {} upstreams)",
            settings.routes.len(),
            settings.upstreams.len()
        );
        Ok(Self {
            current: ArcSwap::from_pointee(snapshot),
            version: AtomicU64::new(1),
            settings: ArcSwap::from_pointee(settings),
        })
    }

    /// The currently published snapshot. Each request calls this exactly
    /// once, at matcher entry.
    pub fn current(&self) -> Arc<ConfigSnapshot> {
        self.current.load_full()
    }

    /// Validates, builds and atomically publishes a new snapshot.
    /// The previous snapshot stays alive until its in-flight requests
    /// complete.
    pub fn publish(&self, settings: Settings) -> Result<Arc<ConfigSnapshot>, String> {
        let version = self.version.fetch_add(1, Ordering::AcqRel) + 1;
        let previous = self.current.load_full();
        let snapshot = Arc::new(ConfigSnapshot::build(&settings, version, Some(&previous))?);
        self.current.store(snapshot.clone());
        self.settings.store(Arc::new(settings));
        info!("Published configuration snapshot v{}", version);
        Ok(snapshot)
    }

    /// Raw settings backing the current snapshot.
    pub fn settings(&self) -> Arc<Settings> {
        self.settings.load_full()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::route::{Route, RouteAction};
    use crate::models::upstream::{BackendConfig, LoadBalancingStrategy, UpstreamConfig};

    fn settings_with_upstream(backend_url: &str) -> Settings {
        let mut settings = Settings::default();
        settings.upstreams.push(UpstreamConfig {
            name: "users".to_string(),
            backends: vec![BackendConfig {
                url: backend_url.to_string(),
                weight: 1,
            }],
            strategy: LoadBalancingStrategy::RoundRobin,
            hash_key: None,
            ring_replicas: 64,
        });
        settings.routes.push(Route {
            id: "users".to_string(),
            path: "/api/users/{id}".to_string(),
            prefix: false,
            methods: vec!["GET".to_string()],
            hosts: vec![],
            headers: vec![],
            query: vec![],
            cookies: vec![],
            body: vec![],
            action: RouteAction::Proxy {
                upstream: "users".to_string(),
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
            upstream_timeout_ms: 30_000,
            deadline_ms: 60_000,
        });
        settings
    }

    #[test]
    fn publisher_increments_versions() {
        let publisher = SnapshotPublisher::new(settings_with_upstream("http://a:1")).unwrap();
        assert_eq!(publisher.current().version(), 1);

        let next = publisher.publish(settings_with_upstream("http://b:1")).unwrap();
        assert_eq!(next.version(), 2);
        assert_eq!(publisher.current().version(), 2);
    }

    #[test]
    fn bound_snapshot_survives_publish() {
        let publisher = SnapshotPublisher::new(settings_with_upstream("http://a:1")).unwrap();
        let bound = publisher.current();

        publisher.publish(settings_with_upstream("http://b:1")).unwrap();

        // The request-bound snapshot still resolves the old backend set.
        let pool = bound.upstream("users").unwrap();
        assert_eq!(pool.backends()[0].url, "http://a:1");
        let pool = publisher.current().upstream("users").unwrap();
        assert_eq!(pool.backends()[0].url, "http://b:1");
    }

    #[test]
    fn unchanged_pools_carry_runtime_state_across_reloads() {
        let publisher = SnapshotPublisher::new(settings_with_upstream("http://a:1")).unwrap();
        let pool = publisher.current().upstream("users").unwrap();
        pool.set_health("http://a:1", false);

        // Re-publish identical settings: pool instance is reused.
        publisher.publish(settings_with_upstream("http://a:1")).unwrap();
        let pool = publisher.current().upstream("users").unwrap();
        assert!(!pool.backends()[0].is_healthy());
    }

    #[test]
    fn invalid_settings_leave_current_snapshot_in_place() {
        let publisher = SnapshotPublisher::new(settings_with_upstream("http://a:1")).unwrap();
        let mut broken = settings_with_upstream("http://a:1");
        broken.routes[0].path = "no-slash".to_string();

        assert!(publisher.publish(broken).is_err());
        assert_eq!(publisher.current().version(), 1);
        assert!(publisher.current().upstream("users").is_some());
    }

    #[test]
    fn stage_lists_are_frozen_per_route() {
        let publisher = SnapshotPublisher::new(settings_with_upstream("http://a:1")).unwrap();
        let stages = publisher.current().stages_for("users");
        assert!(!stages.is_empty());
        assert!(publisher.current().stages_for("unknown").is_empty());
    }
}
