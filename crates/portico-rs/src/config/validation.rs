//! Comprehensive configuration validation.
//!
//! Unlike `Settings::validate`, which stops at the first error, this
//! validator walks the whole document and collects every error and
//! warning so operators can fix a config in one pass. It runs before the
//! first snapshot is published and on every reload.

use crate::models::route::RouteAction;
use crate::models::settings::{referenced_upstreams, Settings};
use std::collections::HashSet;

/// Result of a comprehensive validation pass.
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

pub struct ConfigValidator;

impl ConfigValidator {
    /// Validates the complete settings document, collecting all findings.
    pub fn validate_comprehensive(settings: &Settings) -> ValidationResult {
        let mut result = ValidationResult::default();

        if settings.version != 1 {
            result
                .errors
                .push(format!("Unsupported configuration version: {}", settings.version));
        }

        if settings.routes.is_empty() {
            result
                .warnings
                .push("No routes configured; every request will answer 404".to_string());
        }

        let mut route_ids = HashSet::new();
        for route in &settings.routes {
            if let Err(e) = route.validate() {
                result.errors.push(e);
            }
            if !route_ids.insert(route.id.clone()) {
                result.errors.push(format!("Duplicate route id: {}", route.id));
            }
            if route.auth.is_none() && matches!(route.action, RouteAction::Proxy { .. }) {
                if route.path.contains("/admin") {
                    result.warnings.push(format!(
                        "Route {} proxies an admin-looking path without authentication",
                        route.id
                    ));
                }
            }
            if let Some(cache) = &route.cache {
                if cache.allow_authorization {
                    result.warnings.push(format!(
                        "Route {} caches responses to authorized requests; ensure key_headers \
                         include the credential discriminator",
                        route.id
                    ));
                }
            }
            if route.upstream_timeout_ms > route.deadline_ms {
                result.warnings.push(format!(
                    "Route {}: upstream timeout exceeds the request deadline",
                    route.id
                ));
            }
        }

        let mut upstream_names = HashSet::new();
        for upstream in &settings.upstreams {
            if let Err(e) = upstream.validate() {
                result.errors.push(e);
            }
            if !upstream_names.insert(upstream.name.clone()) {
                result
                    .errors
                    .push(format!("Duplicate upstream name: {}", upstream.name));
            }
        }

        for route in &settings.routes {
            for name in referenced_upstreams(route) {
                if !upstream_names.contains(name) {
                    result.errors.push(format!(
                        "Route {} references unknown upstream '{}'",
                        route.id, name
                    ));
                }
            }
        }

        for upstream in &settings.upstreams {
            let referenced = settings
                .routes
                .iter()
                .any(|r| referenced_upstreams(r).contains(&upstream.name.as_str()));
            if !referenced {
                result
                    .warnings
                    .push(format!("Upstream '{}' is not referenced by any route", upstream.name));
            }
        }

        if let Err(e) = settings.global.validate() {
            result.errors.push(e);
        }

        if let Some(jwt) = &settings.jwt {
            if jwt.secret.len() < 16 && !jwt.secret.starts_with("${") {
                result
                    .warnings
                    .push("JWT secret is shorter than 16 bytes".to_string());
            }
        }

        result.is_valid = result.errors.is_empty();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::route::Route;
    use crate::models::upstream::{BackendConfig, LoadBalancingStrategy, UpstreamConfig};

    fn proxy_route(id: &str, upstream: &str) -> Route {
        Route {
            id: id.to_string(),
            path: format!("/{}", id),
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
            upstream_timeout_ms: 30_000,
            deadline_ms: 60_000,
        }
    }

    #[test]
    fn collects_multiple_errors() {
        let mut settings = Settings::default();
        settings.routes.push(proxy_route("a", "missing-1"));
        settings.routes.push(proxy_route("b", "missing-2"));

        let result = ConfigValidator::validate_comprehensive(&settings);
        assert!(!result.is_valid);
        assert_eq!(result.errors.len(), 2);
    }

    #[test]
    fn warns_on_unreferenced_upstream() {
        let mut settings = Settings::default();
        settings.upstreams.push(UpstreamConfig {
            name: "orphan".to_string(),
            backends: vec![BackendConfig {
                url: "http://x:1".to_string(),
                weight: 1,
            }],
            strategy: LoadBalancingStrategy::RoundRobin,
            hash_key: None,
            ring_replicas: 64,
        });

        let result = ConfigValidator::validate_comprehensive(&settings);
        assert!(result.is_valid);
        assert!(result
            .warnings
            .iter()
            .any(|w| w.contains("not referenced")));
    }

    #[test]
    fn timeout_exceeding_deadline_is_a_warning() {
        let mut settings = Settings::default();
        let mut route = proxy_route("a", "u");
        route.upstream_timeout_ms = 90_000;
        route.deadline_ms = 60_000;
        settings.routes.push(route);
        settings.upstreams.push(UpstreamConfig {
            name: "u".to_string(),
            backends: vec![BackendConfig {
                url: "http://x:1".to_string(),
                weight: 1,
            }],
            strategy: LoadBalancingStrategy::RoundRobin,
            hash_key: None,
            ring_replicas: 64,
        });

        let result = ConfigValidator::validate_comprehensive(&settings);
        assert!(result.is_valid);
        assert!(result.warnings.iter().any(|w| w.contains("deadline")));
    }
}
