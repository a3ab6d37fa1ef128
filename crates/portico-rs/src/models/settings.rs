//! Application configuration settings for the portico gateway.
//!
//! `Settings` is the deserialized form of the configuration file. It is
//! validated, secret-resolved and then compiled into an immutable
//! [`ConfigSnapshot`](crate::config::snapshot::ConfigSnapshot); the running
//! gateway never reads `Settings` directly.

use crate::models::policy::GlobalPolicy;
use crate::models::route::Route;
use crate::models::upstream::UpstreamConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// JWT validation parameters for the `jwt` auth provider.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct JwtSettings {
    /// HMAC secret for signature validation. Supports `${env:NAME}`
    /// placeholders resolved by the secrets pass.
    pub secret: String,

    /// Optional expected issuer for `iss` claim validation.
    #[serde(default)]
    pub issuer: Option<String>,

    /// Optional expected audience for `aud` claim validation.
    #[serde(default)]
    pub audience: Option<String>,

    /// Claim names that must be present in valid tokens.
    #[serde(default = "default_required_claims")]
    pub required_claims: Vec<String>,

    /// Claim carrying the rate-limit tier name, when tiered limits key off
    /// the token.
    #[serde(default)]
    pub tier_claim: Option<String>,
}

fn default_required_claims() -> Vec<String> {
    vec!["sub".to_string(), "exp".to_string()]
}

/// Static API key table for the `api_key` auth provider.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ApiKeySettings {
    /// Header carrying the key.
    #[serde(default = "default_api_key_header")]
    pub header: String,
    /// Key value -> client id. Values support `${scheme:ref}` placeholders.
    #[serde(default)]
    pub keys: HashMap<String, String>,
}

fn default_api_key_header() -> String {
    "x-api-key".to_string()
}

/// Root configuration document.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Settings {
    /// Configuration schema version for compatibility checking.
    pub version: u8,

    /// Route table in declaration order; insertion order is the matcher's
    /// stable tie-break.
    #[serde(default)]
    pub routes: Vec<Route>,

    /// Named upstream pools referenced by proxy routes.
    #[serde(default)]
    pub upstreams: Vec<UpstreamConfig>,

    /// Process-wide policy defaults.
    #[serde(default)]
    pub global: GlobalPolicy,

    #[serde(default)]
    pub jwt: Option<JwtSettings>,

    #[serde(default)]
    pub api_keys: Option<ApiKeySettings>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            version: 1,
            routes: Vec::new(),
            upstreams: Vec::new(),
            global: GlobalPolicy::default(),
            jwt: None,
            api_keys: None,
        }
    }
}

impl Settings {
    /// Validates the complete document. Collects the first error; the
    /// comprehensive validator in `config::validation` reports all of them
    /// with warnings.
    pub fn validate(&self) -> Result<(), String> {
        if self.version != 1 {
            return Err(format!("Unsupported configuration version: {}", self.version));
        }

        let mut seen_ids = std::collections::HashSet::new();
        for route in &self.routes {
            route.validate()?;
            if !seen_ids.insert(route.id.as_str()) {
                return Err(format!("Duplicate route id: {}", route.id));
            }
        }

        let mut seen_upstreams = std::collections::HashSet::new();
        for upstream in &self.upstreams {
            upstream.validate()?;
            if !seen_upstreams.insert(upstream.name.as_str()) {
                return Err(format!("Duplicate upstream name: {}", upstream.name));
            }
        }

        // Every proxy-like action must reference a declared upstream.
        for route in &self.routes {
            for name in referenced_upstreams(route) {
                if !seen_upstreams.contains(name) {
                    return Err(format!(
                        "Route {} references unknown upstream '{}'",
                        route.id, name
                    ));
                }
            }
        }

        self.global.validate()
    }
}

/// Upstream names referenced by a route's action and traffic split.
pub fn referenced_upstreams(route: &Route) -> Vec<&str> {
    use crate::models::route::RouteAction;

    let mut names = Vec::new();
    match &route.action {
        RouteAction::Proxy { upstream } => names.push(upstream.as_str()),
        RouteAction::Sequence { steps } => {
            names.extend(steps.iter().map(|s| s.upstream.as_str()));
        }
        RouteAction::Aggregate { branches } => {
            names.extend(branches.iter().map(|b| b.upstream.as_str()));
        }
        RouteAction::Mock { .. } | RouteAction::Echo | RouteAction::Static { .. } => {}
    }
    if let Some(split) = &route.traffic_split {
        names.push(split.upstream.as_str());
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::route::RouteAction;

    #[test]
    fn default_settings_validate() {
        assert!(Settings::default().validate().is_ok());
    }

    #[test]
    fn rejects_unknown_upstream_reference() {
        let mut settings = Settings::default();
        settings.routes.push(Route {
            id: "r1".to_string(),
            path: "/api".to_string(),
            prefix: false,
            methods: vec![],
            hosts: vec![],
            headers: vec![],
            query: vec![],
            cookies: vec![],
            body: vec![],
            action: RouteAction::Proxy {
                upstream: "missing".to_string(),
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

        let err = settings.validate().unwrap_err();
        assert!(err.contains("unknown upstream"));
    }

    #[test]
    fn rejects_duplicate_route_ids() {
        let mut settings = Settings::default();
        for _ in 0..2 {
            settings.routes.push(Route {
                id: "dup".to_string(),
                path: "/x".to_string(),
                prefix: false,
                methods: vec![],
                hosts: vec![],
                headers: vec![],
                query: vec![],
                cookies: vec![],
                body: vec![],
                action: RouteAction::Echo,
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
        }
        let err = settings.validate().unwrap_err();
        assert!(err.contains("Duplicate route id"));
    }

    #[test]
    fn settings_roundtrip_json() {
        let json = r#"{
            "version": 1,
            "upstreams": [
                {"name": "users", "backends": [{"url": "http://users:8080"}]}
            ],
            "routes": [
                {
                    "id": "users",
                    "path": "/api/users/{id}",
                    "methods": ["GET"],
                    "action": {"type": "proxy", "upstream": "users"}
                }
            ]
        }"#;
        let settings: Settings = serde_json::from_str(json).unwrap();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.routes[0].upstream_timeout_ms, 30_000);
        assert_eq!(settings.upstreams[0].backends[0].weight, 1);
    }
}
