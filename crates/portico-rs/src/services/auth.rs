//! Pluggable authentication providers.
//!
//! Providers are registered by method name (`api_key`, `jwt`, `oauth`,
//! `mtls`, `external`, ...) and tried in the order the route lists them.
//! The first provider that recognizes credentials decides; a provider
//! error (as opposed to rejected credentials) can be turned into an allow
//! by the route's `fail_open` flag.

use crate::models::error::GatewayError;
use crate::models::http::GatewayRequest;
use crate::models::settings::{ApiKeySettings, JwtSettings};
use async_trait::async_trait;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use log::debug;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

/// Authenticated caller identity carried in the request context.
#[derive(Debug, Clone)]
pub struct Identity {
    pub client_id: String,
    pub roles: Vec<String>,
    /// Raw claims for claim-keyed policies (rate-limit tiers, breaker
    /// tenants).
    pub claims: serde_json::Map<String, serde_json::Value>,
    /// Provider method that produced this identity.
    pub method: &'static str,
}

impl Identity {
    /// Tier attribute used by tiered rate limits, when present.
    pub fn tier(&self, claim: &str) -> Option<String> {
        self.claims.get(claim).and_then(|v| v.as_str()).map(|s| s.to_string())
    }
}

/// One authentication mechanism.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Method name routes reference (`api_key`, `jwt`, ...).
    fn method(&self) -> &'static str;

    /// Authenticates the request. `Err(MissingCredentials)` signals that
    /// this provider found nothing to evaluate so the next provider in the
    /// route's list is consulted.
    async fn authenticate(&self, req: &GatewayRequest) -> Result<Identity, GatewayError>;
}

/// Static API key table checked against a configurable header.
pub struct ApiKeyProvider {
    header: String,
    keys: HashMap<String, String>,
}

impl ApiKeyProvider {
    pub fn new(settings: &ApiKeySettings) -> Self {
        Self {
            header: settings.header.clone(),
            keys: settings.keys.clone(),
        }
    }
}

#[async_trait]
impl AuthProvider for ApiKeyProvider {
    fn method(&self) -> &'static str {
        "api_key"
    }

    async fn authenticate(&self, req: &GatewayRequest) -> Result<Identity, GatewayError> {
        let Some(presented) = req.header(&self.header) else {
            return Err(GatewayError::MissingCredentials);
        };
        match self.keys.get(presented) {
            Some(client_id) => Ok(Identity {
                client_id: client_id.clone(),
                roles: Vec::new(),
                claims: serde_json::Map::new(),
                method: "api_key",
            }),
            None => Err(GatewayError::InvalidCredentials {
                reason: "unknown API key".to_string(),
            }),
        }
    }
}

/// JWT bearer-token validation backed by `jsonwebtoken`.
///
/// Revocation and JWKS refresh are exposed so an out-of-band process can
/// feed them; validation itself is local and synchronous.
pub struct JwtProvider {
    settings: JwtSettings,
    decoding_key: DecodingKey,
    validation: Validation,
    revoked: RwLock<HashSet<String>>,
}

impl JwtProvider {
    pub fn new(settings: JwtSettings) -> Self {
        let decoding_key = DecodingKey::from_secret(settings.secret.as_bytes());
        let mut validation = Validation::new(Algorithm::HS256);
        validation.required_spec_claims = settings
            .required_claims
            .iter()
            .cloned()
            .collect::<HashSet<_>>();
        if let Some(issuer) = &settings.issuer {
            validation.set_issuer(&[issuer]);
        }
        if let Some(audience) = &settings.audience {
            validation.set_audience(&[audience]);
        } else {
            validation.validate_aud = false;
        }
        Self {
            settings,
            decoding_key,
            validation,
            revoked: RwLock::new(HashSet::new()),
        }
    }

    /// Whether a token id (`jti`) has been revoked.
    pub fn revoked(&self, token_id: &str) -> bool {
        self.revoked
            .read()
            .expect("revocation lock poisoned")
            .contains(token_id)
    }

    /// Marks a token id revoked. Fed by an external revocation feed.
    pub fn revoke(&self, token_id: &str) {
        self.revoked
            .write()
            .expect("revocation lock poisoned")
            .insert(token_id.to_string());
    }

    /// Re-fetches signing keys. Symmetric secrets have nothing to refresh;
    /// the hook exists for asymmetric deployments layered on top.
    pub fn refresh_jwks(&self) {
        debug!("refresh_jwks: static secret in use, nothing to refresh");
    }

    pub fn tier_claim(&self) -> Option<&str> {
        self.settings.tier_claim.as_deref()
    }
}

#[async_trait]
impl AuthProvider for JwtProvider {
    fn method(&self) -> &'static str {
        "jwt"
    }

    async fn authenticate(&self, req: &GatewayRequest) -> Result<Identity, GatewayError> {
        let Some(header) = req.header("authorization") else {
            return Err(GatewayError::MissingCredentials);
        };
        let Some(token) = header.strip_prefix("Bearer ") else {
            return Err(GatewayError::MissingCredentials);
        };

        let data = decode::<serde_json::Map<String, serde_json::Value>>(
            token,
            &self.decoding_key,
            &self.validation,
        )
        .map_err(|e| GatewayError::InvalidCredentials {
            reason: e.to_string(),
        })?;

        let claims = data.claims;

        if let Some(jti) = claims.get("jti").and_then(|v| v.as_str()) {
            if self.revoked(jti) {
                return Err(GatewayError::InvalidCredentials {
                    reason: "token revoked".to_string(),
                });
            }
        }

        let client_id = claims
            .get("sub")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown")
            .to_string();
        let roles = claims
            .get("roles")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(|s| s.to_string()))
                    .collect()
            })
            .unwrap_or_default();

        Ok(Identity {
            client_id,
            roles,
            claims,
            method: "jwt",
        })
    }
}

/// Providers indexed by method name.
#[derive(Default)]
pub struct AuthRegistry {
    providers: HashMap<&'static str, Arc<dyn AuthProvider>>,
}

impl AuthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn AuthProvider>) {
        self.providers.insert(provider.method(), provider);
    }

    pub fn get(&self, method: &str) -> Option<&Arc<dyn AuthProvider>> {
        self.providers.get(method)
    }

    /// Tries the route's providers in order. The first definite answer
    /// (identity or rejected credentials) wins; `MissingCredentials` moves
    /// on to the next method.
    pub async fn authenticate(
        &self,
        methods: &[String],
        req: &GatewayRequest,
    ) -> Result<Identity, GatewayError> {
        for method in methods {
            let Some(provider) = self.get(method) else {
                return Err(GatewayError::Config {
                    message: format!("unknown auth provider '{}'", method),
                    route: String::new(),
                });
            };
            match provider.authenticate(req).await {
                Ok(identity) => return Ok(identity),
                Err(GatewayError::MissingCredentials) => continue,
                Err(other) => return Err(other),
            }
        }
        Err(GatewayError::MissingCredentials)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::http::header::HeaderMap;
    use actix_web::http::Method;
    use bytes::Bytes;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn request_with_header(name: &'static str, value: &str) -> GatewayRequest {
        let mut headers = HeaderMap::new();
        headers.insert(
            actix_web::http::header::HeaderName::from_static(name),
            value.parse().unwrap(),
        );
        GatewayRequest {
            method: Method::GET,
            scheme: "http".to_string(),
            host: "localhost".to_string(),
            path: "/".to_string(),
            raw_query: String::new(),
            headers,
            body: Bytes::new(),
            peer_addr: None,
            tls: false,
        }
    }

    fn jwt_settings(secret: &str) -> JwtSettings {
        JwtSettings {
            secret: secret.to_string(),
            issuer: None,
            audience: None,
            required_claims: vec!["sub".to_string(), "exp".to_string()],
            tier_claim: Some("tier".to_string()),
        }
    }

    fn token(secret: &str, claims: serde_json::Value) -> String {
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn future_exp() -> i64 {
        chrono::Utc::now().timestamp() + 3_600
    }

    #[tokio::test]
    async fn api_key_provider_resolves_client() {
        let mut keys = HashMap::new();
        keys.insert("secret-1".to_string(), "acme".to_string());
        let provider = ApiKeyProvider::new(&ApiKeySettings {
            header: "x-api-key".to_string(),
            keys,
        });

        let req = request_with_header("x-api-key", "secret-1");
        let identity = provider.authenticate(&req).await.unwrap();
        assert_eq!(identity.client_id, "acme");

        let bad = request_with_header("x-api-key", "wrong");
        assert!(matches!(
            provider.authenticate(&bad).await,
            Err(GatewayError::InvalidCredentials { .. })
        ));
    }

    #[tokio::test]
    async fn jwt_provider_validates_and_extracts_claims() {
        let provider = JwtProvider::new(jwt_settings("test-secret"));
        let jwt = token(
            "test-secret",
            serde_json::json!({
                "sub": "user-7",
                "exp": future_exp(),
                "roles": ["admin"],
                "tier": "gold"
            }),
        );

        let req = request_with_header("authorization", &format!("Bearer {}", jwt));
        let identity = provider.authenticate(&req).await.unwrap();
        assert_eq!(identity.client_id, "user-7");
        assert_eq!(identity.roles, vec!["admin".to_string()]);
        assert_eq!(identity.tier("tier").as_deref(), Some("gold"));
    }

    #[tokio::test]
    async fn jwt_provider_rejects_bad_signature_and_revoked_tokens() {
        let provider = JwtProvider::new(jwt_settings("test-secret"));

        let forged = token(
            "other-secret",
            serde_json::json!({"sub": "x", "exp": future_exp()}),
        );
        let req = request_with_header("authorization", &format!("Bearer {}", forged));
        assert!(matches!(
            provider.authenticate(&req).await,
            Err(GatewayError::InvalidCredentials { .. })
        ));

        let jwt = token(
            "test-secret",
            serde_json::json!({"sub": "x", "exp": future_exp(), "jti": "tok-1"}),
        );
        provider.revoke("tok-1");
        let req = request_with_header("authorization", &format!("Bearer {}", jwt));
        assert!(matches!(
            provider.authenticate(&req).await,
            Err(GatewayError::InvalidCredentials { .. })
        ));
    }

    #[tokio::test]
    async fn registry_falls_through_on_missing_credentials() {
        let mut registry = AuthRegistry::new();
        let mut keys = HashMap::new();
        keys.insert("k".to_string(), "acme".to_string());
        registry.register(Arc::new(ApiKeyProvider::new(&ApiKeySettings {
            header: "x-api-key".to_string(),
            keys,
        })));
        registry.register(Arc::new(JwtProvider::new(jwt_settings("s"))));

        // No API key header, but a valid JWT: second method answers.
        let jwt = token("s", serde_json::json!({"sub": "u", "exp": future_exp()}));
        let req = request_with_header("authorization", &format!("Bearer {}", jwt));
        let identity = registry
            .authenticate(&["api_key".to_string(), "jwt".to_string()], &req)
            .await
            .unwrap();
        assert_eq!(identity.method, "jwt");

        // Neither present: missing credentials.
        let bare = request_with_header("x-other", "1");
        assert!(matches!(
            registry
                .authenticate(&["api_key".to_string(), "jwt".to_string()], &bare)
                .await,
            Err(GatewayError::MissingCredentials)
        ));
    }
}
