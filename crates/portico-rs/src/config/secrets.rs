//! Secret resolution and redaction over the configuration shape.
//!
//! Secret-bearing leaves carry `${scheme:reference}` placeholders that a
//! pluggable provider resolves before the snapshot is built. Instead of a
//! reflective walk, the set of secret-bearing leaves is enumerated in one
//! place (`for_each_secret_leaf`), which both the resolve and the redact
//! pass share; adding a secret field to the model means adding one line
//! there.

use crate::models::settings::Settings;
use std::collections::HashMap;
use thiserror::Error;

/// Sentinel shown in redacted views.
pub const REDACTED: &str = "******";

#[derive(Error, Debug)]
pub enum SecretError {
    #[error("Unknown secret scheme '{scheme}' in '{reference}'")]
    UnknownScheme { scheme: String, reference: String },
    #[error("Secret '{reference}' could not be resolved: {message}")]
    Unresolvable { reference: String, message: String },
}

/// Resolves one secret reference for its scheme.
pub trait SecretProvider: Send + Sync {
    fn scheme(&self) -> &'static str;
    fn resolve(&self, reference: &str) -> Result<String, SecretError>;
}

/// `${env:NAME}` provider.
pub struct EnvSecretProvider;

impl SecretProvider for EnvSecretProvider {
    fn scheme(&self) -> &'static str {
        "env"
    }

    fn resolve(&self, reference: &str) -> Result<String, SecretError> {
        std::env::var(reference).map_err(|e| SecretError::Unresolvable {
            reference: reference.to_string(),
            message: e.to_string(),
        })
    }
}

/// Provider set keyed by scheme.
#[derive(Default)]
pub struct SecretResolver {
    providers: HashMap<&'static str, Box<dyn SecretProvider>>,
}

impl SecretResolver {
    pub fn new() -> Self {
        let mut resolver = Self::default();
        resolver.register(Box::new(EnvSecretProvider));
        resolver
    }

    pub fn register(&mut self, provider: Box<dyn SecretProvider>) {
        self.providers.insert(provider.scheme(), provider);
    }

    /// Resolves one value in place when it is a `${scheme:ref}` placeholder;
    /// plain values pass through untouched.
    fn resolve_value(&self, value: &str) -> Result<String, SecretError> {
        let Some(placeholder) = value.strip_prefix("${").and_then(|v| v.strip_suffix('}')) else {
            return Ok(value.to_string());
        };
        let Some((scheme, reference)) = placeholder.split_once(':') else {
            return Ok(value.to_string());
        };
        match self.providers.get(scheme) {
            Some(provider) => provider.resolve(reference),
            None => Err(SecretError::UnknownScheme {
                scheme: scheme.to_string(),
                reference: placeholder.to_string(),
            }),
        }
    }
}

/// Applies `f` to every secret-bearing leaf of the settings document.
/// The single source of truth for which fields carry secrets.
fn for_each_secret_leaf(
    settings: &mut Settings,
    f: &mut dyn FnMut(&mut String) -> Result<(), SecretError>,
) -> Result<(), SecretError> {
    if let Some(jwt) = settings.jwt.as_mut() {
        f(&mut jwt.secret)?;
    }
    if let Some(api_keys) = settings.api_keys.as_mut() {
        // Key values are the secrets; client ids are not.
        let resolved: Result<HashMap<String, String>, SecretError> = api_keys
            .keys
            .drain()
            .map(|(mut key, client)| {
                f(&mut key)?;
                Ok((key, client))
            })
            .collect();
        api_keys.keys = resolved?;
    }
    Ok(())
}

/// Resolves every `${scheme:reference}` placeholder in the settings.
/// Runs before snapshot build; an unresolvable secret fails the reload.
pub fn resolve_secrets(
    mut settings: Settings,
    resolver: &SecretResolver,
) -> Result<Settings, SecretError> {
    for_each_secret_leaf(&mut settings, &mut |leaf| {
        *leaf = resolver.resolve_value(leaf)?;
        Ok(())
    })?;
    Ok(settings)
}

/// Returns a view of the settings with every secret-bearing leaf replaced
/// by the sentinel. Safe for logs and admin output.
pub fn redact(settings: &Settings) -> Settings {
    let mut redacted = settings.clone();
    // The closure is infallible; the error type only exists to share the
    // walker with resolve_secrets.
    let _ = for_each_secret_leaf(&mut redacted, &mut |leaf| {
        *leaf = REDACTED.to_string();
        Ok(())
    });
    redacted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::settings::{ApiKeySettings, JwtSettings};

    fn settings_with_secret(secret: &str) -> Settings {
        let mut settings = Settings::default();
        settings.jwt = Some(JwtSettings {
            secret: secret.to_string(),
            issuer: None,
            audience: None,
            required_claims: vec![],
            tier_claim: None,
        });
        settings
    }

    #[test]
    fn resolves_env_placeholders() {
        std::env::set_var("PORTICO_TEST_JWT_SECRET", "resolved-secret");
        let settings = settings_with_secret("${env:PORTICO_TEST_JWT_SECRET}");
        let resolved = resolve_secrets(settings, &SecretResolver::new()).unwrap();
        assert_eq!(resolved.jwt.unwrap().secret, "resolved-secret");
    }

    #[test]
    fn plain_values_pass_through() {
        let settings = settings_with_secret("literal-secret");
        let resolved = resolve_secrets(settings, &SecretResolver::new()).unwrap();
        assert_eq!(resolved.jwt.unwrap().secret, "literal-secret");
    }

    #[test]
    fn unknown_scheme_fails() {
        let settings = settings_with_secret("${vault:kv/jwt}");
        assert!(matches!(
            resolve_secrets(settings, &SecretResolver::new()),
            Err(SecretError::UnknownScheme { .. })
        ));
    }

    #[test]
    fn redact_masks_all_secret_leaves() {
        let mut settings = settings_with_secret("super-secret");
        let mut keys = HashMap::new();
        keys.insert("key-value".to_string(), "acme".to_string());
        settings.api_keys = Some(ApiKeySettings {
            header: "x-api-key".to_string(),
            keys,
        });

        let redacted = redact(&settings);
        assert_eq!(redacted.jwt.unwrap().secret, REDACTED);
        let keys = redacted.api_keys.unwrap().keys;
        assert!(keys.contains_key(REDACTED));
        // Originals are untouched.
        assert_eq!(settings.jwt.unwrap().secret, "super-secret");
    }
}
