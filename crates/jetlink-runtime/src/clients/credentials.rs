//! Partner API keys.
//!
//! Keys are wrapped in [`SecretString`] as soon as they are read and only
//! exposed when the `Authorization` header is built.

use secrecy::{ExposeSecret, SecretString};
use std::fmt;

use jetlink_core::IntegrationError;

/// Where a key was loaded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    Config,
    Environment,
}

impl fmt::Display for CredentialSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialSource::Config => write!(f, "config"),
            CredentialSource::Environment => write!(f, "environment"),
        }
    }
}

/// A partner API key that never appears in Debug or Display output.
pub struct ApiCredential {
    value: SecretString,
    source: CredentialSource,
    name: &'static str,
}

impl ApiCredential {
    pub fn new(value: impl Into<String>, source: CredentialSource, name: &'static str) -> Self {
        Self {
            value: SecretString::from(value.into()),
            source,
            name,
        }
    }

    pub fn from_env(env_var: &str, name: &'static str) -> Result<Self, IntegrationError> {
        std::env::var(env_var)
            .map(|v| Self::new(v, CredentialSource::Environment, name))
            .map_err(|_| {
                IntegrationError::NotConfigured(format!(
                    "{} not set: configure '{}' environment variable",
                    name, env_var
                ))
            })
    }

    /// Use the configured key if present, otherwise `env_var`.
    pub fn from_config_or_env(
        configured: Option<&str>,
        env_var: &str,
        name: &'static str,
    ) -> Result<Self, IntegrationError> {
        match configured {
            Some(value) => Ok(Self::new(value, CredentialSource::Config, name)),
            None => Self::from_env(env_var, name),
        }
    }

    /// Expose the key. Call only where the header is built.
    pub fn expose(&self) -> &str {
        self.value.expose_secret()
    }

    pub fn is_empty(&self) -> bool {
        self.value.expose_secret().is_empty()
    }

    pub fn source(&self) -> CredentialSource {
        self.source
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl fmt::Debug for ApiCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiCredential")
            .field("value", &"[REDACTED]")
            .field("source", &self.source)
            .field("name", &self.name)
            .finish()
    }
}

impl fmt::Display for ApiCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} from {} [REDACTED]", self.name, self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credential_redacted() {
        let secret = "apollo-secret-123";
        let cred = ApiCredential::new(secret, CredentialSource::Config, "Apollo API key");

        let debug = format!("{:?}", cred);
        assert!(!debug.contains(secret));
        assert!(debug.contains("[REDACTED]"));

        let display = cred.to_string();
        assert!(!display.contains(secret));
        assert!(display.contains("Apollo API key"));
        assert_eq!(cred.expose(), secret);
    }

    #[test]
    fn test_configured_key_wins() {
        std::env::set_var("JETLINK_TEST_KEY_PRIORITY", "env-key");
        let cred =
            ApiCredential::from_config_or_env(Some("config-key"), "JETLINK_TEST_KEY_PRIORITY", "Test")
                .unwrap();
        assert_eq!(cred.expose(), "config-key");
        assert_eq!(cred.source(), CredentialSource::Config);
        std::env::remove_var("JETLINK_TEST_KEY_PRIORITY");
    }

    #[test]
    fn test_env_fallback_and_missing() {
        std::env::set_var("JETLINK_TEST_KEY_FALLBACK", "env-key");
        let cred = ApiCredential::from_config_or_env(None, "JETLINK_TEST_KEY_FALLBACK", "Test").unwrap();
        assert_eq!(cred.source(), CredentialSource::Environment);
        std::env::remove_var("JETLINK_TEST_KEY_FALLBACK");

        let err = ApiCredential::from_config_or_env(None, "JETLINK_TEST_KEY_ABSENT_42", "Test")
            .unwrap_err();
        assert!(matches!(err, IntegrationError::NotConfigured(_)));
        assert!(err.to_string().contains("JETLINK_TEST_KEY_ABSENT_42"));
    }
}
