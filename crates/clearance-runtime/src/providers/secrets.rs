//! Provider keys.
//!
//! A key is wrapped in [`ApiCredential`] the moment it is read from settings
//! or the environment, and is only unwrapped when a request header is built.

use secrecy::{ExposeSecret, SecretString};
use std::fmt;

use super::ProviderError;

/// Where a key came from. Logged instead of the key itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    /// `api_key` in the runtime settings
    Settings,
    /// An environment variable
    Environment,
    /// Passed in by the embedding application
    Explicit,
}

impl fmt::Display for CredentialSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CredentialSource::Settings => "settings",
            CredentialSource::Environment => "environment",
            CredentialSource::Explicit => "explicit",
        })
    }
}

/// Provider API key. `Debug` never prints the key.
#[derive(Clone)]
pub struct ApiCredential {
    key: SecretString,
    source: CredentialSource,
    label: &'static str,
}

impl ApiCredential {
    /// Wrap a key supplied by the caller.
    pub fn explicit(key: impl Into<String>, label: &'static str) -> Self {
        Self::wrap(key.into(), CredentialSource::Explicit, label)
    }

    /// Settings value when it is non-blank, otherwise `env_var`.
    pub fn resolve(
        configured: Option<&str>,
        env_var: &str,
        label: &'static str,
    ) -> Result<Self, ProviderError> {
        Self::resolve_with(configured, env_var, label, |name| std::env::var(name).ok())
    }

    fn resolve_with(
        configured: Option<&str>,
        env_var: &str,
        label: &'static str,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ProviderError> {
        if let Some(key) = configured.filter(|k| !k.trim().is_empty()) {
            return Ok(Self::wrap(key.to_string(), CredentialSource::Settings, label));
        }
        match lookup(env_var) {
            Some(key) if !key.trim().is_empty() => {
                Ok(Self::wrap(key, CredentialSource::Environment, label))
            }
            _ => Err(ProviderError::NotConfigured(format!(
                "{} missing: set `api_key` in the settings or the {} environment variable",
                label, env_var
            ))),
        }
    }

    fn wrap(key: String, source: CredentialSource, label: &'static str) -> Self {
        Self {
            key: SecretString::from(key.trim().to_string()),
            source,
            label,
        }
    }

    /// The raw key, for building the request header.
    pub fn expose(&self) -> &str {
        self.key.expose_secret()
    }

    pub fn source(&self) -> CredentialSource {
        self.source
    }
}

impl fmt::Debug for ApiCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ApiCredential({} from {}, ****)", self.label, self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "0123456789abcdef0123456789abcdef";

    fn env_with(value: Option<&'static str>) -> impl Fn(&str) -> Option<String> {
        move |_| value.map(str::to_string)
    }

    #[test]
    fn test_debug_hides_key() {
        let cred = ApiCredential::explicit(KEY, "Azure OpenAI key");
        let debug = format!("{:?}", cred);
        assert!(!debug.contains(KEY));
        assert_eq!(debug, "ApiCredential(Azure OpenAI key from explicit, ****)");
    }

    #[test]
    fn test_settings_win_over_environment() {
        let cred = ApiCredential::resolve_with(Some(KEY), "AZURE_OPENAI_KEY", "key", env_with(Some("env-key")))
            .unwrap();
        assert_eq!(cred.source(), CredentialSource::Settings);
        assert_eq!(cred.expose(), KEY);
    }

    #[test]
    fn test_blank_setting_falls_back_to_environment() {
        let cred = ApiCredential::resolve_with(Some("   "), "AZURE_OPENAI_KEY", "key", env_with(Some(" env-key\n")))
            .unwrap();
        assert_eq!(cred.source(), CredentialSource::Environment);
        assert_eq!(cred.expose(), "env-key");
    }

    #[test]
    fn test_missing_everywhere_names_the_variable() {
        let err = ApiCredential::resolve_with(None, "AZURE_OPENAI_KEY", "Azure OpenAI key", env_with(None))
            .unwrap_err();
        assert!(matches!(err, ProviderError::NotConfigured(_)));
        assert!(err.to_string().contains("AZURE_OPENAI_KEY"));
    }
}
