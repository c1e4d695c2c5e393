//! Gateway configuration file: providers, accounts and their credentials.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer};
use tracing::{debug, info};

use switchboard_core::{Account, AccountStatus, Credentials, Endpoint, GatewayError};
use switchboard_stream::{
    Dialect, HttpProvider, HttpTransport, ThinkingTags, CONNECT_TIMEOUT, SSE_IDLE_TIMEOUT,
};

use crate::orchestrator::ProviderRoute;
use crate::registry::{InMemoryRegistry, DEFAULT_QUOTA_COOLDOWN};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("account {account} references unknown provider {provider}")]
    UnknownProvider { account: String, provider: String },
    #[error("duplicate account id {0}")]
    DuplicateAccount(String),
    #[error("provider {provider} has an empty thinking marker")]
    InvalidThinkingTags { provider: String },
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    pub endpoint: String,
    #[serde(default)]
    pub dialect: Dialect,
    #[serde(default)]
    pub load_balance: bool,
    #[serde(default)]
    pub thinking_tags: Option<ThinkingTags>,
    #[serde(default)]
    pub connect_timeout_secs: Option<u64>,
    #[serde(default)]
    pub idle_timeout_secs: Option<u64>,
}

impl ProviderConfig {
    fn connect_timeout(&self) -> Duration {
        self.connect_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(CONNECT_TIMEOUT)
    }

    fn idle_timeout(&self) -> Duration {
        self.idle_timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(SSE_IDLE_TIMEOUT)
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AccountConfig {
    pub id: String,
    pub provider: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub is_default: bool,
    #[serde(default)]
    pub status: AccountStatus,
    /// Defaults to the account's position in the file, so file order is
    /// rotation order.
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "secret")]
    pub api_key: Option<SecretString>,
    #[serde(default, deserialize_with = "secret")]
    pub oauth_token: Option<SecretString>,
    #[serde(default)]
    pub endpoint_override: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

fn secret<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.map(SecretString::from))
}

impl AccountConfig {
    fn credentials(&self) -> Option<Credentials> {
        if let Some(token) = &self.oauth_token {
            return Some(match &self.endpoint_override {
                Some(endpoint) => Credentials::OAuthTokenWithEndpoint {
                    token: token.clone(),
                    endpoint: endpoint.clone(),
                },
                None => Credentials::OAuthToken(token.clone()),
            });
        }
        self.api_key
            .as_ref()
            .filter(|key| !key.expose_secret().is_empty())
            .map(|key| Credentials::ApiKey(key.clone()))
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
    #[serde(default)]
    pub quota_cooldown_secs: Option<u64>,
}

impl GatewayConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_json(&raw)?;
        info!(
            path = %path.display(),
            providers = config.providers.len(),
            accounts = config.accounts.len(),
            "loaded gateway config"
        );
        Ok(config)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (key, provider) in &self.providers {
            if provider
                .thinking_tags
                .as_ref()
                .is_some_and(|tags| !tags.is_usable())
            {
                return Err(ConfigError::InvalidThinkingTags {
                    provider: key.clone(),
                });
            }
        }

        let mut seen = HashSet::new();
        for account in &self.accounts {
            if !self.providers.contains_key(&account.provider) {
                return Err(ConfigError::UnknownProvider {
                    account: account.id.clone(),
                    provider: account.provider.clone(),
                });
            }
            if !seen.insert(account.id.as_str()) {
                return Err(ConfigError::DuplicateAccount(account.id.clone()));
            }
        }
        Ok(())
    }

    pub fn quota_cooldown(&self) -> Duration {
        self.quota_cooldown_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_QUOTA_COOLDOWN)
    }

    pub fn build_registry(&self) -> InMemoryRegistry {
        let registry = InMemoryRegistry::new().with_quota_cooldown(self.quota_cooldown());
        for (index, entry) in self.accounts.iter().enumerate() {
            let created_at = entry
                .created_at
                .or_else(|| Utc.timestamp_opt(index as i64, 0).single())
                .unwrap_or_default();
            let mut account = Account::new(entry.id.clone(), entry.provider.clone(), created_at)
                .with_default(entry.is_default)
                .with_status(entry.status);
            if let Some(name) = &entry.display_name {
                account.display_name = name.clone();
            }

            let credentials = entry.credentials();
            if credentials.is_none() {
                debug!(account = %entry.id, "account has no inline credentials");
            }
            registry.insert_expiring(account, credentials, entry.expires_at);
        }
        registry
    }

    pub fn routes(&self) -> Vec<(String, ProviderRoute)> {
        self.providers
            .iter()
            .map(|(key, provider)| {
                let route = ProviderRoute::new(Endpoint::new(key.clone(), provider.endpoint.clone()))
                    .with_load_balance(provider.load_balance)
                    .with_thinking_tags(provider.thinking_tags.clone().unwrap_or_default())
                    .with_timeouts(provider.connect_timeout(), provider.idle_timeout());
                (key.clone(), route)
            })
            .collect()
    }

    /// HTTP transport wired with each provider's dialect and idle timeout.
    pub fn http_transport(&self) -> Result<HttpTransport, GatewayError> {
        let connect_timeout = self
            .providers
            .values()
            .map(ProviderConfig::connect_timeout)
            .max()
            .unwrap_or(CONNECT_TIMEOUT);
        let mut transport = HttpTransport::new(connect_timeout)?;
        for (key, provider) in &self.providers {
            transport = transport.with_provider(
                key.clone(),
                HttpProvider {
                    dialect: provider.dialect,
                    idle_timeout: provider.idle_timeout(),
                },
            );
        }
        Ok(transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::AccountRegistry;
    use switchboard_core::AccountId;

    const SAMPLE: &str = r#"{
        "providers": {
            "openai": { "endpoint": "https://api.openai.com/v1", "load_balance": true },
            "anthropic": {
                "endpoint": "https://api.anthropic.com",
                "dialect": "anthropic_messages",
                "thinking_tags": { "open": "<reasoning>", "close": "</reasoning>" },
                "idle_timeout_secs": 30
            }
        },
        "accounts": [
            { "id": "oa-1", "provider": "openai", "api_key": "sk-one" },
            { "id": "oa-2", "provider": "openai", "api_key": "sk-two", "is_default": true },
            { "id": "an-1", "provider": "anthropic", "oauth_token": "tok",
              "endpoint_override": "https://eu.anthropic.example" },
            { "id": "oa-3", "provider": "openai", "status": "disabled" }
        ],
        "quota_cooldown_secs": 15
    }"#;

    #[test]
    fn parses_sample() {
        let config = GatewayConfig::from_json(SAMPLE).unwrap();
        assert_eq!(config.providers.len(), 2);
        assert_eq!(config.providers["anthropic"].dialect, Dialect::AnthropicMessages);
        assert_eq!(config.providers["openai"].dialect, Dialect::OpenaiChat);
        assert_eq!(config.quota_cooldown(), Duration::from_secs(15));
    }

    #[test]
    fn routes_carry_provider_settings() {
        let config = GatewayConfig::from_json(SAMPLE).unwrap();
        let routes: HashMap<_, _> = config.routes().into_iter().collect();

        let openai = &routes["openai"];
        assert!(openai.load_balance);
        assert_eq!(openai.endpoint.base_url, "https://api.openai.com/v1");
        assert_eq!(openai.idle_timeout, SSE_IDLE_TIMEOUT);

        let anthropic = &routes["anthropic"];
        assert!(!anthropic.load_balance);
        assert_eq!(anthropic.thinking_tags.open, "<reasoning>");
        assert_eq!(anthropic.idle_timeout, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn registry_from_config() {
        let registry = GatewayConfig::from_json(SAMPLE).unwrap().build_registry();

        let openai = registry.list_accounts("openai").await.unwrap();
        assert_eq!(openai.len(), 3);
        let default = openai.iter().find(|a| a.is_default).unwrap();
        assert_eq!(default.id.as_str(), "oa-2");
        // File order becomes creation order.
        assert!(openai[0].created_at < openai[1].created_at);

        let oauth = registry
            .get_credentials(&AccountId::from_raw("an-1"))
            .await
            .unwrap()
            .unwrap();
        assert!(oauth.is_oauth());
        assert_eq!(oauth.endpoint_override(), Some("https://eu.anthropic.example"));

        assert!(registry
            .get_credentials(&AccountId::from_raw("oa-3"))
            .await
            .unwrap()
            .is_none());
    }

    #[test]
    fn rejects_unknown_provider() {
        let raw = r#"{ "accounts": [ { "id": "x", "provider": "nowhere", "api_key": "k" } ] }"#;
        assert!(matches!(
            GatewayConfig::from_json(raw),
            Err(ConfigError::UnknownProvider { .. })
        ));
    }

    #[test]
    fn rejects_duplicate_accounts() {
        let raw = r#"{
            "providers": { "p": { "endpoint": "https://p" } },
            "accounts": [
                { "id": "a", "provider": "p" },
                { "id": "a", "provider": "p" }
            ]
        }"#;
        assert!(matches!(
            GatewayConfig::from_json(raw),
            Err(ConfigError::DuplicateAccount(id)) if id == "a"
        ));
    }

    #[test]
    fn rejects_empty_thinking_markers() {
        for tags in [
            r#"{ "open": "", "close": "" }"#,
            r#"{ "open": "<think>", "close": "" }"#,
        ] {
            let raw = format!(
                r#"{{ "providers": {{ "p": {{ "endpoint": "https://p", "thinking_tags": {tags} }} }} }}"#
            );
            assert!(matches!(
                GatewayConfig::from_json(&raw),
                Err(ConfigError::InvalidThinkingTags { provider }) if provider == "p"
            ));
        }
    }

    #[test]
    fn rejects_unknown_fields() {
        let raw = r#"{ "providers": { "p": { "endpoint": "https://p", "retries": 3 } } }"#;
        assert!(matches!(GatewayConfig::from_json(raw), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn missing_file() {
        let err = GatewayConfig::from_file(Path::new("/nonexistent/gateway.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
        assert!(err.to_string().contains("/nonexistent/gateway.json"));
    }
}
