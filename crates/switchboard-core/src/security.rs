use secrecy::{ExposeSecret, SecretString};

/// Resolved credentials for one attempt. Never persisted by the gateway.
#[derive(Clone)]
pub enum Credentials {
    ApiKey(SecretString),
    OAuthToken(SecretString),
    /// OAuth token bound to a non-default endpoint (e.g. a regional or
    /// enterprise base URL).
    OAuthTokenWithEndpoint { token: SecretString, endpoint: String },
}

impl Credentials {
    pub fn api_key(key: impl Into<String>) -> Self {
        Self::ApiKey(SecretString::from(key.into()))
    }

    pub fn oauth(token: impl Into<String>) -> Self {
        Self::OAuthToken(SecretString::from(token.into()))
    }

    pub fn secret(&self) -> &str {
        match self {
            Self::ApiKey(key) => key.expose_secret(),
            Self::OAuthToken(token) | Self::OAuthTokenWithEndpoint { token, .. } => {
                token.expose_secret()
            }
        }
    }

    pub fn is_oauth(&self) -> bool {
        !matches!(self, Self::ApiKey(_))
    }

    pub fn endpoint_override(&self) -> Option<&str> {
        match self {
            Self::OAuthTokenWithEndpoint { endpoint, .. } => Some(endpoint),
            _ => None,
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ApiKey(_) => f.write_str("ApiKey([REDACTED])"),
            Self::OAuthToken(_) => f.write_str("OAuthToken([REDACTED])"),
            Self::OAuthTokenWithEndpoint { endpoint, .. } => f
                .debug_struct("OAuthTokenWithEndpoint")
                .field("endpoint", endpoint)
                .finish_non_exhaustive(),
        }
    }
}
