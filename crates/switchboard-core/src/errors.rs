use std::fmt;
use std::time::Duration;

use serde_json::Value;

/// Which part of the transport failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportKind {
    Connect,
    Read,
    Timeout,
    /// Upstream answered with a transient 5xx / overloaded status.
    Server(u16),
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect => f.write_str("connect"),
            Self::Read => f.write_str("read"),
            Self::Timeout => f.write_str("timeout"),
            Self::Server(status) => write!(f, "server {status}"),
        }
    }
}

/// Long-term exhaustion vs. short-term throttling. Both allow failover.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QuotaKind {
    Exhausted,
    RateLimited,
}

impl fmt::Display for QuotaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exhausted => f.write_str("quota exhausted"),
            Self::RateLimited => f.write_str("rate limited"),
        }
    }
}

/// Classified error taxonomy for upstream streaming requests.
#[derive(Clone, Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("transport error ({kind}): {message}")]
    Transport { kind: TransportKind, message: String },

    #[error("{kind}: {message}")]
    Quota {
        kind: QuotaKind,
        status: Option<u16>,
        retry_after: Option<Duration>,
        message: String,
    },

    #[error("authentication failed: {message}")]
    Auth { status: Option<u16>, message: String },

    /// A single malformed delta. Never fatal to the stream.
    #[error("malformed delta: {0}")]
    Protocol(String),

    #[error("upstream error {status}: {message}")]
    Upstream { status: u16, message: String },

    #[error("no available accounts for provider {provider}")]
    NoAvailableAccounts { provider: String },

    #[error("cancelled")]
    Cancelled,
}

impl GatewayError {
    pub fn transport(kind: TransportKind, message: impl Into<String>) -> Self {
        Self::Transport {
            kind,
            message: message.into(),
        }
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth {
            status: None,
            message: message.into(),
        }
    }

    /// Whether the orchestrator may move on to the next candidate account
    /// (only consulted when load balancing is enabled).
    pub fn permits_failover(&self) -> bool {
        matches!(
            self,
            Self::Quota { .. } | Self::Auth { .. } | Self::Transport { .. }
        )
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    pub fn is_protocol(&self) -> bool {
        matches!(self, Self::Protocol(_))
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Transport {
                kind: TransportKind::Server(status),
                ..
            } => Some(*status),
            Self::Quota { status, .. } | Self::Auth { status, .. } => *status,
            Self::Upstream { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn suggested_delay(&self) -> Option<Duration> {
        if let Self::Quota { retry_after, .. } = self {
            *retry_after
        } else {
            None
        }
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Transport { .. } => "transport",
            Self::Quota {
                kind: QuotaKind::Exhausted,
                ..
            } => "quota_exhausted",
            Self::Quota {
                kind: QuotaKind::RateLimited,
                ..
            } => "rate_limited",
            Self::Auth { .. } => "auth",
            Self::Protocol(_) => "protocol",
            Self::Upstream { .. } => "upstream",
            Self::NoAvailableAccounts { .. } => "no_available_accounts",
            Self::Cancelled => "cancelled",
        }
    }

    /// Classify a non-success HTTP response.
    ///
    /// Structured signals win: the envelope's error code first, then the status
    /// code. Message text is only inspected for an otherwise ambiguous 429.
    pub fn from_status(status: u16, body: &str, retry_after: Option<Duration>) -> Self {
        let info = parse_api_error(body, status);

        if let Some(err) = info
            .code
            .as_deref()
            .and_then(|code| from_error_code(code, Some(status), retry_after, &info.message))
        {
            return err;
        }

        match status {
            401 | 403 => Self::Auth {
                status: Some(status),
                message: info.message,
            },
            429 => Self::Quota {
                kind: quota_kind_from_message(&info.message),
                status: Some(status),
                retry_after,
                message: info.message,
            },
            408 => Self::transport(TransportKind::Timeout, info.message),
            500..=599 => Self::Transport {
                kind: TransportKind::Server(status),
                message: info.message,
            },
            _ => Self::Upstream {
                status,
                message: info.message,
            },
        }
    }

    /// Classify an error envelope delivered inside an already-open stream,
    /// where no HTTP status is available.
    pub fn from_stream_error(code: Option<&str>, message: &str) -> Self {
        if let Some(err) = code.and_then(|c| from_error_code(c, None, None, message)) {
            return err;
        }
        classify_by_message(message)
    }
}

fn from_error_code(
    code: &str,
    status: Option<u16>,
    retry_after: Option<Duration>,
    message: &str,
) -> Option<GatewayError> {
    let quota = |kind| GatewayError::Quota {
        kind,
        status,
        retry_after,
        message: message.to_string(),
    };
    match code {
        "insufficient_quota" | "RESOURCE_EXHAUSTED" | "quota_exceeded"
        | "billing_hard_limit_reached" => Some(quota(QuotaKind::Exhausted)),
        "rate_limit_exceeded" | "rate_limit_error" | "too_many_requests" => {
            Some(quota(QuotaKind::RateLimited))
        }
        "authentication_error" | "invalid_api_key" | "permission_error" | "UNAUTHENTICATED"
        | "PERMISSION_DENIED" => Some(GatewayError::Auth {
            status,
            message: message.to_string(),
        }),
        "overloaded_error" | "UNAVAILABLE" | "server_error" | "api_error" => {
            Some(GatewayError::Transport {
                kind: TransportKind::Server(status.unwrap_or(529)),
                message: message.to_string(),
            })
        }
        _ => None,
    }
}

// Last resort: vendors that offer nothing but prose.
fn classify_by_message(message: &str) -> GatewayError {
    let lower = message.to_lowercase();
    if lower.contains("quota") || lower.contains("exhausted") || lower.contains("billing") {
        GatewayError::Quota {
            kind: QuotaKind::Exhausted,
            status: None,
            retry_after: None,
            message: message.to_string(),
        }
    } else if lower.contains("rate limit") || lower.contains("too many requests") {
        GatewayError::Quota {
            kind: QuotaKind::RateLimited,
            status: None,
            retry_after: None,
            message: message.to_string(),
        }
    } else if lower.contains("unauthorized")
        || lower.contains("invalid api key")
        || lower.contains("token expired")
    {
        GatewayError::auth(message)
    } else if lower.contains("overloaded") || lower.contains("unavailable") {
        GatewayError::transport(TransportKind::Server(529), message)
    } else {
        GatewayError::Upstream {
            status: 500,
            message: message.to_string(),
        }
    }
}

fn quota_kind_from_message(message: &str) -> QuotaKind {
    let lower = message.to_lowercase();
    if lower.contains("quota") || lower.contains("exhausted") || lower.contains("billing") {
        QuotaKind::Exhausted
    } else {
        QuotaKind::RateLimited
    }
}

/// Parsed API error information.
pub struct ApiErrorInfo {
    pub message: String,
    /// Provider-specific error code (e.g. `"insufficient_quota"`, `"RESOURCE_EXHAUSTED"`).
    pub code: Option<String>,
}

/// Parse an API error response body.
///
/// Handles the common envelope shapes:
/// - `{"error": {"message": "...", "type"|"code"|"status": "..."}}`
/// - `{"type": "error", "error": {"type": "...", "message": "..."}}`
/// - `{"detail": "..."}` / `{"message": "...", "code": "..."}`
pub fn parse_api_error(body: &str, status: u16) -> ApiErrorInfo {
    if let Ok(json) = serde_json::from_str::<Value>(body) {
        let error = &json["error"];
        if let Some(msg) = error["message"].as_str() {
            let code = error["code"]
                .as_str()
                .or_else(|| error["status"].as_str())
                .or_else(|| error["type"].as_str())
                .map(String::from);
            return ApiErrorInfo {
                message: msg.to_string(),
                code,
            };
        }

        if let Some(msg) = json["detail"].as_str().or_else(|| json["message"].as_str()) {
            let code = json["code"]
                .as_str()
                .or_else(|| json["type"].as_str())
                .map(String::from);
            return ApiErrorInfo {
                message: msg.to_string(),
                code,
            };
        }
    }

    let trimmed = body.trim();
    ApiErrorInfo {
        message: if trimmed.is_empty() {
            format!("HTTP {status}")
        } else {
            format!("HTTP {status}: {trimmed}")
        },
        code: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failover_classification() {
        assert!(GatewayError::transport(TransportKind::Timeout, "slow").permits_failover());
        assert!(GatewayError::auth("expired").permits_failover());
        assert!(GatewayError::from_status(429, "", None).permits_failover());

        assert!(!GatewayError::Cancelled.permits_failover());
        assert!(!GatewayError::Protocol("bad json".into()).permits_failover());
        assert!(!GatewayError::Upstream {
            status: 400,
            message: "bad".into()
        }
        .permits_failover());
    }

    #[test]
    fn from_status_mapping() {
        assert!(matches!(
            GatewayError::from_status(401, "unauthorized", None),
            GatewayError::Auth { status: Some(401), .. }
        ));
        assert!(matches!(
            GatewayError::from_status(403, "forbidden", None),
            GatewayError::Auth { .. }
        ));
        assert!(matches!(
            GatewayError::from_status(503, "busy", None),
            GatewayError::Transport {
                kind: TransportKind::Server(503),
                ..
            }
        ));
        assert!(matches!(
            GatewayError::from_status(400, "bad request", None),
            GatewayError::Upstream { status: 400, .. }
        ));
        assert!(matches!(
            GatewayError::from_status(408, "", None),
            GatewayError::Transport {
                kind: TransportKind::Timeout,
                ..
            }
        ));
    }

    #[test]
    fn structured_code_beats_status() {
        let body = r#"{"error":{"message":"You exceeded your current quota","type":"insufficient_quota","code":"insufficient_quota"}}"#;
        let err = GatewayError::from_status(429, body, None);
        assert_eq!(err.error_kind(), "quota_exhausted");

        // Google reports exhaustion with a 400 in some endpoints.
        let body = r#"{"error":{"code":400,"message":"Resource has been exhausted","status":"RESOURCE_EXHAUSTED"}}"#;
        let err = GatewayError::from_status(400, body, None);
        assert_eq!(err.error_kind(), "quota_exhausted");
    }

    #[test]
    fn plain_429_is_rate_limit_with_retry_after() {
        let err = GatewayError::from_status(429, "slow down", Some(Duration::from_secs(7)));
        assert_eq!(err.error_kind(), "rate_limited");
        assert_eq!(err.suggested_delay(), Some(Duration::from_secs(7)));
        assert_eq!(err.status(), Some(429));
    }

    #[test]
    fn stream_error_uses_code_then_message() {
        let err = GatewayError::from_stream_error(Some("rate_limit_error"), "Too many");
        assert_eq!(err.error_kind(), "rate_limited");

        let err = GatewayError::from_stream_error(None, "Daily quota exhausted for this key");
        assert_eq!(err.error_kind(), "quota_exhausted");

        let err = GatewayError::from_stream_error(Some("overloaded_error"), "Overloaded");
        assert!(err.permits_failover());

        let err = GatewayError::from_stream_error(None, "something odd happened");
        assert!(!err.permits_failover());
    }

    #[test]
    fn parse_envelopes() {
        let info = parse_api_error(r#"{"type":"error","error":{"type":"overloaded_error","message":"Overloaded"}}"#, 529);
        assert_eq!(info.message, "Overloaded");
        assert_eq!(info.code.as_deref(), Some("overloaded_error"));

        let info = parse_api_error(r#"{"detail":"Model not found"}"#, 404);
        assert_eq!(info.message, "Model not found");
        assert!(info.code.is_none());

        let info = parse_api_error("<html>bad gateway</html>", 502);
        assert_eq!(info.message, "HTTP 502: <html>bad gateway</html>");

        let info = parse_api_error("", 500);
        assert_eq!(info.message, "HTTP 500");
    }

    #[test]
    fn display_carries_detail() {
        let err = GatewayError::from_status(429, r#"{"error":{"message":"Quota exceeded for today"}}"#, None);
        assert_eq!(err.to_string(), "quota exhausted: Quota exceeded for today");

        let err = GatewayError::transport(TransportKind::Server(502), "bad gateway");
        assert_eq!(err.to_string(), "transport error (server 502): bad gateway");
    }
}
