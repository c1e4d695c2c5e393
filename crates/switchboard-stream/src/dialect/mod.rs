//! Provider wire dialects.
//!
//! Each dialect knows how to build a streaming request body and how to decode
//! its SSE payloads into [`ChunkDelta`]s.

mod anthropic;
mod openai;

pub use anthropic::AnthropicDecoder;
pub use openai::OpenAiDecoder;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use switchboard_core::{ChunkDelta, Credentials, GatewayError, RequestContext};

use crate::sse::SseEvent;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    #[default]
    OpenaiChat,
    AnthropicMessages,
}

impl Dialect {
    /// Path appended to the provider base URL.
    pub fn path(self) -> &'static str {
        match self {
            Self::OpenaiChat => "/chat/completions",
            Self::AnthropicMessages => "/v1/messages",
        }
    }

    pub fn request_body(self, request: &RequestContext) -> Value {
        match self {
            Self::OpenaiChat => openai::request_body(request),
            Self::AnthropicMessages => anthropic::request_body(request),
        }
    }

    /// Header name/value pairs for authenticating with these credentials.
    pub fn auth_headers(self, credentials: &Credentials) -> Vec<(&'static str, String)> {
        match self {
            Self::OpenaiChat => vec![("authorization", format!("Bearer {}", credentials.secret()))],
            Self::AnthropicMessages => anthropic::auth_headers(credentials),
        }
    }

    pub fn decoder(self) -> DialectDecoder {
        match self {
            Self::OpenaiChat => DialectDecoder::OpenAi(OpenAiDecoder),
            Self::AnthropicMessages => DialectDecoder::Anthropic(AnthropicDecoder::default()),
        }
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OpenaiChat => f.write_str("openai_chat"),
            Self::AnthropicMessages => f.write_str("anthropic_messages"),
        }
    }
}

/// Result of decoding one SSE event.
#[derive(Clone, Debug, PartialEq)]
pub enum Decoded {
    Delta(ChunkDelta),
    /// Keep-alives and events that carry nothing the normalizer needs.
    Ignore,
    /// Explicit end-of-stream sentinel.
    Done,
}

/// Per-attempt decoder state.
///
/// `Err(GatewayError::Protocol)` means one malformed payload; any other error
/// is an in-band failure envelope that ends the attempt.
#[derive(Debug)]
pub enum DialectDecoder {
    OpenAi(OpenAiDecoder),
    Anthropic(AnthropicDecoder),
}

impl DialectDecoder {
    pub fn decode(&mut self, event: &SseEvent) -> Result<Decoded, GatewayError> {
        match self {
            Self::OpenAi(decoder) => decoder.decode(event),
            Self::Anthropic(decoder) => decoder.decode(event),
        }
    }
}

fn parse_payload(data: &str) -> Result<Value, GatewayError> {
    serde_json::from_str(data).map_err(|e| {
        let preview: String = data.chars().take(80).collect();
        GatewayError::Protocol(format!("invalid JSON payload ({e}): {preview}"))
    })
}

/// `{"error": {...}}` envelopes delivered mid-stream.
fn stream_error(value: &Value) -> Option<GatewayError> {
    let error = value.get("error")?;
    if error.is_null() {
        return None;
    }
    let message = error["message"]
        .as_str()
        .or_else(|| error.as_str())
        .unwrap_or("upstream stream error");
    let code = error["code"]
        .as_str()
        .or_else(|| error["status"].as_str())
        .or_else(|| error["type"].as_str());
    Some(GatewayError::from_stream_error(code, message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchboard_core::QuotaKind;

    #[test]
    fn dialect_serde_names() {
        let d: Dialect = serde_json::from_str("\"anthropic_messages\"").unwrap();
        assert_eq!(d, Dialect::AnthropicMessages);
        assert_eq!(Dialect::default().to_string(), "openai_chat");
    }

    #[test]
    fn error_envelope_is_classified() {
        let value: Value = serde_json::from_str(
            r#"{"error":{"message":"You exceeded your current quota","code":"insufficient_quota"}}"#,
        )
        .unwrap();
        let err = stream_error(&value).unwrap();
        assert!(matches!(
            err,
            GatewayError::Quota {
                kind: QuotaKind::Exhausted,
                ..
            }
        ));

        let value: Value = serde_json::from_str(r#"{"error":null,"choices":[]}"#).unwrap();
        assert!(stream_error(&value).is_none());
    }

    #[test]
    fn malformed_payload_is_protocol_error() {
        let err = parse_payload("{not json").unwrap_err();
        assert!(err.is_protocol());
    }
}
