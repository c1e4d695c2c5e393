use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::ids::RequestId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(Role::Assistant, content)
    }

    fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_call_id: None,
        }
    }
}

/// A tool the model may call. `parameters` is a JSON schema.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// Everything needed to issue one logical request. Immutable across retries.
#[derive(Clone, Debug)]
pub struct RequestContext {
    pub request_id: RequestId,
    pub provider_key: String,
    pub model_id: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDefinition>,
    pub max_tokens: Option<u32>,
    pub cancel: CancellationToken,
}

impl RequestContext {
    pub fn new(provider_key: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            request_id: RequestId::new(),
            provider_key: provider_key.into(),
            model_id: model_id.into(),
            messages: Vec::new(),
            tools: Vec::new(),
            max_tokens: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_messages(mut self, messages: Vec<ChatMessage>) -> Self {
        self.messages = messages;
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolDefinition>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder() {
        let ctx = RequestContext::new("openai", "gpt-4o")
            .with_messages(vec![ChatMessage::user("hi")])
            .with_max_tokens(256);
        assert_eq!(ctx.provider_key, "openai");
        assert_eq!(ctx.messages.len(), 1);
        assert_eq!(ctx.max_tokens, Some(256));
        assert!(!ctx.is_cancelled());
    }

    #[test]
    fn shared_cancellation() {
        let token = CancellationToken::new();
        let ctx = RequestContext::new("p", "m").with_cancel(token.clone());
        token.cancel();
        assert!(ctx.is_cancelled());
    }

    #[test]
    fn role_serde() {
        let json = serde_json::to_string(&ChatMessage::assistant("ok")).unwrap();
        assert_eq!(json, r#"{"role":"assistant","content":"ok"}"#);
    }
}
