use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::ids::{SegmentId, ToolCallId};
use crate::tokens::Usage;

/// Normalized events delivered to the caller. Ordering contract:
///
/// (TextFragment | ThinkingFragment+ ThinkingFragment("") | ToolCall)* → UsageReport? → End
///
/// A thinking segment is closed by an empty `ThinkingFragment` carrying its
/// id, and always before the next `TextFragment` or `ToolCall`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseEvent {
    TextFragment {
        text: String,
    },
    ThinkingFragment {
        text: String,
        segment_id: SegmentId,
    },
    ToolCall {
        call_id: ToolCallId,
        name: String,
        arguments: Map<String, Value>,
    },
    UsageReport {
        prompt_tokens: u32,
        completion_tokens: u32,
        total_tokens: u32,
    },
    End,
}

impl ResponseEvent {
    pub fn text(text: impl Into<String>) -> Self {
        Self::TextFragment { text: text.into() }
    }

    pub fn usage(usage: &Usage) -> Self {
        Self::UsageReport {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::End)
    }

    /// Whether this event closes a thinking segment.
    pub fn is_segment_close(&self) -> bool {
        matches!(self, Self::ThinkingFragment { text, .. } if text.is_empty())
    }
}

/// Why the upstream stopped generating.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    /// Explicit "calls complete" signal.
    ToolCalls,
    Length,
    Other(String),
}

impl FinishReason {
    pub fn parse(raw: &str) -> Self {
        match raw {
            "stop" | "end_turn" | "stop_sequence" | "STOP" => Self::Stop,
            "tool_calls" | "tool_use" | "function_call" => Self::ToolCalls,
            "length" | "max_tokens" | "MAX_TOKENS" => Self::Length,
            other => Self::Other(other.to_string()),
        }
    }
}

/// One fragment of a tool call, addressed by slot index.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCallFragment {
    pub index: Option<u32>,
    pub id: Option<String>,
    pub name: Option<String>,
    pub arguments: Option<String>,
}

/// The single normalized delta shape. Vendor variance is decoded away at the
/// transport boundary; the normalizer only ever sees this.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkDelta {
    pub content: Option<String>,
    pub reasoning: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallFragment>,
    pub finish_reason: Option<FinishReason>,
    pub usage: Option<Usage>,
}

impl ChunkDelta {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn reasoning(text: impl Into<String>) -> Self {
        Self {
            reasoning: Some(text.into()),
            ..Default::default()
        }
    }

    pub fn tool_call(fragment: ToolCallFragment) -> Self {
        Self {
            tool_calls: vec![fragment],
            ..Default::default()
        }
    }

    pub fn finish(reason: FinishReason) -> Self {
        Self {
            finish_reason: Some(reason),
            ..Default::default()
        }
    }

    pub fn usage_only(usage: Usage) -> Self {
        Self {
            usage: Some(usage),
            ..Default::default()
        }
    }

    /// Usage with nothing else attached; vendors send this as the last delta.
    pub fn is_usage_only(&self) -> bool {
        self.usage.is_some()
            && self.content.as_deref().map_or(true, str::is_empty)
            && self.reasoning.as_deref().map_or(true, str::is_empty)
            && self.tool_calls.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_none()
            && self.reasoning.is_none()
            && self.tool_calls.is_empty()
            && self.finish_reason.is_none()
            && self.usage.is_none()
    }
}
