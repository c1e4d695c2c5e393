use serde_json::{json, Value};

use switchboard_core::{
    clamp_count, ChunkDelta, Credentials, FinishReason, GatewayError, RequestContext, Role,
    ToolCallFragment, Usage,
};

use super::{parse_payload, stream_error, Decoded};
use crate::sse::SseEvent;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Decoder for Messages API event streams.
///
/// Prompt tokens arrive in `message_start` and completion tokens in
/// `message_delta`; both are reported together once the latter arrives so
/// usage never precedes content.
#[derive(Clone, Debug, Default)]
pub struct AnthropicDecoder {
    prompt_tokens: u32,
}

impl AnthropicDecoder {
    pub fn decode(&mut self, event: &SseEvent) -> Result<Decoded, GatewayError> {
        if event.data.trim().is_empty() {
            return Ok(Decoded::Ignore);
        }
        let value = parse_payload(&event.data)?;

        let event_type = event
            .event
            .as_deref()
            .or_else(|| value["type"].as_str())
            .unwrap_or_default();

        match event_type {
            "message_start" => {
                let usage = &value["message"]["usage"];
                self.prompt_tokens = token_count(&usage["input_tokens"])
                    .saturating_add(token_count(&usage["cache_read_input_tokens"]))
                    .saturating_add(token_count(&usage["cache_creation_input_tokens"]));
                Ok(Decoded::Ignore)
            }

            "content_block_start" => {
                let block = &value["content_block"];
                match block["type"].as_str() {
                    Some("tool_use") => Ok(Decoded::Delta(ChunkDelta::tool_call(
                        ToolCallFragment {
                            index: slot(&value),
                            id: block["id"].as_str().map(String::from),
                            name: block["name"].as_str().map(String::from),
                            arguments: None,
                        },
                    ))),
                    Some("text") => Ok(text_delta(block["text"].as_str())),
                    Some("thinking") => Ok(reasoning_delta(block["thinking"].as_str())),
                    _ => Ok(Decoded::Ignore),
                }
            }

            "content_block_delta" => {
                let delta = &value["delta"];
                match delta["type"].as_str() {
                    Some("text_delta") => Ok(text_delta(delta["text"].as_str())),
                    Some("thinking_delta") => Ok(reasoning_delta(delta["thinking"].as_str())),
                    Some("input_json_delta") => {
                        let partial = delta["partial_json"].as_str().unwrap_or_default();
                        if partial.is_empty() {
                            return Ok(Decoded::Ignore);
                        }
                        Ok(Decoded::Delta(ChunkDelta::tool_call(ToolCallFragment {
                            index: slot(&value),
                            arguments: Some(partial.to_string()),
                            ..Default::default()
                        })))
                    }
                    Some(other) if other != "signature_delta" => Err(GatewayError::Protocol(
                        format!("unknown content delta type: {other}"),
                    )),
                    _ => Ok(Decoded::Ignore),
                }
            }

            "message_delta" => {
                let mut delta = ChunkDelta {
                    finish_reason: value["delta"]["stop_reason"]
                        .as_str()
                        .map(FinishReason::parse),
                    ..Default::default()
                };
                let usage = &value["usage"];
                if usage.is_object() {
                    delta.usage = Some(Usage::new(
                        self.prompt_tokens,
                        token_count(&usage["output_tokens"]),
                        None,
                    ));
                }
                if delta.is_empty() {
                    Ok(Decoded::Ignore)
                } else {
                    Ok(Decoded::Delta(delta))
                }
            }

            "message_stop" => Ok(Decoded::Done),

            "error" => Err(stream_error(&value).unwrap_or_else(|| {
                GatewayError::from_stream_error(None, "upstream stream error")
            })),

            _ => Ok(Decoded::Ignore), // ping, content_block_stop
        }
    }
}

fn slot(value: &Value) -> Option<u32> {
    value["index"].as_u64().and_then(|i| u32::try_from(i).ok())
}

fn token_count(value: &Value) -> u32 {
    clamp_count(value.as_u64().unwrap_or(0))
}

fn text_delta(text: Option<&str>) -> Decoded {
    match text.filter(|t| !t.is_empty()) {
        Some(text) => Decoded::Delta(ChunkDelta::text(text)),
        None => Decoded::Ignore,
    }
}

fn reasoning_delta(text: Option<&str>) -> Decoded {
    match text.filter(|t| !t.is_empty()) {
        Some(text) => Decoded::Delta(ChunkDelta::reasoning(text)),
        None => Decoded::Ignore,
    }
}

pub(super) fn auth_headers(credentials: &Credentials) -> Vec<(&'static str, String)> {
    let mut headers = vec![("anthropic-version", ANTHROPIC_VERSION.to_string())];
    if credentials.is_oauth() {
        headers.push(("authorization", format!("Bearer {}", credentials.secret())));
    } else {
        headers.push(("x-api-key", credentials.secret().to_string()));
    }
    headers
}

pub(super) fn request_body(request: &RequestContext) -> Value {
    let system: Vec<&str> = request
        .messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .collect();

    let messages: Vec<Value> = request
        .messages
        .iter()
        .filter(|m| m.role != Role::System)
        .map(|m| match (m.role, &m.tool_call_id) {
            (Role::Tool, Some(id)) => json!({
                "role": "user",
                "content": [{ "type": "tool_result", "tool_use_id": id, "content": m.content }],
            }),
            (Role::Assistant, _) => json!({ "role": "assistant", "content": m.content }),
            _ => json!({ "role": "user", "content": m.content }),
        })
        .collect();

    let mut body = json!({
        "model": request.model_id,
        "max_tokens": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        "messages": messages,
        "stream": true,
    });

    if !system.is_empty() {
        body["system"] = json!(system.join("\n\n"));
    }
    if !request.tools.is_empty() {
        let tools: Vec<Value> = request
            .tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description,
                    "input_schema": t.parameters,
                })
            })
            .collect();
        body["tools"] = Value::Array(tools);
    }
    body
}
