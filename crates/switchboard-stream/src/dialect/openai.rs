use serde_json::{json, Value};

use switchboard_core::{
    clamp_count, ChunkDelta, FinishReason, GatewayError, RequestContext, Role, ToolCallFragment,
    Usage,
};

use super::{parse_payload, stream_error, Decoded};
use crate::sse::SseEvent;

/// Decoder for OpenAI-compatible `chat.completion.chunk` streams.
#[derive(Clone, Copy, Debug, Default)]
pub struct OpenAiDecoder;

// Vendors disagree on where reasoning goes.
const REASONING_FIELDS: [&str; 3] = ["reasoning_content", "reasoning", "thinking"];

impl OpenAiDecoder {
    pub fn decode(&mut self, event: &SseEvent) -> Result<Decoded, GatewayError> {
        if event.is_done_marker() {
            return Ok(Decoded::Done);
        }
        if event.data.trim().is_empty() {
            return Ok(Decoded::Ignore);
        }

        let value = parse_payload(&event.data)?;
        if let Some(err) = stream_error(&value) {
            return Err(err);
        }

        let mut delta = ChunkDelta::default();
        let choice = &value["choices"][0];
        let body = &choice["delta"];

        delta.content = non_empty(&body["content"]);
        delta.reasoning = REASONING_FIELDS
            .iter()
            .find_map(|field| non_empty(&body[*field]));

        if let Some(calls) = body["tool_calls"].as_array() {
            for call in calls {
                let function = &call["function"];
                delta.tool_calls.push(ToolCallFragment {
                    index: call["index"].as_u64().and_then(|i| u32::try_from(i).ok()),
                    id: call["id"].as_str().map(String::from),
                    name: function["name"].as_str().map(String::from),
                    arguments: function["arguments"].as_str().map(String::from),
                });
            }
        }

        delta.finish_reason = choice["finish_reason"].as_str().map(FinishReason::parse);

        let usage = &value["usage"];
        if usage.is_object() {
            delta.usage = Some(Usage::new(
                clamp_count(usage["prompt_tokens"].as_u64().unwrap_or(0)),
                clamp_count(usage["completion_tokens"].as_u64().unwrap_or(0)),
                usage["total_tokens"].as_u64().map(clamp_count),
            ));
        }

        if delta.is_empty() {
            Ok(Decoded::Ignore)
        } else {
            Ok(Decoded::Delta(delta))
        }
    }
}

fn non_empty(value: &Value) -> Option<String> {
    value.as_str().filter(|s| !s.is_empty()).map(String::from)
}

pub(super) fn request_body(request: &RequestContext) -> Value {
    let messages: Vec<Value> = request
        .messages
        .iter()
        .map(|m| {
            let mut message = json!({ "role": role_name(m.role), "content": m.content });
            if let Some(id) = &m.tool_call_id {
                message["tool_call_id"] = json!(id);
            }
            message
        })
        .collect();

    let mut body = json!({
        "model": request.model_id,
        "messages": messages,
        "stream": true,
        "stream_options": { "include_usage": true },
    });

    if let Some(max_tokens) = request.max_tokens {
        body["max_tokens"] = json!(max_tokens);
    }
    if !request.tools.is_empty() {
        let tools: Vec<Value> = request
            .tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.parameters,
                    }
                })
            })
            .collect();
        body["tools"] = Value::Array(tools);
    }
    body
}

fn role_name(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalizer::StreamNormalizer;
    use switchboard_core::{ChatMessage, ResponseEvent, ToolDefinition};

    fn data(payload: &str) -> SseEvent {
        SseEvent {
            event: None,
            data: payload.to_string(),
        }
    }

    fn decode(payload: &str) -> Result<Decoded, GatewayError> {
        OpenAiDecoder.decode(&data(payload))
    }

    #[test]
    fn text_delta() {
        let decoded =
            decode(r#"{"choices":[{"index":0,"delta":{"content":"Hi"},"finish_reason":null}]}"#)
                .unwrap();
        assert_eq!(decoded, Decoded::Delta(ChunkDelta::text("Hi")));
    }

    #[test]
    fn reasoning_aliases() {
        for field in REASONING_FIELDS {
            let payload = format!(r#"{{"choices":[{{"delta":{{"{field}":"hmm"}}}}]}}"#);
            let decoded = decode(&payload).unwrap();
            assert_eq!(decoded, Decoded::Delta(ChunkDelta::reasoning("hmm")), "{field}");
        }
    }

    #[test]
    fn tool_call_fragments() {
        let decoded = decode(
            r#"{"choices":[{"delta":{"tool_calls":[{"index":1,"id":"call_a","type":"function","function":{"name":"search","arguments":"{\"q\""}}]}}]}"#,
        )
        .unwrap();
        let Decoded::Delta(delta) = decoded else {
            panic!("expected delta");
        };
        assert_eq!(
            delta.tool_calls,
            vec![ToolCallFragment {
                index: Some(1),
                id: Some("call_a".into()),
                name: Some("search".into()),
                arguments: Some("{\"q\"".into()),
            }]
        );
    }

    #[test]
    fn finish_and_usage() {
        let decoded = decode(r#"{"choices":[{"delta":{},"finish_reason":"tool_calls"}]}"#).unwrap();
        assert_eq!(decoded, Decoded::Delta(ChunkDelta::finish(FinishReason::ToolCalls)));

        let decoded = decode(
            r#"{"choices":[],"usage":{"prompt_tokens":9,"completion_tokens":3,"total_tokens":12}}"#,
        )
        .unwrap();
        assert_eq!(
            decoded,
            Decoded::Delta(ChunkDelta::usage_only(Usage::new(9, 3, Some(12))))
        );
    }

    #[test]
    fn oversized_token_counts_saturate() {
        let decoded = decode(
            r#"{"choices":[],"usage":{"prompt_tokens":5000000000,"completion_tokens":3}}"#,
        )
        .unwrap();
        let Decoded::Delta(delta) = decoded else {
            panic!("expected delta");
        };
        assert_eq!(delta.usage, Some(Usage::new(u32::MAX, 3, None)));
        assert_eq!(delta.usage.map(|u| u.total_tokens), Some(u32::MAX));
    }

    #[test]
    fn continuous_usage_is_reported_once_at_the_end() {
        let chunks = [
            r#"{"choices":[{"delta":{"role":"assistant","content":""}}],"usage":{"prompt_tokens":5,"completion_tokens":0}}"#,
            r#"{"choices":[{"delta":{"reasoning_content":"hm"}}],"usage":{"prompt_tokens":5,"completion_tokens":1}}"#,
            r#"{"choices":[{"delta":{"content":"Hi"}}],"usage":{"prompt_tokens":5,"completion_tokens":3}}"#,
            r#"{"choices":[{"delta":{},"finish_reason":"stop"}],"usage":{"prompt_tokens":5,"completion_tokens":4}}"#,
            r#"{"choices":[],"usage":{"prompt_tokens":5,"completion_tokens":4,"total_tokens":9}}"#,
            "[DONE]",
        ];

        let mut normalizer = StreamNormalizer::default();
        let mut events = Vec::new();
        for chunk in chunks {
            match decode(chunk).unwrap() {
                Decoded::Delta(delta) => events.extend(normalizer.push(&delta)),
                Decoded::Ignore => {}
                Decoded::Done => break,
            }
        }
        events.extend(normalizer.finish());

        assert!(matches!(&events[0], ResponseEvent::ThinkingFragment { text, .. } if text == "hm"));
        assert!(events[1].is_segment_close());
        assert_eq!(events[2], ResponseEvent::text("Hi"));
        assert_eq!(
            events[3],
            ResponseEvent::UsageReport {
                prompt_tokens: 5,
                completion_tokens: 4,
                total_tokens: 9
            }
        );
        assert_eq!(events[4], ResponseEvent::End);
        assert_eq!(events.len(), 5);
    }

    #[test]
    fn done_and_keepalive() {
        assert_eq!(decode("[DONE]").unwrap(), Decoded::Done);
        assert_eq!(decode(r#"{"choices":[{"delta":{"role":"assistant"}}]}"#).unwrap(), Decoded::Ignore);
        assert_eq!(decode(r#"{"choices":[{"delta":{"content":""}}]}"#).unwrap(), Decoded::Ignore);
    }

    #[test]
    fn in_band_error_ends_attempt() {
        let err = decode(r#"{"error":{"message":"Rate limit reached","type":"rate_limit_exceeded"}}"#)
            .unwrap_err();
        assert!(err.permits_failover());
        assert!(!err.is_protocol());
    }

    #[test]
    fn malformed_is_protocol() {
        assert!(decode("{\"choices\":").unwrap_err().is_protocol());
    }

    #[test]
    fn body_shape() {
        let request = RequestContext::new("openai", "gpt-4o")
            .with_messages(vec![ChatMessage::system("be brief"), ChatMessage::user("hi")])
            .with_tools(vec![ToolDefinition {
                name: "search".into(),
                description: "web search".into(),
                parameters: json!({"type": "object"}),
            }])
            .with_max_tokens(64);
        let body = request_body(&request);
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["stream"], true);
        assert_eq!(body["stream_options"]["include_usage"], true);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "hi");
        assert_eq!(body["max_tokens"], 64);
        assert_eq!(body["tools"][0]["function"]["name"], "search");
    }
}
