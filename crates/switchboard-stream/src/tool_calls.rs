//! Tool-call reassembly from slot-indexed fragments.

use std::collections::{BTreeMap, HashSet};

use serde_json::{Map, Value};
use tracing::{debug, warn};

use switchboard_core::{ToolCallFragment, ToolCallId};

/// A completed tool call ready to be emitted.
#[derive(Clone, Debug, PartialEq)]
pub struct FinalizedCall {
    pub call_id: ToolCallId,
    pub name: String,
    pub arguments: Map<String, Value>,
}

#[derive(Clone, Debug, Default)]
struct SlotBuffer {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
    last_fragment: Option<String>,
}

impl SlotBuffer {
    /// Append one argument fragment.
    ///
    /// A fragment that starts with everything accumulated so far is a
    /// cumulative resend and contributes only its suffix. A full duplicate is
    /// skipped only when it repeats this slot's previous fragment; any other
    /// fragment already contained in the buffer is appended as-is.
    fn append(&mut self, fragment: &str) {
        if !self.arguments.is_empty() && fragment.starts_with(self.arguments.as_str()) {
            // Cumulative resend: keep only what is new.
            let suffix = &fragment[self.arguments.len()..];
            self.arguments.push_str(suffix);
        } else if self.last_fragment.as_deref() == Some(fragment)
            && self.arguments.ends_with(fragment)
        {
            debug!(len = fragment.len(), "skipping duplicate argument fragment");
        } else {
            self.arguments.push_str(fragment);
        }
        self.last_fragment = Some(fragment.to_string());
    }
}

/// Accumulates tool-call fragments per slot for one attempt.
#[derive(Debug, Default)]
pub struct ToolCallAssembler {
    slots: BTreeMap<u32, SlotBuffer>,
    emitted: HashSet<String>,
}

impl ToolCallAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, fragment: &ToolCallFragment) {
        let slot = self.slots.entry(fragment.index.unwrap_or(0)).or_default();

        if slot.id.is_none() {
            slot.id = fragment.id.clone().filter(|id| !id.is_empty());
        }
        if slot.name.is_none() {
            slot.name = fragment.name.clone().filter(|name| !name.is_empty());
        }
        if let Some(args) = fragment.arguments.as_deref().filter(|a| !a.is_empty()) {
            slot.append(args);
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.slots.is_empty()
    }

    /// Accumulated argument text for a slot that has not been finalized yet.
    pub fn pending_arguments(&self, slot: u32) -> Option<&str> {
        self.slots.get(&slot).map(|s| s.arguments.as_str())
    }

    /// Finalize every open slot in ascending slot order.
    ///
    /// Slots without a name are dropped. Calls already emitted during this
    /// attempt are suppressed.
    pub fn finalize(&mut self) -> Vec<FinalizedCall> {
        let mut calls = Vec::new();
        for (slot, buffer) in std::mem::take(&mut self.slots) {
            let Some(name) = buffer.name else {
                warn!(
                    slot,
                    args_preview = %preview(&buffer.arguments),
                    "dropping tool call that never received a name"
                );
                continue;
            };

            let arguments = parse_arguments(&buffer.arguments, &name);
            let (call_id, key) = match buffer.id {
                Some(id) => {
                    let key = format!("id:{id}:{name}");
                    (ToolCallId::from_raw(id), key)
                }
                None => {
                    let key = format!("args:{name}:{}", Value::Object(arguments.clone()));
                    (ToolCallId::synthetic(), key)
                }
            };

            if !self.emitted.insert(key) {
                debug!(slot, tool = %name, "suppressing duplicate tool call");
                continue;
            }

            calls.push(FinalizedCall {
                call_id,
                name,
                arguments,
            });
        }
        calls
    }
}

/// Parse accumulated argument text. Never fails: empty input yields `{}`,
/// a non-object is wrapped as `{"value": …}` and unparsable text is kept raw
/// under the same key.
pub fn parse_arguments(raw: &str, tool_name: &str) -> Map<String, Value> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Map::new();
    }

    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Object(map)) => map,
        Ok(other) => {
            debug!(tool = tool_name, "tool arguments are not an object, wrapping");
            wrap_value(other)
        }
        Err(e) => {
            warn!(
                tool = tool_name,
                error = %e,
                args_preview = %preview(trimmed),
                "failed to parse tool call arguments, keeping raw text"
            );
            wrap_value(Value::String(raw.to_string()))
        }
    }
}

fn wrap_value(value: Value) -> Map<String, Value> {
    let mut map = Map::new();
    map.insert("value".into(), value);
    map
}

fn preview(text: &str) -> String {
    text.chars().take(100).collect()
}
