//! Server-Sent Events framing.
//!
//! Bytes are buffered until a full line is available; lines are decoded only
//! once complete so multi-byte characters split across chunks survive.
//! `event:` and `data:` lines accumulate until a blank line dispatches them.

use bytes::{Buf, BytesMut};

/// One dispatched SSE event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
}

impl SseEvent {
    /// The OpenAI-style end-of-stream sentinel.
    pub fn is_done_marker(&self) -> bool {
        self.data.trim() == "[DONE]"
    }
}

#[derive(Debug, Default)]
pub struct SseFramer {
    buffer: BytesMut,
    event: Option<String>,
    data: Vec<String>,
}

impl SseFramer {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(8192),
            ..Default::default()
        }
    }

    /// Feed raw bytes, returning every event completed by them.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(chunk);
        let mut events = Vec::new();

        while let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') {
            let mut line = self.buffer.split_to(newline + 1);
            line.truncate(line.len() - 1);
            if line.last() == Some(&b'\r') {
                line.truncate(line.len() - 1);
            }
            let line = String::from_utf8_lossy(line.chunk()).into_owned();
            if let Some(event) = self.handle_line(&line) {
                events.push(event);
            }
        }
        events
    }

    /// Flush a trailing event that was not followed by a blank line.
    pub fn finish(&mut self) -> Option<SseEvent> {
        if !self.buffer.is_empty() {
            let rest = String::from_utf8_lossy(self.buffer.chunk()).into_owned();
            self.buffer.clear();
            if let Some(event) = self.handle_line(rest.trim_end_matches('\r')) {
                return Some(event);
            }
        }
        self.dispatch()
    }

    fn handle_line(&mut self, line: &str) -> Option<SseEvent> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };
        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {} // id, retry
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        if self.data.is_empty() && self.event.is_none() {
            return None;
        }
        let event = SseEvent {
            event: self.event.take(),
            data: std::mem::take(&mut self.data).join("\n"),
        };
        Some(event)
    }
}

/// Parse a complete SSE body. Convenience for tests and fixtures.
pub fn parse_sse_text(raw: &str) -> Vec<SseEvent> {
    let mut framer = SseFramer::new();
    let mut events = framer.push(raw.as_bytes());
    events.extend(framer.finish());
    events
}
