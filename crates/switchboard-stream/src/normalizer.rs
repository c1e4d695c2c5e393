//! Drives deltas through the tag splitter and tool-call assembler.

use tracing::debug;

use switchboard_core::{ChunkDelta, ResponseEvent, SegmentId, Usage};

use crate::tags::{Piece, PieceKind, TagSplitter, ThinkingTags};
use crate::tool_calls::ToolCallAssembler;

/// Mutable state for a single attempt. Never reused across attempts.
#[derive(Debug, Default)]
pub struct NormalizerState {
    pub open_segment: Option<SegmentId>,
    /// Text of the currently open thinking segment.
    pub thinking_buffer: String,
    pub splitter: TagSplitter,
    pub assembler: ToolCallAssembler,
    pub usage: Option<Usage>,
    pub usage_reported: bool,
    /// A finish reason has arrived; a usage-only delta after it ends the stream.
    pub finish_seen: bool,
    pub emitted_content: bool,
    pub emitted_thinking: bool,
    pub finished: bool,
}

/// Converts normalized deltas into the ordered [`ResponseEvent`] sequence.
#[derive(Debug)]
pub struct StreamNormalizer {
    state: NormalizerState,
}

impl StreamNormalizer {
    pub fn new(tags: ThinkingTags) -> Self {
        Self {
            state: NormalizerState {
                splitter: TagSplitter::new(tags),
                ..Default::default()
            },
        }
    }

    pub fn state(&self) -> &NormalizerState {
        &self.state
    }

    /// Whether any event has been produced so far.
    pub fn has_emitted(&self) -> bool {
        self.state.emitted_content || self.state.emitted_thinking || self.state.usage_reported
    }

    pub fn push(&mut self, delta: &ChunkDelta) -> Vec<ResponseEvent> {
        let mut out = Vec::new();
        if self.state.finished {
            debug!("delta after end of stream ignored");
            return out;
        }

        if let Some(reasoning) = delta.reasoning.as_deref().filter(|r| !r.is_empty()) {
            self.emit_thinking(&mut out, reasoning);
        }

        if let Some(content) = delta.content.as_deref().filter(|c| !c.is_empty()) {
            let pieces = self.state.splitter.push(content);
            self.emit_pieces(&mut out, pieces);
        }

        for fragment in &delta.tool_calls {
            self.state.assembler.push(fragment);
        }

        if let Some(usage) = &delta.usage {
            self.record_usage(usage);
        }

        if delta.finish_reason.is_some() {
            self.state.finish_seen = true;
            self.flush_calls(&mut out);
        }

        // Usage-only deltas mid-stream are merged and reported from `finish`.
        if delta.is_usage_only() && self.state.finish_seen && !self.state.usage_reported {
            self.settle(&mut out);
            self.report_usage(&mut out);
        }

        out
    }

    /// Close out the stream. Idempotent; the second call returns nothing.
    pub fn finish(&mut self) -> Vec<ResponseEvent> {
        let mut out = Vec::new();
        if self.state.finished {
            return out;
        }

        self.settle(&mut out);

        if self.state.emitted_thinking && !self.state.emitted_content {
            out.push(ResponseEvent::text(""));
            self.state.emitted_content = true;
        }

        self.report_usage(&mut out);
        out.push(ResponseEvent::End);
        self.state.finished = true;
        out
    }

    // Drain the carry, then flush calls and close whatever segment is open.
    fn settle(&mut self, out: &mut Vec<ResponseEvent>) {
        if let Some(piece) = self.state.splitter.finish() {
            self.emit_pieces(out, vec![piece]);
        }
        self.flush_calls(out);
        self.close_segment(out);
    }

    fn emit_pieces(&mut self, out: &mut Vec<ResponseEvent>, pieces: Vec<Piece>) {
        for piece in pieces {
            match piece.kind {
                PieceKind::Thinking => self.emit_thinking(out, &piece.text),
                PieceKind::Regular => self.emit_text(out, piece.text),
            }
        }
    }

    fn emit_thinking(&mut self, out: &mut Vec<ResponseEvent>, text: &str) {
        let segment_id = self
            .state
            .open_segment
            .get_or_insert_with(SegmentId::new)
            .clone();
        self.state.thinking_buffer.push_str(text);
        self.state.emitted_thinking = true;
        out.push(ResponseEvent::ThinkingFragment {
            text: text.to_string(),
            segment_id,
        });
    }

    fn emit_text(&mut self, out: &mut Vec<ResponseEvent>, text: String) {
        self.close_segment(out);
        self.state.emitted_content = true;
        out.push(ResponseEvent::TextFragment { text });
    }

    fn close_segment(&mut self, out: &mut Vec<ResponseEvent>) {
        if let Some(segment_id) = self.state.open_segment.take() {
            self.state.thinking_buffer.clear();
            out.push(ResponseEvent::ThinkingFragment {
                text: String::new(),
                segment_id,
            });
        }
    }

    fn flush_calls(&mut self, out: &mut Vec<ResponseEvent>) {
        let calls = self.state.assembler.finalize();
        if calls.is_empty() {
            return;
        }
        self.close_segment(out);
        self.state.emitted_content = true;
        out.extend(calls.into_iter().map(|call| ResponseEvent::ToolCall {
            call_id: call.call_id,
            name: call.name,
            arguments: call.arguments,
        }));
    }

    fn record_usage(&mut self, usage: &Usage) {
        if let Some(existing) = self.state.usage.as_mut() {
            existing.merge(usage);
        } else {
            self.state.usage = Some(*usage);
        }
    }

    fn report_usage(&mut self, out: &mut Vec<ResponseEvent>) {
        if self.state.usage_reported {
            return;
        }
        if let Some(usage) = &self.state.usage {
            out.push(ResponseEvent::usage(usage));
            self.state.usage_reported = true;
        }
    }
}

impl Default for StreamNormalizer {
    fn default() -> Self {
        Self::new(ThinkingTags::default())
    }
}
