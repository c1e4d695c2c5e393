//! Inline thinking-tag extraction.
//!
//! Some providers emit reasoning inside ordinary text wrapped in markers such
//! as `<think>…</think>`. Markers may be split across any number of chunks, so
//! the splitter holds back the longest tail that could still grow into a
//! marker and re-examines it together with the next fragment.

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Open/close marker pair for inline thinking regions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThinkingTags {
    pub open: String,
    pub close: String,
}

impl ThinkingTags {
    pub fn new(open: impl Into<String>, close: impl Into<String>) -> Self {
        Self {
            open: open.into(),
            close: close.into(),
        }
    }

    /// Both markers must be non-empty for extraction to make progress.
    pub fn is_usable(&self) -> bool {
        !self.open.is_empty() && !self.close.is_empty()
    }
}

impl Default for ThinkingTags {
    fn default() -> Self {
        Self::new("<think>", "</think>")
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PieceKind {
    Thinking,
    Regular,
}

/// A run of text classified as inside or outside a thinking region.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Piece {
    pub kind: PieceKind,
    pub text: String,
}

impl Piece {
    pub fn thinking(text: impl Into<String>) -> Self {
        Self {
            kind: PieceKind::Thinking,
            text: text.into(),
        }
    }

    pub fn regular(text: impl Into<String>) -> Self {
        Self {
            kind: PieceKind::Regular,
            text: text.into(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct TagSplitter {
    tags: ThinkingTags,
    /// False when a marker is empty; all text then passes through as regular.
    enabled: bool,
    inside: bool,
    carry: String,
}

impl TagSplitter {
    pub fn new(tags: ThinkingTags) -> Self {
        let enabled = tags.is_usable();
        if !enabled {
            warn!(open = %tags.open, close = %tags.close, "empty thinking marker, extraction disabled");
        }
        Self {
            tags,
            enabled,
            inside: false,
            carry: String::new(),
        }
    }

    /// Whether the splitter is currently inside a thinking region.
    pub fn is_inside(&self) -> bool {
        self.inside
    }

    /// Text held back because it may be the start of a marker.
    pub fn carry(&self) -> &str {
        &self.carry
    }

    /// Split one fragment. Never emits empty pieces.
    pub fn push(&mut self, fragment: &str) -> Vec<Piece> {
        let mut pieces = Vec::new();
        if !self.enabled {
            self.emit(&mut pieces, fragment);
            return pieces;
        }

        let mut buffer = std::mem::take(&mut self.carry);
        buffer.push_str(fragment);

        let mut rest = buffer.as_str();
        loop {
            let marker = if self.inside {
                self.tags.close.as_str()
            } else {
                self.tags.open.as_str()
            };

            if let Some(pos) = rest.find(marker) {
                self.emit(&mut pieces, &rest[..pos]);
                self.inside = !self.inside;
                rest = &rest[pos + marker.len()..];
                continue;
            }

            let split = rest.len() - partial_marker_len(rest, marker);
            self.emit(&mut pieces, &rest[..split]);
            self.carry = rest[split..].to_string();
            break;
        }
        pieces
    }

    /// Drain the carry at end of stream, tagged with the current mode.
    pub fn finish(&mut self) -> Option<Piece> {
        let carry = std::mem::take(&mut self.carry);
        let kind = self.kind();
        self.inside = false;
        (!carry.is_empty()).then_some(Piece { kind, text: carry })
    }

    fn kind(&self) -> PieceKind {
        if self.inside {
            PieceKind::Thinking
        } else {
            PieceKind::Regular
        }
    }

    fn emit(&self, pieces: &mut Vec<Piece>, text: &str) {
        if text.is_empty() {
            return;
        }
        let kind = self.kind();
        // Adjacent runs of one kind only occur across an empty region.
        if let Some(last) = pieces.last_mut().filter(|p| p.kind == kind) {
            last.text.push_str(text);
        } else {
            pieces.push(Piece {
                kind,
                text: text.to_string(),
            });
        }
    }
}

impl Default for TagSplitter {
    fn default() -> Self {
        Self::new(ThinkingTags::default())
    }
}

/// Length of the longest suffix of `text` that is a strict prefix of `marker`.
fn partial_marker_len(text: &str, marker: &str) -> usize {
    (1..marker.len())
        .rev()
        .filter(|&k| marker.is_char_boundary(k))
        .find(|&k| text.ends_with(&marker[..k]))
        .unwrap_or(0)
}
