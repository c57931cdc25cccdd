//! Chunking strategies.
//!
//! A [`ChunkingStrategy`] splits a document's text into [`TextSpan`]s whose
//! offsets are **character** indices (not bytes) into the original text, so
//! `span.end - span.start == span.text.chars().count()` always holds.
//!
//! Two strategies are built in:
//!
//! - [`SlidingWindow`] (`"sliding-window"`): fixed windows of `chunk_size`
//!   characters advancing by `chunk_size - chunk_overlap`. A trailing window
//!   shorter than `min_chunk_size` is dropped.
//! - [`SentenceBased`] (`"sentence-based"`): whole sentences accumulate until
//!   the next one would push the chunk past `chunk_size`. Chunks shorter than
//!   `min_chunk_size` are dropped and a sentence longer than `max_chunk_size`
//!   is hard-split.
//!
//! Custom strategies can be registered on the
//! [`IndexingService`](crate::indexing::IndexingService).

use std::sync::Arc;

use anyhow::Result;

use crate::config::IndexingConfig;

pub const SLIDING_WINDOW: &str = "sliding-window";
pub const SENTENCE_BASED: &str = "sentence-based";

/// A chunk candidate: `[start, end)` in characters plus its text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextSpan {
    pub start: usize,
    pub end: usize,
    pub text: String,
    /// Characters shared with the previous span, when the strategy overlaps.
    pub overlap: Option<usize>,
}

impl TextSpan {
    fn from_chars(chars: &[char], start: usize, end: usize, overlap: Option<usize>) -> Self {
        Self {
            start,
            end,
            text: chars[start..end].iter().collect(),
            overlap,
        }
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// An algorithm that splits text into embeddable spans.
pub trait ChunkingStrategy: Send + Sync {
    /// Registry key, e.g. `"sliding-window"`.
    fn name(&self) -> &str;

    fn chunk(&self, text: &str, config: &IndexingConfig) -> Result<Vec<TextSpan>>;
}

/// The strategies every indexing service starts with.
pub fn builtin_strategies() -> Vec<Arc<dyn ChunkingStrategy>> {
    vec![Arc::new(SlidingWindow), Arc::new(SentenceBased)]
}

pub struct SlidingWindow;

impl ChunkingStrategy for SlidingWindow {
    fn name(&self) -> &str {
        SLIDING_WINDOW
    }

    fn chunk(&self, text: &str, config: &IndexingConfig) -> Result<Vec<TextSpan>> {
        let chars: Vec<char> = text.chars().collect();
        let size = config.chunk_size.max(1);
        let step = size.saturating_sub(config.chunk_overlap).max(1);

        let mut spans = Vec::new();
        let mut start = 0;
        let mut prev_end: Option<usize> = None;
        while start < chars.len() {
            let end = (start + size).min(chars.len());
            if end - start < config.min_chunk_size {
                break;
            }
            let overlap = prev_end.map(|prev| prev.saturating_sub(start));
            spans.push(TextSpan::from_chars(&chars, start, end, overlap));
            if end == chars.len() {
                break;
            }
            prev_end = Some(end);
            start += step;
        }
        Ok(spans)
    }
}

pub struct SentenceBased;

impl ChunkingStrategy for SentenceBased {
    fn name(&self) -> &str {
        SENTENCE_BASED
    }

    fn chunk(&self, text: &str, config: &IndexingConfig) -> Result<Vec<TextSpan>> {
        let chars: Vec<char> = text.chars().collect();
        let max = config.max_chunk_size.max(1);

        let mut spans = Vec::new();
        let mut current: Option<(usize, usize)> = None;
        let emit = |start: usize, end: usize, spans: &mut Vec<TextSpan>| {
            if end - start >= config.min_chunk_size {
                spans.push(TextSpan::from_chars(&chars, start, end, None));
            }
        };

        for (s_start, s_end) in sentence_bounds(&chars) {
            if s_end - s_start > max {
                if let Some((c_start, c_end)) = current.take() {
                    emit(c_start, c_end, &mut spans);
                }
                let mut piece = s_start;
                while piece < s_end {
                    let piece_end = (piece + max).min(s_end);
                    emit(piece, piece_end, &mut spans);
                    piece = piece_end;
                }
                continue;
            }

            current = match current {
                None => Some((s_start, s_end)),
                Some((c_start, _)) if s_end - c_start <= config.chunk_size => {
                    Some((c_start, s_end))
                }
                Some((c_start, c_end)) => {
                    emit(c_start, c_end, &mut spans);
                    Some((s_start, s_end))
                }
            };
        }
        if let Some((c_start, c_end)) = current {
            emit(c_start, c_end, &mut spans);
        }
        Ok(spans)
    }
}

/// Sentence `[start, end)` bounds with surrounding whitespace excluded.
///
/// A sentence ends after a run of `.`, `!`, or `?` that is followed by
/// whitespace or the end of text.
fn sentence_bounds(chars: &[char]) -> Vec<(usize, usize)> {
    let mut bounds = Vec::new();
    let mut start: Option<usize> = None;
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if start.is_none() && !c.is_whitespace() {
            start = Some(i);
        }
        if matches!(c, '.' | '!' | '?') {
            let mut end = i + 1;
            while end < chars.len() && matches!(chars[end], '.' | '!' | '?') {
                end += 1;
            }
            if end == chars.len() || chars[end].is_whitespace() {
                if let Some(s) = start.take() {
                    bounds.push((s, end));
                }
            }
            i = end;
            continue;
        }
        i += 1;
    }
    if let Some(s) = start {
        let mut end = chars.len();
        while end > s && chars[end - 1].is_whitespace() {
            end -= 1;
        }
        if end > s {
            bounds.push((s, end));
        }
    }
    bounds
}
