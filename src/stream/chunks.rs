//! Per-stream chunk buffer.
//!
//! Holds parsed frames that have not been sent downstream yet, indexed by
//! choice. Every chunk carries exactly `choice_count` content slots, and
//! concatenating slot `k` over the buffer gives the text of choice `k` the
//! client has not received yet.

use std::collections::VecDeque;

use serde_json::Value;
use tracing::{debug, warn};

use super::boundary::{last_settled_boundary, BoundaryMatch};
use super::chunk::{ChunkKind, StreamChunk};
use crate::provider::{Provider, Tokens, MAX_CHOICES};

const DEFAULT_ROLE: &str = "assistant";

/// Buffered text of one choice and the chunk range `[begin, end)` it spans.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChoiceContent {
    pub text: String,
    pub begin: usize,
    pub end: usize,
}

#[derive(Debug, Clone, Copy)]
struct CutTarget {
    chunk: usize,
    end: usize,
}

#[derive(Debug)]
pub struct StreamChunks {
    provider: Provider,
    chunks: VecDeque<StreamChunk>,
    tokens: Tokens,
    model: Option<String>,
    is_function_calling: bool,
    has_binary: bool,
    roles: Vec<Option<String>>,
    /// Choices that reported a finish reason; survives popping that frame.
    finished: Vec<bool>,
    choice_count: usize,
    buffered_bytes: usize,
}

impl StreamChunks {
    #[must_use]
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            chunks: VecDeque::new(),
            tokens: Tokens::default(),
            model: None,
            is_function_calling: false,
            has_binary: false,
            roles: Vec::new(),
            finished: Vec::new(),
            choice_count: 0,
            buffered_bytes: 0,
        }
    }

    #[must_use]
    pub fn provider(&self) -> Provider {
        self.provider
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    #[must_use]
    pub fn get(&self, idx: usize) -> Option<&StreamChunk> {
        self.chunks.get(idx)
    }

    pub fn iter(&self) -> impl Iterator<Item = &StreamChunk> {
        self.chunks.iter()
    }

    #[must_use]
    pub fn choice_count(&self) -> usize {
        self.choice_count
    }

    /// Usage accumulated from popped frames.
    #[must_use]
    pub fn tokens(&self) -> Tokens {
        self.tokens
    }

    #[must_use]
    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    #[must_use]
    pub fn is_function_calling(&self) -> bool {
        self.is_function_calling
    }

    #[must_use]
    pub fn has_binary(&self) -> bool {
        self.has_binary
    }

    /// Raw bytes currently held.
    #[must_use]
    pub fn buffered_bytes(&self) -> usize {
        self.buffered_bytes
    }

    #[must_use]
    pub fn role(&self, k: usize) -> &str {
        self.roles
            .get(k)
            .and_then(Option::as_deref)
            .unwrap_or(DEFAULT_ROLE)
    }

    /// Role per choice, `assistant` where none was announced.
    #[must_use]
    pub fn roles(&self) -> Vec<String> {
        (0..self.choice_count).map(|k| self.role(k).to_string()).collect()
    }

    // -----------------------------------------------------------------------
    // Append
    // -----------------------------------------------------------------------

    pub fn append_chunk(&mut self, mut chunk: StreamChunk) {
        let width = chunk.contents().len();
        if width > self.choice_count {
            for existing in &mut self.chunks {
                existing.widen(width);
            }
            self.choice_count = width;
        }
        chunk.widen(self.choice_count);

        if let Some(parsed) = chunk.parsed() {
            for (k, role) in self.provider.roles_from_resp_chunk(parsed) {
                if k >= MAX_CHOICES {
                    continue;
                }
                if self.roles.len() <= k {
                    self.roles.resize(k + 1, None);
                }
                self.roles[k].get_or_insert(role);
            }
            for k in self.provider.finished_choices(parsed) {
                if k >= MAX_CHOICES {
                    continue;
                }
                if self.finished.len() <= k {
                    self.finished.resize(k + 1, false);
                }
                self.finished[k] = true;
            }
            if !self.is_function_calling && self.provider.has_function_call_finish_reason(parsed) {
                debug!(provider = %self.provider, "function call observed in stream");
                self.is_function_calling = true;
            }
            if self.model.is_none() {
                self.model = self.provider.get_model_resp(parsed);
            }
        }
        if chunk.kind() == ChunkKind::NormalBinary {
            self.has_binary = true;
        }
        self.buffered_bytes += chunk.raw_bytes().len();
        self.chunks.push_back(chunk);
    }

    // -----------------------------------------------------------------------
    // Content views
    // -----------------------------------------------------------------------

    /// Buffered text per choice over the whole buffer.
    #[must_use]
    pub fn get_contents_with_chunk_indices(&self) -> Vec<ChoiceContent> {
        self.prefix_contents(self.chunks.len())
    }

    /// Text per choice over the first `n` chunks.
    #[must_use]
    pub fn prefix_contents(&self, n: usize) -> Vec<ChoiceContent> {
        let end = n.min(self.chunks.len());
        (0..self.choice_count)
            .map(|k| ChoiceContent {
                text: self.chunks.range(..end).map(|c| c.content(k)).collect(),
                begin: 0,
                end,
            })
            .collect()
    }

    fn bytes_before(&self, k: usize, idx: usize) -> usize {
        self.chunks.range(..idx).map(|c| c.content(k).len()).sum()
    }

    /// First chunk at which choice `k` has accumulated `end` bytes.
    fn chunk_reaching(&self, k: usize, end: usize) -> usize {
        if end == 0 {
            return 0;
        }
        let mut acc = 0;
        for (i, chunk) in self.chunks.iter().enumerate() {
            acc += chunk.content(k).len();
            if acc >= end {
                return i;
            }
        }
        self.chunks.len().saturating_sub(1)
    }

    /// Index of the chunk holding the end of `boundary` for choice `k`. A
    /// boundary straddling frames resolves to the frame where it ends.
    #[must_use]
    pub fn find_chunk_with_boundary_indicator(&self, k: usize, boundary: &BoundaryMatch) -> usize {
        self.chunk_reaching(k, boundary.end)
    }

    /// Nearest chunk before `current_idx` with non-empty text for choice `k`.
    #[must_use]
    pub fn find_prev_chunk_containing_choice(
        &self,
        current_idx: usize,
        k: usize,
    ) -> Option<(usize, &StreamChunk)> {
        (0..current_idx.min(self.chunks.len()))
            .rev()
            .map(|i| (i, &self.chunks[i]))
            .find(|(_, c)| !c.content(k).is_empty())
    }

    fn rewrite_content(&mut self, idx: usize, k: usize, text: &str) {
        let provider = self.provider;
        let Some(chunk) = self.chunks.get_mut(idx) else {
            return;
        };
        let before = chunk.raw_bytes().len();
        if chunk.set_content(provider, k, text) {
            self.buffered_bytes = self.buffered_bytes - before + chunk.raw_bytes().len();
        } else {
            warn!(chunk = idx, choice = k, "cannot rewrite a frame without a JSON payload");
        }
    }

    /// Whether choice `k` has reported a finish reason, buffered or not.
    #[must_use]
    pub fn is_choice_finished(&self, k: usize) -> bool {
        self.finished.get(k).copied().unwrap_or(false)
    }

    /// Last buffered chunk carrying a finish reason, per choice.
    fn finish_positions(&self) -> Vec<Option<usize>> {
        let mut out = vec![None; self.choice_count];
        for (i, chunk) in self.chunks.iter().enumerate() {
            let Some(parsed) = chunk.parsed() else {
                continue;
            };
            for k in self.provider.finished_choices(parsed) {
                if let Some(slot) = out.get_mut(k) {
                    *slot = Some(i);
                }
            }
        }
        out
    }

    // -----------------------------------------------------------------------
    // Alignment
    // -----------------------------------------------------------------------

    /// Choose how many head chunks can go to the guardrail as a unit.
    ///
    /// Every unfinished choice needs `min_content_length` characters and a
    /// settled boundary; finished choices are taken whole. The cut is the
    /// furthest boundary chunk over all choices. Text past a choice's own
    /// boundary inside the cut is moved into new frames inserted right
    /// after it, so the first `n` chunks hold only boundary-terminated
    /// text. Returns `n`, or 0 when not every choice is ready.
    pub fn align_contents_for_guardrail(
        &mut self,
        stream_contents: &[ChoiceContent],
        min_content_length: usize,
    ) -> usize {
        let width = self.choice_count;
        if self.chunks.is_empty() || width == 0 || stream_contents.len() < width {
            return 0;
        }
        let finish_at = self.finish_positions();
        let mut targets = Vec::with_capacity(width);
        for (k, content) in stream_contents.iter().take(width).enumerate() {
            if self.is_choice_finished(k) {
                let end = content.text.len();
                let reached = if end > 0 { self.chunk_reaching(k, end) } else { 0 };
                let chunk = finish_at[k].map_or(reached, |idx| reached.max(idx));
                targets.push(CutTarget { chunk, end });
                continue;
            }
            if content.text.chars().count() < min_content_length {
                return 0;
            }
            let Some(boundary) = last_settled_boundary(&content.text) else {
                return 0;
            };
            targets.push(CutTarget {
                chunk: self.find_chunk_with_boundary_indicator(k, &boundary),
                end: boundary.end,
            });
        }

        for (k, target) in targets.iter_mut().enumerate() {
            self.repack_leading_whitespace(k, target);
        }

        let cutoff = targets.iter().map(|t| t.chunk).max().unwrap_or(0);
        let mut inserted = 0;
        for (k, target) in targets.iter().enumerate() {
            if self.split_choice_at(k, *target, cutoff, cutoff + 1 + inserted) {
                inserted += 1;
            }
        }
        cutoff + 1
    }

    /// When the cut chunk opens with whitespace that completes the boundary,
    /// move that whitespace onto the previous chunk of the same choice and
    /// cut there instead.
    fn repack_leading_whitespace(&mut self, k: usize, target: &mut CutTarget) {
        let prior = self.bytes_before(k, target.chunk);
        let slot = self.chunks[target.chunk].content(k);
        let off = target.end.saturating_sub(prior);
        if off == 0 || off >= slot.len() || !slot.is_char_boundary(off) {
            return;
        }
        let (lead, rest) = slot.split_at(off);
        if !lead.trim().is_empty() {
            return;
        }
        let Some((prev, prev_chunk)) = self.find_prev_chunk_containing_choice(target.chunk, k) else {
            return;
        };
        let merged = format!("{}{lead}", prev_chunk.content(k));
        let rest = rest.to_string();
        self.rewrite_content(prev, k, &merged);
        self.rewrite_content(target.chunk, k, &rest);
        target.chunk = prev;
    }

    /// Move choice `k`'s text after its boundary (and up to `cutoff`) into a
    /// new frame inserted at `insert_at`. Returns whether a frame was added.
    fn split_choice_at(&mut self, k: usize, target: CutTarget, cutoff: usize, insert_at: usize) -> bool {
        let prior = self.bytes_before(k, target.chunk);
        let slot = self.chunks[target.chunk].content(k);
        let mut off = target.end.saturating_sub(prior).min(slot.len());
        while !slot.is_char_boundary(off) {
            off += 1;
        }
        let (keep, tail) = slot.split_at(off);
        let keep = keep.to_string();
        let tail_in_cut = !tail.is_empty();
        let mut trailing = tail.to_string();
        for chunk in self.chunks.range(target.chunk + 1..=cutoff) {
            trailing.push_str(chunk.content(k));
        }
        if trailing.is_empty() {
            return false;
        }

        let template = (target.chunk..=cutoff)
            .filter_map(|i| self.chunks[i].parsed())
            .find(|p| self.provider.has_choice_index(p, k))
            .cloned();
        let Some(template) = template else {
            warn!(choice = k, "no frame to model the split-off text on; leaving it in place");
            return false;
        };

        if tail_in_cut {
            self.rewrite_content(target.chunk, k, &keep);
        }
        for i in target.chunk + 1..=cutoff {
            if !self.chunks[i].content(k).is_empty() {
                self.rewrite_content(i, k, "");
            }
        }

        let mut value = self.provider.content_only_chunk(&template, k);
        self.provider.update_stream_resp_contents(&mut value, k, &trailing);
        let mut chunk = StreamChunk::synthesized(self.provider, value);
        chunk.widen(self.choice_count);
        self.buffered_bytes += chunk.raw_bytes().len();
        self.chunks.insert(insert_at.min(self.chunks.len()), chunk);
        true
    }

    // -----------------------------------------------------------------------
    // Collapse
    // -----------------------------------------------------------------------

    /// Rewrite the prefix described by `original_contents` so that choice
    /// `k` reads `new_contents[k]`.
    ///
    /// The first non-empty chunk of each choice takes the whole replacement
    /// and the other non-empty chunks of that choice are emptied. Frames
    /// stay in place. Returns the shortest prefix holding every anchor.
    pub fn collapse_chunks_with_new_content(
        &mut self,
        original_contents: &[ChoiceContent],
        new_contents: &[String],
    ) -> usize {
        let mut to_pop = 0;
        for (k, (original, new)) in original_contents.iter().zip(new_contents).enumerate() {
            if k >= self.choice_count {
                break;
            }
            let end = original.end.min(self.chunks.len());
            let begin = original.begin.min(end);
            let anchor = (begin..end)
                .find(|&i| !self.chunks[i].content(k).is_empty())
                .or_else(|| {
                    if new.is_empty() {
                        return None;
                    }
                    (begin..end).find(|&i| {
                        self.chunks[i]
                            .parsed()
                            .is_some_and(|p| self.provider.has_choice_index(p, k))
                    })
                });
            let Some(anchor) = anchor else {
                if !new.is_empty() {
                    warn!(choice = k, "no frame can carry the rewritten text");
                }
                continue;
            };
            to_pop = to_pop.max(anchor + 1);
            if *new == original.text {
                continue;
            }
            self.rewrite_content(anchor, k, new);
            for i in begin..end {
                if i != anchor && !self.chunks[i].content(k).is_empty() {
                    self.rewrite_content(i, k, "");
                }
            }
        }
        to_pop
    }

    // -----------------------------------------------------------------------
    // Removal and usage
    // -----------------------------------------------------------------------

    /// Fold `tokens` into the running total. Cumulative providers replace.
    pub fn add_tokens(&mut self, tokens: Tokens) {
        if tokens.is_empty() {
            return;
        }
        if self.provider.usage_is_cumulative() {
            self.tokens = tokens;
        } else {
            self.tokens += tokens;
        }
    }

    pub fn pop_chunk(&mut self) -> Option<StreamChunk> {
        let chunk = self.chunks.pop_front()?;
        self.buffered_bytes = self.buffered_bytes.saturating_sub(chunk.raw_bytes().len());
        if let Some(parsed) = chunk.parsed() {
            let tokens = self.provider.tokens(parsed);
            self.add_tokens(tokens);
        }
        Some(chunk)
    }

    pub fn pop_chunks(&mut self, n: usize) -> Vec<StreamChunk> {
        let n = n.min(self.chunks.len());
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            if let Some(chunk) = self.pop_chunk() {
                out.push(chunk);
            }
        }
        out
    }

    pub fn pop_all(&mut self) -> Vec<StreamChunk> {
        self.pop_chunks(self.chunks.len())
    }

    /// Drop `[lo, hi)` without touching usage.
    pub fn delete_chunks(&mut self, lo: usize, hi: usize) {
        let hi = hi.min(self.chunks.len());
        if lo >= hi {
            return;
        }
        for chunk in self.chunks.drain(lo..hi) {
            self.buffered_bytes = self.buffered_bytes.saturating_sub(chunk.raw_bytes().len());
        }
    }

    /// Sum of `tokens_fn` over the parsed frames in `[lo, hi)`.
    pub fn get_usage_from_chunks<F>(&self, tokens_fn: F, lo: usize, hi: usize) -> Tokens
    where
        F: Fn(&Value) -> Tokens,
    {
        let hi = hi.min(self.chunks.len());
        if lo >= hi {
            return Tokens::default();
        }
        self.chunks
            .range(lo..hi)
            .filter_map(StreamChunk::parsed)
            .map(tokens_fn)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn text_frame(k: usize, text: &str) -> StreamChunk {
        StreamChunk::synthesized(
            Provider::OpenAi,
            json!({"id": "c", "choices": [{"index": k, "delta": {"content": text}, "finish_reason": null}]}),
        )
    }

    fn buffer_of(frames: &[(usize, &str)]) -> StreamChunks {
        let mut buffer = StreamChunks::new(Provider::OpenAi);
        for (k, text) in frames {
            buffer.append_chunk(text_frame(*k, text));
        }
        buffer
    }

    fn slots(buffer: &StreamChunks) -> Vec<Vec<String>> {
        buffer.iter().map(|c| c.contents().to_vec()).collect()
    }

    #[test]
    fn test_append_widens_every_chunk() {
        let buffer = buffer_of(&[(0, "a"), (2, "b"), (1, "c")]);
        assert_eq!(buffer.choice_count(), 3);
        assert!(buffer.iter().all(|c| c.contents().len() == 3));
        assert_eq!(
            buffer.get_contents_with_chunk_indices()
                .into_iter()
                .map(|c| c.text)
                .collect::<Vec<_>>(),
            vec!["a", "c", "b"]
        );
    }

    #[test]
    fn test_align_needs_min_length_and_boundary() {
        let mut buffer = buffer_of(&[(0, "Hi. "), (0, "there")]);
        let sc = buffer.get_contents_with_chunk_indices();
        assert_eq!(buffer.align_contents_for_guardrail(&sc, 50), 0);
        assert_eq!(buffer.align_contents_for_guardrail(&sc, 3), 1);

        let mut unsettled = buffer_of(&[(0, "Hello there. ")]);
        let sc = unsettled.get_contents_with_chunk_indices();
        assert_eq!(unsettled.align_contents_for_guardrail(&sc, 1), 0);
    }

    #[test]
    fn test_align_splits_text_after_boundary() {
        let mut buffer = buffer_of(&[(0, "One"), (0, " two. Thr"), (0, "ee")]);
        let sc = buffer.get_contents_with_chunk_indices();
        let n = buffer.align_contents_for_guardrail(&sc, 5);
        assert_eq!(n, 2);
        assert_eq!(
            slots(&buffer),
            vec![vec!["One"], vec![" two. "], vec!["Thr"], vec!["ee"]]
        );
        let text: String = buffer.iter().map(|c| c.content(0)).collect();
        assert_eq!(text, "One two. Three");
    }

    #[test]
    fn test_align_moves_leading_whitespace_back() {
        let mut buffer = buffer_of(&[(0, "Wait for it!  "), (0, "   \u{1F5B1}"), (0, " ok")]);
        let sc = buffer.get_contents_with_chunk_indices();
        assert_eq!(buffer.align_contents_for_guardrail(&sc, 5), 1);
        assert_eq!(buffer.get(0).unwrap().content(0), "Wait for it!     ");
        assert_eq!(buffer.get(1).unwrap().content(0), "\u{1F5B1}");
    }

    #[test]
    fn test_finished_choice_is_taken_whole() {
        let mut buffer = buffer_of(&[(0, "no boundary here")]);
        buffer.append_chunk(StreamChunk::synthesized(
            Provider::OpenAi,
            json!({"choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}]}),
        ));
        let sc = buffer.get_contents_with_chunk_indices();
        assert_eq!(buffer.align_contents_for_guardrail(&sc, 50), 2);
    }

    #[test]
    fn test_finished_choice_stays_ready_after_pop() {
        let mut buffer = buffer_of(&[(0, "Short answer.")]);
        buffer.append_chunk(StreamChunk::synthesized(
            Provider::OpenAi,
            json!({"choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}]}),
        ));
        buffer.append_chunk(text_frame(1, "First sentence of a long answer. Second"));
        let sc = buffer.get_contents_with_chunk_indices();
        assert_eq!(buffer.align_contents_for_guardrail(&sc, 10), 3);
        buffer.pop_chunks(3);
        assert!(buffer.is_choice_finished(0));

        buffer.append_chunk(text_frame(1, " sentence goes on. Third sentence too. And"));
        let sc = buffer.get_contents_with_chunk_indices();
        assert_eq!(sc[0].text, "");
        assert_eq!(buffer.align_contents_for_guardrail(&sc, 10), 2);
        let prefix = buffer.prefix_contents(2);
        assert_eq!(prefix[0].text, "");
        assert_eq!(prefix[1].text, "Second sentence goes on. Third sentence too. ");
        assert_eq!(buffer.get(2).unwrap().content(1), "And");
    }

    #[test]
    fn test_collapse_rewrites_anchor_and_clears_rest() {
        let mut buffer = buffer_of(&[(0, ""), (0, "my email "), (0, "is a@b.co. "), (0, "tail")]);
        let original = buffer.prefix_contents(3);
        let n = buffer.collapse_chunks_with_new_content(&original, &["my email is <EMAIL>. ".to_string()]);
        assert_eq!(n, 2);
        assert_eq!(
            slots(&buffer),
            vec![vec![""], vec!["my email is <EMAIL>. "], vec![""], vec!["tail"]]
        );
        let reparsed: Value = serde_json::from_slice(
            buffer.get(1).unwrap().raw_bytes().strip_prefix(b"data: ").unwrap().trim_ascii(),
        )
        .unwrap();
        assert_eq!(reparsed["choices"][0]["delta"]["content"], "my email is <EMAIL>. ");
    }

    #[test]
    fn test_collapse_unchanged_text_is_untouched() {
        let mut buffer = buffer_of(&[(0, "a. "), (0, "b")]);
        let before: Vec<_> = buffer.iter().map(|c| c.raw_bytes().clone()).collect();
        let original = buffer.prefix_contents(1);
        let n = buffer.collapse_chunks_with_new_content(&original, &["a. ".to_string()]);
        assert_eq!(n, 1);
        let after: Vec<_> = buffer.iter().map(|c| c.raw_bytes().clone()).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn test_pop_accumulates_usage_and_delete_skips_it() {
        let mut buffer = buffer_of(&[(0, "x")]);
        let usage = json!({"choices": [], "usage": {"prompt_tokens": 2, "completion_tokens": 3}});
        buffer.append_chunk(StreamChunk::synthesized(Provider::OpenAi, usage.clone()));
        buffer.append_chunk(StreamChunk::synthesized(Provider::OpenAi, usage));
        assert_eq!(
            buffer.get_usage_from_chunks(|j| Provider::OpenAi.tokens(j), 0, buffer.len()),
            Tokens::new(4, 6)
        );
        buffer.delete_chunks(1, 2);
        assert_eq!(buffer.len(), 2);
        let popped = buffer.pop_all();
        assert_eq!(popped.len(), 2);
        assert_eq!(buffer.tokens(), Tokens::new(2, 3));
        assert_eq!(buffer.buffered_bytes(), 0);
    }

    #[test]
    fn test_cumulative_usage_replaces() {
        let mut buffer = StreamChunks::new(Provider::Gemini);
        for n in 1..=3u64 {
            buffer.append_chunk(StreamChunk::synthesized(
                Provider::Gemini,
                json!({"candidates": [{"content": {"parts": [{"text": "x"}]}, "index": 0}],
                       "usageMetadata": {"promptTokenCount": 9, "candidatesTokenCount": 3 * n}}),
            ));
        }
        buffer.pop_all();
        assert_eq!(buffer.tokens(), Tokens::new(9, 9));
    }

    #[test]
    fn test_roles_and_function_calling_are_sticky() {
        let mut buffer = StreamChunks::new(Provider::OpenAi);
        buffer.append_chunk(StreamChunk::synthesized(
            Provider::OpenAi,
            json!({"model": "gpt-4o", "choices": [{"index": 1, "delta": {"role": "assistant", "content": ""}}]}),
        ));
        buffer.append_chunk(StreamChunk::synthesized(
            Provider::OpenAi,
            json!({"model": "other", "choices": [{"index": 0, "delta": {"tool_calls": [{"index": 0}]}}]}),
        ));
        assert!(buffer.is_function_calling());
        assert_eq!(buffer.model(), Some("gpt-4o"));
        assert_eq!(buffer.roles(), vec!["assistant", "assistant"]);
        buffer.pop_all();
        assert!(buffer.is_function_calling());
    }
}
