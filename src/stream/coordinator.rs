//! Per-stream driver of the chunk pipeline.
//!
//! Bytes arrive from the upstream in arbitrary pieces. The coordinator
//! splits them into frames, buffers them, and releases a prefix once every
//! choice has reached a boundary, after the guardrails have seen (and
//! possibly rewritten) that prefix. Tool-call and binary streams, and
//! streams without response guardrails, are passed through as received.

use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};

use super::chunk::ChunkKind;
use super::chunks::StreamChunks;
use super::sse::SseChunkParser;
use crate::config::{FeaturesConfig, OverflowPolicy};
use crate::error::ImmediateResponse;
use crate::guardrail::GuardrailSet;
use crate::headers::HeaderSnapshot;
use crate::provider::{Provider, Tokens};

#[derive(Debug, Clone, Copy)]
pub struct CoordinatorSettings {
    pub min_content_chars: usize,
    pub max_buffered_bytes: usize,
    pub overflow: OverflowPolicy,
    /// Drop usage-only frames instead of forwarding them; their usage is
    /// still counted.
    pub strip_usage_frames: bool,
}

impl CoordinatorSettings {
    #[must_use]
    pub fn from_features(features: &FeaturesConfig) -> Self {
        Self {
            min_content_chars: features.min_guardrail_chars,
            max_buffered_bytes: features.max_buffered_bytes,
            overflow: features.buffer_overflow,
            strip_usage_frames: false,
        }
    }
}

impl Default for CoordinatorSettings {
    fn default() -> Self {
        Self::from_features(&FeaturesConfig::default())
    }
}

/// What to do with one downstream body message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamStep {
    /// Replace the message body with these bytes (possibly empty).
    Emit(Bytes),
    /// End the stream with this response.
    Reject(ImmediateResponse),
}

pub struct StreamCoordinator {
    parser: SseChunkParser,
    buffer: StreamChunks,
    settings: CoordinatorSettings,
    first_byte_emitted: bool,
    drained: bool,
    passthrough: bool,
    finished: bool,
}

impl StreamCoordinator {
    #[must_use]
    pub fn new(provider: Provider, settings: CoordinatorSettings) -> Self {
        Self {
            parser: SseChunkParser::new(provider),
            buffer: StreamChunks::new(provider),
            settings,
            first_byte_emitted: false,
            drained: false,
            passthrough: false,
            finished: false,
        }
    }

    /// Usage of every frame released so far.
    #[must_use]
    pub fn tokens(&self) -> Tokens {
        self.buffer.tokens()
    }

    #[must_use]
    pub fn model(&self) -> Option<&str> {
        self.buffer.model()
    }

    #[must_use]
    pub fn is_function_calling(&self) -> bool {
        self.buffer.is_function_calling()
    }

    #[must_use]
    pub fn first_byte_emitted(&self) -> bool {
        self.first_byte_emitted
    }

    /// Whether the upstream signalled the end of the completion.
    #[must_use]
    pub fn is_drained(&self) -> bool {
        self.drained
    }

    #[must_use]
    pub fn buffered_chunks(&self) -> usize {
        self.buffer.len()
    }

    /// Feed one body message from the upstream.
    pub async fn on_chunk(
        &mut self,
        bytes: &[u8],
        end_of_stream: bool,
        guard: Option<(&GuardrailSet, &HeaderSnapshot)>,
    ) -> StreamStep {
        if self.finished {
            return StreamStep::Emit(Bytes::new());
        }

        let provider = self.buffer.provider();
        for frame in self.parser.feed(bytes) {
            if frame.is_done() || provider.is_streaming_response_completed(&frame) {
                self.drained = true;
            }
            self.buffer.append_chunk(frame);
        }

        let guard = guard.filter(|(set, _)| set.guards_responses());
        if !self.passthrough
            && (guard.is_none() || self.buffer.is_function_calling() || self.buffer.has_binary())
        {
            debug!(
                provider = %provider,
                function_calling = self.buffer.is_function_calling(),
                binary = self.buffer.has_binary(),
                "stream switched to pass-through"
            );
            self.passthrough = true;
        }

        let mut out = BytesMut::new();
        let step = match guard {
            Some((set, headers)) if !self.passthrough => {
                self.guarded_step(set, headers, end_of_stream, &mut out).await
            }
            _ => {
                self.emit_prefix(self.buffer.len(), &mut out);
                Ok(())
            }
        };
        if let Err(reject) = step {
            self.finished = true;
            let reject = if self.first_byte_emitted {
                reject.with_status(500)
            } else {
                reject
            };
            return StreamStep::Reject(reject);
        }

        if end_of_stream {
            self.emit_prefix(self.buffer.len(), &mut out);
            let leftover = self.parser.take_leftover();
            if !leftover.is_empty() {
                warn!(bytes = leftover.len(), "stream ended inside a frame; forwarding tail as is");
                out.extend_from_slice(&leftover);
            }
            self.finished = true;
        }
        if !out.is_empty() {
            self.first_byte_emitted = true;
        }
        StreamStep::Emit(out.freeze())
    }

    async fn guarded_step(
        &mut self,
        set: &GuardrailSet,
        headers: &HeaderSnapshot,
        end_of_stream: bool,
        out: &mut BytesMut,
    ) -> Result<(), ImmediateResponse> {
        if self.drained || end_of_stream {
            self.guard_all(set, headers).await?;
            self.emit_prefix(self.buffer.len(), out);
            return Ok(());
        }

        let contents = self.buffer.get_contents_with_chunk_indices();
        let n = self
            .buffer
            .align_contents_for_guardrail(&contents, self.settings.min_content_chars);
        if n > 0 {
            let prefix = self.buffer.prefix_contents(n);
            let texts = prefix.iter().map(|c| c.text.clone()).collect();
            let guarded = set
                .guard_stream_texts(&self.buffer.roles(), texts, headers)
                .await?;
            let to_pop = self.buffer.collapse_chunks_with_new_content(&prefix, &guarded);
            self.emit_prefix(n.max(to_pop), out);
            return Ok(());
        }

        if self.buffer.buffered_bytes() > self.settings.max_buffered_bytes {
            match self.settings.overflow {
                OverflowPolicy::Flush => {
                    warn!(
                        buffered = self.buffer.buffered_bytes(),
                        cap = self.settings.max_buffered_bytes,
                        "no boundary within the buffer cap; flushing"
                    );
                    self.guard_all(set, headers).await?;
                    self.emit_prefix(self.buffer.len(), out);
                }
                OverflowPolicy::Reject => {
                    warn!(
                        buffered = self.buffer.buffered_bytes(),
                        cap = self.settings.max_buffered_bytes,
                        "no boundary within the buffer cap; rejecting"
                    );
                    return Err(ImmediateResponse::internal(
                        "stream buffer exceeded max_buffered_bytes",
                    ));
                }
            }
        }
        Ok(())
    }

    /// One unconditional pass over everything buffered.
    async fn guard_all(
        &mut self,
        set: &GuardrailSet,
        headers: &HeaderSnapshot,
    ) -> Result<(), ImmediateResponse> {
        let contents = self.buffer.get_contents_with_chunk_indices();
        if contents.iter().all(|c| c.text.is_empty()) {
            return Ok(());
        }
        let texts = contents.iter().map(|c| c.text.clone()).collect();
        let guarded = set
            .guard_stream_texts(&self.buffer.roles(), texts, headers)
            .await?;
        self.buffer.collapse_chunks_with_new_content(&contents, &guarded);
        Ok(())
    }

    /// Pop the first `n` chunks into `out`, dropping usage-only frames when
    /// configured to.
    fn emit_prefix(&mut self, n: usize, out: &mut BytesMut) {
        let mut n = n.min(self.buffer.len());
        if self.settings.strip_usage_frames {
            let provider = self.buffer.provider();
            for i in (0..n).rev() {
                let is_usage = self
                    .buffer
                    .get(i)
                    .is_some_and(|c| c.kind() == ChunkKind::LastUsage);
                if is_usage {
                    let usage = self
                        .buffer
                        .get_usage_from_chunks(|v| provider.tokens(v), i, i + 1);
                    self.buffer.add_tokens(usage);
                    self.buffer.delete_chunks(i, i + 1);
                    n -= 1;
                }
            }
        }
        for chunk in self.buffer.pop_chunks(n) {
            out.extend_from_slice(chunk.raw_bytes());
        }
    }
}
