use bytes::{Bytes, BytesMut};
use serde_json::Value;
use tracing::warn;

use crate::provider::Provider;

/// Classification of one streamed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChunkKind {
    NormalText,
    NormalBinary,
    /// Finish reason together with content.
    Finish,
    /// Finish reason only.
    FinishNoContent,
    /// Usage-only terminal frame.
    LastUsage,
    /// `[DONE]` sentinel.
    Done,
    Invalid,
    Unknown,
}

/// One SSE message.
///
/// `raw` is what goes downstream. It is `head` (everything before the data
/// payload, e.g. `event: x\ndata: `) followed by the payload and the
/// provider delimiter. After a content rewrite the payload is re-serialized
/// from `parsed` and `raw` is rebuilt; untouched chunks keep their bytes.
#[derive(Debug, Clone)]
pub struct StreamChunk {
    raw: Bytes,
    head: Bytes,
    delimiter: &'static [u8],
    parsed: Option<Value>,
    kind: ChunkKind,
    contents: Vec<String>,
}

impl StreamChunk {
    pub(crate) fn new(
        provider: Provider,
        raw: Bytes,
        head: Bytes,
        parsed: Option<Value>,
        kind: ChunkKind,
    ) -> Self {
        let contents = parsed
            .as_ref()
            .map(|p| provider.extract_contents_from_resp_chunk(p))
            .unwrap_or_default();
        Self {
            raw,
            head,
            delimiter: provider.sse_delimiter(),
            parsed,
            kind,
            contents,
        }
    }

    /// Build a new frame around `parsed` with the provider's framing.
    #[must_use]
    pub fn synthesized(provider: Provider, parsed: Value) -> Self {
        let head = Bytes::from(provider.sse_head(&parsed));
        let kind = provider.get_stream_resp_chunk_type(&parsed);
        let mut chunk = Self::new(provider, Bytes::new(), head, Some(parsed), kind);
        chunk.rebuild_raw();
        chunk
    }

    #[must_use]
    pub fn raw_bytes(&self) -> &Bytes {
        &self.raw
    }

    #[must_use]
    pub fn into_raw_bytes(self) -> Bytes {
        self.raw
    }

    #[must_use]
    pub fn parsed(&self) -> Option<&Value> {
        self.parsed.as_ref()
    }

    #[must_use]
    pub fn kind(&self) -> ChunkKind {
        self.kind
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.kind == ChunkKind::Done
    }

    /// Per-choice text, one slot per choice index of the owning buffer.
    #[must_use]
    pub fn contents(&self) -> &[String] {
        &self.contents
    }

    /// Text for choice `k`; empty when the slot does not exist.
    #[must_use]
    pub fn content(&self, k: usize) -> &str {
        self.contents.get(k).map_or("", String::as_str)
    }

    pub(crate) fn widen(&mut self, width: usize) {
        if self.contents.len() < width {
            self.contents.resize(width, String::new());
        }
    }

    /// Overwrite choice `k`'s text and regenerate the wire bytes.
    ///
    /// Returns false for frames without a JSON payload.
    pub(crate) fn set_content(&mut self, provider: Provider, k: usize, text: &str) -> bool {
        let Some(parsed) = self.parsed.as_mut() else {
            return false;
        };
        provider.update_stream_resp_contents(parsed, k, text);
        let contents = provider.extract_contents_from_resp_chunk(parsed);
        let kind = provider.get_stream_resp_chunk_type(parsed);
        let width = self.contents.len();
        self.contents = contents;
        self.kind = kind;
        self.widen(width);
        self.rebuild_raw();
        true
    }

    fn rebuild_raw(&mut self) {
        let Some(parsed) = self.parsed.as_ref() else {
            return;
        };
        match serde_json::to_vec(parsed) {
            Ok(payload) => {
                let mut buf =
                    BytesMut::with_capacity(self.head.len() + payload.len() + self.delimiter.len());
                buf.extend_from_slice(&self.head);
                buf.extend_from_slice(&payload);
                buf.extend_from_slice(self.delimiter);
                self.raw = buf.freeze();
            }
            Err(e) => warn!(error = %e, "failed to re-serialize rewritten chunk; keeping original bytes"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_synthesized_openai_frame() {
        let chunk = StreamChunk::synthesized(
            Provider::OpenAi,
            json!({"choices": [{"index": 0, "delta": {"content": "hi"}}]}),
        );
        assert_eq!(
            chunk.raw_bytes().as_ref(),
            br#"data: {"choices":[{"index":0,"delta":{"content":"hi"}}]}

"#
            .as_slice()
        );
        assert_eq!(chunk.kind(), ChunkKind::NormalText);
        assert_eq!(chunk.contents(), ["hi"]);
    }

    #[test]
    fn test_set_content_keeps_head_and_width() {
        let parsed = json!({"type": "content_block_delta", "index": 0, "delta": {"type": "text_delta", "text": "a"}});
        let mut chunk = StreamChunk::synthesized(Provider::Anthropic, parsed);
        chunk.widen(2);
        assert!(chunk.set_content(Provider::Anthropic, 0, "b"));
        assert_eq!(chunk.contents(), ["b", ""]);
        assert!(chunk.raw_bytes().starts_with(b"event: content_block_delta\ndata: {"));
        assert!(chunk.raw_bytes().ends_with(b"\"text\":\"b\"}}\n\n"));
    }

    #[test]
    fn test_set_content_without_payload_is_refused() {
        let mut chunk = StreamChunk::new(
            Provider::OpenAi,
            Bytes::from_static(b"data: [DONE]\n\n"),
            Bytes::from_static(b"data: "),
            None,
            ChunkKind::Done,
        );
        assert!(!chunk.set_content(Provider::OpenAi, 0, "x"));
        assert_eq!(chunk.raw_bytes().as_ref(), b"data: [DONE]\n\n");
        assert_eq!(chunk.content(3), "");
    }
}
