//! SSE frame splitting for provider response streams.
//!
//! Bytes are split on the provider delimiter (`\n\n`, or `\r\n\r\n` for
//! Gemini). Every complete segment becomes one [`StreamChunk`] whose raw
//! bytes are the segment plus its delimiter, so re-emitting the chunks
//! reproduces the input exactly. The trailing partial segment is kept as
//! leftover for the next call.

use std::borrow::Cow;

use bytes::{Bytes, BytesMut};
use memchr::{memchr, memmem};
use serde_json::Value;
use tracing::debug;

use super::chunk::{ChunkKind, StreamChunk};
use crate::provider::Provider;

const DATA_FIELD: &[u8] = b"data:";
const DONE_SENTINEL: &[u8] = b"[DONE]";

/// Incremental splitter owning the leftover bytes between calls.
pub struct SseChunkParser {
    provider: Provider,
    finder: memmem::Finder<'static>,
    leftover: BytesMut,
}

impl SseChunkParser {
    #[must_use]
    pub fn new(provider: Provider) -> Self {
        Self {
            provider,
            finder: memmem::Finder::new(provider.sse_delimiter()),
            leftover: BytesMut::new(),
        }
    }

    /// Append `incoming` and return every frame completed by it.
    pub fn feed(&mut self, incoming: &[u8]) -> Vec<StreamChunk> {
        let mut out = Vec::new();
        self.feed_into(incoming, &mut out);
        out
    }

    pub fn feed_into(&mut self, incoming: &[u8], out: &mut Vec<StreamChunk>) {
        self.leftover.extend_from_slice(incoming);
        let delimiter_len = self.finder.needle().len();
        while let Some(pos) = self.finder.find(&self.leftover) {
            let segment = self.leftover.split_to(pos + delimiter_len).freeze();
            out.push(parse_segment(self.provider, segment, pos));
        }
    }

    /// Bytes of the incomplete trailing segment.
    #[must_use]
    pub fn leftover(&self) -> &[u8] {
        &self.leftover
    }

    pub fn take_leftover(&mut self) -> Bytes {
        self.leftover.split().freeze()
    }
}

/// Stateless form: `(chunks, new_leftover)` for `leftover ++ incoming`.
#[must_use]
pub fn parse_sse_chunks(
    provider: Provider,
    incoming: &[u8],
    leftover: &[u8],
) -> (Vec<StreamChunk>, Bytes) {
    let mut parser = SseChunkParser::new(provider);
    parser.leftover.extend_from_slice(leftover);
    let chunks = parser.feed(incoming);
    (chunks, parser.take_leftover())
}

/// Offset where the first `data:` field value starts, if any.
fn data_value_start(body: &[u8]) -> Option<usize> {
    let mut pos = 0;
    while pos < body.len() {
        let line_end = memchr(b'\n', &body[pos..]).map_or(body.len(), |i| pos + i);
        if body[pos..line_end].starts_with(DATA_FIELD) {
            let mut start = pos + DATA_FIELD.len();
            if body.get(start) == Some(&b' ') {
                start += 1;
            }
            return Some(start);
        }
        pos = line_end + 1;
    }
    None
}

fn strip_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// The data payload, joining continuation `data:` lines with `\n`.
fn data_payload(rest: &[u8]) -> Cow<'_, [u8]> {
    let Some(first_end) = memchr(b'\n', rest) else {
        return Cow::Borrowed(strip_cr(rest));
    };
    let mut joined = strip_cr(&rest[..first_end]).to_vec();
    for line in rest[first_end + 1..].split(|b| *b == b'\n') {
        if let Some(value) = line.strip_prefix(DATA_FIELD) {
            let value = value.strip_prefix(b" ").unwrap_or(value);
            joined.push(b'\n');
            joined.extend_from_slice(strip_cr(value));
        }
    }
    Cow::Owned(joined)
}

/// Classify one complete segment; `body_len` excludes the delimiter.
fn parse_segment(provider: Provider, segment: Bytes, body_len: usize) -> StreamChunk {
    let body = &segment[..body_len];
    let Some(value_start) = data_value_start(body) else {
        let head = segment.slice(..body_len);
        return StreamChunk::new(provider, segment, head, None, ChunkKind::Unknown);
    };
    let head = segment.slice(..value_start);
    let payload = data_payload(&body[value_start..]);
    let trimmed = payload.trim_ascii();

    if trimmed == DONE_SENTINEL {
        return StreamChunk::new(provider, segment, head, None, ChunkKind::Done);
    }
    if trimmed.is_empty() {
        return StreamChunk::new(provider, segment, head, None, ChunkKind::Unknown);
    }
    match serde_json::from_slice::<Value>(trimmed) {
        Ok(parsed) => {
            let kind = provider.get_stream_resp_chunk_type(&parsed);
            StreamChunk::new(provider, segment, head, Some(parsed), kind)
        }
        Err(e) => {
            debug!(error = %e, provider = %provider, "undecodable SSE payload kept as invalid");
            StreamChunk::new(provider, segment, head, None, ChunkKind::Invalid)
        }
    }
}
