//! Provider abstraction.
//!
//! A closed set of upstream API families behind one capability set, so the
//! chunk buffer and guardrails work on uniform per-choice text. Each
//! variant dispatches to its module; Anthropic shares request-side helpers
//! with OpenAI, and Vertex AI shares everything with Gemini apart from how
//! it is selected.

pub mod anthropic;
pub mod gemini;
pub mod openai;
mod parts;
mod tokens;
pub mod webhook;

use std::fmt;

use serde_json::Value;
use smallvec::SmallVec;
use tracing::warn;

use crate::headers::HeaderSnapshot;
use crate::stream::{ChunkKind, StreamChunk};

pub use tokens::{TokenDetails, Tokens};
pub use webhook::{PromptMessage, PromptMessages, ResponseChoice, ResponseChoices, ResponseMessage};

/// Choice indices at or above this are ignored when extracting content.
pub const MAX_CHOICES: usize = 128;

/// Body/webhook shape errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    #[error("webhook returned {got} entries, body has {expected}")]
    LengthMismatch { expected: usize, got: usize },
    #[error("body has no `{0}` field")]
    MissingField(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Provider {
    OpenAi,
    Anthropic,
    Gemini,
    VertexAi,
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub(crate) fn u64_at(v: &Value, key: &str) -> u64 {
    v.get(key).and_then(Value::as_u64).unwrap_or(0)
}

/// `index` field of a choice/candidate, else its position in the array.
pub(crate) fn choice_index(choice: &Value, position: usize) -> usize {
    choice
        .get("index")
        .and_then(Value::as_u64)
        .and_then(|i| usize::try_from(i).ok())
        .unwrap_or(position)
}

pub(crate) fn warn_role_change(original: &str, proposed: &str) {
    if original != proposed {
        warn!(
            original_role = original,
            webhook_role = proposed,
            "webhook changed a message role; keeping the original role"
        );
    }
}

impl Provider {
    /// Parse the `x-llm-provider` header value.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "openai" => Some(Self::OpenAi),
            "anthropic" => Some(Self::Anthropic),
            "gemini" => Some(Self::Gemini),
            "vertexai" | "vertex" => Some(Self::VertexAi),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
            Self::Gemini => "gemini",
            Self::VertexAi => "vertexai",
        }
    }

    #[must_use]
    pub fn is_gemini_family(self) -> bool {
        matches!(self, Self::Gemini | Self::VertexAi)
    }

    #[must_use]
    pub fn sse_delimiter(self) -> &'static [u8] {
        if self.is_gemini_family() {
            b"\r\n\r\n"
        } else {
            b"\n\n"
        }
    }

    /// Prefix written before the JSON payload of a synthesized frame.
    #[must_use]
    pub fn sse_head(self, jsn: &Value) -> String {
        match self {
            Self::Anthropic => anthropic::sse_head(jsn),
            _ => "data: ".to_string(),
        }
    }

    // -----------------------------------------------------------------------
    // Usage
    // -----------------------------------------------------------------------

    #[must_use]
    pub fn tokens(self, jsn: &Value) -> Tokens {
        match self {
            Self::OpenAi => openai::tokens(jsn),
            Self::Anthropic => anthropic::tokens(jsn),
            Self::Gemini | Self::VertexAi => gemini::tokens(jsn),
        }
    }

    /// Gemini repeats running totals on every frame, so the latest report
    /// replaces the aggregate instead of adding to it.
    #[must_use]
    pub fn usage_is_cumulative(self) -> bool {
        self.is_gemini_family()
    }

    #[must_use]
    pub fn create_usage_json(self, tokens: &Tokens) -> Value {
        match self {
            Self::OpenAi => openai::create_usage_json(tokens),
            Self::Anthropic => anthropic::create_usage_json(tokens),
            Self::Gemini | Self::VertexAi => gemini::create_usage_json(tokens),
        }
    }

    /// Inject `tokens` into a streaming frame. Anthropic frames are left
    /// untouched; its usage lives on `message_start`/`message_delta` events
    /// with split semantics.
    pub fn update_stream_resp_usage_token(self, jsn: &mut Value, tokens: &Tokens) {
        match self {
            Self::OpenAi => openai::update_stream_resp_usage_token(jsn, tokens),
            Self::Anthropic => {}
            Self::Gemini | Self::VertexAi => gemini::update_stream_resp_usage_token(jsn, tokens),
        }
    }

    // -----------------------------------------------------------------------
    // Request / response metadata
    // -----------------------------------------------------------------------

    #[must_use]
    pub fn get_model_req(self, body: &Value, headers: &HeaderSnapshot) -> Option<String> {
        match self {
            Self::OpenAi | Self::Anthropic => body
                .get("model")
                .and_then(Value::as_str)
                .map(str::to_string),
            Self::Gemini | Self::VertexAi => gemini::get_model_req(headers),
        }
    }

    #[must_use]
    pub fn get_model_resp(self, body: &Value) -> Option<String> {
        match self {
            Self::OpenAi => body.get("model").and_then(Value::as_str).map(str::to_string),
            Self::Anthropic => anthropic::get_model_resp(body),
            Self::Gemini | Self::VertexAi => body
                .get("modelVersion")
                .and_then(Value::as_str)
                .map(str::to_string),
        }
    }

    #[must_use]
    pub fn is_streaming_req(self, body: &Value, headers: &HeaderSnapshot) -> bool {
        match self {
            Self::OpenAi | Self::Anthropic => body.get("stream").and_then(Value::as_bool) == Some(true),
            Self::Gemini | Self::VertexAi => gemini::is_streaming_req(headers),
        }
    }

    /// `text/event-stream` is always a stream. Gemini also streams as a raw
    /// JSON array under `application/json` when the request asked for it.
    #[must_use]
    pub fn is_streaming_response(self, is_streaming_req: bool, headers: &HeaderSnapshot) -> bool {
        match headers.content_type().as_deref() {
            Some("text/event-stream") => true,
            Some("application/json") => self.is_gemini_family() && is_streaming_req,
            _ => false,
        }
    }

    // -----------------------------------------------------------------------
    // Streaming frames
    // -----------------------------------------------------------------------

    #[must_use]
    pub fn extract_contents_from_resp_chunk(self, jsn: &Value) -> Vec<String> {
        match self {
            Self::OpenAi => openai::extract_contents(jsn),
            Self::Anthropic => anthropic::extract_contents(jsn),
            Self::Gemini | Self::VertexAi => gemini::extract_contents(jsn),
        }
    }

    #[must_use]
    pub fn has_choice_index(self, jsn: &Value, k: usize) -> bool {
        match self {
            Self::OpenAi => openai::has_choice_index(jsn, k),
            Self::Anthropic => anthropic::has_choice_index(jsn, k),
            Self::Gemini | Self::VertexAi => gemini::has_choice_index(jsn, k),
        }
    }

    /// Overwrite the text of choice `k`, leaving every other field as is.
    pub fn update_stream_resp_contents(self, jsn: &mut Value, k: usize, text: &str) {
        match self {
            Self::OpenAi => openai::update_stream_resp_contents(jsn, k, text),
            Self::Anthropic => anthropic::update_stream_resp_contents(jsn, k, text),
            Self::Gemini | Self::VertexAi => gemini::update_stream_resp_contents(jsn, k, text),
        }
    }

    /// A new text-only frame for choice `k` modelled on `template`, with
    /// empty text, no finish reason and no usage.
    #[must_use]
    pub fn content_only_chunk(self, template: &Value, k: usize) -> Value {
        match self {
            Self::OpenAi => openai::content_only_chunk(template, k),
            Self::Anthropic => anthropic::content_only_chunk(template),
            Self::Gemini | Self::VertexAi => gemini::content_only_chunk(template, k),
        }
    }

    #[must_use]
    pub fn get_stream_resp_chunk_type(self, jsn: &Value) -> ChunkKind {
        match self {
            Self::OpenAi => openai::chunk_kind(jsn),
            Self::Anthropic => anthropic::chunk_kind(jsn),
            Self::Gemini | Self::VertexAi => gemini::chunk_kind(jsn),
        }
    }

    #[must_use]
    pub fn has_function_call_finish_reason(self, jsn: &Value) -> bool {
        match self {
            Self::OpenAi => openai::has_function_call(jsn),
            Self::Anthropic => anthropic::has_function_call(jsn),
            Self::Gemini | Self::VertexAi => gemini::has_function_call(jsn),
        }
    }

    #[must_use]
    pub fn is_streaming_response_completed(self, chunk: &StreamChunk) -> bool {
        match self {
            Self::OpenAi => chunk.kind() == ChunkKind::Done,
            Self::Anthropic => chunk.parsed().is_some_and(anthropic::is_completed),
            Self::Gemini | Self::VertexAi => chunk.parsed().is_some_and(gemini::is_completed),
        }
    }

    /// `(choice, role)` pairs announced by this frame.
    #[must_use]
    pub fn roles_from_resp_chunk(self, jsn: &Value) -> Vec<(usize, String)> {
        match self {
            Self::OpenAi => openai::roles(jsn),
            Self::Anthropic => anthropic::roles(jsn),
            Self::Gemini | Self::VertexAi => gemini::roles(jsn),
        }
    }

    /// Choices this frame marks as finished.
    #[must_use]
    pub fn finished_choices(self, jsn: &Value) -> SmallVec<[usize; 4]> {
        match self {
            Self::OpenAi => openai::finished_choices(jsn),
            Self::Anthropic => anthropic::finished_choices(jsn),
            Self::Gemini | Self::VertexAi => gemini::finished_choices(jsn),
        }
    }

    // -----------------------------------------------------------------------
    // Whole bodies
    // -----------------------------------------------------------------------

    /// Apply `f(role, text)` to every textual request message, writing back
    /// changed text in place.
    ///
    /// # Errors
    ///
    /// Stops at and returns the first error produced by `f`.
    pub fn iterate_str_req_messages<E, F>(self, body: &mut Value, mut f: F) -> Result<(), E>
    where
        F: FnMut(&str, &str) -> Result<String, E>,
    {
        match self {
            Self::OpenAi => openai::iterate_str_req_messages(body, &mut f),
            Self::Anthropic => anthropic::iterate_str_req_messages(body, &mut f),
            Self::Gemini | Self::VertexAi => gemini::iterate_str_req_messages(body, &mut f),
        }
    }

    /// Response-side counterpart of [`Self::iterate_str_req_messages`].
    ///
    /// # Errors
    ///
    /// Stops at and returns the first error produced by `f`.
    pub fn iterate_str_resp_messages<E, F>(self, body: &mut Value, mut f: F) -> Result<(), E>
    where
        F: FnMut(&str, &str) -> Result<String, E>,
    {
        match self {
            Self::OpenAi => openai::iterate_str_resp_messages(body, &mut f),
            Self::Anthropic => anthropic::iterate_str_resp_messages(body, &mut f),
            Self::Gemini | Self::VertexAi => gemini::iterate_str_resp_messages(body, &mut f),
        }
    }

    #[must_use]
    pub fn get_num_tokens_from_body(self, body: &Value) -> u64 {
        match self {
            Self::OpenAi => openai::get_num_tokens_from_body(body),
            Self::Anthropic => anthropic::get_num_tokens_from_body(body),
            Self::Gemini | Self::VertexAi => gemini::get_num_tokens_from_body(body),
        }
    }

    #[must_use]
    pub fn all_req_content(self, body: &Value) -> String {
        match self {
            Self::OpenAi => openai::all_req_content(body),
            Self::Anthropic => anthropic::all_req_content(body),
            Self::Gemini | Self::VertexAi => gemini::all_req_content(body),
        }
    }

    #[must_use]
    pub fn construct_request_webhook_request_body(self, body: &Value) -> PromptMessages {
        match self {
            Self::OpenAi => openai::construct_request_webhook_request_body(body),
            Self::Anthropic => anthropic::construct_request_webhook_request_body(body),
            Self::Gemini | Self::VertexAi => gemini::construct_request_webhook_request_body(body),
        }
    }

    /// # Errors
    ///
    /// Returns [`ProviderError::LengthMismatch`] when the webhook changed the
    /// number of messages; `body` is not modified in that case.
    pub fn update_request_body_from_webhook(
        self,
        body: &mut Value,
        modified: &PromptMessages,
    ) -> Result<(), ProviderError> {
        match self {
            Self::OpenAi => openai::update_request_body_from_webhook(body, modified),
            Self::Anthropic => anthropic::update_request_body_from_webhook(body, modified),
            Self::Gemini | Self::VertexAi => gemini::update_request_body_from_webhook(body, modified),
        }
    }

    #[must_use]
    pub fn construct_response_webhook_request_body(self, body: &Value) -> ResponseChoices {
        match self {
            Self::OpenAi => openai::construct_response_webhook_request_body(body),
            Self::Anthropic => anthropic::construct_response_webhook_request_body(body),
            Self::Gemini | Self::VertexAi => gemini::construct_response_webhook_request_body(body),
        }
    }

    /// # Errors
    ///
    /// Returns [`ProviderError::LengthMismatch`] when the webhook changed the
    /// number of choices; `body` is not modified in that case.
    pub fn update_response_body_from_webhook(
        self,
        body: &mut Value,
        modified: &ResponseChoices,
    ) -> Result<(), ProviderError> {
        match self {
            Self::OpenAi => openai::update_response_body_from_webhook(body, modified),
            Self::Anthropic => anthropic::update_response_body_from_webhook(body, modified),
            Self::Gemini | Self::VertexAi => gemini::update_response_body_from_webhook(body, modified),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_from_name() {
        assert_eq!(Provider::from_name("OpenAI"), Some(Provider::OpenAi));
        assert_eq!(Provider::from_name("vertexai"), Some(Provider::VertexAi));
        assert_eq!(Provider::from_name("cohere"), None);
    }

    #[test]
    fn test_delimiters() {
        assert_eq!(Provider::OpenAi.sse_delimiter(), b"\n\n");
        assert_eq!(Provider::Anthropic.sse_delimiter(), b"\n\n");
        assert_eq!(Provider::Gemini.sse_delimiter(), b"\r\n\r\n");
        assert_eq!(Provider::VertexAi.sse_delimiter(), b"\r\n\r\n");
    }

    #[test]
    fn test_streaming_detection() {
        let sse = HeaderSnapshot::from_pairs([("content-type", "text/event-stream")]);
        let json_ct = HeaderSnapshot::from_pairs([("content-type", "application/json")]);
        assert!(Provider::OpenAi.is_streaming_response(false, &sse));
        assert!(!Provider::OpenAi.is_streaming_response(true, &json_ct));
        assert!(Provider::Gemini.is_streaming_response(true, &json_ct));
        assert!(!Provider::Gemini.is_streaming_response(false, &json_ct));

        let body = json!({"model": "gpt-4o", "stream": true});
        assert!(Provider::OpenAi.is_streaming_req(&body, &HeaderSnapshot::new()));
        assert!(Provider::Anthropic.is_streaming_req(&body, &HeaderSnapshot::new()));
        assert!(!Provider::Gemini.is_streaming_req(&body, &HeaderSnapshot::new()));
    }

    #[test]
    fn test_update_usage_token_per_provider() {
        let tokens = Tokens::new(5, 7);
        let mut openai = json!({"choices": []});
        Provider::OpenAi.update_stream_resp_usage_token(&mut openai, &tokens);
        assert_eq!(Provider::OpenAi.tokens(&openai), tokens);

        let mut gemini = json!({"candidates": []});
        Provider::Gemini.update_stream_resp_usage_token(&mut gemini, &tokens);
        assert_eq!(Provider::Gemini.tokens(&gemini), tokens);

        let mut anthropic = json!({"type": "ping"});
        Provider::Anthropic.update_stream_resp_usage_token(&mut anthropic, &tokens);
        assert_eq!(anthropic, json!({"type": "ping"}));
    }

    #[test]
    fn test_num_tokens_openai_message_overhead() {
        let body = json!({"messages": [{"role": "user", "content": "hello world"}]});
        // 3 per message + "user" (1) + "hello world" (2) + 3 priming
        assert_eq!(Provider::OpenAi.get_num_tokens_from_body(&body), 9);

        let named = json!({"messages": [{"role": "user", "name": "bob", "content": "hello world"}]});
        let base = Provider::OpenAi.get_num_tokens_from_body(&body);
        assert_eq!(
            Provider::OpenAi.get_num_tokens_from_body(&named),
            base + 1 + crate::observability::token_counter::count_text_tokens("bob")
        );
    }

    #[test]
    fn test_iterate_req_messages_rewrites_in_place() {
        let mut body = json!({"messages": [
            {"role": "system", "content": "keep"},
            {"role": "user", "content": "mail bob@example.com"}
        ]});
        let mut seen = Vec::new();
        Provider::OpenAi
            .iterate_str_req_messages(&mut body, |role, text| {
                seen.push(role.to_string());
                Ok::<_, ()>(text.replace("bob@example.com", "<EMAIL>"))
            })
            .unwrap();
        assert_eq!(seen, vec!["system", "user"]);
        assert_eq!(body["messages"][1]["content"], "mail <EMAIL>");
    }
}
