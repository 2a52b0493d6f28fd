//! Per-request handler driven by the gateway.
//!
//! The driver feeds the four ext_proc phases in order: request headers,
//! request body, response headers, response body. Each phase returns what
//! the gateway should do with the message. The `*_or_passthrough` variants
//! never fail: errors are counted and turned into "leave it unchanged".

pub mod encoding;

use std::sync::Arc;
use std::time::Instant;

use bytes::{Bytes, BytesMut};
use serde_json::{json, Value};
use tracing::{debug, info_span, warn, Instrument, Span};

use crate::auth::extract_auth_token;
use crate::error::{ExtProcError, ImmediateResponse};
use crate::guardrail::GuardrailSet;
use crate::headers::HeaderSnapshot;
use crate::observability::log_request_complete;
use crate::provider::{Provider, Tokens};
use crate::state::{AppState, DEFAULT_POLICY};
use crate::stream::{CoordinatorSettings, StreamCoordinator, StreamStep};

/// Header naming the upstream provider explicitly.
pub const PROVIDER_HEADER: &str = "x-llm-provider";
/// Header naming the guardrail policy.
pub const POLICY_HEADER: &str = "x-guardrail-policy";

/// Metadata published back to the gateway.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DynamicMetadata {
    pub auth_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHeadersOutcome {
    pub provider: Provider,
    pub policy: Option<String>,
    pub metadata: DynamicMetadata,
}

/// What the gateway does with a body message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BodyMutation {
    /// Still accumulating; hold the message.
    Buffered,
    /// Forward as received.
    Unchanged,
    /// Forward these bytes instead.
    Replace(Bytes),
    /// Stop and answer the client.
    Immediate(ImmediateResponse),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestBodyOutcome {
    pub mutation: BodyMutation,
    /// Estimated prompt tokens, for the rate limiter.
    pub hits_addend: u64,
}

impl RequestBodyOutcome {
    fn new(mutation: BodyMutation, hits_addend: u64) -> Self {
        Self {
            mutation,
            hits_addend,
        }
    }
}

/// Pick the provider from the explicit header, else from the request path
/// and authority.
#[must_use]
pub fn select_provider(headers: &HeaderSnapshot) -> Provider {
    if let Some(provider) = headers.get(PROVIDER_HEADER).and_then(Provider::from_name) {
        return provider;
    }
    let path = headers.path().unwrap_or_default();
    let authority = headers
        .get(":authority")
        .or_else(|| headers.get("host"))
        .unwrap_or_default();
    if path.contains("/v1/messages") {
        Provider::Anthropic
    } else if authority.contains("aiplatform") || path.contains("aiplatform") {
        Provider::VertexAi
    } else if path.contains(":generateContent") || path.contains(":streamGenerateContent") {
        Provider::Gemini
    } else {
        Provider::OpenAi
    }
}

/// Make an OpenAI streaming request report usage in its last frame.
/// Returns whether the body was changed.
fn force_include_usage(body: &mut Value) -> bool {
    let Some(obj) = body.as_object_mut() else {
        return false;
    };
    let options = obj
        .entry("stream_options")
        .or_insert_with(|| json!({}));
    if !options.is_object() {
        *options = json!({});
    }
    if options.get("include_usage").and_then(Value::as_bool) == Some(true) {
        return false;
    }
    options["include_usage"] = Value::Bool(true);
    true
}

pub struct Session {
    state: Arc<AppState>,
    span: Span,
    started: Instant,
    provider: Provider,
    request_headers: HeaderSnapshot,
    /// Request headers overlaid with the upstream response headers; what
    /// response-phase webhooks forward from.
    response_hook_headers: HeaderSnapshot,
    guardrails: Option<Arc<GuardrailSet>>,
    request_body: BytesMut,
    response_body: BytesMut,
    request_model: Option<String>,
    response_model: Option<String>,
    is_streaming_req: bool,
    is_streaming_resp: bool,
    gzip: bool,
    injected_usage: bool,
    rate_limited_tokens: u64,
    coordinator: Option<StreamCoordinator>,
    tokens: Tokens,
    usage_recorded: bool,
}

impl Session {
    #[must_use]
    pub fn new(state: Arc<AppState>) -> Self {
        let id = state.next_session_id();
        let span = info_span!(
            "extproc",
            session = %id,
            provider = tracing::field::Empty,
            model = tracing::field::Empty
        );
        Self {
            state,
            span,
            started: Instant::now(),
            provider: Provider::OpenAi,
            request_headers: HeaderSnapshot::new(),
            response_hook_headers: HeaderSnapshot::new(),
            guardrails: None,
            request_body: BytesMut::new(),
            response_body: BytesMut::new(),
            request_model: None,
            response_model: None,
            is_streaming_req: false,
            is_streaming_resp: false,
            gzip: false,
            injected_usage: false,
            rate_limited_tokens: 0,
            coordinator: None,
            tokens: Tokens::default(),
            usage_recorded: false,
        }
    }

    #[must_use]
    pub fn provider(&self) -> Provider {
        self.provider
    }

    #[must_use]
    pub fn is_streaming_response(&self) -> bool {
        self.is_streaming_resp
    }

    /// Usage seen so far: the streamed total, or the non-streaming body's.
    #[must_use]
    pub fn tokens(&self) -> Tokens {
        self.coordinator
            .as_ref()
            .map_or(self.tokens, StreamCoordinator::tokens)
    }

    #[must_use]
    pub fn model(&self) -> Option<&str> {
        self.coordinator
            .as_ref()
            .and_then(StreamCoordinator::model)
            .or(self.response_model.as_deref())
            .or(self.request_model.as_deref())
    }

    fn record_exception(&self, stage: &'static str, err: &ExtProcError) {
        let _enter = self.span.enter();
        warn!(stage, kind = err.kind(), error = %err, "passing message through after error");
        self.state.metrics.record_exception(stage);
    }

    // -----------------------------------------------------------------------
    // Request headers
    // -----------------------------------------------------------------------

    /// # Errors
    ///
    /// Returns [`ExtProcError::Config`] if the selected policy fails to
    /// compile.
    pub fn on_request_headers(
        &mut self,
        headers: HeaderSnapshot,
    ) -> Result<RequestHeadersOutcome, ExtProcError> {
        let _enter = self.span.enter();
        self.provider = select_provider(&headers);
        self.span.record("provider", self.provider.as_str());

        let policy = match headers.get(POLICY_HEADER) {
            Some(name) if self.state.config.policies.contains_key(name) => Some(name.to_string()),
            Some(name) => {
                warn!(policy = name, "unknown guardrail policy requested; none applied");
                None
            }
            None => self
                .state
                .config
                .policies
                .contains_key(DEFAULT_POLICY)
                .then(|| DEFAULT_POLICY.to_string()),
        };
        self.guardrails = match &policy {
            Some(name) => self.state.guardrails_for(name)?,
            None => None,
        };

        let metadata = DynamicMetadata {
            auth_token: extract_auth_token(&headers).map(str::to_string),
        };
        debug!(provider = %self.provider, policy = ?policy, "request headers");
        self.request_headers = headers;
        Ok(RequestHeadersOutcome {
            provider: self.provider,
            policy,
            metadata,
        })
    }

    pub fn on_request_headers_or_passthrough(
        &mut self,
        headers: HeaderSnapshot,
    ) -> RequestHeadersOutcome {
        let provider = select_provider(&headers);
        let auth_token = extract_auth_token(&headers).map(str::to_string);
        match self.on_request_headers(headers) {
            Ok(outcome) => outcome,
            Err(e) => {
                self.record_exception("request_headers", &e);
                RequestHeadersOutcome {
                    provider,
                    policy: None,
                    metadata: DynamicMetadata { auth_token },
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Request body
    // -----------------------------------------------------------------------

    /// # Errors
    ///
    /// Returns [`ExtProcError::InvalidBody`] when the complete body is not
    /// JSON.
    pub async fn on_request_body(
        &mut self,
        chunk: &[u8],
        end_of_stream: bool,
    ) -> Result<RequestBodyOutcome, ExtProcError> {
        let span = self.span.clone();
        self.request_body_inner(chunk, end_of_stream)
            .instrument(span)
            .await
    }

    async fn request_body_inner(
        &mut self,
        chunk: &[u8],
        end_of_stream: bool,
    ) -> Result<RequestBodyOutcome, ExtProcError> {
        self.request_body.extend_from_slice(chunk);
        if !end_of_stream {
            return Ok(RequestBodyOutcome::new(BodyMutation::Buffered, 0));
        }
        let raw = self.request_body.split().freeze();
        if raw.trim_ascii().is_empty() {
            return Ok(RequestBodyOutcome::new(BodyMutation::Unchanged, 0));
        }
        let mut body: Value = serde_json::from_slice(&raw)?;

        let provider = self.provider;
        self.request_model = provider.get_model_req(&body, &self.request_headers);
        if let Some(model) = &self.request_model {
            self.span.record("model", model.as_str());
        }
        self.is_streaming_req = provider.is_streaming_req(&body, &self.request_headers);
        let tokens = provider.get_num_tokens_from_body(&body);
        self.rate_limited_tokens = tokens;

        let mut changed = false;
        if let Some(guardrails) = &self.guardrails {
            let original = body.clone();
            if let Err(response) = guardrails
                .guard_request(provider, &mut body, &self.request_headers)
                .await
            {
                debug!(status = response.status_code, "request rejected by guardrail");
                return Ok(RequestBodyOutcome::new(BodyMutation::Immediate(response), tokens));
            }
            changed = body != original;
        }

        if provider == Provider::OpenAi
            && self.is_streaming_req
            && self.state.config.features.force_stream_usage
            && force_include_usage(&mut body)
        {
            self.injected_usage = true;
            changed = true;
        }

        let mutation = if changed {
            BodyMutation::Replace(Bytes::from(serde_json::to_vec(&body)?))
        } else {
            BodyMutation::Unchanged
        };
        Ok(RequestBodyOutcome::new(mutation, tokens))
    }

    pub async fn on_request_body_or_passthrough(
        &mut self,
        chunk: &[u8],
        end_of_stream: bool,
    ) -> RequestBodyOutcome {
        match self.on_request_body(chunk, end_of_stream).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.record_exception("request_body", &e);
                RequestBodyOutcome::new(BodyMutation::Unchanged, 0)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Response headers
    // -----------------------------------------------------------------------

    pub fn on_response_headers(&mut self, headers: &HeaderSnapshot) {
        let _enter = self.span.enter();
        self.is_streaming_resp = self
            .provider
            .is_streaming_response(self.is_streaming_req, headers);
        self.gzip = encoding::is_gzip(headers);
        self.response_hook_headers = self.request_headers.overlaid_with(headers);

        if !self.is_streaming_resp {
            return;
        }
        if headers.content_type().as_deref() == Some("application/json") {
            warn!(provider = %self.provider, "JSON-array streaming is forwarded without guardrails");
            return;
        }
        let mut settings = CoordinatorSettings::from_features(&self.state.config.features);
        settings.strip_usage_frames = self.injected_usage;
        self.coordinator = Some(StreamCoordinator::new(self.provider, settings));
    }

    // -----------------------------------------------------------------------
    // Response body
    // -----------------------------------------------------------------------

    /// # Errors
    ///
    /// Returns [`ExtProcError::Decompression`] or
    /// [`ExtProcError::InvalidBody`] for a non-streaming body that cannot be
    /// read.
    pub async fn on_response_body(
        &mut self,
        chunk: &[u8],
        end_of_stream: bool,
    ) -> Result<BodyMutation, ExtProcError> {
        let span = self.span.clone();
        self.response_body_inner(chunk, end_of_stream)
            .instrument(span)
            .await
    }

    async fn response_body_inner(
        &mut self,
        chunk: &[u8],
        end_of_stream: bool,
    ) -> Result<BodyMutation, ExtProcError> {
        if self.is_streaming_resp {
            return Ok(self.stream_body(chunk, end_of_stream).await);
        }

        self.response_body.extend_from_slice(chunk);
        if !end_of_stream {
            return Ok(BodyMutation::Buffered);
        }
        let raw = self.response_body.split().freeze();
        if raw.is_empty() {
            self.record_usage();
            return Ok(BodyMutation::Unchanged);
        }
        let decoded = if self.gzip {
            encoding::decompress_gzip(&raw)?
        } else {
            raw
        };
        let mut body: Value = serde_json::from_slice(&decoded)?;
        self.tokens = self.provider.tokens(&body);
        self.response_model = self.provider.get_model_resp(&body);

        let mut changed = false;
        if let Some(guardrails) = self.guardrails.clone().filter(|g| g.guards_responses()) {
            let original = body.clone();
            if let Err(response) = guardrails
                .guard_response(self.provider, &mut body, &self.response_hook_headers)
                .await
            {
                self.record_usage();
                return Ok(BodyMutation::Immediate(response));
            }
            changed = body != original;
        }
        self.record_usage();

        if !changed {
            return Ok(BodyMutation::Unchanged);
        }
        let encoded = serde_json::to_vec(&body)?;
        let encoded = if self.gzip {
            encoding::compress_gzip(&encoded)?
        } else {
            Bytes::from(encoded)
        };
        Ok(BodyMutation::Replace(encoded))
    }

    async fn stream_body(&mut self, chunk: &[u8], end_of_stream: bool) -> BodyMutation {
        let Some(coordinator) = self.coordinator.as_mut() else {
            if end_of_stream {
                self.record_usage();
            }
            return BodyMutation::Unchanged;
        };
        let guard = self
            .guardrails
            .as_deref()
            .map(|set| (set, &self.response_hook_headers));
        let step = coordinator.on_chunk(chunk, end_of_stream, guard).await;
        match step {
            StreamStep::Emit(bytes) => {
                if end_of_stream {
                    self.record_usage();
                }
                BodyMutation::Replace(bytes)
            }
            StreamStep::Reject(response) => {
                self.record_usage();
                BodyMutation::Immediate(response)
            }
        }
    }

    pub async fn on_response_body_or_passthrough(
        &mut self,
        chunk: &[u8],
        end_of_stream: bool,
    ) -> BodyMutation {
        match self.on_response_body(chunk, end_of_stream).await {
            Ok(mutation) => mutation,
            Err(e) => {
                self.record_exception("response_body", &e);
                if end_of_stream {
                    self.record_usage();
                }
                BodyMutation::Unchanged
            }
        }
    }

    /// Report usage once per request.
    fn record_usage(&mut self) {
        if self.usage_recorded {
            return;
        }
        self.usage_recorded = true;
        let tokens = self.tokens();
        let model = self.model().unwrap_or("unknown").to_string();
        let provider = self.provider.as_str();
        self.state
            .metrics
            .record_usage(provider, &model, &tokens, self.rate_limited_tokens);
        let _enter = self.span.enter();
        log_request_complete(
            provider,
            &model,
            &tokens,
            self.rate_limited_tokens,
            self.started,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_provider() {
        let pick = |pairs: &[(&str, &str)]| select_provider(&HeaderSnapshot::from_pairs(pairs.iter().copied()));
        assert_eq!(pick(&[(":path", "/v1/chat/completions")]), Provider::OpenAi);
        assert_eq!(pick(&[(":path", "/v1/messages")]), Provider::Anthropic);
        assert_eq!(
            pick(&[(":path", "/v1beta/models/gemini-1.5-flash:streamGenerateContent?alt=sse")]),
            Provider::Gemini
        );
        assert_eq!(
            pick(&[
                (":authority", "us-central1-aiplatform.googleapis.com"),
                (":path", "/v1/projects/p/locations/l/publishers/google/models/gemini-pro:generateContent"),
            ]),
            Provider::VertexAi
        );
        assert_eq!(
            pick(&[(PROVIDER_HEADER, "Anthropic"), (":path", "/v1/chat/completions")]),
            Provider::Anthropic
        );
    }

    #[test]
    fn test_force_include_usage() {
        let mut body = json!({"stream": true});
        assert!(force_include_usage(&mut body));
        assert_eq!(body["stream_options"]["include_usage"], true);
        assert!(!force_include_usage(&mut body));

        let mut body = json!({"stream": true, "stream_options": {"include_usage": false}});
        assert!(force_include_usage(&mut body));
        assert_eq!(body["stream_options"]["include_usage"], true);
    }
}
