//! Guardrails applied to prompts and completions.
//!
//! A [`GuardrailSet`] is compiled once per policy and shared through the
//! [`GuardrailCache`]. Request bodies go through webhooks, then regex
//! recognizers, then moderation. Completed response bodies go through
//! webhooks, then regex. Streamed text goes through regex, then webhooks.

pub mod cache;
pub mod moderation;
pub mod recognizer;
pub mod webhook;

use serde_json::Value;
use tracing::{error, warn};

pub use cache::GuardrailCache;
pub use moderation::{ModerationClient, ModerationVerdict};
pub use recognizer::RegexGuard;
pub use webhook::{RejectAction, WebhookClient, WebhookReply};

use crate::config::{ConfigError, CustomResponseConfig, GuardrailPolicyConfig, ServerConfig};
use crate::error::ImmediateResponse;
use crate::headers::HeaderSnapshot;
use crate::provider::{Provider, ResponseChoice, ResponseChoices};

/// Outcome of a text-level guardrail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardVerdict<T> {
    Allow(T),
    Reject { reason: String },
}

pub struct GuardrailSet {
    regex: RegexGuard,
    request_webhooks: Vec<WebhookClient>,
    response_webhooks: Vec<WebhookClient>,
    moderation: Option<ModerationClient>,
    custom_response: CustomResponseConfig,
}

impl GuardrailSet {
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] if a pattern does not compile.
    pub fn from_policy(
        policy: &GuardrailPolicyConfig,
        client: reqwest::Client,
        server: &ServerConfig,
    ) -> Result<Self, ConfigError> {
        let regex = RegexGuard::with_threshold(&policy.recognizers, policy.score_threshold)
            .map_err(|e| ConfigError::Validation(format!("recognizer pattern: {e}")))?;
        let hooks = |configs: &[crate::config::WebhookConfig]| {
            configs
                .iter()
                .map(|c| WebhookClient::new(c, client.clone(), server.webhook_timeout()))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| ConfigError::Validation(format!("forward_headers pattern: {e}")))
        };
        let request_webhooks = hooks(&policy.request_webhooks)?;
        let response_webhooks = hooks(&policy.response_webhooks)?;
        let moderation = policy
            .moderation
            .as_ref()
            .map(|m| ModerationClient::new(m, client.clone(), server.moderation_timeout()));
        Ok(Self {
            regex,
            request_webhooks,
            response_webhooks,
            moderation,
            custom_response: policy.custom_response.clone(),
        })
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.regex.is_empty()
            && self.request_webhooks.is_empty()
            && self.response_webhooks.is_empty()
            && self.moderation.is_none()
    }

    /// Whether anything inspects completions.
    #[must_use]
    pub fn guards_responses(&self) -> bool {
        !self.regex.is_empty() || !self.response_webhooks.is_empty()
    }

    #[must_use]
    pub fn regex(&self) -> &RegexGuard {
        &self.regex
    }

    /// The configured rejection for `reason`.
    #[must_use]
    pub fn reject_response(&self, reason: &str) -> ImmediateResponse {
        ImmediateResponse::new(
            self.custom_response.status_code,
            self.custom_response.render(reason),
            reason,
        )
    }

    // -----------------------------------------------------------------------
    // Request path
    // -----------------------------------------------------------------------

    /// Guard a parsed request body in place.
    ///
    /// # Errors
    ///
    /// Returns the response to send instead of forwarding the request.
    pub async fn guard_request(
        &self,
        provider: Provider,
        body: &mut Value,
        headers: &HeaderSnapshot,
    ) -> Result<(), ImmediateResponse> {
        for hook in &self.request_webhooks {
            let payload = provider.construct_request_webhook_request_body(body);
            match hook.check_prompt(&payload, headers).await {
                Ok(WebhookReply::Unchanged) => {}
                Ok(WebhookReply::Replace(modified)) => {
                    if let Err(e) = provider.update_request_body_from_webhook(body, &modified) {
                        error!(error = %e, url = hook.url(), "request webhook reply ignored");
                    }
                }
                Ok(WebhookReply::Reject(action)) => return Err(action.into()),
                Err(e) => {
                    warn!(error = %e, url = hook.url(), "request webhook failed");
                    return Err(self.reject_response("guardrail webhook unavailable"));
                }
            }
        }

        if !self.regex.is_empty() {
            provider
                .iterate_str_req_messages(body, |role, text| match self.regex.apply(role, text) {
                    GuardVerdict::Allow(masked) => Ok(masked),
                    GuardVerdict::Reject { reason } => Err(reason),
                })
                .map_err(|reason| self.reject_response(&reason))?;
        }

        if let Some(moderation) = &self.moderation {
            let verdict = moderation.check(&provider.all_req_content(body)).await;
            if verdict.flagged {
                return Err(self.reject_response(&verdict.reason()));
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Response path
    // -----------------------------------------------------------------------

    /// Guard a complete, non-streamed response body in place.
    ///
    /// # Errors
    ///
    /// Returns the response to send instead of the upstream one. A webhook
    /// transport failure maps to a 500.
    pub async fn guard_response(
        &self,
        provider: Provider,
        body: &mut Value,
        headers: &HeaderSnapshot,
    ) -> Result<(), ImmediateResponse> {
        for hook in &self.response_webhooks {
            let payload = provider.construct_response_webhook_request_body(body);
            match hook.check_response(&payload, headers).await {
                Ok(WebhookReply::Unchanged) => {}
                Ok(WebhookReply::Replace(modified)) => {
                    if let Err(e) = provider.update_response_body_from_webhook(body, &modified) {
                        error!(error = %e, url = hook.url(), "response webhook reply ignored");
                    }
                }
                Ok(WebhookReply::Reject(action)) => return Err(action.into()),
                Err(e) => {
                    error!(error = %e, url = hook.url(), "response webhook failed");
                    return Err(ImmediateResponse::internal(e.to_string()));
                }
            }
        }

        if !self.regex.is_empty() {
            provider
                .iterate_str_resp_messages(body, |role, text| match self.regex.apply(role, text) {
                    GuardVerdict::Allow(masked) => Ok(masked),
                    GuardVerdict::Reject { reason } => Err(reason),
                })
                .map_err(|reason| self.reject_response(&reason))?;
        }
        Ok(())
    }

    /// Guard one aligned segment of streamed text per choice.
    ///
    /// # Errors
    ///
    /// Returns the response that ends the stream.
    pub async fn guard_stream_texts(
        &self,
        roles: &[String],
        texts: Vec<String>,
        headers: &HeaderSnapshot,
    ) -> Result<Vec<String>, ImmediateResponse> {
        let role_of = |k: usize| roles.get(k).map_or("assistant", String::as_str);

        let mut texts = if self.regex.is_empty() {
            texts
        } else {
            let mut masked = Vec::with_capacity(texts.len());
            for (k, text) in texts.iter().enumerate() {
                match self.regex.apply(role_of(k), text) {
                    GuardVerdict::Allow(t) => masked.push(t),
                    GuardVerdict::Reject { reason } => return Err(self.reject_response(&reason)),
                }
            }
            masked
        };

        for hook in &self.response_webhooks {
            let payload = ResponseChoices {
                choices: texts
                    .iter()
                    .enumerate()
                    .map(|(k, t)| ResponseChoice::new(role_of(k), t.as_str()))
                    .collect(),
            };
            match hook.check_response(&payload, headers).await {
                Ok(WebhookReply::Unchanged) => {}
                Ok(WebhookReply::Replace(modified)) => {
                    if modified.choices.len() == texts.len() {
                        texts = modified.choices.into_iter().map(|c| c.message.content).collect();
                    } else {
                        error!(
                            expected = texts.len(),
                            got = modified.choices.len(),
                            url = hook.url(),
                            "stream webhook reply ignored"
                        );
                    }
                }
                Ok(WebhookReply::Reject(action)) => return Err(action.into()),
                Err(e) => {
                    error!(error = %e, url = hook.url(), "stream webhook failed");
                    return Err(ImmediateResponse::internal(e.to_string()));
                }
            }
        }
        Ok(texts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RecognizerAction, RecognizerConfig};
    use serde_json::json;

    fn set_with(recognizers: Vec<RecognizerConfig>) -> GuardrailSet {
        let policy = GuardrailPolicyConfig {
            recognizers,
            custom_response: CustomResponseConfig {
                status_code: 200,
                body: "blocked: {reason}".to_string(),
            },
            ..Default::default()
        };
        GuardrailSet::from_policy(&policy, reqwest::Client::new(), &ServerConfig::default())
            .unwrap()
    }

    fn recognizer(name: &str, pattern: &str, action: RecognizerAction) -> RecognizerConfig {
        RecognizerConfig {
            name: name.to_string(),
            pattern: pattern.to_string(),
            action,
            replacement: None,
            score: None,
            roles: vec![],
        }
    }

    #[tokio::test]
    async fn test_request_mask_in_place() {
        let set = set_with(vec![recognizer("CAT", "Whiskers", RecognizerAction::Mask)]);
        let mut body = json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "Tell me about Whiskers"}]
        });
        set.guard_request(Provider::OpenAi, &mut body, &HeaderSnapshot::new())
            .await
            .unwrap();
        assert_eq!(body["messages"][0]["content"], "Tell me about <CAT>");
    }

    #[tokio::test]
    async fn test_request_reject_uses_custom_response() {
        let set = set_with(vec![recognizer("SECRET", "password", RecognizerAction::Reject)]);
        let mut body = json!({"messages": [{"role": "user", "content": "my password is hunter2"}]});
        let rejected = set
            .guard_request(Provider::OpenAi, &mut body, &HeaderSnapshot::new())
            .await
            .unwrap_err();
        assert_eq!(rejected.status_code, 200);
        assert_eq!(rejected.body, "blocked: SECRET detected");
    }

    #[tokio::test]
    async fn test_stream_texts_masked_per_choice() {
        let set = set_with(vec![recognizer("CAT", "Whiskers", RecognizerAction::Mask)]);
        let out = set
            .guard_stream_texts(
                &["assistant".to_string(), "assistant".to_string()],
                vec!["a cat named Whiskers. ".to_string(), "no cats. ".to_string()],
                &HeaderSnapshot::new(),
            )
            .await
            .unwrap();
        assert_eq!(out, vec!["a cat named <CAT>. ", "no cats. "]);
    }

    #[test]
    fn test_empty_policy() {
        let set = set_with(vec![]);
        assert!(set.is_empty());
        assert!(!set.guards_responses());
    }
}
