//! Remote guardrail webhooks.
//!
//! A webhook receives the provider-neutral view of a body and answers with
//! one of: a mutated copy of the same shape, a `RejectAction`, or nothing
//! (empty body or 204) to leave the body as it is.

use std::time::Duration;

use regex_lite::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{HeaderMatchConfig, WebhookConfig};
use crate::error::{ExtProcError, ImmediateResponse};
use crate::headers::HeaderSnapshot;
use crate::provider::{PromptMessages, ResponseChoices};

/// Rejection returned by a webhook; forwarded to the client as is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectAction {
    pub status_code: u16,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub reason: String,
}

impl From<RejectAction> for ImmediateResponse {
    fn from(action: RejectAction) -> Self {
        ImmediateResponse::new(action.status_code, action.body, action.reason)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookReply<T> {
    Unchanged,
    Replace(T),
    Reject(RejectAction),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum WireReply<T> {
    Reject(RejectAction),
    Replace(T),
}

enum HeaderMatcher {
    Exact(String),
    Regex(Regex),
}

impl HeaderMatcher {
    fn matches(&self, name: &str) -> bool {
        match self {
            HeaderMatcher::Exact(exact) => exact.eq_ignore_ascii_case(name),
            HeaderMatcher::Regex(re) => re.is_match(name),
        }
    }
}

pub struct WebhookClient {
    url: String,
    headers: Vec<(String, String)>,
    forward: Vec<HeaderMatcher>,
    client: reqwest::Client,
    timeout: Duration,
}

impl WebhookClient {
    /// # Errors
    ///
    /// Returns the first forward-header regex that fails to compile.
    pub fn new(
        config: &WebhookConfig,
        client: reqwest::Client,
        timeout: Duration,
    ) -> Result<Self, regex_lite::Error> {
        let forward = config
            .forward_headers
            .iter()
            .map(|rule| match rule {
                HeaderMatchConfig::Exact(name) => Ok(HeaderMatcher::Exact(name.to_ascii_lowercase())),
                HeaderMatchConfig::Regex(pattern) => Regex::new(pattern).map(HeaderMatcher::Regex),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            url: config.url.clone(),
            headers: config
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            forward,
            client,
            timeout,
        })
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Client headers selected by the forward rules. Pseudo-headers never
    /// leave the sidecar.
    pub fn forwarded_headers<'a>(
        &'a self,
        snapshot: &'a HeaderSnapshot,
    ) -> impl Iterator<Item = (&'a str, &'a str)> + 'a {
        snapshot
            .iter()
            .filter(|(name, _)| !name.starts_with(':'))
            .filter(|(name, _)| self.forward.iter().any(|m| m.matches(name)))
    }

    /// # Errors
    ///
    /// Returns [`ExtProcError::Webhook`] on transport failure, a non-2xx
    /// status, or an undecodable reply.
    pub async fn check_prompt(
        &self,
        payload: &PromptMessages,
        headers: &HeaderSnapshot,
    ) -> Result<WebhookReply<PromptMessages>, ExtProcError> {
        self.post(payload, headers).await
    }

    /// # Errors
    ///
    /// Same as [`Self::check_prompt`].
    pub async fn check_response(
        &self,
        payload: &ResponseChoices,
        headers: &HeaderSnapshot,
    ) -> Result<WebhookReply<ResponseChoices>, ExtProcError> {
        self.post(payload, headers).await
    }

    async fn post<B, T>(&self, payload: &B, headers: &HeaderSnapshot) -> Result<WebhookReply<T>, ExtProcError>
    where
        B: Serialize,
        T: DeserializeOwned,
    {
        let mut req = self.client.post(&self.url).timeout(self.timeout).json(payload);
        for (name, value) in &self.headers {
            req = req.header(name.as_str(), value.as_str());
        }
        for (name, value) in self.forwarded_headers(headers) {
            req = req.header(name, value);
        }

        let resp = req.send().await?;
        let status = resp.status();
        if status == reqwest::StatusCode::NO_CONTENT {
            return Ok(WebhookReply::Unchanged);
        }
        if !status.is_success() {
            return Err(ExtProcError::Webhook(format!(
                "{} returned {status}",
                self.url
            )));
        }
        let bytes = resp.bytes().await?;
        if bytes.trim_ascii().is_empty() {
            return Ok(WebhookReply::Unchanged);
        }
        let reply = serde_json::from_slice::<WireReply<T>>(&bytes).map_err(|e| {
            ExtProcError::Webhook(format!("{} sent an undecodable reply: {e}", self.url))
        })?;
        debug!(url = %self.url, "webhook replied");
        Ok(match reply {
            WireReply::Reject(action) => WebhookReply::Reject(action),
            WireReply::Replace(body) => WebhookReply::Replace(body),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::PromptMessage;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(url: String, forward: Vec<HeaderMatchConfig>) -> WebhookClient {
        let config = WebhookConfig {
            url,
            headers: [("x-guard-key".to_string(), "k1".to_string())].into(),
            forward_headers: forward,
        };
        WebhookClient::new(&config, reqwest::Client::new(), Duration::from_secs(2)).unwrap()
    }

    fn prompt() -> PromptMessages {
        PromptMessages {
            messages: vec![PromptMessage::new("user", "call me at 555-0100")],
        }
    }

    #[test]
    fn test_forward_header_rules() {
        let hook = client_for(
            "http://guard.local".to_string(),
            vec![
                HeaderMatchConfig::Exact("X-User-Id".to_string()),
                HeaderMatchConfig::Regex("^x-tenant-".to_string()),
            ],
        );
        let snapshot = HeaderSnapshot::from_pairs([
            (":path", "/v1/chat/completions"),
            ("x-user-id", "u1"),
            ("x-tenant-name", "acme"),
            ("authorization", "Bearer sk"),
        ]);
        let forwarded: Vec<_> = hook.forwarded_headers(&snapshot).collect();
        assert_eq!(forwarded, vec![("x-user-id", "u1"), ("x-tenant-name", "acme")]);
    }

    #[tokio::test]
    async fn test_replace_reply() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/check"))
            .and(header("x-guard-key", "k1"))
            .and(header("x-user-id", "u1"))
            .and(body_json(prompt()))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "messages": [{"role": "user", "content": "call me at <PHONE>"}]
            })))
            .mount(&server)
            .await;

        let hook = client_for(
            format!("{}/check", server.uri()),
            vec![HeaderMatchConfig::Exact("x-user-id".to_string())],
        );
        let headers = HeaderSnapshot::from_pairs([("x-user-id", "u1")]);
        let reply = hook.check_prompt(&prompt(), &headers).await.unwrap();
        assert_eq!(
            reply,
            WebhookReply::Replace(PromptMessages {
                messages: vec![PromptMessage::new("user", "call me at <PHONE>")],
            })
        );
    }

    #[tokio::test]
    async fn test_reject_reply() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status_code": 403,
                "body": "denied",
                "reason": "phone number"
            })))
            .mount(&server)
            .await;

        let hook = client_for(server.uri(), vec![]);
        let reply = hook
            .check_prompt(&prompt(), &HeaderSnapshot::new())
            .await
            .unwrap();
        let WebhookReply::Reject(action) = reply else {
            panic!("expected reject, got {reply:?}");
        };
        let response = ImmediateResponse::from(action);
        assert_eq!(response.status_code, 403);
        assert_eq!(response.body, "denied");
        assert_eq!(response.details, "phone number");
    }

    #[tokio::test]
    async fn test_empty_and_no_content_are_unchanged() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/empty"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/none"))
            .respond_with(ResponseTemplate::new(204))
            .mount(&server)
            .await;

        for route in ["/empty", "/none"] {
            let hook = client_for(format!("{}{route}", server.uri()), vec![]);
            let reply = hook
                .check_prompt(&prompt(), &HeaderSnapshot::new())
                .await
                .unwrap();
            assert_eq!(reply, WebhookReply::Unchanged);
        }
    }

    #[tokio::test]
    async fn test_server_error_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&server)
            .await;
        let hook = client_for(server.uri(), vec![]);
        let err = hook
            .check_prompt(&prompt(), &HeaderSnapshot::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "webhook");
    }
}
