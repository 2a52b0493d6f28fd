use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::config::ModerationConfig;
use crate::error::ExtProcError;

#[derive(Serialize)]
struct ModerationRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Deserialize)]
struct ModerationResponse {
    #[serde(default)]
    results: Vec<ModerationResult>,
}

#[derive(Deserialize)]
struct ModerationResult {
    #[serde(default)]
    flagged: bool,
    #[serde(default)]
    categories: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModerationVerdict {
    pub flagged: bool,
    pub categories: Vec<String>,
}

impl ModerationVerdict {
    /// Human-readable reason for a flagged verdict.
    #[must_use]
    pub fn reason(&self) -> String {
        if self.categories.is_empty() {
            "flagged by moderation".to_string()
        } else {
            format!("flagged by moderation: {}", self.categories.join(", "))
        }
    }
}

/// OpenAI-style moderation endpoint client.
pub struct ModerationClient {
    url: String,
    model: String,
    api_key: Option<String>,
    client: reqwest::Client,
    timeout: Duration,
}

impl ModerationClient {
    #[must_use]
    pub fn new(config: &ModerationConfig, client: reqwest::Client, timeout: Duration) -> Self {
        Self {
            url: config.url.clone(),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
            client,
            timeout,
        }
    }

    /// Moderate `input`. Transport and decode failures count as not flagged.
    pub async fn check(&self, input: &str) -> ModerationVerdict {
        if input.trim().is_empty() {
            return ModerationVerdict::default();
        }
        match self.try_check(input).await {
            Ok(verdict) => verdict,
            Err(e) => {
                warn!(error = %e, url = %self.url, "moderation call failed, treating as not flagged");
                ModerationVerdict::default()
            }
        }
    }

    async fn try_check(&self, input: &str) -> Result<ModerationVerdict, ExtProcError> {
        let mut req = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .json(&ModerationRequest {
                model: &self.model,
                input,
            });
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req
            .send()
            .await
            .map_err(|e| ExtProcError::Moderation(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(ExtProcError::Moderation(format!(
                "{} returned {}",
                self.url,
                resp.status()
            )));
        }
        let body: ModerationResponse = resp
            .json()
            .await
            .map_err(|e| ExtProcError::Moderation(e.to_string()))?;

        let mut verdict = ModerationVerdict::default();
        for result in body.results.into_iter().filter(|r| r.flagged) {
            verdict.flagged = true;
            for (category, hit) in result.categories {
                if hit.as_bool() == Some(true) && !verdict.categories.contains(&category) {
                    verdict.categories.push(category);
                }
            }
        }
        Ok(verdict)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(url: String) -> ModerationClient {
        let config = ModerationConfig {
            url,
            model: "omni-moderation-latest".to_string(),
            api_key: Some("sk-mod".to_string()),
        };
        ModerationClient::new(&config, reqwest::Client::new(), Duration::from_secs(2))
    }

    #[tokio::test]
    async fn test_flagged_categories() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("authorization", "Bearer sk-mod"))
            .and(body_partial_json(serde_json::json!({"model": "omni-moderation-latest"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "id": "modr-1",
                "results": [{
                    "flagged": true,
                    "categories": {"violence": true, "harassment": false}
                }]
            })))
            .mount(&server)
            .await;

        let verdict = client_for(server.uri()).check("something violent").await;
        assert!(verdict.flagged);
        assert_eq!(verdict.categories, vec!["violence".to_string()]);
        assert_eq!(verdict.reason(), "flagged by moderation: violence");
    }

    #[tokio::test]
    async fn test_errors_are_not_flagged() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;
        let verdict = client_for(server.uri()).check("anything").await;
        assert!(!verdict.flagged);
    }

    #[tokio::test]
    async fn test_empty_input_skips_call() {
        let verdict = client_for("http://127.0.0.1:9/unreachable".to_string())
            .check("   ")
            .await;
        assert_eq!(verdict, ModerationVerdict::default());
    }
}
