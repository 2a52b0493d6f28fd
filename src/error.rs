use serde::Serialize;

use crate::config::ConfigError;
use crate::provider::ProviderError;

/// Error type shared by the session, guardrail and stream layers.
#[derive(Debug, thiserror::Error)]
pub enum ExtProcError {
    #[error("Config error: {0}")]
    Config(#[from] ConfigError),
    #[error("Invalid body: {0}")]
    InvalidBody(String),
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),
    #[error("Webhook error: {0}")]
    Webhook(String),
    #[error("Moderation error: {0}")]
    Moderation(String),
    #[error("Decompression error: {0}")]
    Decompression(String),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ExtProcError {
    /// Short label used for the `exception_raised` counter.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ExtProcError::Config(_) => "config",
            ExtProcError::InvalidBody(_) => "invalid_body",
            ExtProcError::Provider(_) => "provider",
            ExtProcError::Webhook(_) => "webhook",
            ExtProcError::Moderation(_) => "moderation",
            ExtProcError::Decompression(_) => "decompression",
            ExtProcError::Internal(_) => "internal",
        }
    }
}

impl From<serde_json::Error> for ExtProcError {
    fn from(e: serde_json::Error) -> Self {
        ExtProcError::InvalidBody(e.to_string())
    }
}

impl From<reqwest::Error> for ExtProcError {
    fn from(e: reqwest::Error) -> Self {
        ExtProcError::Webhook(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Immediate responses
// ---------------------------------------------------------------------------

/// A response the gateway sends to the client in place of the upstream one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImmediateResponse {
    pub status_code: u16,
    pub body: String,
    pub details: String,
}

impl ImmediateResponse {
    #[must_use]
    pub fn new(status_code: u16, body: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            status_code,
            body: body.into(),
            details: details.into(),
        }
    }

    /// Plain 500 used when a response that already started must be cut off.
    #[must_use]
    pub fn internal(details: impl Into<String>) -> Self {
        Self::new(500, "Internal Server Error", details)
    }

    #[must_use]
    pub fn with_status(mut self, status_code: u16) -> Self {
        self.status_code = status_code;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_labels() {
        assert_eq!(ExtProcError::Webhook("timeout".into()).kind(), "webhook");
        assert_eq!(
            ExtProcError::from(ProviderError::MissingField("messages")).kind(),
            "provider"
        );
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert_eq!(ExtProcError::from(json_err).kind(), "invalid_body");
    }

    #[test]
    fn test_display() {
        let err = ExtProcError::Provider(ProviderError::LengthMismatch { expected: 2, got: 1 });
        assert_eq!(
            err.to_string(),
            "Provider error: webhook returned 1 entries, body has 2"
        );
    }

    #[test]
    fn test_immediate_response_helpers() {
        let r = ImmediateResponse::internal("webhook failed").with_status(503);
        assert_eq!(r.status_code, 503);
        assert_eq!(r.details, "webhook failed");
    }
}
