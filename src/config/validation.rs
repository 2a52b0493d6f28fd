use std::collections::HashSet;
use std::net::SocketAddr;

use super::{AppConfig, ConfigError, GuardrailPolicyConfig, HeaderMatchConfig, WebhookConfig};

/// Validate the full application config, returning an error if any rule is violated.
///
/// # Errors
///
/// Returns [`ConfigError::Validation`] when any configuration invariant is violated.
pub fn validate_config(config: &AppConfig) -> Result<(), ConfigError> {
    validate_server_config(config)?;
    validate_features(config)?;
    validate_log_level(config)?;
    for (name, policy) in &config.policies {
        validate_policy(name, policy)?;
    }
    Ok(())
}

fn validation_err(msg: impl Into<String>) -> ConfigError {
    ConfigError::Validation(msg.into())
}

fn validate_server_config(config: &AppConfig) -> Result<(), ConfigError> {
    let server = &config.server;
    server.listen_addr()?;
    if server.metrics_addr.parse::<SocketAddr>().is_err() {
        return Err(validation_err(format!(
            "server.metrics_addr '{}' is not a socket address",
            server.metrics_addr
        )));
    }
    if server.webhook_timeout_ms == 0 {
        return Err(validation_err(
            "server.webhook_timeout_ms must be greater than 0",
        ));
    }
    if server.moderation_timeout_ms == 0 {
        return Err(validation_err(
            "server.moderation_timeout_ms must be greater than 0",
        ));
    }
    Ok(())
}

fn validate_features(config: &AppConfig) -> Result<(), ConfigError> {
    let features = &config.features;
    if features.min_guardrail_chars == 0 {
        return Err(validation_err(
            "features.min_guardrail_chars must be greater than 0",
        ));
    }
    if features.max_metric_series == 0 {
        return Err(validation_err(
            "features.max_metric_series must be greater than 0",
        ));
    }
    if features.max_buffered_bytes == 0 {
        return Err(validation_err(
            "features.max_buffered_bytes must be greater than 0",
        ));
    }
    Ok(())
}

fn validate_log_level(config: &AppConfig) -> Result<(), ConfigError> {
    let valid_levels = ["DEBUG", "INFO", "WARNING", "ERROR", "CRITICAL", "DISABLED"];
    if !valid_levels.contains(&config.features.log_level.to_uppercase().as_str()) {
        return Err(validation_err(format!(
            "log_level must be one of {valid_levels:?}"
        )));
    }
    Ok(())
}

fn validate_policy(name: &str, policy: &GuardrailPolicyConfig) -> Result<(), ConfigError> {
    if name.trim().is_empty() {
        return Err(validation_err("policy name cannot be empty"));
    }

    let mut seen = HashSet::new();
    for recognizer in &policy.recognizers {
        if recognizer.name.trim().is_empty() {
            return Err(validation_err(format!(
                "Policy '{name}': recognizer name cannot be empty"
            )));
        }
        if !seen.insert(recognizer.name.as_str()) {
            return Err(validation_err(format!(
                "Policy '{name}': duplicate recognizer '{}'",
                recognizer.name
            )));
        }
        regex_lite::Regex::new(&recognizer.pattern).map_err(|err| {
            validation_err(format!(
                "Policy '{name}': recognizer '{}' has an invalid pattern: {err}",
                recognizer.name
            ))
        })?;
        if let Some(score) = recognizer.score {
            if !(0.0..=1.0).contains(&score) {
                return Err(validation_err(format!(
                    "Policy '{name}': recognizer '{}' score must be within 0..=1",
                    recognizer.name
                )));
            }
        }
    }

    if !(0.0..=1.0).contains(&policy.score_threshold) {
        return Err(validation_err(format!(
            "Policy '{name}': score_threshold must be within 0..=1"
        )));
    }

    for hook in policy
        .request_webhooks
        .iter()
        .chain(&policy.response_webhooks)
    {
        validate_webhook(name, hook)?;
    }

    if let Some(moderation) = &policy.moderation {
        validate_http_url(name, "moderation.url", &moderation.url)?;
        if moderation.model.trim().is_empty() {
            return Err(validation_err(format!(
                "Policy '{name}': moderation.model cannot be empty"
            )));
        }
    }

    let status = policy.custom_response.status_code;
    if !(100..=599).contains(&status) {
        return Err(validation_err(format!(
            "Policy '{name}': custom_response.status_code {status} is not an HTTP status"
        )));
    }
    Ok(())
}

fn validate_webhook(policy: &str, hook: &WebhookConfig) -> Result<(), ConfigError> {
    validate_http_url(policy, "webhook url", &hook.url)?;
    for rule in &hook.forward_headers {
        match rule {
            HeaderMatchConfig::Exact(header) if header.trim().is_empty() => {
                return Err(validation_err(format!(
                    "Policy '{policy}': forward_headers contains an empty header name"
                )));
            }
            HeaderMatchConfig::Regex(pattern) => {
                regex_lite::Regex::new(pattern).map_err(|err| {
                    validation_err(format!(
                        "Policy '{policy}': forward_headers regex '{pattern}' is invalid: {err}"
                    ))
                })?;
            }
            HeaderMatchConfig::Exact(_) => {}
        }
    }
    Ok(())
}

fn validate_http_url(policy: &str, field: &str, url: &str) -> Result<(), ConfigError> {
    if !url.starts_with("http://") && !url.starts_with("https://") {
        return Err(validation_err(format!(
            "Policy '{policy}': {field} must start with http:// or https://"
        )));
    }
    Ok(())
}
