pub mod metrics;
pub mod token_counter;

use std::time::Instant;

use tracing_subscriber::EnvFilter;

use crate::config::{FeaturesConfig, LogFormat};
use crate::provider::Tokens;

/// Config log level to an `EnvFilter` directive; `None` disables logging.
///
/// WARNING maps to WARN and CRITICAL to ERROR; DEBUG, INFO and ERROR pass
/// through.
fn filter_directive(log_level: &str) -> Option<String> {
    let level = log_level.trim().to_uppercase();
    match level.as_str() {
        "DISABLED" => None,
        "WARNING" => Some("WARN".to_string()),
        "CRITICAL" => Some("ERROR".to_string()),
        _ => Some(level),
    }
}

/// Install the global subscriber. A second call is a no-op.
pub fn init_tracing(features: &FeaturesConfig) {
    let Some(directive) = filter_directive(&features.log_level) else {
        return;
    };
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("INFO"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    let _ = match features.log_format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().flatten_event(true).try_init(),
    };
}

/// Emit the per-request usage line.
pub fn log_request_complete(
    provider: &str,
    model: &str,
    usage: &Tokens,
    rate_limited_tokens: u64,
    started: Instant,
) {
    token_counter::log_request_usage(provider, model, usage, rate_limited_tokens, started.elapsed());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_directive() {
        assert_eq!(filter_directive("warning").as_deref(), Some("WARN"));
        assert_eq!(filter_directive("CRITICAL").as_deref(), Some("ERROR"));
        assert_eq!(filter_directive(" debug ").as_deref(), Some("DEBUG"));
        assert_eq!(filter_directive("DISABLED"), None);
    }
}
