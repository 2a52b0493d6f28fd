use std::sync::LazyLock;
use std::time::Duration;

use tiktoken_rs::CoreBPE;
use tracing::{info, warn};

use crate::provider::Tokens;

/// Overhead added for every chat message.
pub const TOKENS_PER_MESSAGE: u64 = 3;
/// Overhead added for every `name` field on a message.
pub const TOKENS_PER_NAME: u64 = 1;
/// Every reply is primed with `<|start|>assistant<|message|>`.
pub const REPLY_PRIMING_TOKENS: u64 = 3;

static CL100K: LazyLock<Option<CoreBPE>> = LazyLock::new(|| match tiktoken_rs::cl100k_base() {
    Ok(bpe) => Some(bpe),
    Err(e) => {
        warn!(error = %e, "cl100k_base unavailable, falling back to byte estimate");
        None
    }
});

/// Number of `cl100k_base` tokens in `text`.
///
/// Falls back to `bytes / 4` if the BPE table could not be built.
#[must_use]
pub fn count_text_tokens(text: &str) -> u64 {
    if text.is_empty() {
        return 0;
    }
    match CL100K.as_ref() {
        Some(bpe) => bpe.encode_ordinary(text).len() as u64,
        None => (text.len() as u64).div_ceil(4),
    }
}

/// Log token usage for a completed request at INFO level.
pub fn log_request_usage(
    provider: &str,
    model: &str,
    usage: &Tokens,
    rate_limited_tokens: u64,
    duration: Duration,
) {
    info!(
        provider = provider,
        model = model,
        prompt_tokens = usage.prompt,
        completion_tokens = usage.completion,
        total_tokens = usage.total(),
        rate_limited_tokens = rate_limited_tokens,
        duration_seconds = duration.as_secs_f64(),
        "request completed"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_text_tokens_nonempty() {
        assert_eq!(count_text_tokens("hello world"), 2);
        assert!(count_text_tokens("Once upon a time, in a quiet village") > 5);
    }

    #[test]
    fn test_count_text_tokens_empty() {
        assert_eq!(count_text_tokens(""), 0);
    }

    #[test]
    fn test_multibyte_text_counts() {
        assert!(count_text_tokens("🖱 click") >= 2);
    }
}
