use regex_lite::{NoExpand, Regex};
use tracing::debug;

use super::GuardVerdict;
use crate::config::{RecognizerAction, RecognizerConfig};

const DEFAULT_SCORE: f64 = 1.0;

struct Recognizer {
    name: String,
    regex: Regex,
    action: RecognizerAction,
    replacement: String,
    roles: Vec<String>,
}

impl Recognizer {
    fn applies_to(&self, role: &str) -> bool {
        self.roles.is_empty() || self.roles.iter().any(|r| r.eq_ignore_ascii_case(role))
    }
}

/// Compiled regex recognizers of one policy.
#[derive(Default)]
pub struct RegexGuard {
    recognizers: Vec<Recognizer>,
}

impl RegexGuard {
    /// # Errors
    ///
    /// Returns the first pattern that fails to compile.
    pub fn new(configs: &[RecognizerConfig]) -> Result<Self, regex_lite::Error> {
        Self::with_threshold(configs, 0.0)
    }

    /// Compile the recognizers whose score reaches `threshold`.
    ///
    /// # Errors
    ///
    /// Returns the first pattern that fails to compile.
    pub fn with_threshold(
        configs: &[RecognizerConfig],
        threshold: f64,
    ) -> Result<Self, regex_lite::Error> {
        let recognizers = configs
            .iter()
            .filter(|c| {
                let score = c.score.unwrap_or(DEFAULT_SCORE);
                if score < threshold {
                    debug!(recognizer = %c.name, score, threshold, "recognizer below score threshold");
                    return false;
                }
                true
            })
            .map(|c| {
                Ok(Recognizer {
                    name: c.name.clone(),
                    regex: Regex::new(&c.pattern)?,
                    action: c.action,
                    replacement: c
                        .replacement
                        .clone()
                        .unwrap_or_else(|| format!("<{}>", c.name)),
                    roles: c.roles.clone(),
                })
            })
            .collect::<Result<Vec<_>, regex_lite::Error>>()?;
        Ok(Self { recognizers })
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.recognizers.is_empty()
    }

    /// Reject on the first matching reject recognizer, otherwise mask every
    /// match of the mask recognizers in order.
    #[must_use]
    pub fn apply(&self, role: &str, text: &str) -> GuardVerdict<String> {
        let active = || self.recognizers.iter().filter(|r| r.applies_to(role));

        if let Some(hit) = active()
            .filter(|r| r.action == RecognizerAction::Reject)
            .find(|r| r.regex.is_match(text))
        {
            return GuardVerdict::Reject {
                reason: format!("{} detected", hit.name),
            };
        }

        let mut out = text.to_string();
        for r in active().filter(|r| r.action == RecognizerAction::Mask) {
            let masked = r.regex.replace_all(&out, NoExpand(&r.replacement));
            if let std::borrow::Cow::Owned(masked) = masked {
                out = masked;
            }
        }
        GuardVerdict::Allow(out)
    }
}
