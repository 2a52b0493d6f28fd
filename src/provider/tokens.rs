use std::iter::Sum;
use std::ops::{Add, AddAssign};

use serde::Serialize;

/// Per-modality and per-feature token breakdown.
///
/// Modality counters (`text` .. `document`) come from Gemini's
/// `*TokensDetails` lists and OpenAI's `text_tokens`/`audio_tokens`; the
/// remaining counters are OpenAI-specific.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TokenDetails {
    pub text: u64,
    pub audio: u64,
    pub image: u64,
    pub video: u64,
    pub document: u64,
    pub cached: u64,
    pub reasoning: u64,
    pub accepted_prediction: u64,
    pub rejected_prediction: u64,
    pub tool_used: u64,
}

impl TokenDetails {
    #[must_use]
    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}

impl Add for TokenDetails {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            text: self.text + rhs.text,
            audio: self.audio + rhs.audio,
            image: self.image + rhs.image,
            video: self.video + rhs.video,
            document: self.document + rhs.document,
            cached: self.cached + rhs.cached,
            reasoning: self.reasoning + rhs.reasoning,
            accepted_prediction: self.accepted_prediction + rhs.accepted_prediction,
            rejected_prediction: self.rejected_prediction + rhs.rejected_prediction,
            tool_used: self.tool_used + rhs.tool_used,
        }
    }
}

/// Additive token usage record.
///
/// `None` details act as the identity for addition, so summing frames
/// that never report details keeps them `None`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Tokens {
    pub prompt: u64,
    pub completion: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt_details: Option<TokenDetails>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_details: Option<TokenDetails>,
}

impl Tokens {
    #[must_use]
    pub fn new(prompt: u64, completion: u64) -> Self {
        Self {
            prompt,
            completion,
            prompt_details: None,
            completion_details: None,
        }
    }

    #[must_use]
    pub fn total(&self) -> u64 {
        self.prompt + self.completion
    }

    /// True when the frame carried no usage at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.prompt == 0
            && self.completion == 0
            && self.prompt_details.is_none()
            && self.completion_details.is_none()
    }
}

fn add_details(lhs: Option<TokenDetails>, rhs: Option<TokenDetails>) -> Option<TokenDetails> {
    match (lhs, rhs) {
        (Some(a), Some(b)) => Some(a + b),
        (a, None) => a,
        (None, b) => b,
    }
}

impl Add for Tokens {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            prompt: self.prompt + rhs.prompt,
            completion: self.completion + rhs.completion,
            prompt_details: add_details(self.prompt_details, rhs.prompt_details),
            completion_details: add_details(self.completion_details, rhs.completion_details),
        }
    }
}

impl AddAssign for Tokens {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sum for Tokens {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), Add::add)
    }
}

impl<'a> Sum<&'a Tokens> for Tokens {
    fn sum<I: Iterator<Item = &'a Tokens>>(iter: I) -> Self {
        iter.copied().sum()
    }
}
