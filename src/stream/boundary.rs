use std::sync::LazyLock;

use regex_lite::Regex;

use super::chunks::ChoiceContent;

/// Sentence terminator followed by spaces (and optional line breaks), or a
/// run of line breaks.
static SEGMENT_BOUNDARY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[.!?] +(?:\r?\n)*|(?:\r?\n)+").expect("segment boundary pattern compiles")
});

/// A boundary match within one choice's buffered text (byte offsets).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundaryMatch {
    pub start: usize,
    pub end: usize,
    pub captured: String,
}

/// Last boundary in `text` that is settled, i.e. does not touch the end of
/// the text. A match at the very end may still grow with the next frame
/// (`"!  "` followed by `"   x"`), so it is not safe to cut there yet.
#[must_use]
pub fn last_settled_boundary(text: &str) -> Option<BoundaryMatch> {
    SEGMENT_BOUNDARY
        .find_iter(text)
        .filter(|m| m.end() < text.len())
        .last()
        .map(|m| BoundaryMatch {
            start: m.start(),
            end: m.end(),
            captured: m.as_str().to_string(),
        })
}

/// Last settled boundary for every choice, or empty when any choice has none.
#[must_use]
pub fn find_segment_boundary(stream_contents: &[ChoiceContent]) -> Vec<BoundaryMatch> {
    stream_contents
        .iter()
        .map(|c| last_settled_boundary(&c.text))
        .collect::<Option<Vec<_>>>()
        .unwrap_or_default()
}
