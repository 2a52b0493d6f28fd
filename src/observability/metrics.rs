//! Process-wide counters rendered in the Prometheus text format.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{RwLock, RwLockUpgradableReadGuard};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use tracing::warn;

use crate::provider::Tokens;

type LabelValues = SmallVec<[String; 2]>;

/// Series cap per counter unless configured otherwise.
pub const DEFAULT_MAX_SERIES: usize = 1000;
/// Label value of the series that absorbs increments past the cap.
pub const OVERFLOW_LABEL: &str = "other";

/// Monotonic counter with a fixed label set.
///
/// Label values such as the model name come from upstream bodies, so the
/// number of series is capped. Once `max_series` distinct label sets exist,
/// new ones are folded into a single series labelled `other`.
pub struct Counter {
    name: &'static str,
    help: &'static str,
    label_names: &'static [&'static str],
    max_series: usize,
    overflowed: AtomicBool,
    values: RwLock<FxHashMap<LabelValues, AtomicU64>>,
}

impl Counter {
    #[must_use]
    pub fn new(
        name: &'static str,
        help: &'static str,
        label_names: &'static [&'static str],
    ) -> Self {
        Self {
            name,
            help,
            label_names,
            max_series: DEFAULT_MAX_SERIES,
            overflowed: AtomicBool::new(false),
            values: RwLock::new(FxHashMap::default()),
        }
    }

    #[must_use]
    pub fn with_max_series(mut self, max_series: usize) -> Self {
        self.max_series = max_series.max(1);
        self
    }

    /// Add `by` to the series for `labels`. A label-count mismatch is
    /// logged and dropped.
    pub fn inc_by(&self, labels: &[&str], by: u64) {
        if labels.len() != self.label_names.len() {
            warn!(
                counter = self.name,
                expected = self.label_names.len(),
                got = labels.len(),
                "counter label mismatch, increment dropped"
            );
            return;
        }
        if by == 0 {
            return;
        }

        let key = label_key(labels);
        {
            let map = self.values.read();
            if let Some(series) = map.get(&key) {
                series.fetch_add(by, Ordering::Relaxed);
                return;
            }
        }

        let map = self.values.upgradable_read();
        if let Some(series) = map.get(&key) {
            series.fetch_add(by, Ordering::Relaxed);
            return;
        }
        let mut map = RwLockUpgradableReadGuard::upgrade(map);
        let key = if map.len() >= self.max_series {
            if !self.overflowed.swap(true, Ordering::Relaxed) {
                warn!(
                    counter = self.name,
                    max_series = self.max_series,
                    "counter series cap reached; new label sets are counted as \"other\""
                );
            }
            self.label_names.iter().map(|_| OVERFLOW_LABEL.to_string()).collect()
        } else {
            key
        };
        map.entry(key)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(by, Ordering::Relaxed);
    }

    pub fn inc(&self, labels: &[&str]) {
        self.inc_by(labels, 1);
    }

    /// Current value of one series; 0 when it was never incremented.
    #[must_use]
    pub fn get(&self, labels: &[&str]) -> u64 {
        let map = self.values.read();
        map.get(&label_key(labels)).map_or(0, |series| series.load(Ordering::Relaxed))
    }

    pub fn render_into(&self, out: &mut String) {
        let _ = writeln!(out, "# HELP {} {}", self.name, self.help);
        let _ = writeln!(out, "# TYPE {} counter", self.name);
        let map = self.values.read();
        let mut series: Vec<_> = map
            .iter()
            .map(|(labels, value)| (labels, value.load(Ordering::Relaxed)))
            .collect();
        series.sort_by(|a, b| a.0.cmp(b.0));
        for (labels, value) in series {
            out.push_str(self.name);
            if !labels.is_empty() {
                out.push('{');
                for (i, (name, label)) in self.label_names.iter().zip(labels.iter()).enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    let _ = write!(out, "{name}=\"{}\"", escape_label(label));
                }
                out.push('}');
            }
            let _ = writeln!(out, " {value}");
        }
    }
}

fn label_key(labels: &[&str]) -> LabelValues {
    labels.iter().map(|l| (*l).to_string()).collect()
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

const TOKEN_LABELS: &[&str] = &["provider", "model"];
const EXCEPTION_LABELS: &[&str] = &["stage"];

pub struct Metrics {
    pub prompt_tokens: Counter,
    pub completion_tokens: Counter,
    pub rate_limited_tokens: Counter,
    pub exception_raised: Counter,
}

impl Metrics {
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_series(DEFAULT_MAX_SERIES)
    }

    /// Registry whose counters each hold at most `max_series` series.
    #[must_use]
    pub fn with_max_series(max_series: usize) -> Self {
        Self {
            prompt_tokens: Counter::new(
                "prompt_tokens",
                "Prompt tokens reported by the provider.",
                TOKEN_LABELS,
            )
            .with_max_series(max_series),
            completion_tokens: Counter::new(
                "completion_tokens",
                "Completion tokens reported by the provider.",
                TOKEN_LABELS,
            )
            .with_max_series(max_series),
            rate_limited_tokens: Counter::new(
                "rate_limited_tokens",
                "Prompt tokens estimated on the request path for rate limiting.",
                TOKEN_LABELS,
            )
            .with_max_series(max_series),
            exception_raised: Counter::new(
                "exception_raised",
                "Errors converted into pass-through responses.",
                EXCEPTION_LABELS,
            )
            .with_max_series(max_series),
        }
    }

    pub fn record_usage(&self, provider: &str, model: &str, usage: &Tokens, rate_limited: u64) {
        let labels = [provider, model];
        self.prompt_tokens.inc_by(&labels, usage.prompt);
        self.completion_tokens.inc_by(&labels, usage.completion);
        self.rate_limited_tokens.inc_by(&labels, rate_limited);
    }

    pub fn record_exception(&self, stage: &str) {
        self.exception_raised.inc(&[stage]);
    }

    /// Prometheus text exposition of every counter.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(1024);
        self.prompt_tokens.render_into(&mut out);
        self.completion_tokens.render_into(&mut out);
        self.rate_limited_tokens.render_into(&mut out);
        self.exception_raised.render_into(&mut out);
        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
