use http::HeaderMap;

/// Ordered header list as delivered by the gateway.
///
/// Names are lowercased on insert. Pseudo-headers (`:path`, `:authority`)
/// are kept, which `http::HeaderMap` cannot represent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderSnapshot {
    entries: Vec<(String, String)>,
}

impl HeaderSnapshot {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut snapshot = Self::new();
        for (name, value) in pairs {
            snapshot.insert(name.as_ref(), value);
        }
        snapshot
    }

    pub fn insert(&mut self, name: &str, value: impl Into<String>) {
        self.entries.push((name.to_ascii_lowercase(), value.into()));
    }

    /// First value for `name` (case-insensitive).
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Media type of `content-type` without parameters, lowercased.
    #[must_use]
    pub fn content_type(&self) -> Option<String> {
        self.get("content-type").map(|v| {
            v.split(';')
                .next()
                .unwrap_or_default()
                .trim()
                .to_ascii_lowercase()
        })
    }

    #[must_use]
    pub fn path(&self) -> Option<&str> {
        self.get(":path")
    }

    /// `self` with every name present in `newer` replaced by `newer`'s values.
    /// Names only in `self` keep their position; `newer`'s entries follow.
    #[must_use]
    pub fn overlaid_with(&self, newer: &HeaderSnapshot) -> Self {
        let mut entries: Vec<(String, String)> = self
            .entries
            .iter()
            .filter(|(name, _)| !newer.contains(name))
            .cloned()
            .collect();
        entries.extend(newer.entries.iter().cloned());
        Self { entries }
    }
}

impl From<&HeaderMap> for HeaderSnapshot {
    fn from(map: &HeaderMap) -> Self {
        let mut snapshot = Self::new();
        for (name, value) in map {
            if let Ok(value) = value.to_str() {
                snapshot.insert(name.as_str(), value);
            }
        }
        snapshot
    }
}
