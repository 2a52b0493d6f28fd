use std::sync::Arc;

use parking_lot::{RwLock, RwLockUpgradableReadGuard};
use rustc_hash::FxHashMap;

use super::GuardrailSet;
use crate::config::ConfigError;

/// Process-wide guardrails keyed by policy content hash. An entry is
/// published once and never replaced.
#[derive(Default)]
pub struct GuardrailCache {
    entries: RwLock<FxHashMap<u64, Arc<GuardrailSet>>>,
}

impl GuardrailCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn get(&self, hash: u64) -> Option<Arc<GuardrailSet>> {
        self.entries.read().get(&hash).cloned()
    }

    /// Return the entry for `hash`, building and publishing it on a miss.
    ///
    /// # Errors
    ///
    /// Propagates the error from `build`; nothing is published then.
    pub fn get_or_build<F>(&self, hash: u64, build: F) -> Result<Arc<GuardrailSet>, ConfigError>
    where
        F: FnOnce() -> Result<GuardrailSet, ConfigError>,
    {
        if let Some(hit) = self.get(hash) {
            return Ok(hit);
        }
        let entries = self.entries.upgradable_read();
        if let Some(hit) = entries.get(&hash) {
            return Ok(Arc::clone(hit));
        }
        let set = Arc::new(build()?);
        let mut entries = RwLockUpgradableReadGuard::upgrade(entries);
        entries.insert(hash, Arc::clone(&set));
        Ok(set)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GuardrailPolicyConfig, ServerConfig};

    fn build() -> Result<GuardrailSet, ConfigError> {
        GuardrailSet::from_policy(
            &GuardrailPolicyConfig::default(),
            reqwest::Client::new(),
            &ServerConfig::default(),
        )
    }

    #[test]
    fn test_build_once_then_reuse() {
        let cache = GuardrailCache::new();
        let first = cache.get_or_build(7, build).unwrap();
        let second = cache
            .get_or_build(7, || panic!("a published entry must not be rebuilt"))
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_failed_build_publishes_nothing() {
        let cache = GuardrailCache::new();
        let err = cache.get_or_build(1, || Err(ConfigError::Validation("bad".into())));
        assert!(err.is_err());
        assert!(cache.is_empty());
        assert!(cache.get(1).is_none());
    }
}
