mod session_id;

use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tracing::info;

use crate::config::{AppConfig, ConfigError, GuardrailPolicyConfig};
use crate::error::ExtProcError;
use crate::guardrail::{GuardrailCache, GuardrailSet};
use crate::observability::metrics::Metrics;

use session_id::SessionIdGenerator;

/// Policy used when a request names none.
pub const DEFAULT_POLICY: &str = "default";

/// Shared state reachable from every session and from the metrics router.
pub struct AppState {
    pub config: AppConfig,
    pub metrics: Metrics,
    http: reqwest::Client,
    guardrails: GuardrailCache,
    policy_hashes: FxHashMap<String, u64>,
    session_ids: SessionIdGenerator,
}

fn build_http_client() -> Result<reqwest::Client, ExtProcError> {
    reqwest::Client::builder()
        .pool_max_idle_per_host(16)
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_nodelay(true)
        .connect_timeout(Duration::from_secs(5))
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .map_err(|err| ExtProcError::Internal(format!("Failed to build HTTP client: {err}")))
}

impl AppState {
    /// # Errors
    ///
    /// Returns [`ExtProcError::Internal`] if the HTTP client cannot be built.
    pub fn new(config: AppConfig) -> Result<Self, ExtProcError> {
        let policy_hashes = config
            .policies
            .iter()
            .map(|(name, policy)| (name.clone(), policy.content_hash()))
            .collect();
        let metrics = Metrics::with_max_series(config.features.max_metric_series);
        Ok(Self {
            config,
            metrics,
            http: build_http_client()?,
            guardrails: GuardrailCache::new(),
            policy_hashes,
            session_ids: SessionIdGenerator::new(),
        })
    }

    #[must_use]
    pub fn http_client(&self) -> &reqwest::Client {
        &self.http
    }

    #[must_use]
    pub fn guardrail_cache(&self) -> &GuardrailCache {
        &self.guardrails
    }

    #[must_use]
    pub fn next_session_id(&self) -> uuid::Uuid {
        self.session_ids.next_id()
    }

    #[must_use]
    pub fn policy_hash(&self, name: &str) -> Option<u64> {
        self.policy_hashes.get(name).copied()
    }

    /// Compiled guardrails of the named policy, `None` when no such policy
    /// is configured.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the policy fails to compile.
    pub fn guardrails_for(&self, name: &str) -> Result<Option<Arc<GuardrailSet>>, ConfigError> {
        let (Some(policy), Some(hash)) = (self.config.policies.get(name), self.policy_hash(name))
        else {
            return Ok(None);
        };
        self.guardrails_with_hash(hash, policy).map(Some)
    }

    /// Compiled guardrails for a policy supplied by the driver, cached under
    /// `hash`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the policy fails to compile.
    pub fn guardrails_with_hash(
        &self,
        hash: u64,
        policy: &GuardrailPolicyConfig,
    ) -> Result<Arc<GuardrailSet>, ConfigError> {
        self.guardrails.get_or_build(hash, || {
            info!(hash, "compiling guardrail policy");
            GuardrailSet::from_policy(policy, self.http.clone(), &self.config.server)
        })
    }
}
