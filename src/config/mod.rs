pub mod validation;

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use rustc_hash::FxHasher;
use serde::{Deserialize, Serialize};

use self::validation::validate_config;

/// Environment variable overriding `server.listen_addr`.
pub const LISTEN_ADDR_ENV: &str = "LISTEN_ADDR";
/// Environment variable naming the config file.
pub const CONFIG_PATH_ENV: &str = "LLM_EXTPROC_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config.yaml";

/// Error type for configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

/// Where the ext_proc listener binds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddr {
    Unix(PathBuf),
    UnixAbstract(String),
    Tcp(SocketAddr),
}

impl FromStr for ListenAddr {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(name) = s.strip_prefix("unix-abstract:") {
            if name.is_empty() {
                return Err(ConfigError::Validation(
                    "unix-abstract listen address needs a name".to_string(),
                ));
            }
            return Ok(ListenAddr::UnixAbstract(name.to_string()));
        }
        if let Some(path) = s.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(ConfigError::Validation(
                    "unix listen address needs a path".to_string(),
                ));
            }
            return Ok(ListenAddr::Unix(PathBuf::from(path)));
        }
        s.parse::<SocketAddr>()
            .map(ListenAddr::Tcp)
            .map_err(|e| ConfigError::Validation(format!("invalid listen address '{s}': {e}")))
    }
}

impl fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenAddr::Unix(path) => write!(f, "unix:{}", path.display()),
            ListenAddr::UnixAbstract(name) => write!(f, "unix-abstract:{name}"),
            ListenAddr::Tcp(addr) => write!(f, "{addr}"),
        }
    }
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,
    #[serde(default = "default_stats_dir")]
    pub stats_dir: String,
    #[serde(default = "default_timeout_ms")]
    pub webhook_timeout_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub moderation_timeout_ms: u64,
}

fn default_listen_addr() -> String {
    "[::]:50051".to_string()
}
fn default_metrics_addr() -> String {
    "0.0.0.0:9092".to_string()
}
fn default_stats_dir() -> String {
    "/var/run/stats".to_string()
}
fn default_timeout_ms() -> u64 {
    3000
}

impl ServerConfig {
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] for an unparseable address.
    pub fn listen_addr(&self) -> Result<ListenAddr, ConfigError> {
        self.listen_addr.parse()
    }

    #[must_use]
    pub fn webhook_timeout(&self) -> Duration {
        Duration::from_millis(self.webhook_timeout_ms)
    }

    #[must_use]
    pub fn moderation_timeout(&self) -> Duration {
        Duration::from_millis(self.moderation_timeout_ms)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            metrics_addr: default_metrics_addr(),
            stats_dir: default_stats_dir(),
            webhook_timeout_ms: default_timeout_ms(),
            moderation_timeout_ms: default_timeout_ms(),
        }
    }
}

// ---------------------------------------------------------------------------
// Features
// ---------------------------------------------------------------------------

/// What the stream coordinator does when the chunk buffer outgrows
/// `max_buffered_bytes` without reaching a boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Guard everything buffered, emit it and keep streaming.
    #[default]
    Flush,
    /// End the stream with a 500.
    Reject,
}

impl fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OverflowPolicy::Flush => write!(f, "flush"),
            OverflowPolicy::Reject => write!(f, "reject"),
        }
    }
}

/// Log line encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeaturesConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,
    #[serde(default = "default_min_guardrail_chars")]
    pub min_guardrail_chars: usize,
    #[serde(default = "default_max_buffered_bytes")]
    pub max_buffered_bytes: usize,
    #[serde(default)]
    pub buffer_overflow: OverflowPolicy,
    #[serde(default = "default_true")]
    pub force_stream_usage: bool,
    /// Distinct label sets kept per metrics counter.
    #[serde(default = "default_max_metric_series")]
    pub max_metric_series: usize,
}

fn default_log_level() -> String {
    "INFO".to_string()
}
fn default_min_guardrail_chars() -> usize {
    50
}
fn default_max_buffered_bytes() -> usize {
    1024 * 1024
}
fn default_true() -> bool {
    true
}
fn default_max_metric_series() -> usize {
    1000
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            min_guardrail_chars: default_min_guardrail_chars(),
            max_buffered_bytes: default_max_buffered_bytes(),
            buffer_overflow: OverflowPolicy::default(),
            force_stream_usage: true,
            max_metric_series: default_max_metric_series(),
        }
    }
}

// ---------------------------------------------------------------------------
// Guardrail policies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RecognizerAction {
    #[default]
    Mask,
    Reject,
}

/// One regex recognizer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognizerConfig {
    pub name: String,
    pub pattern: String,
    #[serde(default)]
    pub action: RecognizerAction,
    /// Mask text; `<NAME>` when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replacement: Option<String>,
    /// Confidence of a match, 1.0 when absent. Compared against the
    /// policy's `score_threshold`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    /// Roles the recognizer applies to; all roles when empty.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,
}

/// Rule selecting which client headers are forwarded to a webhook.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeaderMatchConfig {
    Exact(String),
    Regex(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub url: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub forward_headers: Vec<HeaderMatchConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModerationConfig {
    #[serde(default = "default_moderation_url")]
    pub url: String,
    #[serde(default = "default_moderation_model")]
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

fn default_moderation_url() -> String {
    "https://api.openai.com/v1/moderations".to_string()
}
fn default_moderation_model() -> String {
    "omni-moderation-latest".to_string()
}

/// Response sent to the client when a guardrail rejects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomResponseConfig {
    #[serde(default = "default_reject_status")]
    pub status_code: u16,
    /// `{reason}` is replaced with the rejection reason.
    #[serde(default = "default_reject_body")]
    pub body: String,
}

fn default_reject_status() -> u16 {
    200
}
fn default_reject_body() -> String {
    "Request blocked by guardrail: {reason}".to_string()
}

impl CustomResponseConfig {
    #[must_use]
    pub fn render(&self, reason: &str) -> String {
        self.body.replace("{reason}", reason)
    }
}

impl Default for CustomResponseConfig {
    fn default() -> Self {
        Self {
            status_code: default_reject_status(),
            body: default_reject_body(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct GuardrailPolicyConfig {
    #[serde(default)]
    pub recognizers: Vec<RecognizerConfig>,
    #[serde(default)]
    pub request_webhooks: Vec<WebhookConfig>,
    #[serde(default)]
    pub response_webhooks: Vec<WebhookConfig>,
    #[serde(default)]
    pub moderation: Option<ModerationConfig>,
    #[serde(default)]
    pub custom_response: CustomResponseConfig,
    /// Recognizers scoring below this are not applied.
    #[serde(default)]
    pub score_threshold: f64,
}

impl GuardrailPolicyConfig {
    /// FxHash over the policy's JSON form; identical policies share
    /// compiled guardrails.
    #[must_use]
    pub fn content_hash(&self) -> u64 {
        let mut hasher = FxHasher::default();
        match serde_json::to_vec(self) {
            Ok(bytes) => bytes.hash(&mut hasher),
            Err(_) => format!("{self:?}").hash(&mut hasher),
        }
        hasher.finish()
    }
}

// ---------------------------------------------------------------------------
// Top level
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub features: FeaturesConfig,
    #[serde(default)]
    pub policies: BTreeMap<String, GuardrailPolicyConfig>,
}

/// Load, override from the environment, and validate.
///
/// # Errors
///
/// Returns [`ConfigError`] if the file cannot be read, parsed, or validated.
pub fn load_config(path: &str) -> Result<AppConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    let mut config: AppConfig = serde_yaml::from_str(&contents)?;
    apply_env_overrides(&mut config);
    validate_config(&config)?;
    Ok(config)
}

/// Parse and validate YAML text without consulting the environment.
///
/// # Errors
///
/// Returns [`ConfigError`] if the text cannot be parsed or validated.
pub fn parse_config(yaml: &str) -> Result<AppConfig, ConfigError> {
    let config: AppConfig = serde_yaml::from_str(yaml)?;
    validate_config(&config)?;
    Ok(config)
}

pub fn apply_env_overrides(config: &mut AppConfig) {
    if let Ok(addr) = std::env::var(LISTEN_ADDR_ENV) {
        if !addr.trim().is_empty() {
            config.server.listen_addr = addr;
        }
    }
}
