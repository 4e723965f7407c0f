use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{PrismError, Result};

pub const DEFAULT_PORT: u16 = 8790;
pub const DEFAULT_BIND: &str = "0.0.0.0";
pub const DEFAULT_UPSTREAM: &str = "https://api.anthropic.com";

/// Drain deadline for in-flight work on shutdown, shared by the proxy
/// (request drain + writer flush) and the worker (in-flight jobs).
pub const SHUTDOWN_DRAIN_SECS: u64 = 30;

/// Environment variables recognized by both binaries. Only these names are
/// merged over the TOML file; everything else in the process environment is
/// ignored.
const ENV_KEYS: &[&str] = &[
    "BIND",
    "PORT",
    "UPSTREAM_URL",
    "DATABASE_URL",
    "DASHBOARD_API_KEY",
    "CREDENTIALS_DIR",
    "CLAUDE_API_TIMEOUT_MS",
    "PROXY_SERVER_TIMEOUT_MS",
    "ENABLE_CLIENT_AUTH",
    "STORAGE_ENABLED",
    "NOTIFY_WEBHOOK_URL",
    "AI_WORKER_ENABLED",
    "AI_WORKER_POLL_INTERVAL_MS",
    "AI_WORKER_MAX_CONCURRENT_JOBS",
    "AI_WORKER_JOB_TIMEOUT_MINUTES",
    "AI_WORKER_MAX_RETRIES",
    "AI_WORKER_RPM",
    "AI_MAX_CONTEXT_TOKENS",
    "AI_TOKENIZER_SAFETY_MARGIN",
    "AI_HEAD_MESSAGES",
    "AI_TAIL_MESSAGES",
    "ANALYSIS_BASE_URL",
    "ANALYSIS_API_KEY",
    "ANALYSIS_MODEL",
    "POOL_WINDOW_SECONDS",
    "POOL_OUTPUT_TOKEN_BUDGET",
];

/// Top-level config (prism.toml + documented env overrides).
///
/// Field names map 1:1 to the lowercased environment variable names, so a
/// single flat struct covers both sources.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrismConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_upstream_url")]
    pub upstream_url: String,

    /// Postgres connection string. Required whenever storage or the analysis
    /// worker is enabled.
    #[serde(default)]
    pub database_url: Option<String>,
    /// When absent, dashboard read endpoints run in read-only mode.
    #[serde(default)]
    pub dashboard_api_key: Option<String>,

    #[serde(default = "default_credentials_dir")]
    pub credentials_dir: String,

    /// Per-request upstream deadline.
    #[serde(default = "default_api_timeout_ms")]
    pub claude_api_timeout_ms: u64,
    /// Server socket timeout. Must exceed `claude_api_timeout_ms`.
    #[serde(default = "default_server_timeout_ms")]
    pub proxy_server_timeout_ms: u64,

    /// Dev-only escape hatch: `false` disables client-key verification.
    #[serde(default = "bool_true")]
    pub enable_client_auth: bool,
    #[serde(default = "bool_true")]
    pub storage_enabled: bool,

    /// Outbound notification webhook. Absent disables the hook entirely.
    #[serde(default)]
    pub notify_webhook_url: Option<String>,

    // ── analysis worker ──────────────────────────────────────────────────
    #[serde(default)]
    pub ai_worker_enabled: bool,
    #[serde(default = "default_poll_interval_ms")]
    pub ai_worker_poll_interval_ms: u64,
    #[serde(default = "default_max_concurrent_jobs")]
    pub ai_worker_max_concurrent_jobs: usize,
    #[serde(default = "default_job_timeout_minutes")]
    pub ai_worker_job_timeout_minutes: u64,
    #[serde(default = "default_max_retries")]
    pub ai_worker_max_retries: i32,
    /// Outbound analysis calls per minute.
    #[serde(default = "default_worker_rpm")]
    pub ai_worker_rpm: u32,

    #[serde(default = "default_max_context_tokens")]
    pub ai_max_context_tokens: u64,
    #[serde(default = "default_safety_margin")]
    pub ai_tokenizer_safety_margin: f64,
    #[serde(default = "default_head_messages")]
    pub ai_head_messages: usize,
    #[serde(default = "default_tail_messages")]
    pub ai_tail_messages: usize,

    #[serde(default = "default_upstream_url")]
    pub analysis_base_url: String,
    #[serde(default)]
    pub analysis_api_key: Option<String>,
    #[serde(default = "default_analysis_model")]
    pub analysis_model: String,

    // ── account pool ─────────────────────────────────────────────────────
    #[serde(default = "default_pool_window_seconds")]
    pub pool_window_seconds: u64,
    #[serde(default = "default_pool_output_token_budget")]
    pub pool_output_token_budget: u64,
}

impl Default for PrismConfig {
    fn default() -> Self {
        // An empty figment yields every serde default; the unwrap cannot fire.
        Figment::new().extract().expect("defaults are total")
    }
}

impl PrismConfig {
    /// Load config from a TOML file with documented env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. PRISM_CONFIG env var
    ///   3. ./prism.toml
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let path = config_path
            .map(String::from)
            .or_else(|| std::env::var("PRISM_CONFIG").ok())
            .unwrap_or_else(|| "prism.toml".to_string());

        let config: PrismConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::raw().only(ENV_KEYS))
            .extract()
            .map_err(|e| PrismError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Cross-field invariants that figment cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.proxy_server_timeout_ms <= self.claude_api_timeout_ms {
            return Err(PrismError::Config(format!(
                "PROXY_SERVER_TIMEOUT_MS ({}) must exceed CLAUDE_API_TIMEOUT_MS ({})",
                self.proxy_server_timeout_ms, self.claude_api_timeout_ms
            )));
        }
        if (self.storage_enabled || self.ai_worker_enabled) && self.database_url.is_none() {
            return Err(PrismError::Config(
                "DATABASE_URL is required when storage or the analysis worker is enabled".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.ai_tokenizer_safety_margin) {
            return Err(PrismError::Config(format!(
                "AI_TOKENIZER_SAFETY_MARGIN must be in [0, 1), got {}",
                self.ai_tokenizer_safety_margin
            )));
        }
        Ok(())
    }

    /// Connection string, after `validate()` has established it is present.
    pub fn require_database_url(&self) -> Result<&str> {
        self.database_url
            .as_deref()
            .ok_or_else(|| PrismError::Config("DATABASE_URL is not set".into()))
    }

    /// Prompt token budget after the safety margin.
    pub fn analysis_token_budget(&self) -> u64 {
        (self.ai_max_context_tokens as f64 * (1.0 - self.ai_tokenizer_safety_margin)) as u64
    }
}

fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_upstream_url() -> String {
    DEFAULT_UPSTREAM.to_string()
}
fn default_credentials_dir() -> String {
    "./credentials".to_string()
}
fn default_api_timeout_ms() -> u64 {
    600_000
}
fn default_server_timeout_ms() -> u64 {
    660_000
}
fn default_poll_interval_ms() -> u64 {
    5_000
}
fn default_max_concurrent_jobs() -> usize {
    2
}
fn default_job_timeout_minutes() -> u64 {
    5
}
fn default_max_retries() -> i32 {
    3
}
fn default_worker_rpm() -> u32 {
    10
}
fn default_max_context_tokens() -> u64 {
    900_000
}
fn default_safety_margin() -> f64 {
    0.05
}
fn default_head_messages() -> usize {
    5
}
fn default_tail_messages() -> usize {
    20
}
fn default_analysis_model() -> String {
    "claude-sonnet-4-6".to_string()
}
fn default_pool_window_seconds() -> u64 {
    18_000
}
fn default_pool_output_token_budget() -> u64 {
    140_000
}
fn bool_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = PrismConfig::default();
        assert_eq!(cfg.claude_api_timeout_ms, 600_000);
        assert!(cfg.proxy_server_timeout_ms > cfg.claude_api_timeout_ms);
        assert_eq!(cfg.pool_window_seconds, 18_000);
        assert_eq!(cfg.pool_output_token_budget, 140_000);
        assert_eq!(cfg.ai_head_messages, 5);
        assert_eq!(cfg.ai_tail_messages, 20);
        assert_eq!(cfg.credentials_dir, "./credentials");
        assert!(cfg.enable_client_auth);
    }

    #[test]
    fn analysis_budget_applies_safety_margin() {
        let cfg = PrismConfig::default();
        // 900_000 minus 5% margin
        assert_eq!(cfg.analysis_token_budget(), 855_000);
    }

    #[test]
    fn validate_rejects_inverted_timeouts() {
        let cfg = PrismConfig {
            claude_api_timeout_ms: 700_000,
            proxy_server_timeout_ms: 660_000,
            storage_enabled: false,
            ..PrismConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_requires_database_url_for_storage() {
        let cfg = PrismConfig {
            storage_enabled: true,
            database_url: None,
            ..PrismConfig::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = PrismConfig {
            storage_enabled: false,
            ai_worker_enabled: false,
            database_url: None,
            ..PrismConfig::default()
        };
        assert!(cfg.validate().is_ok());
    }
}
