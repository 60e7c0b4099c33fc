use secrecy::SecretString;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Gateway configuration. Every section is optional; an empty file gives
/// the defaults below.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub resilience: ResilienceConfig,
    #[serde(default)]
    pub secrets: SecretsConfig,
}

/// Per-run bounds of the script sandbox. Set by the operator, never by
/// the caller.
#[derive(Debug, Deserialize, Clone)]
pub struct SandboxConfig {
    #[serde(default = "default_memory_limit")]
    pub memory_limit_bytes: usize,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Interrupt polls allowed per run (see `sandbox` module docs).
    #[serde(default = "default_max_steps")]
    pub max_steps: u64,
    #[serde(default = "default_max_stack")]
    pub max_stack_bytes: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,
    /// Set to false for self-signed certs (dev servers only)
    #[serde(default = "default_tls_verify")]
    pub tls_verify: bool,
    #[serde(default = "default_max_body")]
    pub max_body_bytes: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ResilienceConfig {
    /// Retries after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_overall_timeout")]
    pub overall_timeout_secs: u64,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: u32,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SecretsBackendKind {
    Memory,
    File,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SecretsConfig {
    #[serde(default = "default_secrets_backend")]
    pub backend: SecretsBackendKind,
    #[serde(default = "default_secrets_path")]
    pub path: PathBuf,
    /// Supports ${ENV_VAR} substitution. At least 32 bytes.
    #[serde(default)]
    pub master_key: Option<SecretString>,
}

fn default_memory_limit() -> usize {
    5_000_000
}

fn default_timeout_ms() -> u64 {
    10_000
}

fn default_max_steps() -> u64 {
    1_000
}

fn default_max_stack() -> usize {
    256 * 1024
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_request_timeout() -> u64 {
    30
}

fn default_user_agent() -> String {
    format!("runjs-gateway/{}", env!("CARGO_PKG_VERSION"))
}

fn default_max_redirects() -> usize {
    5
}

fn default_tls_verify() -> bool {
    true
}

fn default_max_body() -> usize {
    10 * 1024 * 1024
}

fn default_max_retries() -> u32 {
    4
}

fn default_overall_timeout() -> u64 {
    60
}

fn default_initial_backoff() -> u64 {
    500
}

fn default_max_backoff() -> u64 {
    8_000
}

fn default_backoff_multiplier() -> u32 {
    2
}

fn default_secrets_backend() -> SecretsBackendKind {
    SecretsBackendKind::Memory
}

fn default_secrets_path() -> PathBuf {
    PathBuf::from("./data/secrets")
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            memory_limit_bytes: default_memory_limit(),
            timeout_ms: default_timeout_ms(),
            max_steps: default_max_steps(),
            max_stack_bytes: default_max_stack(),
        }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            request_timeout_secs: default_request_timeout(),
            user_agent: default_user_agent(),
            max_redirects: default_max_redirects(),
            tls_verify: default_tls_verify(),
            max_body_bytes: default_max_body(),
        }
    }
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            overall_timeout_secs: default_overall_timeout(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl Default for SecretsConfig {
    fn default() -> Self {
        Self {
            backend: default_secrets_backend(),
            path: default_secrets_path(),
            master_key: None,
        }
    }
}

impl SandboxConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Human-readable summary for the startup log
    pub fn describe(&self) -> String {
        format!(
            "{} bytes, {}ms, {} steps",
            self.memory_limit_bytes, self.timeout_ms, self.max_steps
        )
    }
}

impl ResilienceConfig {
    pub fn overall_timeout(&self) -> Duration {
        Duration::from_secs(self.overall_timeout_secs)
    }
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Expands environment variables like ${RUNJS_MASTER_KEY}, then parses.
    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let expanded = shellexpand::env(content)?;
        let config: Config = toml::from_str(&expanded)?;
        Ok(config)
    }
}
