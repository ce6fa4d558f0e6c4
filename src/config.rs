//! TOML configuration parsing and validation.
//!
//! Every section is optional; omitted sections and fields fall back to
//! defaults, so an empty file is a valid configuration. See
//! [`Config::minimal`] for the in-memory equivalent.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::models::RepoId;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub system: SystemConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub github: GithubConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub repositories: RepositoriesConfig,
}

/// Selects between the multi-process pipeline and the in-process debug host.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SystemMode {
    #[default]
    Pipeline,
    InProcess,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SystemConfig {
    #[serde(default)]
    pub mode: SystemMode,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct SupervisorConfig {
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    #[serde(default = "default_run_dir")]
    pub run_dir: PathBuf,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,
    #[serde(default)]
    pub serialize_requests: bool,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            log_dir: default_log_dir(),
            run_dir: default_run_dir(),
            request_timeout_secs: default_request_timeout_secs(),
            stop_grace_secs: default_stop_grace_secs(),
            startup_timeout_secs: default_startup_timeout_secs(),
            serialize_requests: false,
        }
    }
}

impl SupervisorConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}
fn default_run_dir() -> PathBuf {
    PathBuf::from("run")
}
fn default_request_timeout_secs() -> u64 {
    300
}
fn default_stop_grace_secs() -> u64 {
    3
}
fn default_startup_timeout_secs() -> u64 {
    10
}

/// How the dispatcher schedules handlers.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// One handler at a time, in arrival order.
    #[default]
    Sequential,
    /// Each request runs as its own task, bounded by `max_in_flight`.
    Concurrent,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DispatcherConfig {
    #[serde(default)]
    pub mode: DispatchMode,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            mode: DispatchMode::Sequential,
            max_in_flight: default_max_in_flight(),
        }
    }
}

fn default_max_in_flight() -> usize {
    4
}

#[derive(Debug, Deserialize, Clone)]
pub struct RelayConfig {
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default)]
    pub exit_on_eof: bool,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            retry_delay_ms: default_retry_delay_ms(),
            exit_on_eof: false,
        }
    }
}

impl RelayConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

fn default_retry_delay_ms() -> u64 {
    100
}

#[derive(Debug, Deserialize, Clone)]
pub struct GithubConfig {
    #[serde(default = "default_api_url")]
    pub api_url: String,
    /// Environment variable holding an optional API token.
    #[serde(default = "default_token_env")]
    pub token_env: String,
    #[serde(default = "default_item_limit")]
    pub item_limit: usize,
    #[serde(default = "default_body_preview_chars")]
    pub body_preview_chars: usize,
    #[serde(default = "default_github_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            token_env: default_token_env(),
            item_limit: default_item_limit(),
            body_preview_chars: default_body_preview_chars(),
            timeout_secs: default_github_timeout_secs(),
        }
    }
}

fn default_api_url() -> String {
    "https://api.github.com".to_string()
}
fn default_token_env() -> String {
    "GITHUB_TOKEN".to_string()
}
fn default_item_limit() -> usize {
    10
}
fn default_body_preview_chars() -> usize {
    100
}
fn default_github_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Models the provider is allowed to load. An empty list disables the check.
    #[serde(default = "default_allowed_models")]
    pub allowed_models: Vec<String>,
    #[serde(default = "default_max_new_tokens")]
    pub max_new_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default = "default_repeat_penalty")]
    pub repeat_penalty: f32,
    #[serde(default = "default_model_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            endpoint: default_endpoint(),
            model: default_model(),
            allowed_models: default_allowed_models(),
            max_new_tokens: default_max_new_tokens(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            repeat_penalty: default_repeat_penalty(),
            timeout_secs: default_model_timeout_secs(),
        }
    }
}

fn default_provider() -> String {
    "ollama".to_string()
}
fn default_endpoint() -> String {
    "http://127.0.0.1:11434".to_string()
}
fn default_model() -> String {
    "phi3.5".to_string()
}
fn default_allowed_models() -> Vec<String> {
    vec![default_model()]
}
fn default_max_new_tokens() -> u32 {
    400
}
fn default_temperature() -> f32 {
    0.3
}
fn default_top_p() -> f32 {
    0.9
}
fn default_repeat_penalty() -> f32 {
    1.05
}
fn default_model_timeout_secs() -> u64 {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    #[serde(default = "default_store_root")]
    pub root: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: default_store_root(),
        }
    }
}

fn default_store_root() -> PathBuf {
    PathBuf::from("summaries")
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct RepositoriesConfig {
    #[serde(default = "default_repositories")]
    pub list: Vec<String>,
}

impl Default for RepositoriesConfig {
    fn default() -> Self {
        Self {
            list: default_repositories(),
        }
    }
}

fn default_repositories() -> Vec<String> {
    [
        "microsoft/vscode",
        "torvalds/linux",
        "facebook/react",
        "pallets/flask",
        "django/django",
        "numpy/numpy",
        "huggingface/transformers",
        "fastapi/fastapi",
        "vercel/next.js",
        "nestjs/nest",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl RepositoriesConfig {
    /// Parse every configured entry into a [`RepoId`].
    pub fn repo_ids(&self) -> Result<Vec<RepoId>> {
        self.list.iter().map(|s| s.parse()).collect()
    }
}

impl Config {
    /// Configuration with every default applied.
    ///
    /// Used by the child-process commands when no config file exists.
    pub fn minimal() -> Self {
        Self::default()
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    validate(&config)?;
    Ok(config)
}

/// Load the config file if it exists, otherwise fall back to [`Config::minimal`].
///
/// A file that exists but fails to parse or validate is still an error.
pub fn load_config_or_minimal(path: &Path) -> Result<Config> {
    if path.exists() {
        load_config(path)
    } else {
        Ok(Config::minimal())
    }
}

fn validate(config: &Config) -> Result<()> {
    // Validate supervisor
    if config.supervisor.request_timeout_secs == 0 {
        anyhow::bail!("supervisor.request_timeout_secs must be > 0");
    }
    if config.supervisor.startup_timeout_secs == 0 {
        anyhow::bail!("supervisor.startup_timeout_secs must be > 0");
    }

    // Validate dispatcher
    if config.dispatcher.max_in_flight == 0 {
        anyhow::bail!("dispatcher.max_in_flight must be >= 1");
    }

    // Validate github
    if config.github.item_limit == 0 {
        anyhow::bail!("github.item_limit must be >= 1");
    }

    // Validate model
    if !(0.0..=2.0).contains(&config.model.temperature) {
        anyhow::bail!("model.temperature must be in [0.0, 2.0]");
    }
    if !(config.model.top_p > 0.0 && config.model.top_p <= 1.0) {
        anyhow::bail!("model.top_p must be in (0.0, 1.0]");
    }
    if config.model.max_new_tokens == 0 {
        anyhow::bail!("model.max_new_tokens must be > 0");
    }

    match config.model.provider.as_str() {
        "disabled" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown model provider: '{}'. Must be disabled or ollama.",
            other
        ),
    }

    config
        .repositories
        .repo_ids()
        .with_context(|| "Invalid entry in repositories.list")?;

    Ok(())
}
