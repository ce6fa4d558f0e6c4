//! Language model provider abstraction and implementations.
//!
//! Defines the [`ModelService`] trait and concrete implementations:
//! - **[`DisabledModel`]**: returns errors; used when no model is configured.
//! - **[`OllamaModel`]**: calls a locally hosted model server through the
//!   Ollama-compatible `POST /api/generate` endpoint.
//!
//! # Provider Selection
//!
//! Use [`create_model`] to instantiate the appropriate provider from the
//! configuration:
//!
//! ```rust
//! # use repo_digest::config::ModelConfig;
//! # use repo_digest::model::create_model;
//! let config = ModelConfig {
//!     provider: "disabled".to_string(),
//!     ..ModelConfig::default()
//! };
//! let model = create_model(&config).unwrap();
//! assert_eq!(model.model_name(), "disabled");
//! ```
//!
//! # Allowlist
//!
//! Providers refuse to start for a model that is not listed in
//! `model.allowed_models`. This keeps a config typo or a tampered file from
//! pulling an arbitrary model into the pipeline.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::ModelConfig;

/// Sampling options for one generation call.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationOptions {
    pub max_new_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub repeat_penalty: f32,
}

impl GenerationOptions {
    pub fn from_config(config: &ModelConfig) -> Self {
        Self {
            max_new_tokens: config.max_new_tokens,
            temperature: config.temperature,
            top_p: config.top_p,
            repeat_penalty: config.repeat_penalty,
        }
    }
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self::from_config(&ModelConfig::default())
    }
}

/// A loaded generative model.
///
/// Implementations are constructed once at startup and shared behind an
/// `Arc`; `generate` is stateless between calls.
#[async_trait]
pub trait ModelService: Send + Sync {
    /// Returns the model identifier (e.g. `"phi3.5"`).
    fn model_name(&self) -> &str;

    /// Generate a completion for `prompt`. Only the newly generated text is
    /// returned, trimmed of surrounding whitespace.
    async fn generate(&self, prompt: &str, options: &GenerationOptions) -> Result<String>;
}

/// Build the provider named by `config.provider`.
pub fn create_model(config: &ModelConfig) -> Result<Arc<dyn ModelService>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledModel)),
        "ollama" => Ok(Arc::new(OllamaModel::new(config)?)),
        other => bail!("Unknown model provider: {}", other),
    }
}

/// Wrap a prompt in the chat template expected by instruction-tuned models.
pub fn chat_prompt(system: &str, user: &str) -> String {
    format!("<|system|>\n{}\n<|user|>\n{}\n<|assistant|>", system, user)
}

// ============ Disabled Provider ============

/// A no-op provider that always returns errors.
///
/// Used when `model.provider = "disabled"`.
pub struct DisabledModel;

#[async_trait]
impl ModelService for DisabledModel {
    fn model_name(&self) -> &str {
        "disabled"
    }

    async fn generate(&self, _prompt: &str, _options: &GenerationOptions) -> Result<String> {
        bail!("Model provider is disabled")
    }
}

// ============ Ollama Provider ============

/// Provider backed by a local Ollama-compatible server.
pub struct OllamaModel {
    endpoint: String,
    model: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    /// The prompt already carries its chat template.
    raw: bool,
    options: GenerateOptions,
}

#[derive(Serialize)]
struct GenerateOptions {
    num_predict: u32,
    temperature: f32,
    top_p: f32,
    repeat_penalty: f32,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

impl OllamaModel {
    /// Create a provider for `config.model` at `config.endpoint`.
    ///
    /// # Errors
    ///
    /// Returns an error if the endpoint is empty, the model is not in the
    /// allowlist, or the HTTP client cannot be built.
    pub fn new(config: &ModelConfig) -> Result<Self> {
        if config.endpoint.trim().is_empty() {
            bail!("model.endpoint must not be empty");
        }
        if !config.allowed_models.is_empty() && !config.allowed_models.contains(&config.model) {
            bail!("Untrusted model: '{}' is not in model.allowed_models", config.model);
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to create HTTP client for model provider")?;

        Ok(Self {
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            client,
        })
    }
}

#[async_trait]
impl ModelService for OllamaModel {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &str, options: &GenerationOptions) -> Result<String> {
        let started = Instant::now();
        let body = GenerateRequest {
            model: &self.model,
            prompt,
            stream: false,
            raw: true,
            options: GenerateOptions {
                num_predict: options.max_new_tokens,
                temperature: options.temperature,
                top_p: options.top_p,
                repeat_penalty: options.repeat_penalty,
            },
        };

        tracing::debug!(model = %self.model, prompt_chars = prompt.len(), "sending generation request");

        let resp = self
            .client
            .post(format!("{}/api/generate", self.endpoint))
            .json(&body)
            .send()
            .await
            .with_context(|| format!("Failed to reach model server at {}", self.endpoint))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            bail!("Model server error {}: {}", status, text);
        }

        let parsed: GenerateResponse = resp
            .json()
            .await
            .context("Failed to parse model server response")?;

        tracing::info!(
            model = %self.model,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "generation finished"
        );
        Ok(parsed.response.trim().to_string())
    }
}
