//! Tool trait and registry.
//!
//! The dispatcher routes every JSON-RPC method through a [`ToolRegistry`].
//! A tool is any type implementing [`Tool`]; the registry maps its
//! [`name`](Tool::name) to a shared handle.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │              ToolRegistry                │
//! │  ┌─────────┐ ┌──────────────────────────┐│
//! │  │  ping   │ │ summarize.readme         ││
//! │  │         │ │ summarize.commits        ││
//! │  │         │ │ summarize.issues         ││
//! │  │         │ │ summarize.pull_requests  ││
//! │  └─────────┘ └──────────────────────────┘│
//! └──────────────┬───────────────────────────┘
//!                ▼
//!        dispatcher::serve() → JSON-RPC lines
//! ```
//!
//! # Usage
//!
//! ```rust
//! use repo_digest::traits::ToolRegistry;
//!
//! let tools = ToolRegistry::with_builtins();
//! assert!(tools.resolve("ping").is_some());
//! assert_eq!(tools.len(), 5);
//! ```
//!
//! Registration is explicit: nothing is added to a registry as a side
//! effect of loading a module.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::Config;
use crate::models::{RepoId, SummaryKind};
use crate::summarizer::Summarizer;

// ═══════════════════════════════════════════════════════════════════════
// Tool Trait
// ═══════════════════════════════════════════════════════════════════════

/// A named operation the dispatcher can invoke.
///
/// # Example
///
/// ```rust
/// use async_trait::async_trait;
/// use anyhow::Result;
/// use serde_json::Value;
/// use repo_digest::traits::{Tool, ToolContext};
///
/// pub struct EchoTool;
///
/// #[async_trait]
/// impl Tool for EchoTool {
///     fn name(&self) -> &str { "echo" }
///
///     async fn execute(&self, params: Value, _ctx: &ToolContext) -> Result<Value> {
///         Ok(params)
///     }
/// }
/// ```
#[async_trait]
pub trait Tool: Send + Sync {
    /// The JSON-RPC method name (e.g. `"summarize.readme"`).
    fn name(&self) -> &str;

    /// Run the tool.
    ///
    /// # Arguments
    ///
    /// * `params`: the request's named arguments (always a JSON object).
    /// * `ctx`: shared services the tool may use.
    ///
    /// # Returns
    ///
    /// The value placed in the response's `result`. An `Err` becomes a
    /// `HandlerFailure` error response.
    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value>;
}

// ═══════════════════════════════════════════════════════════════════════
// ToolContext
// ═══════════════════════════════════════════════════════════════════════

/// Services handed to every tool invocation.
///
/// Built once when the dispatcher starts and shared by all requests.
#[derive(Clone)]
pub struct ToolContext {
    summarizer: Arc<Summarizer>,
}

impl ToolContext {
    pub fn new(summarizer: Arc<Summarizer>) -> Self {
        Self { summarizer }
    }

    /// Construct the GitHub client, model provider, and store from config.
    pub fn from_config(config: &Config) -> Result<Self> {
        let summarizer = Summarizer::from_config(config)
            .context("Failed to initialise summarizer services")?;
        Ok(Self::new(Arc::new(summarizer)))
    }

    pub fn summarizer(&self) -> &Summarizer {
        &self.summarizer
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Built-in Tool Implementations
// ═══════════════════════════════════════════════════════════════════════

/// Liveness check. Returns `{"ok": true}`.
pub struct PingTool;

#[async_trait]
impl Tool for PingTool {
    fn name(&self) -> &str {
        "ping"
    }

    async fn execute(&self, _params: Value, _ctx: &ToolContext) -> Result<Value> {
        Ok(serde_json::json!({ "ok": true }))
    }
}

/// Named arguments taken by the `summarize.*` tools.
#[derive(Debug, Deserialize)]
pub struct RepoParams {
    pub owner: String,
    pub repo: String,
}

impl RepoParams {
    pub fn from_value(params: Value) -> Result<RepoId> {
        let params: RepoParams =
            serde_json::from_value(params).context("expected params {owner, repo}")?;
        RepoId::new(&params.owner, &params.repo)
    }
}

/// Generates and stores one kind of summary. Returns the summary text.
pub struct SummarizeTool {
    kind: SummaryKind,
}

impl SummarizeTool {
    pub fn new(kind: SummaryKind) -> Self {
        Self { kind }
    }
}

#[async_trait]
impl Tool for SummarizeTool {
    fn name(&self) -> &str {
        self.kind.method()
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let repo = RepoParams::from_value(params)?;
        let doc = ctx.summarizer().summarize(self.kind, &repo).await?;
        Ok(Value::String(doc.summary))
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Registry
// ═══════════════════════════════════════════════════════════════════════

/// Method name → tool.
///
/// Use [`ToolRegistry::with_builtins`] for `ping` and the four
/// `summarize.*` tools, then [`register`](ToolRegistry::register) to add or
/// replace entries. Once built it is only read, so it is shared as
/// `Arc<ToolRegistry>`.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// Create an empty tool registry.
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(PingTool));
        for kind in SummaryKind::ALL {
            registry.register(Arc::new(SummarizeTool::new(kind)));
        }
        registry
    }

    /// Insert a tool, replacing any tool already registered under its name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), tool).is_some() {
            tracing::debug!(tool = %name, "replaced registered tool");
        }
    }

    /// Look up a tool. `None` means the method is not registered.
    pub fn resolve(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Registered method names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Check if the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Return the count of registered tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}
