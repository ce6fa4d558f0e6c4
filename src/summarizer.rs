//! Summary generation: data source + model + store.
//!
//! One [`Summarizer::summarize`] call fetches the data for a summary kind,
//! prompts the model, and persists the result. When a listing comes back
//! empty the model is skipped and a fixed message is stored instead.

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Instant;

use crate::config::Config;
use crate::github::{DataSource, GithubClient};
use crate::model::{chat_prompt, create_model, GenerationOptions, ModelService};
use crate::models::{RepoId, RepoMetadata, SummaryDocument, SummaryKind};
use crate::store::SummaryStore;

pub const NO_COMMITS: &str = "No commit data available to summarize.";
pub const NO_ISSUES: &str = "No issues found for this repository.";
pub const NO_PULL_REQUESTS: &str = "No pull requests found for this repository.";

pub struct Summarizer {
    source: Arc<dyn DataSource>,
    model: Arc<dyn ModelService>,
    store: SummaryStore,
    options: GenerationOptions,
}

impl Summarizer {
    pub fn new(
        source: Arc<dyn DataSource>,
        model: Arc<dyn ModelService>,
        store: SummaryStore,
        options: GenerationOptions,
    ) -> Self {
        Self {
            source,
            model,
            store,
            options,
        }
    }

    /// Wire up the GitHub client, the configured model provider, and the store.
    pub fn from_config(config: &Config) -> Result<Self> {
        let source = GithubClient::from_config(&config.github)?;
        let model = create_model(&config.model)?;
        Ok(Self::new(
            Arc::new(source),
            model,
            SummaryStore::new(&config.store.root),
            GenerationOptions::from_config(&config.model),
        ))
    }

    pub fn store(&self) -> &SummaryStore {
        &self.store
    }

    /// Produce, persist, and return one summary.
    pub async fn summarize(&self, kind: SummaryKind, repo: &RepoId) -> Result<SummaryDocument> {
        let started = Instant::now();
        tracing::info!(repo = %repo, kind = %kind, "summarizing");

        let prompt = match kind {
            SummaryKind::Readme => {
                let readme = self.source.readme(repo).await?;
                let metadata = self.source.metadata(repo).await?;
                Some((readme_prompt(&metadata, &readme), metadata))
            }
            SummaryKind::Commits => {
                let commits = self.source.commits(repo).await?;
                self.listing_prompt(repo, &commits, commits_prompt).await?
            }
            SummaryKind::Issues => {
                let issues = self.source.issues(repo).await?;
                self.listing_prompt(repo, &issues, issues_prompt).await?
            }
            SummaryKind::PullRequests => {
                let pulls = self.source.pull_requests(repo).await?;
                self.listing_prompt(repo, &pulls, pull_requests_prompt).await?
            }
        };

        let (summary, metadata) = match prompt {
            Some((prompt, metadata)) => {
                let text = self
                    .model
                    .generate(&prompt, &self.options)
                    .await
                    .with_context(|| format!("Model generation failed for {} {}", repo, kind))?;
                (text, metadata)
            }
            None => {
                tracing::warn!(repo = %repo, kind = %kind, "no data to summarize");
                let metadata = self.source.metadata(repo).await?;
                (empty_message(kind).to_string(), metadata)
            }
        };

        let doc = SummaryDocument {
            metadata: self.document_metadata(&metadata)?,
            summary,
        };
        self.store.save(repo, kind, &doc)?;

        tracing::info!(
            repo = %repo,
            kind = %kind,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "summary stored"
        );
        Ok(doc)
    }

    /// `None` when there is nothing to summarize.
    async fn listing_prompt(
        &self,
        repo: &RepoId,
        items: &[String],
        build: fn(&RepoId, &str) -> String,
    ) -> Result<Option<(String, RepoMetadata)>> {
        if items.is_empty() {
            return Ok(None);
        }
        let metadata = self.source.metadata(repo).await?;
        let listing = items
            .iter()
            .map(|item| format!("- {}", item))
            .collect::<Vec<_>>()
            .join("\n");
        Ok(Some((build(repo, &listing), metadata)))
    }

    fn document_metadata(&self, metadata: &RepoMetadata) -> Result<Map<String, Value>> {
        let mut map = match serde_json::to_value(metadata)? {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        map.insert("generated_at".into(), Value::String(Utc::now().to_rfc3339()));
        map.insert(
            "model".into(),
            Value::String(self.model.model_name().to_string()),
        );
        Ok(map)
    }
}

pub fn empty_message(kind: SummaryKind) -> &'static str {
    match kind {
        SummaryKind::Readme => crate::github::NO_README,
        SummaryKind::Commits => NO_COMMITS,
        SummaryKind::Issues => NO_ISSUES,
        SummaryKind::PullRequests => NO_PULL_REQUESTS,
    }
}

// ============ Prompts ============

fn readme_prompt(metadata: &RepoMetadata, readme: &str) -> String {
    let system = "You are an expert software analyst. Evaluate whether a GitHub repository \
                  is valuable to a potential user or contributor. Analyze, do not copy the README.";
    let user = format!(
        "Repository metadata:\n\
         - Stars: {}\n\
         - Forks: {}\n\
         - Open Issues: {}\n\
         - Main Language: {}\n\
         - License: {}\n\
         - Last Updated: {}\n\n\
         README:\n{}\n\n\
         Give a structured analysis with these sections:\n\
         ## What Problem This Solves\n\
         ## Strengths\n\
         ## Limitations\n\
         ## Ideal Users\n\
         ## Final Verdict (1-10 usefulness score)\n",
        metadata.stars,
        metadata.forks,
        metadata.open_issues,
        metadata.language,
        metadata.license,
        metadata.updated_at,
        readme
    );
    chat_prompt(system, &user)
}

fn commits_prompt(repo: &RepoId, listing: &str) -> String {
    let system = "You summarize GitHub repository activity clearly and accurately.";
    let user = format!(
        "Recent commit messages for {}:\n{}\n\n\
         Summarize them under: New Features, Bug Fixes, Refactoring, \
         Notable Technical Changes, Overall Impact.",
        repo, listing
    );
    chat_prompt(system, &user)
}

fn issues_prompt(repo: &RepoId, listing: &str) -> String {
    let system = "You analyze GitHub issues and summarize user pain points and feature requests.";
    let user = format!(
        "Recent issues for {}:\n{}\n\n\
         Summarize them under: Common Bugs, Feature Requests, Recurring Themes, \
         Severity, Overall Insight (2-3 sentences on project health).",
        repo, listing
    );
    chat_prompt(system, &user)
}

fn pull_requests_prompt(repo: &RepoId, listing: &str) -> String {
    let system = "You summarize GitHub pull requests for developers and maintainers.";
    let user = format!(
        "Open pull requests for {}:\n{}\n\n\
         Summarize them under: Purpose of Changes, Key Technical Changes, \
         Risks, Review Status, Overall Impact.",
        repo, listing
    );
    chat_prompt(system, &user)
}
