//! Core data models used throughout repo-digest.
//!
//! These types describe the repositories being summarized, the kinds of
//! summaries the pipeline produces, and the documents persisted by the
//! [`SummaryStore`](crate::store::SummaryStore).

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A GitHub repository identifier in `owner/repo` form.
///
/// Both components are used as directory names by the summary store, so
/// anything that could escape the store root is rejected at parse time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RepoId {
    pub owner: String,
    pub repo: String,
}

impl RepoId {
    /// Build a repository identifier from its two components.
    pub fn new(owner: &str, repo: &str) -> Result<Self> {
        validate_component("owner", owner)?;
        validate_component("repo", repo)?;
        Ok(Self {
            owner: owner.to_string(),
            repo: repo.to_string(),
        })
    }
}

fn validate_component(label: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        bail!("{} must not be empty", label);
    }
    if value == "." || value == ".." {
        bail!("invalid {}: '{}'", label, value);
    }
    if value.contains(['/', '\\']) || value.chars().any(char::is_control) {
        bail!("invalid {}: '{}'", label, value);
    }
    Ok(())
}

impl FromStr for RepoId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (owner, repo) = s
            .split_once('/')
            .ok_or_else(|| anyhow::anyhow!("invalid repository '{}': expected owner/repo", s))?;
        Self::new(owner, repo)
    }
}

impl fmt::Display for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.repo)
    }
}

/// The four summaries the pipeline can produce for a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummaryKind {
    Readme,
    Commits,
    Issues,
    PullRequests,
}

impl SummaryKind {
    pub const ALL: [SummaryKind; 4] = [
        SummaryKind::Readme,
        SummaryKind::Commits,
        SummaryKind::Issues,
        SummaryKind::PullRequests,
    ];

    /// Name used on disk and in HTTP paths (`readme`, `pull_requests`, ...).
    pub fn as_str(&self) -> &'static str {
        match self {
            SummaryKind::Readme => "readme",
            SummaryKind::Commits => "commits",
            SummaryKind::Issues => "issues",
            SummaryKind::PullRequests => "pull_requests",
        }
    }

    /// JSON-RPC method that produces this summary.
    pub fn method(&self) -> &'static str {
        match self {
            SummaryKind::Readme => "summarize.readme",
            SummaryKind::Commits => "summarize.commits",
            SummaryKind::Issues => "summarize.issues",
            SummaryKind::PullRequests => "summarize.pull_requests",
        }
    }

    /// File name of the stored summary document.
    pub fn file_name(&self) -> String {
        format!("{}_summary.json", self.as_str())
    }
}

impl FromStr for SummaryKind {
    type Err = anyhow::Error;

    /// Accepts the canonical names, the HTTP alias `pulls`, and the stored
    /// file stem (`readme_summary`).
    fn from_str(s: &str) -> Result<Self> {
        let name = s.strip_suffix("_summary").unwrap_or(s);
        match name {
            "readme" => Ok(SummaryKind::Readme),
            "commits" => Ok(SummaryKind::Commits),
            "issues" => Ok(SummaryKind::Issues),
            "pull_requests" | "pulls" => Ok(SummaryKind::PullRequests),
            other => bail!(
                "unknown summary kind '{}': expected readme, commits, issues, or pull_requests",
                other
            ),
        }
    }
}

impl fmt::Display for SummaryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Repository facts fetched alongside the data being summarized.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RepoMetadata {
    pub full_name: String,
    pub description: String,
    pub stars: u64,
    pub forks: u64,
    pub open_issues: u64,
    pub language: String,
    pub license: String,
    pub updated_at: String,
    pub watchers: u64,
}

/// A persisted summary: free-form metadata plus the generated text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryDocument {
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub summary: String,
}

/// One stored summary as reported by a directory scan.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SummaryEntry {
    pub owner: String,
    pub repo: String,
    pub mode: SummaryKind,
}
