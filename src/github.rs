//! GitHub REST data source.
//!
//! [`DataSource`] is the seam the summarizer reads repository data through;
//! [`GithubClient`] implements it against the GitHub REST API (or any server
//! mounted at `github.api_url`, which is how the tests point it at a local
//! mock).
//!
//! Only the first page of each listing is fetched, capped at
//! `github.item_limit` entries.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use base64::Engine;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;

use crate::config::GithubConfig;
use crate::models::{RepoId, RepoMetadata};

/// Returned in place of README text when the repository has none.
pub const NO_README: &str = "(No README found for this repository)";

/// Read access to the repository data being summarized.
#[async_trait]
pub trait DataSource: Send + Sync {
    /// Decoded README text, or [`NO_README`] when the repository has none.
    async fn readme(&self, repo: &RepoId) -> Result<String>;

    /// Most recent commit messages, newest first.
    async fn commits(&self, repo: &RepoId) -> Result<Vec<String>>;

    /// Open issues formatted as `title - body preview`. Pull requests that
    /// the issues endpoint also returns are skipped.
    async fn issues(&self, repo: &RepoId) -> Result<Vec<String>>;

    /// Open pull requests formatted as `title - body preview`.
    async fn pull_requests(&self, repo: &RepoId) -> Result<Vec<String>>;

    async fn metadata(&self, repo: &RepoId) -> Result<RepoMetadata>;
}

pub struct GithubClient {
    api_url: String,
    token: Option<String>,
    item_limit: usize,
    body_preview_chars: usize,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct ReadmeResponse {
    #[serde(default)]
    content: String,
}

#[derive(Deserialize)]
struct CommitItem {
    commit: CommitDetail,
}

#[derive(Deserialize)]
struct CommitDetail {
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
struct IssueItem {
    #[serde(default)]
    title: String,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    pull_request: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct RepoResponse {
    #[serde(default)]
    full_name: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    stargazers_count: u64,
    #[serde(default)]
    forks_count: u64,
    #[serde(default)]
    open_issues_count: u64,
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    license: Option<LicenseInfo>,
    #[serde(default)]
    updated_at: Option<String>,
    #[serde(default)]
    watchers_count: u64,
}

#[derive(Deserialize)]
struct LicenseInfo {
    #[serde(default)]
    name: Option<String>,
}

impl GithubClient {
    /// Build a client from config, reading the token from `config.token_env`.
    pub fn from_config(config: &GithubConfig) -> Result<Self> {
        let token = std::env::var(&config.token_env)
            .ok()
            .filter(|t| !t.trim().is_empty());
        Self::new(config, token)
    }

    pub fn new(config: &GithubConfig, token: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("repo-digest/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client for GitHub")?;

        Ok(Self {
            api_url: config.api_url.trim_end_matches('/').to_string(),
            token,
            item_limit: config.item_limit,
            body_preview_chars: config.body_preview_chars,
            client,
        })
    }

    fn request(&self, repo: &RepoId, suffix: &str) -> reqwest::RequestBuilder {
        let url = format!("{}/repos/{}/{}{}", self.api_url, repo.owner, repo.repo, suffix);
        let mut req = self
            .client
            .get(url)
            .header("Accept", "application/vnd.github+json");
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        req
    }

    /// GET and decode; `Ok(None)` on 404.
    async fn get_json<T: DeserializeOwned>(
        &self,
        repo: &RepoId,
        suffix: &str,
        paged: bool,
    ) -> Result<Option<T>> {
        let mut req = self.request(repo, suffix);
        if paged {
            req = req.query(&[("per_page", self.item_limit)]);
        }

        tracing::debug!(repo = %repo, endpoint = suffix, "GitHub request");
        let resp = req
            .send()
            .await
            .with_context(|| format!("GitHub request failed for {}{}", repo, suffix))?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            bail!("GitHub API error {}: {}", status, text);
        }

        let parsed = resp
            .json::<T>()
            .await
            .with_context(|| format!("Failed to parse GitHub response for {}{}", repo, suffix))?;
        Ok(Some(parsed))
    }

    async fn get_required<T: DeserializeOwned>(
        &self,
        repo: &RepoId,
        suffix: &str,
        paged: bool,
    ) -> Result<T> {
        match self.get_json(repo, suffix, paged).await? {
            Some(value) => Ok(value),
            None => bail!("GitHub API error 404 Not Found: {}{}", repo, suffix),
        }
    }

    fn format_items(&self, items: Vec<IssueItem>) -> Vec<String> {
        items
            .into_iter()
            .filter(|item| item.pull_request.is_none())
            .take(self.item_limit)
            .map(|item| {
                let body = item.body.unwrap_or_default();
                format!("{} - {}", item.title, preview(&body, self.body_preview_chars))
            })
            .collect()
    }
}

#[async_trait]
impl DataSource for GithubClient {
    async fn readme(&self, repo: &RepoId) -> Result<String> {
        match self.get_json::<ReadmeResponse>(repo, "/readme", false).await? {
            Some(readme) => decode_content(&readme.content),
            None => Ok(NO_README.to_string()),
        }
    }

    async fn commits(&self, repo: &RepoId) -> Result<Vec<String>> {
        let items: Vec<CommitItem> = self.get_required(repo, "/commits", true).await?;
        Ok(items
            .into_iter()
            .take(self.item_limit)
            .map(|c| c.commit.message)
            .collect())
    }

    async fn issues(&self, repo: &RepoId) -> Result<Vec<String>> {
        let items: Vec<IssueItem> = self.get_required(repo, "/issues", true).await?;
        Ok(self.format_items(items))
    }

    async fn pull_requests(&self, repo: &RepoId) -> Result<Vec<String>> {
        let mut items: Vec<IssueItem> = self.get_required(repo, "/pulls", true).await?;
        // The pulls endpoint never sets the marker; clear it anyway so the
        // shared formatter keeps every entry.
        for item in &mut items {
            item.pull_request = None;
        }
        Ok(self.format_items(items))
    }

    async fn metadata(&self, repo: &RepoId) -> Result<RepoMetadata> {
        let r: RepoResponse = self.get_required(repo, "", false).await?;
        Ok(RepoMetadata {
            full_name: r.full_name,
            description: r.description.unwrap_or_default(),
            stars: r.stargazers_count,
            forks: r.forks_count,
            open_issues: r.open_issues_count,
            language: r.language.unwrap_or_default(),
            license: r
                .license
                .and_then(|l| l.name)
                .unwrap_or_else(|| "Unknown".to_string()),
            updated_at: r.updated_at.unwrap_or_default(),
            watchers: r.watchers_count,
        })
    }
}

/// Decode the base64 `content` field of a contents-API response.
///
/// GitHub wraps the encoded text at 60 columns, so whitespace is stripped
/// before decoding. Invalid UTF-8 is replaced rather than rejected.
pub fn decode_content(content: &str) -> Result<String> {
    let cleaned: String = content.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(cleaned)
        .context("README content is not valid base64")?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// First `max_chars` characters of `text`.
pub fn preview(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_wrapped_content() {
        // "Hello, README!\n" split across lines like the contents API does.
        let encoded = "SGVsbG8sIFJF\nQURNRSEK\n";
        assert_eq!(decode_content(encoded).unwrap(), "Hello, README!\n");
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_content("***").is_err());
    }

    #[test]
    fn test_preview_counts_characters() {
        assert_eq!(preview("héllo wörld", 5), "héllo");
        assert_eq!(preview("short", 100), "short");
    }

    #[test]
    fn test_format_items_skips_pull_requests() {
        let client = GithubClient::new(&GithubConfig::default(), None).unwrap();
        let items = vec![
            IssueItem {
                title: "Crash on start".into(),
                body: Some("x".repeat(150)),
                pull_request: None,
            },
            IssueItem {
                title: "Add feature".into(),
                body: None,
                pull_request: Some(serde_json::json!({"url": "..."})),
            },
            IssueItem {
                title: "Docs typo".into(),
                body: None,
                pull_request: None,
            },
        ];
        let formatted = client.format_items(items);
        assert_eq!(formatted.len(), 2);
        assert_eq!(formatted[0], format!("Crash on start - {}", "x".repeat(100)));
        assert_eq!(formatted[1], "Docs typo - ");
    }
}
