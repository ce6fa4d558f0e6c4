//! Flat-file summary store.
//!
//! Layout under the store root:
//!
//! ```text
//! <root>/<owner>/<repo>/<kind>_summary.json
//! ```
//!
//! Each file holds one [`SummaryDocument`]. Writes go to a temporary file in
//! the same directory and are renamed into place, so readers never observe a
//! partially written document.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::models::{RepoId, SummaryDocument, SummaryEntry, SummaryKind};

#[derive(Debug, Clone)]
pub struct SummaryStore {
    root: PathBuf,
}

impl SummaryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, repo: &RepoId, kind: SummaryKind) -> PathBuf {
        self.root
            .join(&repo.owner)
            .join(&repo.repo)
            .join(kind.file_name())
    }

    /// Persist `doc`, replacing any previous summary of the same kind.
    pub fn save(&self, repo: &RepoId, kind: SummaryKind, doc: &SummaryDocument) -> Result<PathBuf> {
        let path = self.path_for(repo, kind);
        let dir = path
            .parent()
            .with_context(|| format!("summary path has no parent: {}", path.display()))?;
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create summary directory: {}", dir.display()))?;

        let json = serde_json::to_string_pretty(doc)?;
        let tmp = dir.join(format!(".tmp-{}", uuid::Uuid::new_v4()));
        fs::write(&tmp, json)
            .with_context(|| format!("Failed to write summary: {}", tmp.display()))?;
        if let Err(e) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(e).with_context(|| format!("Failed to replace summary: {}", path.display()));
        }

        tracing::debug!(path = %path.display(), "summary saved");
        Ok(path)
    }

    /// Load a stored summary. `Ok(None)` when none has been written yet.
    pub fn load(&self, repo: &RepoId, kind: SummaryKind) -> Result<Option<SummaryDocument>> {
        let path = self.path_for(repo, kind);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read summary: {}", path.display()))
            }
        };
        let doc = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse summary: {}", path.display()))?;
        Ok(Some(doc))
    }

    /// Every stored summary, sorted by owner, repo, then kind.
    ///
    /// Files that do not match the `<kind>_summary.json` naming are ignored,
    /// as is a missing store root.
    pub fn list(&self) -> Result<Vec<SummaryEntry>> {
        let mut entries = Vec::new();
        for owner in subdirs(&self.root)? {
            for repo in subdirs(&self.root.join(&owner))? {
                let dir = self.root.join(&owner).join(&repo);
                let files = fs::read_dir(&dir)
                    .with_context(|| format!("Failed to read directory: {}", dir.display()))?;
                for file in files {
                    let file = file?;
                    let name = file.file_name();
                    let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                        continue;
                    };
                    if !stem.ends_with("_summary") {
                        continue;
                    }
                    if let Ok(mode) = stem.parse::<SummaryKind>() {
                        entries.push(SummaryEntry {
                            owner: owner.clone(),
                            repo: repo.clone(),
                            mode,
                        });
                    }
                }
            }
        }
        entries.sort();
        Ok(entries)
    }
}

fn subdirs(dir: &Path) -> Result<Vec<String>> {
    let read = match fs::read_dir(dir) {
        Ok(read) => read,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(e).with_context(|| format!("Failed to read directory: {}", dir.display()))
        }
    };
    let mut names = Vec::new();
    for entry in read {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if !name.starts_with('.') {
                names.push(name.to_string());
            }
        }
    }
    Ok(names)
}
