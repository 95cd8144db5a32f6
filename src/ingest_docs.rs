//! Atomic documentation ingestion.
//!
//! For each repository spec the ingester resolves a ref, walks the git
//! tree through include/exclude globs, splits each selected file with the
//! markdown-aware splitter, embeds every non-blank chunk, and stages the
//! results in a [`DocumentBatchWriter`]. The commit replaces all prior
//! chunks for the repository in one transaction, so searches never observe
//! a mixture of old and new chunks and deleted files disappear on the next
//! run.

use anyhow::{Context, Result};
use pgvector::Vector;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::Arc;

use crate::gitrepo::{GitRepo, RepoConfig};
use crate::llm::Embedder;
use crate::models::{DocType, DocumentChunk};
use crate::splitter::{markdown_separators, RecursiveSplitter};
use crate::store::Store;

/// Default file selection and volume bounds.
pub const DEFAULT_INCLUDE_GLOBS: &[&str] = &["**/*.md", "**/*.mdx", "README.md"];
pub const DEFAULT_EXCLUDE_GLOBS: &[&str] = &["**/.git/**"];
pub const DEFAULT_MAX_FILES: usize = 200;
pub const DEFAULT_MAX_CHUNKS: usize = 1500;
pub const DEFAULT_CHUNK_SIZE: usize = 1000;
pub const DEFAULT_CHUNK_OVERLAP: usize = 100;

/// One repository to ingest.
#[derive(Debug, Clone)]
pub struct RepoSpec {
    /// Repository identifier, e.g. `acme/platform` or a full URL.
    pub name: String,
    /// Local clone path.
    pub path: PathBuf,
    /// Optional ref; HEAD when absent.
    pub git_ref: Option<String>,
    /// Optional component label attached to every chunk.
    pub component: Option<String>,
}

/// Documentation ingester.
pub struct DocsIngester {
    store: Store,
    embedder: Arc<dyn Embedder>,
    splitter: RecursiveSplitter,
    include: Vec<String>,
    exclude: Vec<String>,
    max_files: usize,
    max_chunks: usize,
}

impl DocsIngester {
    pub fn new(store: Store, embedder: Arc<dyn Embedder>) -> Self {
        DocsIngester {
            store,
            embedder,
            splitter: RecursiveSplitter::new(
                markdown_separators(),
                DEFAULT_CHUNK_SIZE,
                DEFAULT_CHUNK_OVERLAP,
            ),
            include: DEFAULT_INCLUDE_GLOBS.iter().map(|s| s.to_string()).collect(),
            exclude: DEFAULT_EXCLUDE_GLOBS.iter().map(|s| s.to_string()).collect(),
            max_files: DEFAULT_MAX_FILES,
            max_chunks: DEFAULT_MAX_CHUNKS,
        }
    }

    /// Override the include globs (`--include-path`).
    pub fn with_include(mut self, include: Vec<String>) -> Self {
        if !include.is_empty() {
            self.include = include;
        }
        self
    }

    /// Ingest every spec. Each repository commits (or rolls back)
    /// independently.
    pub async fn run(&self, repos: &[RepoSpec]) -> Result<()> {
        for spec in repos {
            self.ingest_repo(spec)
                .await
                .with_context(|| format!("ingest docs for {}", spec.name))?;
        }
        Ok(())
    }

    async fn ingest_repo(&self, spec: &RepoSpec) -> Result<()> {
        let repo = GitRepo::new(RepoConfig::new(String::new(), spec.path.clone()));

        let git_ref = match spec.git_ref.as_deref().filter(|r| !r.is_empty() && *r != "HEAD") {
            Some(r) => r.to_string(),
            None => repo.head_sha().await?,
        };

        let files = repo.list_files(&git_ref).await?;
        let include = globs_to_regex(&self.include)?;
        let exclude = globs_to_regex(&self.exclude)?;
        let selected = filter_files(&files, include.as_ref(), exclude.as_ref(), self.max_files);

        tracing::info!(
            repo = %spec.name,
            git_ref = %git_ref,
            files_total = files.len(),
            files_selected = selected.len(),
            "docs: scanning repository"
        );

        let mut writer = self.store.document_batch_writer(&spec.name).await?;
        match self
            .stage_repo(spec, &repo, &git_ref, &selected, &mut writer)
            .await
        {
            Ok(chunks) => {
                writer.commit().await?;
                tracing::info!(repo = %spec.name, chunks, "docs: replaced repository chunks");
                Ok(())
            }
            Err(err) => {
                // Prior rows stay intact; the staging area is discarded.
                if let Err(rollback_err) = writer.rollback().await {
                    tracing::warn!(repo = %spec.name, error = %rollback_err, "docs: rollback failed");
                }
                Err(err)
            }
        }
    }

    async fn stage_repo(
        &self,
        spec: &RepoSpec,
        repo: &GitRepo,
        git_ref: &str,
        selected: &[String],
        writer: &mut crate::store::DocumentBatchWriter,
    ) -> Result<usize> {
        let mut total_chunks = 0usize;

        'files: for path in selected {
            let content = match repo.show_file(git_ref, path).await {
                Ok(content) => content,
                Err(err) => {
                    // Tree listing and blob reads can race with fetches;
                    // an unreadable file is skipped, not fatal.
                    tracing::warn!(repo = %spec.name, path = %path, error = %err, "docs: cannot read file");
                    continue;
                }
            };

            let parts = self.splitter.split(&content);
            for (idx, part) in parts.iter().enumerate() {
                if part.trim().is_empty() {
                    continue;
                }
                if total_chunks >= self.max_chunks {
                    tracing::warn!(
                        repo = %spec.name,
                        max_chunks = self.max_chunks,
                        "docs: chunk budget reached, truncating ingestion"
                    );
                    break 'files;
                }

                let vectors = self.embedder.embed_texts(&[part.clone()]).await?;
                let vector = vectors
                    .into_iter()
                    .next()
                    .context("embedding provider returned no vectors")?;

                let chunk = DocumentChunk {
                    id: chunk_id(&spec.name, path, git_ref, idx, part),
                    repo: spec.name.clone(),
                    component: spec.component.clone(),
                    path: path.clone(),
                    commit_sha: git_ref.to_string(),
                    doc_type: classify_doc_type(path),
                    chunk_index: idx as i32,
                    chunk_text: part.clone(),
                    embedding: Vector::from(vector),
                    embedding_model: self.embedder.model_name().to_string(),
                    source_url: guess_source_url(&spec.name, path, git_ref),
                };
                writer.add(&chunk).await?;
                total_chunks += 1;
            }
        }

        Ok(total_chunks)
    }
}

/// Content-addressed chunk id: SHA-256 of repo, path, ref, index, and text.
pub fn chunk_id(repo: &str, path: &str, git_ref: &str, index: usize, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(repo.as_bytes());
    hasher.update(b":");
    hasher.update(path.as_bytes());
    hasher.update(b":");
    hasher.update(git_ref.as_bytes());
    hasher.update(b":");
    hasher.update(index.to_string().as_bytes());
    hasher.update(b":");
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Classify a documentation file by its repo-relative path.
pub fn classify_doc_type(path: &str) -> DocType {
    let lower = path.to_lowercase();
    let base = lower.rsplit('/').next().unwrap_or(&lower);
    if base == "readme.md" {
        return DocType::Readme;
    }
    if lower.contains("/runbook") || lower.starts_with("runbook") {
        return DocType::Runbook;
    }
    if lower.contains("/adr/") || lower.starts_with("adr/") {
        return DocType::Adr;
    }
    if lower.contains("/docs/") || lower.starts_with("docs/") {
        return DocType::Docs;
    }
    DocType::Other
}

/// Web URL for a chunk's source file, when the repo looks like an
/// `owner/name` slug or a forge URL.
pub fn guess_source_url(repo: &str, path: &str, git_ref: &str) -> Option<String> {
    if repo.starts_with("http://") || repo.starts_with("https://") {
        let base = repo.trim_end_matches('/').trim_end_matches(".git");
        return Some(format!("{}/blob/{}/{}", base, git_ref, path));
    }
    if repo.contains('/') {
        return Some(format!(
            "https://github.com/{}/blob/{}/{}",
            repo, git_ref, path
        ));
    }
    None
}

/// Translate glob patterns into one anchored alternation regex.
///
/// `**/` matches zero or more directories, `**` any characters, `*` any
/// characters except `/`; all other metacharacters are literal. `None`
/// means "no patterns": an absent include list selects every file, and an
/// absent exclude list excludes none.
pub fn globs_to_regex(globs: &[String]) -> Result<Option<Regex>> {
    let mut parts = Vec::new();
    for glob in globs {
        let glob = glob.trim();
        if glob.is_empty() {
            continue;
        }
        parts.push(format!("^{}$", glob_to_regex_body(glob)));
    }
    if parts.is_empty() {
        return Ok(None);
    }
    let pattern = parts.join("|");
    let regex = Regex::new(&pattern)
        .with_context(|| format!("invalid glob translation: {}", pattern))?;
    Ok(Some(regex))
}

fn glob_to_regex_body(glob: &str) -> String {
    let mut out = String::with_capacity(glob.len() * 2);
    let bytes = glob.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if glob[i..].starts_with("**/") {
            out.push_str("(?:[^/]+/)*");
            i += 3;
        } else if glob[i..].starts_with("**") {
            out.push_str(".*");
            i += 2;
        } else if bytes[i] == b'*' {
            out.push_str("[^/]*");
            i += 1;
        } else {
            let ch = glob[i..].chars().next().expect("in-bounds char");
            out.push_str(&regex::escape(&ch.to_string()));
            i += ch.len_utf8();
        }
    }
    out
}

/// Apply include and exclude filters, keeping at most `max` files.
pub fn filter_files(
    files: &[String],
    include: Option<&Regex>,
    exclude: Option<&Regex>,
    max: usize,
) -> Vec<String> {
    let mut out = Vec::new();
    for file in files {
        if let Some(include) = include {
            if !include.is_match(file) {
                continue;
            }
        }
        if let Some(exclude) = exclude {
            if exclude.is_match(file) {
                continue;
            }
        }
        out.push(file.clone());
        if max > 0 && out.len() >= max {
            break;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn regex_for(globs: &[&str]) -> Regex {
        let globs: Vec<String> = globs.iter().map(|s| s.to_string()).collect();
        globs_to_regex(&globs).unwrap().unwrap()
    }

    #[test]
    fn test_glob_double_star_slash_matches_any_depth() {
        let rx = regex_for(&["**/*.md"]);
        assert!(rx.is_match("README.md"));
        assert!(rx.is_match("docs/guide.md"));
        assert!(rx.is_match("a/b/c/deep.md"));
        assert!(!rx.is_match("docs/guide.txt"));
    }

    #[test]
    fn test_glob_single_star_stops_at_slash() {
        let rx = regex_for(&["docs/*.md"]);
        assert!(rx.is_match("docs/guide.md"));
        assert!(!rx.is_match("docs/sub/guide.md"));
        assert!(!rx.is_match("other/guide.md"));
    }

    #[test]
    fn test_glob_metacharacters_are_literal() {
        let rx = regex_for(&["docs/a+b.md"]);
        assert!(rx.is_match("docs/a+b.md"));
        assert!(!rx.is_match("docs/aab.md"));
    }

    #[test]
    fn test_glob_exclude_git_dir() {
        let rx = regex_for(&["**/.git/**"]);
        assert!(rx.is_match(".git/config"));
        assert!(rx.is_match("sub/.git/objects/ab"));
        assert!(!rx.is_match("docs/git-usage.md"));
    }

    #[test]
    fn test_missing_patterns_mean_no_filter() {
        assert!(globs_to_regex(&[]).unwrap().is_none());
        assert!(globs_to_regex(&["  ".to_string()]).unwrap().is_none());
    }

    #[test]
    fn test_filter_files_applies_both_and_caps() {
        let files: Vec<String> = vec![
            "README.md".into(),
            "docs/a.md".into(),
            ".git/config".into(),
            "docs/b.md".into(),
            "src/main.rs".into(),
        ];
        let include = regex_for(&["**/*.md", "README.md"]);
        let exclude = regex_for(&["**/.git/**"]);
        let selected = filter_files(&files, Some(&include), Some(&exclude), 2);
        assert_eq!(selected, vec!["README.md".to_string(), "docs/a.md".to_string()]);
    }

    #[test]
    fn test_classify_doc_type() {
        assert_eq!(classify_doc_type("README.md"), DocType::Readme);
        assert_eq!(classify_doc_type("backend/README.md"), DocType::Readme);
        assert_eq!(classify_doc_type("docs/setup.md"), DocType::Docs);
        assert_eq!(classify_doc_type("docs/adr/0001-records.md"), DocType::Adr);
        assert_eq!(classify_doc_type("runbooks/oncall.md"), DocType::Runbook);
        assert_eq!(classify_doc_type("CONTRIBUTING.md"), DocType::Other);
    }

    #[test]
    fn test_chunk_id_is_content_addressed() {
        let a = chunk_id("acme/platform", "docs/a.md", "abc", 0, "text");
        let b = chunk_id("acme/platform", "docs/a.md", "abc", 0, "text");
        let c = chunk_id("acme/platform", "docs/a.md", "abc", 1, "text");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_guess_source_url() {
        assert_eq!(
            guess_source_url("acme/platform", "docs/a.md", "abc").unwrap(),
            "https://github.com/acme/platform/blob/abc/docs/a.md"
        );
        assert_eq!(
            guess_source_url("https://github.com/acme/platform.git", "docs/a.md", "abc").unwrap(),
            "https://github.com/acme/platform/blob/abc/docs/a.md"
        );
        assert_eq!(guess_source_url("platform", "docs/a.md", "abc"), None);
    }
}
