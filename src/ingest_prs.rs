//! Two-phase pull request ingestion.
//!
//! **CACHE** walks the hosting API newest-updated first and stores
//! metadata-only rows until it either accumulates `github_fetch_max` new
//! PRs or reaches one it has already stored (the frontier). **PROCESS**
//! drains unprocessed rows strictly sequentially: diff analysis first (so
//! the embedding input can include the rich summary), then embedding, then
//! a single-row outcome update. **FULL** is CACHE followed by PROCESS.
//!
//! The frontier heuristic relies on the API's reverse-chronological
//! ordering; when an already-stored PR is encountered the scan stops and
//! logs it. Late-arriving updates to older PRs can therefore be missed;
//! accepted, documented behavior.

use anyhow::{Context, Result};
use pgvector::Vector;
use std::sync::Arc;

use crate::config::Config;
use crate::diff::{Analyzer, DiffConfig, PrMetadata};
use crate::github::GitHubFetcher;
use crate::llm::{Embedder, LlmError};
use crate::models::{FailureCategory, NewPrRecord, PrRecord};
use crate::store::Store;

/// Truncation limits for the embedding input document.
const MAX_BODY_CHARS: usize = 2000;
const MAX_ANALYSIS_CHARS: usize = 3000;

/// Execution mode for one `ingest prs` run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Full,
    Cache,
    Process,
}

impl ExecutionMode {
    pub fn parse(value: &str) -> Result<Self> {
        match value.to_uppercase().as_str() {
            "FULL" | "" => Ok(ExecutionMode::Full),
            "CACHE" => Ok(ExecutionMode::Cache),
            "PROCESS" => Ok(ExecutionMode::Process),
            other => anyhow::bail!(
                "invalid execution mode: {} (must be FULL, CACHE, or PROCESS)",
                other
            ),
        }
    }
}

/// Orchestrates both ingestion phases against the shared store.
pub struct Generator {
    cfg: Config,
    store: Store,
    embedder: Arc<dyn Embedder>,
    fetcher: GitHubFetcher,
    retry_failed: bool,
}

impl Generator {
    pub fn new(
        cfg: Config,
        store: Store,
        embedder: Arc<dyn Embedder>,
        fetcher: GitHubFetcher,
        retry_failed: bool,
    ) -> Self {
        Generator {
            cfg,
            store,
            embedder,
            fetcher,
            retry_failed,
        }
    }

    pub async fn run(&self) -> Result<()> {
        match ExecutionMode::parse(&self.cfg.execution_mode)? {
            ExecutionMode::Cache => self.run_cache().await,
            ExecutionMode::Process => self.run_process().await,
            ExecutionMode::Full => {
                tracing::info!("full mode: caching PRs, then processing them");
                self.run_cache().await.context("cache phase")?;
                self.run_process().await.context("process phase")?;
                Ok(())
            }
        }
    }

    /// CACHE phase: store metadata for unseen merged PRs, newest first.
    pub async fn run_cache(&self) -> Result<()> {
        tracing::info!("cache mode: fetching and storing PR metadata only");

        let new_prs = self.fetch_new_prs().await?;
        if new_prs.is_empty() {
            tracing::info!("cache: no new PRs to store");
            return Ok(());
        }

        for pr in &new_prs {
            self.store
                .store_pr(pr)
                .await
                .with_context(|| format!("store PR #{}", pr.pr_number))?;
            tracing::info!(pr = pr.pr_number, "cache: stored PR (unprocessed)");
        }

        tracing::info!(count = new_prs.len(), "cached new PRs without processing");
        Ok(())
    }

    /// Scan API pages newest-updated first, stopping at the first PR that
    /// is already stored or when `github_fetch_max` new PRs accumulate.
    async fn fetch_new_prs(&self) -> Result<Vec<NewPrRecord>> {
        let mut new_prs: Vec<NewPrRecord> = Vec::new();
        let mut page: u32 = 1;
        let mut total_fetched = 0usize;

        'pages: while new_prs.len() < self.cfg.github_fetch_max {
            let result = self
                .fetcher
                .fetch_page(page)
                .await
                .with_context(|| format!("fetch PR page {}", page))?;

            if result.prs.is_empty() && !result.has_more {
                break;
            }
            total_fetched += result.prs.len();

            for pr in result.prs {
                if new_prs.len() >= self.cfg.github_fetch_max {
                    break 'pages;
                }
                if self.store.has_pr(pr.number).await? {
                    // The scan is newest-first, so the first stored PR is
                    // the frontier: everything older is assumed present.
                    tracing::info!(pr = pr.number, "cache: reached already-stored PR, stopping scan");
                    break 'pages;
                }
                new_prs.push(NewPrRecord {
                    pr_number: pr.number,
                    pr_title: pr.title,
                    pr_body: pr.body,
                    author: pr.author,
                    created_at: pr.created_at,
                    merged_at: pr.merged_at,
                    state: pr.state,
                    base_ref: pr.base_ref,
                    github_base_sha: none_if_blank(pr.base_sha),
                    head_commit_sha: none_if_blank(pr.head_sha),
                    merge_commit_sha: none_if_blank(pr.merge_commit_sha),
                });
            }

            if !result.has_more {
                break;
            }
            page += 1;
        }

        tracing::info!(
            fetched = total_fetched,
            new = new_prs.len(),
            "cache: scan complete"
        );
        Ok(new_prs)
    }

    /// PROCESS phase: analyze and embed unprocessed rows sequentially.
    /// No parallelism at this layer; the LLM is the bottleneck resource.
    pub async fn run_process(&self) -> Result<()> {
        let limit = if self.cfg.max_process_batch > 0 {
            self.cfg.max_process_batch
        } else {
            self.cfg.github_fetch_max as i64
        };

        let unprocessed = self.store.count_unprocessed_prs(self.retry_failed).await?;
        tracing::info!(
            unprocessed,
            limit,
            retry_failed = self.retry_failed,
            "process mode: scanning for work"
        );
        if unprocessed == 0 {
            tracing::info!("process: no unprocessed PRs found");
            return Ok(());
        }

        let prs = self
            .store
            .get_unprocessed_prs(limit, self.retry_failed)
            .await?;
        tracing::info!(count = prs.len(), "process: processing PRs sequentially");

        let analyzer = if self.cfg.diff_analysis_enabled {
            Some(
                Analyzer::new(DiffConfig {
                    enabled: true,
                    model_name: self.cfg.diff_analysis_model.clone(),
                    ollama_url: self.cfg.diff_analysis_ollama_url.clone(),
                    repo_path: self.cfg.platform_repo_path(),
                    repo_url: self.cfg.repository_url.clone(),
                    max_context_tokens: self.cfg.diff_analysis_context_tokens,
                    call_timeout: self.cfg.llm_timeout()?,
                })
                .context("init diff analyzer")?,
            )
        } else {
            None
        };

        let mut processed = 0usize;
        for pr in &prs {
            self.process_single_pr(pr, analyzer.as_ref())
                .await
                .with_context(|| format!("failed processing PR #{}", pr.pr_number))?;
            processed += 1;
        }

        tracing::info!(processed, "process: completed");
        Ok(())
    }

    /// Process one PR: analysis first so its narrative can enrich the
    /// embedding input, then embed, then record the outcome.
    async fn process_single_pr(&self, pr: &PrRecord, analyzer: Option<&Analyzer>) -> Result<()> {
        let analysis = match analyzer {
            Some(analyzer) => {
                tracing::info!(pr = pr.pr_number, "process: analyzing diff");
                analyzer
                    .analyze(&PrMetadata {
                        number: pr.pr_number,
                        title: pr.pr_title.clone(),
                        body: pr.pr_body.clone(),
                        merge_commit_sha: pr.merge_commit_sha.clone(),
                    })
                    .await
            }
            None => crate::diff::Analysis {
                rich_description: None,
                analysis_successful: false,
                failure_reason: Some("diff analyzer disabled".to_string()),
                failure_category: Some(FailureCategory::Disabled),
            },
        };

        tracing::info!(pr = pr.pr_number, "process: generating embedding");
        let document = build_pr_document(
            &pr.pr_title,
            &pr.pr_body,
            analysis.rich_description.as_deref().unwrap_or(""),
        );

        let vectors = match self.embedder.embed_texts(&[document]).await {
            Ok(vectors) => vectors,
            Err(err) => {
                let category = embed_failure_category(&err);
                tracing::error!(pr = pr.pr_number, error = %err, category = %category, "process: embedding failed");
                self.store
                    .update_pr_processing(
                        pr.pr_number,
                        None,
                        analysis.rich_description.as_deref(),
                        false,
                        Some(&err.to_string()),
                        Some(category),
                    )
                    .await?;
                return Ok(());
            }
        };

        let Some(vector) = vectors.into_iter().next() else {
            let reason = format!("embedding provider returned no vectors for PR #{}", pr.pr_number);
            self.store
                .update_pr_processing(
                    pr.pr_number,
                    None,
                    analysis.rich_description.as_deref(),
                    false,
                    Some(&reason),
                    Some(FailureCategory::EmptyEmbedding),
                )
                .await?;
            return Ok(());
        };

        let embedding = Vector::from(vector);
        self.store
            .update_pr_processing(
                pr.pr_number,
                Some(&embedding),
                analysis.rich_description.as_deref(),
                analysis.analysis_successful,
                analysis.failure_reason.as_deref(),
                analysis.failure_category,
            )
            .await?;

        tracing::info!(
            pr = pr.pr_number,
            analysis_successful = analysis.analysis_successful,
            "process: completed PR"
        );
        Ok(())
    }
}

/// Categorize an embedding failure for the stored outcome.
fn embed_failure_category(err: &LlmError) -> FailureCategory {
    match err {
        LlmError::Timeout { .. } => FailureCategory::Timeout,
        LlmError::EmptyResponse { .. } => FailureCategory::EmptyEmbedding,
        _ => FailureCategory::Error,
    }
}

/// Build the embedding input document for a PR.
///
/// Body is capped at 2000 characters and the analysis narrative at 3000,
/// both on character boundaries.
pub fn build_pr_document(title: &str, body: &str, rich_description: &str) -> String {
    let mut doc = String::with_capacity(title.len() + body.len().min(MAX_BODY_CHARS) + 64);
    doc.push_str("PR Title: ");
    doc.push_str(title);
    doc.push_str("\n\nPR Description: ");
    doc.push_str(truncate_chars(body, MAX_BODY_CHARS));
    if !rich_description.is_empty() {
        doc.push_str("\n\nAI Analysis: ");
        doc.push_str(truncate_chars(rich_description, MAX_ANALYSIS_CHARS));
    }
    doc
}

/// Truncate to at most `max` bytes without splitting a character.
fn truncate_chars(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

fn none_if_blank(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_document_without_analysis() {
        let doc = build_pr_document("Fix bug", "Body text", "");
        assert_eq!(doc, "PR Title: Fix bug\n\nPR Description: Body text");
        assert!(!doc.contains("AI Analysis"));
    }

    #[test]
    fn test_build_document_with_analysis() {
        let doc = build_pr_document("Fix bug", "Body", "## Pull Request Analysis: Fix bug\n\nDetails");
        assert!(doc.starts_with("PR Title: Fix bug"));
        assert!(doc.contains("\n\nAI Analysis: ## Pull Request Analysis"));
    }

    #[test]
    fn test_build_document_truncates_body() {
        let body = "x".repeat(5000);
        let doc = build_pr_document("T", &body, "");
        let description = doc.split("PR Description: ").nth(1).unwrap();
        assert_eq!(description.len(), MAX_BODY_CHARS);
    }

    #[test]
    fn test_build_document_truncates_analysis() {
        let analysis = "y".repeat(9000);
        let doc = build_pr_document("T", "b", &analysis);
        let tail = doc.split("AI Analysis: ").nth(1).unwrap();
        assert_eq!(tail.len(), MAX_ANALYSIS_CHARS);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        let text = "é".repeat(1200); // 2 bytes per char
        let out = truncate_chars(&text, 2001);
        assert_eq!(out.len(), 2000);
        assert!(out.chars().all(|c| c == 'é'));
    }

    #[test]
    fn test_execution_mode_parse() {
        assert_eq!(ExecutionMode::parse("full").unwrap(), ExecutionMode::Full);
        assert_eq!(ExecutionMode::parse("CACHE").unwrap(), ExecutionMode::Cache);
        assert_eq!(ExecutionMode::parse("Process").unwrap(), ExecutionMode::Process);
        assert!(ExecutionMode::parse("BATCH").is_err());
    }

    #[test]
    fn test_embed_failure_categories() {
        let timeout = LlmError::Timeout {
            operation: "embed".into(),
            timeout: std::time::Duration::from_secs(1),
        };
        assert_eq!(embed_failure_category(&timeout), FailureCategory::Timeout);

        let empty = LlmError::EmptyResponse {
            operation: "embed".into(),
        };
        assert_eq!(embed_failure_category(&empty), FailureCategory::EmptyEmbedding);

        let api = LlmError::Api {
            operation: "embed".into(),
            message: "503".into(),
        };
        assert_eq!(embed_failure_category(&api), FailureCategory::Error);
    }

    #[test]
    fn test_none_if_blank() {
        assert_eq!(none_if_blank(Some("  ".to_string())), None);
        assert_eq!(none_if_blank(Some("sha".to_string())), Some("sha".to_string()));
        assert_eq!(none_if_blank(None), None);
    }
}
