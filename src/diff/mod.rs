//! Merge-diff analysis via map-reduce LLM summarization.
//!
//! Given a merged PR's metadata, the analyzer fetches the merge diff,
//! drops generated files, chunks the rest to the model's token budget,
//! summarizes each chunk (map), aggregates the summaries (reduce), and
//! composes a rich description for the embedding document.
//!
//! Failures never abort the PROCESS pipeline: every per-PR problem is
//! classified into an [`Analysis`] outcome (`timeout`, `large_diff`,
//! `disabled`, `error`) that the caller persists.

pub mod chunk;
pub mod filter;
pub mod prompts;

use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

use crate::gitrepo::{GitRepo, RepoConfig};
use crate::llm::{ChatMessage, ChatModel, LlmError, OllamaClient};
use crate::models::FailureCategory;

use chunk::{build_documents, split_diff_into_files};
use filter::{filter_generated_files, IgnorePatterns};

/// Hard cap on map-stage chunks; larger diffs are refused outright.
pub const MAX_CHUNKS: usize = 100;

/// Analyzer configuration, carved out of the application config.
#[derive(Debug, Clone)]
pub struct DiffConfig {
    pub enabled: bool,
    pub model_name: String,
    pub ollama_url: String,
    pub repo_path: std::path::PathBuf,
    pub repo_url: String,
    pub max_context_tokens: usize,
    pub call_timeout: Duration,
}

/// Outcome of analyzing one PR. Exactly one of `rich_description` or
/// `failure_reason` is meaningful, mirroring the stored row invariant.
#[derive(Debug, Clone, Default)]
pub struct Analysis {
    pub rich_description: Option<String>,
    pub analysis_successful: bool,
    pub failure_reason: Option<String>,
    pub failure_category: Option<FailureCategory>,
}

impl Analysis {
    fn failure(reason: impl Into<String>, category: FailureCategory) -> Self {
        Analysis {
            rich_description: None,
            analysis_successful: false,
            failure_reason: Some(reason.into()),
            failure_category: Some(category),
        }
    }
}

/// PR fields the analyzer needs.
#[derive(Debug, Clone)]
pub struct PrMetadata {
    pub number: i32,
    pub title: String,
    pub body: String,
    pub merge_commit_sha: Option<String>,
}

/// Map an LLM error to `(reason, category)` for the stored outcome.
fn classify_llm_error(err: &LlmError) -> (String, FailureCategory) {
    if err.is_timeout() {
        (err.to_string(), FailureCategory::Timeout)
    } else {
        (err.to_string(), FailureCategory::Error)
    }
}

/// The diff analyzer. Holds the platform repository handle and the chat
/// model used for both stages.
pub struct Analyzer {
    cfg: DiffConfig,
    repo: GitRepo,
    chat: Arc<dyn ChatModel>,
    patterns: IgnorePatterns,
}

impl Analyzer {
    pub fn new(cfg: DiffConfig) -> Result<Self> {
        if cfg.enabled && cfg.model_name.is_empty() {
            anyhow::bail!("diff analysis model name is required");
        }
        let chat: Arc<dyn ChatModel> = Arc::new(OllamaClient::new(
            &cfg.ollama_url,
            &cfg.model_name,
            cfg.call_timeout,
        ));
        let repo = GitRepo::new(RepoConfig::new(cfg.repo_url.clone(), cfg.repo_path.clone()));
        Ok(Analyzer {
            cfg,
            repo,
            chat,
            patterns: IgnorePatterns::new(),
        })
    }

    /// Test seam: analyzer with an injected chat model.
    pub fn with_chat(cfg: DiffConfig, chat: Arc<dyn ChatModel>) -> Self {
        let repo = GitRepo::new(RepoConfig::new(cfg.repo_url.clone(), cfg.repo_path.clone()));
        Analyzer {
            cfg,
            repo,
            chat,
            patterns: IgnorePatterns::new(),
        }
    }

    /// Analyze one merged PR end to end: fetch the merge diff, then
    /// summarize it.
    pub async fn analyze(&self, meta: &PrMetadata) -> Analysis {
        if !self.cfg.enabled {
            tracing::info!(pr = meta.number, "diff analyzer disabled");
            return Analysis::failure("diff analyzer disabled", FailureCategory::Disabled);
        }

        let diff_text = match self.fetch_consolidated_diff(meta).await {
            Ok(text) => text,
            Err(err) => {
                tracing::error!(pr = meta.number, error = %err, "fetch diff failed");
                return Analysis::failure(err.to_string(), FailureCategory::Error);
            }
        };

        self.summarize_diff(&diff_text, meta).await
    }

    /// Fetch the consolidated diff for the PR's merge commit.
    async fn fetch_consolidated_diff(&self, meta: &PrMetadata) -> Result<String> {
        if meta.number == 0 {
            anyhow::bail!("missing PR number");
        }

        self.repo.ensure().await?;
        self.repo.ensure_pr_fetch_spec().await?;
        // Fetch again so refs added by the fetch-spec are present locally.
        self.repo.fetch().await?;

        let Some(merge_sha) = meta.merge_commit_sha.as_deref().filter(|s| !s.is_empty()) else {
            anyhow::bail!("merged PR with no merge commit available");
        };

        let diff = self.repo.merge_diff(merge_sha).await?;
        if diff.trim().is_empty() {
            anyhow::bail!("empty diff");
        }
        Ok(diff)
    }

    /// Summarize an already-fetched diff. Split from [`analyze`] so tests
    /// can drive it with fixture diffs and a fake chat model.
    pub async fn summarize_diff(&self, diff_text: &str, meta: &PrMetadata) -> Analysis {
        let file_chunks = split_diff_into_files(diff_text);
        if file_chunks.is_empty() {
            return Analysis::failure("no diff content", FailureCategory::Error);
        }

        let total_files = file_chunks.len();
        let (included, skipped) = filter_generated_files(file_chunks, &self.patterns);
        if included.is_empty() {
            return Analysis::failure("all files filtered as generated", FailureCategory::Error);
        }

        let (docs, mut stats) = build_documents(&included, self.cfg.max_context_tokens);
        stats.files_total = total_files;
        stats.files_filtered = skipped.len();

        tracing::info!(
            pr = meta.number,
            files_total = stats.files_total,
            files_included = stats.files_included,
            files_filtered = stats.files_filtered,
            max_tokens = stats.max_tokens,
            median_tokens = stats.median_tokens,
            "diff prep stats"
        );

        if docs.len() > MAX_CHUNKS {
            tracing::error!(pr = meta.number, chunks = docs.len(), "large diff detected");
            return Analysis::failure("large diff detected", FailureCategory::LargeDiff);
        }

        let mut map_summaries = Vec::with_capacity(docs.len());
        for (idx, doc) in docs.iter().enumerate() {
            tracing::debug!(
                pr = meta.number,
                chunk = idx + 1,
                total = docs.len(),
                file = %doc.file_path,
                "mapping chunk"
            );
            let prompt = prompts::map_prompt(&meta.title, &doc.file_path, &doc.content);
            match self.chat.generate(&[ChatMessage::user(prompt)]).await {
                Ok(summary) => map_summaries.push(summary),
                Err(err) => {
                    tracing::error!(pr = meta.number, file = %doc.file_path, error = %err, "map stage failed");
                    let (reason, category) = classify_llm_error(&err);
                    return Analysis::failure(reason, category);
                }
            }
        }

        let joined = map_summaries.join("\n");
        let prompt = prompts::reduce_prompt(&meta.title, &meta.body, &joined);
        let reduced = match self.chat.generate(&[ChatMessage::user(prompt)]).await {
            Ok(text) => text,
            Err(err) => {
                tracing::error!(pr = meta.number, error = %err, "reduce stage failed");
                let (reason, category) = classify_llm_error(&err);
                return Analysis::failure(reason, category);
            }
        };

        let rich_description = format!(
            "## Pull Request Analysis: {}\n\n{}",
            meta.title,
            reduced.trim()
        );

        Analysis {
            rich_description: Some(rich_description),
            analysis_successful: true,
            failure_reason: None,
            failure_category: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct ScriptedChat {
        responses: Mutex<Vec<Result<String, LlmError>>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedChat {
        fn new(responses: Vec<Result<String, LlmError>>) -> Self {
            ScriptedChat {
                responses: Mutex::new(responses),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ChatModel for ScriptedChat {
        async fn generate(&self, messages: &[ChatMessage]) -> Result<String, LlmError> {
            self.calls
                .lock()
                .unwrap()
                .push(messages[0].content.clone());
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                return Ok("unscripted".to_string());
            }
            responses.remove(0)
        }
    }

    fn test_config(enabled: bool) -> DiffConfig {
        DiffConfig {
            enabled,
            model_name: "test-model".to_string(),
            ollama_url: "http://localhost:11434".to_string(),
            repo_path: std::path::PathBuf::from("/nonexistent"),
            repo_url: String::new(),
            max_context_tokens: 4096,
            call_timeout: Duration::from_secs(1),
        }
    }

    fn meta() -> PrMetadata {
        PrMetadata {
            number: 7,
            title: "Add health endpoint".to_string(),
            body: "Adds /healthz".to_string(),
            merge_commit_sha: Some("abc123".to_string()),
        }
    }

    const SIMPLE_DIFF: &str = "diff --git a/server.go b/server.go\n@@ -1 +1,2 @@\n server\n+healthz\n";

    #[tokio::test]
    async fn test_disabled_analyzer_reports_disabled() {
        let analyzer = Analyzer::with_chat(test_config(false), Arc::new(ScriptedChat::new(vec![])));
        let analysis = analyzer.analyze(&meta()).await;
        assert!(!analysis.analysis_successful);
        assert_eq!(analysis.failure_category, Some(FailureCategory::Disabled));
        assert_eq!(analysis.failure_reason.as_deref(), Some("diff analyzer disabled"));
    }

    #[tokio::test]
    async fn test_map_reduce_success_composes_description() {
        let chat = Arc::new(ScriptedChat::new(vec![
            Ok("- [FILE: server.go] added healthz — \"+healthz\"".to_string()),
            Ok("### 1. Stated Purpose\nAdds a health endpoint.".to_string()),
        ]));
        let analyzer = Analyzer::with_chat(test_config(true), chat.clone());
        let analysis = analyzer.summarize_diff(SIMPLE_DIFF, &meta()).await;

        assert!(analysis.analysis_successful, "{:?}", analysis.failure_reason);
        let rich = analysis.rich_description.unwrap();
        assert!(rich.starts_with("## Pull Request Analysis: Add health endpoint\n\n"));
        assert!(rich.contains("Stated Purpose"));

        let calls = chat.calls.lock().unwrap();
        assert_eq!(calls.len(), 2, "one map call and one reduce call");
        assert!(calls[0].contains("File: server.go"));
        assert!(calls[1].contains("Adds /healthz"));
    }

    #[tokio::test]
    async fn test_map_timeout_classified_as_timeout() {
        let chat = Arc::new(ScriptedChat::new(vec![Err(LlmError::Timeout {
            operation: "generate".to_string(),
            timeout: Duration::from_secs(1),
        })]));
        let analyzer = Analyzer::with_chat(test_config(true), chat);
        let analysis = analyzer.summarize_diff(SIMPLE_DIFF, &meta()).await;
        assert!(!analysis.analysis_successful);
        assert_eq!(analysis.failure_category, Some(FailureCategory::Timeout));
    }

    #[tokio::test]
    async fn test_reduce_error_classified_as_error() {
        let chat = Arc::new(ScriptedChat::new(vec![
            Ok("- bullet".to_string()),
            Err(LlmError::Api {
                operation: "generate".to_string(),
                message: "boom".to_string(),
            }),
        ]));
        let analyzer = Analyzer::with_chat(test_config(true), chat);
        let analysis = analyzer.summarize_diff(SIMPLE_DIFF, &meta()).await;
        assert!(!analysis.analysis_successful);
        assert_eq!(analysis.failure_category, Some(FailureCategory::Error));
        assert!(analysis.failure_reason.unwrap().contains("boom"));
    }

    #[tokio::test]
    async fn test_all_generated_files_is_an_error() {
        let diff = "diff --git a/package-lock.json b/package-lock.json\n@@ -1 +1 @@\n-a\n+b\n";
        let analyzer = Analyzer::with_chat(test_config(true), Arc::new(ScriptedChat::new(vec![])));
        let analysis = analyzer.summarize_diff(diff, &meta()).await;
        assert!(!analysis.analysis_successful);
        assert_eq!(analysis.failure_category, Some(FailureCategory::Error));
        assert_eq!(
            analysis.failure_reason.as_deref(),
            Some("all files filtered as generated")
        );
    }

    #[tokio::test]
    async fn test_oversized_diff_is_large_diff() {
        let mut diff = String::new();
        for i in 0..(MAX_CHUNKS + 1) {
            diff.push_str(&format!(
                "diff --git a/f{i}.txt b/f{i}.txt\n@@ -1 +1 @@\n-x\n+y\n"
            ));
        }
        let analyzer = Analyzer::with_chat(test_config(true), Arc::new(ScriptedChat::new(vec![])));
        let analysis = analyzer.summarize_diff(&diff, &meta()).await;
        assert!(!analysis.analysis_successful);
        assert_eq!(analysis.failure_category, Some(FailureCategory::LargeDiff));
    }

    #[tokio::test]
    async fn test_empty_diff_is_no_content() {
        let analyzer = Analyzer::with_chat(test_config(true), Arc::new(ScriptedChat::new(vec![])));
        let analysis = analyzer.summarize_diff("", &meta()).await;
        assert!(!analysis.analysis_successful);
        assert_eq!(analysis.failure_reason.as_deref(), Some("no diff content"));
    }
}
