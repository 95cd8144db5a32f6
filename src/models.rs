//! Core data models shared across the ingestion, retrieval, and tracing
//! pipelines.
//!
//! The persisted entities map one-to-one onto the three durable tables:
//!
//! | Type | Table |
//! |------|-------|
//! | [`PrRecord`] | `pr_embeddings` |
//! | [`DocumentChunk`] | `documents` |
//! | [`TraceResult`] (as JSON) | `trace_image_cache` |
//!
//! Tool-facing result shapes ([`PrResult`], [`DocResult`]) are separate
//! serde records so the wire format never leaks storage details.

use chrono::{DateTime, Utc};
use pgvector::Vector;
use serde::{Deserialize, Serialize};

/// Vector dimension of the embedding columns. A property of the embedding
/// model; changing models means recreating the store.
pub const EMBEDDING_DIM: usize = 768;

/// Why a PR's processing did not produce a full analysis.
///
/// Stored as a lowercase string in `pr_embeddings.failure_category`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    /// The diff exceeded the hard chunk cap; never retried automatically.
    LargeDiff,
    /// An LLM call exceeded its deadline.
    Timeout,
    /// Any other processing error.
    Error,
    /// The diff analyzer was disabled by configuration.
    Disabled,
    /// The embedding provider returned no vectors.
    EmptyEmbedding,
}

impl FailureCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCategory::LargeDiff => "large_diff",
            FailureCategory::Timeout => "timeout",
            FailureCategory::Error => "error",
            FailureCategory::Disabled => "disabled",
            FailureCategory::EmptyEmbedding => "empty_embedding",
        }
    }
}

impl std::fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FailureCategory {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "large_diff" => Ok(FailureCategory::LargeDiff),
            "timeout" => Ok(FailureCategory::Timeout),
            "error" => Ok(FailureCategory::Error),
            "disabled" => Ok(FailureCategory::Disabled),
            "empty_embedding" => Ok(FailureCategory::EmptyEmbedding),
            other => Err(format!("unknown failure category: {}", other)),
        }
    }
}

/// A pull request row in `pr_embeddings`.
///
/// `processed_at IS NULL` marks the row as not yet processed. Processed
/// rows carry either a non-null embedding or a failure reason + category.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PrRecord {
    pub id: i64,
    pub pr_number: i32,
    pub pr_title: String,
    pub pr_body: String,
    pub author: String,
    pub created_at: DateTime<Utc>,
    pub merged_at: Option<DateTime<Utc>>,
    pub state: String,
    pub base_ref: String,
    pub github_base_sha: Option<String>,
    pub base_merge_base_sha: Option<String>,
    pub head_commit_sha: Option<String>,
    pub merge_commit_sha: Option<String>,
    /// NULL until the PROCESS phase runs.
    pub embedding: Option<Vector>,
    pub rich_description: Option<String>,
    pub analysis_successful: bool,
    pub failure_reason: Option<String>,
    pub failure_category: Option<String>,
    /// NULL = needs processing.
    pub processed_at: Option<DateTime<Utc>>,
}

/// Metadata-only view used when caching new PRs from the hosting API.
#[derive(Debug, Clone)]
pub struct NewPrRecord {
    pub pr_number: i32,
    pub pr_title: String,
    pub pr_body: String,
    pub author: String,
    pub created_at: DateTime<Utc>,
    pub merged_at: Option<DateTime<Utc>>,
    pub state: String,
    pub base_ref: String,
    pub github_base_sha: Option<String>,
    pub head_commit_sha: Option<String>,
    pub merge_commit_sha: Option<String>,
}

/// Classification of a documentation file by its path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocType {
    Readme,
    Docs,
    Adr,
    Runbook,
    Other,
}

impl DocType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocType::Readme => "readme",
            DocType::Docs => "docs",
            DocType::Adr => "adr",
            DocType::Runbook => "runbook",
            DocType::Other => "other",
        }
    }
}

/// A documentation chunk row in `documents`.
///
/// The id is content-addressed: SHA-256 of
/// `repo:path:commit_sha:chunk_index:chunk_text`, so re-ingesting identical
/// content produces identical ids.
#[derive(Debug, Clone)]
pub struct DocumentChunk {
    pub id: String,
    pub repo: String,
    pub component: Option<String>,
    pub path: String,
    pub commit_sha: String,
    pub doc_type: DocType,
    pub chunk_index: i32,
    pub chunk_text: String,
    pub embedding: Vector,
    pub embedding_model: String,
    pub source_url: Option<String>,
}

/// One deployed component resolved by the image tracer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Component {
    pub name: String,
    pub registry: String,
    pub repository: String,
    pub digest: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_sha: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_repo_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Full result of tracing one `(commit, environment)` pair.
///
/// Persisted verbatim as `trace_image_cache.response_json` for clean traces.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct TraceResult {
    pub commit_sha: String,
    pub environment: String,
    pub components: Vec<Component>,
    pub errors: Vec<String>,
}

impl TraceResult {
    /// True when the trace carries a top-level or per-component error.
    /// Dirty traces are never cached.
    pub fn has_errors(&self) -> bool {
        if !self.errors.is_empty() {
            return true;
        }
        self.components
            .iter()
            .any(|c| c.error.as_deref().is_some_and(|e| !e.is_empty()))
    }
}

/// Tool-facing PR shape.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PrResult {
    pub pr_number: i32,
    pub title: String,
    pub body: String,
    pub author: String,
    pub state: String,
    pub created_at: String,
    pub merged_at: Option<String>,
    pub github_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub similarity_score: Option<f64>,
}

impl PrResult {
    /// Build a tool result from a stored row. `repository_url` supplies the
    /// web URL base; `similarity` is present only for search results.
    pub fn from_record(record: &PrRecord, similarity: Option<f64>, repository_url: &str) -> Self {
        PrResult {
            pr_number: record.pr_number,
            title: record.pr_title.clone(),
            body: record.pr_body.clone(),
            author: record.author.clone(),
            state: record.state.clone(),
            created_at: record.created_at.to_rfc3339(),
            merged_at: record.merged_at.map(|t| t.to_rfc3339()),
            github_url: format!("{}/pull/{}", repository_url.trim_end_matches('/'), record.pr_number),
            similarity_score: similarity,
        }
    }
}

/// Tool-facing documentation search hit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocResult {
    pub repo: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,
    pub path: String,
    pub commit_sha: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    pub snippet: String,
    pub similarity: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}
