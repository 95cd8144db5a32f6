//! Retrieval tools and their registry.
//!
//! Each tool is a typed record behind the [`Tool`] trait: a name, a
//! description, a JSON Schema for its parameters, and an async `execute`.
//! The registry is keyed by name and drives both tool discovery
//! (`tools/list`) and dispatch (`tools/call`). Handlers are stateless
//! between calls; all shared handles live in [`ToolContext`].
//!
//! Input problems (blank query, non-positive pr_number, malformed commit)
//! surface as tool errors, never as transport faults; blank queries return
//! empty results without touching the embedding provider.

use anyhow::Result;
use async_trait::async_trait;
use pgvector::Vector;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::repo_basename;
use crate::gitrepo::{GitRepo, RepoConfig};
use crate::llm::Embedder;
use crate::models::{DocResult, PrResult};
use crate::store::Store;
use crate::trace_service::TraceService;
use crate::tracer::ENVIRONMENTS;

/// Shared handles for tool execution.
pub struct ToolContext {
    pub store: Store,
    pub embedder: Arc<dyn Embedder>,
    pub trace: Arc<TraceService>,
    /// Root for local clones used by full-file enrichment.
    pub cache_dir: PathBuf,
    /// Base URL for PR web links.
    pub repository_url: String,
}

/// A callable retrieval tool.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name as exposed over the wire (e.g. `search_prs`).
    fn name(&self) -> &str;

    /// One-line description for discovery.
    fn description(&self) -> &str;

    /// JSON Schema of the parameters object.
    fn parameters_schema(&self) -> Value;

    /// Execute with the raw arguments object.
    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value>;
}

/// Registry of tools keyed by name.
pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        ToolRegistry { tools: Vec::new() }
    }

    /// Registry pre-loaded with the four built-in retrieval tools.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(SearchPrsTool));
        registry.register(Box::new(SearchDocsTool));
        registry.register(Box::new(GetPrDetailsTool));
        registry.register(Box::new(TraceImagesTool));
        registry
    }

    pub fn register(&mut self, tool: Box<dyn Tool>) {
        self.tools.push(tool);
    }

    pub fn tools(&self) -> &[Box<dyn Tool>] {
        &self.tools
    }

    pub fn find(&self, name: &str) -> Option<&dyn Tool> {
        self.tools
            .iter()
            .find(|t| t.name() == name)
            .map(|t| t.as_ref())
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ── search_prs ───────────────────────────────────────────────────────────

/// Semantic PR search. Cosine distance maps to similarity via
/// `1 - distance/2` (distance lies in [0, 2]); ordering is preserved.
pub struct SearchPrsTool;

#[async_trait]
impl Tool for SearchPrsTool {
    fn name(&self) -> &str {
        "search_prs"
    }

    fn description(&self) -> &str {
        "Semantic search across pull requests using embeddings. Returns relevant PRs with similarity scores, titles, descriptions, and metadata."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Natural language search query (e.g., 'PRs related to authentication')"
                },
                "limit": {
                    "type": "number",
                    "description": "Maximum number of results to return (default: 10)"
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let query = params["query"].as_str().unwrap_or("").trim().to_string();
        if query.is_empty() {
            return Ok(json!([]));
        }
        let limit = positive_limit(&params, 10);

        let vectors = ctx.embedder.embed_texts(&[query]).await?;
        let Some(vector) = vectors.into_iter().next() else {
            return Ok(json!([]));
        };

        let rows = ctx.store.search_prs(&Vector::from(vector), limit).await?;
        let results: Vec<PrResult> = rows
            .iter()
            .map(|row| {
                let similarity = 1.0 - row.distance / 2.0;
                PrResult {
                    pr_number: row.pr_number,
                    title: row.pr_title.clone(),
                    body: row.pr_body.clone(),
                    author: row.author.clone(),
                    state: row.state.clone(),
                    created_at: row.created_at.to_rfc3339(),
                    merged_at: row.merged_at.map(|t| t.to_rfc3339()),
                    github_url: format!(
                        "{}/pull/{}",
                        ctx.repository_url.trim_end_matches('/'),
                        row.pr_number
                    ),
                    similarity_score: Some(similarity),
                }
            })
            .collect();

        Ok(serde_json::to_value(results)?)
    }
}

// ── search_docs ──────────────────────────────────────────────────────────

/// Semantic documentation search; similarity here is `1 - distance`.
/// The numeric scale differs from `search_prs`; both preserve ordering.
pub struct SearchDocsTool;

#[async_trait]
impl Tool for SearchDocsTool {
    fn name(&self) -> &str {
        "search_docs"
    }

    fn description(&self) -> &str {
        "Semantic search across documentation using embeddings. Returns relevant documentation chunks with similarity scores from the platform repositories."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Natural language search query (e.g., 'How does cluster creation work?')"
                },
                "limit": {
                    "type": "number",
                    "description": "Maximum number of results to return (default: 10)"
                },
                "component": {
                    "type": "string",
                    "description": "Optional: Filter results by component name"
                },
                "repo": {
                    "type": "string",
                    "description": "Optional: Filter results by repository URL"
                },
                "include_full_file": {
                    "type": "boolean",
                    "description": "Include full file content in results (default: false)"
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let query = params["query"].as_str().unwrap_or("").trim().to_string();
        if query.is_empty() {
            return Ok(json!({"query": "", "results": [], "total_found": 0}));
        }
        let limit = positive_limit(&params, 10);
        let component = params["component"].as_str().unwrap_or("");
        let repo = params["repo"].as_str().unwrap_or("");
        let include_full_file = params["include_full_file"].as_bool().unwrap_or(false);

        let vectors = ctx.embedder.embed_texts(&[query.clone()]).await?;
        let Some(vector) = vectors.into_iter().next() else {
            return Ok(json!({"query": query, "results": [], "total_found": 0}));
        };

        let rows = ctx
            .store
            .search_docs(&Vector::from(vector), limit, Some(component), Some(repo))
            .await?;

        let mut results: Vec<DocResult> = rows
            .iter()
            .map(|row| DocResult {
                repo: row.repo.clone(),
                component: row.component.clone(),
                path: row.path.clone(),
                commit_sha: row.commit_sha.clone(),
                source_url: row.source_url.clone(),
                snippet: row.snippet.clone(),
                similarity: 1.0 - row.distance,
                content: None,
            })
            .collect();

        if include_full_file {
            for result in &mut results {
                result.content = read_full_file(ctx, result).await;
            }
        }

        let total = results.len();
        Ok(json!({
            "query": query,
            "results": results,
            "total_found": total,
        }))
    }
}

/// Resolve a hit's repository to a local clone and read the file at
/// `commit_sha:path`. Enrichment is best-effort: clone commands may race
/// with ingestion, and any failure leaves `content` unset.
async fn read_full_file(ctx: &ToolContext, result: &DocResult) -> Option<String> {
    if result.repo.is_empty() || result.commit_sha.is_empty() || result.path.is_empty() {
        return None;
    }

    let local_path = ctx.cache_dir.join(repo_basename(&result.repo));
    let repo = GitRepo::new(RepoConfig::new(result.repo.clone(), local_path));
    if let Err(err) = repo.ensure().await {
        tracing::debug!(repo = %result.repo, error = %err, "full-file enrichment: ensure failed");
    }
    match repo.show_file(&result.commit_sha, &result.path).await {
        Ok(content) => Some(content),
        Err(err) => {
            tracing::debug!(
                repo = %result.repo,
                path = %result.path,
                error = %err,
                "full-file enrichment: read failed"
            );
            None
        }
    }
}

// ── get_pr_details ───────────────────────────────────────────────────────

pub struct GetPrDetailsTool;

#[async_trait]
impl Tool for GetPrDetailsTool {
    fn name(&self) -> &str {
        "get_pr_details"
    }

    fn description(&self) -> &str {
        "Retrieve detailed information about a specific pull request by its number, including title, body, status, and metadata."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "pr_number": {
                    "type": "number",
                    "description": "The pull request number (e.g., 1234)"
                }
            },
            "required": ["pr_number"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let pr_number = parse_pr_number(&params["pr_number"])?;
        let record = ctx.store.get_pr_by_number(pr_number).await?;
        let result = match record {
            Some(record) => PrResult::from_record(&record, None, &ctx.repository_url),
            // Unknown PR is not an error; an empty object comes back.
            None => PrResult::default(),
        };
        Ok(serde_json::to_value(result)?)
    }
}

/// Validate a `pr_number` argument: present, numeric, positive.
pub fn parse_pr_number(value: &Value) -> Result<i32> {
    match value {
        Value::Number(n) => {
            let parsed = n.as_i64().unwrap_or(-1);
            if parsed <= 0 {
                anyhow::bail!("pr_number must be positive");
            }
            i32::try_from(parsed).map_err(|_| anyhow::anyhow!("pr_number must be positive"))
        }
        Value::Null => anyhow::bail!("pr_number must be provided"),
        _ => anyhow::bail!("pr_number must be provided"),
    }
}

// ── trace_images ─────────────────────────────────────────────────────────

pub struct TraceImagesTool;

#[async_trait]
impl Tool for TraceImagesTool {
    fn name(&self) -> &str {
        "trace_images"
    }

    fn description(&self) -> &str {
        "Trace container images used in deployments for a specific commit and environment. Returns image references, digests, and upstream source commits."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "commit_sha": {
                    "type": "string",
                    "description": "Git commit SHA to trace images from (full 40-character SHA)"
                },
                "environment": {
                    "type": "string",
                    "description": "Deployment environment",
                    "enum": ENVIRONMENTS
                }
            },
            "required": ["commit_sha", "environment"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let commit_sha = params["commit_sha"].as_str().unwrap_or("");
        let environment = params["environment"].as_str().unwrap_or("");

        if !is_full_commit_sha(commit_sha) {
            anyhow::bail!("commit_sha must be a full 40-character hex SHA");
        }
        if !ENVIRONMENTS.contains(&environment) {
            anyhow::bail!(
                "environment must be one of: {}",
                ENVIRONMENTS.join(", ")
            );
        }

        let results = ctx.trace.trace_images(commit_sha, environment).await?;
        Ok(json!({
            "commit_sha": commit_sha,
            "environment": environment,
            "results": results,
        }))
    }
}

/// A full 40-character lowercase-or-uppercase hex commit SHA.
pub fn is_full_commit_sha(value: &str) -> bool {
    value.len() == 40 && value.chars().all(|c| c.is_ascii_hexdigit())
}

fn positive_limit(params: &Value, default: i64) -> i64 {
    match params["limit"].as_i64() {
        Some(limit) if limit > 0 => limit,
        _ => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_finds_builtins() {
        let registry = ToolRegistry::with_builtins();
        assert_eq!(registry.tools().len(), 4);
        for name in ["search_prs", "search_docs", "get_pr_details", "trace_images"] {
            assert!(registry.find(name).is_some(), "missing tool {}", name);
        }
        assert!(registry.find("echo").is_none());
    }

    #[test]
    fn test_schemas_declare_required_fields() {
        let registry = ToolRegistry::with_builtins();
        let schema = registry.find("search_prs").unwrap().parameters_schema();
        assert_eq!(schema["required"], json!(["query"]));
        let schema = registry.find("trace_images").unwrap().parameters_schema();
        assert_eq!(schema["required"], json!(["commit_sha", "environment"]));
        assert_eq!(
            schema["properties"]["environment"]["enum"],
            json!(["dev", "int", "stg", "prod"])
        );
    }

    #[test]
    fn test_parse_pr_number() {
        assert_eq!(parse_pr_number(&json!(42)).unwrap(), 42);
        assert!(parse_pr_number(&json!(0)).is_err());
        assert!(parse_pr_number(&json!(-3)).is_err());
        assert!(parse_pr_number(&Value::Null).is_err());
        assert!(parse_pr_number(&json!("7")).is_err());
    }

    #[test]
    fn test_is_full_commit_sha() {
        assert!(is_full_commit_sha(&"a".repeat(40)));
        assert!(is_full_commit_sha(&"A1b2c3d4".repeat(5)));
        assert!(!is_full_commit_sha("abc123"));
        assert!(!is_full_commit_sha(&"g".repeat(40)));
        assert!(!is_full_commit_sha(""));
    }

    #[test]
    fn test_positive_limit() {
        assert_eq!(positive_limit(&json!({"limit": 5}), 10), 5);
        assert_eq!(positive_limit(&json!({"limit": 0}), 10), 10);
        assert_eq!(positive_limit(&json!({"limit": -2}), 10), 10);
        assert_eq!(positive_limit(&json!({}), 10), 10);
    }

    #[test]
    fn test_similarity_mappings_preserve_order() {
        // PR mapping: 1 - d/2 over distances in [0, 2].
        let pr = |d: f64| 1.0 - d / 2.0;
        assert!(pr(0.1) > pr(0.2));
        assert_eq!(pr(0.0), 1.0);
        assert_eq!(pr(2.0), 0.0);

        // Doc mapping: 1 - d. Different scale, same ordering.
        let doc = |d: f64| 1.0 - d;
        assert!(doc(0.1) > doc(0.2));
    }
}
