//! Cache-aware wrapper around the image tracer.
//!
//! Lookups hit the persistent cache first; misses run the tracer. Only
//! clean results (no top-level errors and no per-component errors) are
//! cached, so transient failures never poison the cache. The cache trims
//! itself to the configured maximum on every write.

use anyhow::Result;
use async_trait::async_trait;

use crate::models::TraceResult;
use crate::store::Store;
use crate::tracer::Tracer;

/// Persistence seam for trace results. Implemented by [`Store`]; tests use
/// an in-memory double.
#[async_trait]
pub trait TraceCache: Send + Sync {
    async fn get(&self, commit_sha: &str, environment: &str) -> Result<Option<TraceResult>>;
    async fn upsert(&self, commit_sha: &str, environment: &str, response: &TraceResult)
        -> Result<()>;
}

#[async_trait]
impl TraceCache for Store {
    async fn get(&self, commit_sha: &str, environment: &str) -> Result<Option<TraceResult>> {
        self.trace_image_cache_get(commit_sha, environment).await
    }

    async fn upsert(
        &self,
        commit_sha: &str,
        environment: &str,
        response: &TraceResult,
    ) -> Result<()> {
        self.trace_image_cache_upsert(commit_sha, environment, response)
            .await
    }
}

/// The service the `trace_images` tool talks to.
pub struct TraceService {
    tracer: Tracer,
    cache: Box<dyn TraceCache>,
}

impl TraceService {
    pub fn new(tracer: Tracer, cache: Box<dyn TraceCache>) -> Self {
        TraceService { tracer, cache }
    }

    /// Trace `(commit, environment)`, serving cached results when possible.
    pub async fn trace_images(&self, commit_sha: &str, environment: &str) -> Result<TraceResult> {
        if commit_sha.is_empty() || environment.is_empty() {
            anyhow::bail!("commit and environment are required");
        }

        tracing::debug!(commit = commit_sha, environment, "checking trace cache");
        if let Some(cached) = self.cache.get(commit_sha, environment).await? {
            tracing::debug!(commit = commit_sha, environment, "trace cache hit");
            return Ok(cached);
        }

        tracing::debug!(commit = commit_sha, environment, "trace cache miss");
        let result = self.tracer.trace(commit_sha, environment).await?;

        if result.has_errors() {
            tracing::debug!(
                commit = commit_sha,
                environment,
                errors = result.errors.len(),
                "skipping trace cache write due to errors"
            );
            return Ok(result);
        }

        self.cache.upsert(commit_sha, environment, &result).await?;
        Ok(result)
    }
}
