//! Persistence layer over PostgreSQL with the pgvector extension.
//!
//! The [`Store`] owns every durable entity: PR rows, documentation chunks,
//! and the trace image cache. Vector similarity queries use the cosine
//! distance operator (`<=>`) backed by HNSW indexes; "not found" is `None`,
//! never an error; all multi-statement mutations run in transactions.
//!
//! Documentation replacement goes through [`DocumentBatchWriter`], a small
//! state machine (`open → committed | rolled_back`) that stages chunks in a
//! transaction-scoped temporary table and swaps a repository's chunk set
//! atomically on commit.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use pgvector::Vector;
use sqlx::{PgPool, Postgres, Transaction};

use crate::models::{DocumentChunk, FailureCategory, NewPrRecord, PrRecord, TraceResult};

/// Shared repository for all persisted entities.
#[derive(Debug, Clone)]
pub struct Store {
    pool: PgPool,
    trace_cache_max: i64,
}

/// A PR search hit with its cosine distance to the query vector.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct PrSearchRow {
    pub pr_number: i32,
    pub pr_title: String,
    pub pr_body: String,
    pub author: String,
    pub created_at: DateTime<Utc>,
    pub merged_at: Option<DateTime<Utc>>,
    pub state: String,
    pub base_ref: String,
    pub distance: f64,
}

/// A documentation search hit with snippet and cosine distance.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DocSearchRow {
    pub repo: String,
    pub component: Option<String>,
    pub path: String,
    pub commit_sha: String,
    pub source_url: Option<String>,
    pub snippet: String,
    pub distance: f64,
}

impl Store {
    pub fn new(pool: PgPool, trace_cache_max: i64) -> Self {
        Store {
            pool,
            trace_cache_max,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    // ── PR rows ──────────────────────────────────────────────────────────

    /// `(merged_at, pr_number)` of the most recently merged stored PR,
    /// ordered `(merged_at DESC, pr_number DESC)`. `None` when the table
    /// is empty.
    pub async fn latest_merged_pr(&self) -> Result<Option<(Option<DateTime<Utc>>, i32)>> {
        let row: Option<(Option<DateTime<Utc>>, i32)> = sqlx::query_as(
            "SELECT merged_at, pr_number FROM pr_embeddings \
             ORDER BY merged_at DESC, pr_number DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Mirror of [`latest_merged_pr`](Store::latest_merged_pr) at the other
    /// end of the timeline.
    pub async fn oldest_merged_pr(&self) -> Result<Option<(Option<DateTime<Utc>>, i32)>> {
        let row: Option<(Option<DateTime<Utc>>, i32)> = sqlx::query_as(
            "SELECT merged_at, pr_number FROM pr_embeddings \
             ORDER BY merged_at ASC, pr_number ASC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn has_pr(&self, pr_number: i32) -> Result<bool> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM pr_embeddings WHERE pr_number = $1")
                .bind(pr_number)
                .fetch_one(&self.pool)
                .await?;
        Ok(count > 0)
    }

    /// Insert a metadata-only PR row. First writer wins: a conflicting
    /// `pr_number` makes this a no-op.
    pub async fn store_pr(&self, pr: &NewPrRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO pr_embeddings (
                pr_number, pr_title, pr_body, author, created_at, merged_at,
                state, base_ref, github_base_sha, head_commit_sha, merge_commit_sha
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (pr_number) DO NOTHING
            "#,
        )
        .bind(pr.pr_number)
        .bind(&pr.pr_title)
        .bind(&pr.pr_body)
        .bind(&pr.author)
        .bind(pr.created_at)
        .bind(pr.merged_at)
        .bind(&pr.state)
        .bind(&pr.base_ref)
        .bind(&pr.github_base_sha)
        .bind(&pr.head_commit_sha)
        .bind(&pr.merge_commit_sha)
        .execute(&self.pool)
        .await
        .with_context(|| format!("store PR #{}", pr.pr_number))?;
        Ok(())
    }

    /// Rows awaiting processing, newest merge first. `retry_failed` also
    /// reopens processed rows whose analysis failed. `limit <= 0` defaults
    /// to 100.
    pub async fn get_unprocessed_prs(&self, limit: i64, retry_failed: bool) -> Result<Vec<PrRecord>> {
        let limit = if limit <= 0 { 100 } else { limit };
        let predicate = if retry_failed {
            "processed_at IS NULL OR analysis_successful = FALSE"
        } else {
            "processed_at IS NULL"
        };
        let query = format!(
            "SELECT * FROM pr_embeddings WHERE {} ORDER BY merged_at DESC LIMIT $1",
            predicate
        );
        let rows = sqlx::query_as::<_, PrRecord>(sqlx::AssertSqlSafe(query))
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    pub async fn count_unprocessed_prs(&self, retry_failed: bool) -> Result<i64> {
        let predicate = if retry_failed {
            "processed_at IS NULL OR analysis_successful = FALSE"
        } else {
            "processed_at IS NULL"
        };
        let query = format!("SELECT COUNT(*) FROM pr_embeddings WHERE {}", predicate);
        let count: i64 = sqlx::query_scalar(sqlx::AssertSqlSafe(query)).fetch_one(&self.pool).await?;
        Ok(count)
    }

    /// Record the processing outcome for one PR. Sets `processed_at = now()`;
    /// idempotent for identical inputs.
    pub async fn update_pr_processing(
        &self,
        pr_number: i32,
        embedding: Option<&Vector>,
        rich_description: Option<&str>,
        analysis_successful: bool,
        failure_reason: Option<&str>,
        failure_category: Option<FailureCategory>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE pr_embeddings SET
                embedding = $2,
                rich_description = $3,
                analysis_successful = $4,
                failure_reason = $5,
                failure_category = $6,
                processed_at = now()
            WHERE pr_number = $1
            "#,
        )
        .bind(pr_number)
        .bind(embedding)
        .bind(rich_description)
        .bind(analysis_successful)
        .bind(failure_reason)
        .bind(failure_category.map(|c| c.as_str()))
        .execute(&self.pool)
        .await
        .with_context(|| format!("update processing outcome for PR #{}", pr_number))?;
        Ok(())
    }

    pub async fn get_pr_by_number(&self, pr_number: i32) -> Result<Option<PrRecord>> {
        let row = sqlx::query_as::<_, PrRecord>(
            "SELECT * FROM pr_embeddings WHERE pr_number = $1",
        )
        .bind(pr_number)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Nearest PRs to `embedding` by cosine distance. Only processed rows
    /// (non-null embedding) participate; ordering is distance ascending.
    pub async fn search_prs(&self, embedding: &Vector, limit: i64) -> Result<Vec<PrSearchRow>> {
        let limit = if limit <= 0 { 10 } else { limit };
        let rows = sqlx::query_as::<_, PrSearchRow>(
            r#"
            SELECT pr_number, pr_title, pr_body, author, created_at, merged_at,
                   state, base_ref,
                   (embedding <=> $1)::float8 AS distance
            FROM pr_embeddings
            WHERE embedding IS NOT NULL
            ORDER BY distance
            LIMIT $2
            "#,
        )
        .bind(embedding)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Nearest documentation chunks. Snippet is the first 400 characters of
    /// the chunk text; `component`/`repo` filters are ANDed and an empty
    /// string means "no filter".
    pub async fn search_docs(
        &self,
        embedding: &Vector,
        limit: i64,
        component: Option<&str>,
        repo: Option<&str>,
    ) -> Result<Vec<DocSearchRow>> {
        let limit = if limit <= 0 { 10 } else { limit };
        let component = component.filter(|s| !s.is_empty());
        let repo = repo.filter(|s| !s.is_empty());

        let rows = sqlx::query_as::<_, DocSearchRow>(
            r#"
            SELECT repo, component, path, commit_sha, source_url,
                   left(chunk_text, 400) AS snippet,
                   (embedding <=> $1)::float8 AS distance
            FROM documents
            WHERE ($3::text IS NULL OR component = $3)
              AND ($4::text IS NULL OR repo = $4)
            ORDER BY distance
            LIMIT $2
            "#,
        )
        .bind(embedding)
        .bind(limit)
        .bind(component)
        .bind(repo)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Open a batch writer whose commit atomically replaces all chunks of
    /// `repo`.
    pub async fn document_batch_writer(&self, repo: &str) -> Result<DocumentBatchWriter> {
        DocumentBatchWriter::open(&self.pool, repo).await
    }

    // ── Trace image cache ────────────────────────────────────────────────

    pub async fn trace_image_cache_get(
        &self,
        commit_sha: &str,
        environment: &str,
    ) -> Result<Option<TraceResult>> {
        let row: Option<(serde_json::Value,)> = sqlx::query_as(
            "SELECT response_json FROM trace_image_cache \
             WHERE commit_sha = $1 AND environment = $2",
        )
        .bind(commit_sha)
        .bind(environment)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            None => Ok(None),
            Some((value,)) => {
                let result: TraceResult = serde_json::from_value(value)
                    .with_context(|| "decode cached trace response")?;
                Ok(Some(result))
            }
        }
    }

    /// Idempotent upsert followed by a trim to the configured maximum
    /// (newest `inserted_at` first survive). Skipped entirely when the
    /// maximum is zero or negative.
    pub async fn trace_image_cache_upsert(
        &self,
        commit_sha: &str,
        environment: &str,
        response: &TraceResult,
    ) -> Result<()> {
        if self.trace_cache_max <= 0 {
            return Ok(());
        }

        let payload = serde_json::to_value(response)?;
        sqlx::query(
            r#"
            INSERT INTO trace_image_cache (commit_sha, environment, response_json)
            VALUES ($1, $2, $3)
            ON CONFLICT (commit_sha, environment)
            DO UPDATE SET response_json = EXCLUDED.response_json, inserted_at = now()
            "#,
        )
        .bind(commit_sha)
        .bind(environment)
        .bind(payload)
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            DELETE FROM trace_image_cache
            WHERE (commit_sha, environment) IN (
                SELECT commit_sha, environment FROM trace_image_cache
                ORDER BY inserted_at DESC
                OFFSET $1
            )
            "#,
        )
        .bind(self.trace_cache_max)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn trace_image_cache_count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM trace_image_cache")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn count_prs(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pr_embeddings")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn count_documents(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

/// Writer state machine. Transitions only `open → committed` and
/// `open → rolled_back`; anything else is a programming error and fails
/// fast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterState {
    Open,
    Committed,
    RolledBack,
}

impl WriterState {
    fn describe(&self) -> &'static str {
        match self {
            WriterState::Open => "open",
            WriterState::Committed => "committed",
            WriterState::RolledBack => "rolled back",
        }
    }
}

/// Transactional staging writer for one repository's documentation chunks.
///
/// All added chunks land in a temporary table scoped to the transaction;
/// `commit` deletes the repository's durable rows and copies the staged
/// rows in the same transaction, so readers never observe a mixture of old
/// and new chunks. Dropping the writer without committing rolls back.
pub struct DocumentBatchWriter {
    tx: Option<Transaction<'static, Postgres>>,
    repo: String,
    state: WriterState,
    staged: usize,
}

impl DocumentBatchWriter {
    async fn open(pool: &PgPool, repo: &str) -> Result<Self> {
        let mut tx = pool.begin().await?;
        sqlx::query(
            r#"
            CREATE TEMPORARY TABLE documents_staging
            (LIKE documents INCLUDING DEFAULTS)
            ON COMMIT DROP
            "#,
        )
        .execute(&mut *tx)
        .await
        .with_context(|| "create documents staging table")?;

        Ok(DocumentBatchWriter {
            tx: Some(tx),
            repo: repo.to_string(),
            state: WriterState::Open,
            staged: 0,
        })
    }

    fn illegal(&self, operation: &str) -> anyhow::Error {
        anyhow::anyhow!(
            "document batch writer for {} is {}; cannot {}",
            self.repo,
            self.state.describe(),
            operation
        )
    }

    /// Stage one chunk. The embedding must match the schema dimension.
    pub async fn add(&mut self, chunk: &DocumentChunk) -> Result<()> {
        if self.state != WriterState::Open || self.tx.is_none() {
            return Err(self.illegal("add"));
        }
        let dims = chunk.embedding.as_slice().len();
        if dims != crate::models::EMBEDDING_DIM {
            anyhow::bail!(
                "chunk {} of {} has a {}-dimensional embedding; expected {}",
                chunk.chunk_index,
                chunk.path,
                dims,
                crate::models::EMBEDDING_DIM
            );
        }
        let tx = self.tx.as_mut().expect("checked above");
        sqlx::query(
            r#"
            INSERT INTO documents_staging (
                id, repo, component, path, commit_sha, doc_type,
                chunk_index, chunk_text, embedding, embedding_model, source_url
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(&chunk.id)
        .bind(&chunk.repo)
        .bind(&chunk.component)
        .bind(&chunk.path)
        .bind(&chunk.commit_sha)
        .bind(chunk.doc_type.as_str())
        .bind(chunk.chunk_index)
        .bind(&chunk.chunk_text)
        .bind(&chunk.embedding)
        .bind(&chunk.embedding_model)
        .bind(&chunk.source_url)
        .execute(&mut **tx)
        .await
        .with_context(|| format!("stage chunk {} for {}", chunk.chunk_index, chunk.path))?;
        self.staged += 1;
        Ok(())
    }

    /// Atomically replace the repository's durable chunks with the staged
    /// set.
    pub async fn commit(&mut self) -> Result<usize> {
        if self.state != WriterState::Open || self.tx.is_none() {
            return Err(self.illegal("commit"));
        }
        let mut tx = self.tx.take().expect("checked above");

        sqlx::query("DELETE FROM documents WHERE repo = $1")
            .bind(&self.repo)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("clear prior chunks for {}", self.repo))?;

        sqlx::query("INSERT INTO documents SELECT * FROM documents_staging")
            .execute(&mut *tx)
            .await
            .with_context(|| format!("copy staged chunks for {}", self.repo))?;

        tx.commit().await?;
        self.state = WriterState::Committed;
        tracing::info!(repo = %self.repo, chunks = self.staged, "committed documentation batch");
        Ok(self.staged)
    }

    /// Discard the staged set, leaving prior rows intact.
    pub async fn rollback(&mut self) -> Result<()> {
        if self.state != WriterState::Open || self.tx.is_none() {
            return Err(self.illegal("rollback"));
        }
        let tx = self.tx.take().expect("checked above");
        tx.rollback().await?;
        self.state = WriterState::RolledBack;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writer_state_describe() {
        assert_eq!(WriterState::Open.describe(), "open");
        assert_eq!(WriterState::Committed.describe(), "committed");
        assert_eq!(WriterState::RolledBack.describe(), "rolled back");
    }
}
