//! Database schema migrations.
//!
//! The schema is exactly the ordered set of steps in [`MIGRATIONS`]; nothing
//! creates or alters tables implicitly. Applied steps are recorded in the
//! `schema_migrations` ledger, and each step runs inside its own
//! transaction.
//!
//! # Schema
//!
//! ```text
//! ┌────────────────────┐   ┌──────────────────┐   ┌───────────────────┐
//! │   pr_embeddings    │   │    documents     │   │ trace_image_cache │
//! │                    │   │                  │   │                   │
//! │ id (PK)            │   │ id (PK, sha256)  │   │ commit_sha   (PK) │
//! │ pr_number (UNIQUE) │   │ repo             │   │ environment  (PK) │
//! │ pr_title / pr_body │   │ component        │   │ response_json     │
//! │ author / state     │   │ path             │   │ inserted_at       │
//! │ created_at         │   │ commit_sha       │   └───────────────────┘
//! │ merged_at          │   │ doc_type         │
//! │ base_ref + SHAs    │   │ chunk_index      │   ┌───────────────────┐
//! │ embedding (768)    │   │ chunk_text       │   │ schema_migrations │
//! │ rich_description   │   │ embedding (768)  │   │ name (PK)         │
//! │ analysis_* fields  │   │ embedding_model  │   │ applied_at        │
//! │ processed_at       │   │ source_url       │   └───────────────────┘
//! └────────────────────┘   │ updated_at       │
//!                          └──────────────────┘
//! ```
//!
//! Both embedding columns carry an HNSW index with cosine ops.

use anyhow::{Context, Result};
use sqlx::PgPool;

/// One schema migration: ordered statements to apply and to revert.
pub struct MigrationStep {
    pub name: &'static str,
    pub up: &'static [&'static str],
    pub down: &'static [&'static str],
}

/// The ordered migration set. Append-only; never reorder or edit an
/// already-shipped step.
pub const MIGRATIONS: &[MigrationStep] = &[
    MigrationStep {
        name: "0001_pr_embeddings",
        up: &[
            "CREATE EXTENSION IF NOT EXISTS vector",
            r#"
            CREATE TABLE pr_embeddings (
                id BIGSERIAL PRIMARY KEY,
                pr_number INTEGER NOT NULL UNIQUE,
                pr_title TEXT NOT NULL,
                pr_body TEXT NOT NULL,
                author TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                merged_at TIMESTAMPTZ,
                state TEXT NOT NULL,
                base_ref TEXT NOT NULL DEFAULT 'main',
                github_base_sha TEXT,
                base_merge_base_sha TEXT,
                head_commit_sha TEXT,
                merge_commit_sha TEXT,
                embedding vector(768),
                rich_description TEXT,
                analysis_successful BOOLEAN NOT NULL DEFAULT FALSE,
                failure_reason TEXT,
                failure_category TEXT,
                processed_at TIMESTAMPTZ
            )
            "#,
            "CREATE INDEX pr_embeddings_merged_at_idx ON pr_embeddings (merged_at DESC)",
            "CREATE INDEX pr_embeddings_processed_at_idx ON pr_embeddings (processed_at) WHERE processed_at IS NULL",
            "CREATE INDEX pr_embeddings_embedding_idx ON pr_embeddings USING hnsw (embedding vector_cosine_ops)",
        ],
        down: &["DROP TABLE IF EXISTS pr_embeddings"],
    },
    MigrationStep {
        name: "0002_documents",
        up: &[
            r#"
            CREATE TABLE documents (
                id TEXT PRIMARY KEY,
                repo TEXT NOT NULL,
                component TEXT,
                path TEXT NOT NULL,
                commit_sha TEXT NOT NULL,
                doc_type TEXT NOT NULL,
                chunk_index INTEGER NOT NULL,
                chunk_text TEXT NOT NULL,
                embedding vector(768) NOT NULL,
                embedding_model TEXT NOT NULL,
                source_url TEXT,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
            )
            "#,
            "CREATE INDEX documents_repo_idx ON documents (repo)",
            "CREATE INDEX documents_embedding_idx ON documents USING hnsw (embedding vector_cosine_ops)",
        ],
        down: &["DROP TABLE IF EXISTS documents"],
    },
    MigrationStep {
        name: "0003_trace_image_cache",
        up: &[
            r#"
            CREATE TABLE trace_image_cache (
                commit_sha TEXT NOT NULL,
                environment TEXT NOT NULL,
                response_json JSONB NOT NULL,
                inserted_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                PRIMARY KEY (commit_sha, environment)
            )
            "#,
            "CREATE INDEX trace_image_cache_inserted_at_idx ON trace_image_cache (inserted_at DESC)",
        ],
        down: &["DROP TABLE IF EXISTS trace_image_cache"],
    },
];

/// Create the migrations ledger if it does not exist.
pub async fn init(pool: &PgPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_migrations (
            name TEXT PRIMARY KEY,
            applied_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#,
    )
    .execute(pool)
    .await
    .with_context(|| "create schema_migrations ledger")?;
    Ok(())
}

/// Names of applied steps, in application order.
pub async fn applied(pool: &PgPool) -> Result<Vec<String>> {
    init(pool).await?;
    let rows: Vec<String> =
        sqlx::query_scalar("SELECT name FROM schema_migrations ORDER BY name")
            .fetch_all(pool)
            .await?;
    Ok(rows)
}

/// `(name, applied)` for every known step, in order.
pub async fn status(pool: &PgPool) -> Result<Vec<(&'static str, bool)>> {
    let done = applied(pool).await?;
    Ok(MIGRATIONS
        .iter()
        .map(|step| (step.name, done.iter().any(|n| n == step.name)))
        .collect())
}

/// Apply all pending steps, oldest first. Each step commits atomically.
pub async fn migrate_up(pool: &PgPool) -> Result<usize> {
    let done = applied(pool).await?;
    let mut count = 0usize;

    for step in MIGRATIONS {
        if done.iter().any(|n| n == step.name) {
            continue;
        }
        let mut tx = pool.begin().await?;
        for stmt in step.up {
            sqlx::query(*stmt)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("migration {}: apply failed", step.name))?;
        }
        sqlx::query("INSERT INTO schema_migrations (name) VALUES ($1)")
            .bind(step.name)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        tracing::info!(migration = step.name, "applied migration");
        count += 1;
    }

    Ok(count)
}

/// Roll back the most recent `steps` applied migrations (`0` = all).
pub async fn migrate_down(pool: &PgPool, steps: usize) -> Result<usize> {
    let done = applied(pool).await?;
    if done.is_empty() {
        return Ok(0);
    }

    let count = if steps == 0 || steps > done.len() {
        done.len()
    } else {
        steps
    };

    let mut rolled_back = 0usize;
    for name in done.iter().rev().take(count) {
        let step = MIGRATIONS
            .iter()
            .find(|s| s.name == name.as_str())
            .with_context(|| format!("applied migration {} is unknown to this binary", name))?;
        let mut tx = pool.begin().await?;
        for stmt in step.down {
            sqlx::query(*stmt)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("migration {}: revert failed", step.name))?;
        }
        sqlx::query("DELETE FROM schema_migrations WHERE name = $1")
            .bind(step.name)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        tracing::info!(migration = step.name, "rolled back migration");
        rolled_back += 1;
    }

    Ok(rolled_back)
}

/// Ensure the database is on the latest schema version.
///
/// With `auto_migrate` false this fails listing the pending steps; with it
/// true the pending steps are applied.
pub async fn ensure_current(pool: &PgPool, auto_migrate: bool) -> Result<()> {
    let pending: Vec<&str> = status(pool)
        .await?
        .into_iter()
        .filter(|(_, applied)| !applied)
        .map(|(name, _)| name)
        .collect();

    if pending.is_empty() {
        return Ok(());
    }

    if !auto_migrate {
        anyhow::bail!(
            "pending migrations: {}. Run 'fabric dbctl migrate up' to apply them.",
            pending.join(", ")
        );
    }

    migrate_up(pool).await?;
    Ok(())
}

/// Drop and recreate the tables for a scope. Destructive; the CLI gates
/// this behind `DB_ALLOW_DESTRUCTIVE=yes`.
pub async fn recreate(pool: &PgPool, scope: &str) -> Result<()> {
    let (drop_stmt, names): (&str, &[&str]) = match scope {
        "all" => (
            "DROP TABLE IF EXISTS documents, pr_embeddings, trace_image_cache CASCADE",
            &["0001_pr_embeddings", "0002_documents", "0003_trace_image_cache"],
        ),
        "prs" => (
            "DROP TABLE IF EXISTS pr_embeddings CASCADE",
            &["0001_pr_embeddings"],
        ),
        "docs" => ("DROP TABLE IF EXISTS documents CASCADE", &["0002_documents"]),
        "trace" => (
            "DROP TABLE IF EXISTS trace_image_cache CASCADE",
            &["0003_trace_image_cache"],
        ),
        other => anyhow::bail!("unknown scope: {} (must be all, prs, docs, or trace)", other),
    };

    sqlx::query(drop_stmt).execute(pool).await?;
    for name in names {
        sqlx::query("DELETE FROM schema_migrations WHERE name = $1")
            .bind(name)
            .execute(pool)
            .await?;
    }
    ensure_current(pool, true).await
}
