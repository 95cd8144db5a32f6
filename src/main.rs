//! # platform-fabric CLI (`fabric`)
//!
//! Single binary driving every pipeline of the knowledge fabric:
//!
//! | Command | Description |
//! |---------|-------------|
//! | `fabric ingest prs` | Cache and process merged pull requests |
//! | `fabric ingest docs` | Ingest documentation into the vector store |
//! | `fabric mcp-server` | Start the MCP tool server |
//! | `fabric dbctl ...` | Migration management (init/migrate/status/verify/recreate) |
//! | `fabric trace-images run` | Trace deployed images for a commit/environment |
//! | `fabric dbstatus` | Connectivity and content report |
//!
//! All commands read the TOML config passed via `--config` (defaults to
//! `./fabric.toml`; a missing file falls back to built-in defaults).
//! Exit code is zero on success, non-zero with a message on failure.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use platform_fabric::config::{self, repo_basename, Config};
use platform_fabric::db;
use platform_fabric::gitrepo::{GitRepo, RepoConfig};
use platform_fabric::github::GitHubFetcher;
use platform_fabric::ingest_docs::{DocsIngester, RepoSpec};
use platform_fabric::ingest_prs::Generator;
use platform_fabric::inspector::SkopeoInspector;
use platform_fabric::llm::OllamaClient;
use platform_fabric::migrate;
use platform_fabric::server;
use platform_fabric::store::Store;
use platform_fabric::tools::{ToolContext, ToolRegistry};
use platform_fabric::trace_service::TraceService;
use platform_fabric::tracer::{Tracer, TracerConfig};

#[derive(Parser)]
#[command(
    name = "fabric",
    about = "Change-aware knowledge fabric: PR and docs ingestion, semantic retrieval, and deployment image tracing",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./fabric.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingestion pipelines.
    Ingest {
        #[command(subcommand)]
        target: IngestTarget,
    },

    /// Start the MCP tool server.
    McpServer,

    /// Database schema management.
    Dbctl {
        /// PostgreSQL DSN (overrides the config file).
        #[arg(long)]
        dsn: Option<String>,

        #[command(subcommand)]
        action: DbctlAction,
    },

    /// Deployment image tracing.
    TraceImages {
        #[command(subcommand)]
        action: TraceAction,
    },

    /// Report database connectivity and content counts.
    Dbstatus,
}

#[derive(Subcommand)]
enum IngestTarget {
    /// Ingest merged PRs (cache and/or process, per execution_mode).
    Prs {
        /// Reopen previously failed rows for re-analysis and re-embedding.
        #[arg(long)]
        retry_failed: bool,
    },

    /// Ingest documentation (Markdown) into the vector store.
    Docs {
        /// Repository URL to ingest (repeatable). Defaults to the
        /// configured platform repository.
        #[arg(long = "repo-url")]
        repo_urls: Vec<String>,

        /// Reference name (default HEAD).
        #[arg(long, default_value = "HEAD")]
        r#ref: String,

        /// Component name attached to every chunk.
        #[arg(long)]
        component: Option<String>,

        /// Include glob (repeatable); overrides the defaults.
        #[arg(long = "include-path")]
        include_paths: Vec<String>,
    },
}

#[derive(Subcommand)]
enum DbctlAction {
    /// Initialize the migrations ledger.
    Init,
    /// Apply or roll back schema migrations.
    Migrate {
        #[command(subcommand)]
        direction: MigrateDirection,
    },
    /// Show applied and pending migrations.
    Status,
    /// Fail when any migration is pending.
    Verify,
    /// Drop and recreate tables for a scope (destructive; requires
    /// DB_ALLOW_DESTRUCTIVE=yes).
    Recreate {
        /// One of: all, prs, docs, trace.
        scope: String,
    },
}

#[derive(Subcommand)]
enum MigrateDirection {
    /// Apply all pending migrations.
    Up,
    /// Roll back migrations.
    Down {
        /// Number of migrations to roll back (0 = all).
        #[arg(long, default_value_t = 1)]
        steps: usize,
    },
}

#[derive(Subcommand)]
enum TraceAction {
    /// Trace container images for a commit/environment pair.
    Run {
        /// Git commit SHA to trace.
        #[arg(long)]
        commit_sha: String,
        /// Deployment environment (dev, int, stg, prod).
        #[arg(long)]
        environment: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cfg.log_level.clone())),
        )
        .init();

    match cli.command {
        Commands::Ingest { target } => match target {
            IngestTarget::Prs { retry_failed } => run_ingest_prs(cfg, retry_failed).await,
            IngestTarget::Docs {
                repo_urls,
                r#ref,
                component,
                include_paths,
            } => run_ingest_docs(cfg, repo_urls, r#ref, component, include_paths).await,
        },
        Commands::McpServer => run_mcp_server(cfg).await,
        Commands::Dbctl { dsn, action } => run_dbctl(cfg, dsn, action).await,
        Commands::TraceImages {
            action: TraceAction::Run {
                commit_sha,
                environment,
            },
        } => run_trace_images(cfg, commit_sha, environment).await,
        Commands::Dbstatus => run_dbstatus(cfg).await,
    }
}

async fn run_ingest_prs(cfg: Config, retry_failed: bool) -> Result<()> {
    let pool = db::connect(&cfg)?;
    migrate::ensure_current(&pool, cfg.auto_migrate).await?;

    let store = Store::new(pool, cfg.trace_cache_max_entries);
    let embedder = Arc::new(OllamaClient::new(
        &cfg.ollama_url,
        &cfg.embedding_model_name,
        cfg.llm_timeout()?,
    ));
    let (owner, repo) = cfg.repository_slug()?;
    let fetcher = GitHubFetcher::new(&owner, &repo, cfg.github_token.clone());

    let generator = Generator::new(cfg, store, embedder, fetcher, retry_failed);

    tokio::select! {
        result = generator.run() => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("interrupted; stopping ingestion");
            Ok(())
        }
    }
}

async fn run_ingest_docs(
    cfg: Config,
    repo_urls: Vec<String>,
    git_ref: String,
    component: Option<String>,
    include_paths: Vec<String>,
) -> Result<()> {
    let pool = db::connect(&cfg)?;
    migrate::ensure_current(&pool, cfg.auto_migrate).await?;

    let store = Store::new(pool, cfg.trace_cache_max_entries);
    let embedder = Arc::new(OllamaClient::new(
        &cfg.ollama_url,
        &cfg.embedding_model_name,
        cfg.llm_timeout()?,
    ));

    let mut specs: Vec<RepoSpec> = Vec::new();
    for url in &repo_urls {
        let local_path = cfg.cache_dir.join(repo_basename(url));
        let repo = GitRepo::new(RepoConfig::new(url.clone(), local_path.clone()));
        if let Err(err) = repo.ensure().await {
            tracing::warn!(url = %url, error = %err, "ensure clone failed; skipping");
            continue;
        }
        specs.push(RepoSpec {
            name: url.clone(),
            path: local_path,
            git_ref: Some(git_ref.clone()),
            component: component
                .clone()
                .or_else(|| Some(repo_basename(url))),
        });
    }

    if specs.is_empty() {
        // Fall back to the local platform repository clone.
        let (owner, name) = cfg.repository_slug()?;
        let path = cfg.platform_repo_path();
        GitRepo::new(RepoConfig::new(cfg.repository_url.clone(), path.clone()))
            .ensure()
            .await?;
        specs.push(RepoSpec {
            name: format!("{}/{}", owner, name),
            path,
            git_ref: None,
            component: component.clone(),
        });
    }

    let ingester = DocsIngester::new(store, embedder).with_include(include_paths);
    ingester.run(&specs).await
}

fn build_trace_service(cfg: &Config, store: Store) -> Result<TraceService> {
    let inspector = Arc::new(SkopeoInspector::new(
        &cfg.trace_skopeo_path,
        cfg.pull_secret.clone(),
    ));
    let tracer = Tracer::new(
        TracerConfig {
            repo_path: cfg.platform_repo_path(),
            repo_url: cfg.repository_url.clone(),
        },
        inspector,
    )?;
    Ok(TraceService::new(tracer, Box::new(store)))
}

async fn run_mcp_server(cfg: Config) -> Result<()> {
    let pool = db::connect(&cfg)?;
    migrate::ensure_current(&pool, cfg.auto_migrate).await?;

    let store = Store::new(pool, cfg.trace_cache_max_entries);
    let embedder = Arc::new(OllamaClient::new(
        &cfg.ollama_url,
        &cfg.embedding_model_name,
        cfg.llm_timeout()?,
    ));
    let trace = Arc::new(build_trace_service(&cfg, store.clone())?);

    let ctx = ToolContext {
        store,
        embedder,
        trace,
        cache_dir: cfg.cache_dir.clone(),
        repository_url: cfg.repository_url.clone(),
    };

    server::run_server(&cfg.server_bind, ToolRegistry::with_builtins(), ctx).await
}

async fn run_dbctl(cfg: Config, dsn: Option<String>, action: DbctlAction) -> Result<()> {
    let pool = match dsn {
        Some(dsn) => db::connect_dsn(&dsn)?,
        None => db::connect(&cfg)?,
    };

    match action {
        DbctlAction::Init => {
            migrate::init(&pool).await?;
            println!("migrations ledger initialized");
        }
        DbctlAction::Migrate { direction } => match direction {
            MigrateDirection::Up => {
                let applied = migrate::migrate_up(&pool).await?;
                println!("applied {} migration(s)", applied);
            }
            MigrateDirection::Down { steps } => {
                let rolled_back = migrate::migrate_down(&pool, steps).await?;
                println!("rolled back {} migration(s)", rolled_back);
            }
        },
        DbctlAction::Status => {
            for (name, applied) in migrate::status(&pool).await? {
                let state = if applied { "applied" } else { "pending" };
                println!("{}\t{}", name, state);
            }
        }
        DbctlAction::Verify => {
            migrate::ensure_current(&pool, false).await?;
            println!("schema is current");
        }
        DbctlAction::Recreate { scope } => {
            let allowed = std::env::var("DB_ALLOW_DESTRUCTIVE")
                .map(|v| v.to_lowercase() == "yes")
                .unwrap_or(false);
            if !allowed {
                anyhow::bail!("DB_ALLOW_DESTRUCTIVE=yes must be set for recreate");
            }
            migrate::recreate(&pool, &scope).await?;
            println!("recreated scope: {}", scope);
        }
    }
    Ok(())
}

async fn run_trace_images(cfg: Config, commit_sha: String, environment: String) -> Result<()> {
    if commit_sha.is_empty() {
        anyhow::bail!("--commit-sha is required");
    }
    if environment.is_empty() {
        anyhow::bail!("--environment is required");
    }

    let pool = db::connect(&cfg)?;
    let store = Store::new(pool, cfg.trace_cache_max_entries);
    let service = build_trace_service(&cfg, store)?;

    let response = service.trace_images(&commit_sha, &environment).await?;
    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

async fn run_dbstatus(cfg: Config) -> Result<()> {
    println!("PostgreSQL Connection Status:");
    println!("=============================");
    println!("connection: {}", cfg.postgres_url);

    let pool = db::connect(&cfg)?;
    db::ping(&pool)
        .await
        .with_context(|| "database connection failed")?;
    println!("database connection successful");

    let store = Store::new(pool.clone(), cfg.trace_cache_max_entries);
    match migrate::status(&pool).await {
        Ok(status) => {
            let pending = status.iter().filter(|(_, applied)| !applied).count();
            println!("migrations: {} known, {} pending", status.len(), pending);
        }
        Err(err) => println!("migrations: unavailable ({})", err),
    }

    if let Ok(count) = store.count_prs().await {
        let unprocessed = store.count_unprocessed_prs(false).await.unwrap_or(0);
        println!("pr_embeddings: {} rows ({} unprocessed)", count, unprocessed);
        if let Ok(Some((merged_at, pr_number))) = store.latest_merged_pr().await {
            match merged_at {
                Some(at) => println!("latest merged PR: #{} at {}", pr_number, at.to_rfc3339()),
                None => println!("latest merged PR: #{}", pr_number),
            }
        }
        if let Ok(Some((merged_at, pr_number))) = store.oldest_merged_pr().await {
            match merged_at {
                Some(at) => println!("oldest merged PR: #{} at {}", pr_number, at.to_rfc3339()),
                None => println!("oldest merged PR: #{}", pr_number),
            }
        }
    }
    if let Ok(count) = store.count_documents().await {
        println!("documents: {} rows", count);
    }
    if let Ok(count) = store.trace_image_cache_count().await {
        println!("trace_image_cache: {} rows", count);
    }

    Ok(())
}
