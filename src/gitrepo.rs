//! Repository driver over the external `git` binary.
//!
//! Every subcommand runs with a per-invocation timeout (default two
//! minutes) and is killed promptly when the caller's future is dropped.
//! Failures carry the subcommand and any stderr diagnostic; timeouts are
//! reported distinctly ("command timed out after ...").

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::sync::OnceCell;

/// Fetch specification that maps PR head refs into the local clone.
pub const PR_FETCH_SPEC: &str = "+refs/pull/*/head:refs/remotes/origin/pr/*";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

/// Process-wide guard for the one-shot PR fetch-spec setup.
static PR_FETCH_SPEC_INIT: OnceCell<()> = OnceCell::const_new();

/// Configuration for a local clone of a remote repository.
#[derive(Debug, Clone)]
pub struct RepoConfig {
    /// Remote URL; may be empty for operations on an existing clone.
    pub url: String,
    /// Local clone path.
    pub path: PathBuf,
    /// Remote name, defaults to `origin`.
    pub remote: String,
}

impl RepoConfig {
    pub fn new(url: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        RepoConfig {
            url: url.into(),
            path: path.into(),
            remote: "origin".to_string(),
        }
    }
}

/// Handle to a local repository, shared by the diff analyzer, docs
/// ingestion, the image tracer, and full-file search enrichment.
#[derive(Debug, Clone)]
pub struct GitRepo {
    cfg: RepoConfig,
    timeout: Duration,
}

impl GitRepo {
    pub fn new(cfg: RepoConfig) -> Self {
        GitRepo {
            cfg,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn path(&self) -> &Path {
        &self.cfg.path
    }

    /// Run a git subcommand in `dir` (or without a working directory when
    /// `dir` is `None`, as for clone).
    async fn git_in(&self, dir: Option<&Path>, args: &[&str]) -> Result<String> {
        let mut cmd = Command::new("git");
        cmd.args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = dir {
            cmd.current_dir(dir);
        }

        let output = match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(result) => result.with_context(|| {
                format!("git {}: failed to start (is git installed?)", args.join(" "))
            })?,
            // The dropped future kills the child via kill_on_drop.
            Err(_) => bail!(
                "git {}: command timed out after {:?}",
                args.join(" "),
                self.timeout
            ),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr = stderr.trim();
            if stderr.is_empty() {
                bail!("git {}: {}", args.join(" "), output.status);
            }
            bail!("git {}: {}: {}", args.join(" "), output.status, stderr);
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Execute an arbitrary git subcommand in the repository path.
    pub async fn run(&self, args: &[&str]) -> Result<String> {
        self.git_in(Some(&self.cfg.path), args).await
    }

    /// Clone the repository if the local path is missing, otherwise fetch.
    /// Returns the absolute clone path.
    pub async fn ensure(&self) -> Result<PathBuf> {
        let path = &self.cfg.path;
        if !path.join(".git").exists() {
            if self.cfg.url.is_empty() {
                bail!("repository {} does not exist and no URL is configured", path.display());
            }
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create clone parent directory: {}", parent.display())
                })?;
            }
            let path_str = path.to_string_lossy().into_owned();
            self.git_in(
                None,
                &[
                    "clone",
                    "--filter=blob:none",
                    "--no-tags",
                    &self.cfg.url,
                    &path_str,
                ],
            )
            .await?;
            tracing::info!(url = %self.cfg.url, path = %path.display(), "cloned repository");
        } else {
            self.fetch().await?;
        }
        Ok(std::fs::canonicalize(path).unwrap_or_else(|_| path.clone()))
    }

    /// Fetch from the remote, pruning deleted refs.
    pub async fn fetch(&self) -> Result<()> {
        self.run(&["fetch", "--prune", self.cfg.remote.as_str()])
            .await?;
        Ok(())
    }

    /// SHA of the current HEAD.
    pub async fn head_sha(&self) -> Result<String> {
        let out = self.run(&["rev-parse", "HEAD"]).await?;
        Ok(out.trim().to_string())
    }

    /// Detach HEAD at `ref`. No-op when already there.
    pub async fn checkout_detach(&self, reference: &str) -> Result<()> {
        if let Ok(head) = self.head_sha().await {
            if head == reference {
                return Ok(());
            }
        }
        self.run(&["checkout", "--detach", reference]).await?;
        Ok(())
    }

    /// Consolidated unified diff between `merge_sha^1` and `merge_sha`.
    pub async fn merge_diff(&self, merge_sha: &str) -> Result<String> {
        let parent = format!("{}^1", merge_sha);
        self.run(&[
            "diff",
            "--unified=3",
            "--no-color",
            "--no-ext-diff",
            "--find-renames",
            &parent,
            merge_sha,
        ])
        .await
    }

    /// Repo-relative file paths at `ref`.
    pub async fn list_files(&self, reference: &str) -> Result<Vec<String>> {
        let out = self
            .run(&["ls-tree", "-r", "--name-only", reference])
            .await?;
        Ok(out
            .lines()
            .filter(|l| !l.is_empty())
            .map(|l| l.to_string())
            .collect())
    }

    /// Read a file blob at `ref:path`.
    pub async fn show_file(&self, reference: &str, path: &str) -> Result<String> {
        let spec = format!("{}:{}", reference, path);
        self.run(&["show", &spec]).await
    }

    /// Create a detached worktree at `dir` for `ref`.
    pub async fn worktree_add_detach(&self, dir: &Path, reference: &str) -> Result<()> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create worktree directory: {}", dir.display()))?;
        let dir_str = dir.to_string_lossy().into_owned();
        self.run(&["worktree", "add", "--detach", &dir_str, reference])
            .await?;
        Ok(())
    }

    /// Remove the worktree at `dir`.
    pub async fn worktree_remove(&self, dir: &Path) -> Result<()> {
        let dir_str = dir.to_string_lossy().into_owned();
        self.run(&["worktree", "remove", &dir_str, "--force"]).await?;
        Ok(())
    }

    /// Whether `git config --local --get-all key` contains `value`.
    pub async fn config_has_local(&self, key: &str, value: &str) -> bool {
        match self.run(&["config", "--local", "--get-all", key]).await {
            Ok(out) => out.contains(value),
            Err(_) => false,
        }
    }

    /// Append a value to a multivalue local config key.
    pub async fn config_add_local(&self, key: &str, value: &str) -> Result<()> {
        self.run(&["config", "--local", "--add", key, value]).await?;
        Ok(())
    }

    /// Ensure the PR-ref fetch specification is present in the local
    /// config. Idempotent and serialized process-wide: concurrent callers
    /// wait for the first to finish, and re-runs are no-ops.
    pub async fn ensure_pr_fetch_spec(&self) -> Result<()> {
        PR_FETCH_SPEC_INIT
            .get_or_try_init(|| async {
                if self
                    .config_has_local("remote.origin.fetch", PR_FETCH_SPEC)
                    .await
                {
                    return Ok(());
                }
                self.config_add_local("remote.origin.fetch", PR_FETCH_SPEC)
                    .await?;
                tracing::info!("added PR fetch-spec to origin remote");
                Ok::<(), anyhow::Error>(())
            })
            .await?;
        Ok(())
    }
}
