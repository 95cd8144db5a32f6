//! Repository driver tests against real git fixtures.
//!
//! Each test builds a throwaway repository in a temp directory. When the
//! `git` binary is unavailable the tests print a notice and pass, since
//! the driver is a thin shell over it.

use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;

use platform_fabric::gitrepo::{GitRepo, RepoConfig, PR_FETCH_SPEC};

fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn git(dir: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("run git");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
}

/// Initialize a repository with one commit containing `files`.
fn init_repo(root: &Path, files: &[(&str, &str)]) -> PathBuf {
    let repo = root.join("repo");
    std::fs::create_dir_all(&repo).unwrap();
    git(&repo, &["init", "--initial-branch", "main"]);
    git(&repo, &["config", "user.email", "test@example.com"]);
    git(&repo, &["config", "user.name", "Test"]);
    for (path, content) in files {
        let full = repo.join(path);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(full, content).unwrap();
    }
    git(&repo, &["add", "."]);
    git(&repo, &["commit", "-m", "initial"]);
    repo
}

#[tokio::test]
async fn test_head_list_and_show() {
    if !git_available() {
        eprintln!("git not available; skipping");
        return;
    }
    let tmp = TempDir::new().unwrap();
    let path = init_repo(
        tmp.path(),
        &[
            ("README.md", "# Fixture\n"),
            ("docs/guide.md", "guide body\n"),
        ],
    );

    let repo = GitRepo::new(RepoConfig::new("", path));
    let head = repo.head_sha().await.unwrap();
    assert_eq!(head.len(), 40);

    let files = repo.list_files(&head).await.unwrap();
    assert!(files.contains(&"README.md".to_string()));
    assert!(files.contains(&"docs/guide.md".to_string()));

    let content = repo.show_file(&head, "docs/guide.md").await.unwrap();
    assert_eq!(content, "guide body\n");

    let missing = repo.show_file(&head, "nope.md").await;
    assert!(missing.is_err());
    let message = missing.unwrap_err().to_string();
    assert!(message.contains("git show"), "error names the subcommand: {}", message);
}

#[tokio::test]
async fn test_merge_diff_covers_merge_range() {
    if !git_available() {
        eprintln!("git not available; skipping");
        return;
    }
    let tmp = TempDir::new().unwrap();
    let path = init_repo(tmp.path(), &[("app.txt", "one\n")]);

    // Branch, change, and merge with an explicit merge commit.
    git(&path, &["checkout", "-b", "feature"]);
    std::fs::write(path.join("app.txt"), "one\ntwo\n").unwrap();
    git(&path, &["commit", "-am", "add two"]);
    git(&path, &["checkout", "main"]);
    git(&path, &["merge", "--no-ff", "feature", "-m", "merge feature"]);

    let repo = GitRepo::new(RepoConfig::new("", path));
    let merge_sha = repo.head_sha().await.unwrap();
    let diff = repo.merge_diff(&merge_sha).await.unwrap();
    assert!(diff.contains("diff --git a/app.txt b/app.txt"));
    assert!(diff.contains("+two"));
}

#[tokio::test]
async fn test_checkout_detach_moves_head() {
    if !git_available() {
        eprintln!("git not available; skipping");
        return;
    }
    let tmp = TempDir::new().unwrap();
    let path = init_repo(tmp.path(), &[("file.txt", "v1\n")]);

    let repo = GitRepo::new(RepoConfig::new("", path.clone()));
    let first = repo.head_sha().await.unwrap();

    std::fs::write(path.join("file.txt"), "v2\n").unwrap();
    git(&path, &["commit", "-am", "second"]);
    let second = repo.head_sha().await.unwrap();
    assert_ne!(first, second);

    repo.checkout_detach(&first).await.unwrap();
    assert_eq!(repo.head_sha().await.unwrap(), first);

    // Detaching at the current HEAD is a no-op.
    repo.checkout_detach(&first).await.unwrap();
    assert_eq!(repo.head_sha().await.unwrap(), first);
}

#[tokio::test]
async fn test_worktree_add_and_remove() {
    if !git_available() {
        eprintln!("git not available; skipping");
        return;
    }
    let tmp = TempDir::new().unwrap();
    let path = init_repo(tmp.path(), &[("file.txt", "content\n")]);

    let repo = GitRepo::new(RepoConfig::new("", path));
    let head = repo.head_sha().await.unwrap();

    let worktree = tmp.path().join("wt");
    repo.worktree_add_detach(&worktree, &head).await.unwrap();
    assert!(worktree.join("file.txt").exists());

    repo.worktree_remove(&worktree).await.unwrap();
    assert!(!worktree.join("file.txt").exists());
}

#[tokio::test]
async fn test_local_config_roundtrip() {
    if !git_available() {
        eprintln!("git not available; skipping");
        return;
    }
    let tmp = TempDir::new().unwrap();
    let path = init_repo(tmp.path(), &[("file.txt", "x\n")]);

    let repo = GitRepo::new(RepoConfig::new("", path));
    assert!(!repo.config_has_local("remote.origin.fetch", PR_FETCH_SPEC).await);

    repo.config_add_local("remote.origin.fetch", PR_FETCH_SPEC)
        .await
        .unwrap();
    assert!(repo.config_has_local("remote.origin.fetch", PR_FETCH_SPEC).await);
}

#[tokio::test]
async fn test_ensure_clones_from_local_remote() {
    if !git_available() {
        eprintln!("git not available; skipping");
        return;
    }
    let tmp = TempDir::new().unwrap();
    let origin = init_repo(tmp.path(), &[("file.txt", "x\n")]);

    let clone_path = tmp.path().join("clone");
    let repo = GitRepo::new(RepoConfig::new(
        origin.to_string_lossy().into_owned(),
        clone_path.clone(),
    ));

    repo.ensure().await.unwrap();
    assert!(clone_path.join(".git").exists());

    // Second ensure fetches instead of cloning.
    repo.ensure().await.unwrap();
    let head = repo.head_sha().await.unwrap();
    assert_eq!(head.len(), 40);
}
