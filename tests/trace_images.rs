//! Image tracer and cache-policy tests over a real git fixture with a
//! fake inspector and an in-memory cache.
//!
//! Covers the contract the retrieval layer depends on: clean traces are
//! cached and served without re-invoking the inspector; traces with any
//! error are returned but never cached.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use platform_fabric::inspector::ImageInspector;
use platform_fabric::models::TraceResult;
use platform_fabric::trace_service::{TraceCache, TraceService};
use platform_fabric::tracer::{Tracer, TracerConfig};

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

const COMPONENT_SECTIONS: &[(&str, &str)] = &[
    ("backend:\n  image:\n", "backend"),
    ("frontend:\n  image:\n", "frontend"),
    ("clustersService:\n  image:\n", "clusters-service"),
    ("maestro:\n  image:\n", "maestro"),
    ("hypershift:\n  image:\n", "hypershift"),
];

/// Environment overlay with every well-known component populated.
/// `broken` drops the backend digest to force a component error.
fn overlay_yaml(broken: bool) -> String {
    let mut defaults = String::new();
    let digest_line = |name: &str| format!("              digest: sha256:{}\n", name);
    let section = |head: &str, name: &str, with_digest: bool| {
        let mut s = String::new();
        for line in head.lines() {
            s.push_str("          ");
            s.push_str(line);
            s.push('\n');
        }
        s.push_str("              registry: registry.example\n");
        s.push_str(&format!("              repository: images/{}\n", name));
        if with_digest {
            s.push_str(&digest_line(name));
        }
        s
    };

    for (head, name) in COMPONENT_SECTIONS {
        let with_digest = !(broken && *name == "backend");
        defaults.push_str(&section(head, name, with_digest));
    }
    // Nested bundle sections.
    defaults.push_str("          acm:\n            operator:\n              bundle:\n");
    defaults.push_str("                registry: registry.example\n");
    defaults.push_str("                repository: images/acm-operator\n");
    defaults.push_str("                digest: sha256:acm-operator\n");
    defaults.push_str("            mce:\n              bundle:\n");
    defaults.push_str("                registry: registry.example\n");
    defaults.push_str("                repository: images/mce\n");
    defaults.push_str("                digest: sha256:mce\n");
    defaults.push_str("          imageSync:\n            ocMirror:\n              image:\n");
    defaults.push_str("                registry: registry.example\n");
    defaults.push_str("                repository: images/oc-mirror\n");
    defaults.push_str("                digest: sha256:oc-mirror\n");

    format!(
        "clouds:\n  public:\n    environments:\n      int:\n        defaults:\n{}",
        defaults
    )
}

/// Build the platform-repo fixture and return `(repo_path, commit_sha)`.
fn init_platform_repo(root: &Path, broken: bool) -> (PathBuf, String) {
    let repo = root.join("platform");
    let config_dir = repo.join("config");
    std::fs::create_dir_all(&config_dir).unwrap();
    std::fs::write(
        config_dir.join("config.msft.clouds-overlay.yaml"),
        overlay_yaml(broken),
    )
    .unwrap();

    git(&repo, &["init", "--initial-branch", "main"]);
    git(&repo, &["config", "user.email", "test@example.com"]);
    git(&repo, &["config", "user.name", "Test"]);
    git(&repo, &["add", "."]);
    git(&repo, &["commit", "-m", "overlay"]);
    // Point origin at ourselves so the tracer's fetch succeeds.
    let self_url = repo.to_string_lossy().into_owned();
    git(&repo, &["remote", "add", "origin", &self_url]);

    let output = Command::new("git")
        .args(["rev-parse", "HEAD"])
        .current_dir(&repo)
        .output()
        .unwrap();
    let sha = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (repo, sha)
}

/// Inspector double returning fixed labels and counting invocations.
struct FakeInspector {
    calls: AtomicUsize,
}

impl FakeInspector {
    fn new() -> Self {
        FakeInspector {
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ImageInspector for FakeInspector {
    async fn image_labels(
        &self,
        _registry: &str,
        repository: &str,
        _digest: &str,
    ) -> Result<HashMap<String, String>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut labels = HashMap::new();
        labels.insert(
            "vcs-ref".to_string(),
            format!("source-of-{}", repository.rsplit('/').next().unwrap()),
        );
        Ok(labels)
    }
}

/// Cache double recording entries in memory.
#[derive(Default)]
struct MemoryCache {
    entries: Mutex<HashMap<(String, String), TraceResult>>,
}

impl MemoryCache {
    fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

/// Local newtype so the `TraceCache` impl below satisfies the orphan rule
/// (both `TraceCache` and `Arc<MemoryCache>` are foreign to this test crate).
struct SharedCache(Arc<MemoryCache>);

#[async_trait]
impl TraceCache for SharedCache {
    async fn get(&self, commit_sha: &str, environment: &str) -> Result<Option<TraceResult>> {
        Ok(self
            .0
            .entries
            .lock()
            .unwrap()
            .get(&(commit_sha.to_string(), environment.to_string()))
            .cloned())
    }

    async fn upsert(
        &self,
        commit_sha: &str,
        environment: &str,
        response: &TraceResult,
    ) -> Result<()> {
        self.0.entries.lock().unwrap().insert(
            (commit_sha.to_string(), environment.to_string()),
            response.clone(),
        );
        Ok(())
    }
}

fn service_for(
    repo_path: PathBuf,
    inspector: Arc<FakeInspector>,
    cache: Arc<MemoryCache>,
) -> TraceService {
    let tracer = Tracer::new(
        TracerConfig {
            repo_path,
            repo_url: String::new(),
        },
        inspector,
    )
    .unwrap();
    TraceService::new(tracer, Box::new(SharedCache(cache)))
}

#[tokio::test]
async fn test_clean_trace_is_cached_and_served_from_cache() {
    if !git_available() {
        eprintln!("git not available; skipping");
        return;
    }
    let tmp = TempDir::new().unwrap();
    let (repo_path, commit) = init_platform_repo(tmp.path(), false);

    let inspector = Arc::new(FakeInspector::new());
    let cache = Arc::new(MemoryCache::default());
    let service = service_for(repo_path, inspector.clone(), cache.clone());

    let first = service.trace_images(&commit, "int").await.unwrap();
    assert!(first.errors.is_empty(), "errors: {:?}", first.errors);
    assert_eq!(first.components.len(), 8);
    assert!(first
        .components
        .iter()
        .all(|c| c.source_sha.is_some() && c.error.is_none()));
    assert_eq!(cache.len(), 1, "clean trace is cached");
    let first_calls = inspector.calls.load(Ordering::SeqCst);
    assert_eq!(first_calls, 8, "one inspection per component");

    // Second call: cache hit, identical result, inspector untouched.
    let second = service.trace_images(&commit, "int").await.unwrap();
    assert_eq!(second, first);
    assert_eq!(inspector.calls.load(Ordering::SeqCst), first_calls);
}

#[tokio::test]
async fn test_trace_with_component_error_is_not_cached() {
    if !git_available() {
        eprintln!("git not available; skipping");
        return;
    }
    let tmp = TempDir::new().unwrap();
    let (repo_path, commit) = init_platform_repo(tmp.path(), true);

    let inspector = Arc::new(FakeInspector::new());
    let cache = Arc::new(MemoryCache::default());
    let service = service_for(repo_path, inspector.clone(), cache.clone());

    let result = service.trace_images(&commit, "int").await.unwrap();
    assert!(!result.errors.is_empty());
    let backend = result
        .components
        .iter()
        .find(|c| c.name == "Backend")
        .unwrap();
    assert!(backend.error.is_some());
    assert_eq!(cache.len(), 0, "dirty trace must not be cached");

    // Other components are still resolved.
    let maestro = result
        .components
        .iter()
        .find(|c| c.name == "Maestro")
        .unwrap();
    assert!(maestro.source_sha.is_some());
}

#[tokio::test]
async fn test_unknown_environment_is_an_error() {
    if !git_available() {
        eprintln!("git not available; skipping");
        return;
    }
    let tmp = TempDir::new().unwrap();
    let (repo_path, commit) = init_platform_repo(tmp.path(), false);

    let inspector = Arc::new(FakeInspector::new());
    let cache = Arc::new(MemoryCache::default());
    let service = service_for(repo_path, inspector, cache.clone());

    let err = service.trace_images(&commit, "staging").await.unwrap_err();
    assert!(err.to_string().contains("unsupported environment"));
    assert_eq!(cache.len(), 0);
}

#[tokio::test]
async fn test_unresolvable_commit_is_an_error() {
    if !git_available() {
        eprintln!("git not available; skipping");
        return;
    }
    let tmp = TempDir::new().unwrap();
    let (repo_path, _) = init_platform_repo(tmp.path(), false);

    let inspector = Arc::new(FakeInspector::new());
    let cache = Arc::new(MemoryCache::default());
    let service = service_for(repo_path, inspector, cache);

    let bogus = "b".repeat(40);
    let err = service.trace_images(&bogus, "int").await.unwrap_err();
    assert!(err.to_string().contains("resolve commit"));
}
