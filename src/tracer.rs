//! Deployment image tracer.
//!
//! Maps a configuration commit and a deployment environment to the set of
//! deployed container images, and through registry labels to the upstream
//! source commits that produced them.
//!
//! The component list, their config paths, and the registry fallbacks are
//! fixed properties of the platform repository. Environments resolve to a
//! YAML overlay file plus an optional base path inside it; the tracer
//! checks the commit out in a disposable worktree, reads the overlay, and
//! resolves each component in alphabetical order. Every failure is
//! recorded in the result (top-level or per component) and tracing
//! continues with whatever else can be resolved.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;

use crate::gitrepo::{GitRepo, RepoConfig};
use crate::inspector::ImageInspector;
use crate::models::{Component, TraceResult};

/// Label carrying the source commit in built images.
const VCS_REF_LABEL: &str = "vcs-ref";

/// Static description of one well-known component.
struct ComponentSpec {
    name: &'static str,
    /// Path of the image section within the environment config.
    config_path: &'static [&'static str],
    /// Fallbacks when the config omits registry or repository.
    registry: &'static str,
    repository: &'static str,
    source_repo: &'static str,
}

/// Well-known components in byte-order (the resolution order).
const COMPONENTS: &[ComponentSpec] = &[
    ComponentSpec {
        name: "ACM Operator",
        config_path: &["acm", "operator", "bundle"],
        registry: "quay.io",
        repository: "redhat-user-workloads/crt-redhat-acm-tenant/acm-operator-bundle-acm-214",
        source_repo: "https://github.com/stolostron/acm-operator-bundle",
    },
    ComponentSpec {
        name: "Backend",
        config_path: &["backend", "image"],
        registry: "arohcpsvcdev.azurecr.io",
        repository: "arohcpbackend",
        source_repo: "https://github.com/Azure/ARO-HCP",
    },
    ComponentSpec {
        name: "Cluster Service",
        config_path: &["clustersService", "image"],
        registry: "quay.io",
        repository: "app-sre/uhc-clusters-service",
        source_repo: "https://gitlab.cee.redhat.com/service/uhc-clusters-service",
    },
    ComponentSpec {
        name: "Frontend",
        config_path: &["frontend", "image"],
        registry: "arohcpsvcdev.azurecr.io",
        repository: "arohcpfrontend",
        source_repo: "https://github.com/Azure/ARO-HCP",
    },
    ComponentSpec {
        name: "Hypershift",
        config_path: &["hypershift", "image"],
        registry: "quay.io",
        repository: "acm-d/rhtap-hypershift-operator",
        source_repo: "https://github.com/openshift/hypershift",
    },
    ComponentSpec {
        name: "MCE",
        config_path: &["acm", "mce", "bundle"],
        registry: "quay.io",
        repository: "redhat-user-workloads/crt-redhat-acm-tenant/mce-operator-bundle-mce-29",
        source_repo: "https://github.com/stolostron/mce-operator-bundle",
    },
    ComponentSpec {
        name: "Maestro",
        config_path: &["maestro", "image"],
        registry: "quay.io",
        repository: "redhat-user-workloads/maestro-rhtap-tenant/maestro/maestro",
        source_repo: "https://github.com/openshift-online/maestro/",
    },
    ComponentSpec {
        name: "OcMirror",
        config_path: &["imageSync", "ocMirror", "image"],
        registry: "arohcpsvcdev.azurecr.io",
        repository: "image-sync/oc-mirror",
        source_repo: "https://github.com/openshift/oc-mirror",
    },
];

/// Environment → overlay file and base path inside it.
struct EnvSource {
    path: &'static str,
    base_path: &'static [&'static str],
}

fn environment_source(environment: &str) -> Option<EnvSource> {
    match environment {
        "dev" => Some(EnvSource {
            path: "config/rendered/dev/dev/westus3.yaml",
            base_path: &[],
        }),
        "int" => Some(EnvSource {
            path: "config/config.msft.clouds-overlay.yaml",
            base_path: &["clouds", "public", "environments", "int", "defaults"],
        }),
        "stg" => Some(EnvSource {
            path: "config/config.msft.clouds-overlay.yaml",
            base_path: &["clouds", "public", "environments", "stg", "defaults"],
        }),
        "prod" => Some(EnvSource {
            path: "config/config.msft.clouds-overlay.yaml",
            base_path: &["clouds", "public", "environments", "prod", "defaults"],
        }),
        _ => None,
    }
}

/// Supported environment names, for tool schemas and validation.
pub const ENVIRONMENTS: &[&str] = &["dev", "int", "stg", "prod"];

#[derive(Debug, Clone)]
pub struct TracerConfig {
    pub repo_path: std::path::PathBuf,
    pub repo_url: String,
}

/// The tracer. Depends on the repository driver and the image inspector;
/// the cache-aware service composes on top.
pub struct Tracer {
    repo: GitRepo,
    inspector: Arc<dyn ImageInspector>,
}

impl Tracer {
    pub fn new(cfg: TracerConfig, inspector: Arc<dyn ImageInspector>) -> Result<Self> {
        if cfg.repo_path.as_os_str().is_empty() {
            anyhow::bail!("repo path is required");
        }
        let repo = GitRepo::new(RepoConfig::new(cfg.repo_url, cfg.repo_path));
        Ok(Tracer { repo, inspector })
    }

    /// Trace every well-known component at `(commit, environment)`.
    ///
    /// Only unsupported environments are a hard error; everything else is
    /// captured inside the result so the caller always gets as many
    /// resolved components as possible.
    pub async fn trace(&self, commit_sha: &str, environment: &str) -> Result<TraceResult> {
        let mut result = TraceResult {
            commit_sha: commit_sha.to_string(),
            environment: environment.to_string(),
            components: Vec::new(),
            errors: Vec::new(),
        };

        let Some(source) = environment_source(environment) else {
            anyhow::bail!("unsupported environment: {}", environment);
        };

        if let Err(err) = self.repo.ensure().await {
            tracing::error!(error = %err, "prepare repo failed");
            result.errors.push(format!("prepare repo: {}", err));
            return Ok(result);
        }

        if let Err(err) = self.repo.run(&["rev-parse", commit_sha]).await {
            return Err(err).with_context(|| format!("resolve commit {}", commit_sha));
        }

        // Disposable worktree; removed on every exit path.
        let checkout = tempfile::Builder::new()
            .prefix("fabric-trace-")
            .tempdir()
            .with_context(|| "create temp checkout")?;
        let worktree_dir = checkout.path().join("wt");
        self.repo
            .worktree_add_detach(&worktree_dir, commit_sha)
            .await
            .with_context(|| "create worktree")?;

        let trace_outcome = self
            .trace_in_worktree(&worktree_dir, &source, &mut result)
            .await;

        if let Err(err) = self.repo.worktree_remove(&worktree_dir).await {
            tracing::warn!(dir = %worktree_dir.display(), error = %err, "remove worktree failed");
        }

        trace_outcome?;
        Ok(result)
    }

    async fn trace_in_worktree(
        &self,
        worktree: &Path,
        source: &EnvSource,
        result: &mut TraceResult,
    ) -> Result<()> {
        let env_config = match load_environment_config(worktree, source) {
            Ok(config) => config,
            Err(err) => {
                result.errors.push(format!("extract images: {}", err));
                return Ok(());
            }
        };

        for spec in COMPONENTS {
            let section = get_nested(&env_config, spec.config_path);
            let mut component = resolve_component(spec, section);

            if component.error.is_none() {
                match self
                    .inspector
                    .image_labels(&component.registry, &component.repository, &component.digest)
                    .await
                {
                    Ok(labels) => {
                        if let Some(sha) = labels.get(VCS_REF_LABEL).filter(|s| !s.is_empty()) {
                            component.source_sha = Some(sha.clone());
                        }
                    }
                    Err(err) => {
                        tracing::error!(component = spec.name, error = %err, "inspect image failed");
                        result.errors.push(format!("inspect {}: {}", spec.name, err));
                        component.error = Some(err.to_string());
                    }
                }
            } else if let Some(error) = &component.error {
                result.errors.push(error.clone());
            }

            result.components.push(component);
        }

        Ok(())
    }
}

/// Resolve one component from its config section, applying the built-in
/// registry/repository fallbacks. A component missing either coordinate
/// gets a component-level error instead of aborting the trace.
fn resolve_component(spec: &ComponentSpec, section: Option<&serde_yaml::Value>) -> Component {
    let registry = string_at(section, "registry").unwrap_or_else(|| spec.registry.to_string());
    let repository = string_at(section, "repository").unwrap_or_else(|| spec.repository.to_string());
    let digest = string_at(section, "digest").unwrap_or_default();

    let mut component = Component {
        name: spec.name.to_string(),
        registry,
        repository,
        digest,
        source_sha: None,
        source_repo_url: if spec.source_repo.is_empty() {
            None
        } else {
            Some(spec.source_repo.to_string())
        },
        error: None,
    };

    if component.registry.is_empty() || component.repository.is_empty() || component.digest.is_empty()
    {
        component.error = Some(format!(
            "missing registry or repository for {}",
            spec.name
        ));
    }

    component
}

/// Read the environment overlay and descend into its base path.
fn load_environment_config(root: &Path, source: &EnvSource) -> Result<serde_yaml::Value> {
    let config_path = root.join(source.path);
    let data = std::fs::read_to_string(&config_path)
        .with_context(|| format!("read config {}", config_path.display()))?;

    let raw: serde_yaml::Value = serde_yaml::from_str(&data)
        .with_context(|| format!("parse config {}", config_path.display()))?;

    if source.base_path.is_empty() {
        return Ok(raw);
    }

    match get_nested(&raw, source.base_path) {
        Some(section) => Ok(section.clone()),
        None => anyhow::bail!(
            "path {} not found in {}",
            source.base_path.join("."),
            config_path.display()
        ),
    }
}

/// Walk a nested mapping by key path.
fn get_nested<'a>(value: &'a serde_yaml::Value, path: &[&str]) -> Option<&'a serde_yaml::Value> {
    let mut current = value;
    for key in path {
        current = current.get(key)?;
    }
    if current.is_mapping() {
        Some(current)
    } else {
        None
    }
}

fn string_at(section: Option<&serde_yaml::Value>, key: &str) -> Option<String> {
    section?
        .get(key)
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}
