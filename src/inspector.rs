//! Container image inspection via an external `skopeo` binary.
//!
//! The contract is deliberately small: given registry coordinates, return
//! the image's config labels. Manifest handling (single manifest vs
//! manifest list, platform selection) is an implementation detail hidden
//! behind [`ImageInspector`], so the tracer can be tested with a fake.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

const INSPECT_TIMEOUT: Duration = Duration::from_secs(120);

/// Fetch the labels of a container image identified by digest.
#[async_trait]
pub trait ImageInspector: Send + Sync {
    async fn image_labels(
        &self,
        registry: &str,
        repository: &str,
        digest: &str,
    ) -> Result<HashMap<String, String>>;
}

/// `skopeo`-backed inspector.
#[derive(Debug, Clone)]
pub struct SkopeoInspector {
    skopeo_path: String,
    authfile: Option<String>,
}

impl SkopeoInspector {
    pub fn new(skopeo_path: &str, authfile: Option<String>) -> Self {
        SkopeoInspector {
            skopeo_path: if skopeo_path.is_empty() {
                "skopeo".to_string()
            } else {
                skopeo_path.to_string()
            },
            authfile,
        }
    }

    async fn run(&self, args: &[String]) -> Result<String> {
        let mut cmd = Command::new(&self.skopeo_path);
        cmd.args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(INSPECT_TIMEOUT, cmd.output()).await {
            Ok(result) => result.with_context(|| {
                format!("skopeo {}: failed to start", args.join(" "))
            })?,
            Err(_) => bail!(
                "skopeo {}: command timed out after {:?}",
                args.join(" "),
                INSPECT_TIMEOUT
            ),
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "skopeo {}: {}: {}",
                args.join(" "),
                output.status,
                stderr.trim()
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn auth_args(&self) -> Vec<String> {
        match &self.authfile {
            Some(path) if !path.is_empty() => {
                vec!["--authfile".to_string(), path.clone()]
            }
            _ => Vec::new(),
        }
    }
}

#[async_trait]
impl ImageInspector for SkopeoInspector {
    async fn image_labels(
        &self,
        registry: &str,
        repository: &str,
        digest: &str,
    ) -> Result<HashMap<String, String>> {
        let image_ref = format!("{}/{}@{}", registry, repository, digest);

        let mut args = vec!["inspect".to_string(), "--raw".to_string()];
        args.extend(self.auth_args());
        args.push(format!("docker://{}", image_ref));
        let manifest = self.run(&args).await?;

        let config_ref = resolve_config_reference(&manifest, registry, repository, digest)?;

        let mut config_args = vec!["inspect".to_string(), "--config".to_string()];
        config_args.extend(self.auth_args());
        config_args.push(config_ref);
        let config = self.run(&config_args).await?;

        parse_config_labels(&config)
    }
}

/// Resolve the image reference whose config carries the labels.
///
/// Single manifests point at themselves. Manifest lists prefer the
/// `amd64`/`linux` entry and fall back to the first entry with a digest.
pub fn resolve_config_reference(
    manifest_json: &str,
    registry: &str,
    repository: &str,
    digest: &str,
) -> Result<String> {
    let manifest: serde_json::Value =
        serde_json::from_str(manifest_json).with_context(|| "parse image manifest")?;
    let media_type = manifest
        .get("mediaType")
        .and_then(|m| m.as_str())
        .unwrap_or_default();

    match media_type {
        "application/vnd.docker.distribution.manifest.v2+json"
        | "application/vnd.oci.image.manifest.v1+json" => {
            Ok(format!("docker://{}/{}@{}", registry, repository, digest))
        }
        "application/vnd.docker.distribution.manifest.list.v2+json"
        | "application/vnd.oci.image.index.v1+json" => {
            let entries = manifest
                .get("manifests")
                .and_then(|m| m.as_array())
                .cloned()
                .unwrap_or_default();

            let mut fallback: Option<String> = None;
            for entry in &entries {
                let Some(entry_digest) = entry.get("digest").and_then(|d| d.as_str()) else {
                    continue;
                };
                if fallback.is_none() {
                    fallback = Some(entry_digest.to_string());
                }
                let arch = entry
                    .pointer("/platform/architecture")
                    .and_then(|a| a.as_str());
                let os = entry.pointer("/platform/os").and_then(|o| o.as_str());
                if arch == Some("amd64") && os == Some("linux") {
                    return Ok(format!(
                        "docker://{}/{}@{}",
                        registry, repository, entry_digest
                    ));
                }
            }

            match fallback {
                Some(entry_digest) => Ok(format!(
                    "docker://{}/{}@{}",
                    registry, repository, entry_digest
                )),
                None => bail!("manifest list missing usable entries"),
            }
        }
        _ => Ok(format!("docker://{}/{}@{}", registry, repository, digest)),
    }
}

/// Extract `config.Labels` from a `skopeo inspect --config` payload.
pub fn parse_config_labels(config_json: &str) -> Result<HashMap<String, String>> {
    let config: serde_json::Value =
        serde_json::from_str(config_json).with_context(|| "parse image config")?;

    let mut labels = HashMap::new();
    if let Some(map) = config.pointer("/config/Labels").and_then(|l| l.as_object()) {
        for (key, value) in map {
            if let Some(value) = value.as_str() {
                if !key.is_empty() && !value.is_empty() {
                    labels.insert(key.clone(), value.to_string());
                }
            }
        }
    }
    Ok(labels)
}
