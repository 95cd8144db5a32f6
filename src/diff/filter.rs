//! Generated-file filter for diff analysis.
//!
//! The pattern set is repository-specific and intentionally frozen; it
//! drops files whose diffs carry no reviewable signal (lockfiles, vendored
//! trees, generated stubs, rendered configs). Each pattern carries a
//! reason label recorded in the skip statistics.

use regex::Regex;

const IGNORE_PATTERNS: &[(&str, &str)] = &[
    ("package-lock", r"package-lock\.json$"),
    ("yarn-lock", r"yarn\.lock$"),
    ("pnpm-lock", r"pnpm-lock\.yaml$"),
    ("npm-shrinkwrap", r"npm-shrinkwrap\.json$"),
    ("go-sum", r"go\.sum$"),
    ("go-work-sum", r"go\.work\.sum$"),
    ("gomodcache", r"(^|/)vendor/"),
    ("node_modules", r"(^|/)node_modules/"),
    ("generated-go", r"\.(?:pb|pb\.gw|pb\.json|pb\.grpc)\.go$"),
    ("generated-client", r"\.generated\.(?:ts|js|py|go|rs|java)$"),
    ("typescript-snapshots", r"\.snap$"),
    ("openapi-json", r"api/common-types/.*\.json$"),
    ("rendered-config", r"config/rendered/.*"),
    ("digests", r"config/.*\.digests\.yaml$"),
    ("bicep-cache", r"dev-infrastructure/.+\.bicepparam$"),
    ("helm-render", r".*chart\.lock$"),
    ("lockfiles", r"\.lock$"),
    ("generated-json", r".*\.swagger\.json$"),
];

/// Compiled ignore patterns, reason → regex.
pub struct IgnorePatterns {
    patterns: Vec<(&'static str, Regex)>,
}

impl IgnorePatterns {
    pub fn new() -> Self {
        let patterns = IGNORE_PATTERNS
            .iter()
            .map(|(reason, pattern)| {
                let rx = Regex::new(pattern).expect("ignore patterns are statically valid");
                (*reason, rx)
            })
            .collect();
        IgnorePatterns { patterns }
    }

    /// Returns the reason label when `path` matches an ignore pattern.
    pub fn match_reason(&self, path: &str) -> Option<&'static str> {
        self.patterns
            .iter()
            .find(|(_, rx)| rx.is_match(path))
            .map(|(reason, _)| *reason)
    }
}

impl Default for IgnorePatterns {
    fn default() -> Self {
        Self::new()
    }
}

/// Partition file chunks into kept and skipped sets. Skipped entries carry
/// `(path, reason)`.
pub fn filter_generated_files(
    chunks: Vec<(String, String)>,
    patterns: &IgnorePatterns,
) -> (Vec<(String, String)>, Vec<(String, &'static str)>) {
    let mut included = Vec::new();
    let mut skipped = Vec::new();

    for (path, content) in chunks {
        match patterns.match_reason(&path) {
            Some(reason) => skipped.push((path, reason)),
            None => included.push((path, content)),
        }
    }

    (included, skipped)
}
