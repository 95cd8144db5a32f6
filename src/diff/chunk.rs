//! Diff partitioning and token-budgeted chunking.
//!
//! A consolidated merge diff is split at each `diff --git` header into
//! per-file chunks, then each file is recursively split so every emitted
//! document fits the map-stage token budget (three quarters of the model
//! context). Emitted documents carry a `File:`/`Chunk:` header so the map
//! prompt can cite its source.

use regex::Regex;
use std::sync::OnceLock;

use crate::splitter::{diff_separators, RecursiveSplitter};

/// Character-per-token approximation used when no tokenizer is available.
pub const APPROX_CHARS_PER_TOKEN: usize = 4;

/// Overlap between adjacent chunks of one oversized file, in tokens.
const CHUNK_OVERLAP_TOKENS: usize = 400;

/// One annotated document headed for the map stage.
#[derive(Debug, Clone)]
pub struct DiffDocument {
    pub file_path: String,
    pub content: String,
    pub token_count: usize,
}

/// Chunking statistics reported after preparation.
#[derive(Debug, Clone, Default)]
pub struct DocumentStats {
    pub files_total: usize,
    pub files_included: usize,
    pub files_filtered: usize,
    pub max_tokens: usize,
    pub median_tokens: usize,
}

fn diff_header_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?m)^diff --git a/(?P<old>.*?) b/(?P<new>.*?)$")
            .expect("diff header pattern is statically valid")
    })
}

/// Estimate the token count of a text: `len/4`, never below 1.
pub fn estimate_tokens(text: &str) -> usize {
    (text.len() / APPROX_CHARS_PER_TOKEN).max(1)
}

/// Partition a unified diff at each `diff --git` header.
///
/// Returns `(path, chunk)` pairs where the path is the post-image path, or
/// the pre-image path when the file was deleted (`/dev/null` post-image).
pub fn split_diff_into_files(diff_text: &str) -> Vec<(String, String)> {
    if diff_text.trim().is_empty() {
        return Vec::new();
    }

    let re = diff_header_regex();
    let starts: Vec<usize> = re.find_iter(diff_text).map(|m| m.start()).collect();
    if starts.is_empty() {
        return Vec::new();
    }

    let mut results = Vec::with_capacity(starts.len());
    for (i, &start) in starts.iter().enumerate() {
        let end = starts.get(i + 1).copied().unwrap_or(diff_text.len());
        let chunk = diff_text[start..end].trim();
        let Some(captures) = re.captures(chunk) else {
            let preview: String = chunk.chars().take(80).collect();
            tracing::debug!(preview = %preview, "skip chunk without header");
            continue;
        };
        let old_path = captures.name("old").map(|m| m.as_str()).unwrap_or_default();
        let new_path = captures.name("new").map(|m| m.as_str()).unwrap_or_default();
        let file = if new_path == "/dev/null" { old_path } else { new_path };
        results.push((file.to_string(), chunk.to_string()));
    }
    results
}

/// Chunk each included file to the token budget and annotate the result.
pub fn build_documents(
    chunks: &[(String, String)],
    max_context_tokens: usize,
) -> (Vec<DiffDocument>, DocumentStats) {
    let context = if max_context_tokens == 0 { 4096 } else { max_context_tokens };
    let target_tokens = context * 3 / 4;
    let splitter = RecursiveSplitter::new(
        diff_separators(),
        target_tokens * APPROX_CHARS_PER_TOKEN,
        CHUNK_OVERLAP_TOKENS * APPROX_CHARS_PER_TOKEN,
    );

    let mut docs = Vec::new();
    let mut token_counts = Vec::new();

    for (path, content) in chunks {
        let parts = if estimate_tokens(content) <= target_tokens {
            vec![content.clone()]
        } else {
            splitter.split(content)
        };

        let total = parts.len();
        for (idx, part) in parts.into_iter().enumerate() {
            let annotated = annotate_chunk(&part, path, idx, total);
            let token_count = estimate_tokens(&annotated);
            token_counts.push(token_count);
            docs.push(DiffDocument {
                file_path: path.clone(),
                content: annotated,
                token_count,
            });
        }
    }

    let mut stats = DocumentStats {
        files_total: chunks.len(),
        files_included: chunks.len(),
        files_filtered: 0,
        max_tokens: 0,
        median_tokens: 0,
    };
    if !token_counts.is_empty() {
        token_counts.sort_unstable();
        stats.max_tokens = *token_counts.last().expect("non-empty");
        stats.median_tokens = token_counts[token_counts.len() / 2];
    }

    (docs, stats)
}

/// Prefix a chunk with its file path and, when the file was split, its
/// position in the sequence.
fn annotate_chunk(content: &str, path: &str, index: usize, total: usize) -> String {
    let mut header = format!("File: {}\n", path);
    if total > 1 {
        header.push_str(&format!("Chunk: {}/{}\n", index + 1, total));
    }
    header.push('\n');
    header + content.trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_FILE_DIFF: &str = "diff --git a/file1.txt b/file1.txt
index 123..456 100644
--- a/file1.txt
+++ b/file1.txt
@@ -1 +1 @@
-foo
+bar

diff --git a/file2.txt b/file2.txt
index 789..abc 100644
--- a/file2.txt
+++ b/file2.txt
@@ -1 +1 @@
-baz
+qux
";

    #[test]
    fn test_split_diff_into_files() {
        let chunks = split_diff_into_files(TWO_FILE_DIFF);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].0, "file1.txt");
        assert_eq!(chunks[1].0, "file2.txt");
        assert!(chunks[0].1.contains("+bar"));
        assert!(chunks[1].1.contains("+qux"));
    }

    #[test]
    fn test_split_empty_diff() {
        assert!(split_diff_into_files("").is_empty());
        assert!(split_diff_into_files("  \n ").is_empty());
        assert!(split_diff_into_files("no headers here").is_empty());
    }

    #[test]
    fn test_deleted_file_uses_old_path() {
        let diff = "diff --git a/gone.txt b//dev/null\n@@ -1 +0,0 @@\n-bye\n";
        let chunks = split_diff_into_files(diff);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].0, "gone.txt");
    }

    #[test]
    fn test_small_file_single_document() {
        let chunks = split_diff_into_files(TWO_FILE_DIFF);
        let (docs, stats) = build_documents(&chunks, 4096);
        assert_eq!(docs.len(), 2);
        assert!(docs[0].content.starts_with("File: file1.txt\n"));
        assert!(!docs[0].content.contains("Chunk:"));
        assert_eq!(stats.files_included, 2);
    }

    #[test]
    fn test_large_file_is_split_and_annotated() {
        let mut body = String::from("diff --git a/big.txt b/big.txt\n@@ -0,0 +1,0 @@\n");
        for i in 0..400 {
            body.push_str(&format!("+line number {}\n", i));
        }
        let chunks = split_diff_into_files(&body);
        // Context of 40 tokens → 30-token budget → ~120 chars per chunk.
        let (docs, stats) = build_documents(&chunks, 40);
        assert!(docs.len() > 1, "expected the oversized file to split");
        for doc in &docs {
            assert!(doc.content.starts_with("File: big.txt\nChunk: "));
        }
        assert!(stats.max_tokens > 0);
        assert!(stats.median_tokens > 0);
    }

    #[test]
    fn test_estimate_tokens_floor() {
        assert_eq!(estimate_tokens(""), 1);
        assert_eq!(estimate_tokens("abcd"), 1);
        assert_eq!(estimate_tokens(&"x".repeat(400)), 100);
    }
}
