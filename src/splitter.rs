//! Recursive character text splitter.
//!
//! Splits text into chunks no larger than a configured size by trying a
//! list of separators in priority order: a chunk that still exceeds the
//! limit is re-split with the next separator, down to a hard
//! character-window split as the final fallback. Separators stay attached
//! to the start of the following piece, so markdown headings and diff hunk
//! markers begin their chunk.
//!
//! Two configurations are used in this crate:
//! - documentation: ``["\n```", "\n# ", "\n## ", "\n### ", "\n- ", "\n* ", "\n", ""]``
//! - diffs: `["\n@@", "\ndiff --git", "\n", ""]`

/// A recursive splitter with a byte-size budget and character overlap.
#[derive(Debug, Clone)]
pub struct RecursiveSplitter {
    separators: Vec<String>,
    chunk_size: usize,
    overlap: usize,
}

/// Separator list for markdown-aware documentation chunking.
pub fn markdown_separators() -> Vec<String> {
    vec![
        "\n```".to_string(),
        "\n# ".to_string(),
        "\n## ".to_string(),
        "\n### ".to_string(),
        "\n- ".to_string(),
        "\n* ".to_string(),
        "\n".to_string(),
        String::new(),
    ]
}

/// Separator list for unified-diff chunking.
pub fn diff_separators() -> Vec<String> {
    vec![
        "\n@@".to_string(),
        "\ndiff --git".to_string(),
        "\n".to_string(),
        String::new(),
    ]
}

impl RecursiveSplitter {
    /// Create a splitter. `overlap` is clamped to half of `chunk_size` so
    /// windowed splits always make progress.
    pub fn new(separators: Vec<String>, chunk_size: usize, overlap: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        RecursiveSplitter {
            separators,
            chunk_size,
            overlap: overlap.min(chunk_size / 2),
        }
    }

    /// Split `text` into chunks of at most `chunk_size` bytes (hard splits
    /// measure characters, so multi-byte text never panics).
    pub fn split(&self, text: &str) -> Vec<String> {
        if text.len() <= self.chunk_size {
            return vec![text.to_string()];
        }
        self.split_with(text, 0)
    }

    fn split_with(&self, text: &str, sep_idx: usize) -> Vec<String> {
        let sep = match self.separators.get(sep_idx) {
            None => return self.hard_split(text),
            Some(s) if s.is_empty() => return self.hard_split(text),
            Some(s) if !text.contains(s.as_str()) => return self.split_with(text, sep_idx + 1),
            Some(s) => s.clone(),
        };

        // Re-attach the separator to the start of each following piece so
        // concatenation reconstructs the original text.
        let mut pieces: Vec<String> = Vec::new();
        for (i, part) in text.split(sep.as_str()).enumerate() {
            if i == 0 {
                if !part.is_empty() {
                    pieces.push(part.to_string());
                }
            } else {
                pieces.push(format!("{}{}", sep, part));
            }
        }

        let mut chunks = Vec::new();
        let mut buf = String::new();

        for piece in pieces {
            if piece.len() > self.chunk_size {
                if !buf.is_empty() {
                    chunks.push(std::mem::take(&mut buf));
                }
                chunks.extend(self.split_with(&piece, sep_idx + 1));
                continue;
            }

            if !buf.is_empty() && buf.len() + piece.len() > self.chunk_size {
                let tail = tail_chars(&buf, self.overlap);
                let seed = if self.overlap > 0 && tail.len() + piece.len() <= self.chunk_size {
                    tail.to_string()
                } else {
                    String::new()
                };
                chunks.push(std::mem::take(&mut buf));
                buf = seed;
            }
            buf.push_str(&piece);
        }

        if !buf.is_empty() {
            chunks.push(buf);
        }
        chunks
    }

    /// Final fallback: fixed character windows with overlap.
    fn hard_split(&self, text: &str) -> Vec<String> {
        let chars: Vec<char> = text.chars().collect();
        if chars.len() <= self.chunk_size {
            return vec![text.to_string()];
        }

        let step = self.chunk_size.saturating_sub(self.overlap).max(1);
        let mut chunks = Vec::new();
        let mut start = 0usize;
        while start < chars.len() {
            let end = (start + self.chunk_size).min(chars.len());
            chunks.push(chars[start..end].iter().collect());
            if end == chars.len() {
                break;
            }
            start += step;
        }
        chunks
    }
}

/// Last `n` characters of `s`, on a char boundary.
fn tail_chars(s: &str, n: usize) -> &str {
    if n == 0 {
        return "";
    }
    let count = s.chars().count();
    if count <= n {
        return s;
    }
    let idx = s
        .char_indices()
        .nth(count - n)
        .map(|(i, _)| i)
        .unwrap_or(0);
    &s[idx..]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn md_splitter(size: usize, overlap: usize) -> RecursiveSplitter {
        RecursiveSplitter::new(markdown_separators(), size, overlap)
    }

    #[test]
    fn test_small_text_single_chunk() {
        let chunks = md_splitter(100, 0).split("Hello, world!");
        assert_eq!(chunks, vec!["Hello, world!".to_string()]);
    }

    #[test]
    fn test_splits_on_headings() {
        let text = "intro text\n# One\nbody one\n# Two\nbody two";
        let chunks = md_splitter(20, 0).split(text);
        assert!(chunks.len() >= 2);
        assert!(chunks.iter().any(|c| c.starts_with("\n# One")));
        assert!(chunks.iter().any(|c| c.starts_with("\n# Two")));
    }

    #[test]
    fn test_respects_chunk_size() {
        let text = (0..40)
            .map(|i| format!("line number {}", i))
            .collect::<Vec<_>>()
            .join("\n");
        for chunk in md_splitter(64, 0).split(&text) {
            assert!(chunk.len() <= 64, "chunk too large: {:?}", chunk);
        }
    }

    #[test]
    fn test_reconstructs_without_overlap() {
        let text = "alpha\nbravo\ncharlie\ndelta\necho";
        let chunks = md_splitter(12, 0).split(&text);
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn test_overlap_repeats_tail() {
        let text = "aaaa\nbbbb\ncccc\ndddd";
        let chunks = md_splitter(10, 4).split(text);
        assert!(chunks.len() >= 2);
        for pair in chunks.windows(2) {
            let prev_tail = tail_chars(&pair[0], 4);
            assert!(
                pair[1].starts_with(prev_tail) || !pair[1].contains(prev_tail),
                "overlap seed missing between {:?} and {:?}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_hard_split_fallback() {
        let text = "x".repeat(50);
        let chunks = RecursiveSplitter::new(vec![String::new()], 16, 0).split(&text);
        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| c.len() <= 16));
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn test_multibyte_does_not_panic() {
        let text = "héllo wörld ünïcode ".repeat(20);
        let chunks = md_splitter(16, 4).split(&text);
        assert!(!chunks.is_empty());
    }

    #[test]
    fn test_diff_separators_split_on_hunks() {
        let text = "diff --git a/f b/f\n@@ -1 +1 @@\n-a\n+b\n@@ -9 +9 @@\n-c\n+d";
        let splitter = RecursiveSplitter::new(diff_separators(), 30, 0);
        let chunks = splitter.split(text);
        assert!(chunks.len() >= 2);
        assert!(chunks.iter().skip(1).any(|c| c.starts_with("\n@@")));
    }

    #[test]
    fn test_deterministic() {
        let text = "Alpha\n\nBeta\n\nGamma\n\nDelta".repeat(4);
        let a = md_splitter(24, 6).split(&text);
        let b = md_splitter(24, 6).split(&text);
        assert_eq!(a, b);
    }
}
