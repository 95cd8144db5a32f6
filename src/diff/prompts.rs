//! Fixed prompt templates for the map and reduce summarization stages.
//!
//! Placeholders are bound with plain string replacement; the templates are
//! deliberately constraining so narratives stay evidence-quoted and short.

pub const MAP_PROMPT_TEMPLATE: &str = r#"You are a code analysis tool. Analyze the diff chunk below and report concrete, observable code changes.

Context:
- Pull request title: {pr_title}
- File path: {file_path}

Rules:
- Only report facts directly visible in the diff (lines starting with '+' or '-').
- Never speculate or use words like "likely", "suggests", "appears", or "possibly".
- Each bullet must include a quoted snippet from the diff showing the change.
- Output exactly one bullet per distinct change, using the format:
  - [FILE: {file_path}] <concise description> — "<diff snippet>"
- Maximum 4 bullets; each under 20 words.

<diff>
{chunk_text}
</diff>

**Observed Changes:**
- [FILE: {file_path}] ...
- [FILE: {file_path}] ...
- [FILE: {file_path}] ...
- [FILE: {file_path}] ..."#;

pub const REDUCE_PROMPT_TEMPLATE: &str = r#"You are a technical summarizer. Your task is to analyze the provided Pull Request context and create a factual, concise, and structured summary of the changes.

## Rules:
1.  **Extract, Don't Infer:** Only report on changes explicitly mentioned in the context. Do not invent goals or risks.
2.  **Be Direct and Factual:** Use clear, technical language. Avoid buzzwords.
3.  **Use the Provided Structure:** Fill in the sections below.

**CONTEXT:**

**PR Title:**
{pr_title}

**PR Description:**
{pr_description}

**Summaries of Code Changes:**
{map_outputs}

---
**FACTUAL CHANGE SUMMARY:**

### 1. Stated Purpose
(Summarize the goal from the PR Title and Description in 1-2 sentences.)

### 2. Observed Code Changes
(Create a bulleted list of the most significant technical modifications based *only* on the provided code change summaries.)
-
-
- "#;

/// Bind the map template to one annotated diff chunk.
pub fn map_prompt(pr_title: &str, file_path: &str, chunk_text: &str) -> String {
    MAP_PROMPT_TEMPLATE
        .replace("{pr_title}", pr_title)
        .replace("{file_path}", file_path)
        .replace("{chunk_text}", chunk_text)
}

/// Bind the reduce template to the joined map outputs.
pub fn reduce_prompt(pr_title: &str, pr_description: &str, map_outputs: &str) -> String {
    REDUCE_PROMPT_TEMPLATE
        .replace("{pr_title}", pr_title)
        .replace("{pr_description}", pr_description)
        .replace("{map_outputs}", map_outputs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_prompt_binds_all_placeholders() {
        let prompt = map_prompt("Add retries", "pkg/client.go", "+retry()");
        assert!(prompt.contains("Add retries"));
        assert!(prompt.contains("pkg/client.go"));
        assert!(prompt.contains("+retry()"));
        assert!(!prompt.contains("{pr_title}"));
        assert!(!prompt.contains("{chunk_text}"));
    }

    #[test]
    fn test_reduce_prompt_binds_all_placeholders() {
        let prompt = reduce_prompt("Add retries", "Retries everywhere", "- bullet");
        assert!(prompt.contains("Add retries"));
        assert!(prompt.contains("Retries everywhere"));
        assert!(prompt.contains("- bullet"));
        assert!(!prompt.contains("{map_outputs}"));
    }
}
