//! Progress log (`spec.md` §4.6 step 8): an append-only
//! `ralph-progress.md` in the execution's worktree, plus a deduplicated
//! "Codebase Patterns" section collected from entries that call one
//! out.
//!
//! Grounded on `harness::types::ProgressEntry`'s append-only-log
//! convention, extended with the pattern-extraction `spec.md` asks for
//! that the teacher's entry type does not have.

use crate::error::RalphResult;
use chrono::Utc;
use std::path::Path;

const PROGRESS_FILE: &str = "ralph-progress.md";
const PATTERNS_HEADER: &str = "## Codebase Patterns";
const PATTERN_PREFIX: &str = "Codebase Pattern:";

/// Append one entry for `story_id` with the given `notes`, pulling any
/// `Codebase Pattern: ...` lines out of `notes` into the top-of-file
/// patterns section (deduplicated, insertion order preserved).
pub fn append_progress_entry(worktree: &Path, story_id: &str, notes: &str) -> RalphResult<()> {
    let path = worktree.join(PROGRESS_FILE);
    let existing = std::fs::read_to_string(&path).unwrap_or_default();
    let (mut patterns, body) = split_patterns_section(&existing);

    let new_patterns: Vec<&str> = notes
        .lines()
        .filter_map(|line| line.trim().strip_prefix(PATTERN_PREFIX))
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .collect();
    for pattern in new_patterns {
        if !patterns.iter().any(|p| p == pattern) {
            patterns.push(pattern.to_string());
        }
    }

    let entry = format!(
        "### {} -- {}\n{}\n",
        Utc::now().to_rfc3339(),
        story_id,
        if notes.trim().is_empty() { "(no notes)" } else { notes.trim() }
    );

    let mut rendered = String::new();
    if !patterns.is_empty() {
        rendered.push_str(PATTERNS_HEADER);
        rendered.push('\n');
        for pattern in &patterns {
            rendered.push_str("- ");
            rendered.push_str(pattern);
            rendered.push('\n');
        }
        rendered.push('\n');
    }
    rendered.push_str(body.trim_start());
    if !rendered.ends_with('\n') && !rendered.is_empty() {
        rendered.push('\n');
    }
    rendered.push_str(&entry);

    std::fs::write(&path, rendered)?;
    Ok(())
}

/// Split a progress-log's existing content into `(patterns, rest)`.
fn split_patterns_section(content: &str) -> (Vec<String>, String) {
    let Some(header_pos) = content.find(PATTERNS_HEADER) else {
        return (Vec::new(), content.to_string());
    };
    let after_header = &content[header_pos + PATTERNS_HEADER.len()..];
    let section_end = after_header.find("\n\n").map(|i| i + 2).unwrap_or(after_header.len());
    let patterns = after_header[..section_end]
        .lines()
        .filter_map(|l| l.trim().strip_prefix("- "))
        .map(str::trim)
        .map(str::to_string)
        .collect();
    let rest = format!("{}{}", &content[..header_pos], &after_header[section_end..]);
    (patterns, rest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn appends_entry_and_extracts_pattern() {
        let dir = tempdir().unwrap();
        append_progress_entry(
            dir.path(),
            "US-1",
            "did the thing\nCodebase Pattern: use StateLock for cross-process writes",
        )
        .unwrap();
        let content = std::fs::read_to_string(dir.path().join(PROGRESS_FILE)).unwrap();
        assert!(content.contains("use StateLock for cross-process writes"));
        assert!(content.contains("US-1"));
    }

    #[test]
    fn duplicate_patterns_are_not_repeated() {
        let dir = tempdir().unwrap();
        append_progress_entry(dir.path(), "US-1", "Codebase Pattern: reuse the lock guard").unwrap();
        append_progress_entry(dir.path(), "US-2", "Codebase Pattern: reuse the lock guard").unwrap();
        let content = std::fs::read_to_string(dir.path().join(PROGRESS_FILE)).unwrap();
        assert_eq!(content.matches("reuse the lock guard").count(), 1);
    }
}
