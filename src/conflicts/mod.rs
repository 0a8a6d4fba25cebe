//! File-level conflict screening between stories.
//!
//! Every pair of stories is compared (C(n,2) comparisons, so this is meant for
//! the handful of stories a parallel run admits, not whole backlogs). A pair
//! that touches the same file is `high`; one that only touches the same
//! directory is `medium`.

use crate::logging::Logger;
use crate::story::Story;
use crate::tracker::GitTracker;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    None,
    Medium,
    High,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::None => "none",
            Self::Medium => "medium",
            Self::High => "high",
        };
        f.write_str(s)
    }
}

/// Overlap between two stories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictAnalysis {
    pub story_a: String,
    pub story_b: String,
    pub shared_files: Vec<String>,
    pub shared_directories: Vec<String>,
    pub severity: Severity,
    pub recommendation: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictReport {
    pub conflicts: Vec<ConflictAnalysis>,
    pub safe_to_run_concurrently: bool,
    pub summary: String,
}

/// What the detector needs to know about a story.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictCandidate {
    pub story_id: String,
    pub branch: Option<String>,
    pub worktree_path: Option<PathBuf>,
}

impl From<&Story> for ConflictCandidate {
    fn from(story: &Story) -> Self {
        Self {
            story_id: story.id.clone(),
            branch: story.branch.clone(),
            worktree_path: story.worktree_path.clone(),
        }
    }
}

/// Source of the files a story has changed.
pub trait ChangeSource: Send {
    fn changed_files(&self, candidate: &ConflictCandidate) -> Result<BTreeSet<String>>;
}

/// Immediate parent directories, excluding the repository root.
fn parent_dirs(files: &BTreeSet<String>) -> BTreeSet<String> {
    files
        .iter()
        .filter_map(|f| Path::new(f).parent())
        .map(|p| p.to_string_lossy().to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

/// Classify one pair. Pure.
pub fn classify(
    story_a: &str,
    files_a: &BTreeSet<String>,
    story_b: &str,
    files_b: &BTreeSet<String>,
) -> ConflictAnalysis {
    let shared_files: Vec<String> = files_a.intersection(files_b).cloned().collect();
    let shared_directories: Vec<String> = parent_dirs(files_a)
        .intersection(&parent_dirs(files_b))
        .cloned()
        .collect();

    let (severity, recommendation) = if !shared_files.is_empty() {
        (
            Severity::High,
            format!(
                "Run {} and {} sequentially; both modify {} file(s)",
                story_a,
                story_b,
                shared_files.len()
            ),
        )
    } else if !shared_directories.is_empty() {
        (
            Severity::Medium,
            format!(
                "{} and {} can run together; expect merge attention in {}",
                story_a,
                story_b,
                shared_directories.join(", ")
            ),
        )
    } else {
        (Severity::None, "No overlap".to_string())
    };

    ConflictAnalysis {
        story_a: story_a.to_string(),
        story_b: story_b.to_string(),
        shared_files,
        shared_directories,
        severity,
        recommendation,
    }
}

/// Aggregate pairwise analyses into a report.
pub fn summarize(conflicts: Vec<ConflictAnalysis>, story_count: usize) -> ConflictReport {
    let high = conflicts
        .iter()
        .filter(|c| c.severity == Severity::High)
        .count();
    let medium = conflicts
        .iter()
        .filter(|c| c.severity == Severity::Medium)
        .count();

    let summary = if high > 0 {
        format!(
            "{} high-severity conflict(s) among {} stories; run them sequentially",
            high, story_count
        )
    } else if medium > 0 {
        format!(
            "{} medium-severity overlap(s) among {} stories; safe to run concurrently",
            medium, story_count
        )
    } else {
        format!("No conflicts among {} stories", story_count)
    };

    ConflictReport {
        safe_to_run_concurrently: high == 0,
        conflicts,
        summary,
    }
}

pub struct ConflictDetector<S: ChangeSource> {
    source: S,
    logger: Logger,
}

impl<S: ChangeSource> ConflictDetector<S> {
    pub fn new(source: S, logger: Logger) -> Self {
        Self { source, logger }
    }

    pub fn detect(&self, stories: &[ConflictCandidate]) -> ConflictReport {
        if stories.len() < 2 {
            return summarize(Vec::new(), stories.len());
        }

        let files: Vec<BTreeSet<String>> = stories
            .iter()
            .map(|candidate| match self.source.changed_files(candidate) {
                Ok(files) => files,
                Err(e) => {
                    self.logger.for_story(&candidate.story_id).warn(format!(
                        "Could not read changes, treating as empty: {:#}",
                        e
                    ));
                    BTreeSet::new()
                }
            })
            .collect();

        let mut conflicts = Vec::new();
        for i in 0..stories.len() {
            for j in (i + 1)..stories.len() {
                conflicts.push(classify(
                    &stories[i].story_id,
                    &files[i],
                    &stories[j].story_id,
                    &files[j],
                ));
            }
        }

        let report = summarize(conflicts, stories.len());
        self.logger.debug(&report.summary);
        report
    }
}

/// Changes read from the project repository and each story's worktree.
pub struct GitChangeSource {
    tracker: GitTracker,
    base: String,
    worktree_dir: PathBuf,
}

impl GitChangeSource {
    pub fn open(project_dir: &Path, base: &str, worktree_dir: PathBuf) -> Result<Self> {
        Ok(Self {
            tracker: GitTracker::new(project_dir)?,
            base: base.to_string(),
            worktree_dir,
        })
    }
}

impl ChangeSource for GitChangeSource {
    fn changed_files(&self, candidate: &ConflictCandidate) -> Result<BTreeSet<String>> {
        let Some(branch) = self
            .tracker
            .resolve_branch(&candidate.story_id, candidate.branch.as_deref())
        else {
            return Ok(BTreeSet::new());
        };

        let mut files = self.tracker.committed_changes(&branch, &self.base)?;

        let worktree = candidate
            .worktree_path
            .clone()
            .unwrap_or_else(|| self.worktree_dir.join(&candidate.story_id));
        if worktree.exists() {
            files.extend(GitTracker::uncommitted_changes(&worktree)?);
        }
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::git::tests::{branch_with_files, setup_repo};
    use std::collections::HashMap;

    fn set(files: &[&str]) -> BTreeSet<String> {
        files.iter().map(|f| f.to_string()).collect()
    }

    struct FixedChanges(HashMap<String, BTreeSet<String>>);

    impl ChangeSource for FixedChanges {
        fn changed_files(&self, candidate: &ConflictCandidate) -> Result<BTreeSet<String>> {
            match self.0.get(&candidate.story_id) {
                Some(files) => Ok(files.clone()),
                None => anyhow::bail!("no branch"),
            }
        }
    }

    fn candidate(id: &str) -> ConflictCandidate {
        ConflictCandidate {
            story_id: id.to_string(),
            branch: None,
            worktree_path: None,
        }
    }

    #[test]
    fn test_same_directory_is_medium() {
        let analysis = classify("A", &set(&["a/x.ts"]), "B", &set(&["a/y.ts"]));
        assert_eq!(analysis.severity, Severity::Medium);
        assert_eq!(analysis.shared_directories, vec!["a"]);
        assert!(analysis.shared_files.is_empty());
    }

    #[test]
    fn test_same_file_is_high() {
        let analysis = classify("A", &set(&["a/x.ts"]), "B", &set(&["a/x.ts"]));
        assert_eq!(analysis.severity, Severity::High);
        assert_eq!(analysis.shared_files, vec!["a/x.ts"]);
    }

    #[test]
    fn test_disjoint_trees_are_none() {
        let analysis = classify("A", &set(&["a/x.ts"]), "B", &set(&["b/y.ts"]));
        assert_eq!(analysis.severity, Severity::None);
    }

    #[test]
    fn test_root_level_files_share_no_directory() {
        let analysis = classify("A", &set(&["README.md"]), "B", &set(&["Cargo.toml"]));
        assert_eq!(analysis.severity, Severity::None);
    }

    #[test]
    fn test_zero_or_one_story_is_safe() {
        let detector = ConflictDetector::new(FixedChanges(HashMap::new()), Logger::disabled());
        assert!(detector.detect(&[]).safe_to_run_concurrently);
        let report = detector.detect(&[candidate("A")]);
        assert!(report.safe_to_run_concurrently);
        assert!(report.conflicts.is_empty());
    }

    #[test]
    fn test_unsafe_iff_any_high() {
        let changes = FixedChanges(HashMap::from([
            ("A".to_string(), set(&["a/x.ts"])),
            ("B".to_string(), set(&["a/y.ts"])),
            ("C".to_string(), set(&["b/z.ts"])),
        ]));
        let detector = ConflictDetector::new(changes, Logger::disabled());
        let report = detector.detect(&[candidate("A"), candidate("B"), candidate("C")]);
        assert_eq!(report.conflicts.len(), 3);
        assert!(report.safe_to_run_concurrently);
        assert!(report.summary.contains("1 medium"));

        let changes = FixedChanges(HashMap::from([
            ("A".to_string(), set(&["a/x.ts"])),
            ("B".to_string(), set(&["a/x.ts"])),
        ]));
        let report = ConflictDetector::new(changes, Logger::disabled())
            .detect(&[candidate("A"), candidate("B")]);
        assert!(!report.safe_to_run_concurrently);
        assert!(report.summary.contains("1 high"));
    }

    #[test]
    fn test_unreadable_story_counts_as_empty() {
        let changes = FixedChanges(HashMap::from([("A".to_string(), set(&["a/x.ts"]))]));
        let report = ConflictDetector::new(changes, Logger::disabled())
            .detect(&[candidate("A"), candidate("ghost")]);
        assert!(report.safe_to_run_concurrently);
        assert_eq!(report.conflicts[0].severity, Severity::None);
    }

    #[test]
    fn test_git_branches_conflict() {
        let (repo, dir) = setup_repo();
        branch_with_files(&repo, "cadence/S-1", &["src/auth/login.rs"]);
        branch_with_files(&repo, "cadence/S-2", &["src/auth/login.rs", "docs/a.md"]);
        branch_with_files(&repo, "cadence/S-3-ui", &["web/app.ts"]);

        let source =
            GitChangeSource::open(dir.path(), "main", dir.path().join(".cadence/worktrees"))
                .unwrap();
        let detector = ConflictDetector::new(source, Logger::disabled());
        let report = detector.detect(&[
            candidate("S-1"),
            candidate("S-2"),
            candidate("S-3"),
            candidate("S-4"),
        ]);

        assert!(!report.safe_to_run_concurrently);
        let pair = report
            .conflicts
            .iter()
            .find(|c| c.story_a == "S-1" && c.story_b == "S-2")
            .unwrap();
        assert_eq!(pair.shared_files, vec!["src/auth/login.rs"]);
        assert!(
            report
                .conflicts
                .iter()
                .filter(|c| c.story_a == "S-4" || c.story_b == "S-4")
                .all(|c| c.severity == Severity::None)
        );
    }
}
