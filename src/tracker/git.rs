use anyhow::{Context, Result};
use git2::{BranchType, DiffOptions, IndexAddOption, Repository, Signature};
use std::collections::BTreeSet;
use std::path::Path;

/// Prefix of every story branch.
pub const BRANCH_PREFIX: &str = "cadence/";

/// Read-only view of the project repository used for conflict screening.
pub struct GitTracker {
    repo: Repository,
}

impl GitTracker {
    pub fn new(project_dir: &Path) -> Result<Self> {
        let repo = Repository::discover(project_dir).context("Failed to open git repository")?;
        Ok(Self { repo })
    }

    /// Conventional branch name for a story.
    pub fn branch_name(story_id: &str) -> String {
        format!("{}{}", BRANCH_PREFIX, story_id)
    }

    fn local_branch_exists(&self, name: &str) -> bool {
        self.repo.find_branch(name, BranchType::Local).is_ok()
    }

    /// Resolve a story's branch: explicit override, else `cadence/<id>`,
    /// else the first `cadence/<id>-*` branch. `None` if nothing exists yet.
    pub fn resolve_branch(&self, story_id: &str, explicit: Option<&str>) -> Option<String> {
        if let Some(name) = explicit {
            return self.local_branch_exists(name).then(|| name.to_string());
        }

        let conventional = Self::branch_name(story_id);
        if self.local_branch_exists(&conventional) {
            return Some(conventional);
        }

        let prefix = format!("{}-", conventional);
        let mut candidates: Vec<String> = self
            .repo
            .branches(Some(BranchType::Local))
            .ok()?
            .filter_map(|b| b.ok())
            .filter_map(|(branch, _)| branch.name().ok().flatten().map(str::to_string))
            .filter(|name| name.starts_with(&prefix))
            .collect();
        candidates.sort();
        candidates.into_iter().next()
    }

    /// Files changed on `branch` since it diverged from `base`.
    pub fn committed_changes(&self, branch: &str, base: &str) -> Result<BTreeSet<String>> {
        let branch_commit = self
            .repo
            .find_branch(branch, BranchType::Local)
            .with_context(|| format!("Branch {} not found", branch))?
            .get()
            .peel_to_commit()?;
        let base_commit = self
            .repo
            .revparse_single(base)
            .with_context(|| format!("Base reference {} not found", base))?
            .peel_to_commit()?;

        let merge_base = self.repo.merge_base(base_commit.id(), branch_commit.id())?;
        let base_tree = self.repo.find_commit(merge_base)?.tree()?;
        let branch_tree = branch_commit.tree()?;

        let diff = self
            .repo
            .diff_tree_to_tree(Some(&base_tree), Some(&branch_tree), None)?;
        Ok(diff_paths(&diff))
    }

    /// Staged, unstaged and untracked files in a working copy.
    pub fn uncommitted_changes(worktree: &Path) -> Result<BTreeSet<String>> {
        let repo = Repository::open(worktree)
            .with_context(|| format!("Failed to open worktree {}", worktree.display()))?;
        let head_tree = repo.head().ok().and_then(|h| h.peel_to_tree().ok());

        let mut opts = DiffOptions::new();
        opts.include_untracked(true).recurse_untracked_dirs(true);
        let diff = repo.diff_tree_to_workdir_with_index(head_tree.as_ref(), Some(&mut opts))?;
        Ok(diff_paths(&diff))
    }

    /// Commit everything under `path` (relative to the worktree root) onto the
    /// worktree's HEAD. Returns false when there was nothing to commit.
    pub fn commit_path(worktree: &Path, path: &str, message: &str) -> Result<bool> {
        let repo = Repository::open(worktree)
            .with_context(|| format!("Failed to open worktree {}", worktree.display()))?;
        let mut index = repo.index()?;
        index.add_all([path].iter(), IndexAddOption::DEFAULT, None)?;
        index.update_all([path].iter(), None)?;
        index.write()?;
        let tree = repo.find_tree(index.write_tree()?)?;

        let parent = repo.head().ok().and_then(|h| h.peel_to_commit().ok());
        if parent.as_ref().is_some_and(|p| p.tree_id() == tree.id()) {
            return Ok(false);
        }

        let sig = repo
            .signature()
            .or_else(|_| Signature::now("cadence", "cadence@localhost"))?;
        let parents: Vec<&git2::Commit<'_>> = parent.iter().collect();
        repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
        Ok(true)
    }
}

fn diff_paths(diff: &git2::Diff<'_>) -> BTreeSet<String> {
    diff.deltas()
        .filter_map(|delta| delta.new_file().path().or_else(|| delta.old_file().path()))
        .map(|p| p.to_string_lossy().replace('\\', "/"))
        .collect()
}
