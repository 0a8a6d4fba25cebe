//! Isolated working copies for parallel stories.

use crate::config::SDLC_DIR;
use crate::errors::ProcessError;
use crate::logging::Logger;
use crate::story::is_valid_story_id;
use crate::tracker::GitTracker;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;

/// What teardown did with a working copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Teardown {
    Removed,
    Kept,
}

/// Creates and removes the working copy a story's process runs in.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    async fn create(&self, story_id: &str) -> Result<PathBuf, ProcessError>;

    async fn teardown(&self, story_id: &str, path: &Path) -> Result<Teardown, ProcessError>;
}

/// One `git worktree` per story under `worktree_dir`, on branch `cadence/<id>`.
pub struct WorktreeSandbox {
    project_dir: PathBuf,
    worktree_dir: PathBuf,
    base_branch: String,
    keep_worktrees: bool,
    logger: Logger,
}

impl WorktreeSandbox {
    pub fn new(
        project_dir: PathBuf,
        worktree_dir: PathBuf,
        base_branch: &str,
        keep_worktrees: bool,
        logger: Logger,
    ) -> Self {
        Self {
            project_dir,
            worktree_dir,
            base_branch: base_branch.to_string(),
            keep_worktrees,
            logger,
        }
    }

    pub fn path_for(&self, story_id: &str) -> PathBuf {
        self.worktree_dir.join(story_id)
    }

    /// Commit the story's state directory onto `cadence/<id>` so it outlives
    /// the worktree. Returns the paths outside the SDLC directory that are
    /// still uncommitted.
    fn save_story_state(&self, story_id: &str, path: &Path) -> Result<Vec<String>, ProcessError> {
        let sandbox_err = |e: anyhow::Error| ProcessError::Sandbox {
            story_id: story_id.to_string(),
            message: format!("{:#}", e),
        };
        let story_dir = format!("{}/stories/{}", SDLC_DIR, story_id);
        if GitTracker::commit_path(path, &story_dir, &format!("cadence: update {}", story_id))
            .map_err(sandbox_err)?
        {
            self.logger
                .for_story(story_id)
                .info(format!("Committed story state on {}", GitTracker::branch_name(story_id)));
        }

        let sdlc_prefix = format!("{}/", SDLC_DIR);
        Ok(GitTracker::uncommitted_changes(path)
            .map_err(sandbox_err)?
            .into_iter()
            .filter(|p| !p.starts_with(&sdlc_prefix))
            .collect())
    }

    async fn git(&self, story_id: &str, args: &[&str]) -> Result<(), ProcessError> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.project_dir)
            .output()
            .await
            .map_err(|e| ProcessError::Sandbox {
                story_id: story_id.to_string(),
                message: format!("Failed to run git: {}", e),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ProcessError::Sandbox {
                story_id: story_id.to_string(),
                message: format!("git {} failed: {}", args.join(" "), stderr.trim()),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl SandboxProvider for WorktreeSandbox {
    async fn create(&self, story_id: &str) -> Result<PathBuf, ProcessError> {
        if !is_valid_story_id(story_id) {
            return Err(ProcessError::Sandbox {
                story_id: story_id.to_string(),
                message: "story id may not contain path separators or '..'".to_string(),
            });
        }
        let path = self.path_for(story_id);
        let log = self.logger.for_story(story_id);
        if path.exists() {
            log.info(format!("Reusing worktree {}", path.display()));
            return Ok(path);
        }

        tokio::fs::create_dir_all(&self.worktree_dir)
            .await
            .map_err(|e| ProcessError::Sandbox {
                story_id: story_id.to_string(),
                message: format!("Failed to create {}: {}", self.worktree_dir.display(), e),
            })?;

        let path_str = path.to_string_lossy().to_string();
        let branch = GitTracker::branch_name(story_id);
        let fresh = self
            .git(
                story_id,
                &["worktree", "add", "-b", &branch, &path_str, &self.base_branch],
            )
            .await;

        if let Err(e) = fresh {
            // The branch survives a removed worktree; check it out instead.
            log.debug(format!("Fresh worktree failed, retrying on existing branch: {}", e));
            self.git(story_id, &["worktree", "add", &path_str, &branch])
                .await?;
        }

        log.info(format!("Created worktree {} on {}", path.display(), branch));
        Ok(path)
    }

    async fn teardown(&self, story_id: &str, path: &Path) -> Result<Teardown, ProcessError> {
        let log = self.logger.for_story(story_id);
        let dirty = self.save_story_state(story_id, path)?;
        if self.keep_worktrees {
            return Ok(Teardown::Kept);
        }
        if !dirty.is_empty() {
            log.warn(format!(
                "Keeping worktree {}: {} uncommitted file(s)",
                path.display(),
                dirty.len()
            ));
            return Ok(Teardown::Kept);
        }

        let path_str = path.to_string_lossy().to_string();
        self.git(story_id, &["worktree", "remove", "--force", &path_str])
            .await?;
        log.debug(format!("Removed worktree {}", path.display()));
        Ok(Teardown::Removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::git::tests::setup_repo;

    fn sandbox(project: &Path, keep: bool) -> WorktreeSandbox {
        WorktreeSandbox::new(
            project.to_path_buf(),
            project.join(".cadence/worktrees"),
            "main",
            keep,
            Logger::disabled(),
        )
    }

    #[tokio::test]
    async fn test_create_reuse_and_remove() {
        let (repo, dir) = setup_repo();
        let sandbox = sandbox(dir.path(), false);

        let path = sandbox.create("S-1").await.unwrap();
        assert!(path.join("README.md").exists());
        assert!(repo.find_branch("cadence/S-1", git2::BranchType::Local).is_ok());

        let again = sandbox.create("S-1").await.unwrap();
        assert_eq!(path, again);

        assert_eq!(sandbox.teardown("S-1", &path).await.unwrap(), Teardown::Removed);
        assert!(!path.exists());

        // Branch is left behind; a second create checks it out again.
        let path = sandbox.create("S-1").await.unwrap();
        assert!(path.join("README.md").exists());
    }

    #[tokio::test]
    async fn test_keep_worktrees_skips_removal() {
        let (_repo, dir) = setup_repo();
        let sandbox = sandbox(dir.path(), true);
        let path = sandbox.create("S-2").await.unwrap();
        assert_eq!(sandbox.teardown("S-2", &path).await.unwrap(), Teardown::Kept);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_story_edits_survive_teardown() {
        let (repo, dir) = setup_repo();
        let sandbox = sandbox(dir.path(), false);
        let path = sandbox.create("S-4").await.unwrap();

        let story_dir = path.join(".cadence/stories/S-4");
        std::fs::create_dir_all(&story_dir).unwrap();
        std::fs::write(story_dir.join("story.md"), "---\nid: S-4\nstatus: ready\n---\n").unwrap();
        std::fs::create_dir_all(path.join(".cadence/logs")).unwrap();
        std::fs::write(path.join(".cadence/logs/cadence.log"), "noise\n").unwrap();

        assert_eq!(sandbox.teardown("S-4", &path).await.unwrap(), Teardown::Removed);
        assert!(!path.exists());

        let tip = repo
            .find_branch("cadence/S-4", git2::BranchType::Local)
            .unwrap()
            .get()
            .peel_to_commit()
            .unwrap();
        let entry = tip
            .tree()
            .unwrap()
            .get_path(Path::new(".cadence/stories/S-4/story.md"))
            .unwrap();
        let blob = repo.find_blob(entry.id()).unwrap();
        assert!(String::from_utf8_lossy(blob.content()).contains("status: ready"));
    }

    #[tokio::test]
    async fn test_dirty_worktree_is_kept() {
        let (_repo, dir) = setup_repo();
        let sandbox = sandbox(dir.path(), false);
        let path = sandbox.create("S-5").await.unwrap();
        std::fs::write(path.join("README.md"), "# half done\n").unwrap();

        assert_eq!(sandbox.teardown("S-5", &path).await.unwrap(), Teardown::Kept);
        assert!(path.join("README.md").exists());
    }

    #[tokio::test]
    async fn test_unknown_base_is_sandbox_error() {
        let (_repo, dir) = setup_repo();
        let sandbox = WorktreeSandbox::new(
            dir.path().to_path_buf(),
            dir.path().join("wt"),
            "no-such-branch",
            false,
            Logger::disabled(),
        );
        let err = sandbox.create("S-3").await.unwrap_err();
        assert!(matches!(err, ProcessError::Sandbox { .. }));
    }
}
