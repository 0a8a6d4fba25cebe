//! File-backed work-item store.
//!
//! Layout: `<stories_dir>/<id>/story.md`. Writes go through
//! [`atomic_write`](crate::util::atomic_write) so a crash mid-write leaves
//! either the previous file or the new one.

use super::{EffectiveLimits, Story, is_valid_story_id};
use crate::config::RetryLimits;
use crate::errors::StoryError;
use crate::logging::Logger;
use crate::util::atomic_write;
use chrono::Utc;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// File name of a story inside its directory.
pub const STORY_FILE: &str = "story.md";

/// Narrow contract the workflow engine needs from story persistence.
pub trait StoryStore: Send + Sync {
    /// All stories, in a stable order (by id).
    fn list(&self) -> Result<Vec<Story>, StoryError>;

    /// Look a story up by id.
    fn get(&self, id: &str) -> Result<Story, StoryError>;

    /// Persist a story atomically.
    fn save(&self, story: &Story) -> Result<(), StoryError>;
}

pub struct FsStoryStore {
    stories_dir: PathBuf,
    limits: RetryLimits,
    logger: Logger,
}

impl FsStoryStore {
    pub fn new(stories_dir: PathBuf, logger: Logger) -> Self {
        Self {
            stories_dir,
            limits: RetryLimits::default(),
            logger,
        }
    }

    /// Limits used to warn about per-story overrides that will be clamped.
    pub fn with_limits(mut self, limits: RetryLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn stories_dir(&self) -> &Path {
        &self.stories_dir
    }

    pub fn story_dir(&self, id: &str) -> PathBuf {
        self.stories_dir.join(id)
    }

    fn story_file(&self, id: &str) -> Result<PathBuf, StoryError> {
        if !is_valid_story_id(id) {
            return Err(StoryError::InvalidId { id: id.to_string() });
        }
        Ok(self.story_dir(id).join(STORY_FILE))
    }

    /// Create a new backlog story on disk.
    pub fn create(&self, id: &str, title: &str, body: &str) -> Result<Story, StoryError> {
        let mut story = Story::new(id, title);
        story.path = self.story_file(id)?;
        story.content = body.to_string();
        self.save(&story)?;
        Ok(story)
    }

    fn read(&self, path: &Path) -> Result<Story, StoryError> {
        let text = std::fs::read_to_string(path).map_err(|source| StoryError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut story = parse_story(&text).map_err(|message| StoryError::Parse {
            path: path.to_path_buf(),
            message,
        })?;
        story.path = path.to_path_buf();

        if EffectiveLimits::was_clamped(&story, &self.limits) {
            let effective = EffectiveLimits::for_story(&story, &self.limits);
            self.logger.warn(format!(
                "Story {} overrides exceed the configured upper bounds; using max_retries={} max_refinement_attempts={}",
                story.id, effective.max_retries, effective.max_refinements
            ));
        }
        Ok(story)
    }
}

impl StoryStore for FsStoryStore {
    fn list(&self) -> Result<Vec<Story>, StoryError> {
        if !self.stories_dir.exists() {
            return Ok(Vec::new());
        }

        let mut stories = Vec::new();
        for entry in WalkDir::new(&self.stories_dir)
            .min_depth(2)
            .max_depth(2)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file() && e.file_name() == STORY_FILE)
        {
            stories.push(self.read(entry.path())?);
        }
        stories.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(stories)
    }

    fn get(&self, id: &str) -> Result<Story, StoryError> {
        let path = self.story_file(id)?;
        if path.exists() {
            return self.read(&path);
        }
        // The directory name may have drifted from the id; fall back to a scan.
        self.list()?
            .into_iter()
            .find(|s| s.id == id)
            .ok_or_else(|| StoryError::NotFound { id: id.to_string() })
    }

    fn save(&self, story: &Story) -> Result<(), StoryError> {
        let path = if story.path.as_os_str().is_empty() {
            self.story_file(&story.id)?
        } else {
            story.path.clone()
        };

        let mut stamped = story.clone();
        stamped.updated_at = Some(Utc::now());
        let text = render_story(&stamped).map_err(|message| StoryError::Parse {
            path: path.clone(),
            message,
        })?;

        atomic_write(&path, text.as_bytes()).map_err(|source| StoryError::Write {
            path: path.clone(),
            source,
        })?;
        self.logger
            .debug(format!("Saved story {} ({})", story.id, story.status));
        Ok(())
    }
}

/// Split a story file into frontmatter and body and decode the frontmatter.
pub fn parse_story(text: &str) -> Result<Story, String> {
    let rest = text
        .strip_prefix("---\n")
        .or_else(|| text.strip_prefix("---\r\n"))
        .ok_or_else(|| "missing frontmatter opening '---'".to_string())?;

    let (yaml, body) = match rest.find("\n---") {
        Some(idx) => {
            let after = &rest[idx + 4..];
            let body = after
                .strip_prefix("\r\n")
                .or_else(|| after.strip_prefix('\n'))
                .unwrap_or(after);
            (&rest[..idx + 1], body)
        }
        None => return Err("missing frontmatter closing '---'".to_string()),
    };

    let mut story: Story = serde_yaml::from_str(yaml).map_err(|e| e.to_string())?;
    story.content = body.to_string();
    Ok(story)
}

/// Render a story back to `---\n<yaml>---\n<body>`.
pub fn render_story(story: &Story) -> Result<String, String> {
    let yaml = serde_yaml::to_string(story).map_err(|e| e.to_string())?;
    Ok(format!("---\n{}---\n{}", yaml, story.content))
}
