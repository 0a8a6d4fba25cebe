//! Stories: the unit of work driven through the lifecycle.
//!
//! A story is a markdown file with a YAML frontmatter header. The header holds
//! the state the workflow engine reads and writes; the body holds free-form
//! sections (`## Heading`) that phase handlers fill in.

pub mod breaker;
pub mod store;

pub use breaker::{BreakerEvent, BreakerState, EffectiveLimits};
pub use store::{FsStoryStore, StoryStore};

use crate::phase::{Phase, ReviewDecision};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Section that accumulates reviewer feedback.
pub const REVIEW_NOTES_SECTION: &str = "Review Notes";

/// Whether `id` can name a single directory under the stories root.
pub fn is_valid_story_id(id: &str) -> bool {
    !id.trim().is_empty() && !id.contains(['/', '\\', '\0']) && !id.contains("..")
}

/// Lifecycle status of a story.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StoryStatus {
    #[default]
    Backlog,
    Ready,
    InProgress,
    Blocked,
    Done,
}

impl StoryStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Blocked)
    }
}

impl fmt::Display for StoryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Backlog => "backlog",
            Self::Ready => "ready",
            Self::InProgress => "in-progress",
            Self::Blocked => "blocked",
            Self::Done => "done",
        };
        f.write_str(s)
    }
}

/// The most recent review verdict recorded on a story.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewRecord {
    pub decision: ReviewDecision,
    #[serde(default)]
    pub feedback: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_phase: Option<Phase>,
    /// Set once a rework or restart has consumed this verdict.
    #[serde(default)]
    pub resolved: bool,
    pub reviewed_at: DateTime<Utc>,
}

impl ReviewRecord {
    pub fn is_unresolved_rejection(&self) -> bool {
        self.decision == ReviewDecision::Rejected && !self.resolved
    }

    /// The phase this feedback sends the story back to.
    ///
    /// An explicit target wins; otherwise the feedback text is scanned for
    /// the earliest phase it talks about, defaulting to implementation.
    pub fn implicated_phase(&self) -> Phase {
        if let Some(phase) = self.target_phase
            && phase < Phase::Review
        {
            return phase;
        }
        let text = self.feedback.to_lowercase();
        if text.contains("requirement") || text.contains("acceptance criteria") {
            Phase::Refine
        } else if text.contains("research") {
            Phase::Research
        } else if text.contains("plan") || text.contains("design") || text.contains("architecture")
        {
            Phase::Plan
        } else {
            Phase::Implement
        }
    }
}

/// One entry in a story's rework log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefinementIteration {
    pub iteration: u32,
    pub target_phase: Phase,
    #[serde(default)]
    pub feedback: String,
    pub started_at: DateTime<Utc>,
}

/// A unit of work tracked through the lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Story {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub status: StoryStatus,
    /// Lower is more urgent.
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub research_complete: bool,
    #[serde(default)]
    pub plan_complete: bool,
    #[serde(default)]
    pub implementation_complete: bool,
    #[serde(default)]
    pub reviews_complete: bool,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub implementation_retry_count: u32,
    #[serde(default)]
    pub refinement_count: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub refinement_iterations: Vec<RefinementIteration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_refinement_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worktree_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_review: Option<ReviewRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,

    /// Location of the story file.
    #[serde(skip)]
    pub path: PathBuf,
    /// Markdown body after the frontmatter.
    #[serde(skip)]
    pub content: String,
}

impl Story {
    pub fn new(id: &str, title: &str) -> Self {
        Self {
            id: id.to_string(),
            title: title.to_string(),
            status: StoryStatus::Backlog,
            priority: 0,
            research_complete: false,
            plan_complete: false,
            implementation_complete: false,
            reviews_complete: false,
            retry_count: 0,
            implementation_retry_count: 0,
            refinement_count: 0,
            refinement_iterations: Vec::new(),
            max_retries: None,
            max_refinement_attempts: None,
            branch: None,
            worktree_path: None,
            pr_url: None,
            last_error: None,
            blocked_reason: None,
            last_review: None,
            updated_at: None,
            path: PathBuf::new(),
            content: String::new(),
        }
    }

    pub fn with_status(mut self, status: StoryStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    /// Completion flag for a phase. Refinement has no flag of its own; it is
    /// complete once the story has left the backlog.
    pub fn is_phase_complete(&self, phase: Phase) -> bool {
        match phase {
            Phase::Refine => self.status != StoryStatus::Backlog,
            Phase::Research => self.research_complete,
            Phase::Plan => self.plan_complete,
            Phase::Implement => self.implementation_complete,
            Phase::Review => self.reviews_complete,
        }
    }

    /// Mark a phase complete and move the story forward accordingly.
    pub fn complete_phase(&mut self, phase: Phase) {
        match phase {
            Phase::Refine => {
                if self.status == StoryStatus::Backlog {
                    self.status = StoryStatus::Ready;
                }
                return;
            }
            Phase::Research => self.research_complete = true,
            Phase::Plan => self.plan_complete = true,
            Phase::Implement => self.implementation_complete = true,
            Phase::Review => self.reviews_complete = true,
        }
        if matches!(self.status, StoryStatus::Backlog | StoryStatus::Ready) {
            self.status = StoryStatus::InProgress;
        }
    }

    /// Clear the flag for `phase` and every later phase.
    pub fn reset_from(&mut self, phase: Phase) {
        if phase <= Phase::Research {
            self.research_complete = false;
        }
        if phase <= Phase::Plan {
            self.plan_complete = false;
        }
        if phase <= Phase::Implement {
            self.implementation_complete = false;
        }
        self.reviews_complete = false;
        if self.status == StoryStatus::Done {
            self.status = StoryStatus::InProgress;
        }
    }

    /// Set every completion flag and move to done in one step.
    pub fn mark_done(&mut self) {
        self.research_complete = true;
        self.plan_complete = true;
        self.implementation_complete = true;
        self.reviews_complete = true;
        self.status = StoryStatus::Done;
        self.blocked_reason = None;
    }

    pub fn block(&mut self, reason: impl Into<String>) {
        self.status = StoryStatus::Blocked;
        self.blocked_reason = Some(reason.into());
    }

    /// Check that status and completion flags agree.
    pub fn check_invariants(&self) -> Result<(), String> {
        let any_flag = self.research_complete
            || self.plan_complete
            || self.implementation_complete
            || self.reviews_complete;
        let all_flags = self.research_complete
            && self.plan_complete
            && self.implementation_complete
            && self.reviews_complete;

        if self.status == StoryStatus::Done && !all_flags {
            return Err(format!(
                "story {} is done but not every phase is complete",
                self.id
            ));
        }
        if self.status == StoryStatus::Backlog && any_flag {
            return Err(format!(
                "story {} is in backlog but has completed phases",
                self.id
            ));
        }
        if self.reviews_complete && !self.implementation_complete {
            return Err(format!(
                "story {} has reviews complete without implementation",
                self.id
            ));
        }
        if self.status == StoryStatus::Blocked
            && self.blocked_reason.as_deref().is_none_or(|r| r.trim().is_empty())
        {
            return Err(format!("story {} is blocked without a reason", self.id));
        }
        Ok(())
    }

    /// Body of a `## heading` section, if present.
    pub fn section(&self, heading: &str) -> Option<String> {
        let mut lines = self.content.lines();
        let wanted = heading.trim().to_lowercase();
        lines.find(|line| {
            line.strip_prefix("## ")
                .is_some_and(|h| h.trim().to_lowercase() == wanted)
        })?;

        let body: Vec<&str> = lines.take_while(|line| !line.starts_with("## ")).collect();
        let text = body.join("\n").trim().to_string();
        if text.is_empty() { None } else { Some(text) }
    }

    /// Append text to a section, creating the section at the end if needed.
    pub fn append_to_section(&mut self, heading: &str, text: &str) {
        let header = format!("## {}", heading);
        let mut out: Vec<String> = Vec::new();
        let mut inserted = false;
        let mut in_section = false;

        for line in self.content.lines() {
            if line.starts_with("## ") {
                if in_section && !inserted {
                    push_block(&mut out, text);
                    inserted = true;
                }
                in_section = line.trim() == header;
            }
            out.push(line.to_string());
        }
        if in_section && !inserted {
            push_block(&mut out, text);
            inserted = true;
        }
        if !inserted {
            if out.last().is_some_and(|l| !l.is_empty()) {
                out.push(String::new());
            }
            out.push(header);
            out.push(String::new());
            out.push(text.trim_end().to_string());
        }

        let mut content = out.join("\n");
        content.push('\n');
        self.content = content;
    }
}

fn push_block(out: &mut Vec<String>, text: &str) {
    while out.last().is_some_and(|l| l.is_empty()) {
        out.pop();
    }
    out.push(String::new());
    out.push(text.trim_end().to_string());
    out.push(String::new());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rejected(feedback: &str, target: Option<Phase>) -> ReviewRecord {
        ReviewRecord {
            decision: ReviewDecision::Rejected,
            feedback: feedback.to_string(),
            target_phase: target,
            resolved: false,
            reviewed_at: Utc::now(),
        }
    }

    #[test]
    fn test_story_id_validation() {
        assert!(is_valid_story_id("S-1"));
        assert!(is_valid_story_id("login.v2"));
        for bad in ["", " ", "../x", "..", "a/b", "a\\b", "x/../y"] {
            assert!(!is_valid_story_id(bad), "{:?}", bad);
        }
    }

    #[test]
    fn test_complete_phase_moves_status() {
        let mut story = Story::new("S-1", "Login");
        story.complete_phase(Phase::Refine);
        assert_eq!(story.status, StoryStatus::Ready);
        story.complete_phase(Phase::Research);
        assert_eq!(story.status, StoryStatus::InProgress);
        assert!(story.research_complete);
        assert!(story.check_invariants().is_ok());
    }

    #[test]
    fn test_reset_from_plan_keeps_research() {
        let mut story = Story::new("S-1", "Login").with_status(StoryStatus::InProgress);
        for phase in [Phase::Research, Phase::Plan, Phase::Implement, Phase::Review] {
            story.complete_phase(phase);
        }
        story.reset_from(Phase::Plan);
        assert!(story.research_complete);
        assert!(!story.plan_complete);
        assert!(!story.implementation_complete);
        assert!(!story.reviews_complete);
    }

    #[test]
    fn test_mark_done_sets_every_flag() {
        let mut story = Story::new("S-1", "Login").with_status(StoryStatus::InProgress);
        story.mark_done();
        assert_eq!(story.status, StoryStatus::Done);
        assert!(story.check_invariants().is_ok());
    }

    #[test]
    fn test_invariants_reject_done_without_flags() {
        let story = Story::new("S-1", "Login").with_status(StoryStatus::Done);
        assert!(story.check_invariants().is_err());
    }

    #[test]
    fn test_invariants_reject_blocked_without_reason() {
        let story = Story::new("S-1", "Login").with_status(StoryStatus::Blocked);
        assert!(story.check_invariants().is_err());
        let mut story = Story::new("S-1", "Login");
        story.block("too many retries");
        assert!(story.check_invariants().is_ok());
    }

    #[test]
    fn test_implicated_phase() {
        assert_eq!(
            rejected("anything", Some(Phase::Research)).implicated_phase(),
            Phase::Research
        );
        assert_eq!(
            rejected("The plan misses the migration step", None).implicated_phase(),
            Phase::Plan
        );
        assert_eq!(
            rejected("Needs more research into OAuth providers", None).implicated_phase(),
            Phase::Research
        );
        assert_eq!(
            rejected("Tests fail on empty input", None).implicated_phase(),
            Phase::Implement
        );
        assert_eq!(
            rejected("x", Some(Phase::Review)).implicated_phase(),
            Phase::Implement
        );
    }

    #[test]
    fn test_section_extraction() {
        let mut story = Story::new("S-1", "Login");
        story.content = "# Login\n\n## Summary\n\nUsers sign in.\n\n## Review Notes\n\nAdd tests.\nCheck errors.\n\n## Plan\n\nStep 1\n".to_string();
        assert_eq!(story.section("Summary").as_deref(), Some("Users sign in."));
        assert_eq!(
            story.section("review notes").as_deref(),
            Some("Add tests.\nCheck errors.")
        );
        assert!(story.section("Missing").is_none());
    }

    #[test]
    fn test_append_to_existing_section() {
        let mut story = Story::new("S-1", "Login");
        story.content = "## Review Notes\n\nFirst.\n\n## Plan\n\nStep 1\n".to_string();
        story.append_to_section(REVIEW_NOTES_SECTION, "Second.");
        assert_eq!(
            story.section(REVIEW_NOTES_SECTION).as_deref(),
            Some("First.\n\nSecond.")
        );
        assert_eq!(story.section("Plan").as_deref(), Some("Step 1"));
    }

    #[test]
    fn test_append_creates_section() {
        let mut story = Story::new("S-1", "Login");
        story.content = "# Login\n".to_string();
        story.append_to_section(REVIEW_NOTES_SECTION, "Needs tests.");
        assert_eq!(
            story.section(REVIEW_NOTES_SECTION).as_deref(),
            Some("Needs tests.")
        );
    }
}
