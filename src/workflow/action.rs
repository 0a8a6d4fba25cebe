//! Actions recommended by the assessor.

use crate::phase::Phase;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Kind of step the runner can take for a story.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Refine,
    Research,
    Plan,
    Implement,
    Rework,
    Review,
    CreatePr,
    MoveToDone,
}

impl ActionType {
    /// Additive priority offset. Rework sits below review so that a rework
    /// at the same base priority always runs before a first-time review.
    pub fn priority_offset(&self) -> u32 {
        match self {
            Self::Refine => 0,
            Self::Research => 100,
            Self::Plan => 200,
            Self::Implement => 300,
            Self::Rework => 450,
            Self::Review => 500,
            Self::CreatePr => 600,
            Self::MoveToDone => 700,
        }
    }

    /// Phase whose handler runs this action directly, if any.
    pub fn phase(&self) -> Option<Phase> {
        match self {
            Self::Refine => Some(Phase::Refine),
            Self::Research => Some(Phase::Research),
            Self::Plan => Some(Phase::Plan),
            Self::Implement => Some(Phase::Implement),
            Self::Review => Some(Phase::Review),
            Self::Rework | Self::CreatePr | Self::MoveToDone => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Refine => "refine",
            Self::Research => "research",
            Self::Plan => "plan",
            Self::Implement => "implement",
            Self::Rework => "rework",
            Self::Review => "review",
            Self::CreatePr => "create_pr",
            Self::MoveToDone => "move_to_done",
        }
    }
}

impl From<Phase> for ActionType {
    fn from(phase: Phase) -> Self {
        match phase {
            Phase::Refine => Self::Refine,
            Phase::Research => Self::Research,
            Phase::Plan => Self::Plan,
            Phase::Implement => Self::Implement,
            Phase::Review => Self::Review,
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Extra data for a rework action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionContext {
    pub target_phase: Phase,
    pub iteration: u32,
}

/// An immutable recommendation for one story.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    #[serde(rename = "type")]
    pub action_type: ActionType,
    pub story_id: String,
    pub story_path: PathBuf,
    /// Story priority plus the type's offset. Wider than the story priority so
    /// the offsets never saturate.
    pub priority: u64,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<ActionContext>,
}

impl Action {
    /// Build an action; `base_priority` is the story's own priority.
    pub fn new(
        action_type: ActionType,
        story_id: &str,
        story_path: PathBuf,
        base_priority: u32,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            action_type,
            story_id: story_id.to_string(),
            story_path,
            priority: u64::from(base_priority) + u64::from(action_type.priority_offset()),
            reason: reason.into(),
            context: None,
        }
    }

    pub fn with_context(mut self, context: ActionContext) -> Self {
        self.context = Some(context);
        self
    }

    /// Whether running this action invokes the implement handler. A rework
    /// without a recorded target falls back to implementation.
    pub fn runs_implementation(&self) -> bool {
        match self.action_type {
            ActionType::Implement => true,
            ActionType::Rework => self
                .context
                .as_ref()
                .is_none_or(|ctx| ctx.target_phase == Phase::Implement),
            _ => false,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.action_type, self.story_id)?;
        if let Some(ctx) = &self.context {
            write!(f, " (→ {}, iteration {})", ctx.target_phase, ctx.iteration)?;
        }
        Ok(())
    }
}
