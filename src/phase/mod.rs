//! Lifecycle phases and the handler seam.
//!
//! The AI-generation steps behind each phase are external collaborators. The
//! core only sees them through [`PhaseHandler`]: a request goes in, a
//! structured [`PhaseResult`] comes out.

pub mod command;

pub use command::{CommandPhaseHandler, PhaseOutput};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

/// One stage of the story lifecycle, in execution order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Refine,
    Research,
    Plan,
    Implement,
    Review,
}

impl Phase {
    pub const ALL: [Phase; 5] = [
        Phase::Refine,
        Phase::Research,
        Phase::Plan,
        Phase::Implement,
        Phase::Review,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Refine => "refine",
            Self::Research => "research",
            Self::Plan => "plan",
            Self::Implement => "implement",
            Self::Review => "review",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "refine" => Ok(Self::Refine),
            "research" => Ok(Self::Research),
            "plan" => Ok(Self::Plan),
            "implement" | "implementation" => Ok(Self::Implement),
            "review" => Ok(Self::Review),
            _ => anyhow::bail!(
                "Invalid phase '{}'. Valid values: refine, research, plan, implement, review",
                s
            ),
        }
    }
}

/// Outcome reported by a review handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewDecision {
    Approved,
    Rejected,
    /// No source changes were detected after implementation.
    Recovery,
    /// The reviewer itself errored; not a verdict on the work.
    Failed,
}

impl fmt::Display for ReviewDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Recovery => "recovery",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Review-specific part of a phase result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewOutcome {
    pub decision: ReviewDecision,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    /// Phase the reviewer wants revisited, if it said so explicitly.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_phase: Option<Phase>,
    #[serde(default)]
    pub requires_human_review: bool,
}

impl ReviewOutcome {
    pub fn new(decision: ReviewDecision) -> Self {
        Self {
            decision,
            issues: Vec::new(),
            feedback: None,
            target_phase: None,
            requires_human_review: false,
        }
    }

    pub fn with_feedback(mut self, feedback: impl Into<String>) -> Self {
        self.feedback = Some(feedback.into());
        self
    }

    pub fn with_issues(mut self, issues: Vec<String>) -> Self {
        self.issues = issues;
        self
    }

    pub fn with_target_phase(mut self, phase: Phase) -> Self {
        self.target_phase = Some(phase);
        self
    }

    /// Feedback text, falling back to the joined issue list.
    pub fn feedback_text(&self) -> String {
        match &self.feedback {
            Some(f) if !f.trim().is_empty() => f.clone(),
            _ => self.issues.join("\n"),
        }
    }
}

/// Result of running one phase handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseResult {
    pub success: bool,
    #[serde(default)]
    pub changes_made: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review: Option<ReviewOutcome>,
    /// Set by the create-PR step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
}

impl PhaseResult {
    pub fn success(changes_made: Vec<String>) -> Self {
        Self {
            success: true,
            changes_made,
            error: None,
            review: None,
            pr_url: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            changes_made: Vec::new(),
            error: Some(error.into()),
            review: None,
            pr_url: None,
        }
    }

    pub fn with_review(mut self, review: ReviewOutcome) -> Self {
        self.review = Some(review);
        self
    }

    pub fn add_change(mut self, change: impl Into<String>) -> Self {
        self.changes_made.push(change.into());
        self
    }
}

/// Feedback packaged for a phase that is being re-run after a rejection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReworkContext {
    pub target_phase: Phase,
    pub iteration: u32,
    pub feedback: String,
}

/// Input handed to a phase handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseRequest {
    pub story_id: String,
    pub story_path: PathBuf,
    pub root_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rework: Option<ReworkContext>,
}

/// A collaborator that performs one lifecycle step.
#[async_trait]
pub trait PhaseHandler: Send + Sync {
    async fn run(&self, request: &PhaseRequest) -> Result<PhaseResult>;
}

/// The set of handlers the runner dispatches to.
#[derive(Clone)]
pub struct PhaseHandlers {
    pub refine: Arc<dyn PhaseHandler>,
    pub research: Arc<dyn PhaseHandler>,
    pub plan: Arc<dyn PhaseHandler>,
    pub implement: Arc<dyn PhaseHandler>,
    pub review: Arc<dyn PhaseHandler>,
    pub create_pr: Arc<dyn PhaseHandler>,
}

impl PhaseHandlers {
    /// Use the same handler for every step.
    pub fn uniform(handler: Arc<dyn PhaseHandler>) -> Self {
        Self {
            refine: handler.clone(),
            research: handler.clone(),
            plan: handler.clone(),
            implement: handler.clone(),
            review: handler.clone(),
            create_pr: handler,
        }
    }

    /// Replace the review handler.
    pub fn with_review(mut self, handler: Arc<dyn PhaseHandler>) -> Self {
        self.review = handler;
        self
    }

    pub fn for_phase(&self, phase: Phase) -> &Arc<dyn PhaseHandler> {
        match phase {
            Phase::Refine => &self.refine,
            Phase::Research => &self.research,
            Phase::Plan => &self.plan,
            Phase::Implement => &self.implement,
            Phase::Review => &self.review,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_order() {
        assert!(Phase::Research < Phase::Plan);
        assert!(Phase::Plan < Phase::Implement);
        assert!(Phase::Implement < Phase::Review);
    }

    #[test]
    fn test_phase_from_str() {
        assert_eq!("PLAN".parse::<Phase>().unwrap(), Phase::Plan);
        assert_eq!(
            "implementation".parse::<Phase>().unwrap(),
            Phase::Implement
        );
        assert!("deploy".parse::<Phase>().is_err());
    }

    #[test]
    fn test_review_outcome_serde() {
        let json = r#"{"decision":"rejected","issues":["missing tests"],"target_phase":"plan"}"#;
        let outcome: ReviewOutcome = serde_json::from_str(json).unwrap();
        assert_eq!(outcome.decision, ReviewDecision::Rejected);
        assert_eq!(outcome.target_phase, Some(Phase::Plan));
        assert!(!outcome.requires_human_review);
        assert_eq!(outcome.feedback_text(), "missing tests");
    }

    #[test]
    fn test_feedback_text_prefers_feedback() {
        let outcome = ReviewOutcome::new(ReviewDecision::Rejected)
            .with_issues(vec!["a".into()])
            .with_feedback("rework the plan");
        assert_eq!(outcome.feedback_text(), "rework the plan");
    }

    #[test]
    fn test_phase_result_builders() {
        let ok = PhaseResult::success(vec![]).add_change("wrote plan");
        assert!(ok.success);
        assert_eq!(ok.changes_made, vec!["wrote plan"]);
        let failed = PhaseResult::failure("timeout");
        assert!(!failed.success);
        assert_eq!(failed.error.as_deref(), Some("timeout"));
    }
}
