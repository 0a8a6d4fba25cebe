use crate::config::StageGatesSection;
use crate::workflow::{Action, ActionType};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Proceed,
    /// Automatic mode must stop before this action; a human approves by
    /// running the action explicitly.
    Halt { reason: String },
}

impl GateDecision {
    pub fn is_halt(&self) -> bool {
        matches!(self, Self::Halt { .. })
    }
}

/// Stage gates checked by the runner before each automatic action.
///
/// Gates never remove actions from an assessment; they only stop the loop.
pub struct StageGate {
    pub require_approval_before_implementation: bool,
    pub require_approval_before_pr: bool,
}

impl StageGate {
    pub fn new(config: &StageGatesSection) -> Self {
        Self {
            require_approval_before_implementation: config.require_approval_before_implementation,
            require_approval_before_pr: config.require_approval_before_pr,
        }
    }

    /// No gates at all.
    pub fn open() -> Self {
        Self {
            require_approval_before_implementation: false,
            require_approval_before_pr: false,
        }
    }

    pub fn check(&self, action: &Action) -> GateDecision {
        match action.action_type {
            _ if self.require_approval_before_implementation && action.runs_implementation() => {
                GateDecision::Halt {
                    reason: format!(
                        "Approval required before implementation of {}; run `cadence run --story {}` to continue",
                        action.story_id, action.story_id
                    ),
                }
            }
            ActionType::CreatePr if self.require_approval_before_pr => GateDecision::Halt {
                reason: format!(
                    "Approval required before opening a PR for {}; run `cadence run --story {}` to continue",
                    action.story_id, action.story_id
                ),
            },
            _ => GateDecision::Proceed,
        }
    }
}
