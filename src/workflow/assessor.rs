//! State assessment: which action comes next for every story.
//!
//! [`StateAssessor::assess`] is a pure function of the story list. When the
//! circuit breaker trips it reports a [`BlockDirective`] instead of an action;
//! [`StateAssessor::assess_and_apply`] persists those through the store.

use super::action::{Action, ActionContext, ActionType};
use crate::config::RetryLimits;
use crate::errors::StoryError;
use crate::logging::Logger;
use crate::phase::Phase;
use crate::story::{BreakerEvent, BreakerState, EffectiveLimits, Story, StoryStatus, StoryStore};

/// A story the breaker has moved to blocked during assessment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockDirective {
    pub story_id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Assessment {
    /// Sorted ascending by priority, then story id, then action type.
    pub actions: Vec<Action>,
    pub blocks: Vec<BlockDirective>,
}

impl Assessment {
    pub fn next(&self) -> Option<&Action> {
        self.actions.first()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

/// What assessment decided for a single story.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoryDecision {
    Act(Action),
    Block(BlockDirective),
    Idle,
}

pub struct StateAssessor {
    limits: RetryLimits,
    logger: Logger,
}

impl StateAssessor {
    pub fn new(limits: RetryLimits, logger: Logger) -> Self {
        Self { limits, logger }
    }

    /// Assess every story. Pure and order-stable.
    pub fn assess(&self, stories: &[Story]) -> Assessment {
        let mut assessment = Assessment::default();
        for story in stories {
            match self.assess_story(story) {
                StoryDecision::Act(action) => assessment.actions.push(action),
                StoryDecision::Block(block) => assessment.blocks.push(block),
                StoryDecision::Idle => {}
            }
        }
        assessment.actions.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| a.story_id.cmp(&b.story_id))
                .then_with(|| a.action_type.cmp(&b.action_type))
        });
        assessment.blocks.sort_by(|a, b| a.story_id.cmp(&b.story_id));
        assessment
    }

    pub fn assess_story(&self, story: &Story) -> StoryDecision {
        let act = |action_type: ActionType, reason: String| {
            StoryDecision::Act(Action::new(
                action_type,
                &story.id,
                story.path.clone(),
                story.priority,
                reason,
            ))
        };

        match story.status {
            StoryStatus::Done | StoryStatus::Blocked => return StoryDecision::Idle,
            StoryStatus::Backlog => {
                return act(ActionType::Refine, "Story is in the backlog".to_string());
            }
            StoryStatus::Ready | StoryStatus::InProgress => {}
        }

        if story.implementation_complete
            && !story.reviews_complete
            && let Some(review) = story.last_review.as_ref().filter(|r| r.is_unresolved_rejection())
        {
            let limits = EffectiveLimits::for_story(story, &self.limits);
            if let BreakerState::Blocked { reason } =
                BreakerState::of(story).apply(BreakerEvent::Rework, &limits)
            {
                return StoryDecision::Block(BlockDirective {
                    story_id: story.id.clone(),
                    reason,
                });
            }

            let target_phase = review.implicated_phase();
            let iteration = story.refinement_count + 1;
            return StoryDecision::Act(
                Action::new(
                    ActionType::Rework,
                    &story.id,
                    story.path.clone(),
                    story.priority,
                    format!(
                        "Review rejected; reworking from {} (iteration {})",
                        target_phase, iteration
                    ),
                )
                .with_context(ActionContext {
                    target_phase,
                    iteration,
                }),
            );
        }

        for phase in [Phase::Research, Phase::Plan, Phase::Implement, Phase::Review] {
            if !story.is_phase_complete(phase) {
                return act(phase.into(), format!("{} not complete", phase));
            }
        }

        if story.pr_url.is_none() {
            act(ActionType::CreatePr, "All phases complete".to_string())
        } else {
            act(ActionType::MoveToDone, "Pull request opened".to_string())
        }
    }

    /// Load stories (optionally one), assess, and persist breaker blocks.
    pub fn assess_and_apply(
        &self,
        store: &dyn StoryStore,
        scope: Option<&str>,
    ) -> Result<Assessment, StoryError> {
        let stories: Vec<Story> = match scope {
            Some(id) => vec![store.get(id)?],
            None => store.list()?,
        };

        let assessment = self.assess(&stories);
        for block in &assessment.blocks {
            if let Some(story) = stories.iter().find(|s| s.id == block.story_id) {
                let mut story = story.clone();
                BreakerState::Blocked {
                    reason: block.reason.clone(),
                }
                .write_to(&mut story);
                store.save(&story)?;
                self.logger
                    .for_story(&story.id)
                    .warn(format!("Blocked: {}", block.reason));
            }
        }

        self.logger.debug(format!(
            "Assessed {} stories: {} actions, {} blocked",
            stories.len(),
            assessment.actions.len(),
            assessment.blocks.len()
        ));
        Ok(assessment)
    }
}
