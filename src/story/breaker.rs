//! Retry accounting and circuit breaker for a single story.
//!
//! All three counters (`retry_count`, `refinement_count`,
//! `implementation_retry_count`) move through [`BreakerState::apply`]. The
//! state is `Active` until a ceiling is hit, then `Blocked` for good; only a
//! manual status reset brings a story back.

use super::{Story, StoryStatus};
use crate::config::RetryLimits;

/// Ceilings that apply to one story after per-story overrides are clamped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EffectiveLimits {
    pub max_retries: u32,
    pub max_refinements: u32,
    pub max_implementation_retries: u32,
}

impl EffectiveLimits {
    /// Resolve per-story overrides, clamped to the global upper bounds.
    pub fn for_story(story: &Story, limits: &RetryLimits) -> Self {
        Self {
            max_retries: story
                .max_retries
                .unwrap_or(limits.max_retries)
                .min(limits.max_retries_upper_bound),
            max_refinements: story
                .max_refinement_attempts
                .unwrap_or(limits.max_refinements)
                .min(limits.max_refinements_upper_bound),
            max_implementation_retries: limits.max_implementation_retries,
        }
    }

    /// True if any per-story override was cut down by an upper bound.
    pub fn was_clamped(story: &Story, limits: &RetryLimits) -> bool {
        story
            .max_retries
            .is_some_and(|v| v > limits.max_retries_upper_bound)
            || story
                .max_refinement_attempts
                .is_some_and(|v| v > limits.max_refinements_upper_bound)
    }
}

/// Something that consumes retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerEvent {
    /// Rejected review that restarts the whole cycle.
    Restart,
    /// Directed rework of an earlier phase.
    Rework,
    /// Implementation produced no changes; redo implementation only.
    Recovery,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakerState {
    Active {
        retries: u32,
        refinements: u32,
        implementation_retries: u32,
    },
    Blocked {
        reason: String,
    },
}

impl BreakerState {
    /// Current breaker state recorded on a story.
    pub fn of(story: &Story) -> Self {
        if story.status == StoryStatus::Blocked {
            return Self::Blocked {
                reason: story
                    .blocked_reason
                    .clone()
                    .unwrap_or_else(|| "blocked".to_string()),
            };
        }
        Self::Active {
            retries: story.retry_count,
            refinements: story.refinement_count,
            implementation_retries: story.implementation_retry_count,
        }
    }

    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::Blocked { .. })
    }

    /// The single transition function for every retry counter.
    pub fn apply(self, event: BreakerEvent, limits: &EffectiveLimits) -> Self {
        let Self::Active {
            retries,
            refinements,
            implementation_retries,
        } = self
        else {
            return self;
        };

        match event {
            BreakerEvent::Restart if retries >= limits.max_retries => Self::Blocked {
                reason: format!(
                    "Review retry limit reached ({}/{}); manual intervention required",
                    retries, limits.max_retries
                ),
            },
            BreakerEvent::Restart => Self::Active {
                retries: retries + 1,
                refinements,
                implementation_retries,
            },
            BreakerEvent::Rework if refinements >= limits.max_refinements => Self::Blocked {
                reason: format!(
                    "Refinement limit reached ({}/{}); manual intervention required",
                    refinements, limits.max_refinements
                ),
            },
            BreakerEvent::Rework => Self::Active {
                retries,
                refinements: refinements + 1,
                implementation_retries,
            },
            BreakerEvent::Recovery if implementation_retries >= limits.max_implementation_retries => {
                Self::Blocked {
                    reason: format!(
                        "Implementation retry limit reached ({}/{}); no source changes were produced",
                        implementation_retries, limits.max_implementation_retries
                    ),
                }
            }
            BreakerEvent::Recovery => Self::Active {
                retries,
                refinements,
                implementation_retries: implementation_retries + 1,
            },
        }
    }

    /// Write the state back onto the story.
    pub fn write_to(&self, story: &mut Story) {
        match self {
            Self::Active {
                retries,
                refinements,
                implementation_retries,
            } => {
                story.retry_count = *retries;
                story.refinement_count = *refinements;
                story.implementation_retry_count = *implementation_retries;
            }
            Self::Blocked { reason } => story.block(reason.clone()),
        }
    }
}
