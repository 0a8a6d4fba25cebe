//! Executes actions and drives the automatic loop.
//!
//! A single story's workflow is strictly sequential: assess, gate check,
//! checkpoint, execute, checkpoint, re-assess. Story state is reloaded from
//! the store after every handler call because external handlers may edit the
//! story file themselves.

use super::action::{Action, ActionType};
use super::assessor::{BlockDirective, StateAssessor};
use super::checkpoint::{MigrationOutcome, WorkflowExecutionState, WorkflowStateStore};
use crate::config::{Config, RetryLimits, ReviewSection};
use crate::errors::{StoryError, WorkflowError};
use crate::gates::{GateDecision, StageGate};
use crate::logging::Logger;
use crate::phase::{
    Phase, PhaseHandler, PhaseHandlers, PhaseRequest, PhaseResult, ReviewDecision, ReviewOutcome,
    ReworkContext,
};
use crate::story::{
    BreakerEvent, BreakerState, EffectiveLimits, REVIEW_NOTES_SECTION, RefinementIteration,
    ReviewRecord, Story, StoryStatus, StoryStore,
};
use chrono::Utc;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Options for one invocation of the runner.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Keep executing until nothing is left, a gate applies, or the cap is hit.
    pub auto: bool,
    /// Limit assessment to one story.
    pub story: Option<String>,
    pub dry_run: bool,
    /// Resume interrupted work from checkpoints first.
    pub resume: bool,
    /// Overrides `workflow.max_actions_per_run`.
    pub max_actions: Option<u32>,
}

impl RunOptions {
    /// Options as recorded in the checkpoint context.
    pub fn to_map(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("auto".into(), Value::Bool(self.auto));
        map.insert("dryRun".into(), Value::Bool(self.dry_run));
        if let Some(story) = &self.story {
            map.insert("story".into(), Value::String(story.clone()));
        }
        if let Some(max) = self.max_actions {
            map.insert("maxActions".into(), Value::from(max));
        }
        map
    }
}

/// Why a run stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    /// Nothing left to do.
    Idle,
    /// Non-automatic run executed its one action.
    SingleAction,
    DryRun,
    GateHalted { action: Action, reason: String },
    HumanReviewRequired { story_id: String },
    ActionCapReached { executed: u32 },
    Failed { story_id: String, error: String },
    Blocked { story_id: String, reason: String },
}

#[derive(Debug, Clone)]
pub struct ExecutedAction {
    pub action: Action,
    pub result: PhaseResult,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub executed: Vec<ExecutedAction>,
    /// Actions that were found interrupted and re-executed.
    pub resumed: Vec<Action>,
    /// Assessed actions for a dry run.
    pub planned: Vec<Action>,
    pub blocked: Vec<BlockDirective>,
    pub stop: StopReason,
}

impl RunSummary {
    fn new() -> Self {
        Self {
            executed: Vec::new(),
            resumed: Vec::new(),
            planned: Vec::new(),
            blocked: Vec::new(),
            stop: StopReason::Idle,
        }
    }
}

pub struct WorkflowRunner {
    store: Arc<dyn StoryStore>,
    handlers: PhaseHandlers,
    checkpoints: WorkflowStateStore,
    assessor: StateAssessor,
    gate: StageGate,
    review: ReviewSection,
    limits: RetryLimits,
    root_path: PathBuf,
    sdlc_root: PathBuf,
    max_actions: u32,
    logger: Logger,
}

impl WorkflowRunner {
    pub fn new(
        config: &Config,
        store: Arc<dyn StoryStore>,
        handlers: PhaseHandlers,
        logger: Logger,
    ) -> Self {
        let limits = config.toml.retry_limits();
        Self {
            store,
            handlers,
            checkpoints: WorkflowStateStore::new(
                config.sdlc_root.clone(),
                logger.child("checkpoint"),
            ),
            assessor: StateAssessor::new(limits, logger.child("assessor")),
            gate: StageGate::new(&config.toml.stage_gates),
            review: config.toml.review.clone(),
            limits,
            root_path: config.project_dir.clone(),
            sdlc_root: config.sdlc_root.clone(),
            max_actions: config.toml.workflow.max_actions_per_run,
            logger,
        }
    }

    pub fn checkpoints(&self) -> &WorkflowStateStore {
        &self.checkpoints
    }

    /// Execute one action and apply its outcome to the story.
    pub async fn run(&self, action: &Action) -> Result<PhaseResult, WorkflowError> {
        let mut story = self.load_story(&action.story_id)?;
        let log = self.logger.for_story(&story.id);
        log.info(format!("Running {}", action));

        match action.action_type {
            ActionType::Rework => self.run_rework(story, action).await,
            ActionType::CreatePr => {
                let result = self.invoke(&story, &self.handlers.create_pr, None).await;
                let mut story = self.load_story(&action.story_id)?;
                if result.success {
                    story.pr_url = Some(
                        result
                            .pr_url
                            .clone()
                            .or_else(|| story.branch.clone())
                            .unwrap_or_default(),
                    );
                    story.last_error = None;
                } else {
                    story.last_error = result.error.clone();
                }
                self.persist(&story)?;
                Ok(result)
            }
            ActionType::MoveToDone => {
                story.mark_done();
                story.last_error = None;
                self.persist(&story)?;
                Ok(PhaseResult::success(vec![format!("{} moved to done", story.id)]))
            }
            ActionType::Refine
            | ActionType::Research
            | ActionType::Plan
            | ActionType::Implement
            | ActionType::Review => {
                let phase = action.action_type.phase().unwrap_or(Phase::Review);
                self.run_phase(story, phase, None).await
            }
        }
    }

    async fn run_phase(
        &self,
        story: Story,
        phase: Phase,
        rework: Option<ReworkContext>,
    ) -> Result<PhaseResult, WorkflowError> {
        let mut result = self
            .invoke(&story, self.handlers.for_phase(phase), rework)
            .await;
        let mut story = self.load_story(&story.id)?;
        let log = self.logger.for_story(&story.id);

        if phase == Phase::Review && (result.success || result.review.is_some()) {
            let outcome = result
                .review
                .clone()
                .unwrap_or_else(|| ReviewOutcome::new(ReviewDecision::Approved));
            self.apply_review(&mut story, &outcome, &mut result);
        } else if result.success {
            story.complete_phase(phase);
            story.last_error = None;
        } else {
            let error = result.error.clone().unwrap_or_else(|| "unknown error".into());
            log.warn(format!("{} failed: {}", phase, error));
            story.last_error = Some(error);
        }

        self.persist(&story)?;
        Ok(result)
    }

    /// Interpret a review decision.
    fn apply_review(&self, story: &mut Story, outcome: &ReviewOutcome, result: &mut PhaseResult) {
        let log = self.logger.for_story(&story.id);
        let limits = EffectiveLimits::for_story(story, &self.limits);
        let feedback = outcome.feedback_text();
        let record = |resolved: bool| ReviewRecord {
            decision: outcome.decision,
            feedback: feedback.clone(),
            target_phase: outcome.target_phase,
            resolved,
            reviewed_at: Utc::now(),
        };

        match outcome.decision {
            ReviewDecision::Approved => {
                story.last_review = Some(record(true));
                story.last_error = None;
                if self.review.auto_complete_on_approval {
                    story.mark_done();
                    log.info("Review approved; story complete");
                } else {
                    story.complete_phase(Phase::Review);
                    log.info("Review approved");
                }
            }
            ReviewDecision::Rejected => {
                story.last_review = Some(record(false));
                if !feedback.trim().is_empty() {
                    let note = format!(
                        "### Review {} ({})\n\n{}",
                        Utc::now().format("%Y-%m-%d %H:%M"),
                        outcome.decision,
                        feedback.trim()
                    );
                    story.append_to_section(REVIEW_NOTES_SECTION, &note);
                }

                if self.review.auto_restart_on_rejection {
                    let next = BreakerState::of(story).apply(BreakerEvent::Restart, &limits);
                    if next.is_blocked() {
                        log.warn("Review rejected and retry limit reached");
                    } else {
                        story.reset_from(Phase::Research);
                        if let Some(review) = story.last_review.as_mut() {
                            review.resolved = true;
                        }
                        log.info(format!(
                            "Review rejected; restarting cycle (retry {})",
                            story.retry_count + 1
                        ));
                    }
                    next.write_to(story);
                } else {
                    log.info("Review rejected; rework pending");
                }
            }
            ReviewDecision::Recovery => {
                story.last_review = Some(record(true));
                story.implementation_complete = false;
                story.reviews_complete = false;
                let next = BreakerState::of(story).apply(BreakerEvent::Recovery, &limits);
                next.write_to(story);
                log.info("No source changes detected; implementation will be retried");
            }
            ReviewDecision::Failed => {
                let error = if feedback.trim().is_empty() {
                    result
                        .error
                        .clone()
                        .unwrap_or_else(|| "review failed".to_string())
                } else {
                    feedback.clone()
                };
                log.warn(format!("Reviewer failed: {}", error));
                story.last_error = Some(error.clone());
                result.success = false;
                result.error.get_or_insert(error);
            }
        }
    }

    async fn run_rework(&self, mut story: Story, action: &Action) -> Result<PhaseResult, WorkflowError> {
        let log = self.logger.for_story(&story.id);
        let target = action
            .context
            .as_ref()
            .map(|c| c.target_phase)
            .or_else(|| story.last_review.as_ref().map(ReviewRecord::implicated_phase))
            .unwrap_or(Phase::Implement);

        let limits = EffectiveLimits::for_story(&story, &self.limits);
        let next = BreakerState::of(&story).apply(BreakerEvent::Rework, &limits);
        if let BreakerState::Blocked { reason } = &next {
            log.warn(format!("Blocked: {}", reason));
            let result = PhaseResult::failure(reason.clone());
            next.write_to(&mut story);
            self.persist(&story)?;
            return Ok(result);
        }
        next.write_to(&mut story);

        let feedback = story
            .last_review
            .as_ref()
            .map(|r| r.feedback.clone())
            .filter(|f| !f.trim().is_empty())
            .or_else(|| story.section(REVIEW_NOTES_SECTION))
            .unwrap_or_default();
        let iteration = story.refinement_count;

        story.refinement_iterations.push(RefinementIteration {
            iteration,
            target_phase: target,
            feedback: feedback.clone(),
            started_at: Utc::now(),
        });
        story.reset_from(target);
        if let Some(review) = story.last_review.as_mut() {
            review.resolved = true;
        }
        self.persist(&story)?;

        log.info(format!("Rework iteration {} from {}", iteration, target));
        let context = ReworkContext {
            target_phase: target,
            iteration,
            feedback,
        };
        let result = self.run_phase(story, target, Some(context)).await?;
        Ok(result.add_change(format!("rework iteration {} ({})", iteration, target)))
    }

    /// Call a handler; handler errors become failed results.
    async fn invoke(
        &self,
        story: &Story,
        handler: &Arc<dyn PhaseHandler>,
        rework: Option<ReworkContext>,
    ) -> PhaseResult {
        let request = PhaseRequest {
            story_id: story.id.clone(),
            story_path: story.path.clone(),
            root_path: self.root_path.clone(),
            rework,
        };
        match handler.run(&request).await {
            Ok(result) => result,
            Err(e) => PhaseResult::failure(format!("{:#}", e)),
        }
    }

    fn load_story(&self, id: &str) -> Result<Story, WorkflowError> {
        self.store.get(id).map_err(|e| match e {
            StoryError::NotFound { id } => WorkflowError::UnknownStory { id },
            other => other.into(),
        })
    }

    fn persist(&self, story: &Story) -> Result<(), WorkflowError> {
        story
            .check_invariants()
            .map_err(|message| WorkflowError::InvariantViolation {
                story_id: story.id.clone(),
                message,
            })?;
        self.store.save(story)?;
        Ok(())
    }

    /// Run according to `options`: dry run, single action, or automatic loop.
    pub async fn execute(&self, options: &RunOptions) -> Result<RunSummary, WorkflowError> {
        let scope = options.story.as_deref();
        let mut summary = RunSummary::new();

        if options.dry_run {
            let stories = match scope {
                Some(id) => vec![self.load_story(id)?],
                None => self.store.list()?,
            };
            let assessment = self.assessor.assess(&stories);
            summary.planned = assessment.actions;
            summary.blocked = assessment.blocks;
            summary.stop = StopReason::DryRun;
            return Ok(summary);
        }

        let cap = options.max_actions.unwrap_or(self.max_actions);
        let mut states: BTreeMap<String, WorkflowExecutionState> = BTreeMap::new();
        let mut executed: u32 = 0;

        if options.resume {
            self.migrate_on_resume()?;
            for (story_id, state) in self.saved_states(scope)? {
                executed = executed.saturating_add(state.completed_actions.len() as u32);
                let interrupted = state.current_action.clone();
                states.insert(story_id, state);
                if let Some(action) = interrupted {
                    self.logger
                        .info(format!("Resuming interrupted action: {}", action));
                    summary.resumed.push(action.clone());
                    executed += 1;
                    if let Some(stop) = self.step(&action, options, &mut states, &mut summary).await? {
                        summary.stop = stop;
                        self.clear_finished(&states)?;
                        return Ok(summary);
                    }
                }
            }
        }

        summary.stop = loop {
            if executed >= cap {
                self.logger
                    .warn(format!("Action cap reached ({} actions)", cap));
                break StopReason::ActionCapReached { executed };
            }

            let assessment = self.assessor.assess_and_apply(self.store.as_ref(), scope)?;
            summary.blocked.extend(assessment.blocks.iter().cloned());
            let Some(action) = assessment.next().cloned() else {
                break StopReason::Idle;
            };

            if options.auto
                && let GateDecision::Halt { reason } = self.gate.check(&action)
            {
                self.logger.info(format!("Stage gate: {}", reason));
                break StopReason::GateHalted { action, reason };
            }

            executed += 1;
            if let Some(stop) = self.step(&action, options, &mut states, &mut summary).await? {
                break stop;
            }
        };

        self.clear_finished(&states)?;
        Ok(summary)
    }

    /// Checkpoint, execute, checkpoint. Returns a stop reason if the loop
    /// must end after this action.
    async fn step(
        &self,
        action: &Action,
        options: &RunOptions,
        states: &mut BTreeMap<String, WorkflowExecutionState>,
        summary: &mut RunSummary,
    ) -> Result<Option<StopReason>, WorkflowError> {
        let story_id = action.story_id.clone();
        if !states.contains_key(&story_id) {
            let state = match self.checkpoints.load(&story_id)? {
                Some(state) => state,
                None => WorkflowExecutionState::new(&self.sdlc_root, options.to_map()),
            };
            states.insert(story_id.clone(), state);
        }
        if let Some(state) = states.get_mut(&story_id) {
            state.begin(action);
            self.checkpoints.save(&story_id, state)?;
        }

        let result = self.run(action).await?;

        if let Some(state) = states.get_mut(&story_id) {
            state.finish_current();
            self.checkpoints.save(&story_id, state)?;
        }
        summary.executed.push(ExecutedAction {
            action: action.clone(),
            result: result.clone(),
        });

        if result
            .review
            .as_ref()
            .is_some_and(|r| r.requires_human_review)
        {
            return Ok(Some(StopReason::HumanReviewRequired { story_id }));
        }

        let story = self.load_story(&story_id)?;
        if story.status == StoryStatus::Blocked {
            return Ok(Some(StopReason::Blocked {
                story_id,
                reason: story.blocked_reason.unwrap_or_default(),
            }));
        }
        if !result.success {
            return Ok(Some(StopReason::Failed {
                story_id,
                error: result.error.unwrap_or_else(|| "unknown error".into()),
            }));
        }
        if !options.auto {
            return Ok(Some(StopReason::SingleAction));
        }
        Ok(None)
    }

    /// Per-story checkpoints that exist, filtered to `scope`.
    fn saved_states(
        &self,
        scope: Option<&str>,
    ) -> Result<Vec<(String, WorkflowExecutionState)>, WorkflowError> {
        let ids: Vec<String> = match scope {
            Some(id) => vec![id.to_string()],
            None => self.store.list()?.into_iter().map(|s| s.id).collect(),
        };
        let mut states = Vec::new();
        for id in ids {
            if let Some(state) = self.checkpoints.load(&id)? {
                states.push((id, state));
            }
        }
        Ok(states)
    }

    /// Move the legacy checkpoint into its story's file so the per-story
    /// resume below picks up an interrupted legacy action too.
    fn migrate_on_resume(&self) -> Result<(), WorkflowError> {
        match self.checkpoints.adopt_legacy()? {
            MigrationOutcome::NoLegacyState => {}
            MigrationOutcome::Skipped { reason } => self
                .logger
                .warn(format!("Legacy checkpoint left in place: {}", reason)),
            outcome => self.logger.info(format!("Legacy checkpoint: {:?}", outcome)),
        }
        Ok(())
    }

    fn clear_finished(
        &self,
        states: &BTreeMap<String, WorkflowExecutionState>,
    ) -> Result<(), WorkflowError> {
        for (story_id, state) in states {
            if state.current_action.is_none() {
                self.checkpoints.clear(story_id)?;
            }
        }
        Ok(())
    }
}
