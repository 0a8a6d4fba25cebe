//! Three-perspective review panel.
//!
//! Each perspective runs as `<phase_cmd> review <story_path> --perspective
//! <role>`. Rounds run the perspectives in parallel; their verdicts go
//! through the [`ConsensusManager`] and come back to the runner as a single
//! [`ReviewOutcome`].

use super::consensus::{
    ConsensusManager, ConsensusResult, Concern, ReviewerOutput, ReviewerRole, RoundContext,
    RoundExecutor,
};
use crate::logging::Logger;
use crate::phase::{
    CommandPhaseHandler, Phase, PhaseHandler, PhaseRequest, PhaseResult, ReviewDecision,
    ReviewOutcome,
};
use crate::util::extract_json_object;
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// What a perspective command prints as its final JSON object.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PerspectiveReport {
    approved: bool,
    #[serde(default)]
    concerns: Vec<Concern>,
    #[serde(default)]
    summary: String,
    #[serde(default, alias = "no_changes")]
    no_changes: bool,
}

/// Payload written to a perspective command's stdin.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PerspectiveInput<'a> {
    #[serde(flatten)]
    request: &'a PhaseRequest,
    perspective: ReviewerRole,
    round: &'a RoundContext,
    round_prompt: String,
}

/// Runs every perspective for one story through the phase command.
pub struct CommandRoundExecutor {
    reviewers: Vec<(ReviewerRole, CommandPhaseHandler)>,
    request: PhaseRequest,
    logger: Logger,
}

impl CommandRoundExecutor {
    pub fn new(program: &str, timeout: Duration, request: PhaseRequest, logger: Logger) -> Self {
        let reviewers = ReviewerRole::ALL
            .iter()
            .map(|role| {
                let handler = CommandPhaseHandler::new(
                    program,
                    Phase::Review.as_str(),
                    timeout,
                    logger.clone(),
                )
                .with_args(vec!["--perspective".to_string(), role.to_string()]);
                (*role, handler)
            })
            .collect();
        Self {
            reviewers,
            request,
            logger,
        }
    }

    async fn run_one(
        &self,
        role: ReviewerRole,
        handler: &CommandPhaseHandler,
        context: &RoundContext,
    ) -> Result<(ReviewerOutput, bool)> {
        let input = PerspectiveInput {
            request: &self.request,
            perspective: role,
            round: context,
            round_prompt: context.render(),
        };
        let payload = serde_json::to_string(&input).context("Failed to encode reviewer input")?;
        let (stdout, exit_code) = handler.invoke(&self.request, &payload).await?;
        if exit_code != 0 {
            bail!("{} reviewer exited with code {}", role.display_name(), exit_code);
        }

        let json = extract_json_object(&stdout)
            .with_context(|| format!("{} reviewer produced no result object", role.display_name()))?;
        let report: PerspectiveReport = serde_json::from_str(&json)
            .with_context(|| format!("Failed to parse {} reviewer output", role.display_name()))?;

        Ok((
            ReviewerOutput {
                role,
                approved: report.approved,
                concerns: report.concerns,
                summary: report.summary,
                iteration: context.iteration,
            },
            report.no_changes,
        ))
    }

    /// Run a round and also report whether any reviewer saw no source changes.
    pub async fn run_round_with_signals(
        &self,
        context: &RoundContext,
    ) -> Result<(Vec<ReviewerOutput>, bool)> {
        let futures = self
            .reviewers
            .iter()
            .map(|(role, handler)| self.run_one(*role, handler, context));
        let results = join_all(futures).await;

        let mut outputs = Vec::with_capacity(results.len());
        let mut no_changes = false;
        for result in results {
            let (output, saw_no_changes) = result?;
            no_changes |= saw_no_changes;
            outputs.push(output);
        }
        self.logger.debug(format!(
            "Round {}: {}/{} approved",
            context.iteration,
            outputs.iter().filter(|o| o.approved).count(),
            outputs.len()
        ));
        Ok((outputs, no_changes))
    }
}

#[async_trait]
impl RoundExecutor for CommandRoundExecutor {
    async fn run_round(&self, context: &RoundContext) -> Result<Vec<ReviewerOutput>> {
        self.run_round_with_signals(context)
            .await
            .map(|(outputs, _)| outputs)
    }
}

/// Review handler backed by the panel and consensus rounds.
pub struct ConsensusReviewHandler {
    program: String,
    timeout: Duration,
    manager: Arc<ConsensusManager>,
    logger: Logger,
}

impl ConsensusReviewHandler {
    pub fn new(program: &str, timeout: Duration, manager: Arc<ConsensusManager>, logger: Logger) -> Self {
        Self {
            program: program.to_string(),
            timeout,
            manager,
            logger,
        }
    }
}

/// Turn a consensus result into the outcome the runner interprets.
pub fn outcome_from_consensus(result: &ConsensusResult) -> ReviewOutcome {
    if result.reached {
        let summary: Vec<String> = result
            .final_outputs
            .iter()
            .filter(|o| !o.summary.trim().is_empty())
            .map(|o| format!("{}: {}", o.role.display_name(), o.summary.trim()))
            .collect();
        let mut outcome = ReviewOutcome::new(ReviewDecision::Approved);
        if !summary.is_empty() {
            outcome = outcome.with_feedback(summary.join("\n"));
        }
        return outcome;
    }

    let mut issues: Vec<String> = result
        .unresolved_concerns
        .iter()
        .map(|u| format!("[{}] {}", u.role.display_name(), u.concern.description))
        .collect();
    if issues.is_empty() {
        issues = result
            .final_outputs
            .iter()
            .filter(|o| !o.approved)
            .flat_map(|o| {
                o.concerns
                    .iter()
                    .map(move |c| format!("[{}] {}", o.role.display_name(), c.description))
            })
            .collect();
    }
    if issues.is_empty() {
        issues.push(format!(
            "Reviewers did not reach consensus after {} rounds",
            result.iterations
        ));
    }

    let mut outcome = ReviewOutcome::new(ReviewDecision::Rejected).with_issues(issues);
    outcome.requires_human_review = result.requires_human_review;
    outcome
}

#[async_trait]
impl PhaseHandler for ConsensusReviewHandler {
    async fn run(&self, request: &PhaseRequest) -> Result<PhaseResult> {
        let log = self.logger.for_story(&request.story_id);
        let executor = CommandRoundExecutor::new(
            &self.program,
            self.timeout,
            request.clone(),
            log.clone(),
        );

        let (initial, no_changes) = match executor.run_round_with_signals(&RoundContext::initial()).await {
            Ok(round) => round,
            Err(e) => {
                log.warn(format!("Review panel failed: {:#}", e));
                let error = format!("{:#}", e);
                return Ok(PhaseResult::failure(error.clone()).with_review(
                    ReviewOutcome::new(ReviewDecision::Failed).with_feedback(error),
                ));
            }
        };

        if no_changes {
            log.info("Reviewer reported no source changes");
            return Ok(PhaseResult::success(vec![]).with_review(
                ReviewOutcome::new(ReviewDecision::Recovery)
                    .with_feedback("No source changes were detected after implementation"),
            ));
        }

        let result = self.manager.seek_consensus(initial, &executor).await;
        let outcome = outcome_from_consensus(&result);
        log.info(format!(
            "Panel review: {} after {} round(s)",
            outcome.decision, result.iterations
        ));
        Ok(PhaseResult::success(vec![format!(
            "panel review ({} rounds)",
            result.iterations
        )])
        .with_review(outcome))
    }
}
