//! `cadence run`: assess and execute actions for the current checkout.

use anyhow::{Result, bail};
use cadence::config::Config;
use cadence::logging::Logger;
use cadence::phase::{CommandPhaseHandler, Phase, PhaseHandler, PhaseHandlers};
use cadence::review::{ConsensusManager, ConsensusReviewHandler};
use cadence::workflow::{ActionType, RunOptions, RunSummary, StopReason, WorkflowRunner};
use console::style;
use std::path::Path;
use std::sync::Arc;

use super::super::Cli;

/// Handlers backed by the configured phase command.
pub fn build_handlers(config: &Config) -> PhaseHandlers {
    let program = config.toml.workflow.phase_cmd.as_str();
    let timeout = config.phase_timeout();
    let step = |name: &str| -> Arc<dyn PhaseHandler> {
        Arc::new(CommandPhaseHandler::new(
            program,
            name,
            timeout,
            Logger::component("phase"),
        ))
    };

    let handlers = PhaseHandlers {
        refine: step(Phase::Refine.as_str()),
        research: step(Phase::Research.as_str()),
        plan: step(Phase::Plan.as_str()),
        implement: step(Phase::Implement.as_str()),
        review: step(Phase::Review.as_str()),
        create_pr: step(ActionType::CreatePr.as_str()),
    };

    if !config.toml.review.panel {
        return handlers;
    }
    let manager = ConsensusManager::new(&config.toml.consensus, Logger::component("consensus"));
    handlers.with_review(Arc::new(ConsensusReviewHandler::new(
        program,
        timeout,
        Arc::new(manager),
        Logger::component("review"),
    )))
}

pub async fn cmd_run(
    cli: &Cli,
    project_dir: &Path,
    options: RunOptions,
    no_worktree: bool,
) -> Result<()> {
    let config = super::load_config(cli, project_dir)?;
    config.ensure_directories()?;

    let logger = Logger::component("runner");
    if no_worktree {
        logger.debug(format!(
            "Running inside story worktree {}",
            config.project_dir.display()
        ));
    }

    let store = Arc::new(super::open_store(&config));
    let runner = WorkflowRunner::new(&config, store, build_handlers(&config), logger);
    let summary = runner.execute(&options).await?;

    print_summary(&summary);
    match summary.stop {
        StopReason::Failed { story_id, error } => bail!("{} failed: {}", story_id, error),
        StopReason::Blocked { story_id, reason } => bail!("{} is blocked: {}", story_id, reason),
        _ => Ok(()),
    }
}

fn print_summary(summary: &RunSummary) {
    if let StopReason::DryRun = summary.stop {
        println!();
        if summary.planned.is_empty() {
            println!("Nothing to do.");
        } else {
            println!("{}", style("Planned actions:").bold());
            for action in &summary.planned {
                println!(
                    "  {:>5}  {}  {}",
                    action.priority,
                    style(action.to_string()).cyan(),
                    style(&action.reason).dim()
                );
            }
        }
        for block in &summary.blocked {
            println!("  {} {}: {}", style("blocked").red(), block.story_id, block.reason);
        }
        return;
    }

    for action in &summary.resumed {
        println!("{} {}", style("resumed").yellow(), action);
    }
    for executed in &summary.executed {
        let mark = if executed.result.success {
            style("✓").green()
        } else {
            style("✗").red()
        };
        println!("{} {}", mark, executed.action);
        if let Some(error) = &executed.result.error {
            println!("    {}", style(error).red());
        }
    }
    for block in &summary.blocked {
        println!("{} {}: {}", style("blocked").red(), block.story_id, block.reason);
    }

    let stop = match &summary.stop {
        StopReason::Idle => "No actions left.".to_string(),
        StopReason::SingleAction => "Executed one action (use --auto to continue).".to_string(),
        StopReason::DryRun => String::new(),
        StopReason::GateHalted { reason, .. } => format!("Stopped at stage gate: {}", reason),
        StopReason::HumanReviewRequired { story_id } => {
            format!("{} needs human review before continuing.", story_id)
        }
        StopReason::ActionCapReached { executed } => {
            format!("Stopped after {} actions (action cap).", executed)
        }
        StopReason::Failed { story_id, .. } => format!("{} failed.", story_id),
        StopReason::Blocked { story_id, .. } => format!("{} is blocked.", story_id),
    };
    println!();
    println!("{}", stop);
}
