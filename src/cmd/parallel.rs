//! `cadence parallel`: run several stories at once in their own worktrees.

use anyhow::{Context, Result, bail};
use cadence::config::Config;
use cadence::conflicts::{ConflictCandidate, ConflictDetector, ConflictReport, GitChangeSource};
use cadence::logging::Logger;
use cadence::orchestrator::{
    ExecutionOutcome, OrchestratorOptions, ProcessCommand, ProcessOrchestrator, WorktreeSandbox,
    conflict_gate,
};
use cadence::story::{FsStoryStore, StoryStore};
use console::style;
use std::path::Path;
use std::sync::Arc;

use super::super::Cli;

/// Requested ids, or every story that still has work left.
pub(crate) fn select_stories(store: &FsStoryStore, ids: &[String]) -> Result<Vec<ConflictCandidate>> {
    if ids.is_empty() {
        return Ok(store
            .list()?
            .iter()
            .filter(|s| !s.status.is_terminal())
            .map(ConflictCandidate::from)
            .collect());
    }
    ids.iter()
        .map(|id| -> Result<ConflictCandidate> { Ok(ConflictCandidate::from(&store.get(id)?)) })
        .collect()
}

pub(crate) fn detect_conflicts(config: &Config, candidates: &[ConflictCandidate]) -> Result<ConflictReport> {
    let source = GitChangeSource::open(
        &config.project_dir,
        &config.toml.orchestrator.base_branch,
        config.worktree_dir(),
    )?;
    Ok(ConflictDetector::new(source, Logger::component("conflicts")).detect(candidates))
}

pub async fn cmd_parallel(
    cli: &Cli,
    project_dir: &Path,
    ids: &[String],
    concurrency: Option<usize>,
    force: bool,
    keep_worktrees: bool,
) -> Result<()> {
    let config = super::load_config(cli, project_dir)?;
    config.ensure_directories()?;
    let logger = Logger::component("orchestrator");

    let concurrency = concurrency.unwrap_or(config.toml.orchestrator.concurrency);
    if concurrency == 0 {
        bail!("--concurrency must be at least 1");
    }

    let store = super::open_store(&config);
    let candidates = select_stories(&store, ids)?;
    if candidates.is_empty() {
        println!("No stories with work left.");
        return Ok(());
    }

    let report = detect_conflicts(&config, &candidates)?;
    println!("{}", style(&report.summary).dim());
    conflict_gate(&report, force, &logger)?;

    let mut args = vec!["run".to_string(), "--auto".to_string()];
    if cli.verbose {
        args.push("--verbose".to_string());
    }
    let program = std::env::current_exe().context("Failed to locate the cadence executable")?;

    let sandbox = WorktreeSandbox::new(
        config.project_dir.clone(),
        config.worktree_dir(),
        &config.toml.orchestrator.base_branch,
        keep_worktrees || config.toml.orchestrator.keep_worktrees,
        Logger::component("sandbox"),
    );
    let orchestrator = ProcessOrchestrator::new(
        ProcessCommand::new(program, args),
        Arc::new(sandbox),
        OrchestratorOptions {
            concurrency,
            shutdown_timeout: config.shutdown_timeout(),
        },
        logger.clone(),
    );
    orchestrator.shutdown_handle().listen_for_ctrl_c(logger);

    let story_ids = candidates.into_iter().map(|c| c.story_id).collect();
    let results = orchestrator.execute(story_ids).await;

    println!();
    let mut failed = 0;
    for result in &results {
        let line = match &result.outcome {
            ExecutionOutcome::Succeeded => format!(
                "{} {} ({:.1}s)",
                style("✓").green(),
                result.story_id,
                result.duration_ms as f64 / 1000.0
            ),
            ExecutionOutcome::Failed { error, .. } => {
                failed += 1;
                format!("{} {}: {}", style("✗").red(), result.story_id, error)
            }
            ExecutionOutcome::NotStarted => {
                format!("{} {} (not started)", style("-").dim(), result.story_id)
            }
        };
        println!("{}", line);
        if let Some(worktree) = &result.worktree {
            println!("    worktree kept at {}", worktree.display());
        }
    }

    if failed > 0 {
        bail!("{} of {} stories failed", failed, results.len());
    }
    Ok(())
}
