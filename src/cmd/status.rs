//! `cadence status` and `cadence migrate`.

use anyhow::Result;
use cadence::logging::Logger;
use cadence::story::{Story, StoryStatus, StoryStore};
use cadence::workflow::{MigrationOutcome, WorkflowStateStore};
use console::style;
use std::path::Path;

use super::super::Cli;

fn progress(story: &Story) -> String {
    [
        (story.research_complete, 'R'),
        (story.plan_complete, 'P'),
        (story.implementation_complete, 'I'),
        (story.reviews_complete, 'V'),
    ]
    .iter()
    .map(|(done, c)| if *done { *c } else { '.' })
    .collect()
}

pub fn cmd_status(cli: &Cli, project_dir: &Path) -> Result<()> {
    let config = super::load_config(cli, project_dir)?;
    let store = super::open_store(&config);
    let checkpoints = WorkflowStateStore::new(config.sdlc_root.clone(), Logger::component("checkpoint"));
    let stories = store.list()?;

    println!();
    if stories.is_empty() {
        println!("No stories found in {}", config.stories_dir().display());
        return Ok(());
    }

    println!(
        "{:<14} {:<12} {:<5} {:>7} {:>7} {:>7}  Title",
        "Story", "Status", "RPIV", "Retries", "Refine", "Impl"
    );
    for story in &stories {
        println!(
            "{:<14} {:<12} {:<5} {:>7} {:>7} {:>7}  {}",
            story.id,
            story.status.to_string(),
            progress(story),
            story.retry_count,
            story.refinement_count,
            story.implementation_retry_count,
            story.title
        );
        if let Some(reason) = &story.blocked_reason {
            println!("    {} {}", style("blocked:").red(), reason);
        }
        if let Some(state) = checkpoints.load(&story.id)?
            && let Some(action) = &state.current_action
        {
            println!("    {} {}", style("interrupted:").yellow(), action);
        }
    }

    let count = |status: StoryStatus| stories.iter().filter(|s| s.status == status).count();
    println!();
    println!(
        "{} stories: {} backlog, {} ready, {} in progress, {} blocked, {} done",
        stories.len(),
        count(StoryStatus::Backlog),
        count(StoryStatus::Ready),
        count(StoryStatus::InProgress),
        count(StoryStatus::Blocked),
        count(StoryStatus::Done)
    );
    Ok(())
}

pub fn cmd_migrate(cli: &Cli, project_dir: &Path) -> Result<()> {
    let config = super::load_config(cli, project_dir)?;
    let checkpoints = WorkflowStateStore::new(config.sdlc_root.clone(), Logger::component("checkpoint"));

    match checkpoints.migrate_legacy()? {
        MigrationOutcome::NoLegacyState => println!("No legacy checkpoint to migrate."),
        MigrationOutcome::Migrated { story_id, target } => {
            println!("Migrated checkpoint for {} to {}", story_id, target.display())
        }
        MigrationOutcome::AlreadyMigrated { story_id, target } => println!(
            "Checkpoint for {} was already at {}; removed the legacy file.",
            story_id,
            target.display()
        ),
        MigrationOutcome::Skipped { reason } => {
            println!("{} {}", style("Not migrated:").yellow(), reason)
        }
    }
    Ok(())
}
