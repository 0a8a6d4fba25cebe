//! `cadence conflicts`: report overlapping changes between stories.

use anyhow::Result;
use cadence::conflicts::Severity;
use console::style;
use std::path::Path;

use super::super::Cli;
use super::parallel::{detect_conflicts, select_stories};

pub fn cmd_conflicts(cli: &Cli, project_dir: &Path, ids: &[String], json: bool) -> Result<()> {
    let config = super::load_config(cli, project_dir)?;
    let store = super::open_store(&config);
    let candidates = select_stories(&store, ids)?;
    let report = detect_conflicts(&config, &candidates)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!();
    for conflict in report.conflicts.iter().filter(|c| c.severity != Severity::None) {
        let severity = match conflict.severity {
            Severity::High => style("high").red(),
            _ => style("medium").yellow(),
        };
        println!(
            "{} {} <-> {}",
            severity, conflict.story_a, conflict.story_b
        );
        for file in &conflict.shared_files {
            println!("    file {}", file);
        }
        if conflict.shared_files.is_empty() {
            for dir in &conflict.shared_directories {
                println!("    dir  {}/", dir);
            }
        }
        println!("    {}", style(&conflict.recommendation).dim());
    }
    println!("{}", report.summary);
    Ok(())
}
