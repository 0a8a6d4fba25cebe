use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "cadence")]
#[command(version, about = "Drive stories through refine, research, plan, implement and review")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Console log format
    #[arg(long, value_enum, default_value = "pretty", global = true)]
    pub log_format: LogFormatArg,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
pub enum LogFormatArg {
    Pretty,
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Assess stories and execute the next action (or all of them with --auto)
    Run {
        /// Keep going until idle, a stage gate applies or the action cap is hit
        #[arg(long)]
        auto: bool,

        /// Only work on this story
        #[arg(long)]
        story: Option<String>,

        /// Print the assessed actions without executing anything
        #[arg(long)]
        dry_run: bool,

        /// Resume interrupted work from saved checkpoints
        #[arg(long = "continue")]
        resume: bool,

        /// Hard cap on actions executed by this run
        #[arg(long)]
        max_actions: Option<u32>,

        /// Already running inside a story worktree
        #[arg(long)]
        no_worktree: bool,
    },
    /// Run several stories at once, each in its own worktree
    Parallel {
        /// Stories to run (defaults to every story with work left)
        ids: Vec<String>,

        #[arg(long)]
        concurrency: Option<usize>,

        /// Start even if stories modify the same files
        #[arg(long)]
        force: bool,

        /// Leave worktrees on disk after stories finish
        #[arg(long)]
        keep_worktrees: bool,
    },
    /// Summarise stories by status
    Status,
    /// Check stories for overlapping changes
    Conflicts {
        /// Stories to compare (defaults to every story that is not done)
        ids: Vec<String>,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Move a legacy global checkpoint to its story
    Migrate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    let format = match cli.log_format {
        LogFormatArg::Pretty => cadence::logging::LogFormat::Pretty,
        LogFormatArg::Json => cadence::logging::LogFormat::Json,
    };
    let log_dir = project_dir
        .join(cadence::config::SDLC_DIR)
        .join("logs");
    let log_dir = log_dir.parent().is_some_and(|p| p.exists()).then_some(log_dir);
    let _guard = cadence::logging::init_tracing(cli.verbose, format, log_dir.as_deref());

    match &cli.command {
        Commands::Run {
            auto,
            story,
            dry_run,
            resume,
            max_actions,
            no_worktree,
        } => {
            let options = cadence::workflow::RunOptions {
                auto: *auto,
                story: story.clone(),
                dry_run: *dry_run,
                resume: *resume,
                max_actions: *max_actions,
            };
            cmd::cmd_run(&cli, &project_dir, options, *no_worktree).await?;
        }
        Commands::Parallel {
            ids,
            concurrency,
            force,
            keep_worktrees,
        } => {
            cmd::cmd_parallel(&cli, &project_dir, ids, *concurrency, *force, *keep_worktrees)
                .await?;
        }
        Commands::Status => cmd::cmd_status(&cli, &project_dir)?,
        Commands::Conflicts { ids, json } => cmd::cmd_conflicts(&cli, &project_dir, ids, *json)?,
        Commands::Migrate => cmd::cmd_migrate(&cli, &project_dir)?,
    }

    Ok(())
}
