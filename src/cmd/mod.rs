//! CLI command implementations.
//!
//! | Module      | Commands handled |
//! |-------------|------------------|
//! | `run`       | `Run`            |
//! | `parallel`  | `Parallel`       |
//! | `status`    | `Status`, `Migrate` |
//! | `conflicts` | `Conflicts`      |

pub mod conflicts;
pub mod parallel;
pub mod run;
pub mod status;

pub use conflicts::cmd_conflicts;
pub use parallel::cmd_parallel;
pub use run::cmd_run;
pub use status::{cmd_migrate, cmd_status};

use anyhow::Result;
use cadence::config::Config;
use cadence::logging::Logger;
use cadence::story::FsStoryStore;
use std::path::Path;

use super::Cli;

pub(crate) fn load_config(cli: &Cli, project_dir: &Path) -> Result<Config> {
    Config::load(project_dir, cli.verbose)
}

pub(crate) fn open_store(config: &Config) -> FsStoryStore {
    FsStoryStore::new(config.stories_dir(), Logger::component("store"))
        .with_limits(config.toml.retry_limits())
}
