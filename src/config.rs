//! Unified configuration system for Cadence.
//!
//! Settings are read from `.cadence/cadence.toml` and layered:
//! file → environment → CLI.
//!
//! # Configuration File Format
//!
//! ```toml
//! [workflow]
//! max_actions_per_run = 100
//! phase_cmd = "cadence-agent"
//! phase_timeout_secs = 1800
//!
//! [stage_gates]
//! require_approval_before_implementation = false
//! require_approval_before_pr = true
//!
//! [review]
//! max_retries = 3
//! max_retries_upper_bound = 10
//! auto_complete_on_approval = true
//! auto_restart_on_rejection = false
//! max_implementation_retries = 3
//! panel = true
//!
//! [refinement]
//! max_iterations = 3
//! max_iterations_upper_bound = 10
//!
//! [consensus]
//! max_iterations = 3
//! require_unanimous = true
//! approval_threshold = 0.67
//!
//! [orchestrator]
//! concurrency = 2
//! shutdown_timeout_secs = 10
//! keep_worktrees = false
//! base_branch = "main"
//! worktree_dir = ".cadence/worktrees"
//! ```

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the working directory inside the project.
pub const SDLC_DIR: &str = ".cadence";

/// Workflow runner settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSection {
    /// Hard cap on actions executed by one automatic run
    #[serde(default = "default_max_actions")]
    pub max_actions_per_run: u32,
    /// External command implementing the phase handlers
    #[serde(default = "default_phase_cmd")]
    pub phase_cmd: String,
    /// Timeout applied to each phase handler invocation
    #[serde(default = "default_phase_timeout")]
    pub phase_timeout_secs: u64,
}

fn default_max_actions() -> u32 {
    100
}

fn default_phase_cmd() -> String {
    "cadence-agent".to_string()
}

fn default_phase_timeout() -> u64 {
    1800
}

impl Default for WorkflowSection {
    fn default() -> Self {
        Self {
            max_actions_per_run: default_max_actions(),
            phase_cmd: default_phase_cmd(),
            phase_timeout_secs: default_phase_timeout(),
        }
    }
}

/// Stage gates halt automatic mode before the named transition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageGatesSection {
    #[serde(default)]
    pub require_approval_before_implementation: bool,
    #[serde(default)]
    pub require_approval_before_pr: bool,
}

/// Review outcome handling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewSection {
    /// Default retry ceiling for full-cycle restarts
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Per-story overrides are clamped to this bound
    #[serde(default = "default_upper_bound")]
    pub max_retries_upper_bound: u32,
    /// On approval, mark every phase complete and move the story to done
    #[serde(default = "default_true")]
    pub auto_complete_on_approval: bool,
    /// On rejection, restart the whole cycle while retries remain
    #[serde(default)]
    pub auto_restart_on_rejection: bool,
    /// Ceiling for implementation-only retries after a recovery signal
    #[serde(default = "default_max_retries")]
    pub max_implementation_retries: u32,
    /// Review through the three-perspective panel and consensus rounds
    #[serde(default = "default_true")]
    pub panel: bool,
}

fn default_max_retries() -> u32 {
    3
}

fn default_upper_bound() -> u32 {
    10
}

fn default_true() -> bool {
    true
}

impl Default for ReviewSection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            max_retries_upper_bound: default_upper_bound(),
            auto_complete_on_approval: true,
            auto_restart_on_rejection: false,
            max_implementation_retries: default_max_retries(),
            panel: true,
        }
    }
}

/// Rework loop limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefinementSection {
    #[serde(default = "default_max_retries")]
    pub max_iterations: u32,
    #[serde(default = "default_upper_bound")]
    pub max_iterations_upper_bound: u32,
}

impl Default for RefinementSection {
    fn default() -> Self {
        Self {
            max_iterations: default_max_retries(),
            max_iterations_upper_bound: default_upper_bound(),
        }
    }
}

/// Multi-reviewer consensus settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusSection {
    #[serde(default = "default_max_retries")]
    pub max_iterations: u32,
    #[serde(default = "default_true")]
    pub require_unanimous: bool,
    /// Minimum approval ratio when unanimity is not required
    #[serde(default = "default_approval_threshold")]
    pub approval_threshold: f64,
}

fn default_approval_threshold() -> f64 {
    0.67
}

impl Default for ConsensusSection {
    fn default() -> Self {
        Self {
            max_iterations: default_max_retries(),
            require_unanimous: true,
            approval_threshold: default_approval_threshold(),
        }
    }
}

/// Parallel execution settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorSection {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
    #[serde(default)]
    pub keep_worktrees: bool,
    #[serde(default = "default_base_branch")]
    pub base_branch: String,
    /// Relative to the project directory
    #[serde(default = "default_worktree_dir")]
    pub worktree_dir: PathBuf,
}

fn default_concurrency() -> usize {
    2
}

fn default_shutdown_timeout() -> u64 {
    10
}

fn default_base_branch() -> String {
    "main".to_string()
}

fn default_worktree_dir() -> PathBuf {
    PathBuf::from(SDLC_DIR).join("worktrees")
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            keep_worktrees: false,
            base_branch: default_base_branch(),
            worktree_dir: default_worktree_dir(),
        }
    }
}

/// The complete cadence.toml configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CadenceToml {
    #[serde(default)]
    pub workflow: WorkflowSection,
    #[serde(default)]
    pub stage_gates: StageGatesSection,
    #[serde(default)]
    pub review: ReviewSection,
    #[serde(default)]
    pub refinement: RefinementSection,
    #[serde(default)]
    pub consensus: ConsensusSection,
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
}

impl CadenceToml {
    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse cadence.toml")
    }

    /// Load from `<sdlc_root>/cadence.toml`, or defaults if the file is absent.
    pub fn load_or_default(sdlc_root: &Path) -> Result<Self> {
        let path = sdlc_root.join("cadence.toml");
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
    }

    /// Apply `CADENCE_*` environment overrides.
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(cmd) = lookup("CADENCE_PHASE_CMD") {
            self.workflow.phase_cmd = cmd;
        }
        if let Some(value) = lookup("CADENCE_CONCURRENCY") {
            self.orchestrator.concurrency = value
                .parse()
                .with_context(|| format!("Invalid CADENCE_CONCURRENCY '{}'", value))?;
        }
        if let Some(value) = lookup("CADENCE_MAX_ACTIONS") {
            self.workflow.max_actions_per_run = value
                .parse()
                .with_context(|| format!("Invalid CADENCE_MAX_ACTIONS '{}'", value))?;
        }
        Ok(())
    }

    /// Reject values that cannot work at runtime.
    pub fn validate(&self) -> Result<()> {
        if self.orchestrator.concurrency == 0 {
            bail!("orchestrator.concurrency must be at least 1");
        }
        if self.workflow.max_actions_per_run == 0 {
            bail!("workflow.max_actions_per_run must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.consensus.approval_threshold) {
            bail!(
                "consensus.approval_threshold must be within 0.0..=1.0, got {}",
                self.consensus.approval_threshold
            );
        }
        if self.consensus.max_iterations == 0 {
            bail!("consensus.max_iterations must be at least 1");
        }
        if self.review.max_retries > self.review.max_retries_upper_bound {
            bail!(
                "review.max_retries ({}) exceeds review.max_retries_upper_bound ({})",
                self.review.max_retries,
                self.review.max_retries_upper_bound
            );
        }
        if self.refinement.max_iterations > self.refinement.max_iterations_upper_bound {
            bail!(
                "refinement.max_iterations ({}) exceeds refinement.max_iterations_upper_bound ({})",
                self.refinement.max_iterations,
                self.refinement.max_iterations_upper_bound
            );
        }
        Ok(())
    }
}

/// Effective ceilings used by the assessor and runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryLimits {
    pub max_retries: u32,
    pub max_retries_upper_bound: u32,
    pub max_refinements: u32,
    pub max_refinements_upper_bound: u32,
    pub max_implementation_retries: u32,
}

impl Default for RetryLimits {
    fn default() -> Self {
        CadenceToml::default().retry_limits()
    }
}

impl CadenceToml {
    pub fn retry_limits(&self) -> RetryLimits {
        RetryLimits {
            max_retries: self.review.max_retries,
            max_retries_upper_bound: self.review.max_retries_upper_bound,
            max_refinements: self.refinement.max_iterations,
            max_refinements_upper_bound: self.refinement.max_iterations_upper_bound,
            max_implementation_retries: self.review.max_implementation_retries,
        }
    }
}

/// Resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub sdlc_root: PathBuf,
    pub toml: CadenceToml,
    pub verbose: bool,
}

impl Config {
    /// Load configuration for a project directory (file → env).
    pub fn load(project_dir: &Path, verbose: bool) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let sdlc_root = project_dir.join(SDLC_DIR);
        let mut toml = CadenceToml::load_or_default(&sdlc_root)?;
        toml.apply_env()?;
        toml.validate()?;

        Ok(Self {
            project_dir,
            sdlc_root,
            toml,
            verbose,
        })
    }

    pub fn stories_dir(&self) -> PathBuf {
        self.sdlc_root.join("stories")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.sdlc_root.join("logs")
    }

    pub fn worktree_dir(&self) -> PathBuf {
        self.project_dir.join(&self.toml.orchestrator.worktree_dir)
    }

    pub fn phase_timeout(&self) -> Duration {
        Duration::from_secs(self.toml.workflow.phase_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.toml.orchestrator.shutdown_timeout_secs)
    }

    /// Create the working directories.
    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(self.stories_dir()).context("Failed to create stories directory")?;
        std::fs::create_dir_all(self.log_dir()).context("Failed to create log directory")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let toml = CadenceToml::default();
        assert_eq!(toml.workflow.max_actions_per_run, 100);
        assert_eq!(toml.review.max_retries, 3);
        assert!(toml.review.auto_complete_on_approval);
        assert!(!toml.review.auto_restart_on_rejection);
        assert_eq!(toml.refinement.max_iterations, 3);
        assert_eq!(toml.orchestrator.concurrency, 2);
        assert!(toml.consensus.require_unanimous);
        assert!(toml.validate().is_ok());
    }

    #[test]
    fn test_parse_partial_file() {
        let toml = CadenceToml::parse(
            r#"
[stage_gates]
require_approval_before_pr = true

[orchestrator]
concurrency = 4
"#,
        )
        .unwrap();
        assert!(toml.stage_gates.require_approval_before_pr);
        assert!(!toml.stage_gates.require_approval_before_implementation);
        assert_eq!(toml.orchestrator.concurrency, 4);
        assert_eq!(toml.orchestrator.base_branch, "main");
        assert_eq!(toml.review.max_retries, 3);
    }

    #[test]
    fn test_parse_invalid_toml() {
        assert!(CadenceToml::parse("not valid toml {{{{").is_err());
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let mut toml = CadenceToml::default();
        toml.orchestrator.concurrency = 0;
        assert!(toml.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_threshold_out_of_range() {
        let mut toml = CadenceToml::default();
        toml.consensus.approval_threshold = 1.5;
        let err = toml.validate().unwrap_err().to_string();
        assert!(err.contains("approval_threshold"));
    }

    #[test]
    fn test_validate_rejects_default_above_upper_bound() {
        let mut toml = CadenceToml::default();
        toml.review.max_retries = 20;
        assert!(toml.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("CADENCE_PHASE_CMD", "my-agent"),
            ("CADENCE_CONCURRENCY", "5"),
            ("CADENCE_MAX_ACTIONS", "7"),
        ]
        .into_iter()
        .collect();
        let mut toml = CadenceToml::default();
        toml.apply_env_from(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(toml.workflow.phase_cmd, "my-agent");
        assert_eq!(toml.orchestrator.concurrency, 5);
        assert_eq!(toml.workflow.max_actions_per_run, 7);
    }

    #[test]
    fn test_env_override_invalid_number() {
        let mut toml = CadenceToml::default();
        let result = toml.apply_env_from(|k| {
            (k == "CADENCE_CONCURRENCY").then(|| "many".to_string())
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_load_or_default_reads_file() {
        let dir = tempdir().unwrap();
        std::fs::write(
            dir.path().join("cadence.toml"),
            "[review]\nauto_restart_on_rejection = true\n",
        )
        .unwrap();
        let toml = CadenceToml::load_or_default(dir.path()).unwrap();
        assert!(toml.review.auto_restart_on_rejection);
    }

    #[test]
    fn test_config_paths() {
        let dir = tempdir().unwrap();
        let config = Config::load(dir.path(), false).unwrap();
        assert!(config.sdlc_root.ends_with(".cadence"));
        assert!(config.stories_dir().ends_with(".cadence/stories"));
        assert!(config.worktree_dir().ends_with(".cadence/worktrees"));
    }
}
