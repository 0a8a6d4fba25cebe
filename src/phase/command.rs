//! Phase handler backed by an external command.
//!
//! The command is invoked as `<phase_cmd> <phase> <story_path> [extra args]`
//! from the project root. The request is written to stdin as JSON and the last
//! JSON object printed on stdout is read back as the result.

use super::{Phase, PhaseHandler, PhaseRequest, PhaseResult, ReviewDecision, ReviewOutcome};
use crate::logging::Logger;
use crate::util::extract_json_object;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

/// What the external command prints as its final JSON object.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseOutput {
    #[serde(default)]
    pub success: bool,
    #[serde(default, alias = "changes_made")]
    pub changes_made: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub decision: Option<ReviewDecision>,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub feedback: Option<String>,
    #[serde(default, alias = "target_phase")]
    pub target_phase: Option<Phase>,
    #[serde(default, alias = "pr_url")]
    pub pr_url: Option<String>,
}

impl PhaseOutput {
    pub fn into_result(self) -> PhaseResult {
        let review = self.decision.map(|decision| ReviewOutcome {
            decision,
            issues: self.issues,
            feedback: self.feedback,
            target_phase: self.target_phase,
            requires_human_review: false,
        });
        PhaseResult {
            success: self.success,
            changes_made: self.changes_made,
            error: self.error,
            review,
            pr_url: self.pr_url,
        }
    }
}

/// Runs one lifecycle step through an external program.
pub struct CommandPhaseHandler {
    program: String,
    step: String,
    extra_args: Vec<String>,
    timeout: Duration,
    logger: Logger,
}

impl CommandPhaseHandler {
    pub fn new(program: &str, step: &str, timeout: Duration, logger: Logger) -> Self {
        Self {
            program: program.to_string(),
            step: step.to_string(),
            extra_args: Vec::new(),
            timeout,
            logger,
        }
    }

    /// Append arguments after the story path.
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    /// Run the command with `stdin_payload` and return raw stdout plus exit code.
    pub async fn invoke(&self, request: &PhaseRequest, stdin_payload: &str) -> Result<(String, i32)> {
        let mut cmd = Command::new(&self.program);
        cmd.arg(&self.step)
            .arg(&request.story_path)
            .args(&self.extra_args)
            .env("CADENCE_STORY_ID", &request.story_id)
            .env("CADENCE_SDLC_ROOT", &request.root_path)
            .current_dir(&request.root_path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        self.logger.debug(format!(
            "Spawning: {} {} {}",
            self.program,
            self.step,
            request.story_path.display()
        ));

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn phase command '{}'", self.program))?;

        if let Some(mut stdin) = child.stdin.take() {
            // The child may exit without reading its input.
            let _ = stdin.write_all(stdin_payload.as_bytes()).await;
            let _ = stdin.shutdown().await;
        }

        let mut stdout = child.stdout.take().context("Failed to get stdout")?;
        let run = async {
            let mut output = String::new();
            stdout.read_to_string(&mut output).await?;
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((output, status.code().unwrap_or(-1)))
        };

        match tokio::time::timeout(self.timeout, run).await {
            Ok(result) => result.context("Failed to collect phase command output"),
            Err(_) => anyhow::bail!(
                "Phase command '{} {}' timed out after {}s",
                self.program,
                self.step,
                self.timeout.as_secs()
            ),
        }
    }
}

#[async_trait]
impl PhaseHandler for CommandPhaseHandler {
    async fn run(&self, request: &PhaseRequest) -> Result<PhaseResult> {
        let payload = serde_json::to_string(request).context("Failed to encode phase request")?;
        let (output, exit_code) = self.invoke(request, &payload).await?;

        let parsed = extract_json_object(&output)
            .and_then(|json| serde_json::from_str::<PhaseOutput>(&json).ok());

        let result = match parsed {
            Some(out) if exit_code == 0 => out.into_result(),
            Some(out) => {
                let mut result = out.into_result();
                result.success = false;
                result
                    .error
                    .get_or_insert_with(|| format!("exited with code {}", exit_code));
                result
            }
            None if exit_code == 0 => PhaseResult::failure(format!(
                "{} produced no result object",
                self.step
            )),
            None => PhaseResult::failure(format!("{} exited with code {}", self.step, exit_code)),
        };

        self.logger.debug(format!(
            "{} finished for {} (success: {})",
            self.step, request.story_id, result.success
        ));
        Ok(result)
    }
}
