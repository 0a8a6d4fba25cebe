//! Parallel story execution.
//!
//! A fixed pool of `concurrency` workers pulls story ids from a shared queue.
//! Each worker prepares a sandbox, spawns the story's process pinned to it and
//! sends an [`ExecutionResult`] down the result channel when the process
//! exits. Results arrive in completion order.
//!
//! Shutdown is cooperative: once the [`ShutdownHandle`] fires, workers stop
//! taking new stories and every live child's process group gets SIGTERM.
//! Groups still running after `shutdown_timeout` get SIGKILL. Each child
//! leads its own group, so phase commands it started go down with it.

use super::sandbox::{SandboxProvider, Teardown};
use crate::conflicts::ConflictReport;
use crate::errors::ProcessError;
use crate::logging::Logger;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, mpsc, watch};

/// Environment variable carrying the story id into the child.
pub const STORY_ID_ENV: &str = "CADENCE_STORY_ID";

/// Flag telling the child it already runs inside a sandbox.
pub const NO_WORKTREE_FLAG: &str = "--no-worktree";

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long output forwarding may lag behind the child's exit.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Succeeded,
    Failed {
        exit_code: Option<i32>,
        error: String,
    },
    /// Never admitted because shutdown started first.
    NotStarted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub story_id: String,
    pub outcome: ExecutionOutcome,
    pub duration_ms: u64,
    pub worktree: Option<PathBuf>,
}

impl ExecutionResult {
    fn failed(story_id: &str, exit_code: Option<i32>, error: impl Into<String>, started: Instant) -> Self {
        Self {
            story_id: story_id.to_string(),
            outcome: ExecutionOutcome::Failed {
                exit_code,
                error: error.into(),
            },
            duration_ms: started.elapsed().as_millis() as u64,
            worktree: None,
        }
    }

    fn not_started(story_id: String) -> Self {
        Self {
            story_id,
            outcome: ExecutionOutcome::NotStarted,
            duration_ms: 0,
            worktree: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == ExecutionOutcome::Succeeded
    }
}

/// Live progress from the workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrchestratorEvent {
    Started { story_id: String, pid: Option<u32> },
    Output { story_id: String, line: String },
    Finished { story_id: String, success: bool },
}

/// Where [`OrchestratorEvent`]s go.
#[derive(Debug, Clone)]
pub enum EventSink {
    /// Print `[story-id] line` to stdout.
    Console,
    Channel(mpsc::UnboundedSender<OrchestratorEvent>),
    Silent,
}

impl EventSink {
    fn emit(&self, event: OrchestratorEvent) {
        match self {
            Self::Console => print_event(&event),
            Self::Channel(tx) => {
                let _ = tx.send(event);
            }
            Self::Silent => {}
        }
    }
}

fn print_event(event: &OrchestratorEvent) {
    use console::style;
    match event {
        OrchestratorEvent::Started { story_id, .. } => {
            println!("{} {}", style(format!("[{}]", story_id)).cyan(), style("started").dim());
        }
        OrchestratorEvent::Output { story_id, line } => {
            println!("{} {}", style(format!("[{}]", story_id)).cyan(), line);
        }
        OrchestratorEvent::Finished { story_id, success } => {
            let status = if *success {
                style("finished").green()
            } else {
                style("failed").red()
            };
            println!("{} {}", style(format!("[{}]", story_id)).cyan(), status);
        }
    }
}

/// Idempotent stop signal shared by the orchestrator and its workers.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownHandle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Request shutdown. Returns false if it was already requested.
    pub fn trigger(&self) -> bool {
        self.tx.send_if_modified(|stopping| {
            if *stopping {
                false
            } else {
                *stopping = true;
                true
            }
        })
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Trigger on every Ctrl-C until the process exits.
    pub fn listen_for_ctrl_c(&self, logger: Logger) {
        let handle = self.clone();
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                if handle.trigger() {
                    logger.warn("Interrupt received, stopping active stories");
                }
            }
        });
    }
}

/// Resolves once shutdown has been requested.
async fn stopped(mut rx: watch::Receiver<bool>) {
    if rx.wait_for(|stopping| *stopping).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Refuse to start a batch with high-severity conflicts unless forced.
pub fn conflict_gate(report: &ConflictReport, force: bool, logger: &Logger) -> Result<(), ProcessError> {
    if report.safe_to_run_concurrently {
        return Ok(());
    }
    if force {
        logger.warn(format!("Ignoring conflicts (--force): {}", report.summary));
        return Ok(());
    }
    Err(ProcessError::UnsafeConcurrency {
        summary: report.summary.clone(),
    })
}

/// The command each story process runs.
#[derive(Debug, Clone)]
pub struct ProcessCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl ProcessCommand {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    fn build(&self, story_id: &str, dir: &Path) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .args(["--story", story_id, NO_WORKTREE_FLAG])
            .env(STORY_ID_ENV, story_id)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }
}

#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    pub concurrency: usize,
    pub shutdown_timeout: Duration,
}

struct Worker {
    command: ProcessCommand,
    sandbox: Arc<dyn SandboxProvider>,
    shutdown: ShutdownHandle,
    shutdown_timeout: Duration,
    events: EventSink,
    logger: Logger,
}

enum Exit {
    Completed(ExitStatus),
    Terminated { forced: bool },
}

pub struct ProcessOrchestrator {
    command: ProcessCommand,
    sandbox: Arc<dyn SandboxProvider>,
    options: OrchestratorOptions,
    shutdown: ShutdownHandle,
    events: EventSink,
    logger: Logger,
}

impl ProcessOrchestrator {
    pub fn new(
        command: ProcessCommand,
        sandbox: Arc<dyn SandboxProvider>,
        options: OrchestratorOptions,
        logger: Logger,
    ) -> Self {
        Self {
            command,
            sandbox,
            options,
            shutdown: ShutdownHandle::new(),
            events: EventSink::Console,
            logger,
        }
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    pub fn with_shutdown(mut self, shutdown: ShutdownHandle) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Run every story, at most `concurrency` at a time.
    ///
    /// Never fails as a whole: spawn errors and non-zero exits become that
    /// story's result. Stories still queued at shutdown come back `NotStarted`.
    pub async fn execute(&self, story_ids: Vec<String>) -> Vec<ExecutionResult> {
        let total = story_ids.len();
        if total == 0 {
            return Vec::new();
        }

        let queue = Arc::new(Mutex::new(story_ids.into_iter().collect::<VecDeque<_>>()));
        let (result_tx, mut result_rx) = mpsc::channel::<ExecutionResult>(total);
        let worker = Arc::new(Worker {
            command: self.command.clone(),
            sandbox: self.sandbox.clone(),
            shutdown: self.shutdown.clone(),
            shutdown_timeout: self.options.shutdown_timeout,
            events: self.events.clone(),
            logger: self.logger.clone(),
        });

        let pool_size = self.options.concurrency.max(1).min(total);
        self.logger.info(format!(
            "Running {} stories with {} worker(s)",
            total, pool_size
        ));

        let mut handles = Vec::with_capacity(pool_size);
        for _ in 0..pool_size {
            let queue = queue.clone();
            let result_tx = result_tx.clone();
            let worker = worker.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    if worker.shutdown.is_triggered() {
                        break;
                    }
                    let Some(story_id) = queue.lock().await.pop_front() else {
                        break;
                    };
                    let result = worker.run_story(&story_id).await;
                    if result_tx.send(result).await.is_err() {
                        break;
                    }
                }
            }));
        }
        drop(result_tx);

        let mut results = Vec::with_capacity(total);
        while let Some(result) = result_rx.recv().await {
            results.push(result);
        }
        for handle in handles {
            if let Err(e) = handle.await {
                self.logger.error(format!("Worker task panicked: {}", e));
            }
        }

        let leftover: Vec<String> = queue.lock().await.drain(..).collect();
        if !leftover.is_empty() {
            self.logger.warn(format!(
                "{} stories not started because of shutdown",
                leftover.len()
            ));
        }
        results.extend(leftover.into_iter().map(ExecutionResult::not_started));
        results
    }
}

impl Worker {
    async fn run_story(&self, story_id: &str) -> ExecutionResult {
        let started = Instant::now();
        let log = self.logger.for_story(story_id);

        let dir = match self.sandbox.create(story_id).await {
            Ok(dir) => dir,
            Err(e) => {
                log.error(format!("{}", e));
                self.events.emit(OrchestratorEvent::Finished {
                    story_id: story_id.to_string(),
                    success: false,
                });
                return ExecutionResult::failed(story_id, None, e.to_string(), started);
            }
        };

        let mut child = match self.command.build(story_id, &dir).spawn() {
            Ok(child) => child,
            Err(source) => {
                let err = ProcessError::SpawnFailed {
                    story_id: story_id.to_string(),
                    source,
                };
                log.error(format!("{}", err));
                self.events.emit(OrchestratorEvent::Finished {
                    story_id: story_id.to_string(),
                    success: false,
                });
                self.teardown(story_id, &dir).await;
                return ExecutionResult::failed(story_id, None, err.to_string(), started);
            }
        };

        let pid = child.id();
        log.info(format!("Started pid {:?} in {}", pid, dir.display()));
        self.events.emit(OrchestratorEvent::Started {
            story_id: story_id.to_string(),
            pid,
        });

        let mut forwarders = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            forwarders.push(self.forward(story_id, stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            forwarders.push(self.forward(story_id, stderr));
        }

        let waited = tokio::select! {
            status = child.wait() => Some(status),
            _ = stopped(self.shutdown.subscribe()) => None,
        };
        let exit = match waited {
            Some(Ok(status)) => Ok(Exit::Completed(status)),
            Some(Err(e)) => Err(e),
            None => Ok(self.terminate(story_id, &mut child).await),
        };

        // Anything left in the group would hold the pipes open.
        if let Some(pid) = pid {
            let _ = signal_group(pid, GroupSignal::Kill);
        }
        self.drain(story_id, forwarders).await;

        let mut result = match exit {
            Ok(Exit::Completed(status)) if status.success() => ExecutionResult {
                story_id: story_id.to_string(),
                outcome: ExecutionOutcome::Succeeded,
                duration_ms: started.elapsed().as_millis() as u64,
                worktree: None,
            },
            Ok(Exit::Completed(status)) => ExecutionResult::failed(
                story_id,
                status.code(),
                format!("Process exited with {}", status),
                started,
            ),
            Ok(Exit::Terminated { forced }) => ExecutionResult::failed(
                story_id,
                None,
                if forced {
                    format!(
                        "Interrupted by shutdown; forced kill after {:?}",
                        self.shutdown_timeout
                    )
                } else {
                    "Interrupted by shutdown; terminated gracefully".to_string()
                },
                started,
            ),
            Err(e) => ExecutionResult::failed(story_id, None, format!("Failed to wait on process: {}", e), started),
        };

        let success = result.is_success();
        self.events.emit(OrchestratorEvent::Finished {
            story_id: story_id.to_string(),
            success,
        });
        log.info(format!("Finished in {}ms (success: {})", result.duration_ms, success));

        // An interrupted story keeps its worktree so the run can be continued.
        if self.shutdown.is_triggered() && !success {
            result.worktree = Some(dir);
        } else if self.teardown(story_id, &dir).await {
            result.worktree = None;
        } else {
            result.worktree = Some(dir);
        }
        result
    }

    /// Returns false if the sandbox is still on disk.
    async fn teardown(&self, story_id: &str, dir: &Path) -> bool {
        match self.sandbox.teardown(story_id, dir).await {
            Ok(Teardown::Removed) => true,
            Ok(Teardown::Kept) => false,
            Err(e) => {
                self.logger.for_story(story_id).warn(format!("{}", e));
                false
            }
        }
    }

    /// Wait for the output forwarders, abandoning any still blocked after
    /// [`DRAIN_TIMEOUT`].
    async fn drain(&self, story_id: &str, forwarders: Vec<tokio::task::JoinHandle<()>>) {
        for mut forwarder in forwarders {
            if tokio::time::timeout(DRAIN_TIMEOUT, &mut forwarder).await.is_err() {
                self.logger
                    .for_story(story_id)
                    .warn("Output still open after exit, detaching");
                forwarder.abort();
            }
        }
    }

    fn forward<R>(&self, story_id: &str, stream: R) -> tokio::task::JoinHandle<()>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let events = self.events.clone();
        let story_id = story_id.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stream).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                events.emit(OrchestratorEvent::Output {
                    story_id: story_id.clone(),
                    line,
                });
            }
        })
    }

    /// SIGTERM, poll until the timeout, then SIGKILL.
    async fn terminate(&self, story_id: &str, child: &mut Child) -> Exit {
        let log = self.logger.for_story(story_id);
        let pid = child.id();
        if let Some(pid) = pid
            && let Err(e) = signal_group(pid, GroupSignal::Terminate)
        {
            log.warn(format!("{}", e));
        }

        let deadline = Instant::now() + self.shutdown_timeout;
        while Instant::now() < deadline {
            match child.try_wait() {
                Ok(Some(_)) => return Exit::Terminated { forced: false },
                Ok(None) => tokio::time::sleep(POLL_INTERVAL).await,
                Err(e) => {
                    log.warn(format!("Failed to poll process: {}", e));
                    break;
                }
            }
        }

        log.warn(format!(
            "Process ignored SIGTERM for {:?}, killing",
            self.shutdown_timeout
        ));
        if let Some(pid) = pid
            && let Err(e) = signal_group(pid, GroupSignal::Kill)
        {
            log.warn(format!("{}", e));
        }
        if let Err(e) = child.start_kill() {
            log.debug(format!("Failed to kill process: {}", e));
        }
        let _ = child.wait().await;
        Exit::Terminated { forced: true }
    }
}

#[derive(Debug, Clone, Copy)]
enum GroupSignal {
    Terminate,
    Kill,
}

/// Signal the process group led by `pid`. An already empty group is not an error.
#[cfg(unix)]
fn signal_group(pid: u32, signal: GroupSignal) -> Result<(), ProcessError> {
    use nix::errno::Errno;
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let signal = match signal {
        GroupSignal::Terminate => Signal::SIGTERM,
        GroupSignal::Kill => Signal::SIGKILL,
    };
    match killpg(Pid::from_raw(pid as i32), signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(ProcessError::Signal {
            pid,
            message: e.to_string(),
        }),
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: u32, _signal: GroupSignal) -> Result<(), ProcessError> {
    Ok(())
}
