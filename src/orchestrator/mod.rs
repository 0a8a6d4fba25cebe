//! Bounded parallel execution of stories in isolated worktrees.

pub mod process;
pub mod sandbox;

pub use process::{
    EventSink, ExecutionOutcome, ExecutionResult, NO_WORKTREE_FLAG, OrchestratorEvent,
    OrchestratorOptions, ProcessCommand, ProcessOrchestrator, STORY_ID_ENV, ShutdownHandle,
    conflict_gate,
};
pub use sandbox::{SandboxProvider, Teardown, WorktreeSandbox};
