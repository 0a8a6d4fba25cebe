//! Workflow engine: assessment, execution and checkpointing for one project.

pub mod action;
pub mod assessor;
pub mod checkpoint;
pub mod runner;

pub use action::{Action, ActionContext, ActionType};
pub use assessor::{Assessment, BlockDirective, StateAssessor, StoryDecision};
pub use checkpoint::{MigrationOutcome, WorkflowExecutionState, WorkflowStateStore};
pub use runner::{ExecutedAction, RunOptions, RunSummary, StopReason, WorkflowRunner};
