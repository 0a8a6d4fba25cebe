//! Typed error hierarchy for Cadence.
//!
//! Four top-level enums cover the subsystems:
//! - `StoryError`: work-item store failures
//! - `CheckpointError`: workflow checkpoint persistence and migration
//! - `WorkflowError`: assessment and runner failures
//! - `ProcessError`: sandbox and child-process orchestration

use std::path::PathBuf;
use thiserror::Error;

/// Errors from the work-item store.
#[derive(Debug, Error)]
pub enum StoryError {
    #[error("Story {id} not found")]
    NotFound { id: String },

    #[error("Invalid story id {id:?}: ids may not contain path separators or '..'")]
    InvalidId { id: String },

    #[error("Failed to parse story file at {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Failed to read story file at {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write story file at {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the workflow checkpoint store.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error(
        "Workflow state at {path} is corrupted: {message}\n\
         To recover, inspect the file and fix it by hand, or delete it to discard \
         the interrupted progress (the stories themselves are not affected)."
    )]
    Corrupted { path: PathBuf, message: String },

    #[error("Workflow state at {path} is invalid: missing or malformed {fields:?}")]
    Invalid { path: PathBuf, fields: Vec<String> },

    #[error("Failed to access workflow state at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid story id {id:?} in workflow state")]
    InvalidStoryId { id: String },

    #[error("Failed to encode workflow state: {0}")]
    Encode(#[source] serde_json::Error),

    #[error(
        "Refusing to migrate {legacy}: target {target} already exists and is not valid ({message})"
    )]
    MigrationConflict {
        legacy: PathBuf,
        target: PathBuf,
        message: String,
    },

    #[error("Migration of {legacy} could not be verified: {target} missing after write")]
    MigrationUnverified { legacy: PathBuf, target: PathBuf },
}

/// Errors from assessment and the workflow runner.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("Story {id} no longer exists")]
    UnknownStory { id: String },

    #[error("Phase {phase} failed for story {story_id}: {message}")]
    PhaseFailed {
        phase: String,
        story_id: String,
        message: String,
    },

    #[error("Refusing to save story {story_id}: {message}")]
    InvariantViolation { story_id: String, message: String },

    #[error(transparent)]
    Story(#[from] StoryError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from sandbox creation and child-process orchestration.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Failed to spawn process for story {story_id}: {source}")]
    SpawnFailed {
        story_id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Sandbox setup failed for story {story_id}: {message}")]
    Sandbox { story_id: String, message: String },

    #[error("Failed to signal process group {pid}: {message}")]
    Signal { pid: u32, message: String },

    #[error("Conflicts between active stories make concurrent execution unsafe: {summary}")]
    UnsafeConcurrency { summary: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corrupted_checkpoint_mentions_remediation() {
        let err = CheckpointError::Corrupted {
            path: PathBuf::from("/p/.cadence/stories/S-1/.workflow-state.json"),
            message: "EOF while parsing".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("corrupted"));
        assert!(text.contains("delete it"));
        assert!(text.contains("S-1"));
    }

    #[test]
    fn workflow_error_converts_from_story_error() {
        let inner = StoryError::NotFound { id: "S-9".into() };
        let err: WorkflowError = inner.into();
        match &err {
            WorkflowError::Story(StoryError::NotFound { id }) => assert_eq!(id, "S-9"),
            _ => panic!("Expected WorkflowError::Story(NotFound)"),
        }
    }

    #[test]
    fn invalid_checkpoint_lists_fields() {
        let err = CheckpointError::Invalid {
            path: PathBuf::from("state.json"),
            fields: vec!["workflowId".into(), "context.sdlcRoot".into()],
        };
        let text = err.to_string();
        assert!(text.contains("workflowId"));
        assert!(text.contains("context.sdlcRoot"));
    }

    #[test]
    fn spawn_failed_is_matchable() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "no such binary");
        let err = ProcessError::SpawnFailed {
            story_id: "S-1".into(),
            source: io_err,
        };
        match &err {
            ProcessError::SpawnFailed { story_id, source } => {
                assert_eq!(story_id, "S-1");
                assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
            }
            _ => panic!("Expected SpawnFailed"),
        }
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&StoryError::NotFound { id: "x".into() });
        assert_std_error(&WorkflowError::UnknownStory { id: "x".into() });
        assert_std_error(&ProcessError::UnsafeConcurrency {
            summary: "x".into(),
        });
    }
}
