//! Durable workflow checkpoints.
//!
//! One JSON file per story at `.cadence/stories/<id>/.workflow-state.json`.
//! Older installs kept a single file at `.cadence/.workflow-state.json`;
//! [`WorkflowStateStore::migrate_legacy`] moves it to the per-story layout.

use super::action::Action;
use crate::errors::CheckpointError;
use crate::logging::Logger;
use crate::story::is_valid_story_id;
use crate::util::atomic_write;
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

pub const STATE_FILE: &str = ".workflow-state.json";
const LOCK_FILE: &str = ".workflow-state.lock";
pub const STATE_VERSION: &str = "1.0";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowContext {
    pub sdlc_root: PathBuf,
    #[serde(default)]
    pub options: Map<String, Value>,
}

/// Snapshot of an in-flight workflow run.
///
/// A non-null `current_action` means the run stopped mid-action; that action
/// is not complete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowExecutionState {
    pub version: String,
    pub workflow_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub current_action: Option<Action>,
    pub completed_actions: Vec<Action>,
    pub context: WorkflowContext,
}

impl WorkflowExecutionState {
    pub fn new(sdlc_root: &Path, options: Map<String, Value>) -> Self {
        Self {
            version: STATE_VERSION.to_string(),
            workflow_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            current_action: None,
            completed_actions: Vec::new(),
            context: WorkflowContext {
                sdlc_root: sdlc_root.to_path_buf(),
                options,
            },
        }
    }

    /// Story id recorded in the run options, if any.
    pub fn story_id(&self) -> Option<&str> {
        self.context
            .options
            .get("story")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    pub fn begin(&mut self, action: &Action) {
        self.current_action = Some(action.clone());
        self.timestamp = Utc::now();
    }

    pub fn finish_current(&mut self) {
        if let Some(action) = self.current_action.take() {
            self.completed_actions.push(action);
        }
        self.timestamp = Utc::now();
    }
}

/// Result of a legacy checkpoint migration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationOutcome {
    NoLegacyState,
    Migrated { story_id: String, target: PathBuf },
    /// An identical-purpose checkpoint was already in place and valid.
    AlreadyMigrated { story_id: String, target: PathBuf },
    /// Left untouched; the legacy file remains on disk.
    Skipped { reason: String },
}

pub struct WorkflowStateStore {
    sdlc_root: PathBuf,
    logger: Logger,
}

impl WorkflowStateStore {
    pub fn new(sdlc_root: PathBuf, logger: Logger) -> Self {
        Self { sdlc_root, logger }
    }

    pub fn legacy_path(&self) -> PathBuf {
        self.sdlc_root.join(STATE_FILE)
    }

    pub fn path_for(&self, story_id: &str) -> PathBuf {
        self.sdlc_root.join("stories").join(story_id).join(STATE_FILE)
    }

    fn checked_path(&self, story_id: &str) -> Result<PathBuf, CheckpointError> {
        if !is_valid_story_id(story_id) {
            return Err(CheckpointError::InvalidStoryId {
                id: story_id.to_string(),
            });
        }
        Ok(self.path_for(story_id))
    }

    pub fn save(&self, story_id: &str, state: &WorkflowExecutionState) -> Result<(), CheckpointError> {
        self.save_to(&self.checked_path(story_id)?, state)
    }

    pub fn load(&self, story_id: &str) -> Result<Option<WorkflowExecutionState>, CheckpointError> {
        self.load_from(&self.checked_path(story_id)?)
    }

    pub fn clear(&self, story_id: &str) -> Result<(), CheckpointError> {
        let path = self.checked_path(story_id)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(CheckpointError::Io { path, source }),
        }
    }

    /// Read the legacy global checkpoint without migrating it.
    pub fn load_legacy(&self) -> Result<Option<WorkflowExecutionState>, CheckpointError> {
        self.load_from(&self.legacy_path())
    }

    fn save_to(&self, path: &Path, state: &WorkflowExecutionState) -> Result<(), CheckpointError> {
        let json = serde_json::to_string_pretty(state).map_err(CheckpointError::Encode)?;
        let io_err = |source| CheckpointError::Io {
            path: path.to_path_buf(),
            source,
        };

        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir).map_err(io_err)?;
        let lock = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(dir.join(LOCK_FILE))
            .map_err(io_err)?;
        lock.lock_exclusive().map_err(io_err)?;

        let written = atomic_write(path, json.as_bytes());
        let _ = lock.unlock();
        written.map_err(io_err)?;

        self.logger.debug(format!(
            "Checkpoint saved to {} ({} completed)",
            path.display(),
            state.completed_actions.len()
        ));
        Ok(())
    }

    fn load_from(&self, path: &Path) -> Result<Option<WorkflowExecutionState>, CheckpointError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(CheckpointError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };

        let value: Value = serde_json::from_str(&text).map_err(|e| CheckpointError::Corrupted {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        validate(path, &value)?;

        if let Some(version) = value.get("version").and_then(Value::as_str)
            && version != STATE_VERSION
        {
            self.logger.warn(format!(
                "Checkpoint {} has version {} (expected {}); loading anyway",
                path.display(),
                version,
                STATE_VERSION
            ));
        }

        serde_json::from_value(value)
            .map(Some)
            .map_err(|e| CheckpointError::Invalid {
                path: path.to_path_buf(),
                fields: vec![e.to_string()],
            })
    }

    /// Move the legacy global checkpoint to its story's own file.
    ///
    /// A checkpoint that is mid-action, or that does not name its story, is
    /// left where it is. The legacy file is only removed once the per-story
    /// file is confirmed on disk and readable.
    pub fn migrate_legacy(&self) -> Result<MigrationOutcome, CheckpointError> {
        self.migrate(false)
    }

    /// Like [`migrate_legacy`](Self::migrate_legacy), but also moves a
    /// checkpoint interrupted mid-action so it can be resumed from the
    /// story's file. Its story is the interrupted action's story when the
    /// options do not name one. An interrupted legacy checkpoint never
    /// replaces an existing per-story checkpoint.
    pub fn adopt_legacy(&self) -> Result<MigrationOutcome, CheckpointError> {
        self.migrate(true)
    }

    fn migrate(&self, allow_interrupted: bool) -> Result<MigrationOutcome, CheckpointError> {
        let legacy = self.legacy_path();
        let Some(state) = self.load_from(&legacy)? else {
            return Ok(MigrationOutcome::NoLegacyState);
        };

        if let Some(action) = &state.current_action
            && !allow_interrupted
        {
            let reason = format!(
                "workflow was interrupted during '{}'; finish it with `cadence run --continue` first",
                action
            );
            self.logger.warn(format!("Not migrating {}: {}", legacy.display(), reason));
            return Ok(MigrationOutcome::Skipped { reason });
        }

        let story_id = state
            .story_id()
            .map(str::to_string)
            .or_else(|| state.current_action.as_ref().map(|a| a.story_id.clone()));
        let Some(story_id) = story_id else {
            let reason = "checkpoint does not record which story it belongs to".to_string();
            self.logger.warn(format!("Not migrating {}: {}", legacy.display(), reason));
            return Ok(MigrationOutcome::Skipped { reason });
        };

        let target = self.checked_path(&story_id)?;
        if target.exists() && state.current_action.is_some() {
            return Err(CheckpointError::MigrationConflict {
                legacy,
                target,
                message: "the legacy checkpoint was interrupted mid-action and the story already has its own checkpoint".to_string(),
            });
        }
        if target.exists() {
            return match self.load_from(&target) {
                Ok(Some(_)) => {
                    self.remove_legacy(&legacy)?;
                    self.logger.info(format!(
                        "Checkpoint for {} already migrated; removed {}",
                        story_id,
                        legacy.display()
                    ));
                    Ok(MigrationOutcome::AlreadyMigrated { story_id, target })
                }
                Ok(None) => Err(CheckpointError::MigrationUnverified { legacy, target }),
                Err(e) => Err(CheckpointError::MigrationConflict {
                    legacy,
                    target,
                    message: e.to_string(),
                }),
            };
        }

        self.save_to(&target, &state)?;
        match self.load_from(&target) {
            Ok(Some(_)) => {}
            _ => return Err(CheckpointError::MigrationUnverified { legacy, target }),
        }
        self.remove_legacy(&legacy)?;

        self.logger.info(format!(
            "Migrated {} to {}",
            legacy.display(),
            target.display()
        ));
        Ok(MigrationOutcome::Migrated { story_id, target })
    }

    fn remove_legacy(&self, legacy: &Path) -> Result<(), CheckpointError> {
        std::fs::remove_file(legacy).map_err(|source| CheckpointError::Io {
            path: legacy.to_path_buf(),
            source,
        })
    }
}

/// Check required fields before decoding.
fn validate(path: &Path, value: &Value) -> Result<(), CheckpointError> {
    let mut missing = Vec::new();
    let is_str = |key: &str| value.get(key).is_some_and(Value::is_string);

    if !value.is_object() {
        return Err(CheckpointError::Invalid {
            path: path.to_path_buf(),
            fields: vec!["<root object>".to_string()],
        });
    }
    for key in ["version", "workflowId", "timestamp"] {
        if !is_str(key) {
            missing.push(key.to_string());
        }
    }
    if !value.get("completedActions").is_some_and(Value::is_array) {
        missing.push("completedActions".to_string());
    }
    if !value
        .get("context")
        .and_then(|c| c.get("sdlcRoot"))
        .is_some_and(Value::is_string)
    {
        missing.push("context.sdlcRoot".to_string());
    }

    if missing.is_empty() {
        Ok(())
    } else {
        Err(CheckpointError::Invalid {
            path: path.to_path_buf(),
            fields: missing,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::action::ActionType;
    use tempfile::tempdir;

    fn store(root: &Path) -> WorkflowStateStore {
        WorkflowStateStore::new(root.to_path_buf(), Logger::disabled())
    }

    fn options(story: Option<&str>) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("auto".into(), Value::Bool(true));
        if let Some(id) = story {
            map.insert("story".into(), Value::String(id.into()));
        }
        map
    }

    fn action(kind: ActionType) -> Action {
        Action::new(kind, "S-1", PathBuf::from("stories/S-1/story.md"), 0, "next")
    }

    fn write_legacy(root: &Path, state: &WorkflowExecutionState) {
        std::fs::create_dir_all(root).unwrap();
        std::fs::write(
            root.join(STATE_FILE),
            serde_json::to_string_pretty(state).unwrap(),
        )
        .unwrap();
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let mut state = WorkflowExecutionState::new(dir.path(), options(Some("S-1")));
        state.completed_actions.push(action(ActionType::Research));
        state.begin(&action(ActionType::Plan));

        store.save("S-1", &state).unwrap();
        let loaded = store.load("S-1").unwrap().unwrap();
        assert_eq!(loaded, state);
        assert!(store.path_for("S-1").ends_with("stories/S-1/.workflow-state.json"));
    }

    #[test]
    fn test_current_action_serialized_as_null() {
        let dir = tempdir().unwrap();
        let state = WorkflowExecutionState::new(dir.path(), Map::new());
        let json = serde_json::to_value(&state).unwrap();
        assert!(json["currentAction"].is_null());
        assert_eq!(json["version"], "1.0");
        assert!(json["context"]["sdlcRoot"].is_string());
    }

    #[test]
    fn test_load_missing_is_none() {
        let dir = tempdir().unwrap();
        assert!(store(dir.path()).load("S-1").unwrap().is_none());
    }

    #[test]
    fn test_truncated_file_is_corruption() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let state = WorkflowExecutionState::new(dir.path(), options(Some("S-1")));
        store.save("S-1", &state).unwrap();

        let path = store.path_for("S-1");
        let text = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, &text[..text.len() / 2]).unwrap();

        let err = store.load("S-1").unwrap_err();
        assert!(matches!(err, CheckpointError::Corrupted { .. }));
        assert!(err.to_string().contains("delete it"));
    }

    #[test]
    fn test_missing_fields_are_invalid() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let path = store.path_for("S-1");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, r#"{"version":"1.0","completedActions":[],"context":{}}"#).unwrap();

        match store.load("S-1").unwrap_err() {
            CheckpointError::Invalid { fields, .. } => {
                assert!(fields.contains(&"workflowId".to_string()));
                assert!(fields.contains(&"timestamp".to_string()));
                assert!(fields.contains(&"context.sdlcRoot".to_string()));
            }
            other => panic!("Expected Invalid, got {:?}", other),
        }
    }

    #[test]
    fn test_version_mismatch_still_loads() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let mut state = WorkflowExecutionState::new(dir.path(), Map::new());
        state.version = "2.0".into();
        store.save("S-1", &state).unwrap();
        assert_eq!(store.load("S-1").unwrap().unwrap().version, "2.0");
    }

    #[test]
    fn test_clear_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store
            .save("S-1", &WorkflowExecutionState::new(dir.path(), Map::new()))
            .unwrap();
        store.clear("S-1").unwrap();
        store.clear("S-1").unwrap();
        assert!(store.load("S-1").unwrap().is_none());
    }

    #[test]
    fn test_migrate_without_legacy() {
        let dir = tempdir().unwrap();
        assert_eq!(
            store(dir.path()).migrate_legacy().unwrap(),
            MigrationOutcome::NoLegacyState
        );
    }

    #[test]
    fn test_migrate_moves_legacy_to_story() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let mut state = WorkflowExecutionState::new(dir.path(), options(Some("S-1")));
        state.completed_actions.push(action(ActionType::Refine));
        write_legacy(dir.path(), &state);

        let outcome = store.migrate_legacy().unwrap();
        assert!(matches!(outcome, MigrationOutcome::Migrated { ref story_id, .. } if story_id == "S-1"));
        assert!(!store.legacy_path().exists());
        assert_eq!(store.load("S-1").unwrap().unwrap(), state);
    }

    #[test]
    fn test_migrate_refuses_mid_flight_checkpoint() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let mut state = WorkflowExecutionState::new(dir.path(), options(Some("S-1")));
        state.begin(&action(ActionType::Implement));
        write_legacy(dir.path(), &state);

        let outcome = store.migrate_legacy().unwrap();
        assert!(matches!(outcome, MigrationOutcome::Skipped { .. }));
        assert!(store.legacy_path().exists());
        assert!(!store.path_for("S-1").exists());
    }

    #[test]
    fn test_adopt_moves_interrupted_checkpoint() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let mut state = WorkflowExecutionState::new(dir.path(), options(None));
        state.completed_actions.push(action(ActionType::Plan));
        state.begin(&action(ActionType::Implement));
        write_legacy(dir.path(), &state);

        let outcome = store.adopt_legacy().unwrap();
        assert!(matches!(outcome, MigrationOutcome::Migrated { ref story_id, .. } if story_id == "S-1"));
        assert!(!store.legacy_path().exists());
        let adopted = store.load("S-1").unwrap().unwrap();
        assert_eq!(adopted.current_action, Some(action(ActionType::Implement)));
        assert_eq!(adopted.completed_actions.len(), 1);
    }

    #[test]
    fn test_adopt_refuses_to_overwrite_story_checkpoint() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        store
            .save("S-1", &WorkflowExecutionState::new(dir.path(), options(Some("S-1"))))
            .unwrap();
        let mut state = WorkflowExecutionState::new(dir.path(), options(Some("S-1")));
        state.begin(&action(ActionType::Review));
        write_legacy(dir.path(), &state);

        let err = store.adopt_legacy().unwrap_err();
        assert!(matches!(err, CheckpointError::MigrationConflict { .. }));
        assert!(store.legacy_path().exists());
        assert!(store.load("S-1").unwrap().unwrap().current_action.is_none());
    }

    #[test]
    fn test_migrate_refuses_without_story_id() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        write_legacy(dir.path(), &WorkflowExecutionState::new(dir.path(), options(None)));

        assert!(matches!(
            store.migrate_legacy().unwrap(),
            MigrationOutcome::Skipped { .. }
        ));
        assert!(store.legacy_path().exists());
    }

    #[test]
    fn test_migrate_rejects_traversal_story_id() {
        let dir = tempdir().unwrap();
        let root = dir.path().join(".cadence");
        let store = store(&root);
        write_legacy(&root, &WorkflowExecutionState::new(&root, options(Some("../../x"))));

        let err = store.migrate_legacy().unwrap_err();
        assert!(matches!(err, CheckpointError::InvalidStoryId { .. }));
        assert!(store.legacy_path().exists());
        assert!(!dir.path().join("x").exists());
        assert!(matches!(
            store.save("../x", &WorkflowExecutionState::new(&root, Map::new())),
            Err(CheckpointError::InvalidStoryId { .. })
        ));
    }

    #[test]
    fn test_migrate_with_valid_existing_target() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let existing = WorkflowExecutionState::new(dir.path(), options(Some("S-1")));
        store.save("S-1", &existing).unwrap();
        write_legacy(dir.path(), &WorkflowExecutionState::new(dir.path(), options(Some("S-1"))));

        let outcome = store.migrate_legacy().unwrap();
        assert!(matches!(outcome, MigrationOutcome::AlreadyMigrated { .. }));
        assert!(!store.legacy_path().exists());
        assert_eq!(store.load("S-1").unwrap().unwrap(), existing);
    }

    #[test]
    fn test_migrate_with_corrupt_target_keeps_legacy() {
        let dir = tempdir().unwrap();
        let store = store(dir.path());
        let target = store.path_for("S-1");
        std::fs::create_dir_all(target.parent().unwrap()).unwrap();
        std::fs::write(&target, "{ not json").unwrap();
        write_legacy(dir.path(), &WorkflowExecutionState::new(dir.path(), options(Some("S-1"))));

        let err = store.migrate_legacy().unwrap_err();
        assert!(matches!(err, CheckpointError::MigrationConflict { .. }));
        assert!(store.legacy_path().exists());
    }
}
