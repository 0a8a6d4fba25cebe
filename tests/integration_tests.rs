//! Integration tests for the cadence CLI.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn cadence() -> Command {
    cargo_bin_cmd!("cadence")
}

/// Project with `.cadence/stories/<id>/story.md` for each `(id, status)`.
fn project_with_stories(stories: &[(&str, &str)]) -> TempDir {
    let dir = TempDir::new().unwrap();
    for (id, status) in stories {
        let story_dir = dir.path().join(".cadence/stories").join(id);
        fs::create_dir_all(&story_dir).unwrap();
        fs::write(
            story_dir.join("story.md"),
            format!(
                "---\nid: {}\ntitle: Story {}\nstatus: {}\n---\n# Story {}\n",
                id, id, status, id
            ),
        )
        .unwrap();
    }
    dir
}

fn read_story(dir: &Path, id: &str) -> String {
    fs::read_to_string(dir.join(".cadence/stories").join(id).join("story.md")).unwrap()
}

mod cli_basics {
    use super::*;

    #[test]
    fn test_help() {
        cadence()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("parallel"))
            .stdout(predicate::str::contains("conflicts"));
    }

    #[test]
    fn test_version() {
        cadence()
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("cadence"));
    }

    #[test]
    fn test_unknown_subcommand_fails() {
        cadence().arg("frobnicate").assert().failure();
    }
}

mod status {
    use super::*;

    #[test]
    fn test_status_without_stories() {
        let dir = TempDir::new().unwrap();
        cadence()
            .current_dir(dir.path())
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("No stories found"));
    }

    #[test]
    fn test_status_counts_by_status() {
        let dir = project_with_stories(&[("S-1", "backlog"), ("S-2", "done"), ("S-3", "done")]);
        cadence()
            .current_dir(dir.path())
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("S-1"))
            .stdout(predicate::str::contains("3 stories: 1 backlog, 0 ready"))
            .stdout(predicate::str::contains("2 done"));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let dir = project_with_stories(&[]);
        fs::create_dir_all(dir.path().join(".cadence")).unwrap();
        fs::write(
            dir.path().join(".cadence/cadence.toml"),
            "[orchestrator]\nconcurrency = 0\n",
        )
        .unwrap();
        cadence()
            .current_dir(dir.path())
            .arg("status")
            .assert()
            .failure()
            .stderr(predicate::str::contains("concurrency"));
    }
}

mod run {
    use super::*;

    #[test]
    fn test_dry_run_lists_actions_without_executing() {
        let dir = project_with_stories(&[("S-1", "backlog"), ("S-2", "done")]);
        cadence()
            .current_dir(dir.path())
            .args(["run", "--dry-run"])
            .assert()
            .success()
            .stdout(predicate::str::contains("refine S-1"))
            .stdout(predicate::str::contains("S-2").not());

        assert!(read_story(dir.path(), "S-1").contains("status: backlog"));
    }

    #[test]
    fn test_dry_run_with_nothing_to_do() {
        let dir = project_with_stories(&[("S-1", "done")]);
        cadence()
            .current_dir(dir.path())
            .args(["run", "--dry-run"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Nothing to do"));
    }

    #[test]
    fn test_dry_run_unknown_story_fails() {
        let dir = project_with_stories(&[("S-1", "backlog")]);
        cadence()
            .current_dir(dir.path())
            .args(["run", "--dry-run", "--story", "S-404"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("S-404"));
    }

    #[cfg(unix)]
    #[test]
    fn test_single_action_runs_phase_command() {
        use std::os::unix::fs::PermissionsExt;

        let dir = project_with_stories(&[("S-1", "backlog")]);
        let script = dir.path().join("agent.sh");
        fs::write(
            &script,
            "#!/bin/sh\ncat > /dev/null\necho \"$1 $CADENCE_STORY_ID\" >> calls.log\necho '{\"success\":true,\"changesMade\":[\"refined\"]}'\n",
        )
        .unwrap();
        let mut perms = fs::metadata(&script).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&script, perms).unwrap();

        cadence()
            .current_dir(dir.path())
            .env("CADENCE_PHASE_CMD", &script)
            .arg("run")
            .assert()
            .success()
            .stdout(predicate::str::contains("refine S-1"))
            .stdout(predicate::str::contains("use --auto"));

        assert!(read_story(dir.path(), "S-1").contains("status: ready"));
        let calls = fs::read_to_string(dir.path().join("calls.log")).unwrap();
        assert_eq!(calls.trim(), "refine S-1");
        assert!(
            !dir.path()
                .join(".cadence/stories/S-1/.workflow-state.json")
                .exists()
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_failing_phase_command_exits_nonzero() {
        let dir = project_with_stories(&[("S-1", "backlog")]);
        cadence()
            .current_dir(dir.path())
            .env("CADENCE_PHASE_CMD", "false")
            .arg("run")
            .assert()
            .failure()
            .stderr(predicate::str::contains("S-1"));
    }
}

mod migrate {
    use super::*;

    #[test]
    fn test_migrate_without_legacy_state() {
        let dir = TempDir::new().unwrap();
        cadence()
            .current_dir(dir.path())
            .arg("migrate")
            .assert()
            .success()
            .stdout(predicate::str::contains("No legacy checkpoint"));
    }

    #[test]
    fn test_migrate_moves_checkpoint_to_story() {
        let dir = project_with_stories(&[("S-1", "in-progress")]);
        let legacy = dir.path().join(".cadence/.workflow-state.json");
        fs::write(
            &legacy,
            r#"{
  "version": "1.0",
  "workflowId": "wf-1",
  "timestamp": "2026-01-01T00:00:00Z",
  "currentAction": null,
  "completedActions": [],
  "context": { "sdlcRoot": ".cadence", "options": { "story": "S-1" } }
}"#,
        )
        .unwrap();

        cadence()
            .current_dir(dir.path())
            .arg("migrate")
            .assert()
            .success()
            .stdout(predicate::str::contains("Migrated checkpoint for S-1"));

        assert!(!legacy.exists());
        assert!(
            dir.path()
                .join(".cadence/stories/S-1/.workflow-state.json")
                .exists()
        );
    }

    #[test]
    fn test_corrupted_legacy_checkpoint_is_reported() {
        let dir = project_with_stories(&[]);
        fs::create_dir_all(dir.path().join(".cadence")).unwrap();
        fs::write(dir.path().join(".cadence/.workflow-state.json"), "{\"version\": \"1.").unwrap();

        cadence()
            .current_dir(dir.path())
            .arg("migrate")
            .assert()
            .failure()
            .stderr(predicate::str::contains("corrupted"));
    }
}

mod parallel {
    use super::*;

    #[test]
    fn test_zero_concurrency_is_rejected() {
        let dir = project_with_stories(&[("S-1", "ready")]);
        cadence()
            .current_dir(dir.path())
            .args(["parallel", "--concurrency", "0"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("concurrency"));
    }

    #[test]
    fn test_nothing_to_run() {
        let dir = project_with_stories(&[("S-1", "done")]);
        cadence()
            .current_dir(dir.path())
            .arg("parallel")
            .assert()
            .success()
            .stdout(predicate::str::contains("No stories with work left"));
    }
}
