//! Reverting a completed execution from its history record.
//!
//! Unlike rollback, which runs inside a failed execution from an in-memory
//! journal, a revert works from what was persisted: the plan, the backups and
//! the recorded undo state. It is best effort. A step whose target changed
//! since the migration is left alone and reported.

use super::ExecutionEngine;
use crate::backup::{move_file_atomic, remove_occupant, BackupManager};
use crate::error::{MigrationError, Result};
use crate::history::{HistoryEntry, MigrationHistory, UndoRecord};
use crate::lock::TargetLock;
use crate::model::{BackupRecord, MigrationStep, StepAction};
use crate::path::CanonicalPath;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use uuid::Uuid;

/// Outcome of reverting one recorded execution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevertReport {
    pub plan_id: Uuid,
    /// Steps undone, in the order they were undone
    pub reverted_steps: Vec<usize>,
    /// Steps left in place, with the reason
    pub warnings: Vec<String>,
    pub reverted_at: DateTime<Utc>,
}

impl RevertReport {
    pub fn is_complete(&self) -> bool {
        self.warnings.is_empty()
    }
}

impl ExecutionEngine {
    /// Undo a completed execution recorded in `entry`.
    ///
    /// Steps are undone in reverse order under the target lock. The record is
    /// marked reverted afterwards, even if some steps had to be left alone.
    ///
    /// # Errors
    ///
    /// - `NotRevertible` if the execution did not complete or was already reverted
    /// - `MigrationInProgress` if another run holds the target root
    pub fn revert(&self, entry: &HistoryEntry) -> Result<RevertReport> {
        let plan = &entry.plan;
        if entry.reverted_at.is_some() {
            return Err(MigrationError::NotRevertible(format!(
                "plan {} was already reverted",
                plan.id()
            )));
        }
        if !entry.result.is_success() {
            return Err(MigrationError::NotRevertible(format!(
                "plan {} ended as {}; its changes were already rolled back",
                plan.id(),
                entry.result.status()
            )));
        }

        let _lock = TargetLock::acquire(&self.state_dir, plan.target_root())?;
        tracing::info!("Reverting plan {} against {}", plan.id(), plan.target_root());

        let backups = BackupManager::new(&self.backup_root, plan.id());
        let mut reverted_steps = Vec::new();
        let mut warnings = Vec::new();
        for &index in entry.result.succeeded_steps.iter().rev() {
            let Some(step) = plan.steps().get(index) else {
                warnings.push(format!("step {} is not part of the recorded plan", index + 1));
                continue;
            };
            match self.revert_step(index, step, entry, &backups) {
                Ok(()) => reverted_steps.push(index),
                Err(e) => {
                    tracing::warn!("Step {} left in place: {}", index + 1, e);
                    warnings.push(format!("step {} left in place: {}", index + 1, e));
                }
            }
        }

        let reverted_at = Utc::now();
        let mut updated = entry.clone();
        updated.reverted_at = Some(reverted_at);
        if let Err(e) = MigrationHistory::new(self.backup_root.clone()).update(&updated) {
            warnings.push(format!("history not updated: {}", e));
        }

        Ok(RevertReport {
            plan_id: plan.id(),
            reverted_steps,
            warnings,
            reverted_at,
        })
    }

    fn revert_step(
        &self,
        index: usize,
        step: &MigrationStep,
        entry: &HistoryEntry,
        backups: &BackupManager,
    ) -> Result<()> {
        let target = step.target_path();
        let backup = entry.result.backups.iter().find(|b| b.step_index == index);

        match (step.action(), step.source_path()) {
            (StepAction::GrantPermission, _) => match entry.undo_for(index) {
                Some(UndoRecord::Permissions { snapshot, .. }) => self.grantor.restore(snapshot),
                _ => Err(MigrationError::permission_denied(
                    target.as_path(),
                    "no permission snapshot was recorded",
                )),
            },
            (StepAction::CreateSymlink, Some(source)) => {
                if target.links_to(source) {
                    remove_occupant(target)?;
                } else if target.is_occupied() {
                    return Err(MigrationError::target_conflict(
                        target.as_path(),
                        format!("no longer links to {}", source),
                    ));
                }
                restore_backup(backups, backup)
            }
            (StepAction::CopyFile, _) => {
                if target.is_symlink() || target.is_dir() {
                    return Err(MigrationError::target_conflict(
                        target.as_path(),
                        "copied file was replaced",
                    ));
                }
                remove_occupant(target)?;
                restore_backup(backups, backup)
            }
            (StepAction::MoveFile, Some(source)) => {
                if source.is_occupied() {
                    return Err(MigrationError::target_conflict(
                        source.as_path(),
                        "original location is occupied again",
                    ));
                }
                if !target.is_occupied() {
                    return Err(MigrationError::target_conflict(
                        target.as_path(),
                        "moved file is gone",
                    ));
                }
                move_file_atomic(target.as_path(), source.as_path())
                    .map_err(|e| MigrationError::from_io(source.as_path(), e))
            }
            (StepAction::CreateDirectory, _) => match entry.undo_for(index) {
                Some(UndoRecord::Directories { created, .. }) => {
                    created.iter().rev().try_for_each(remove_empty_dir)
                }
                // Directory already existed when the step ran
                _ => Ok(()),
            },
            (action, None) => Err(MigrationError::PathType(format!(
                "{} step has no source path",
                action
            ))),
        }
    }
}

fn restore_backup(backups: &BackupManager, record: Option<&BackupRecord>) -> Result<()> {
    let Some(record) = record else {
        return Ok(());
    };
    if backups.restore(record)? {
        Ok(())
    } else {
        Err(MigrationError::backup_failure(
            record.original_path.as_path(),
            format!("backup {} is gone", record.backup_path),
        ))
    }
}

fn remove_empty_dir(dir: &CanonicalPath) -> Result<()> {
    if dir.is_symlink() {
        return Err(MigrationError::target_conflict(
            dir.as_path(),
            "directory was replaced",
        ));
    }
    match fs::remove_dir(dir.as_path()) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::DirectoryNotEmpty => Err(
            MigrationError::target_conflict(dir.as_path(), "directory is no longer empty"),
        ),
        Err(e) => Err(MigrationError::from_io(dir.as_path(), e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::CancellationToken;
    use crate::locale::AccountLocalizer;
    use crate::model::MigrationPlan;
    use crate::path::canonicalize;
    use crate::permissions::{PermissionGrantor, PermissionSnapshot};
    use std::sync::{Arc, Mutex};

    /// Records restores so tests can see grants being undone
    #[derive(Default)]
    struct RecordingGrantor {
        restored: Mutex<Vec<PermissionSnapshot>>,
    }

    impl PermissionGrantor for RecordingGrantor {
        fn capture(&self, path: &CanonicalPath) -> Result<PermissionSnapshot> {
            Ok(PermissionSnapshot::Modes(vec![(path.as_path().to_path_buf(), 0o755)]))
        }
        fn grant(&self, _path: &CanonicalPath, _principal: &str) -> Result<()> {
            Ok(())
        }
        fn restore(&self, snapshot: &PermissionSnapshot) -> Result<()> {
            self.restored.lock().unwrap().push(snapshot.clone());
            Ok(())
        }
        fn verify(&self, _path: &CanonicalPath, _principal: &str) -> Option<bool> {
            None
        }
    }

    struct Sandbox {
        _dir: tempfile::TempDir,
        base: CanonicalPath,
        grantor: Arc<RecordingGrantor>,
        engine: ExecutionEngine,
    }

    fn sandbox() -> Sandbox {
        let dir = tempfile::tempdir().unwrap();
        let base = canonicalize(dir.path()).unwrap();
        let grantor = Arc::new(RecordingGrantor::default());
        let engine = ExecutionEngine::new(
            base.join("backups"),
            base.join("state"),
            grantor.clone(),
            AccountLocalizer::with_locale("en_US"),
        );
        Sandbox {
            _dir: dir,
            base,
            grantor,
            engine,
        }
    }

    fn history(sb: &Sandbox) -> MigrationHistory {
        MigrationHistory::new(sb.base.join("backups"))
    }

    #[test]
    fn test_revert_undoes_copy_and_directories() {
        let sb = sandbox();
        let source = sb.base.join("bios.bin");
        fs::write(&source, b"bios").unwrap();
        let out = sb.base.join("out");
        let plan = MigrationPlan::new(
            "copy",
            out.clone(),
            vec![
                MigrationStep::create_directory(out.join("bios")),
                MigrationStep::copy_file(source.clone(), out.join("bios/bios.bin")),
                MigrationStep::grant_permission(out.join("bios")),
            ],
        )
        .unwrap();

        let result = sb.engine.execute(&plan, &CancellationToken::new()).unwrap();
        assert!(result.is_success());
        let entry = history(&sb).find(plan.id()).unwrap();
        assert_eq!(entry.undo.len(), 2);

        let report = sb.engine.revert(&entry).unwrap();
        assert!(report.is_complete(), "{:?}", report.warnings);
        assert_eq!(report.reverted_steps, vec![2, 1, 0]);
        assert!(!out.is_occupied());
        assert!(source.exists());
        assert_eq!(sb.grantor.restored.lock().unwrap().len(), 1);

        let entry = history(&sb).find(plan.id()).unwrap();
        assert_eq!(entry.status(), "reverted");
        assert!(matches!(
            sb.engine.revert(&entry),
            Err(MigrationError::NotRevertible(_))
        ));
    }

    #[test]
    fn test_revert_restores_overwritten_file() {
        let sb = sandbox();
        let source = sb.base.join("new.cfg");
        let target = sb.base.join("old.cfg");
        fs::write(&source, b"new").unwrap();
        fs::write(&target, b"old").unwrap();
        let plan = MigrationPlan::new(
            "overwrite",
            sb.base.clone(),
            vec![MigrationStep::copy_file(source, target.clone())],
        )
        .unwrap();

        sb.engine.execute(&plan, &CancellationToken::new()).unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"new");

        let entry = history(&sb).find(plan.id()).unwrap();
        let report = sb.engine.revert(&entry).unwrap();
        assert!(report.is_complete(), "{:?}", report.warnings);
        assert_eq!(fs::read(&target).unwrap(), b"old");
    }

    #[test]
    fn test_revert_moves_file_back() {
        let sb = sandbox();
        let source = sb.base.join("game.srm");
        let target = sb.base.join("saves/game.srm");
        fs::write(&source, b"save").unwrap();
        let plan = MigrationPlan::new(
            "move",
            sb.base.join("saves"),
            vec![
                MigrationStep::create_directory(sb.base.join("saves")),
                MigrationStep::move_file(source.clone(), target.clone()),
            ],
        )
        .unwrap();

        sb.engine.execute(&plan, &CancellationToken::new()).unwrap();
        assert!(!source.is_occupied());

        let entry = history(&sb).find(plan.id()).unwrap();
        sb.engine.revert(&entry).unwrap();
        assert_eq!(fs::read(&source).unwrap(), b"save");
        assert!(!sb.base.join("saves").is_occupied());
    }

    #[test]
    fn test_changed_directory_is_left_in_place() {
        let sb = sandbox();
        let out = sb.base.join("out");
        let plan = MigrationPlan::new(
            "mkdir",
            out.clone(),
            vec![MigrationStep::create_directory(out.clone())],
        )
        .unwrap();
        sb.engine.execute(&plan, &CancellationToken::new()).unwrap();
        fs::write(out.join("user.txt"), b"added later").unwrap();

        let entry = history(&sb).find(plan.id()).unwrap();
        let report = sb.engine.revert(&entry).unwrap();
        assert!(!report.is_complete());
        assert!(report.reverted_steps.is_empty());
        assert!(out.join("user.txt").exists());
    }

    #[test]
    fn test_rolled_back_execution_is_not_revertible() {
        let sb = sandbox();
        let out = sb.base.join("out");
        let plan = MigrationPlan::new(
            "fail",
            out.clone(),
            vec![
                MigrationStep::create_directory(out.clone()),
                MigrationStep::copy_file(sb.base.join("missing.bin"), out.join("x.bin")),
            ],
        )
        .unwrap();
        let result = sb.engine.execute(&plan, &CancellationToken::new()).unwrap();
        assert!(result.rollback_performed);

        let entry = history(&sb).find(plan.id()).unwrap();
        assert_eq!(entry.status(), "rolled_back");
        assert!(matches!(
            sb.engine.revert(&entry),
            Err(MigrationError::NotRevertible(_))
        ));
    }
}
