//! Execution Engine
//!
//! Runs a [`MigrationPlan`] step by step against the real filesystem.
//!
//! # Guarantees
//!
//! - **Exclusive**: a [`TargetLock`] is held for the whole run; a second run
//!   against the same target root gets `MigrationInProgress` and touches nothing
//! - **Pre-flight**: free space is checked before the first mutation
//! - **Snapshot first**: every destructive step is backed up before it runs
//! - **All or nothing**: on failure or cancellation the failed step's partial
//!   effects and every executed step are unwound in reverse order
//! - **No retries**: a failed step is reported, never re-run
//!
//! Execution is single-threaded. Cancellation is cooperative and only
//! observed between steps.

mod revert;
pub mod state;
pub mod undo;

pub use revert::RevertReport;

use crate::backup::{copy_file_atomic, move_file_atomic, BackupManager};
use crate::error::{MigrationError, Result};
use crate::history::{HistoryEntry, MigrationHistory};
use crate::locale::AccountLocalizer;
use crate::lock::TargetLock;
use crate::model::{ExecutionResult, MigrationPlan, MigrationStep, StepAction, StepFailure};
use crate::path::CanonicalPath;
use crate::permissions::PermissionGrantor;
use chrono::Utc;
use state::ExecutionTracker;
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use undo::StepUndo;

/// Cooperative cancellation flag shared with a signal handler or UI.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation; the engine stops before the next step
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Free-space lookup, replaceable for tests
pub type SpaceProbe = Arc<dyn Fn(&Path) -> io::Result<u64> + Send + Sync>;

/// Runs plans with backups, locking and rollback.
pub struct ExecutionEngine {
    backup_root: CanonicalPath,
    state_dir: CanonicalPath,
    grantor: Arc<dyn PermissionGrantor>,
    localizer: AccountLocalizer,
    space_probe: SpaceProbe,
}

impl ExecutionEngine {
    pub fn new(
        backup_root: CanonicalPath,
        state_dir: CanonicalPath,
        grantor: Arc<dyn PermissionGrantor>,
        localizer: AccountLocalizer,
    ) -> Self {
        Self {
            backup_root,
            state_dir,
            grantor,
            localizer,
            space_probe: Arc::new(available_space),
        }
    }

    /// Replace the free-space lookup
    pub fn with_space_probe(mut self, probe: SpaceProbe) -> Self {
        self.space_probe = probe;
        self
    }

    /// Same engine, locking and recording under other directories
    pub fn with_locations(&self, backup_root: CanonicalPath, state_dir: CanonicalPath) -> Self {
        Self {
            backup_root,
            state_dir,
            grantor: self.grantor.clone(),
            localizer: self.localizer.clone(),
            space_probe: self.space_probe.clone(),
        }
    }

    pub fn backup_root(&self) -> &CanonicalPath {
        &self.backup_root
    }

    pub fn state_dir(&self) -> &CanonicalPath {
        &self.state_dir
    }

    /// Execute `plan`.
    ///
    /// # Errors
    ///
    /// Errors are returned only when nothing was mutated:
    /// - `MigrationInProgress` if another run holds the target root
    /// - `DiskSpaceInsufficient` if the pre-flight check fails
    ///
    /// Step failures and cancellation are reported inside the
    /// [`ExecutionResult`] after rollback.
    pub fn execute(
        &self,
        plan: &MigrationPlan,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult> {
        let _lock = TargetLock::acquire(&self.state_dir, plan.target_root())?;
        self.preflight_disk_space(plan)?;

        tracing::info!(
            "Executing plan {} ({} steps) against {}",
            plan.id(),
            plan.total_steps(),
            plan.target_root()
        );

        let backups = BackupManager::new(&self.backup_root, plan.id());
        let principal = self.localizer.everyone();
        let mut warnings: Vec<String> = principal
            .warning()
            .map(|w| w.to_string())
            .into_iter()
            .collect();

        let mut tracker = ExecutionTracker::new(plan.total_steps());
        let mut journal: Vec<StepUndo> = Vec::with_capacity(plan.total_steps());
        let mut succeeded = Vec::new();
        let mut failure = None;
        let mut cancelled = false;

        for (index, step) in plan.steps().iter().enumerate() {
            if cancel.is_cancelled() {
                tracing::warn!("Cancellation requested before step {}", index + 1);
                cancelled = true;
                break;
            }
            tracker.start_step(index)?;
            tracing::debug!("Step {}/{}: {}", index + 1, plan.total_steps(), step);

            let (undo, outcome) = self.run_step(index, step, &backups, &principal.name);
            journal.push(undo);

            match outcome {
                Ok(()) => succeeded.push(index),
                Err(e) => {
                    tracing::warn!("Step {} failed: {}", index + 1, e);
                    failure = Some(StepFailure {
                        index,
                        step: step.clone(),
                        kind: e.kind(),
                        message: e.to_string(),
                    });
                    break;
                }
            }
        }

        let backup_records = journal
            .iter()
            .filter_map(|undo| undo.backup().cloned())
            .collect();
        let undo_records = journal
            .iter()
            .enumerate()
            .filter(|(index, _)| succeeded.contains(index))
            .filter_map(|(index, undo)| undo.to_record(index))
            .collect();

        let rollback_performed = failure.is_some() || (cancelled && !journal.is_empty());
        if failure.is_some() || cancelled {
            warnings.extend(self.roll_back(&journal, &backups));
            tracker.roll_back()?;
        } else {
            tracker.complete()?;
        }
        tracing::info!("Plan {} finished: {}", plan.id(), tracker.current());

        let mut result = ExecutionResult {
            plan_id: plan.id(),
            succeeded_steps: succeeded,
            failed_step: failure,
            rollback_performed,
            cancelled,
            backups: backup_records,
            warnings,
            completed_at: Utc::now(),
        };

        let entry = HistoryEntry::new(plan.clone(), result.clone(), undo_records);
        if let Err(e) = MigrationHistory::new(self.backup_root.clone()).record(&entry) {
            tracing::warn!("Could not record history for plan {}: {}", plan.id(), e);
            result.warnings.push(format!("history not recorded: {}", e));
        }

        Ok(result)
    }

    fn run_step(
        &self,
        index: usize,
        step: &MigrationStep,
        backups: &BackupManager,
        principal: &str,
    ) -> (StepUndo, Result<()>) {
        let target = step.target_path();
        match (step.action(), step.source_path()) {
            (StepAction::CreateDirectory, _) => {
                let mut created = Vec::new();
                let outcome = create_directories(target, &mut created);
                (StepUndo::RemoveDirectories(created), outcome)
            }
            (StepAction::CreateSymlink, Some(source)) => {
                if target.links_to(source) {
                    tracing::debug!("{} already links to {}", target, source);
                    return (StepUndo::Nothing, Ok(()));
                }
                if !source.exists() {
                    return (StepUndo::Nothing, Err(missing_source(source)));
                }
                let backup = match backups.snapshot(index, step) {
                    Ok(backup) => backup,
                    Err(e) => return (StepUndo::Nothing, Err(e)),
                };
                let outcome = target.symlink_to(source);
                let undo = StepUndo::RemoveLink {
                    link: target.clone(),
                    created: outcome.is_ok(),
                    backup,
                };
                (undo, outcome)
            }
            (StepAction::MoveFile, Some(source)) => {
                if !source.is_occupied() {
                    return (StepUndo::Nothing, Err(missing_source(source)));
                }
                let backup = match backups.snapshot(index, step) {
                    Ok(backup) => backup,
                    Err(e) => return (StepUndo::Nothing, Err(e)),
                };
                let outcome = move_file_atomic(source.as_path(), target.as_path())
                    .map_err(|e| MigrationError::from_io(target.as_path(), e));
                let undo = StepUndo::MoveBack {
                    moved_to: target.clone(),
                    original: source.clone(),
                    moved: outcome.is_ok(),
                    backup,
                };
                (undo, outcome)
            }
            (StepAction::CopyFile, Some(source)) => {
                if !source.exists() {
                    return (StepUndo::Nothing, Err(missing_source(source)));
                }
                let backup = match backups.snapshot(index, step) {
                    Ok(backup) => backup,
                    Err(e) => return (StepUndo::Nothing, Err(e)),
                };
                let outcome = copy_file_atomic(source.as_path(), target.as_path())
                    .map_err(|e| MigrationError::from_io(target.as_path(), e));
                let undo = StepUndo::RemoveCopy {
                    copy: target.clone(),
                    written: outcome.is_ok(),
                    backup,
                };
                (undo, outcome)
            }
            (StepAction::GrantPermission, _) => {
                let snapshot = match self.grantor.capture(target) {
                    Ok(snapshot) => snapshot,
                    Err(e) => return (StepUndo::Nothing, Err(e)),
                };
                let outcome = self.grantor.grant(target, principal);
                (StepUndo::RestorePermissions(snapshot), outcome)
            }
            (action, None) => (
                StepUndo::Nothing,
                Err(MigrationError::PathType(format!("{} step has no source path", action))),
            ),
        }
    }

    /// Unwind `journal` in reverse; returns messages for undo steps that failed
    fn roll_back(&self, journal: &[StepUndo], backups: &BackupManager) -> Vec<String> {
        tracing::warn!("Rolling back {} step(s)", journal.len());
        let mut errors = Vec::new();
        for (index, undo) in journal.iter().enumerate().rev() {
            if let Err(e) = undo.apply(backups, self.grantor.as_ref()) {
                tracing::warn!("Rollback of step {} failed: {}", index + 1, e);
                errors.push(format!("rollback of step {} failed: {}", index + 1, e));
            }
        }
        errors
    }

    /// Compare bytes the plan will write against free space, per filesystem.
    fn preflight_disk_space(&self, plan: &MigrationPlan) -> Result<()> {
        // probe location -> bytes required there
        let mut required: BTreeMap<CanonicalPath, u64> = BTreeMap::new();
        let probe_for = |path: &CanonicalPath| path.nearest_existing().unwrap_or_else(|| path.clone());

        for step in plan.steps() {
            let payload = match (step.action(), step.source_path()) {
                (StepAction::CopyFile | StepAction::MoveFile, Some(source)) => fs::metadata(source)
                    .map(|m| if m.is_file() { m.len() } else { 0 })
                    .unwrap_or(0),
                _ => 0,
            };
            if payload > 0 {
                *required.entry(probe_for(step.target_path())).or_default() += payload;
            }
            let backup = BackupManager::bytes_needed(step);
            if backup > 0 {
                *required.entry(probe_for(&self.backup_root)).or_default() += backup;
            }
        }

        for (probe, bytes) in required {
            let available = (self.space_probe)(probe.as_path())
                .map_err(|e| MigrationError::from_io(probe.as_path(), e))?;
            tracing::debug!("{} bytes needed on {}, {} available", bytes, probe, available);
            if available < bytes {
                return Err(MigrationError::DiskSpaceInsufficient {
                    path: probe.into_path_buf(),
                    required: bytes,
                    available,
                });
            }
        }
        Ok(())
    }
}

fn available_space(path: &Path) -> io::Result<u64> {
    fs2::available_space(path)
}

/// Create `target` and any missing ancestors, recording each one created
fn create_directories(target: &CanonicalPath, created: &mut Vec<CanonicalPath>) -> Result<()> {
    if target.is_dir() {
        tracing::debug!("{} already exists", target);
        return Ok(());
    }
    if target.is_occupied() {
        return Err(MigrationError::target_conflict(
            target.as_path(),
            "path exists and is not a directory",
        ));
    }

    let mut missing = Vec::new();
    let mut current = Some(target.clone());
    while let Some(dir) = current {
        if dir.is_occupied() {
            break;
        }
        current = dir.parent();
        missing.push(dir);
    }

    for dir in missing.into_iter().rev() {
        fs::create_dir(dir.as_path()).map_err(|e| MigrationError::from_io(dir.as_path(), e))?;
        created.push(dir);
    }
    Ok(())
}

fn missing_source(source: &CanonicalPath) -> MigrationError {
    MigrationError::Io(io::Error::new(
        io::ErrorKind::NotFound,
        format!("source {} does not exist", source),
    ))
}
