//! Backup Manager
//!
//! Takes a snapshot of anything a step is about to overwrite or remove,
//! *before* the step runs, and restores snapshots during rollback.
//!
//! | Step            | Target state              | Snapshot |
//! |-----------------|---------------------------|----------|
//! | MoveFile        | target absent             | copy of the source |
//! | MoveFile        | target occupied           | refused (`TargetConflict`) |
//! | CopyFile        | target is a file          | copy of the target |
//! | CopyFile        | target is a symlink       | link renamed into the backup root |
//! | CreateSymlink   | symlink or empty dir      | original renamed into the backup root |
//! | CreateSymlink   | non-empty dir or file     | refused (`BackupFailure`) |
//! | anything else   |                           | none |
//!
//! Backups live in `<backup_root>/<plan_id>/<step_index>-<file name>`; a
//! numeric suffix keeps every backup path unique.

use crate::error::{MigrationError, Result};
use crate::model::{BackupKind, BackupRecord, MigrationStep, StepAction};
use crate::path::CanonicalPath;
use chrono::Utc;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;
use uuid::Uuid;

/// Snapshots and restores data touched by one plan.
#[derive(Debug, Clone)]
pub struct BackupManager {
    plan_dir: CanonicalPath,
}

impl BackupManager {
    /// Backups for `plan_id` are written below `backup_root/<plan_id>`
    pub fn new(backup_root: &CanonicalPath, plan_id: Uuid) -> Self {
        Self {
            plan_dir: backup_root.join(plan_id.to_string()),
        }
    }

    /// Directory holding this plan's backups and history record
    pub fn plan_dir(&self) -> &CanonicalPath {
        &self.plan_dir
    }

    /// Snapshot whatever `step` would overwrite or remove.
    ///
    /// Returns `Ok(None)` when the step destroys nothing.
    ///
    /// # Errors
    ///
    /// - `TargetConflict` if a move would land on an existing path
    /// - `BackupFailure` if the snapshot cannot be taken or the target holds
    ///   data that must never be replaced
    pub fn snapshot(&self, step_index: usize, step: &MigrationStep) -> Result<Option<BackupRecord>> {
        let target = step.target_path();
        match step.action() {
            StepAction::MoveFile => {
                if target.is_occupied() {
                    return Err(MigrationError::target_conflict(
                        target.as_path(),
                        "move target already exists",
                    ));
                }
                match step.source_path() {
                    Some(source) if source.is_occupied() => self
                        .take(step_index, source, BackupKind::Copied)
                        .map(Some),
                    _ => Ok(None),
                }
            }
            StepAction::CopyFile => {
                if !target.is_occupied() {
                    return Ok(None);
                }
                // The copy renames over the link, so the link itself is kept
                if target.is_symlink() {
                    return self
                        .take(step_index, target, BackupKind::Relocated)
                        .map(Some);
                }
                if target.is_dir() {
                    return Err(MigrationError::backup_failure(
                        target.as_path(),
                        "copy target is a directory",
                    ));
                }
                self.take(step_index, target, BackupKind::Copied).map(Some)
            }
            StepAction::CreateSymlink => {
                if !target.is_occupied() {
                    return Ok(None);
                }
                if let Some(source) = step.source_path() {
                    if target.links_to(source) {
                        return Ok(None);
                    }
                }
                if target.is_symlink() || is_empty_dir(target) {
                    return self
                        .take(step_index, target, BackupKind::Relocated)
                        .map(Some);
                }
                Err(MigrationError::backup_failure(
                    target.as_path(),
                    "refusing to replace existing data with a symlink",
                ))
            }
            StepAction::CreateDirectory | StepAction::GrantPermission => Ok(None),
        }
    }

    fn take(
        &self,
        step_index: usize,
        original: &CanonicalPath,
        kind: BackupKind,
    ) -> Result<BackupRecord> {
        let fail = |e: io::Error| MigrationError::backup_failure(original.as_path(), e.to_string());

        fs::create_dir_all(&self.plan_dir).map_err(fail)?;
        let backup_path = self.unique_backup_path(step_index, original);

        let written = match kind {
            BackupKind::Copied => copy_file_atomic(original.as_path(), backup_path.as_path()),
            BackupKind::Relocated => relocate(original.as_path(), backup_path.as_path()),
        };
        written.map_err(fail)?;

        tracing::debug!("Backed up {} to {} ({})", original, backup_path, kind);
        Ok(BackupRecord {
            step_index,
            original_path: original.clone(),
            backup_path,
            kind,
            taken_at: Utc::now(),
        })
    }

    fn unique_backup_path(&self, step_index: usize, original: &CanonicalPath) -> CanonicalPath {
        let name = original
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "root".to_string());
        let base = format!("{}-{}", step_index, name);

        let mut candidate = self.plan_dir.join(&base);
        let mut suffix = 1;
        while candidate.is_occupied() {
            candidate = self.plan_dir.join(format!("{}.{}", base, suffix));
            suffix += 1;
        }
        candidate
    }

    /// Put one snapshot back at its original path.
    ///
    /// Whatever occupies the original path is removed first (a symlink, a file
    /// or an empty directory; anything else is an error). Returns `Ok(false)`
    /// if the backup no longer exists.
    pub fn restore(&self, record: &BackupRecord) -> Result<bool> {
        if !record.backup_path.is_occupied() {
            tracing::warn!("Backup {} is gone, cannot restore", record.backup_path);
            return Ok(false);
        }

        remove_occupant(&record.original_path)?;
        relocate(record.backup_path.as_path(), record.original_path.as_path())
            .map_err(|e| MigrationError::from_io(record.original_path.as_path(), e))?;

        tracing::debug!("Restored {} from {}", record.original_path, record.backup_path);
        Ok(true)
    }

    /// Extra bytes the snapshot of `step` will need in the backup root
    pub fn bytes_needed(step: &MigrationStep) -> u64 {
        match step.action() {
            StepAction::MoveFile => step.source_path().map(file_size).unwrap_or(0),
            StepAction::CopyFile if !step.target_path().is_symlink() => {
                file_size(step.target_path())
            }
            _ => 0,
        }
    }
}

fn file_size(path: &CanonicalPath) -> u64 {
    fs::symlink_metadata(path.as_path())
        .map(|m| if m.is_file() { m.len() } else { 0 })
        .unwrap_or(0)
}

fn is_empty_dir(path: &CanonicalPath) -> bool {
    !path.is_symlink()
        && fs::read_dir(path.as_path())
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(false)
}

/// Remove a symlink, file or empty directory at `path`; absent is fine
pub(crate) fn remove_occupant(path: &CanonicalPath) -> Result<()> {
    let meta = match fs::symlink_metadata(path.as_path()) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(MigrationError::from_io(path.as_path(), e)),
    };
    let removed = if meta.is_dir() {
        fs::remove_dir(path.as_path())
    } else {
        fs::remove_file(path.as_path())
    };
    removed.map_err(|e| MigrationError::from_io(path.as_path(), e))
}

// ============================================================================
// File primitives
// ============================================================================

/// Copy `src` to `dst` through a temporary file in the destination directory,
/// so `dst` is either absent/old or complete.
pub(crate) fn copy_file_atomic(src: &Path, dst: &Path) -> io::Result<()> {
    let file_name = dst
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = dst.with_file_name(format!(".{}.{}.tmp", file_name, Uuid::new_v4().simple()));

    let result = fs::copy(src, &tmp)
        .and_then(|_| File::open(&tmp)?.sync_all())
        .and_then(|_| fs::rename(&tmp, dst));
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

/// Write `bytes` to `dst` through a temporary file and rename
pub(crate) fn write_file_atomic(dst: &Path, bytes: &[u8]) -> io::Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    let file_name = dst
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = dst.with_file_name(format!(".{}.{}.tmp", file_name, Uuid::new_v4().simple()));

    let result = File::create(&tmp)
        .and_then(|mut file| {
            file.write_all(bytes)?;
            file.sync_all()
        })
        .and_then(|_| fs::rename(&tmp, dst));
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

/// Move a file, falling back to copy+fsync+delete across filesystems.
pub(crate) fn move_file_atomic(src: &Path, dst: &Path) -> io::Result<()> {
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::CrossesDevices => {
            tracing::debug!(
                "Cross-filesystem move ({} -> {}), using copy fallback",
                src.display(),
                dst.display()
            );
            copy_file_atomic(src, dst)?;
            if let Some(parent) = dst.parent() {
                // Not every filesystem supports fsync on a directory
                if let Ok(dir) = File::open(parent) {
                    let _ = dir.sync_all();
                }
            }
            fs::remove_file(src)
        }
        Err(e) => Err(e),
    }
}

/// Move a file, symlink or empty directory from `src` to `dst`
pub(crate) fn relocate(src: &Path, dst: &Path) -> io::Result<()> {
    let meta = fs::symlink_metadata(src)?;
    if meta.file_type().is_symlink() {
        match fs::rename(src, dst) {
            Err(e) if e.kind() == io::ErrorKind::CrossesDevices => {
                let target = fs::read_link(src)?;
                recreate_symlink(&target, dst)?;
                fs::remove_file(src)
            }
            other => other,
        }
    } else if meta.is_dir() {
        match fs::rename(src, dst) {
            Err(e) if e.kind() == io::ErrorKind::CrossesDevices => {
                fs::create_dir(dst)?;
                fs::remove_dir(src)
            }
            other => other,
        }
    } else {
        move_file_atomic(src, dst)
    }
}

fn recreate_symlink(target: &Path, link: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        std::os::unix::fs::symlink(target, link)
    }
    #[cfg(windows)]
    {
        if target.is_dir() {
            std::os::windows::fs::symlink_dir(target, link)
        } else {
            std::os::windows::fs::symlink_file(target, link)
        }
    }
}
