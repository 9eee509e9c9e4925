//! Per-step undo records.
//!
//! Each executed step leaves a [`StepUndo`] describing exactly what it changed,
//! including the partial effects of a step that failed halfway. Rollback
//! replays these in reverse order.

use crate::backup::{move_file_atomic, remove_occupant, BackupManager};
use crate::error::{MigrationError, Result};
use crate::history::UndoRecord;
use crate::model::{BackupKind, BackupRecord};
use crate::path::CanonicalPath;
use crate::permissions::{PermissionGrantor, PermissionSnapshot};
use std::fs;
use std::io;

/// What one step changed, and how to put it back
#[derive(Debug, Clone)]
pub enum StepUndo {
    /// The step changed nothing (no-op or refused before acting)
    Nothing,
    /// Directories created by the step, outermost first
    RemoveDirectories(Vec<CanonicalPath>),
    /// A symlink the step created, plus whatever it displaced
    RemoveLink {
        link: CanonicalPath,
        created: bool,
        backup: Option<BackupRecord>,
    },
    /// A file the step moved from `original` to `moved_to`
    MoveBack {
        moved_to: CanonicalPath,
        original: CanonicalPath,
        moved: bool,
        backup: Option<BackupRecord>,
    },
    /// A file the step wrote, plus the previous content if any
    RemoveCopy {
        copy: CanonicalPath,
        written: bool,
        backup: Option<BackupRecord>,
    },
    /// Permissions captured before a grant
    RestorePermissions(PermissionSnapshot),
}

impl StepUndo {
    /// Backup taken for this step, if any
    pub fn backup(&self) -> Option<&BackupRecord> {
        match self {
            Self::RemoveLink { backup, .. }
            | Self::MoveBack { backup, .. }
            | Self::RemoveCopy { backup, .. } => backup.as_ref(),
            _ => None,
        }
    }

    /// State worth keeping in the history record for a later revert
    pub fn to_record(&self, step_index: usize) -> Option<UndoRecord> {
        match self {
            Self::RestorePermissions(snapshot) => Some(UndoRecord::Permissions {
                step_index,
                snapshot: snapshot.clone(),
            }),
            Self::RemoveDirectories(created) if !created.is_empty() => {
                Some(UndoRecord::Directories {
                    step_index,
                    created: created.clone(),
                })
            }
            _ => None,
        }
    }

    /// Reverse this step's effects.
    pub fn apply(&self, backups: &BackupManager, grantor: &dyn PermissionGrantor) -> Result<()> {
        match self {
            Self::Nothing => Ok(()),
            Self::RemoveDirectories(created) => {
                for dir in created.iter().rev() {
                    match fs::remove_dir(dir.as_path()) {
                        Ok(()) => {}
                        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                        Err(e) => return Err(MigrationError::from_io(dir.as_path(), e)),
                    }
                }
                Ok(())
            }
            Self::RemoveLink {
                link,
                created,
                backup,
            } => {
                if *created {
                    remove_occupant(link)?;
                }
                // A relocated placeholder is gone even if the link never appeared
                if let Some(record) = backup {
                    if *created || record.kind == BackupKind::Relocated {
                        backups.restore(record)?;
                    }
                }
                Ok(())
            }
            Self::MoveBack {
                moved_to,
                original,
                moved,
                backup,
            } => {
                if !*moved {
                    return Ok(());
                }
                match move_file_atomic(moved_to.as_path(), original.as_path()) {
                    Ok(()) => Ok(()),
                    Err(e) => {
                        let Some(record) = backup else {
                            return Err(MigrationError::from_io(original.as_path(), e));
                        };
                        tracing::warn!(
                            "Could not move {} back ({}), restoring from backup",
                            moved_to,
                            e
                        );
                        backups.restore(record)?;
                        remove_occupant(moved_to)
                    }
                }
            }
            Self::RemoveCopy {
                copy,
                written,
                backup,
            } => {
                if *written {
                    remove_occupant(copy)?;
                }
                // A relocated link is gone even if the copy never landed
                if let Some(record) = backup {
                    if *written || record.kind == BackupKind::Relocated {
                        backups.restore(record)?;
                    }
                }
                Ok(())
            }
            Self::RestorePermissions(snapshot) => grantor.restore(snapshot),
        }
    }
}
