//! Target-root mutual exclusion.
//!
//! Only one plan may run against a target root at a time. The lock is an
//! exclusive `flock` on `<state_dir>/locks/<uuid-v5(target root)>.lock`, held
//! for as long as the [`TargetLock`] value lives. The OS releases it when the
//! file is closed, including when the process dies.

use crate::error::{MigrationError, Result};
use crate::path::CanonicalPath;
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use uuid::Uuid;

/// Exclusive lock on one target root; released on drop.
#[derive(Debug)]
pub struct TargetLock {
    _file: File,
    path: PathBuf,
    target: CanonicalPath,
}

impl TargetLock {
    /// Path of the lock file guarding `target`
    pub fn lock_path(state_dir: &CanonicalPath, target: &CanonicalPath) -> PathBuf {
        let key = Uuid::new_v5(
            &Uuid::NAMESPACE_URL,
            target.as_path().to_string_lossy().as_bytes(),
        );
        state_dir
            .as_path()
            .join("locks")
            .join(format!("{}.lock", key))
    }

    /// Try to take the lock without blocking.
    ///
    /// # Errors
    ///
    /// - `MigrationInProgress` if another holder has it
    /// - `Io`/`PermissionDenied` if the lock file cannot be opened
    pub fn acquire(state_dir: &CanonicalPath, target: &CanonicalPath) -> Result<Self> {
        let path = Self::lock_path(state_dir, target);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| MigrationError::from_io(parent, e))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| MigrationError::from_io(&path, e))?;

        if let Err(e) = file.try_lock_exclusive() {
            if e.kind() == fs2::lock_contended_error().kind() {
                tracing::warn!("Target {} is locked by another migration", target);
                return Err(MigrationError::MigrationInProgress(
                    target.as_path().to_path_buf(),
                ));
            }
            return Err(MigrationError::from_io(&path, e));
        }

        // Holder pid for diagnostics only
        let _ = file.set_len(0);
        let _ = writeln!(file, "{}", std::process::id());

        tracing::debug!("Acquired lock {} for {}", path.display(), target);
        Ok(Self {
            _file: file,
            path,
            target: target.clone(),
        })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn target(&self) -> &CanonicalPath {
        &self.target
    }
}

impl Drop for TargetLock {
    fn drop(&mut self) {
        tracing::debug!("Released lock {} for {}", self.path.display(), self.target);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::canonicalize;

    #[test]
    fn test_second_acquire_is_refused_until_drop() {
        let dir = tempfile::tempdir().unwrap();
        let state = canonicalize(dir.path().join("state")).unwrap();
        let target = canonicalize(dir.path().join("Emulation")).unwrap();

        let first = TargetLock::acquire(&state, &target).unwrap();
        let err = TargetLock::acquire(&state, &target).unwrap_err();
        assert!(matches!(err, MigrationError::MigrationInProgress(_)));

        drop(first);
        assert!(TargetLock::acquire(&state, &target).is_ok());
    }

    #[test]
    fn test_different_targets_do_not_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let state = canonicalize(dir.path().join("state")).unwrap();
        let a = TargetLock::acquire(&state, &canonicalize(dir.path().join("a")).unwrap()).unwrap();
        let b = TargetLock::acquire(&state, &canonicalize(dir.path().join("b")).unwrap()).unwrap();
        assert_ne!(a.path(), b.path());
    }
}
