//! Plan handoff across the elevation boundary.
//!
//! The unelevated parent serializes the plan to
//! `<state_dir>/handoff/<plan_id>.json`; the elevated child consumes
//! (reads and deletes) it, executes, and writes `<plan_id>.result.json` next
//! to it for the parent to pick up.
//!
//! The handoff also carries the parent's state and backup directories. An
//! elevated child may resolve a different home directory, and it must lock,
//! back up and record history in the same places as the parent.

use crate::backup::write_file_atomic;
use crate::error::{ErrorKind, MigrationError, Result};
use crate::model::{ExecutionResult, MigrationPlan};
use crate::path::CanonicalPath;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Version written into every handoff file
pub const HANDOFF_FORMAT_VERSION: u32 = 2;

/// Everything the elevated process needs to run a plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanHandoff {
    pub format_version: u32,
    pub plan: MigrationPlan,
    pub reason: String,
    /// Parent's state directory (locks, handoffs)
    pub state_dir: CanonicalPath,
    /// Parent's backup root (backups, history)
    pub backup_root: CanonicalPath,
    pub created_at: DateTime<Utc>,
}

/// What the elevated child reports back
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum HandoffResult {
    /// The plan ran; `result` says how it ended
    Executed { result: ExecutionResult },
    /// The child refused to start the plan (lock held, disk space, ...)
    Refused { kind: ErrorKind, message: String },
}

impl HandoffResult {
    pub fn refused(err: &MigrationError) -> Self {
        Self::Refused {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

impl PlanHandoff {
    pub fn new(
        plan: MigrationPlan,
        reason: impl Into<String>,
        state_dir: CanonicalPath,
        backup_root: CanonicalPath,
    ) -> Self {
        Self {
            format_version: HANDOFF_FORMAT_VERSION,
            plan,
            reason: reason.into(),
            state_dir,
            backup_root,
            created_at: Utc::now(),
        }
    }

    /// Where the handoff for `plan_id` lives
    pub fn path_for(state_dir: &CanonicalPath, plan_id: Uuid) -> PathBuf {
        state_dir
            .as_path()
            .join("handoff")
            .join(format!("{}.json", plan_id))
    }

    /// Result file written by the elevated process for `handoff_path`
    pub fn result_path(handoff_path: &Path) -> PathBuf {
        handoff_path.with_extension("result.json")
    }

    /// Write the handoff atomically under its own state directory
    pub fn write(&self) -> Result<PathBuf> {
        let path = Self::path_for(&self.state_dir, self.plan.id());
        let json = serde_json::to_vec_pretty(self)?;
        write_file_atomic(&path, &json).map_err(|e| MigrationError::from_io(&path, e))?;
        tracing::debug!("Wrote plan handoff {}", path.display());
        Ok(path)
    }

    /// Read and delete a handoff.
    ///
    /// # Errors
    ///
    /// - `Handoff` if the file is missing, malformed, or of another version
    pub fn consume(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            MigrationError::handoff(format!("cannot read {}: {}", path.display(), e))
        })?;
        let handoff: Self = serde_json::from_str(&content).map_err(|e| {
            MigrationError::handoff(format!("malformed handoff {}: {}", path.display(), e))
        })?;
        if handoff.format_version != HANDOFF_FORMAT_VERSION {
            return Err(MigrationError::handoff(format!(
                "unsupported handoff version {} (expected {})",
                handoff.format_version, HANDOFF_FORMAT_VERSION
            )));
        }
        fs::remove_file(path).map_err(|e| MigrationError::from_io(path, e))?;
        tracing::info!(
            "Consumed handoff for plan {} ({})",
            handoff.plan.id(),
            handoff.reason
        );
        Ok(handoff)
    }

    /// Write the elevated run's outcome next to the handoff
    pub fn write_result(handoff_path: &Path, result: &HandoffResult) -> Result<PathBuf> {
        let path = Self::result_path(handoff_path);
        let json = serde_json::to_vec_pretty(result)?;
        write_file_atomic(&path, &json).map_err(|e| MigrationError::from_io(&path, e))?;
        Ok(path)
    }

    /// Read and delete the result for `handoff_path`, if the child wrote one
    pub fn take_result(handoff_path: &Path) -> Result<Option<HandoffResult>> {
        let path = Self::result_path(handoff_path);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(MigrationError::from_io(&path, e)),
        };
        let result = serde_json::from_str(&content)?;
        if let Err(e) = fs::remove_file(&path) {
            tracing::warn!("Could not remove {}: {}", path.display(), e);
        }
        Ok(Some(result))
    }

    /// Remove an unconsumed handoff; a missing file is fine
    pub fn discard(path: &Path) -> Result<()> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(MigrationError::from_io(path, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MigrationStep;
    use crate::path::canonicalize;

    fn plan(root: &CanonicalPath) -> MigrationPlan {
        MigrationPlan::new(
            "handoff test",
            root.join("Emulation"),
            vec![MigrationStep::create_directory(root.join("Emulation")).with_elevation(true)],
        )
        .unwrap()
    }

    #[test]
    fn test_write_then_consume_deletes_file() {
        let dir = tempfile::tempdir().unwrap();
        let state = canonicalize(dir.path()).unwrap();
        let plan = plan(&state);

        let path = PlanHandoff::new(
            plan.clone(),
            "symlinks need admin",
            state.clone(),
            state.join("backups"),
        )
        .write()
        .unwrap();
        assert!(path.ends_with(format!("handoff/{}.json", plan.id())));

        let handoff = PlanHandoff::consume(&path).unwrap();
        assert_eq!(handoff.plan, plan);
        assert_eq!(handoff.reason, "symlinks need admin");
        assert_eq!(handoff.state_dir, state);
        assert_eq!(handoff.backup_root, state.join("backups"));
        assert!(!path.exists());
        assert!(matches!(
            PlanHandoff::consume(&path),
            Err(MigrationError::Handoff(_))
        ));
    }

    #[test]
    fn test_unknown_version_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let state = canonicalize(dir.path()).unwrap();
        let mut handoff = PlanHandoff::new(plan(&state), "test", state.clone(), state.clone());
        handoff.format_version = 1;
        let path = handoff.write().unwrap();

        let err = PlanHandoff::consume(&path).unwrap_err();
        assert!(err.to_string().contains("unsupported handoff version 1"));
        assert!(path.exists());
    }

    #[test]
    fn test_result_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let state = canonicalize(dir.path()).unwrap();
        let plan = plan(&state);
        let path = PlanHandoff::path_for(&state, plan.id());
        assert!(PlanHandoff::take_result(&path).unwrap().is_none());

        let result = ExecutionResult {
            plan_id: plan.id(),
            succeeded_steps: vec![0],
            failed_step: None,
            rollback_performed: false,
            cancelled: false,
            backups: vec![],
            warnings: vec![],
            completed_at: Utc::now(),
        };
        let executed = HandoffResult::Executed { result };
        let written = PlanHandoff::write_result(&path, &executed).unwrap();
        assert_eq!(
            written.file_name().unwrap().to_string_lossy(),
            format!("{}.result.json", plan.id())
        );

        assert_eq!(PlanHandoff::take_result(&path).unwrap(), Some(executed));
        assert!(!written.exists());
    }

    #[test]
    fn test_refusal_keeps_kind_and_message() {
        let dir = tempfile::tempdir().unwrap();
        let state = canonicalize(dir.path()).unwrap();
        let path = PlanHandoff::path_for(&state, Uuid::new_v4());

        let err = MigrationError::DiskSpaceInsufficient {
            path: PathBuf::from("/srv/emulation"),
            required: 4096,
            available: 10,
        };
        PlanHandoff::write_result(&path, &HandoffResult::refused(&err)).unwrap();

        let content = fs::read_to_string(PlanHandoff::result_path(&path)).unwrap();
        assert!(content.contains("\"outcome\": \"refused\""));
        assert_eq!(
            PlanHandoff::take_result(&path).unwrap(),
            Some(HandoffResult::Refused {
                kind: ErrorKind::DiskSpaceInsufficient,
                message: err.to_string(),
            })
        );
    }
}
