//! Migration history.
//!
//! Every execution leaves `<backup_root>/<plan_id>/execution-<timestamp>.json`
//! holding the plan, its result and what is needed to revert it later, next
//! to the backups taken for it. Re-running a plan adds a record; it never
//! replaces an earlier one. The history is those records read back, newest
//! first.

use crate::backup::write_file_atomic;
use crate::error::{MigrationError, Result};
use crate::model::{ExecutionResult, MigrationPlan};
use crate::path::CanonicalPath;
use crate::permissions::PermissionSnapshot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// File name prefix of execution records
pub const RECORD_PREFIX: &str = "execution";

/// State kept per step so a completed execution can be reverted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UndoRecord {
    /// Permissions as they were before a grant
    Permissions {
        step_index: usize,
        snapshot: PermissionSnapshot,
    },
    /// Directories a step created, outermost first
    Directories {
        step_index: usize,
        created: Vec<CanonicalPath>,
    },
}

impl UndoRecord {
    pub fn step_index(&self) -> usize {
        match self {
            Self::Permissions { step_index, .. } | Self::Directories { step_index, .. } => {
                *step_index
            }
        }
    }
}

/// One recorded execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub plan: MigrationPlan,
    pub result: ExecutionResult,
    #[serde(default)]
    pub undo: Vec<UndoRecord>,
    /// Set once the execution has been reverted
    #[serde(default)]
    pub reverted_at: Option<DateTime<Utc>>,
    /// File this entry was read from or written to
    #[serde(skip)]
    pub record_path: PathBuf,
}

impl HistoryEntry {
    pub fn new(plan: MigrationPlan, result: ExecutionResult, undo: Vec<UndoRecord>) -> Self {
        Self {
            plan,
            result,
            undo,
            reverted_at: None,
            record_path: PathBuf::new(),
        }
    }

    /// Status word, `reverted` taking precedence over the run's own status
    pub fn status(&self) -> &'static str {
        if self.reverted_at.is_some() {
            "reverted"
        } else {
            self.result.status()
        }
    }

    /// One-line description for listings
    pub fn summary_line(&self) -> String {
        format!(
            "{}  {}  {:<11}  {}/{} steps  {}",
            self.result.completed_at.format("%Y-%m-%d %H:%M:%S"),
            self.plan.id(),
            self.status(),
            self.result.succeeded_steps.len(),
            self.plan.total_steps(),
            self.plan.description()
        )
    }

    /// Undo state recorded for step `index`
    pub fn undo_for(&self, index: usize) -> Option<&UndoRecord> {
        self.undo.iter().find(|u| u.step_index() == index)
    }
}

/// Reads and writes execution records under a backup root.
#[derive(Debug, Clone)]
pub struct MigrationHistory {
    backup_root: CanonicalPath,
}

impl MigrationHistory {
    pub fn new(backup_root: CanonicalPath) -> Self {
        Self { backup_root }
    }

    /// Directory holding the records and backups of `plan_id`
    pub fn plan_dir(&self, plan_id: Uuid) -> PathBuf {
        self.backup_root.join(plan_id.to_string()).into_path_buf()
    }

    /// Write a new record for one execution; returns its path
    pub fn record(&self, entry: &HistoryEntry) -> Result<PathBuf> {
        let dir = self.plan_dir(entry.plan.id());
        let stamp = entry.result.completed_at.format("%Y%m%dT%H%M%S%.6fZ");
        let mut path = dir.join(format!("{}-{}.json", RECORD_PREFIX, stamp));
        let mut suffix = 1;
        while path.exists() {
            path = dir.join(format!("{}-{}-{}.json", RECORD_PREFIX, stamp, suffix));
            suffix += 1;
        }

        write_entry(&path, entry)?;
        tracing::debug!(
            "Recorded execution of plan {} at {}",
            entry.plan.id(),
            path.display()
        );
        Ok(path)
    }

    /// Rewrite an entry in the record it was read from
    pub fn update(&self, entry: &HistoryEntry) -> Result<()> {
        if entry.record_path.as_os_str().is_empty() {
            return Err(MigrationError::config(format!(
                "history entry for plan {} has no record file",
                entry.plan.id()
            )));
        }
        write_entry(&entry.record_path, entry)
    }

    /// All readable records, newest first.
    ///
    /// A missing backup root is an empty history. Unreadable or malformed
    /// records are skipped with a warning.
    pub fn list(&self) -> Result<Vec<HistoryEntry>> {
        let plan_dirs = match fs::read_dir(self.backup_root.as_path()) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(MigrationError::from_io(self.backup_root.as_path(), e)),
        };

        let mut history = Vec::new();
        for dir in plan_dirs.flatten() {
            history.extend(read_records(&dir.path()));
        }
        sort_newest_first(&mut history);
        Ok(history)
    }

    /// Every record of one plan, newest first
    pub fn records_for(&self, plan_id: Uuid) -> Vec<HistoryEntry> {
        let mut records = read_records(&self.plan_dir(plan_id));
        sort_newest_first(&mut records);
        records
    }

    /// Latest record of a single plan, if one exists
    pub fn find(&self, plan_id: Uuid) -> Option<HistoryEntry> {
        self.records_for(plan_id).into_iter().next()
    }
}

fn sort_newest_first(entries: &mut [HistoryEntry]) {
    entries.sort_by(|a, b| b.result.completed_at.cmp(&a.result.completed_at));
}

fn is_record_file(path: &Path) -> bool {
    path.is_file()
        && path
            .file_name()
            .map(|n| n.to_string_lossy())
            .is_some_and(|n| n.starts_with(RECORD_PREFIX) && n.ends_with(".json"))
}

/// Records in one plan directory; anything unreadable is skipped
fn read_records(dir: &Path) -> Vec<HistoryEntry> {
    let Ok(files) = fs::read_dir(dir) else {
        return Vec::new();
    };
    files
        .flatten()
        .map(|f| f.path())
        .filter(|path| is_record_file(path))
        .filter_map(|path| match read_entry(&path) {
            Ok(entry) => Some(entry),
            Err(e) => {
                tracing::warn!("Skipping history record {}: {}", path.display(), e);
                None
            }
        })
        .collect()
}

fn read_entry(path: &Path) -> Result<HistoryEntry> {
    let content = fs::read_to_string(path).map_err(|e| MigrationError::from_io(path, e))?;
    let mut entry: HistoryEntry = serde_json::from_str(&content)?;
    entry.record_path = path.to_path_buf();
    Ok(entry)
}

fn write_entry(path: &Path, entry: &HistoryEntry) -> Result<()> {
    let json = serde_json::to_vec_pretty(entry)?;
    write_file_atomic(path, &json).map_err(|e| MigrationError::from_io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MigrationStep;
    use crate::path::canonicalize;
    use chrono::Duration;

    fn plan(root: &CanonicalPath) -> MigrationPlan {
        MigrationPlan::new(
            "test",
            root.clone(),
            vec![MigrationStep::create_directory(root.join("roms"))],
        )
        .unwrap()
    }

    fn entry_for(plan: &MigrationPlan, age_minutes: i64) -> HistoryEntry {
        let result = ExecutionResult {
            plan_id: plan.id(),
            succeeded_steps: vec![0],
            failed_step: None,
            rollback_performed: false,
            cancelled: false,
            backups: vec![],
            warnings: vec![],
            completed_at: Utc::now() - Duration::minutes(age_minutes),
        };
        HistoryEntry::new(
            plan.clone(),
            result,
            vec![UndoRecord::Directories {
                step_index: 0,
                created: vec![plan.target_root().join("roms")],
            }],
        )
    }

    #[test]
    fn test_record_and_list_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let root = canonicalize(dir.path()).unwrap();
        let history = MigrationHistory::new(root.join("backups"));

        let old = entry_for(&plan(&root), 30);
        let new = entry_for(&plan(&root), 1);
        history.record(&old).unwrap();
        history.record(&new).unwrap();

        let listed = history.list().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].plan.id(), new.plan.id());
        assert_eq!(listed[1].plan.id(), old.plan.id());
        assert!(listed[0].summary_line().contains("completed"));

        let found = history.find(old.plan.id()).unwrap();
        assert_eq!(found.result, old.result);
        assert_eq!(found.undo, old.undo);
        assert!(found.record_path.starts_with(history.plan_dir(old.plan.id())));
    }

    #[test]
    fn test_rerunning_a_plan_keeps_every_record() {
        let dir = tempfile::tempdir().unwrap();
        let root = canonicalize(dir.path()).unwrap();
        let history = MigrationHistory::new(root.join("backups"));
        let plan = plan(&root);

        let first = entry_for(&plan, 10);
        let second = entry_for(&plan, 0);
        let first_path = history.record(&first).unwrap();
        let second_path = history.record(&second).unwrap();
        assert_ne!(first_path, second_path);

        // Same timestamp twice still yields two files
        let third_path = history.record(&second).unwrap();
        assert_ne!(third_path, second_path);

        let records = history.records_for(plan.id());
        assert_eq!(records.len(), 3);
        assert_eq!(records[2].result, first.result);
        assert_eq!(history.find(plan.id()).unwrap().result, second.result);
    }

    #[test]
    fn test_update_marks_reverted_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let root = canonicalize(dir.path()).unwrap();
        let history = MigrationHistory::new(root.join("backups"));
        let plan = plan(&root);
        history.record(&entry_for(&plan, 0)).unwrap();

        let mut entry = history.find(plan.id()).unwrap();
        entry.reverted_at = Some(Utc::now());
        history.update(&entry).unwrap();

        let records = history.records_for(plan.id());
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status(), "reverted");
        assert!(records[0].summary_line().contains("reverted"));

        let detached = entry_for(&plan, 0);
        assert!(history.update(&detached).is_err());
    }

    #[test]
    fn test_missing_root_is_empty_history() {
        let dir = tempfile::tempdir().unwrap();
        let history = MigrationHistory::new(canonicalize(dir.path().join("none")).unwrap());
        assert!(history.list().unwrap().is_empty());
        assert!(history.find(Uuid::new_v4()).is_none());
    }

    #[test]
    fn test_malformed_record_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let root = canonicalize(dir.path()).unwrap();
        let broken = root.join(Uuid::new_v4().to_string());
        fs::create_dir_all(&broken).unwrap();
        fs::write(broken.join("execution-broken.json"), b"{ not json").unwrap();
        fs::write(broken.join("0-notes.txt"), b"backup, not a record").unwrap();

        let history = MigrationHistory::new(root);
        assert!(history.list().unwrap().is_empty());
    }
}
