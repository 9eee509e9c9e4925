//! Shared data model
//!
//! Types that flow between the scanner, planner, execution engine and the
//! elevated relaunch. Everything here is serializable: plans travel across the
//! elevation boundary as JSON and results are recorded in migration history.
//!
//! # Invariants
//!
//! - `MigrationStep` constructors enforce which actions carry a source path
//! - `MigrationPlan` is immutable once built: there is no `&mut` access to its
//!   steps and `requires_elevation` is always derived from them, including
//!   after deserialization

use crate::error::{ErrorKind, MigrationError, Result};
use crate::path::CanonicalPath;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use strum::{Display, EnumIter, EnumString, IntoEnumIterator};
use uuid::Uuid;

// ============================================================================
// Legacy installations
// ============================================================================

/// A detected pre-existing emulator/ROM tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyInstallation {
    /// Stable id: UUID v5 of the root path
    pub id: Uuid,
    /// Human-readable name (matched families joined)
    pub display_name: String,
    /// Directory that contained the matched footprint
    pub root_path: CanonicalPath,
    /// Emulator families whose patterns matched here
    pub families: Vec<String>,
    pub detected_config_files: Vec<CanonicalPath>,
    pub detected_rom_dirs: Vec<CanonicalPath>,
    pub detected_save_dirs: Vec<CanonicalPath>,
    pub detected_config_dirs: Vec<CanonicalPath>,
    pub discovered_at: DateTime<Utc>,
}

impl LegacyInstallation {
    /// Stable installation id for a root path
    pub fn id_for(root: &CanonicalPath) -> Uuid {
        Uuid::new_v5(&Uuid::NAMESPACE_URL, root.as_path().to_string_lossy().as_bytes())
    }

    /// Directories to migrate in planning order: ROMs, saves, configs
    pub fn migratable_dirs(&self) -> impl Iterator<Item = &CanonicalPath> {
        self.detected_rom_dirs
            .iter()
            .chain(self.detected_save_dirs.iter())
            .chain(self.detected_config_dirs.iter())
    }
}

// ============================================================================
// Steps
// ============================================================================

/// Kind of filesystem mutation a step performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StepAction {
    CreateDirectory,
    CreateSymlink,
    MoveFile,
    CopyFile,
    GrantPermission,
}

impl StepAction {
    /// True if the action needs a source path
    pub const fn needs_source(self) -> bool {
        matches!(self, Self::CreateSymlink | Self::MoveFile | Self::CopyFile)
    }

    /// True if the action can overwrite or remove existing data
    pub const fn is_destructive(self) -> bool {
        matches!(self, Self::CreateSymlink | Self::MoveFile | Self::CopyFile)
    }

    /// Baseline duration estimate per action, in seconds
    pub const fn estimated_seconds(self) -> f64 {
        match self {
            Self::CreateDirectory => 0.4,
            Self::CreateSymlink => 0.6,
            Self::MoveFile => 0.8,
            Self::CopyFile => 1.0,
            Self::GrantPermission => 0.5,
        }
    }
}

/// One atomic filesystem mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "StepRecord")]
pub struct MigrationStep {
    action: StepAction,
    source_path: Option<CanonicalPath>,
    target_path: CanonicalPath,
    requires_elevation: bool,
    description: String,
}

/// Unchecked wire form of a step
#[derive(Deserialize)]
struct StepRecord {
    action: StepAction,
    source_path: Option<CanonicalPath>,
    target_path: CanonicalPath,
    #[serde(default)]
    requires_elevation: bool,
    #[serde(default)]
    description: String,
}

impl TryFrom<StepRecord> for MigrationStep {
    type Error = String;

    fn try_from(record: StepRecord) -> std::result::Result<Self, Self::Error> {
        match (record.action.needs_source(), &record.source_path) {
            (true, None) => return Err(format!("{} step requires a source path", record.action)),
            (false, Some(_)) => {
                return Err(format!("{} step must not carry a source path", record.action));
            }
            _ => {}
        }
        let mut step = Self::build(record.action, record.source_path, record.target_path);
        step.requires_elevation = record.requires_elevation;
        if !record.description.is_empty() {
            step.description = record.description;
        }
        Ok(step)
    }
}

impl MigrationStep {
    fn build(
        action: StepAction,
        source_path: Option<CanonicalPath>,
        target_path: CanonicalPath,
    ) -> Self {
        let description = match &source_path {
            Some(source) => format!("{} {} -> {}", action, source, target_path),
            None => format!("{} {}", action, target_path),
        };
        Self {
            action,
            source_path,
            target_path,
            requires_elevation: false,
            description,
        }
    }

    /// Create `target` (and missing parents)
    pub fn create_directory(target: CanonicalPath) -> Self {
        Self::build(StepAction::CreateDirectory, None, target)
    }

    /// Create a symlink at `target` pointing at `source`
    pub fn create_symlink(source: CanonicalPath, target: CanonicalPath) -> Self {
        Self::build(StepAction::CreateSymlink, Some(source), target)
    }

    /// Move the file at `source` to `target`
    pub fn move_file(source: CanonicalPath, target: CanonicalPath) -> Self {
        Self::build(StepAction::MoveFile, Some(source), target)
    }

    /// Copy the file at `source` to `target`
    pub fn copy_file(source: CanonicalPath, target: CanonicalPath) -> Self {
        Self::build(StepAction::CopyFile, Some(source), target)
    }

    /// Grant read/write on `target` to the localized "everyone" principal
    pub fn grant_permission(target: CanonicalPath) -> Self {
        Self::build(StepAction::GrantPermission, None, target)
    }

    /// Mark whether this step needs elevated rights
    pub fn with_elevation(mut self, requires_elevation: bool) -> Self {
        self.requires_elevation = requires_elevation;
        self
    }

    pub fn action(&self) -> StepAction {
        self.action
    }

    pub fn source_path(&self) -> Option<&CanonicalPath> {
        self.source_path.as_ref()
    }

    pub fn target_path(&self) -> &CanonicalPath {
        &self.target_path
    }

    pub fn requires_elevation(&self) -> bool {
        self.requires_elevation
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}

impl fmt::Display for MigrationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description)?;
        if self.requires_elevation {
            write!(f, " [elevated]")?;
        }
        Ok(())
    }
}

// ============================================================================
// Plans
// ============================================================================

/// Ordered, immutable sequence of steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "PlanRecord")]
pub struct MigrationPlan {
    id: Uuid,
    description: String,
    target_root: CanonicalPath,
    steps: Vec<MigrationStep>,
    total_steps: usize,
    requires_elevation: bool,
    created_at: DateTime<Utc>,
}

/// Unchecked wire form of a plan
#[derive(Deserialize)]
struct PlanRecord {
    id: Uuid,
    description: String,
    target_root: CanonicalPath,
    steps: Vec<MigrationStep>,
    created_at: DateTime<Utc>,
}

impl TryFrom<PlanRecord> for MigrationPlan {
    type Error = MigrationError;

    fn try_from(record: PlanRecord) -> Result<Self> {
        let mut plan = Self::new(record.description, record.target_root, record.steps)?;
        plan.id = record.id;
        plan.created_at = record.created_at;
        Ok(plan)
    }
}

/// Step counts per action
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PlanStatistics {
    pub total_steps: usize,
    pub create_directory: usize,
    pub create_symlink: usize,
    pub move_file: usize,
    pub copy_file: usize,
    pub grant_permission: usize,
    pub destructive: usize,
    pub elevated: usize,
}

impl PlanStatistics {
    /// Count for a single action
    pub fn count(&self, action: StepAction) -> usize {
        match action {
            StepAction::CreateDirectory => self.create_directory,
            StepAction::CreateSymlink => self.create_symlink,
            StepAction::MoveFile => self.move_file,
            StepAction::CopyFile => self.copy_file,
            StepAction::GrantPermission => self.grant_permission,
        }
    }
}

/// Risk classification of a plan by size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    /// `low` below 50 steps, `medium` below 200, `high` otherwise
    pub const fn for_step_count(steps: usize) -> Self {
        if steps < 50 {
            Self::Low
        } else if steps < 200 {
            Self::Medium
        } else {
            Self::High
        }
    }
}

/// Dry-run view of a plan
#[derive(Debug, Clone, Serialize)]
pub struct PlanPreview {
    pub plan_id: Uuid,
    pub description: String,
    pub total_steps: usize,
    pub risk_level: RiskLevel,
    pub estimated_seconds: f64,
    pub requires_elevation: bool,
    pub changes: Vec<String>,
    pub warnings: Vec<String>,
}

impl MigrationPlan {
    /// Build a plan from ordered steps.
    ///
    /// # Errors
    ///
    /// Returns `EmptyPlan` if `steps` is empty.
    pub(crate) fn new(
        description: impl Into<String>,
        target_root: CanonicalPath,
        steps: Vec<MigrationStep>,
    ) -> Result<Self> {
        let description = description.into();
        if steps.is_empty() {
            return Err(MigrationError::EmptyPlan(description));
        }
        let requires_elevation = steps.iter().any(MigrationStep::requires_elevation);
        Ok(Self {
            id: Uuid::new_v4(),
            description,
            target_root,
            total_steps: steps.len(),
            steps,
            requires_elevation,
            created_at: Utc::now(),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Root of the layout this plan builds; the unit of mutual exclusion
    pub fn target_root(&self) -> &CanonicalPath {
        &self.target_root
    }

    pub fn steps(&self) -> &[MigrationStep] {
        &self.steps
    }

    pub fn total_steps(&self) -> usize {
        self.total_steps
    }

    /// True if any step needs elevated rights
    pub fn requires_elevation(&self) -> bool {
        self.requires_elevation
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Count steps per action
    pub fn statistics(&self) -> PlanStatistics {
        let mut stats = PlanStatistics {
            total_steps: self.total_steps,
            ..Default::default()
        };
        for step in &self.steps {
            match step.action() {
                StepAction::CreateDirectory => stats.create_directory += 1,
                StepAction::CreateSymlink => stats.create_symlink += 1,
                StepAction::MoveFile => stats.move_file += 1,
                StepAction::CopyFile => stats.copy_file += 1,
                StepAction::GrantPermission => stats.grant_permission += 1,
            }
            if step.action().is_destructive() {
                stats.destructive += 1;
            }
            if step.requires_elevation() {
                stats.elevated += 1;
            }
        }
        stats
    }

    /// Rough wall-clock estimate from per-action baselines
    pub fn estimate_duration(&self) -> Duration {
        let stats = self.statistics();
        let seconds: f64 = StepAction::iter()
            .map(|action| stats.count(action) as f64 * action.estimated_seconds())
            .sum();
        Duration::from_secs_f64(seconds)
    }

    /// Dry-run preview: risk level, changes, and elevation warnings
    pub fn preview(&self) -> PlanPreview {
        let changes = self
            .steps
            .iter()
            .enumerate()
            .map(|(i, step)| format!("{}. {}", i + 1, step))
            .collect();

        let mut warnings: Vec<String> = self
            .steps
            .iter()
            .enumerate()
            .filter(|(_, step)| step.requires_elevation())
            .map(|(i, step)| {
                format!("Step {} needs elevated rights: {}", i + 1, step.description())
            })
            .collect();
        if self.statistics().destructive > 0 {
            warnings.push(
                "Existing data at link or copy targets will be backed up before replacement"
                    .to_string(),
            );
        }

        PlanPreview {
            plan_id: self.id,
            description: self.description.clone(),
            total_steps: self.total_steps,
            risk_level: RiskLevel::for_step_count(self.total_steps),
            estimated_seconds: self.estimate_duration().as_secs_f64(),
            requires_elevation: self.requires_elevation,
            changes,
            warnings,
        }
    }

    /// Human-readable listing for logs and terminal output
    pub fn summary(&self) -> String {
        let stats = self.statistics();
        let mut lines = vec![
            format!("Migration Plan {}", self.id),
            format!("  {}", self.description),
            format!("  Target: {}", self.target_root),
            format!("  Requires elevation: {}", self.requires_elevation),
            format!(
                "  Estimated duration: {:.1}s",
                self.estimate_duration().as_secs_f64()
            ),
            format!(
                "  Steps ({}): {} mkdir, {} symlink, {} move, {} copy, {} grant",
                stats.total_steps,
                stats.create_directory,
                stats.create_symlink,
                stats.move_file,
                stats.copy_file,
                stats.grant_permission
            ),
        ];
        for (i, step) in self.steps.iter().enumerate() {
            lines.push(format!("    {}. {}", i + 1, step));
        }
        lines.join("\n")
    }
}

// ============================================================================
// Execution outcome
// ============================================================================

/// How a backup holds the original data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BackupKind {
    /// A copy; the original stays in place while the step runs
    Copied,
    /// The original itself was renamed into the backup root
    Relocated,
}

/// Snapshot taken before a destructive step
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub step_index: usize,
    pub original_path: CanonicalPath,
    pub backup_path: CanonicalPath,
    pub kind: BackupKind,
    pub taken_at: DateTime<Utc>,
}

/// The step that stopped a plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepFailure {
    pub index: usize,
    pub step: MigrationStep,
    pub kind: ErrorKind,
    pub message: String,
}

/// Outcome of running a plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub plan_id: Uuid,
    /// Indices of steps that ran to completion (unwound again if rolled back)
    pub succeeded_steps: Vec<usize>,
    pub failed_step: Option<StepFailure>,
    pub rollback_performed: bool,
    pub cancelled: bool,
    pub backups: Vec<BackupRecord>,
    /// Non-fatal issues (unmapped locale, rollback steps that could not be undone)
    pub warnings: Vec<String>,
    pub completed_at: DateTime<Utc>,
}

impl ExecutionResult {
    /// True if every step ran and nothing was rolled back
    pub fn is_success(&self) -> bool {
        self.failed_step.is_none() && !self.cancelled && !self.rollback_performed
    }

    /// Short status word for history listings
    pub fn status(&self) -> &'static str {
        if self.cancelled {
            "cancelled"
        } else if self.failed_step.is_some() {
            "rolled_back"
        } else {
            "completed"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::canonicalize;

    fn p(raw: &str) -> CanonicalPath {
        canonicalize(raw).unwrap()
    }

    fn sample_plan() -> MigrationPlan {
        MigrationPlan::new(
            "sample",
            p("/srv/emulation"),
            vec![
                MigrationStep::create_directory(p("/srv/emulation")).with_elevation(true),
                MigrationStep::create_directory(p("/srv/emulation/roms")),
                MigrationStep::create_symlink(p("/opt/RetroArch/roms"), p("/srv/emulation/roms")),
                MigrationStep::grant_permission(p("/srv/emulation/roms")),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_empty_plan_is_rejected() {
        let err = MigrationPlan::new("nothing", p("/srv"), vec![]).unwrap_err();
        assert!(matches!(err, MigrationError::EmptyPlan(_)));
    }

    #[test]
    fn test_requires_elevation_is_derived() {
        let plan = sample_plan();
        assert!(plan.requires_elevation());
        assert_eq!(plan.total_steps(), 4);
    }

    #[test]
    fn test_statistics_and_estimate() {
        let plan = sample_plan();
        let stats = plan.statistics();
        assert_eq!(stats.create_directory, 2);
        assert_eq!(stats.create_symlink, 1);
        assert_eq!(stats.grant_permission, 1);
        assert_eq!(stats.destructive, 1);
        assert_eq!(stats.elevated, 1);

        // 2 * 0.4 + 0.6 + 0.5
        let secs = plan.estimate_duration().as_secs_f64();
        assert!((secs - 1.9).abs() < 1e-9);
    }

    #[test]
    fn test_preview_risk_and_warnings() {
        let preview = sample_plan().preview();
        assert_eq!(preview.risk_level, RiskLevel::Low);
        assert_eq!(preview.changes.len(), 4);
        assert!(preview.warnings.iter().any(|w| w.contains("Step 1")));

        assert_eq!(RiskLevel::for_step_count(49), RiskLevel::Low);
        assert_eq!(RiskLevel::for_step_count(50), RiskLevel::Medium);
        assert_eq!(RiskLevel::for_step_count(200), RiskLevel::High);
    }

    #[test]
    fn test_summary_lists_steps() {
        let summary = sample_plan().summary();
        assert!(summary.contains("Target: /srv/emulation"));
        assert!(summary.contains("3. create_symlink /opt/RetroArch/roms -> /srv/emulation/roms"));
    }

    #[test]
    fn test_plan_json_recomputes_elevation() {
        let plan = sample_plan();
        let mut value = serde_json::to_value(&plan).unwrap();
        value["requires_elevation"] = serde_json::Value::Bool(false);

        let restored: MigrationPlan = serde_json::from_value(value).unwrap();
        assert_eq!(restored.id(), plan.id());
        assert!(restored.requires_elevation());
        assert_eq!(restored, plan);
    }

    #[test]
    fn test_step_json_enforces_source_rule() {
        let json = r#"{"action":"create_symlink","source_path":null,"target_path":"/srv/x"}"#;
        assert!(serde_json::from_str::<MigrationStep>(json).is_err());

        let json = r#"{"action":"create_directory","source_path":"/a","target_path":"/srv/x"}"#;
        assert!(serde_json::from_str::<MigrationStep>(json).is_err());
    }

    #[test]
    fn test_installation_id_is_stable() {
        let root = p("/opt/RetroArch");
        assert_eq!(LegacyInstallation::id_for(&root), LegacyInstallation::id_for(&root));
        assert_ne!(
            LegacyInstallation::id_for(&root),
            LegacyInstallation::id_for(&p("/opt/Other"))
        );
    }
}
