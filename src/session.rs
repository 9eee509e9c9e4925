//! Migration session.
//!
//! Owns one instance of every collaborator and exposes the workflow the
//! presentation layer drives: scan, plan, run (elevating if needed),
//! validate. Nothing here is global; a session is built from explicit parts
//! or from a [`MigrationConfig`].

use crate::config::MigrationConfig;
use crate::elevation::{
    ConsentPrompt, ElevationOutcome, HandoffResult, PlanHandoff, PrivilegeElevator, Relauncher,
};
use crate::engine::{CancellationToken, ExecutionEngine, RevertReport};
use crate::error::{MigrationError, Result};
use crate::history::{HistoryEntry, MigrationHistory};
use crate::locale::AccountLocalizer;
use crate::model::{ExecutionResult, LegacyInstallation, MigrationPlan};
use crate::path::CanonicalPath;
use crate::permissions::{platform_grantor, PermissionGrantor};
use crate::planner::{MigrationPlanner, TransferMode, WritableScope};
use crate::scanner::{EmulatorPattern, LegacyScanner, ScanReport};
use crate::validation::{ValidationResult, ValidationService};
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

/// Every collaborator a session needs
pub struct SessionParts {
    pub scanner: LegacyScanner,
    pub planner: MigrationPlanner,
    pub elevator: PrivilegeElevator,
    pub engine: ExecutionEngine,
    pub validator: ValidationService,
    pub search_roots: Vec<CanonicalPath>,
    pub patterns: Vec<EmulatorPattern>,
    pub target_root: CanonicalPath,
}

/// How a plan run ended
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Executed in this process
    Executed(ExecutionResult),
    /// Executed by an elevated child process
    ExecutedElevated {
        exit_code: Option<i32>,
        result: Option<ExecutionResult>,
    },
    /// Elevation was refused; nothing ran
    Denied { reason: String },
}

impl RunOutcome {
    /// Execution result, wherever it ran
    pub fn result(&self) -> Option<&ExecutionResult> {
        match self {
            Self::Executed(result) => Some(result),
            Self::ExecutedElevated { result, .. } => result.as_ref(),
            Self::Denied { .. } => None,
        }
    }
}

/// One migration workflow.
pub struct MigrationSession {
    scanner: LegacyScanner,
    planner: MigrationPlanner,
    elevator: PrivilegeElevator,
    engine: ExecutionEngine,
    validator: ValidationService,
    history: MigrationHistory,
    search_roots: Vec<CanonicalPath>,
    patterns: Vec<EmulatorPattern>,
    target_root: CanonicalPath,
}

impl MigrationSession {
    pub fn new(parts: SessionParts) -> Self {
        let history = MigrationHistory::new(parts.engine.backup_root().clone());
        Self {
            scanner: parts.scanner,
            planner: parts.planner,
            elevator: parts.elevator,
            engine: parts.engine,
            validator: parts.validator,
            history,
            search_roots: parts.search_roots,
            patterns: parts.patterns,
            target_root: parts.target_root,
        }
    }

    /// Build every collaborator from `config`.
    ///
    /// `prompt` and `relauncher` are the presentation layer's; the rest is
    /// derived from configuration and the host platform.
    pub fn from_config(
        config: &MigrationConfig,
        prompt: Arc<dyn ConsentPrompt>,
        relauncher: Box<dyn Relauncher>,
    ) -> anyhow::Result<Self> {
        config.validate()?;

        let state_dir = config.state_dir()?;
        let backup_root = config.backup_root()?;
        let localizer = match &config.locale {
            Some(locale) => AccountLocalizer::with_locale(locale.clone()),
            None => AccountLocalizer::system(),
        };
        let principal = localizer.everyone();
        let grantor: Arc<dyn PermissionGrantor> =
            Arc::from(platform_grantor(state_dir.join("acl").into_path_buf()));

        let parts = SessionParts {
            scanner: LegacyScanner::new(config.scan_options()),
            planner: MigrationPlanner::new(
                WritableScope::for_current_process(&config.writable_roots()?),
                config.planner_options(),
            ),
            elevator: PrivilegeElevator::new(state_dir.clone(), backup_root.clone(), prompt, relauncher)
                .with_consent_timeout(config.consent_timeout()),
            engine: ExecutionEngine::new(
                backup_root,
                state_dir,
                grantor.clone(),
                localizer,
            ),
            validator: ValidationService::new(grantor, principal.name),
            search_roots: config.search_roots()?,
            patterns: config.emulators.clone(),
            target_root: config.target_root()?,
        };
        Ok(Self::new(parts))
    }

    /// Mark this process as the elevated relaunch
    pub fn mark_elevated_relaunch(mut self) -> Self {
        self.elevator = self.elevator.with_relaunch_marker(true);
        self
    }

    pub fn target_root(&self) -> &CanonicalPath {
        &self.target_root
    }

    /// Scan the configured search roots
    pub fn scan(&self) -> Result<ScanReport> {
        self.scanner.scan(&self.search_roots, &self.patterns)
    }

    /// Plan `installation` into the configured target root
    pub fn plan(&self, installation: &LegacyInstallation) -> Result<MigrationPlan> {
        self.planner.plan(installation, &self.target_root)
    }

    /// Plan a single user-specified transfer
    pub fn plan_transfer(
        &self,
        source: &CanonicalPath,
        target: &CanonicalPath,
        mode: TransferMode,
    ) -> Result<MigrationPlan> {
        self.planner.plan_transfer(source, target, mode)
    }

    /// Run `plan` here, or through an elevated relaunch if it needs one.
    ///
    /// # Errors
    ///
    /// Refusals before the first step (`MigrationInProgress`,
    /// `DiskSpaceInsufficient`) are errors wherever the plan ran; a refusal in
    /// the elevated child comes back as [`MigrationError::Reported`].
    pub fn run(&mut self, plan: &MigrationPlan, cancel: &CancellationToken) -> Result<RunOutcome> {
        if self.elevator.can_run_here(plan) {
            return self.engine.execute(plan, cancel).map(RunOutcome::Executed);
        }

        let reason = format!(
            "{} of {} step(s) need administrator rights",
            plan.steps().iter().filter(|s| s.requires_elevation()).count(),
            plan.total_steps()
        );
        match self.elevator.request_elevation(plan, &reason)? {
            ElevationOutcome::NotNeeded => self.engine.execute(plan, cancel).map(RunOutcome::Executed),
            ElevationOutcome::Granted {
                result: Some(HandoffResult::Refused { kind, message }),
                ..
            } => Err(MigrationError::Reported { kind, message }),
            ElevationOutcome::Granted { exit_code, result } => Ok(RunOutcome::ExecutedElevated {
                exit_code,
                result: result.and_then(|r| match r {
                    HandoffResult::Executed { result } => Some(result),
                    HandoffResult::Refused { .. } => None,
                }),
            }),
            ElevationOutcome::Denied { reason } => Ok(RunOutcome::Denied { reason }),
        }
    }

    /// Execute the plan in `handoff_path` (elevated side of a relaunch).
    ///
    /// Runs against the parent's state and backup directories. The outcome,
    /// including a refusal to start, is written next to the handoff for the
    /// waiting parent.
    pub fn resume(&self, handoff_path: &Path, cancel: &CancellationToken) -> Result<ExecutionResult> {
        let handoff = PlanHandoff::consume(handoff_path)?;
        let engine = self
            .engine
            .with_locations(handoff.backup_root.clone(), handoff.state_dir.clone());

        match engine.execute(&handoff.plan, cancel) {
            Ok(result) => {
                PlanHandoff::write_result(
                    handoff_path,
                    &HandoffResult::Executed {
                        result: result.clone(),
                    },
                )?;
                Ok(result)
            }
            Err(e) => {
                tracing::warn!("Plan {} refused: {}", handoff.plan.id(), e);
                if let Err(write_err) =
                    PlanHandoff::write_result(handoff_path, &HandoffResult::refused(&e))
                {
                    tracing::warn!("Could not report refusal to the parent: {}", write_err);
                }
                Err(e)
            }
        }
    }

    /// Check every step of `plan` against the filesystem
    pub fn validate(&self, plan: &MigrationPlan) -> ValidationResult {
        self.validator.validate(plan)
    }

    /// Check the steps `result` reports as done
    pub fn validate_completed(&self, plan: &MigrationPlan, result: &ExecutionResult) -> ValidationResult {
        self.validator.validate_completed(plan, result)
    }

    /// Past executions, newest first
    pub fn history(&self) -> Result<Vec<HistoryEntry>> {
        self.history.list()
    }

    /// Latest recorded execution of `plan_id`
    pub fn status(&self, plan_id: Uuid) -> Option<HistoryEntry> {
        self.history.find(plan_id)
    }

    /// Undo the latest completed execution of `plan_id`.
    ///
    /// Runs in this process; restoring permissions on protected paths needs
    /// an administrator shell.
    pub fn rollback(&self, plan_id: Uuid) -> Result<RevertReport> {
        let entry = self.history.find(plan_id).ok_or_else(|| {
            MigrationError::NotRevertible(format!("no execution of plan {} is recorded", plan_id))
        })?;
        self.engine.revert(&entry)
    }
}
