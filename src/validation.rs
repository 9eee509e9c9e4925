//! Validation Service
//!
//! Re-checks the filesystem against what a plan says should now be true.
//! Issues make a result invalid; warnings never do.

use crate::model::{ExecutionResult, MigrationPlan, MigrationStep, StepAction};
use crate::permissions::PermissionGrantor;
use serde::Serialize;
use std::fs;
use std::sync::Arc;

/// A step whose expected outcome is not on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationIssue {
    pub step_index: usize,
    pub message: String,
}

/// Outcome of a validation pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ValidationResult {
    pub checked_steps: usize,
    pub issues: Vec<ValidationIssue>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Post-execution checks.
pub struct ValidationService {
    grantor: Arc<dyn PermissionGrantor>,
    principal: String,
}

impl ValidationService {
    /// `principal` is the localized name grants were made to
    pub fn new(grantor: Arc<dyn PermissionGrantor>, principal: impl Into<String>) -> Self {
        Self {
            grantor,
            principal: principal.into(),
        }
    }

    /// Check every step of `plan`
    pub fn validate(&self, plan: &MigrationPlan) -> ValidationResult {
        self.check(plan, (0..plan.total_steps()).collect())
    }

    /// Check only the steps that `result` reports as succeeded
    pub fn validate_completed(&self, plan: &MigrationPlan, result: &ExecutionResult) -> ValidationResult {
        let mut indices = result.succeeded_steps.clone();
        if result.rollback_performed {
            // Rolled-back steps are expected to be undone, not present
            return ValidationResult {
                checked_steps: 0,
                issues: Vec::new(),
                warnings: vec![format!(
                    "plan {} was rolled back; nothing to validate",
                    plan.id()
                )],
            };
        }
        indices.retain(|&i| i < plan.total_steps());
        self.check(plan, indices)
    }

    fn check(&self, plan: &MigrationPlan, indices: Vec<usize>) -> ValidationResult {
        let mut result = ValidationResult::default();
        for index in indices {
            let step = &plan.steps()[index];
            result.checked_steps += 1;
            match self.check_step(step) {
                Check::Ok => {}
                Check::Issue(message) => {
                    tracing::warn!("Validation issue at step {}: {}", index + 1, message);
                    result.issues.push(ValidationIssue {
                        step_index: index,
                        message,
                    });
                }
                Check::Warning(message) => result
                    .warnings
                    .push(format!("step {}: {}", index + 1, message)),
            }
        }
        tracing::info!(
            "Validated {} step(s): {} issue(s), {} warning(s)",
            result.checked_steps,
            result.issues.len(),
            result.warnings.len()
        );
        result
    }

    fn check_step(&self, step: &MigrationStep) -> Check {
        let target = step.target_path();
        match (step.action(), step.source_path()) {
            (StepAction::CreateDirectory, _) => {
                if target.is_dir() {
                    Check::Ok
                } else {
                    Check::Issue(format!("{} is not a directory", target))
                }
            }
            (StepAction::CreateSymlink, Some(source)) => {
                if !target.is_symlink() {
                    Check::Issue(format!("{} is not a symlink", target))
                } else if !target.links_to(source) {
                    Check::Issue(format!("{} does not point to {}", target, source))
                } else if !target.exists() {
                    Check::Issue(format!("{} points to {}, which is missing", target, source))
                } else {
                    Check::Ok
                }
            }
            (StepAction::MoveFile, Some(source)) => {
                if !target.exists() {
                    Check::Issue(format!("{} is missing", target))
                } else if source.is_occupied() {
                    Check::Issue(format!("{} still exists after move", source))
                } else {
                    Check::Ok
                }
            }
            (StepAction::CopyFile, Some(source)) => {
                match (fs::metadata(source), fs::metadata(target)) {
                    (_, Err(_)) => Check::Issue(format!("{} is missing", target)),
                    (Err(_), Ok(_)) => {
                        Check::Warning(format!("source {} is gone; size not compared", source))
                    }
                    (Ok(src), Ok(dst)) if src.len() != dst.len() => Check::Issue(format!(
                        "{} has {} bytes, expected {}",
                        target,
                        dst.len(),
                        src.len()
                    )),
                    _ => Check::Ok,
                }
            }
            (StepAction::GrantPermission, _) => {
                match self.grantor.verify(target, &self.principal) {
                    Some(true) => Check::Ok,
                    Some(false) => Check::Issue(format!(
                        "{} is not writable by '{}'",
                        target, self.principal
                    )),
                    None => Check::Warning(format!(
                        "permissions on {} could not be verified without elevation",
                        target
                    )),
                }
            }
            (action, None) => Check::Issue(format!("{} step has no source path", action)),
        }
    }
}

enum Check {
    Ok,
    Issue(String),
    Warning(String),
}
