//! Privilege Elevator
//!
//! Elevation is a process boundary, not an in-process flag: a plan that
//! needs administrator rights is serialized to a handoff file, the user is
//! asked for consent, and an elevated copy of the binary runs `resume`
//! against that file. The parent then reads back the child's result.
//!
//! A relaunched process carries [`ELEVATION_MARKER_ENV`]; if it still is not
//! elevated it reports `Denied` instead of prompting again.

pub mod handoff;
pub mod relaunch;
pub mod state;

pub use handoff::{HandoffResult, PlanHandoff, HANDOFF_FORMAT_VERSION};
pub use relaunch::{
    ask_with_timeout, CommandRelauncher, ConsentPrompt, ConsentRequest, FixedConsent,
    RelaunchCommand, Relauncher, StdinConsentPrompt, ELEVATION_MARKER_ENV,
};
pub use state::{ElevationState, ElevationTracker, ElevationTransitionError};

use crate::error::Result;
use crate::model::MigrationPlan;
use crate::path::CanonicalPath;
use std::sync::Arc;
use std::time::Duration;

/// Result of asking for elevation
#[derive(Debug, Clone, PartialEq)]
pub enum ElevationOutcome {
    /// Plan can run in this process
    NotNeeded,
    /// The elevated child ran; `result` is what it reported, if anything
    Granted {
        exit_code: Option<i32>,
        result: Option<HandoffResult>,
    },
    /// Nothing ran
    Denied { reason: String },
}

/// Whether the current process has administrator rights
pub fn is_elevated() -> bool {
    #[cfg(unix)]
    {
        nix::unistd::geteuid().is_root()
    }
    #[cfg(windows)]
    {
        // `net session` only succeeds for administrators
        std::process::Command::new("net")
            .arg("session")
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }
}

/// True if this process was started by a previous elevation attempt
pub fn relaunch_marker_present() -> bool {
    std::env::var(ELEVATION_MARKER_ENV).is_ok_and(|v| v == "1")
}

/// Drives consent, handoff and relaunch for plans that need elevation.
pub struct PrivilegeElevator {
    state_dir: CanonicalPath,
    backup_root: CanonicalPath,
    prompt: Arc<dyn ConsentPrompt>,
    relauncher: Box<dyn Relauncher>,
    consent_timeout: Option<Duration>,
    elevation_check: fn() -> bool,
    already_attempted: bool,
    last_state: ElevationState,
}

impl PrivilegeElevator {
    /// `state_dir` and `backup_root` are handed to the elevated child so it
    /// locks and records in the same places as this process.
    pub fn new(
        state_dir: CanonicalPath,
        backup_root: CanonicalPath,
        prompt: Arc<dyn ConsentPrompt>,
        relauncher: Box<dyn Relauncher>,
    ) -> Self {
        Self {
            state_dir,
            backup_root,
            prompt,
            relauncher,
            consent_timeout: None,
            elevation_check: is_elevated,
            already_attempted: relaunch_marker_present(),
            last_state: ElevationState::Unknown,
        }
    }

    /// Treat no answer within `timeout` as a decline
    pub fn with_consent_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.consent_timeout = timeout;
        self
    }

    /// Replace the administrator check
    pub fn with_elevation_check(mut self, check: fn() -> bool) -> Self {
        self.elevation_check = check;
        self
    }

    /// Mark this process as an elevation relaunch (`--elevated-relaunch`)
    pub fn with_relaunch_marker(mut self, attempted: bool) -> Self {
        self.already_attempted = self.already_attempted || attempted;
        self
    }

    /// Final state of the most recent request
    pub fn last_state(&self) -> ElevationState {
        self.last_state
    }

    /// Whether `plan` can run here without a relaunch
    pub fn can_run_here(&self, plan: &MigrationPlan) -> bool {
        !plan.requires_elevation() || (self.elevation_check)()
    }

    /// Obtain the rights `plan` needs.
    ///
    /// Declines, timeouts and relaunches that never picked up the plan are
    /// `Denied`; only I/O on the handoff file is an error.
    pub fn request_elevation(
        &mut self,
        plan: &MigrationPlan,
        reason: &str,
    ) -> Result<ElevationOutcome> {
        let mut tracker = ElevationTracker::new();
        let outcome = self.drive(&mut tracker, plan, reason);
        self.last_state = tracker.current();
        outcome
    }

    fn drive(
        &self,
        tracker: &mut ElevationTracker,
        plan: &MigrationPlan,
        reason: &str,
    ) -> Result<ElevationOutcome> {
        let is_admin = (self.elevation_check)();
        tracker.transition_to(ElevationState::Checked { is_admin })?;

        if !plan.requires_elevation() || is_admin {
            tracker.transition_to(ElevationState::NotNeeded)?;
            return Ok(ElevationOutcome::NotNeeded);
        }

        if self.already_attempted {
            tracing::warn!("Still not elevated after a relaunch; not prompting again");
            tracker.transition_to(ElevationState::Denied)?;
            return Ok(denied("elevation already attempted"));
        }

        tracker.transition_to(ElevationState::Requested)?;
        let handoff_path = PlanHandoff::new(
            plan.clone(),
            reason,
            self.state_dir.clone(),
            self.backup_root.clone(),
        )
        .write()?;

        let request = ConsentRequest {
            plan_id: plan.id(),
            description: plan.description().to_string(),
            reason: reason.to_string(),
            elevated_steps: plan
                .steps()
                .iter()
                .filter(|s| s.requires_elevation())
                .count(),
        };
        if !ask_with_timeout(self.prompt.clone(), &request, self.consent_timeout) {
            PlanHandoff::discard(&handoff_path)?;
            tracker.transition_to(ElevationState::Denied)?;
            return Ok(denied("user declined elevation"));
        }

        let exit_code = match self.relauncher.relaunch(&handoff_path) {
            Ok(code) => code,
            Err(e) => {
                PlanHandoff::discard(&handoff_path)?;
                tracker.transition_to(ElevationState::Denied)?;
                return Ok(denied(&e.to_string()));
            }
        };

        if handoff_path.exists() {
            PlanHandoff::discard(&handoff_path)?;
            tracker.transition_to(ElevationState::Denied)?;
            return Ok(denied(&format!(
                "elevated process did not pick up the plan (exit code {:?})",
                exit_code
            )));
        }

        let result = PlanHandoff::take_result(&handoff_path)?;
        tracker.transition_to(ElevationState::Granted)?;
        tracing::info!(
            "Elevated run of plan {} finished (exit code {:?})",
            plan.id(),
            exit_code
        );
        Ok(ElevationOutcome::Granted { exit_code, result })
    }
}

fn denied(reason: &str) -> ElevationOutcome {
    tracing::warn!("Elevation denied: {}", reason);
    ElevationOutcome::Denied {
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MigrationStep;
    use crate::path::canonicalize;
    use crate::model::ExecutionResult;
    use chrono::Utc;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn never() -> bool {
        false
    }

    fn always() -> bool {
        true
    }

    /// Simulates an elevated child that consumes the handoff and reports back
    struct ConsumingRelauncher;

    impl Relauncher for ConsumingRelauncher {
        fn relaunch(&self, handoff: &Path) -> Result<Option<i32>> {
            let consumed = PlanHandoff::consume(handoff)?;
            let result = ExecutionResult {
                plan_id: consumed.plan.id(),
                succeeded_steps: (0..consumed.plan.total_steps()).collect(),
                failed_step: None,
                rollback_performed: false,
                cancelled: false,
                backups: vec![],
                warnings: vec![],
                completed_at: Utc::now(),
            };
            PlanHandoff::write_result(handoff, &HandoffResult::Executed { result })?;
            Ok(Some(0))
        }
    }

    /// Simulates a child that exits without touching the handoff
    struct IgnoringRelauncher(AtomicUsize);

    impl Relauncher for IgnoringRelauncher {
        fn relaunch(&self, _handoff: &Path) -> Result<Option<i32>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(Some(1))
        }
    }

    struct Sandbox {
        _dir: tempfile::TempDir,
        state: CanonicalPath,
        plan: MigrationPlan,
    }

    fn sandbox(elevated: bool) -> Sandbox {
        let dir = tempfile::tempdir().unwrap();
        let state = canonicalize(dir.path()).unwrap();
        let plan = MigrationPlan::new(
            "elevate",
            state.join("Emulation"),
            vec![MigrationStep::create_directory(state.join("Emulation")).with_elevation(elevated)],
        )
        .unwrap();
        Sandbox {
            _dir: dir,
            state,
            plan,
        }
    }

    fn handoff_dir_is_empty(state: &CanonicalPath) -> bool {
        std::fs::read_dir(state.join("handoff"))
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(true)
    }

    #[test]
    fn test_plan_without_elevation_is_not_needed() {
        let sb = sandbox(false);
        let mut elevator = PrivilegeElevator::new(
            sb.state.clone(),
            sb.state.join("backups"),
            Arc::new(FixedConsent(false)),
            Box::new(IgnoringRelauncher(AtomicUsize::new(0))),
        )
        .with_elevation_check(never);

        let outcome = elevator.request_elevation(&sb.plan, "test").unwrap();
        assert_eq!(outcome, ElevationOutcome::NotNeeded);
        assert_eq!(elevator.last_state(), ElevationState::NotNeeded);
    }

    #[test]
    fn test_already_admin_is_not_needed() {
        let sb = sandbox(true);
        let mut elevator = PrivilegeElevator::new(
            sb.state.clone(),
            sb.state.join("backups"),
            Arc::new(FixedConsent(false)),
            Box::new(IgnoringRelauncher(AtomicUsize::new(0))),
        )
        .with_elevation_check(always);
        assert!(elevator.can_run_here(&sb.plan));
        assert_eq!(
            elevator.request_elevation(&sb.plan, "test").unwrap(),
            ElevationOutcome::NotNeeded
        );
    }

    #[test]
    fn test_decline_is_denied_and_cleans_handoff() {
        let sb = sandbox(true);
        let mut elevator = PrivilegeElevator::new(
            sb.state.clone(),
            sb.state.join("backups"),
            Arc::new(FixedConsent(false)),
            Box::new(IgnoringRelauncher(AtomicUsize::new(0))),
        )
        .with_elevation_check(never);

        let outcome = elevator.request_elevation(&sb.plan, "test").unwrap();
        assert!(matches!(outcome, ElevationOutcome::Denied { .. }));
        assert_eq!(elevator.last_state(), ElevationState::Denied);
        assert!(handoff_dir_is_empty(&sb.state));
    }

    #[test]
    fn test_granted_returns_child_result() {
        let sb = sandbox(true);
        let mut elevator = PrivilegeElevator::new(
            sb.state.clone(),
            sb.state.join("backups"),
            Arc::new(FixedConsent(true)),
            Box::new(ConsumingRelauncher),
        )
        .with_elevation_check(never);

        let outcome = elevator.request_elevation(&sb.plan, "test").unwrap();
        let ElevationOutcome::Granted { exit_code, result } = outcome else {
            panic!("expected Granted, got {:?}", outcome);
        };
        assert_eq!(exit_code, Some(0));
        let Some(HandoffResult::Executed { result }) = result else {
            panic!("expected an executed result, got {:?}", result);
        };
        assert_eq!(result.plan_id, sb.plan.id());
        assert_eq!(elevator.last_state(), ElevationState::Granted);
        assert!(handoff_dir_is_empty(&sb.state));
    }

    /// Child that reads the parent's locations, then refuses to start
    struct RefusingRelauncher;

    impl Relauncher for RefusingRelauncher {
        fn relaunch(&self, handoff: &Path) -> Result<Option<i32>> {
            let consumed = PlanHandoff::consume(handoff)?;
            let err = crate::error::MigrationError::MigrationInProgress(
                consumed.backup_root.join("held").into_path_buf(),
            );
            PlanHandoff::write_result(handoff, &HandoffResult::refused(&err))?;
            Ok(Some(1))
        }
    }

    #[test]
    fn test_child_refusal_reaches_parent() {
        let sb = sandbox(true);
        let mut elevator = PrivilegeElevator::new(
            sb.state.clone(),
            sb.state.join("backups"),
            Arc::new(FixedConsent(true)),
            Box::new(RefusingRelauncher),
        )
        .with_elevation_check(never);

        let outcome = elevator.request_elevation(&sb.plan, "test").unwrap();
        let ElevationOutcome::Granted {
            exit_code,
            result: Some(HandoffResult::Refused { kind, message }),
        } = outcome
        else {
            panic!("expected a refusal, got {:?}", outcome);
        };
        assert_eq!(exit_code, Some(1));
        assert_eq!(kind, crate::error::ErrorKind::MigrationInProgress);
        assert!(message.contains(&sb.state.join("backups/held").to_string()));
        assert!(handoff_dir_is_empty(&sb.state));
    }

    #[test]
    fn test_unconsumed_handoff_is_denied() {
        let sb = sandbox(true);
        let mut elevator = PrivilegeElevator::new(
            sb.state.clone(),
            sb.state.join("backups"),
            Arc::new(FixedConsent(true)),
            Box::new(IgnoringRelauncher(AtomicUsize::new(0))),
        )
        .with_elevation_check(never);

        let outcome = elevator.request_elevation(&sb.plan, "test").unwrap();
        assert!(matches!(outcome, ElevationOutcome::Denied { .. }));
        assert!(handoff_dir_is_empty(&sb.state));
    }

    #[test]
    fn test_relaunched_process_never_prompts_again() {
        let sb = sandbox(true);
        let relauncher = Arc::new(IgnoringRelauncher(AtomicUsize::new(0)));

        struct Shared(Arc<IgnoringRelauncher>);
        impl Relauncher for Shared {
            fn relaunch(&self, handoff: &Path) -> Result<Option<i32>> {
                self.0.relaunch(handoff)
            }
        }

        let mut elevator = PrivilegeElevator::new(
            sb.state.clone(),
            sb.state.join("backups"),
            Arc::new(FixedConsent(true)),
            Box::new(Shared(relauncher.clone())),
        )
        .with_elevation_check(never)
        .with_relaunch_marker(true);

        let outcome = elevator.request_elevation(&sb.plan, "test").unwrap();
        assert_eq!(
            outcome,
            ElevationOutcome::Denied {
                reason: "elevation already attempted".to_string()
            }
        );
        assert_eq!(relauncher.0.load(Ordering::SeqCst), 0);
    }
}
