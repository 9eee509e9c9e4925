//! emumigrate Library
//!
//! Discovers legacy emulator installations and migrates their ROM, save and
//! config directories into one consolidated target root using directory
//! symlinks, with backups, rollback and privilege elevation.
//!
//! The flow is `scan -> plan -> (elevate) -> execute -> validate`, driven
//! through [`MigrationSession`]. Completed executions are recorded and can be
//! reverted later.

pub mod backup;
pub mod cli;
pub mod config;
pub mod elevation;
pub mod engine;
pub mod error;
pub mod history;
pub mod locale;
pub mod lock;
pub mod model;
pub mod path;
pub mod permissions;
pub mod planner;
pub mod scanner;
pub mod session;
pub mod validation;

// Re-export main types for convenience
pub use config::MigrationConfig;
pub use elevation::{
    ElevationOutcome, ElevationState, HandoffResult, PlanHandoff, PrivilegeElevator,
};
pub use engine::{CancellationToken, ExecutionEngine, RevertReport};
pub use error::{ErrorKind, MigrationError, Result};
pub use history::{HistoryEntry, MigrationHistory, UndoRecord};
pub use locale::{resolve_everyone_account_name, AccountLocalizer, PrincipalName};
pub use model::{
    ExecutionResult, LegacyInstallation, MigrationPlan, MigrationStep, StepAction, StepFailure,
};
pub use path::{canonicalize, CanonicalPath, PathInput};
pub use planner::{MigrationPlanner, PlannerOptions, TransferMode, WritableScope};
pub use scanner::{EmulatorPattern, LegacyScanner, ScanOptions, ScanReport};
pub use session::{MigrationSession, RunOutcome, SessionParts};
pub use validation::{ValidationResult, ValidationService};
