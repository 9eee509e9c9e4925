//! Error handling module for emumigrate
//!
//! Provides the centralized error taxonomy using thiserror. Every public
//! operation of the engine returns these types; nothing reports failure only
//! through console output.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use strum::{Display, EnumString};
use thiserror::Error;

/// Main error type for the migration engine
#[derive(Error, Debug)]
pub enum MigrationError {
    /// A path that is not a usable path string reached the resolver
    #[error("Path type error: {0}")]
    PathType(String),

    /// Filesystem or privilege check rejected an operation (recoverable by elevation)
    #[error("Permission denied: {}: {reason}", path.display())]
    PermissionDenied { path: PathBuf, reason: String },

    /// Locale has no entry in the principal table; carried as a warning
    #[error("Locale '{0}' is not mapped, falling back to 'Everyone'")]
    LocaleNotMapped(String),

    /// Host/filesystem cannot create the requested link type
    #[error(
        "Symlink unsupported: {} -> {}: {reason}",
        link.display(),
        source_path.display()
    )]
    SymlinkUnsupported {
        link: PathBuf,
        source_path: PathBuf,
        reason: String,
    },

    /// Pre-flight found less free space than the plan needs
    #[error(
        "Insufficient disk space on {}: {required} bytes required, {available} available",
        path.display()
    )]
    DiskSpaceInsufficient {
        path: PathBuf,
        required: u64,
        available: u64,
    },

    /// Another migration holds the lock for this target root
    #[error("A migration is already running against {}", .0.display())]
    MigrationInProgress(PathBuf),

    /// A snapshot could not be taken; the destructive step must not run
    #[error("Backup failed for {}: {reason}", path.display())]
    BackupFailure { path: PathBuf, reason: String },

    /// Target is occupied by data the planner must not replace
    #[error("Target conflict at {}: {reason}", path.display())]
    TargetConflict { path: PathBuf, reason: String },

    /// Installation or pair produced nothing to migrate
    #[error("Nothing to migrate: {0}")]
    EmptyPlan(String),

    /// Cooperative cancellation observed between steps
    #[error("Migration cancelled before step {0}")]
    Cancelled(usize),

    /// A recorded execution cannot be reverted
    #[error("Cannot revert: {0}")]
    NotRevertible(String),

    /// Plan handoff file could not be written, read, or is of the wrong version
    #[error("Plan handoff error: {0}")]
    Handoff(String),

    /// Elevation request failed for a reason other than user denial
    #[error("Elevation error: {0}")]
    Elevation(String),

    /// A state machine was driven through an invalid transition
    #[error("Invalid state transition: {0}")]
    StateTransition(String),

    /// Configuration errors (loading, validation)
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO errors not attributable to permissions
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Error raised in the elevated child and carried back as kind and text
    #[error("{message}")]
    Reported { kind: ErrorKind, message: String },
}

/// Result type alias for migration operations
pub type Result<T> = std::result::Result<T, MigrationError>;

/// Serializable error classification, used inside execution results and
/// history records where the full error value cannot travel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    PathType,
    PermissionDenied,
    LocaleNotMapped,
    SymlinkUnsupported,
    DiskSpaceInsufficient,
    MigrationInProgress,
    BackupFailure,
    TargetConflict,
    EmptyPlan,
    Cancelled,
    NotRevertible,
    Handoff,
    Elevation,
    StateTransition,
    Config,
    Io,
    Json,
}

impl MigrationError {
    /// Create a permission error for a path
    pub fn permission_denied(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::PermissionDenied {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a backup failure for a path
    pub fn backup_failure(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::BackupFailure {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a target conflict for a path
    pub fn target_conflict(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Self::TargetConflict {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create a handoff error
    pub fn handoff(msg: impl Into<String>) -> Self {
        Self::Handoff(msg.into())
    }

    /// Create an elevation error
    pub fn elevation(msg: impl Into<String>) -> Self {
        Self::Elevation(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Map an I/O error that occurred while touching `path`.
    ///
    /// `PermissionDenied` from the OS becomes the typed variant so callers can
    /// offer elevation; everything else stays an I/O error.
    pub fn from_io(path: impl Into<PathBuf>, err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::PermissionDenied {
            Self::permission_denied(path, err.to_string())
        } else {
            Self::Io(err)
        }
    }

    /// Classification of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::PathType(_) => ErrorKind::PathType,
            Self::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            Self::LocaleNotMapped(_) => ErrorKind::LocaleNotMapped,
            Self::SymlinkUnsupported { .. } => ErrorKind::SymlinkUnsupported,
            Self::DiskSpaceInsufficient { .. } => ErrorKind::DiskSpaceInsufficient,
            Self::MigrationInProgress(_) => ErrorKind::MigrationInProgress,
            Self::BackupFailure { .. } => ErrorKind::BackupFailure,
            Self::TargetConflict { .. } => ErrorKind::TargetConflict,
            Self::EmptyPlan(_) => ErrorKind::EmptyPlan,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::NotRevertible(_) => ErrorKind::NotRevertible,
            Self::Handoff(_) => ErrorKind::Handoff,
            Self::Elevation(_) => ErrorKind::Elevation,
            Self::StateTransition(_) => ErrorKind::StateTransition,
            Self::Config(_) => ErrorKind::Config,
            Self::Io(_) => ErrorKind::Io,
            Self::Json(_) => ErrorKind::Json,
            Self::Reported { kind, .. } => *kind,
        }
    }

    /// Returns true if running with elevated rights could make the operation succeed
    pub fn is_recoverable_by_elevation(&self) -> bool {
        matches!(
            self,
            Self::PermissionDenied { .. } | Self::SymlinkUnsupported { .. }
        )
    }
}
