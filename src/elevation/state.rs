//! Elevation State Machine
//!
//! # State Flow
//!
//! ```text
//! Unknown
//!     ↓
//! Checked(is_admin)
//!     ↓            ↘
//! NotNeeded      Requested
//!                  ↓      ↘
//!               Granted   Denied
//! ```
//!
//! `NotNeeded`, `Granted` and `Denied` are terminal. `Checked` may also go
//! straight to `Denied` when a previous relaunch already failed to elevate.

use crate::error::MigrationError;
use std::fmt;
use thiserror::Error;

/// Where an elevation request currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElevationState {
    Unknown,
    Checked { is_admin: bool },
    NotNeeded,
    Requested,
    Granted,
    Denied,
}

impl ElevationState {
    #[inline]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::NotNeeded | Self::Granted | Self::Denied)
    }

    /// Whether `next` is a legal successor of `self`
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Unknown, Self::Checked { .. })
                | (Self::Checked { .. }, Self::NotNeeded)
                | (Self::Checked { is_admin: false }, Self::Requested)
                | (Self::Checked { is_admin: false }, Self::Denied)
                | (Self::Requested, Self::Granted)
                | (Self::Requested, Self::Denied)
        )
    }
}

impl fmt::Display for ElevationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::Checked { is_admin: true } => write!(f, "checked (elevated)"),
            Self::Checked { is_admin: false } => write!(f, "checked (not elevated)"),
            Self::NotNeeded => write!(f, "not needed"),
            Self::Requested => write!(f, "requested"),
            Self::Granted => write!(f, "granted"),
            Self::Denied => write!(f, "denied"),
        }
    }
}

/// Errors that can occur during state transitions
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ElevationTransitionError {
    #[error("Cannot go from {from} to {to}")]
    Invalid {
        from: ElevationState,
        to: ElevationState,
    },

    #[error("Cannot transition from terminal state {from}")]
    FromTerminalState { from: ElevationState },
}

impl From<ElevationTransitionError> for MigrationError {
    fn from(err: ElevationTransitionError) -> Self {
        MigrationError::StateTransition(err.to_string())
    }
}

/// Validated walk through [`ElevationState`]s for one request.
#[derive(Debug, Clone)]
pub struct ElevationTracker {
    current: ElevationState,
    history: Vec<ElevationState>,
}

impl Default for ElevationTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ElevationTracker {
    pub fn new() -> Self {
        Self {
            current: ElevationState::Unknown,
            history: Vec::with_capacity(4),
        }
    }

    #[inline]
    pub fn current(&self) -> ElevationState {
        self.current
    }

    /// States entered so far, oldest first
    pub fn history(&self) -> &[ElevationState] {
        &self.history
    }

    /// Move to `next`.
    ///
    /// # Errors
    ///
    /// - `FromTerminalState` if the request already ended
    /// - `Invalid` if `next` does not follow the current state
    pub fn transition_to(
        &mut self,
        next: ElevationState,
    ) -> Result<ElevationState, ElevationTransitionError> {
        if self.current.is_terminal() {
            return Err(ElevationTransitionError::FromTerminalState { from: self.current });
        }
        if !self.current.can_transition_to(next) {
            return Err(ElevationTransitionError::Invalid {
                from: self.current,
                to: next,
            });
        }
        tracing::debug!("Elevation: {} -> {}", self.current, next);
        self.history.push(next);
        self.current = next;
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_granted_path() {
        let mut tracker = ElevationTracker::new();
        tracker
            .transition_to(ElevationState::Checked { is_admin: false })
            .unwrap();
        tracker.transition_to(ElevationState::Requested).unwrap();
        tracker.transition_to(ElevationState::Granted).unwrap();
        assert_eq!(tracker.current(), ElevationState::Granted);
        assert_eq!(tracker.history().len(), 3);
    }

    #[test]
    fn test_cannot_skip_check() {
        let mut tracker = ElevationTracker::new();
        let err = tracker.transition_to(ElevationState::Requested).unwrap_err();
        assert!(matches!(err, ElevationTransitionError::Invalid { .. }));
    }

    #[test]
    fn test_admin_cannot_request() {
        let mut tracker = ElevationTracker::new();
        tracker
            .transition_to(ElevationState::Checked { is_admin: true })
            .unwrap();
        assert!(tracker.transition_to(ElevationState::Requested).is_err());
        tracker.transition_to(ElevationState::NotNeeded).unwrap();
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut tracker = ElevationTracker::new();
        tracker
            .transition_to(ElevationState::Checked { is_admin: false })
            .unwrap();
        tracker.transition_to(ElevationState::Denied).unwrap();
        let err = tracker.transition_to(ElevationState::Requested).unwrap_err();
        assert_eq!(
            err,
            ElevationTransitionError::FromTerminalState {
                from: ElevationState::Denied
            }
        );
    }

    #[test]
    fn test_transition_error_converts() {
        let err: MigrationError = ElevationTransitionError::FromTerminalState {
            from: ElevationState::Granted,
        }
        .into();
        assert!(err.to_string().contains("granted"));
    }
}
