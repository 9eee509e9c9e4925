//! Execution State Machine
//!
//! Authoritative source of truth for how far a plan has run. Transitions are
//! validated so the engine cannot skip a step or leave a terminal state.
//!
//! # State Flow
//!
//! ```text
//! Pending
//!     ↓
//! Running(0) → Running(1) → … → Running(n-1)
//!     ↓                              ↓
//! RolledBack                     Completed
//!
//! (Pending and any Running state can transition to RolledBack)
//! ```

use crate::error::MigrationError;
use std::fmt;
use thiserror::Error;

/// Where a plan execution currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecutionState {
    /// Nothing has run yet
    Pending,
    /// Step `n` (0-based) is executing
    Running(usize),
    /// Every step ran (terminal)
    Completed,
    /// Executed steps were unwound after a failure or cancellation (terminal)
    RolledBack,
}

impl ExecutionState {
    /// Returns true if this is a terminal state
    #[inline]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::RolledBack)
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running(step) => write!(f, "running step {}", step + 1),
            Self::Completed => write!(f, "completed"),
            Self::RolledBack => write!(f, "rolled back"),
        }
    }
}

/// Errors that can occur during state transitions
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionTransitionError {
    /// Attempted to skip or repeat a step
    #[error("Cannot go from {from} to {to} (steps run strictly in order)")]
    OutOfOrder {
        from: ExecutionState,
        to: ExecutionState,
    },

    /// Attempted to complete before the last step ran
    #[error("Cannot complete from {from}: {total} step(s) in plan")]
    Incomplete { from: ExecutionState, total: usize },

    /// Attempted to transition from a terminal state
    #[error("Cannot transition from terminal state {from}")]
    FromTerminalState { from: ExecutionState },
}

impl From<ExecutionTransitionError> for MigrationError {
    fn from(err: ExecutionTransitionError) -> Self {
        MigrationError::StateTransition(err.to_string())
    }
}

/// Tracks one execution of one plan.
#[derive(Debug, Clone)]
pub struct ExecutionTracker {
    current: ExecutionState,
    total_steps: usize,
    /// (state, unix timestamp) for every transition taken
    history: Vec<(ExecutionState, u64)>,
}

impl ExecutionTracker {
    pub fn new(total_steps: usize) -> Self {
        Self {
            current: ExecutionState::Pending,
            total_steps,
            history: Vec::with_capacity(total_steps + 2),
        }
    }

    #[inline]
    pub fn current(&self) -> ExecutionState {
        self.current
    }

    pub fn history(&self) -> &[(ExecutionState, u64)] {
        &self.history
    }

    /// Enter step `index`; must be the step after the current one.
    ///
    /// # Errors
    ///
    /// - `FromTerminalState` if already Completed or RolledBack
    /// - `OutOfOrder` if `index` is not the next step
    pub fn start_step(&mut self, index: usize) -> Result<(), ExecutionTransitionError> {
        let target = ExecutionState::Running(index);
        let expected = match self.current {
            ExecutionState::Pending => 0,
            ExecutionState::Running(step) => step + 1,
            terminal => return Err(ExecutionTransitionError::FromTerminalState { from: terminal }),
        };
        if index != expected || index >= self.total_steps {
            return Err(ExecutionTransitionError::OutOfOrder {
                from: self.current,
                to: target,
            });
        }
        self.record(target);
        Ok(())
    }

    /// Mark the plan complete; only valid while running the last step.
    ///
    /// # Errors
    ///
    /// - `FromTerminalState` if already Completed or RolledBack
    /// - `Incomplete` if the last step has not started
    pub fn complete(&mut self) -> Result<(), ExecutionTransitionError> {
        match self.current {
            ExecutionState::Running(step) if step + 1 == self.total_steps => {
                self.record(ExecutionState::Completed);
                Ok(())
            }
            terminal if terminal.is_terminal() => {
                Err(ExecutionTransitionError::FromTerminalState { from: terminal })
            }
            other => Err(ExecutionTransitionError::Incomplete {
                from: other,
                total: self.total_steps,
            }),
        }
    }

    /// Mark the plan rolled back from any non-terminal state.
    ///
    /// # Errors
    ///
    /// - `FromTerminalState` if already Completed or RolledBack
    pub fn roll_back(&mut self) -> Result<(), ExecutionTransitionError> {
        if self.current.is_terminal() {
            return Err(ExecutionTransitionError::FromTerminalState { from: self.current });
        }
        self.record(ExecutionState::RolledBack);
        Ok(())
    }

    fn record(&mut self, state: ExecutionState) {
        let timestamp = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        self.history.push((state, timestamp));
        self.current = state;
    }
}
