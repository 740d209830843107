//! The closed job state machine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// State of a job as observed at the last reconciliation.
///
/// The string encodings are stable: they go into the database, into API
/// results, and onto the wire. A killed job never transitions back to
/// `Running`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionState {
    /// Submitted but not yet running (also the fallback for unknown backend states).
    Pending,
    /// The harness container is running.
    Running,
    /// Terminated with exit code zero.
    Success,
    /// Terminated with a nonzero exit code or a backend failure state.
    Failed,
    /// Terminated by an explicit kill.
    Killed,
}

impl ExecutionState {
    /// Whether this state is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Killed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::Killed => "KILLED",
        }
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_encoding_is_stable() {
        assert_eq!(serde_json::to_string(&ExecutionState::Pending).unwrap(), "\"PENDING\"");
        assert_eq!(
            serde_json::from_str::<ExecutionState>("\"KILLED\"").unwrap(),
            ExecutionState::Killed
        );
    }

    #[test]
    fn test_terminal_states() {
        assert!(!ExecutionState::Pending.is_terminal());
        assert!(!ExecutionState::Running.is_terminal());
        assert!(ExecutionState::Success.is_terminal());
        assert!(ExecutionState::Failed.is_terminal());
        assert!(ExecutionState::Killed.is_terminal());
    }
}
