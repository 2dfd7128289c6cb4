//! Operation state type definitions

use crate::{OperationDescriptor, OperationId, Sequence};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of an operation
///
/// `Running` is the only initial state and the only non-terminal one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Running,
    Succeeded,
    Failed,
    FailedExpectedly,
}

impl OperationStatus {
    /// Whether no further transition is possible
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }

    /// Whether the state machine permits moving from `self` to `next`
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(self, Self::Running) && next.is_terminal()
    }

    /// Whether this is one of the two failure outcomes
    #[must_use]
    pub fn is_failure(self) -> bool {
        matches!(self, Self::Failed | Self::FailedExpectedly)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::FailedExpectedly => "failed_expectedly",
        }
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time copy of an operation's mutable state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationState {
    pub status: OperationStatus,
    /// Append-only while running
    pub progress_messages: Vec<String>,
    pub started_at: DateTime<Utc>,
    /// Set once; never earlier than `started_at`
    pub finished_at: Option<DateTime<Utc>>,
    /// Sequence number of the start transition
    pub start_sequence: Sequence,
    /// Sequence number of the most recent transition
    pub last_sequence: Sequence,
}

impl OperationState {
    /// Wall-clock duration, once finished
    #[must_use]
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.finished_at.map(|finished| finished - self.started_at)
    }
}

/// Descriptor and state of an operation, copied out of the registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationSnapshot {
    pub descriptor: OperationDescriptor,
    pub state: OperationState,
    /// Direct children that are still running
    pub running_children: Vec<OperationId>,
}

impl OperationSnapshot {
    #[must_use]
    pub fn id(&self) -> OperationId {
        self.descriptor.id
    }

    #[must_use]
    pub fn status(&self) -> OperationStatus {
        self.state.status
    }
}
