//! Operation lifecycle error types
//!
//! Every variant is a caller contract violation. They are raised
//! synchronously to the caller of the offending call and never retried.

use std::borrow::Cow;

use crate::UserFacingError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[non_exhaustive]
pub enum OperationError {
    #[error("parent operation #{parent} is not running")]
    UnknownParent { parent: u64 },

    #[error("operation #{id} is already registered")]
    DuplicateId { id: u64 },

    #[error("unknown operation #{id}")]
    UnknownOperation { id: u64 },

    #[error("invalid transition for operation #{id}: {from} -> {to}")]
    InvalidTransition { id: u64, from: String, to: String },

    #[error("operation #{id} already finished as {status}")]
    AlreadyFinished { id: u64, status: String },

    #[error("operation #{id} is not running ({status})")]
    NotRunning { id: u64, status: String },

    #[error("operation #{id} still has {} running children: {running:?}", running.len())]
    ChildrenStillRunning { id: u64, running: Vec<u64> },

    #[error("context parent operation #{parent} is no longer running")]
    StaleParentContext { parent: u64 },
}

impl OperationError {
    /// Identifier of the operation the error is about.
    #[must_use]
    pub fn operation_id(&self) -> u64 {
        match self {
            Self::UnknownParent { parent } | Self::StaleParentContext { parent } => *parent,
            Self::DuplicateId { id }
            | Self::UnknownOperation { id }
            | Self::InvalidTransition { id, .. }
            | Self::AlreadyFinished { id, .. }
            | Self::NotRunning { id, .. }
            | Self::ChildrenStillRunning { id, .. } => *id,
        }
    }
}

impl UserFacingError for OperationError {
    fn user_message(&self) -> Cow<'_, str> {
        Cow::Owned(self.to_string())
    }

    fn user_hint(&self) -> Option<&'static str> {
        match self {
            Self::UnknownParent { .. } => {
                Some("Start child operations only while their parent is running.")
            }
            Self::ChildrenStillRunning { .. } => {
                Some("Finish every child operation before finishing its parent.")
            }
            Self::StaleParentContext { .. } => Some(
                "A captured operation context outlived its operation; capture the context again.",
            ),
            Self::AlreadyFinished { .. } => Some("Finish each operation handle exactly once."),
            Self::NotRunning { .. } => Some("Report progress only while the operation runs."),
            _ => None,
        }
    }

    fn is_retryable(&self) -> bool {
        // the gate clears once the children finish
        matches!(self, Self::ChildrenStillRunning { .. })
    }

    fn user_code(&self) -> Option<&'static str> {
        Some(match self {
            Self::UnknownParent { .. } => "operation.unknown_parent",
            Self::DuplicateId { .. } => "operation.duplicate_id",
            Self::UnknownOperation { .. } => "operation.unknown",
            Self::InvalidTransition { .. } => "operation.invalid_transition",
            Self::AlreadyFinished { .. } => "operation.already_finished",
            Self::NotRunning { .. } => "operation.not_running",
            Self::ChildrenStillRunning { .. } => "operation.children_running",
            Self::StaleParentContext { .. } => "operation.stale_context",
        })
    }
}
