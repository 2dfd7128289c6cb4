//! Operation lifecycle events

use crate::{EventLevel, EventMeta};
use buildops_types::{FailureContext, OperationDescriptor, OperationId, OperationStatus};
use serde::{Deserialize, Serialize};

/// Event kinds a listener can subscribe to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Started,
    Progressed,
    Finished,
}

impl EventKind {
    pub const ALL: [Self; 3] = [Self::Started, Self::Progressed, Self::Finished];
}

/// Lifecycle transition of a single operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OperationEvent {
    /// Operation registered and running
    Started { descriptor: OperationDescriptor },

    /// Progress message appended while running
    Progressed { id: OperationId, message: String },

    /// Operation reached a terminal status
    Finished {
        id: OperationId,
        status: OperationStatus,
        duration_ms: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        failure: Option<FailureContext>,
        /// Unexpected failures are tagged for upward propagation by the aggregator
        propagates_failure: bool,
    },
}

impl OperationEvent {
    #[must_use]
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Started { .. } => EventKind::Started,
            Self::Progressed { .. } => EventKind::Progressed,
            Self::Finished { .. } => EventKind::Finished,
        }
    }

    /// Operation the event belongs to
    #[must_use]
    pub fn operation_id(&self) -> OperationId {
        match self {
            Self::Started { descriptor } => descriptor.id,
            Self::Progressed { id, .. } | Self::Finished { id, .. } => *id,
        }
    }

    /// Determine the appropriate log level for this event
    #[must_use]
    pub fn log_level(&self) -> EventLevel {
        match self {
            Self::Finished {
                status: OperationStatus::Failed,
                ..
            } => EventLevel::Error,
            Self::Finished {
                status: OperationStatus::FailedExpectedly,
                ..
            } => EventLevel::Warn,
            Self::Progressed { .. } => EventLevel::Debug,
            _ => EventLevel::Info,
        }
    }

    /// Get the log target for this event (for structured logging)
    #[must_use]
    pub fn log_target(&self) -> &'static str {
        match self {
            Self::Started { .. } => "buildops::events::started",
            Self::Progressed { .. } => "buildops::events::progressed",
            Self::Finished { .. } => "buildops::events::finished",
        }
    }
}

/// An event together with its metadata, as delivered to listeners
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMessage {
    pub meta: EventMeta,
    pub event: OperationEvent,
}

impl EventMessage {
    #[must_use]
    pub fn new(meta: EventMeta, event: OperationEvent) -> Self {
        Self { meta, event }
    }

    #[must_use]
    pub fn kind(&self) -> EventKind {
        self.event.kind()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finished(status: OperationStatus) -> OperationEvent {
        OperationEvent::Finished {
            id: OperationId::from_raw(1),
            status,
            duration_ms: 0,
            result: None,
            failure: None,
            propagates_failure: status == OperationStatus::Failed,
        }
    }

    #[test]
    fn levels_follow_outcome() {
        assert_eq!(finished(OperationStatus::Failed).log_level(), EventLevel::Error);
        assert_eq!(
            finished(OperationStatus::FailedExpectedly).log_level(),
            EventLevel::Warn
        );
        assert_eq!(finished(OperationStatus::Succeeded).log_level(), EventLevel::Info);
    }

    #[test]
    fn finished_serializes_with_type_tag() {
        let json = serde_json::to_value(finished(OperationStatus::Succeeded)).unwrap();
        assert_eq!(json["type"], "finished");
        assert_eq!(json["status"], "succeeded");
        assert!(json.get("failure").is_none());
    }
}
