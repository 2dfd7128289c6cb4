use std::borrow::Cow;
use std::collections::BTreeMap;

use buildops_types::{OperationId, OperationKind, Sequence};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::Level;
use uuid::Uuid;

/// Structured metadata that accompanies every event emission.
///
/// The sequence number is the authoritative ordering token: it is allocated
/// under the same lock as the transition it describes, so sorting by it
/// reproduces the causal order of the build.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMeta {
    /// Unique identifier for this specific event.
    pub event_id: Uuid,
    /// Ordering token of the transition.
    pub sequence: Sequence,
    /// Operation the event belongs to.
    pub operation_id: OperationId,
    /// Parent of that operation, if any.
    pub parent_id: Option<OperationId>,
    /// Timestamp captured at transition time.
    pub timestamp: DateTime<Utc>,
    /// Severity used for routing to logging systems.
    pub level: EventLevel,
    /// Kind of work that originated the event.
    pub source: EventSource,
    /// Optional free-form labels for downstream enrichment (kept small on purpose).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl EventMeta {
    /// Create a new metadata instance for a transition of `operation_id`.
    #[must_use]
    pub fn new(
        sequence: Sequence,
        operation_id: OperationId,
        timestamp: DateTime<Utc>,
        level: impl Into<EventLevel>,
        source: impl Into<EventSource>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            sequence,
            operation_id,
            parent_id: None,
            timestamp,
            level: level.into(),
            source: source.into(),
            labels: BTreeMap::new(),
        }
    }

    /// Attach the parent operation identifier.
    #[must_use]
    pub fn with_parent(mut self, parent_id: Option<OperationId>) -> Self {
        self.parent_id = parent_id;
        self
    }

    /// Add an arbitrary label entry.
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Convert the metadata level into a tracing level for downstream logging.
    #[must_use]
    pub fn tracing_level(&self) -> Level {
        self.level.into()
    }
}

/// Lightweight severity levels used by the event system.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum EventLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<EventLevel> for Level {
    fn from(level: EventLevel) -> Self {
        match level {
            EventLevel::Trace => Level::TRACE,
            EventLevel::Debug => Level::DEBUG,
            EventLevel::Info => Level::INFO,
            EventLevel::Warn => Level::WARN,
            EventLevel::Error => Level::ERROR,
        }
    }
}

impl From<Level> for EventLevel {
    fn from(level: Level) -> Self {
        match level {
            Level::TRACE => EventLevel::Trace,
            Level::DEBUG => EventLevel::Debug,
            Level::INFO => EventLevel::Info,
            Level::WARN => EventLevel::Warn,
            _ => EventLevel::Error,
        }
    }
}

/// Component/feature that originated the event.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(transparent)]
pub struct EventSource(Cow<'static, str>);

impl EventSource {
    pub const BUILD: Self = Self::const_str("build");
    pub const TASK: Self = Self::const_str("task");
    pub const FILE: Self = Self::const_str("file");
    pub const NETWORK: Self = Self::const_str("network");
    pub const GENERIC: Self = Self::const_str("generic");

    const fn const_str(value: &'static str) -> Self {
        Self(Cow::Borrowed(value))
    }

    /// Create a source value from any stringy input (e.g. plugin name).
    #[must_use]
    pub fn from_dynamic(value: impl Into<String>) -> Self {
        Self(Cow::Owned(value.into()))
    }

    /// Borrow the underlying identifier used for logging/telemetry.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<OperationKind> for EventSource {
    fn from(kind: OperationKind) -> Self {
        match kind {
            OperationKind::Build => Self::BUILD,
            OperationKind::Task => Self::TASK,
            OperationKind::File => Self::FILE,
            OperationKind::Network => Self::NETWORK,
            OperationKind::Generic => Self::GENERIC,
        }
    }
}

impl From<&'static str> for EventSource {
    fn from(value: &'static str) -> Self {
        Self(Cow::Borrowed(value))
    }
}

impl From<String> for EventSource {
    fn from(value: String) -> Self {
        Self(Cow::Owned(value))
    }
}
