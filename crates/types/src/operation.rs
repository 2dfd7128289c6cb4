//! Operation identity and descriptor definitions

use serde::{Deserialize, Serialize};
use std::fmt;

/// Process-unique operation identifier
///
/// Identifiers are assigned monotonically at start time and are never
/// reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(u64);

impl OperationId {
    /// Wrap a raw identifier value
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw identifier value
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Ordering token appended to every successful transition
///
/// Wall-clock timestamps from different threads are not strictly ordered;
/// sequence numbers are, and consumers linearise the event stream by them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Sequence(u64);

impl Sequence {
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Sequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Category of build work an operation represents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// A whole build invocation
    Build,
    /// A task in the build's task graph
    Task,
    /// A file system operation (copy, snapshot, hash)
    File,
    /// A network fetch
    Network,
    /// Anything else
    Generic,
}

impl OperationKind {
    /// All kinds, in declaration order
    pub const ALL: [Self; 5] = [
        Self::Build,
        Self::Task,
        Self::File,
        Self::Network,
        Self::Generic,
    ];

    /// Stable lowercase label
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Build => "build",
            Self::Task => "task",
            Self::File => "file",
            Self::Network => "network",
            Self::Generic => "generic",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable description of an operation
///
/// Created when the operation starts and never mutated afterwards. The
/// parent is a back-reference by identifier only, used for hierarchy
/// traversal; it never owns the parent record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationDescriptor {
    pub id: OperationId,
    pub parent_id: Option<OperationId>,
    pub kind: OperationKind,
    pub display_name: String,
    /// Shorter name for progress rendering, when it differs from the display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_display_name: Option<String>,
    /// Structured details supplied by the producer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl OperationDescriptor {
    /// Start describing a new operation
    #[must_use]
    pub fn builder(kind: OperationKind, display_name: impl Into<String>) -> DescriptorBuilder {
        DescriptorBuilder {
            kind,
            display_name: display_name.into(),
            progress_display_name: None,
            details: None,
        }
    }

    /// Name used when rendering progress
    #[must_use]
    pub fn progress_name(&self) -> &str {
        self.progress_display_name
            .as_deref()
            .unwrap_or(&self.display_name)
    }

    /// Whether this operation has no parent
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}

/// Producer-side description of an operation that has not started yet
///
/// The identifier and parent are assigned by the lifecycle controller.
#[derive(Debug, Clone, PartialEq)]
pub struct DescriptorBuilder {
    kind: OperationKind,
    display_name: String,
    progress_display_name: Option<String>,
    details: Option<serde_json::Value>,
}

impl DescriptorBuilder {
    #[must_use]
    pub fn progress_display_name(mut self, name: impl Into<String>) -> Self {
        self.progress_display_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    #[must_use]
    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    #[must_use]
    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// Seal the descriptor with its identity
    #[must_use]
    pub fn build(self, id: OperationId, parent_id: Option<OperationId>) -> OperationDescriptor {
        OperationDescriptor {
            id,
            parent_id,
            kind: self.kind,
            display_name: self.display_name,
            progress_display_name: self.progress_display_name,
            details: self.details,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_name_falls_back_to_display_name() {
        let plain = OperationDescriptor::builder(OperationKind::Task, ":app:compileJava")
            .build(OperationId::from_raw(1), None);
        assert_eq!(plain.progress_name(), ":app:compileJava");
        assert!(plain.is_root());

        let named = OperationDescriptor::builder(OperationKind::Task, ":app:compileJava")
            .progress_display_name("compileJava")
            .build(OperationId::from_raw(2), Some(OperationId::from_raw(1)));
        assert_eq!(named.progress_name(), "compileJava");
        assert!(!named.is_root());
    }

    #[test]
    fn descriptor_serialization_skips_empty_fields() {
        let descriptor = OperationDescriptor::builder(OperationKind::Network, "fetch")
            .build(OperationId::from_raw(5), None);
        let json = serde_json::to_value(&descriptor).unwrap();
        assert_eq!(json["id"], 5);
        assert_eq!(json["kind"], "network");
        assert!(json.get("details").is_none());
    }
}
