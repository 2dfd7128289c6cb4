//! Listener capability and the listeners shipped with the crate

use crate::{EventKind, EventLevel, EventMessage, OperationEvent};
use buildops_errors::ListenerError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info, trace, warn};

/// Receives typed lifecycle events
///
/// Listeners are invoked synchronously on the producer's thread, one event
/// of an operation at a time. They may query the registry, but must not
/// progress or finish the operation they are being notified about.
pub trait BuildOperationListener: Send + Sync {
    /// Name used in diagnostics
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Handle one event
    ///
    /// # Errors
    ///
    /// A returned error is reported to the dispatcher's diagnostic sink and
    /// never reaches the producer.
    fn on_event(&self, message: &EventMessage) -> Result<(), ListenerError>;

    /// Called once when the build ends, before deregistration
    ///
    /// # Errors
    ///
    /// Reported to the diagnostic sink like event failures.
    fn flush(&self) -> Result<(), ListenerError> {
        Ok(())
    }
}

/// Handle returned on registration, used to deregister
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ListenerId(u64);

impl ListenerId {
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// Set of event kinds a listener subscribes to
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Interest(BTreeSet<EventKind>);

impl Interest {
    /// Every event kind
    #[must_use]
    pub fn all() -> Self {
        Self(EventKind::ALL.into_iter().collect())
    }

    #[must_use]
    pub fn only(kinds: impl IntoIterator<Item = EventKind>) -> Self {
        Self(kinds.into_iter().collect())
    }

    #[must_use]
    pub fn contains(&self, kind: EventKind) -> bool {
        self.0.contains(&kind)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<EventKind> for Interest {
    fn from_iter<I: IntoIterator<Item = EventKind>>(iter: I) -> Self {
        Self::only(iter)
    }
}

/// Type alias for the receiving end of a [`ChannelListener`]
pub type EventReceiver = UnboundedReceiver<EventMessage>;

/// Create a listener that forwards events into an unbounded channel
#[must_use]
pub fn channel() -> (ChannelListener, EventReceiver) {
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    (ChannelListener { tx }, rx)
}

/// Forwards events to an async consumer off the producer threads
#[derive(Debug, Clone)]
pub struct ChannelListener {
    tx: UnboundedSender<EventMessage>,
}

impl BuildOperationListener for ChannelListener {
    fn name(&self) -> &str {
        "channel"
    }

    fn on_event(&self, message: &EventMessage) -> Result<(), ListenerError> {
        self.tx
            .send(message.clone())
            .map_err(|_| ListenerError::ChannelClosed)
    }
}

/// Mirrors every event into `tracing` at the event's own level
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingListener;

impl BuildOperationListener for TracingListener {
    fn name(&self) -> &str {
        "tracing"
    }

    fn on_event(&self, message: &EventMessage) -> Result<(), ListenerError> {
        let meta = &message.meta;
        let summary = match &message.event {
            OperationEvent::Started { descriptor } => {
                format!("started {} ({})", descriptor.display_name, descriptor.kind)
            }
            OperationEvent::Progressed { message, .. } => format!("progress: {message}"),
            OperationEvent::Finished {
                status,
                duration_ms,
                ..
            } => format!("finished {status} in {duration_ms}ms"),
        };

        // tracing levels must be known statically
        match meta.level {
            EventLevel::Error => error!(
                source = meta.source.as_str(),
                sequence = meta.sequence.as_u64(),
                operation = %meta.operation_id,
                parent = ?meta.parent_id,
                "{summary}"
            ),
            EventLevel::Warn => warn!(
                source = meta.source.as_str(),
                sequence = meta.sequence.as_u64(),
                operation = %meta.operation_id,
                parent = ?meta.parent_id,
                "{summary}"
            ),
            EventLevel::Info => info!(
                source = meta.source.as_str(),
                sequence = meta.sequence.as_u64(),
                operation = %meta.operation_id,
                parent = ?meta.parent_id,
                "{summary}"
            ),
            EventLevel::Debug => debug!(
                source = meta.source.as_str(),
                sequence = meta.sequence.as_u64(),
                operation = %meta.operation_id,
                parent = ?meta.parent_id,
                "{summary}"
            ),
            EventLevel::Trace => trace!(
                source = meta.source.as_str(),
                sequence = meta.sequence.as_u64(),
                operation = %meta.operation_id,
                parent = ?meta.parent_id,
                "{summary}"
            ),
        }
        Ok(())
    }
}
