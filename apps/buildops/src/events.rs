//! Event rendering for the simulate command

use buildops_events::{EventMessage, OperationEvent, OperationId, OperationStatus};
use std::collections::HashMap;
use std::fmt::Write as _;

/// Renders events as they arrive and tallies finished operations
#[derive(Debug)]
pub struct EventPrinter {
    json: bool,
    /// Nesting depth of every operation seen so far
    depth: HashMap<OperationId, usize>,
    finished: HashMap<OperationStatus, usize>,
    received: usize,
}

impl EventPrinter {
    pub fn new(json: bool) -> Self {
        Self {
            json,
            depth: HashMap::new(),
            finished: HashMap::new(),
            received: 0,
        }
    }

    /// Handle incoming event
    pub fn handle_event(&mut self, message: &EventMessage) {
        if let Some(line) = self.render(message) {
            println!("{line}");
        }
    }

    fn render(&mut self, message: &EventMessage) -> Option<String> {
        self.received += 1;
        let meta = &message.meta;
        let depth = match &message.event {
            OperationEvent::Started { descriptor } => {
                let depth = descriptor
                    .parent_id
                    .and_then(|parent| self.depth.get(&parent).map(|d| d + 1))
                    .unwrap_or(0);
                self.depth.insert(descriptor.id, depth);
                depth
            }
            OperationEvent::Progressed { id, .. } => self.depth.get(id).copied().unwrap_or(0),
            OperationEvent::Finished { id, status, .. } => {
                *self.finished.entry(*status).or_default() += 1;
                self.depth.get(id).copied().unwrap_or(0)
            }
        };

        if self.json {
            return serde_json::to_string(message).ok();
        }

        let mut line = format!("{:>5} {}", meta.sequence.as_u64(), "  ".repeat(depth));
        // writing to a String cannot fail
        let _ = match &message.event {
            OperationEvent::Started { descriptor } => write!(
                line,
                "started  {} {} [{}]",
                descriptor.id,
                descriptor.progress_name(),
                descriptor.kind
            ),
            OperationEvent::Progressed { id, message } => write!(line, "progress {id} {message}"),
            OperationEvent::Finished {
                id,
                status,
                duration_ms,
                failure,
                ..
            } => {
                let reason = failure
                    .as_ref()
                    .map(|failure| format!(": {}", failure.message))
                    .unwrap_or_default();
                write!(line, "finished {id} {status} in {duration_ms}ms{reason}")
            }
        };
        Some(line)
    }

    /// Number of events handled
    pub fn received(&self) -> usize {
        self.received
    }

    /// Finished operations with the given status
    pub fn finished(&self, status: OperationStatus) -> usize {
        self.finished.get(&status).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildops_events::{EventLevel, EventMeta, OperationDescriptor};
    use buildops_types::{OperationKind, Sequence};

    fn meta(seq: u64, id: OperationId) -> EventMeta {
        EventMeta::new(
            Sequence::from_raw(seq),
            id,
            chrono::Utc::now(),
            EventLevel::Info,
            "test",
        )
    }

    #[test]
    fn nested_operations_are_indented() {
        let mut printer = EventPrinter::new(false);
        let root = OperationDescriptor::builder(OperationKind::Build, "app")
            .build(OperationId::from_raw(1), None);
        let child = OperationDescriptor::builder(OperationKind::Task, "compile")
            .progress_display_name("cc")
            .build(OperationId::from_raw(2), Some(root.id));

        let first = printer
            .render(&EventMessage::new(
                meta(1, root.id),
                OperationEvent::Started { descriptor: root },
            ))
            .unwrap();
        let second = printer
            .render(&EventMessage::new(
                meta(2, child.id),
                OperationEvent::Started { descriptor: child },
            ))
            .unwrap();
        assert!(first.ends_with("started  #1 app [build]"));
        assert!(second.ends_with("  started  #2 cc [task]"));
    }

    #[test]
    fn finished_events_are_tallied() {
        let mut printer = EventPrinter::new(true);
        let id = OperationId::from_raw(9);
        let line = printer
            .render(&EventMessage::new(
                meta(3, id),
                OperationEvent::Finished {
                    id,
                    status: OperationStatus::FailedExpectedly,
                    duration_ms: 1,
                    result: None,
                    failure: None,
                    propagates_failure: false,
                },
            ))
            .unwrap();
        assert!(line.contains("\"failed_expectedly\""));
        assert_eq!(printer.finished(OperationStatus::FailedExpectedly), 1);
        assert_eq!(printer.received(), 1);
    }
}
