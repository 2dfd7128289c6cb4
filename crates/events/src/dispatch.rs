//! Listener fan-out

use crate::{BuildOperationListener, EventMessage, Interest, ListenerId};
use buildops_errors::ListenerError;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::warn;

/// Where listener failures are reported
pub trait DiagnosticSink: Send + Sync {
    /// A listener failed while handling `message`, or while flushing when
    /// `message` is `None`
    fn listener_failed(&self, listener: &str, message: Option<&EventMessage>, error: &ListenerError);
}

/// Default sink: logs listener failures as warnings
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingDiagnosticSink;

impl DiagnosticSink for TracingDiagnosticSink {
    fn listener_failed(&self, listener: &str, message: Option<&EventMessage>, error: &ListenerError) {
        match message {
            Some(message) => warn!(
                listener,
                sequence = message.meta.sequence.as_u64(),
                operation = %message.meta.operation_id,
                error = %error,
                "listener failed to handle event"
            ),
            None => warn!(listener, error = %error, "listener failed to flush"),
        }
    }
}

/// Outcome of delivering one event
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
}

#[derive(Clone)]
struct Registration {
    id: ListenerId,
    interest: Interest,
    listener: Arc<dyn BuildOperationListener>,
}

/// Broadcasts events to registered listeners in registration order
///
/// Delivery is synchronous: `dispatch` returns once every interested
/// listener has been invoked. A listener that fails (or panics, when panic
/// isolation is on) is reported to the diagnostic sink and the remaining
/// listeners still receive the event.
pub struct ListenerDispatcher {
    registrations: RwLock<Vec<Registration>>,
    next_id: AtomicU64,
    sink: Arc<dyn DiagnosticSink>,
    isolate_panics: bool,
}

impl ListenerDispatcher {
    /// Create a dispatcher reporting to the tracing sink
    #[must_use]
    pub fn new() -> Self {
        Self::with_sink(Arc::new(TracingDiagnosticSink))
    }

    #[must_use]
    pub fn with_sink(sink: Arc<dyn DiagnosticSink>) -> Self {
        Self {
            registrations: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            sink,
            isolate_panics: true,
        }
    }

    /// Whether a panicking listener is contained like a failing one
    #[must_use]
    pub fn isolate_panics(mut self, isolate: bool) -> Self {
        self.isolate_panics = isolate;
        self
    }

    /// Subscribe `listener` to the event kinds in `interest`
    pub fn register(
        &self,
        listener: Arc<dyn BuildOperationListener>,
        interest: Interest,
    ) -> ListenerId {
        let id = ListenerId::from_raw(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut registrations = self
            .registrations
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        registrations.push(Registration {
            id,
            interest,
            listener,
        });
        id
    }

    /// Remove a listener; returns whether it was registered
    pub fn deregister(&self, id: ListenerId) -> bool {
        let mut registrations = self
            .registrations
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = registrations.len();
        registrations.retain(|registration| registration.id != id);
        registrations.len() != before
    }

    /// Number of registered listeners
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.registrations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Deliver `message` to every interested listener
    pub fn dispatch(&self, message: &EventMessage) -> DispatchReport {
        let kind = message.kind();
        // snapshot so listeners may (de)register while being notified
        let targets: Vec<Registration> = self
            .registrations
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|registration| registration.interest.contains(kind))
            .cloned()
            .collect();

        let mut report = DispatchReport::default();
        for registration in &targets {
            match self.invoke(registration, |listener| listener.on_event(message)) {
                Ok(()) => report.delivered += 1,
                Err(error) => {
                    report.failed += 1;
                    self.sink
                        .listener_failed(registration.listener.name(), Some(message), &error);
                }
            }
        }
        report
    }

    /// Flush and deregister every listener; returns how many were removed
    pub fn drain(&self) -> usize {
        let drained: Vec<Registration> = std::mem::take(
            &mut *self
                .registrations
                .write()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for registration in &drained {
            if let Err(error) = self.invoke(registration, |listener| listener.flush()) {
                self.sink
                    .listener_failed(registration.listener.name(), None, &error);
            }
        }
        drained.len()
    }

    fn invoke<F>(&self, registration: &Registration, call: F) -> Result<(), ListenerError>
    where
        F: FnOnce(&dyn BuildOperationListener) -> Result<(), ListenerError>,
    {
        let listener = registration.listener.as_ref();
        if !self.isolate_panics {
            return call(listener);
        }
        catch_unwind(AssertUnwindSafe(|| call(listener))).unwrap_or_else(|payload| {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            Err(ListenerError::Panicked { message })
        })
    }
}

impl Default for ListenerDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ListenerDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerDispatcher")
            .field("listeners", &self.listener_count())
            .field("isolate_panics", &self.isolate_panics)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{EventKind, EventLevel, EventMeta, OperationEvent};
    use buildops_types::{OperationId, Sequence};
    use std::sync::Mutex;

    struct Recorder {
        seen: Mutex<Vec<u64>>,
        fail_on: Option<u64>,
    }

    impl Recorder {
        fn new(fail_on: Option<u64>) -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
                fail_on,
            })
        }

        fn seen(&self) -> Vec<u64> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl BuildOperationListener for Recorder {
        fn on_event(&self, message: &EventMessage) -> Result<(), ListenerError> {
            let seq = message.meta.sequence.as_u64();
            self.seen.lock().unwrap().push(seq);
            if self.fail_on == Some(seq) {
                return Err(ListenerError::failed("boom"));
            }
            Ok(())
        }
    }

    struct Panicker;

    impl BuildOperationListener for Panicker {
        fn on_event(&self, _message: &EventMessage) -> Result<(), ListenerError> {
            panic!("listener exploded");
        }
    }

    fn progress(seq: u64) -> EventMessage {
        let id = OperationId::from_raw(1);
        EventMessage::new(
            EventMeta::new(
                Sequence::from_raw(seq),
                id,
                chrono::Utc::now(),
                EventLevel::Debug,
                "test",
            ),
            OperationEvent::Progressed {
                id,
                message: format!("step {seq}"),
            },
        )
    }

    #[test]
    fn failing_listener_does_not_block_others() {
        let dispatcher = ListenerDispatcher::new();
        let flaky = Recorder::new(Some(2));
        let steady = Recorder::new(None);
        dispatcher.register(flaky.clone(), Interest::all());
        dispatcher.register(steady.clone(), Interest::all());

        for seq in 1..=4 {
            let report = dispatcher.dispatch(&progress(seq));
            let expected_failed = usize::from(seq == 2);
            assert_eq!(report.failed, expected_failed);
            assert_eq!(report.delivered, 2 - expected_failed);
        }

        assert_eq!(flaky.seen(), vec![1, 2, 3, 4]);
        assert_eq!(steady.seen(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn panicking_listener_is_isolated() {
        let dispatcher = ListenerDispatcher::new();
        let after = Recorder::new(None);
        dispatcher.register(Arc::new(Panicker), Interest::all());
        dispatcher.register(after.clone(), Interest::all());

        let report = dispatcher.dispatch(&progress(1));
        assert_eq!(report, DispatchReport { delivered: 1, failed: 1 });
        assert_eq!(after.seen(), vec![1]);
    }

    #[test]
    fn interest_filters_event_kinds() {
        let dispatcher = ListenerDispatcher::new();
        let finished_only = Recorder::new(None);
        dispatcher.register(finished_only.clone(), Interest::only([EventKind::Finished]));

        let report = dispatcher.dispatch(&progress(1));
        assert_eq!(report.delivered, 0);
        assert!(finished_only.seen().is_empty());
    }

    #[test]
    fn deregister_and_drain() {
        let dispatcher = ListenerDispatcher::new();
        let first = dispatcher.register(Recorder::new(None), Interest::all());
        dispatcher.register(Recorder::new(None), Interest::all());

        assert!(dispatcher.deregister(first));
        assert!(!dispatcher.deregister(first));
        assert_eq!(dispatcher.listener_count(), 1);
        assert_eq!(dispatcher.drain(), 1);
        assert_eq!(dispatcher.listener_count(), 0);
    }
}
