//! Lifecycle controller: the public start/progress/finish surface

use crate::classifier::FailureClassifier;
use crate::context;
use crate::registry::{allocate_id, Change, OperationRegistry, Transition};
use buildops_config::Config;
use buildops_errors::OperationError;
use buildops_events::{
    BuildOperationListener, DiagnosticSink, EventMessage, EventMeta, Interest, ListenerDispatcher,
    ListenerId, OperationEvent, TracingDiagnosticSink,
};
use buildops_types::{
    DescriptorBuilder, FailureContext, OperationId, OperationSnapshot, OperationStatus, Outcome,
};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, OnceLock};
use tracing::{debug, trace, warn};

/// Opaque reference to a started operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OperationHandle {
    id: OperationId,
    parent: Option<OperationId>,
}

impl OperationHandle {
    pub(crate) fn new(id: OperationId, parent: Option<OperationId>) -> Self {
        Self { id, parent }
    }

    #[must_use]
    pub fn id(&self) -> OperationId {
        self.id
    }

    #[must_use]
    pub fn parent_id(&self) -> Option<OperationId> {
        self.parent
    }
}

/// What [`BuildOperations::end_build`] did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildSummary {
    pub listeners_flushed: usize,
    pub evicted: usize,
    pub still_running: usize,
}

/// Tracks build operations and fans their lifecycle out to listeners
///
/// Every transition is validated against the registry, stamped with a
/// sequence number and delivered to listeners before the call returns.
/// One operation's events are delivered one at a time in start, progress,
/// finish order, and a parent's finish only after all of its children's.
/// Listeners may query the controller while they are being notified.
pub struct BuildOperations {
    registry: OperationRegistry,
    dispatcher: ListenerDispatcher,
    classifier: FailureClassifier,
    evict_on_finish: bool,
    validate_resumed_context: bool,
    max_workers: usize,
}

static GLOBAL: OnceLock<BuildOperations> = OnceLock::new();

impl BuildOperations {
    /// Controller with default configuration
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(&Config::default())
    }

    #[must_use]
    pub fn with_config(config: &Config) -> Self {
        Self::with_diagnostic_sink(config, Arc::new(TracingDiagnosticSink))
    }

    /// Controller reporting listener failures to `sink`
    #[must_use]
    pub fn with_diagnostic_sink(config: &Config, sink: Arc<dyn DiagnosticSink>) -> Self {
        Self {
            registry: OperationRegistry::new(),
            dispatcher: ListenerDispatcher::with_sink(sink)
                .isolate_panics(config.dispatch.isolate_listener_panics),
            classifier: FailureClassifier::from_config(&config.classifier),
            evict_on_finish: config.tracking.evict_on_finish,
            validate_resumed_context: config.tracking.validate_resumed_context,
            max_workers: config.queue.max_workers,
        }
    }

    /// Process-wide controller, created with defaults on first use
    pub fn global() -> &'static Self {
        GLOBAL.get_or_init(Self::new)
    }

    /// Install `operations` as the process-wide controller
    ///
    /// # Errors
    ///
    /// Returns the controller back if one was already installed.
    pub fn install_global(operations: Self) -> Result<&'static Self, Self> {
        GLOBAL.set(operations)?;
        Ok(Self::global())
    }

    /// Start an operation nested under the current context, if any
    ///
    /// # Errors
    ///
    /// `StaleParentContext` if the ambient operation is no longer running.
    pub fn start(&self, descriptor: DescriptorBuilder) -> Result<OperationHandle, OperationError> {
        self.start_operation(descriptor, None)
    }

    /// Start an operation under an explicit parent
    ///
    /// # Errors
    ///
    /// `UnknownParent` if `parent` is not running.
    pub fn start_with_parent(
        &self,
        descriptor: DescriptorBuilder,
        parent: OperationHandle,
    ) -> Result<OperationHandle, OperationError> {
        self.start_operation(descriptor, Some(parent))
    }

    /// Start an operation; without an explicit parent the current context decides
    ///
    /// # Errors
    ///
    /// `UnknownParent` for an explicit parent that is not running,
    /// `StaleParentContext` for an ambient one (or `UnknownParent` when
    /// resumed-context validation is disabled).
    pub fn start_operation(
        &self,
        descriptor: DescriptorBuilder,
        explicit_parent: Option<OperationHandle>,
    ) -> Result<OperationHandle, OperationError> {
        let (parent, ambient) = match explicit_parent {
            Some(parent) => (Some(parent.id()), false),
            None => (context::current().map(|handle| handle.id()), true),
        };
        let descriptor = descriptor.build(allocate_id(), parent);
        let handle = OperationHandle::new(descriptor.id, parent);

        self.registry
            .register(descriptor, |transition| {
                self.publish(
                    transition,
                    OperationEvent::Started {
                        descriptor: transition.descriptor.clone(),
                    },
                );
            })
            .map_err(|err| match err {
                OperationError::UnknownParent { parent } if ambient && self.validate_resumed_context => {
                    OperationError::StaleParentContext { parent }
                }
                other => other,
            })
            .inspect_err(|err| warn!(error = %err, "rejected operation start"))?;

        debug!(operation = %handle.id, parent = ?parent, "operation started");
        Ok(handle)
    }

    /// Append a progress message to a running operation
    ///
    /// # Errors
    ///
    /// `NotRunning` once the operation has finished.
    pub fn record_progress(
        &self,
        handle: OperationHandle,
        message: impl Into<String>,
    ) -> Result<(), OperationError> {
        let message = message.into();
        trace!(operation = %handle.id, %message, "operation progress");
        self.registry
            .progress(handle.id, message, |transition| {
                if let Change::Progressed(message) = transition.change {
                    self.publish(
                        transition,
                        OperationEvent::Progressed {
                            id: transition.descriptor.id,
                            message: message.to_string(),
                        },
                    );
                }
            })
            .inspect_err(|err| warn!(error = %err, "rejected progress"))
    }

    /// Finish an operation with a producer outcome
    ///
    /// Returns the terminal status the classifier assigned.
    ///
    /// # Errors
    ///
    /// `ChildrenStillRunning` while a direct child runs (retry once it has
    /// finished), `AlreadyFinished` for every call after the first success.
    pub fn finish_operation(
        &self,
        handle: OperationHandle,
        outcome: Outcome,
    ) -> Result<OperationStatus, OperationError> {
        let classification = self.classifier.classify(&outcome);
        let (result, failure) = match outcome {
            Outcome::Succeeded { result } => (result, None),
            Outcome::Failed { failure } => (None, Some(failure)),
            Outcome::Cancelled { reason } => (
                None,
                Some(FailureContext::expected(reason).with_code("build.cancelled")),
            ),
        };

        self.registry
            .transition(
                handle.id,
                classification.status,
                self.evict_on_finish,
                |transition| {
                    let Change::Finished { status, duration } = transition.change else {
                        return;
                    };
                    self.publish(
                        transition,
                        OperationEvent::Finished {
                            id: transition.descriptor.id,
                            status,
                            duration_ms: u64::try_from(duration.as_millis()).unwrap_or(u64::MAX),
                            result,
                            failure,
                            propagates_failure: classification.propagates_failure,
                        },
                    );
                },
            )
            .inspect_err(|err| warn!(error = %err, "rejected operation finish"))?;

        debug!(
            operation = %handle.id,
            status = %classification.status,
            "operation finished"
        );
        Ok(classification.status)
    }

    /// Operation current on the calling thread
    #[must_use]
    pub fn current_operation(&self) -> Option<OperationHandle> {
        context::current()
    }

    fn publish(&self, transition: &Transition<'_>, event: OperationEvent) {
        let descriptor = transition.descriptor;
        let meta = EventMeta::new(
            transition.sequence,
            descriptor.id,
            transition.timestamp,
            event.log_level(),
            descriptor.kind,
        )
        .with_parent(descriptor.parent_id);
        let report = self.dispatcher.dispatch(&EventMessage::new(meta, event));
        if report.failed > 0 {
            trace!(
                operation = %descriptor.id,
                sequence = %transition.sequence,
                failed = report.failed,
                "event not delivered to every listener"
            );
        }
    }

    /// Subscribe a listener to the given event kinds
    pub fn register_listener(
        &self,
        listener: Arc<dyn BuildOperationListener>,
        interest: Interest,
    ) -> ListenerId {
        let name = listener.name().to_string();
        let id = self.dispatcher.register(listener, interest);
        debug!(listener = %name, %id, "listener registered");
        id
    }

    /// Remove a listener; returns whether it was registered
    pub fn deregister_listener(&self, id: ListenerId) -> bool {
        self.dispatcher.deregister(id)
    }

    /// Point-in-time copy of an operation
    ///
    /// # Errors
    ///
    /// `UnknownOperation` if the id is unknown or was evicted.
    pub fn lookup(&self, id: OperationId) -> Result<OperationSnapshot, OperationError> {
        self.registry.lookup(id)
    }

    /// Every running operation, in start order
    #[must_use]
    pub fn running_operations(&self) -> Vec<OperationSnapshot> {
        self.registry.running()
    }

    /// Direct children of an operation, in start order
    ///
    /// # Errors
    ///
    /// `UnknownOperation` if the id is unknown or was evicted.
    pub fn children(&self, id: OperationId) -> Result<Vec<OperationId>, OperationError> {
        self.registry.children(id)
    }

    /// Evict every terminal record; returns how many were removed
    pub fn evict_finished(&self) -> usize {
        self.registry.evict_finished()
    }

    /// Close the build session
    ///
    /// Listeners are flushed and deregistered, terminal records evicted and
    /// forgotten. Operations still running are left untouched and reported.
    pub fn end_build(&self) -> BuildSummary {
        let summary = BuildSummary {
            listeners_flushed: self.dispatcher.drain(),
            evicted: self.registry.evict_finished(),
            still_running: self.registry.running_count(),
        };
        let forgotten = self.registry.clear_tombstones();
        trace!(forgotten, "tombstones cleared");
        if summary.still_running > 0 {
            warn!(
                still_running = summary.still_running,
                "build ended with operations still running"
            );
        }
        debug!(?summary, "build ended");
        summary
    }

    pub(crate) fn max_workers(&self) -> usize {
        self.max_workers
    }
}

impl Default for BuildOperations {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BuildOperations {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildOperations")
            .field("records", &self.registry.len())
            .field("dispatcher", &self.dispatcher)
            .field("evict_on_finish", &self.evict_on_finish)
            .field("validate_resumed_context", &self.validate_resumed_context)
            .finish_non_exhaustive()
    }
}
