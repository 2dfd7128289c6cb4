//! Fan-out of independent work items under one parent operation

use crate::context::CapturedContext;
use crate::runner::{panic_message, OperationContext};
use crate::{BuildOperations, OperationHandle};
use buildops_config::calculate_workers;
use buildops_errors::Error;
use buildops_types::{DescriptorBuilder, FailureContext, OperationStatus, Outcome};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, warn};

/// Per-status tally of a queue run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueReport {
    pub parent: OperationHandle,
    pub status: OperationStatus,
    pub succeeded: usize,
    pub failed: usize,
    pub failed_expectedly: usize,
}

impl QueueReport {
    #[must_use]
    pub fn total(&self) -> usize {
        self.succeeded + self.failed + self.failed_expectedly
    }
}

#[derive(Default)]
struct Tally {
    succeeded: AtomicUsize,
    failed: AtomicUsize,
    failed_expectedly: AtomicUsize,
    /// Message of the first item that panicked
    panicked: Mutex<Option<String>>,
}

impl Tally {
    fn record_panic(&self, message: String) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        let mut first = self.panicked.lock().unwrap_or_else(PoisonError::into_inner);
        if first.is_none() {
            *first = Some(message);
        }
    }

    fn record(&self, status: OperationStatus) {
        let counter = match status {
            OperationStatus::Succeeded => &self.succeeded,
            OperationStatus::FailedExpectedly => &self.failed_expectedly,
            OperationStatus::Failed | OperationStatus::Running => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

impl BuildOperations {
    /// Run every item in its own child operation on a pool of scoped threads
    ///
    /// The parent starts under the current context and finishes after every
    /// child has. It fails unexpectedly if any child did, fails expectedly if
    /// only expected failures occurred and succeeds otherwise. A panicking
    /// item fails its own operation and the parent; the worker carries on
    /// with the remaining items.
    ///
    /// # Errors
    ///
    /// Returns an error if the parent cannot be started or finished.
    pub fn run_all<I, F>(
        &self,
        parent: DescriptorBuilder,
        items: impl IntoIterator<Item = (DescriptorBuilder, I)>,
        worker: F,
    ) -> Result<QueueReport, Error>
    where
        I: Send,
        F: Fn(&mut OperationContext<'_>, I) -> Result<(), Error> + Sync,
    {
        let parent = self.start(parent)?;
        let (tx, rx) = crossbeam::channel::unbounded();
        let mut queued = 0usize;
        for item in items {
            if tx.send(item).is_err() {
                break;
            }
            queued += 1;
        }
        drop(tx);

        let workers = calculate_workers(self.max_workers()).min(queued).max(1);
        debug!(operation = %parent.id(), queued, workers, "running queue");

        let tally = Tally::default();
        let captured = CapturedContext::of(parent);
        let (tally_ref, worker_ref) = (&tally, &worker);
        let joined = crossbeam::thread::scope(|scope| {
            for _ in 0..workers {
                let rx = rx.clone();
                scope.spawn(move |_| {
                    captured.run(|| {
                        for (descriptor, item) in rx {
                            let child = match self.start(descriptor) {
                                Ok(child) => child,
                                Err(err) => {
                                    warn!(error = %err, "queue item could not be started");
                                    tally_ref.record(OperationStatus::Failed);
                                    continue;
                                }
                            };
                            match catch_unwind(AssertUnwindSafe(|| {
                                self.execute(child, |ctx| worker_ref(ctx, item))
                            })) {
                                Ok((_, finished)) => {
                                    tally_ref.record(finished.unwrap_or(OperationStatus::Failed));
                                }
                                Err(payload) => {
                                    let message = panic_message(payload.as_ref());
                                    warn!(operation = %child.id(), %message, "queue item panicked");
                                    tally_ref.record_panic(message);
                                }
                            }
                        }
                    });
                });
            }
        });

        let report = |status| QueueReport {
            parent,
            status,
            succeeded: tally.succeeded.load(Ordering::Relaxed),
            failed: tally.failed.load(Ordering::Relaxed),
            failed_expectedly: tally.failed_expectedly.load(Ordering::Relaxed),
        };
        let partial = report(OperationStatus::Running);
        let panicked = tally
            .panicked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let outcome = match (joined, panicked) {
            (Err(payload), _) => Outcome::failed(FailureContext::unexpected(format!(
                "queue worker panicked: {}",
                panic_message(payload.as_ref())
            ))),
            (Ok(()), Some(message)) => Outcome::failed(FailureContext::unexpected(format!(
                "queue item panicked: {message}"
            ))),
            (Ok(()), None) if partial.failed > 0 => Outcome::failed(FailureContext::unexpected(format!(
                "{} of {queued} items failed",
                partial.failed
            ))),
            (Ok(()), None) if partial.failed_expectedly > 0 => {
                Outcome::failed(FailureContext::expected(format!(
                    "{} of {queued} items failed expectedly",
                    partial.failed_expectedly
                )))
            }
            (Ok(()), None) => Outcome::success_with(serde_json::json!({ "items": queued })),
        };

        let status = self.finish_operation(parent, outcome)?;
        Ok(report(status))
    }
}
