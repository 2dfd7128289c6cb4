//! Scoped operations: start, make current, run, finish

use crate::context::CapturedContext;
use crate::{BuildOperations, OperationHandle};
use buildops_errors::{OperationError, UserFacingError};
use buildops_types::{DescriptorBuilder, FailureContext, OperationStatus, Outcome};
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::warn;

/// Handed to the body of a scoped operation
///
/// Clones share the result slot, so an async body may move its copy into
/// the future it returns.
#[derive(Debug, Clone)]
pub struct OperationContext<'a> {
    operations: &'a BuildOperations,
    handle: OperationHandle,
    result: Arc<Mutex<Option<serde_json::Value>>>,
}

impl<'a> OperationContext<'a> {
    fn new(operations: &'a BuildOperations, handle: OperationHandle) -> Self {
        Self {
            operations,
            handle,
            result: Arc::default(),
        }
    }

    fn success(&self) -> Outcome {
        self.result
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .map_or_else(Outcome::success, Outcome::success_with)
    }

    #[must_use]
    pub fn handle(&self) -> OperationHandle {
        self.handle
    }

    /// Controller the operation runs under, for starting nested work
    #[must_use]
    pub fn operations(&self) -> &'a BuildOperations {
        self.operations
    }

    /// Report progress on this operation
    ///
    /// # Errors
    ///
    /// Fails only if the operation was finished behind the runner's back.
    pub fn progress(&self, message: impl Into<String>) -> Result<(), OperationError> {
        self.operations.record_progress(self.handle, message)
    }

    /// Payload forwarded in the finish event on success
    pub fn set_result(&self, result: serde_json::Value) {
        *self.result.lock().unwrap_or_else(PoisonError::into_inner) = Some(result);
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "operation panicked".to_string())
}

impl BuildOperations {
    /// Run `body` as an operation nested under the current context
    ///
    /// The operation is current while `body` runs. `Ok` finishes it as
    /// succeeded; `Err` is turned into a failure context and classified. A
    /// panic finishes the operation as an unexpected failure and then
    /// continues unwinding.
    ///
    /// # Errors
    ///
    /// The body's own error, or an `OperationError` converted into `E` when
    /// the operation cannot be started or finished.
    pub fn run<T, E, F>(&self, descriptor: DescriptorBuilder, body: F) -> Result<T, E>
    where
        F: FnOnce(&mut OperationContext<'_>) -> Result<T, E>,
        E: UserFacingError + From<OperationError>,
    {
        let handle = self.start(descriptor)?;
        let (result, finished) = self.execute(handle, body);
        match (result, finished) {
            (Ok(value), Ok(_)) => Ok(value),
            (Ok(_), Err(err)) => Err(err.into()),
            (Err(err), _) => Err(err),
        }
    }

    /// Run an already started operation's body and finish it
    ///
    /// Returns the body's result and the finish outcome separately; a body
    /// error takes precedence over a failed finish for the caller.
    pub(crate) fn execute<T, E, F>(
        &self,
        handle: OperationHandle,
        body: F,
    ) -> (Result<T, E>, Result<OperationStatus, OperationError>)
    where
        F: FnOnce(&mut OperationContext<'_>) -> Result<T, E>,
        E: UserFacingError,
    {
        let mut ctx = OperationContext::new(self, handle);
        let outcome = CapturedContext::of(handle)
            .run(|| catch_unwind(AssertUnwindSafe(|| body(&mut ctx))));

        match outcome {
            Ok(Ok(value)) => (Ok(value), self.finish_operation(handle, ctx.success())),
            Ok(Err(err)) => {
                let finished = self.finish_operation(handle, Outcome::from_error(&err));
                if let Err(finish_err) = &finished {
                    warn!(operation = %handle.id(), error = %finish_err, "failed operation left unfinished");
                }
                (Err(err), finished)
            }
            Err(payload) => {
                self.finish_panicked(handle, payload.as_ref());
                resume_unwind(payload)
            }
        }
    }

    fn finish_panicked(&self, handle: OperationHandle, payload: &(dyn Any + Send)) {
        let failure = FailureContext::unexpected(panic_message(payload)).with_code("operation.panicked");
        if let Err(err) = self.finish_operation(handle, Outcome::failed(failure)) {
            warn!(operation = %handle.id(), error = %err, "panicked operation left unfinished");
        }
    }

    /// Async counterpart of [`run`](Self::run)
    ///
    /// Every poll of the future produced by `body` runs with the new
    /// operation current, so nested starts attach to it even when the task
    /// moves between worker threads. A result set through the context is
    /// forwarded on success, as with `run`.
    ///
    /// # Errors
    ///
    /// Same as [`run`](Self::run).
    pub async fn run_async<'a, T, E, F, Fut>(
        &'a self,
        descriptor: DescriptorBuilder,
        body: F,
    ) -> Result<T, E>
    where
        F: FnOnce(OperationContext<'a>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: UserFacingError + From<OperationError>,
    {
        let handle = self.start(descriptor)?;
        let ctx = OperationContext::new(self, handle);
        let context = CapturedContext::of(handle);
        let future = context.run(|| body(ctx.clone()));
        let outcome = context
            .instrument(AssertUnwindSafe(future).catch_unwind())
            .await;

        match outcome {
            Ok(Ok(value)) => {
                self.finish_operation(handle, ctx.success())?;
                Ok(value)
            }
            Ok(Err(err)) => {
                if let Err(finish_err) = self.finish_operation(handle, Outcome::from_error(&err)) {
                    warn!(operation = %handle.id(), error = %finish_err, "failed operation left unfinished");
                }
                Err(err)
            }
            Err(payload) => {
                self.finish_panicked(handle, payload.as_ref());
                resume_unwind(payload)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildops_errors::{BuildError, Error};
    use buildops_types::{OperationDescriptor, OperationKind};

    fn task(name: &str) -> DescriptorBuilder {
        OperationDescriptor::builder(OperationKind::Task, name)
    }

    #[test]
    fn ok_body_succeeds_with_result() {
        let operations = BuildOperations::new();
        let mut seen = None;
        let value: Result<u32, Error> = operations.run(task("compile"), |ctx| {
            seen = Some(ctx.handle());
            ctx.progress("halfway")?;
            ctx.set_result(serde_json::json!({ "objects": 4 }));
            Ok(4)
        });
        assert_eq!(value.unwrap(), 4);

        let snapshot = operations.lookup(seen.unwrap().id()).unwrap();
        assert_eq!(snapshot.status(), OperationStatus::Succeeded);
        assert_eq!(snapshot.state.progress_messages, vec!["halfway"]);
        assert_eq!(operations.current_operation(), None);
    }

    #[test]
    fn expected_error_fails_expectedly() {
        let operations = BuildOperations::new();
        let mut seen = None;
        let result: Result<(), Error> = operations.run(task("validate"), |ctx| {
            seen = Some(ctx.handle());
            Err(BuildError::ValidationFailed {
                message: "missing input".into(),
            }
            .into())
        });
        assert!(result.is_err());
        let status = operations.lookup(seen.unwrap().id()).unwrap().status();
        assert_eq!(status, OperationStatus::FailedExpectedly);
    }

    #[test]
    fn nested_runs_attach_to_the_enclosing_operation() {
        let operations = BuildOperations::new();
        let (outer, inner) = operations
            .run(task("outer"), |ctx| {
                let outer = ctx.handle();
                let inner = ctx
                    .operations()
                    .run(task("inner"), |inner| Ok::<_, Error>(inner.handle()))?;
                Ok::<_, Error>((outer, inner))
            })
            .unwrap();
        assert_eq!(inner.parent_id(), Some(outer.id()));
        assert_eq!(operations.children(outer.id()).unwrap(), vec![inner.id()]);
    }

    #[test]
    fn panic_finishes_operation_before_unwinding() {
        let operations = BuildOperations::new();
        let mut seen = None;
        let caught = catch_unwind(AssertUnwindSafe(|| {
            let _: Result<(), Error> = operations.run(task("explode"), |ctx| {
                seen = Some(ctx.handle());
                panic!("kaboom");
            });
        }));
        assert!(caught.is_err());
        let snapshot = operations.lookup(seen.unwrap().id()).unwrap();
        assert_eq!(snapshot.status(), OperationStatus::Failed);
        assert_eq!(operations.current_operation(), None);
    }
}
