//! Per-thread "current operation" carrier
//!
//! The ambient operation never follows execution onto another thread or
//! task by itself. Capture it with [`capture`] before the hand-off and
//! restore it inside the new execution unit with [`CapturedContext::enter`],
//! [`CapturedContext::run`] or [`CapturedContext::instrument`].

use crate::OperationHandle;
use std::cell::Cell;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

thread_local! {
    static CURRENT: Cell<Option<OperationHandle>> = const { Cell::new(None) };
}

/// Operation current on this thread, if any
#[must_use]
pub fn current() -> Option<OperationHandle> {
    CURRENT.with(Cell::get)
}

/// Capture the current operation for restoring elsewhere
#[must_use]
pub fn capture() -> CapturedContext {
    CapturedContext { handle: current() }
}

fn replace(handle: Option<OperationHandle>) -> Option<OperationHandle> {
    CURRENT.with(|cell| cell.replace(handle))
}

/// A context value detached from the thread it was captured on
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CapturedContext {
    handle: Option<OperationHandle>,
}

impl CapturedContext {
    /// Context with `handle` as the current operation
    #[must_use]
    pub fn of(handle: OperationHandle) -> Self {
        Self {
            handle: Some(handle),
        }
    }

    /// Context with no current operation; starts under it become roots
    #[must_use]
    pub fn detached() -> Self {
        Self { handle: None }
    }

    #[must_use]
    pub fn handle(&self) -> Option<OperationHandle> {
        self.handle
    }

    /// Make this context current until the guard drops
    ///
    /// The previous value is restored on drop, including during unwinding.
    #[must_use = "the context is only current while the guard lives"]
    pub fn enter(&self) -> ContextGuard {
        ContextGuard {
            previous: replace(self.handle),
            _not_send: PhantomData,
        }
    }

    /// Run `f` with this context current
    pub fn run<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = self.enter();
        f()
    }

    /// Wrap a future so that every poll runs with this context current
    pub fn instrument<F: Future>(self, future: F) -> Instrumented<F> {
        Instrumented {
            inner: Box::pin(future),
            context: self,
        }
    }
}

/// Restores the previously current operation when dropped
///
/// Tied to the thread that created it.
#[derive(Debug)]
pub struct ContextGuard {
    previous: Option<OperationHandle>,
    _not_send: PhantomData<Rc<()>>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        replace(self.previous);
    }
}

/// Future returned by [`CapturedContext::instrument`]
#[derive(Debug)]
#[must_use = "futures do nothing unless polled"]
pub struct Instrumented<F> {
    inner: Pin<Box<F>>,
    context: CapturedContext,
}

impl<F> Instrumented<F> {
    #[must_use]
    pub fn context(&self) -> CapturedContext {
        self.context
    }
}

impl<F: Future> Future for Instrumented<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let _guard = this.context.enter();
        this.inner.as_mut().poll(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildops_types::OperationId;

    fn handle(raw: u64) -> OperationHandle {
        OperationHandle::new(OperationId::from_raw(raw), None)
    }

    #[test]
    fn guards_nest_and_restore() {
        assert_eq!(current(), None);
        let outer = CapturedContext::of(handle(1)).enter();
        assert_eq!(current(), Some(handle(1)));
        {
            let _inner = CapturedContext::of(handle(2)).enter();
            assert_eq!(current(), Some(handle(2)));
            let _detached = CapturedContext::detached().enter();
            assert_eq!(current(), None);
        }
        assert_eq!(current(), Some(handle(1)));
        drop(outer);
        assert_eq!(current(), None);
    }

    #[test]
    fn restored_after_panic() {
        let result = std::panic::catch_unwind(|| {
            CapturedContext::of(handle(7)).run(|| panic!("boom"));
        });
        assert!(result.is_err());
        assert_eq!(current(), None);
    }

    #[test]
    fn capture_crosses_threads_explicitly() {
        let captured = CapturedContext::of(handle(3)).run(capture);
        let seen = std::thread::spawn(move || {
            let before = current();
            let during = captured.run(current);
            (before, during)
        })
        .join()
        .unwrap();
        assert_eq!(seen, (None, Some(handle(3))));
    }
}
