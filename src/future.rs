// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license.

use crate::fail::Fail;

use std::{
    cell::RefCell,
    fmt,
    future::Future,
    pin::Pin,
    rc::Rc,
    task::{Context, Poll, Waker},
};

//==============================================================================
// Constants & Structures
//==============================================================================

/// One-shot completion cell.
///
/// A [Oneshot] starts out pending and finishes exactly once, with either a
/// value or a [Fail]. Cloning the handle gives the producer and the consumer
/// co-ownership of the same cell. The consumer side is the `Future`
/// implementation: the first `poll` attaches the task's waker as the single
/// continuation, and a `poll` against a finished cell returns the result
/// immediately, so completions that land before the consumer attaches are
/// never lost.
///
/// Wake-ups are delivered through the event loop's ready queue, never inline
/// from `set_result`, so completing a cell cannot re-enter user code.
pub struct Oneshot<T> {
    inner: Rc<RefCell<OneshotInner<T>>>,
}

struct OneshotInner<T> {
    result: Option<Result<T, Fail>>,
    waker: Option<Waker>,
    finished: bool,
    taken: bool,
}

//==============================================================================
// Associate Functions
//==============================================================================

/// Associate functions for [Oneshot].
impl<T> Oneshot<T> {
    /// Creates a pending cell.
    pub fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(OneshotInner {
                result: None,
                waker: None,
                finished: false,
                taken: false,
            })),
        }
    }

    /// Finishes the cell with a value. No-op if already finished.
    pub fn set_result(&self, value: T) {
        self.finish(Ok(value));
    }

    /// Finishes the cell with an error. No-op if already finished.
    pub fn set_error(&self, error: Fail) {
        self.finish(Err(error));
    }

    /// Cancels a pending cell with the given error.
    pub fn cancel(&self, error: Fail) {
        self.finish(Err(error));
    }

    /// Cancels a pending cell with [Fail::Cancelled].
    pub fn cancel_default(&self) {
        self.cancel(Fail::Cancelled {});
    }

    /// Returns `true` once the cell has finished.
    pub fn done(&self) -> bool {
        self.inner.borrow().finished
    }

    /// Takes the result out of a finished cell, if present.
    pub fn try_take(&self) -> Option<Result<T, Fail>> {
        let mut inner = self.inner.borrow_mut();
        let result = inner.result.take();
        if result.is_some() {
            inner.taken = true;
        }
        result
    }

    fn finish(&self, result: Result<T, Fail>) {
        let waker = {
            let mut inner = self.inner.borrow_mut();
            if inner.finished {
                return;
            }
            inner.finished = true;
            inner.result = Some(result);
            inner.waker.take()
        };
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

//==============================================================================
// Trait Implementations
//==============================================================================

/// Future trait implementation for [Oneshot].
impl<T> Future for Oneshot<T> {
    type Output = Result<T, Fail>;

    /// Polls the cell: takes the result if finished, else (re)attaches the
    /// task waker as the continuation.
    fn poll(self: Pin<&mut Self>, ctx: &mut Context) -> Poll<Self::Output> {
        let mut inner = self.inner.borrow_mut();
        if let Some(result) = inner.result.take() {
            inner.taken = true;
            return Poll::Ready(result);
        }
        if inner.taken {
            panic!("polled after completion");
        }
        inner.waker = Some(ctx.waker().clone());
        Poll::Pending
    }
}

/// Clone trait implementation for [Oneshot].
impl<T> Clone for Oneshot<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// Debug trait implementation for [Oneshot].
impl<T> fmt::Debug for Oneshot<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let inner = self.inner.borrow();
        write!(f, "Oneshot(finished={}, taken={})", inner.finished, inner.taken)
    }
}

/// Drop trait implementation for the shared cell state: an error that was
/// never observed by any consumer is reported to the diagnostic sink instead
/// of vanishing with a fire-and-forget coroutine.
impl<T> Drop for OneshotInner<T> {
    fn drop(&mut self) {
        if let Some(Err(e)) = self.result.take() {
            warn!("unobserved failure in dropped future: {}", e);
        }
    }
}

//==============================================================================
// Unit Tests
//==============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use futures::task::noop_waker;

    fn poll_once<T>(fut: &mut Oneshot<T>) -> Poll<Result<T, Fail>> {
        let waker = noop_waker();
        let mut ctx = Context::from_waker(&waker);
        Pin::new(fut).poll(&mut ctx)
    }

    /// Tests that a completion before the first poll is delivered at poll time.
    #[test]
    fn complete_before_poll() {
        let mut fut: Oneshot<u32> = Oneshot::new();
        fut.set_result(99);
        assert!(fut.done());
        assert_eq!(poll_once(&mut fut), Poll::Ready(Ok(99)));
    }

    /// Tests that polling first, then completing, finishes the cell.
    #[test]
    fn complete_after_poll() {
        let mut fut: Oneshot<u32> = Oneshot::new();
        assert_eq!(poll_once(&mut fut), Poll::Pending);
        assert!(!fut.done());
        fut.set_result(7);
        assert_eq!(poll_once(&mut fut), Poll::Ready(Ok(7)));
    }

    /// Tests that completion is monotonic: later results are discarded.
    #[test]
    fn double_completion_is_noop() {
        let fut: Oneshot<u32> = Oneshot::new();
        fut.set_result(1);
        fut.set_result(2);
        fut.set_error(Fail::Timeout {});
        assert_eq!(fut.try_take(), Some(Ok(1)));
    }

    /// Tests cancellation of a pending cell.
    #[test]
    fn cancel_pending() {
        let fut: Oneshot<u32> = Oneshot::new();
        fut.cancel_default();
        assert_eq!(fut.try_take(), Some(Err(Fail::Cancelled {})));
    }

    /// Tests that cancelling a finished cell does not clobber its value.
    #[test]
    fn cancel_finished_is_noop() {
        let fut: Oneshot<u32> = Oneshot::new();
        fut.set_result(5);
        fut.cancel_default();
        assert_eq!(fut.try_take(), Some(Ok(5)));
    }

    /// Tests that producer and consumer handles share one cell.
    #[test]
    fn clone_shares_state() {
        let consumer: Oneshot<&'static str> = Oneshot::new();
        let producer = consumer.clone();
        producer.set_result("done");
        assert!(consumer.done());
        assert_eq!(consumer.try_take(), Some(Ok("done")));
        assert_eq!(producer.try_take(), None);
    }

    /// Tests that polling a consumed cell panics.
    #[test]
    #[should_panic(expected = "polled after completion")]
    fn poll_after_take_panics() {
        let mut fut: Oneshot<u32> = Oneshot::new();
        fut.set_result(1);
        assert_eq!(poll_once(&mut fut), Poll::Ready(Ok(1)));
        let _ = poll_once(&mut fut);
    }
}
