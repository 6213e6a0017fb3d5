// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::cell::RefCell;
use std::fmt;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use crate::{Error, Result};

enum Slot<T> {
    Waiting(Option<Waker>),
    Resolved(Result<T>),
    Consumed,
    Canceled,
}

/// Creates a single-slot completion: the producer half is resolved exactly once by the stream,
/// the consumer half is awaited by the caller.
pub(crate) fn completion<T>() -> (Completion<T>, CompletionHandle<T>) {
    let slot = Rc::new(RefCell::new(Slot::Waiting(None)));

    (
        Completion {
            slot: Rc::clone(&slot),
        },
        CompletionHandle { slot },
    )
}

/// The producer half of a single-slot completion.
///
/// Dropping it without resolving it completes the handle with [`Error::StreamClosed`], as the
/// only way this happens is the owning stream going away with the operation still pending.
pub(crate) struct Completion<T> {
    slot: Rc<RefCell<Slot<T>>>,
}

impl<T> Completion<T> {
    /// Whether the caller dropped the handle before the operation was resolved.
    pub(crate) fn is_canceled(&self) -> bool {
        matches!(*self.slot.borrow(), Slot::Canceled)
    }

    /// Stores the result and wakes the waiting caller. A canceled slot silently drops the result.
    pub(crate) fn resolve(self, result: Result<T>) {
        self.store(result);
    }

    fn store(&self, result: Result<T>) {
        let waker = {
            let mut slot = self.slot.borrow_mut();

            match &mut *slot {
                Slot::Waiting(waker) => {
                    let waker = waker.take();
                    *slot = Slot::Resolved(result);
                    waker
                }
                Slot::Canceled | Slot::Resolved(_) | Slot::Consumed => None,
            }
        };

        // Waking happens outside the borrow, the woken task may poll the handle right away.
        if let Some(waker) = waker {
            waker.wake();
        }
    }
}

impl<T> Drop for Completion<T> {
    fn drop(&mut self) {
        self.store(Err(Error::StreamClosed));
    }
}

impl<T> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("canceled", &self.is_canceled())
            .finish()
    }
}

/// The caller-side handle of a pending stream operation.
///
/// The handle is a future that resolves exactly once with the outcome of the operation.
///
/// Dropping the handle before it resolves cancels the operation from the caller's point of
/// view: the stream skips delivering the result and cleans up its readiness registration the
/// next time the descriptor is signaled.
///
/// # Thread safety
///
/// This type is single-threaded, like the stream that produced it.
#[must_use = "stream operations do nothing useful unless the handle is awaited"]
pub struct CompletionHandle<T> {
    slot: Rc<RefCell<Slot<T>>>,
}

impl<T> CompletionHandle<T> {
    /// Whether the operation has been resolved and the result is ready to be taken.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        matches!(*self.slot.borrow(), Slot::Resolved(_))
    }
}

impl<T> Future for CompletionHandle<T> {
    type Output = Result<T>;

    #[expect(clippy::panic, reason = "polling a finished future is a caller bug")]
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut slot = self.slot.borrow_mut();

        match &mut *slot {
            Slot::Waiting(waker) => {
                *waker = Some(cx.waker().clone());
                Poll::Pending
            }
            Slot::Resolved(_) => {
                let Slot::Resolved(result) = std::mem::replace(&mut *slot, Slot::Consumed) else {
                    unreachable!("matched as resolved above");
                };

                Poll::Ready(result)
            }
            Slot::Consumed | Slot::Canceled => {
                panic!("completion handle polled after it already produced its result")
            }
        }
    }
}

impl<T> Drop for CompletionHandle<T> {
    fn drop(&mut self) {
        let mut slot = self.slot.borrow_mut();

        if matches!(*slot, Slot::Waiting(_)) {
            *slot = Slot::Canceled;
        }
    }
}

impl<T> fmt::Debug for CompletionHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionHandle")
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use futures::FutureExt;
    use futures::task::noop_waker;

    use super::*;

    #[test]
    fn resolves_once_with_value() {
        let (completion, handle) = completion::<u32>();

        assert!(!handle.is_resolved());
        completion.resolve(Ok(42));
        assert!(handle.is_resolved());

        assert_eq!(handle.now_or_never().unwrap().unwrap(), 42);
    }

    #[test]
    fn pending_until_resolved() {
        let (completion, mut handle) = completion::<u32>();
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);

        assert!(handle.poll_unpin(&mut cx).is_pending());

        completion.resolve(Ok(7));

        match handle.poll_unpin(&mut cx) {
            Poll::Ready(Ok(value)) => assert_eq!(value, 7),
            other => panic!("unexpected poll result: {other:?}"),
        }
    }

    #[test]
    fn dropped_handle_marks_canceled() {
        let (completion, handle) = completion::<u32>();

        drop(handle);

        assert!(completion.is_canceled());

        // Resolving a canceled slot is a no-op.
        completion.resolve(Ok(1));
    }

    #[test]
    fn dropped_producer_reports_stream_closed() {
        let (completion, handle) = completion::<u32>();

        drop(completion);

        let result = handle.now_or_never().unwrap();
        assert!(matches!(result, Err(Error::StreamClosed)));
    }

    #[test]
    #[should_panic]
    fn poll_after_ready_panics() {
        let (completion, mut handle) = completion::<u32>();
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);

        completion.resolve(Ok(1));

        assert!(handle.poll_unpin(&mut cx).is_ready());
        let _ = handle.poll_unpin(&mut cx);
    }
}
