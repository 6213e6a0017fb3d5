// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;
use std::io;
use std::rc::Rc;

use crate::completion::completion;

/// A raw operating system descriptor (e.g. a socket file descriptor) that readiness is
/// tracked for.
///
/// The value is only used as a registration key. Owning and closing the underlying primitive
/// is the responsibility of the [`Transport`][crate::Transport] that exposes it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Descriptor(i32);

impl Descriptor {
    /// Wraps a raw descriptor value.
    #[must_use]
    pub const fn from_raw(raw: i32) -> Self {
        Self(raw)
    }

    /// The raw descriptor value.
    #[must_use]
    pub const fn as_raw(self) -> i32 {
        self.0
    }
}

impl fmt::Display for Descriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fd:{}", self.0)
    }
}

/// The readiness condition a registration waits for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Direction {
    /// The descriptor has data to read, or the peer has closed its side.
    Readable,

    /// The descriptor can accept more outgoing data.
    Writable,
}

/// Callback invoked by a [`Notifier`] when a registered condition is signaled.
pub type ReadyCallback = Box<dyn FnOnce()>;

/// The readiness notification capability that drives duplex streams.
///
/// A registration is one-shot: the callback fires at most once, after which the registrant must
/// register again to be notified again. At most one registration exists per descriptor and
/// direction; registering again for the same pair replaces the previous callback.
///
/// Callbacks are invoked from the notifier's dispatch loop, never from within
/// [`register()`][Notifier::register] or [`deregister()`][Notifier::deregister], so a callback
/// may freely call back into the notifier.
///
/// # Thread safety
///
/// Notifiers are single-threaded. All registrations and callbacks happen on the thread that
/// drives the notifier.
#[cfg_attr(test, mockall::automock)]
pub trait Notifier {
    /// Requests a single callback once `descriptor` satisfies `direction`.
    ///
    /// # Errors
    ///
    /// Returns an error if the operating system refuses to track the descriptor.
    fn register(
        &self,
        descriptor: Descriptor,
        direction: Direction,
        callback: ReadyCallback,
    ) -> io::Result<()>;

    /// Removes any registration for `descriptor` and `direction`, dropping its callback if it
    /// has not fired yet. Removing a registration that does not exist is a no-op.
    fn deregister(&self, descriptor: Descriptor, direction: Direction);
}

/// Waits once for `descriptor` to satisfy `direction`.
///
/// The registration is removed when the wait completes or the returned future is dropped.
pub(crate) async fn wait_ready(
    notifier: &Rc<dyn Notifier>,
    descriptor: Descriptor,
    direction: Direction,
) -> crate::Result<()> {
    let (completion, handle) = completion::<()>();

    notifier.register(
        descriptor,
        direction,
        Box::new(move || completion.resolve(Ok(()))),
    )?;

    let _guard = RegistrationGuard {
        notifier,
        descriptor,
        direction,
    };

    handle.await
}

struct RegistrationGuard<'a> {
    notifier: &'a Rc<dyn Notifier>,
    descriptor: Descriptor,
    direction: Direction,
}

impl Drop for RegistrationGuard<'_> {
    fn drop(&mut self) {
        self.notifier.deregister(self.descriptor, self.direction);
    }
}
