// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::rc::Rc;

use crate::{Descriptor, Direction, Notifier, ReadyCallback};

/// A [`Notifier`] that never fires on its own.
///
/// Registrations are recorded and fire only when the test calls [`fire()`][Self::fire] or
/// [`fire_all()`][Self::fire_all]. Clones share the same registrations.
#[derive(Clone, Default)]
pub struct ManualNotifier {
    inner: Rc<RefCell<Inner>>,
}

#[derive(Default)]
struct Inner {
    armed: BTreeMap<(Descriptor, Direction), ReadyCallback>,
    registrations: usize,
    deregistrations: usize,
}

impl ManualNotifier {
    /// Creates a notifier with nothing registered.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A shared handle to this notifier, for handing to streams.
    #[must_use]
    pub fn as_notifier(&self) -> Rc<dyn Notifier> {
        Rc::new(self.clone())
    }

    /// Fires the registration for `descriptor` and `direction`, if any.
    ///
    /// Returns whether a callback was invoked.
    #[cfg_attr(test, mutants::skip)] // This is test logic - pointless to mutate.
    pub fn fire(&self, descriptor: Descriptor, direction: Direction) -> bool {
        let callback = self.inner.borrow_mut().armed.remove(&(descriptor, direction));

        match callback {
            Some(callback) => {
                callback();
                true
            }
            None => false,
        }
    }

    /// Fires every registration that is armed when the call starts, in descriptor order.
    ///
    /// Registrations made by the callbacks themselves wait for the next call. Returns the number
    /// of callbacks invoked.
    #[cfg_attr(test, mutants::skip)] // This is test logic - pointless to mutate.
    pub fn fire_all(&self) -> usize {
        let keys: Vec<_> = self.inner.borrow().armed.keys().copied().collect();

        keys.into_iter()
            .filter(|(descriptor, direction)| self.fire(*descriptor, *direction))
            .count()
    }

    /// Whether a registration for `descriptor` and `direction` is waiting to fire.
    #[must_use]
    pub fn is_armed(&self, descriptor: Descriptor, direction: Direction) -> bool {
        self.inner.borrow().armed.contains_key(&(descriptor, direction))
    }

    /// The number of registrations waiting to fire.
    #[must_use]
    pub fn armed_count(&self) -> usize {
        self.inner.borrow().armed.len()
    }

    /// The number of `register()` calls so far.
    #[must_use]
    pub fn registration_count(&self) -> usize {
        self.inner.borrow().registrations
    }

    /// The number of `deregister()` calls so far, including those for absent registrations.
    #[must_use]
    pub fn deregistration_count(&self) -> usize {
        self.inner.borrow().deregistrations
    }
}

impl Notifier for ManualNotifier {
    fn register(
        &self,
        descriptor: Descriptor,
        direction: Direction,
        callback: ReadyCallback,
    ) -> io::Result<()> {
        let replaced = {
            let mut inner = self.inner.borrow_mut();
            inner.registrations += 1;
            inner.armed.insert((descriptor, direction), callback)
        };

        drop(replaced);
        Ok(())
    }

    fn deregister(&self, descriptor: Descriptor, direction: Direction) {
        let removed = {
            let mut inner = self.inner.borrow_mut();
            inner.deregistrations += 1;
            inner.armed.remove(&(descriptor, direction))
        };

        drop(removed);
    }
}

impl fmt::Debug for ManualNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();

        f.debug_struct("ManualNotifier")
            .field("armed", &inner.armed.keys().collect::<Vec<_>>())
            .field("registrations", &inner.registrations)
            .field("deregistrations", &inner.deregistrations)
            .finish()
    }
}
