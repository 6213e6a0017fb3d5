// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::pin::pin;
use std::task::{Context, Poll};

use futures::task::noop_waker;

use super::ManualNotifier;

/// Upper bound on fire rounds, to turn a livelocked script into a test failure.
const MAX_ROUNDS: usize = 10_000;

/// Runs `future` to completion, firing every armed registration of `notifier` whenever the
/// future cannot make progress.
///
/// # Panics
///
/// Panics if the future is pending while nothing is armed, as it would never complete, or if it
/// is still pending after an unreasonable number of rounds.
#[cfg_attr(test, mutants::skip)] // This is test logic - pointless to mutate.
#[expect(clippy::panic, reason = "a stuck future fails the calling test")]
pub fn drive<F: Future>(notifier: &ManualNotifier, future: F) -> F::Output {
    let mut future = pin!(future);
    let waker = noop_waker();
    let mut cx = Context::from_waker(&waker);

    for _ in 0..MAX_ROUNDS {
        if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
            return output;
        }

        assert!(
            notifier.fire_all() > 0,
            "future is pending but nothing is registered for readiness"
        );
    }

    panic!("future did not complete within {MAX_ROUNDS} readiness rounds");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Descriptor, Direction, Notifier};

    #[test]
    fn ready_future_needs_no_readiness() {
        let notifier = ManualNotifier::new();

        assert_eq!(drive(&notifier, async { 3 }), 3);
    }

    #[test]
    #[should_panic]
    fn pending_future_without_registrations_panics() {
        let notifier = ManualNotifier::new();

        drive(&notifier, futures::future::pending::<()>());
    }

    #[test]
    fn fires_registrations_until_ready() {
        let notifier = ManualNotifier::new();
        let shared = notifier.as_notifier();

        let output = drive(&notifier, async {
            crate::notifier::wait_ready(&shared, Descriptor::from_raw(2), Direction::Readable)
                .await
                .unwrap();
            shared.deregister(Descriptor::from_raw(2), Direction::Readable);
            "done"
        });

        assert_eq!(output, "done");
    }
}
