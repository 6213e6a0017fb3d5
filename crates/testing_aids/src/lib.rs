// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! An unpublished crate containing testing utilities for use within this repo.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::mpsc;
use std::time::Duration;
use std::{env, process, thread};

mod log;
mod loopback;

pub use log::*;
pub use loopback::*;

/// If something (whatever) does not happen in a test within this time, the test will fail.
///
/// We are conservative here and allow much time - this is only to break out of infinite loops
/// (e.g. a reactor waiting on a socket that never becomes ready), not for any situations that
/// are actually expected.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Whether the process runs under `cargo mutants`, which disables timeouts and logging.
#[must_use]
pub fn is_mutation_testing() -> bool {
    env::var("MUTATION_TESTING").as_deref() == Ok("1")
}

/// Executes a function on the current thread and sets up a watchdog timer that terminates the
/// process if the target function does not complete before the test timeout.
///
/// Stream tests are single-threaded (streams and event loops are `!Send`), so the function
/// cannot be moved to a background thread and abandoned. Terminating is the only way out.
///
/// # Panics
///
/// Panics if the test panics.
#[cfg_attr(test, mutants::skip)] // This is test logic - pointless to mutate.
pub fn execute_or_terminate_process<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    if is_mutation_testing() {
        // Timeouts must show up as real "timeout" results under mutation testing.
        return f();
    }

    let (sender, receiver) = mpsc::channel();

    let watchdog = thread::Builder::new()
        .name("test watchdog".to_string())
        .spawn(move || {
            if receiver.recv_timeout(TEST_TIMEOUT) != Ok(()) {
                eprintln!("Test timed out, terminating process.");
                #[expect(
                    clippy::exit,
                    reason = "test harness is intentionally terminating test process that cannot continue execution"
                )]
                // Arbitrary value in portable range (8 bits) to signal "emergency timeout".
                process::exit(112);
            }
        })
        .unwrap();

    let result = catch_unwind(AssertUnwindSafe(f));

    // We signal "done" no matter whether it panics or succeeds, all we care about is timeout.
    sender.send(()).unwrap();
    watchdog.join().unwrap();

    // This will re-raise any panic if one occurred.
    result.unwrap()
}

/// Standard test data generator - `pattern` repeated `times` times, back to back.
#[must_use]
pub fn repeated(pattern: &[u8], times: usize) -> Vec<u8> {
    pattern.repeat(times)
}

/// Standard test data generator - a repeating sequence of bytes from 0 to 255.
pub fn repeating_incrementing_bytes() -> impl Iterator<Item = u8> {
    (0..=u8::MAX).cycle()
}
