// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::io::Write;
use std::sync::{Arc, Mutex, Once};

use tracing::Level;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::Layer;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::is_mutation_testing;

/// Enables logging of test output to the console, at all levels down to TRACE.
///
/// Logging is global state and will last until end of process. Output goes through the test
/// writer, so it is only shown for failing tests.
///
/// Logging is disabled under mutation testing - this becomes a no-op.
///
/// # Panics
///
/// Panics if something other than this function has already installed a global subscriber.
pub fn log_to_console() {
    if is_mutation_testing() {
        return;
    }

    LOGGING_INITIALIZER.call_once(|| {
        let layer = tracing_subscriber::fmt::layer()
            .with_test_writer()
            .with_filter(LevelFilter::from_level(Level::TRACE));

        tracing_subscriber::registry()
            .with(layer)
            .try_init()
            .expect("this can only happen if something else besides testing_aids has configured logging");
    });
}

static LOGGING_INITIALIZER: Once = Once::new();

/// In-memory log capture for asserting on emitted events.
///
/// Use [`subscriber()`][Self::subscriber] with `tracing::subscriber::with_default()` to scope the
/// capture to the current thread.
#[derive(Debug, Clone, Default)]
pub struct LogCapture {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl LogCapture {
    /// Creates an empty capture buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the captured log output as a string.
    ///
    /// # Panics
    ///
    /// Panics if the capture buffer lock is poisoned.
    #[must_use]
    pub fn output(&self) -> String {
        String::from_utf8_lossy(&self.buffer.lock().unwrap()).to_string()
    }

    /// Asserts that the captured log output contains the given string.
    ///
    /// # Panics
    ///
    /// Panics if the captured log output does not contain the expected string.
    pub fn assert_contains(&self, expected: &str) {
        let output = self.output();
        assert!(
            output.contains(expected),
            "log output does not contain '{expected}', got:\n{output}"
        );
    }

    /// Creates a subscriber that writes every event, at every level, to this capture buffer.
    #[must_use]
    pub fn subscriber(&self) -> impl tracing::Subscriber {
        tracing_subscriber::registry().with(
            tracing_subscriber::fmt::layer()
                .with_writer(self.clone())
                .with_ansi(false)
                .with_filter(LevelFilter::TRACE),
        )
    }
}

impl<'a> MakeWriter<'a> for LogCapture {
    type Writer = LogCaptureWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogCaptureWriter {
            buffer: Arc::clone(&self.buffer),
        }
    }
}

/// Writer that appends to a shared buffer.
#[derive(Debug)]
pub struct LogCaptureWriter {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl Write for LogCaptureWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
