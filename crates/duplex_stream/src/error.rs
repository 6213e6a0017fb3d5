// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::io::ErrorKind;

use thiserror::Error;

/// Any error that may arise from duplex stream operations or from the buffered framing
/// logic built on top of them.
///
/// End of stream is not an error. It is reported as [`ReadOutcome::EndOfStream`][1] by
/// [`DuplexStream::read_once()`][2] and as an empty byte sequence by the buffered reader.
///
/// Would-block conditions reported by the operating system never surface as errors. They
/// cause the stream to re-arm its readiness registration and keep waiting.
///
/// [1]: crate::ReadOutcome::EndOfStream
/// [2]: crate::DuplexStream::read_once
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The operation was attempted on a stream whose descriptor has already been closed.
    #[error("stream is closed")]
    StreamClosed,

    /// The operating system reported a failure while reading from or writing to the stream.
    ///
    /// The stream is left in a failed state and the operation is not retried.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The receive buffer of a buffered reader would have grown beyond its configured maximum.
    ///
    /// This is terminal for the reader. All further reads fail with the same error.
    #[error("receive buffer overrun: {len} bytes exceeds the maximum of {max} bytes")]
    BufferOverrun {
        /// The buffer length that the rejected fill would have produced.
        len: usize,

        /// The configured maximum buffer length.
        max: usize,
    },

    /// An argument was rejected before any I/O was attempted.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}

/// A specialized `Result` for use with duplex stream operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Represents the error as a standard I/O error, for interoperating with code that expects them.
impl From<Error> for std::io::Error {
    fn from(value: Error) -> Self {
        match value {
            Error::Io(error) => error,
            Error::StreamClosed => Self::new(ErrorKind::NotConnected, value),
            Error::BufferOverrun { .. } => Self::new(ErrorKind::OutOfMemory, value),
            Error::InvalidArgument(_) => Self::new(ErrorKind::InvalidInput, value),
        }
    }
}
