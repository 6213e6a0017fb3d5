// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

use crate::{DuplexStream, Result, Transport};

/// Convenience writes over a [`DuplexStream`].
///
/// Every call is one logical write: the returned future completes once all of its bytes have
/// been handed to the transport.
pub struct StreamWriter<'a, T: Transport + 'static> {
    stream: &'a DuplexStream<T>,
}

impl<'a, T: Transport + 'static> StreamWriter<'a, T> {
    /// Creates a writer for `stream`.
    #[must_use]
    pub const fn new(stream: &'a DuplexStream<T>) -> Self {
        Self { stream }
    }

    /// Writes `data`.
    ///
    /// # Errors
    ///
    /// Returns any error of the underlying stream.
    ///
    /// # Panics
    ///
    /// Panics if another write on the same stream is still pending.
    pub async fn write(&self, data: impl Into<Bytes>) -> Result<()> {
        self.stream.write_once(data)?.await
    }

    /// Writes `data` followed by `\n`.
    ///
    /// # Errors
    ///
    /// Returns any error of the underlying stream.
    ///
    /// # Panics
    ///
    /// Panics if another write on the same stream is still pending.
    pub async fn write_line(&self, data: impl AsRef<[u8]>) -> Result<()> {
        let data = data.as_ref();

        let mut line = BytesMut::with_capacity(data.len() + 1);
        line.put_slice(data);
        line.put_u8(b'\n');

        self.write(line.freeze()).await
    }

    /// The stream this writer writes to.
    #[must_use]
    pub const fn stream(&self) -> &'a DuplexStream<T> {
        self.stream
    }
}

impl<T: Transport + 'static> fmt::Debug for StreamWriter<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamWriter").field("stream", self.stream).finish()
    }
}
