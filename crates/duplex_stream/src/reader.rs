// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt;

use bytes::{Bytes, BytesMut};
use memchr::memmem;
use tracing::{Level, event};

use crate::{DuplexStream, Error, ReadOutcome, ReaderOptions, Result, Transport};

/// Framing reads over a [`DuplexStream`]: exact-size reads, separator-terminated reads and
/// read-to-end.
///
/// The reader owns a receive buffer and only pulls from the stream when the buffer cannot
/// satisfy a request. Each pull is a single [`read_once()`][DuplexStream::read_once] of
/// [`ReaderOptions::chunk_size()`] bytes.
///
/// The buffer is bounded by [`ReaderOptions::max_buffer_size()`]. A pull that would grow it
/// past that size fails with [`Error::BufferOverrun`] and the reader stays failed: every later
/// read reports the same error. No data is ever silently dropped to stay within the bound.
///
/// End of stream is sticky. Once observed, the reader never touches the stream again and
/// serves only what is left in the buffer.
///
/// # Example
///
/// ```no_run
/// # async fn example(stream: duplex_stream::SocketStream) -> duplex_stream::Result<()> {
/// use duplex_stream::BufferedReader;
///
/// let mut reader = BufferedReader::new(&stream);
///
/// let status_line = reader.read_until(b"\r\n").await?;
/// let body = reader.read_until_eof().await?;
/// # Ok(())
/// # }
/// ```
pub struct BufferedReader<'a, T: Transport + 'static> {
    stream: &'a DuplexStream<T>,
    buffer: BytesMut,
    options: ReaderOptions,
    eof: bool,

    // Length the rejected fill would have produced, once the bound has been exceeded.
    overrun: Option<usize>,
}

impl<'a, T: Transport + 'static> BufferedReader<'a, T> {
    /// Creates a reader with the default [`ReaderOptions`].
    #[must_use]
    pub fn new(stream: &'a DuplexStream<T>) -> Self {
        Self {
            stream,
            buffer: BytesMut::new(),
            options: ReaderOptions::default(),
            eof: false,
            overrun: None,
        }
    }

    /// Creates a reader with custom buffer sizing.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if either size is zero.
    pub fn with_options(stream: &'a DuplexStream<T>, options: ReaderOptions) -> Result<Self> {
        if options.max_buffer_size() == 0 {
            return Err(Error::InvalidArgument("maximum buffer size must be greater than zero"));
        }

        if options.chunk_size() == 0 {
            return Err(Error::InvalidArgument("chunk size must be greater than zero"));
        }

        Ok(Self {
            options,
            ..Self::new(stream)
        })
    }

    /// Reads at most `n` bytes.
    ///
    /// Unless the stream has ended and nothing is buffered, at least one byte is returned. If
    /// the buffer holds fewer than `n` bytes, exactly one chunk is pulled from the stream first,
    /// so the result may be shorter than `n` even before end of stream.
    ///
    /// `read(0)` returns an empty sequence without touching the stream.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BufferOverrun`] if the pulled chunk does not fit the buffer, or any
    /// error of the underlying stream.
    pub async fn read(&mut self, n: usize) -> Result<Bytes> {
        if n == 0 {
            return Ok(Bytes::new());
        }

        self.check_overrun()?;

        if self.buffer.len() < n {
            self.fill().await?;
        }

        let len = n.min(self.buffer.len());

        Ok(self.buffer.split_to(len).freeze())
    }

    /// Reads up to and including the first occurrence of `separator`.
    ///
    /// Returns an empty sequence if the stream ends before the separator shows up. The bytes
    /// received so far stay buffered and can still be read with [`read()`][Self::read].
    ///
    /// Each buffered byte is scanned once, no matter how many chunks it takes for the separator
    /// to arrive.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if `separator` is empty, [`Error::BufferOverrun`] if
    /// the buffer fills up before the separator shows up, or any error of the underlying stream.
    pub async fn read_until(&mut self, separator: &[u8]) -> Result<Bytes> {
        if separator.is_empty() {
            return Err(Error::InvalidArgument("separator must not be empty"));
        }

        self.check_overrun()?;

        let finder = memmem::Finder::new(separator);

        // Everything before this offset is known not to start a match.
        let mut offset = 0;

        loop {
            let buffered = self.buffer.len();

            if buffered - offset >= separator.len() {
                if let Some(position) = finder.find(&self.buffer[offset..]) {
                    let end = offset + position + separator.len();
                    return Ok(self.buffer.split_to(end).freeze());
                }

                offset = buffered + 1 - separator.len();
            }

            if self.eof {
                return Ok(Bytes::new());
            }

            self.fill().await?;
        }
    }

    /// Reads one `\n`-terminated line, including the terminator.
    ///
    /// # Errors
    ///
    /// Same as [`read_until()`][Self::read_until].
    pub async fn read_line(&mut self) -> Result<Bytes> {
        self.read_until(b"\n").await
    }

    /// Reads everything until the stream ends.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BufferOverrun`] if a pulled chunk does not fit the buffer, or any error
    /// of the underlying stream. Bytes read before the error are lost.
    pub async fn read_until_eof(&mut self) -> Result<Bytes> {
        let mut collected = BytesMut::new();

        loop {
            let chunk = self.read(self.options.chunk_size()).await?;

            if chunk.is_empty() {
                return Ok(collected.freeze());
            }

            collected.extend_from_slice(&chunk);
        }
    }

    /// The bytes received but not consumed yet.
    #[must_use]
    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    /// Whether end of stream has been observed.
    #[must_use]
    pub const fn is_eof(&self) -> bool {
        self.eof
    }

    /// The sizing this reader was created with.
    #[must_use]
    pub const fn options(&self) -> ReaderOptions {
        self.options
    }

    /// The stream this reader pulls from.
    #[must_use]
    pub const fn stream(&self) -> &'a DuplexStream<T> {
        self.stream
    }

    /// Pulls one chunk from the stream into the buffer and returns its length, 0 at end of
    /// stream.
    ///
    /// The pull never asks for more than one byte beyond the room left under the bound, so an
    /// oversized chunk size cannot cause an oversized allocation.
    async fn fill(&mut self) -> Result<usize> {
        self.check_overrun()?;

        if self.eof {
            return Ok(0);
        }

        let max = self.options.max_buffer_size();

        // One byte past the remaining room is enough to detect an overrun.
        let room = max.saturating_sub(self.buffer.len()).saturating_add(1);
        let request = self.options.chunk_size().min(room);

        match self.stream.read_once(request)?.await? {
            ReadOutcome::EndOfStream => {
                self.eof = true;
                Ok(0)
            }
            ReadOutcome::Data(data) => {
                let len = self.buffer.len() + data.len();

                if len > max {
                    event!(Level::DEBUG, message = "receive buffer overrun", len, max);

                    self.overrun = Some(len);
                    return Err(Error::BufferOverrun { len, max });
                }

                self.buffer.extend_from_slice(&data);
                Ok(data.len())
            }
        }
    }

    fn check_overrun(&self) -> Result<()> {
        match self.overrun {
            Some(len) => Err(Error::BufferOverrun {
                len,
                max: self.options.max_buffer_size(),
            }),
            None => Ok(()),
        }
    }
}

impl<T: Transport + 'static> fmt::Debug for BufferedReader<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferedReader")
            .field("stream", self.stream)
            .field("buffered", &self.buffer.len())
            .field("options", &self.options)
            .field("eof", &self.eof)
            .field("overrun", &self.overrun)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeTransport, ManualNotifier, drive};
    use crate::{Descriptor, StreamOptions};

    const FD: Descriptor = Descriptor::from_raw(5);

    fn stream_with_reads(
        chunks: &[&[u8]],
        notifier: &ManualNotifier,
    ) -> (DuplexStream<FakeTransport>, crate::testing::FakeTransportHandle) {
        let mut builder = FakeTransport::builder().descriptor(FD);
        for chunk in chunks {
            builder = builder.read(chunk);
        }

        let (transport, handle) = builder.build();

        (
            DuplexStream::with_options(
                transport,
                notifier.as_notifier(),
                StreamOptions::new().with_close_on_eof(false),
            ),
            handle,
        )
    }

    #[test]
    fn read_zero_does_no_io() {
        let notifier = ManualNotifier::new();
        let (stream, handle) = stream_with_reads(&[b"abc"], &notifier);
        let mut reader = BufferedReader::new(&stream);

        let bytes = drive(&notifier, reader.read(0)).unwrap();

        assert!(bytes.is_empty());
        assert_eq!(handle.read_calls(), 0);
        assert_eq!(notifier.registration_count(), 0);
    }

    #[test]
    fn read_returns_between_one_and_n_bytes() {
        let notifier = ManualNotifier::new();
        let (stream, _handle) = stream_with_reads(&[b"ab", b"cdefgh"], &notifier);
        let mut reader = BufferedReader::new(&stream);

        // One fill only, even though more is on the way.
        assert_eq!(drive(&notifier, reader.read(4)).unwrap(), "ab");

        assert_eq!(drive(&notifier, reader.read(4)).unwrap(), "cdef");
        assert_eq!(reader.buffered(), b"gh");

        // Served from the buffer without a fill.
        assert_eq!(drive(&notifier, reader.read(1)).unwrap(), "g");
        assert_eq!(drive(&notifier, reader.read(8)).unwrap(), "h");

        assert!(drive(&notifier, reader.read(8)).unwrap().is_empty());
        assert!(reader.is_eof());
    }

    #[test]
    fn eof_is_sticky() {
        let notifier = ManualNotifier::new();
        let (stream, handle) = stream_with_reads(&[], &notifier);
        let mut reader = BufferedReader::new(&stream);

        assert!(drive(&notifier, reader.read(4)).unwrap().is_empty());
        assert!(drive(&notifier, reader.read(4)).unwrap().is_empty());
        assert!(drive(&notifier, reader.read_line()).unwrap().is_empty());

        assert_eq!(handle.read_calls(), 1);
    }

    #[test]
    fn read_until_eof_matches_draining_reads() {
        let chunks: [&[u8]; 4] = [b"lorem ", b"ipsum ", b"dolor ", b"sit amet"];

        let notifier = ManualNotifier::new();
        let (stream, _handle) = stream_with_reads(&chunks, &notifier);
        let mut reader = BufferedReader::new(&stream);
        let all = drive(&notifier, reader.read_until_eof()).unwrap();

        let notifier = ManualNotifier::new();
        let (stream, _handle) = stream_with_reads(&chunks, &notifier);
        let mut reader = BufferedReader::new(&stream);
        let mut drained = Vec::new();
        loop {
            let bytes = drive(&notifier, reader.read(all.len())).unwrap();
            if bytes.is_empty() {
                break;
            }
            drained.extend_from_slice(&bytes);
        }

        assert_eq!(all, "lorem ipsum dolor sit amet");
        assert_eq!(drained, all);
    }

    #[test]
    fn read_until_finds_separator_split_across_chunks() {
        let notifier = ManualNotifier::new();
        let (stream, handle) = stream_with_reads(&[b"GET / HTTP/1.1\r", b"\nHost: x\r\n"], &notifier);
        let mut reader = BufferedReader::new(&stream);

        let line = drive(&notifier, reader.read_until(b"\r\n")).unwrap();
        assert_eq!(line, "GET / HTTP/1.1\r\n");
        assert_eq!(handle.read_calls(), 2);

        // Already buffered, no further fill.
        let line = drive(&notifier, reader.read_until(b"\r\n")).unwrap();
        assert_eq!(line, "Host: x\r\n");
        assert_eq!(handle.read_calls(), 2);
    }

    #[test]
    fn read_until_single_byte_chunks() {
        let chunks: Vec<&[u8]> = b"abXYZcd".chunks(1).collect();

        let notifier = ManualNotifier::new();
        let (stream, _handle) = stream_with_reads(&chunks, &notifier);
        let mut reader = BufferedReader::new(&stream);

        assert_eq!(drive(&notifier, reader.read_until(b"XYZ")).unwrap(), "abXYZ");
        assert_eq!(drive(&notifier, reader.read(8)).unwrap(), "c");
    }

    #[test]
    fn read_until_without_match_returns_empty_at_eof() {
        let notifier = ManualNotifier::new();
        let (stream, _handle) = stream_with_reads(&[b"no separator ", b"here"], &notifier);
        let mut reader = BufferedReader::new(&stream);

        let result = drive(&notifier, reader.read_until(b"\n")).unwrap();

        assert!(result.is_empty());
        assert!(reader.is_eof());
        assert_eq!(reader.buffered(), b"no separator here");
    }

    #[test]
    fn empty_separator_is_rejected_before_io() {
        let notifier = ManualNotifier::new();
        let (stream, handle) = stream_with_reads(&[b"abc"], &notifier);
        let mut reader = BufferedReader::new(&stream);

        let result = drive(&notifier, reader.read_until(b""));

        assert!(matches!(result, Err(Error::InvalidArgument(_))));
        assert_eq!(handle.read_calls(), 0);
    }

    #[test]
    fn overrun_is_terminal() {
        let chunk = [b'x'; 200];

        let notifier = ManualNotifier::new();
        let (stream, _handle) = stream_with_reads(&[&chunk[..], &chunk[..], &chunk[..], &b"\n"[..]], &notifier);
        let mut reader =
            BufferedReader::with_options(&stream, ReaderOptions::new().with_max_buffer_size(512)).unwrap();

        let result = drive(&notifier, reader.read_until(b"\n"));
        assert!(matches!(result, Err(Error::BufferOverrun { len: 513, max: 512 })));

        // Data received before the violating chunk is intact.
        assert_eq!(reader.buffered().len(), 400);

        let result = drive(&notifier, reader.read(1));
        assert!(matches!(result, Err(Error::BufferOverrun { .. })));

        let result = drive(&notifier, reader.read_until(b"\n"));
        assert!(matches!(result, Err(Error::BufferOverrun { .. })));
    }

    #[test]
    fn read_until_eof_overruns_on_oversized_chunk() {
        let chunk = [b'x'; 600];

        let notifier = ManualNotifier::new();
        let (stream, _handle) = stream_with_reads(&[&chunk[..]], &notifier);
        let mut reader =
            BufferedReader::with_options(&stream, ReaderOptions::new().with_max_buffer_size(512)).unwrap();

        let result = drive(&notifier, reader.read_until_eof());
        assert!(matches!(result, Err(Error::BufferOverrun { len: 513, max: 512 })));

        let result = drive(&notifier, reader.read_until_eof());
        assert!(matches!(result, Err(Error::BufferOverrun { .. })));
    }

    #[test]
    fn read_until_eof_within_bound_consumes_as_it_goes() {
        let chunk = [b'x'; 200];

        let notifier = ManualNotifier::new();
        let (stream, _handle) = stream_with_reads(&[&chunk[..], &chunk[..], &chunk[..]], &notifier);
        let mut reader =
            BufferedReader::with_options(&stream, ReaderOptions::new().with_max_buffer_size(512)).unwrap();

        let all = drive(&notifier, reader.read_until_eof()).unwrap();

        assert_eq!(all.len(), 600);
    }

    #[test]
    fn huge_chunk_size_is_capped_by_buffer_bound() {
        let notifier = ManualNotifier::new();
        let (stream, _handle) = stream_with_reads(&[b"abc"], &notifier);
        let mut reader =
            BufferedReader::with_options(&stream, ReaderOptions::new().with_chunk_size(usize::MAX / 2)).unwrap();

        assert_eq!(drive(&notifier, reader.read(3)).unwrap(), "abc");
        assert!(drive(&notifier, reader.read_until_eof()).unwrap().is_empty());
    }

    #[test]
    fn fill_requests_at_most_one_byte_past_the_bound() {
        let notifier = ManualNotifier::new();
        let (stream, _handle) = stream_with_reads(&[b"0123", b"456789"], &notifier);
        let options = ReaderOptions::new()
            .with_max_buffer_size(8)
            .with_chunk_size(usize::MAX);
        let mut reader = BufferedReader::with_options(&stream, options).unwrap();

        assert!(drive(&notifier, reader.read_until(b"\n")).is_err());

        // 4 buffered, so the second pull asked for 5 bytes only.
        assert_eq!(reader.buffered(), b"0123");
        assert!(matches!(
            drive(&notifier, reader.read(1)),
            Err(Error::BufferOverrun { len: 9, max: 8 })
        ));
    }

    #[test]
    fn zero_sizes_are_rejected() {
        let notifier = ManualNotifier::new();
        let (stream, _handle) = stream_with_reads(&[], &notifier);

        let result = BufferedReader::with_options(&stream, ReaderOptions::new().with_chunk_size(0));
        assert!(matches!(result, Err(Error::InvalidArgument(_))));

        let result = BufferedReader::with_options(&stream, ReaderOptions::new().with_max_buffer_size(0));
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn fills_request_chunk_size() {
        let notifier = ManualNotifier::new();
        let (stream, _handle) = stream_with_reads(&[b"0123456789"], &notifier);
        let mut reader = BufferedReader::with_options(&stream, ReaderOptions::new().with_chunk_size(3)).unwrap();

        assert_eq!(drive(&notifier, reader.read(10)).unwrap(), "012");
        assert_eq!(drive(&notifier, reader.read_until_eof()).unwrap(), "3456789");
    }

    #[test]
    fn stream_errors_propagate() {
        let notifier = ManualNotifier::new();
        let (transport, _handle) = FakeTransport::builder()
            .descriptor(FD)
            .read(b"ab")
            .read_error(std::io::ErrorKind::ConnectionReset)
            .build();
        let stream = DuplexStream::new(transport, notifier.as_notifier());
        let mut reader = BufferedReader::new(&stream);

        let result = drive(&notifier, reader.read_line());

        assert!(matches!(result, Err(Error::Io(_))));
        assert_eq!(reader.buffered(), b"ab");
    }
}
